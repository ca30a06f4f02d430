use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::FrameSource;
use crate::types::Frame;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Replays still images from a directory as if they were camera frames.
pub struct ImageReplay {
    frames: Vec<(PathBuf, Frame)>,
    position: usize,
    loops_left: Option<usize>,
}

impl ImageReplay {
    /// `loops: None` replays forever.
    pub fn open(dir: &Path, loops: Option<usize>) -> Result<Self> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read image directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| is_image(path))
            .collect();
        paths.sort();

        let frames = paths
            .into_iter()
            .map(|path| {
                let frame = decode(&path)?;
                Ok((path, frame))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_frames(frames, loops)
            .with_context(|| format!("no png or jpeg images in {}", dir.display()))
    }

    pub fn from_frames(frames: Vec<(PathBuf, Frame)>, loops: Option<usize>) -> Result<Self> {
        if frames.is_empty() {
            return Err(anyhow!("replay needs at least one frame"));
        }
        log::info!("replaying {} image(s)", frames.len());
        Ok(Self {
            frames,
            position: 0,
            loops_left: loops,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FrameSource for ImageReplay {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.position == self.frames.len() {
            match self.loops_left.as_mut() {
                Some(0 | 1) => return Ok(None),
                Some(left) => *left -= 1,
                None => {}
            }
            self.position = 0;
        }

        let (path, frame) = &self.frames[self.position];
        self.position += 1;
        log::trace!("replaying {}", path.display());
        Ok(Some(Frame::new(frame.rgba.clone(), frame.width, frame.height)))
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

fn decode(path: &Path) -> Result<Frame> {
    let image = image::open(path)
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_rgba8();
    let (width, height) = image.dimensions();
    Ok(Frame::new(image.into_raw(), width, height))
}
