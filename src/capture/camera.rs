use anyhow::{Context, Result, anyhow};
use nokhwa::{
    Camera,
    pixel_format::{RgbAFormat, RgbFormat},
    query,
    utils::{ApiBackend, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
};

use super::FrameSource;
use crate::types::Frame;

// Uncompressed formats first; MJPEG costs a decode per frame.
const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
    FrameFormat::RAWRGB,
    FrameFormat::YUYV,
    FrameFormat::NV12,
    FrameFormat::MJPEG,
];

fn requested_formats() -> [RequestedFormat<'static>; 3] {
    [
        RequestedFormat::with_formats(
            RequestedFormatType::AbsoluteHighestFrameRate,
            PREFERRED_PIXEL_FORMATS,
        ),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
    ]
}

#[derive(Clone, Debug)]
pub struct CameraDevice {
    pub index: CameraIndex,
    pub label: String,
}

pub fn available_cameras() -> Result<Vec<CameraDevice>> {
    let cameras = query(ApiBackend::Auto)?;
    Ok(cameras
        .into_iter()
        .map(|info| CameraDevice {
            index: info.index().clone(),
            label: info.human_name(),
        })
        .collect())
}

/// Webcam frames, decoded to RGBA by nokhwa.
pub struct WebcamSource {
    camera: Camera,
}

impl WebcamSource {
    pub fn open(index: CameraIndex) -> Result<Self> {
        let mut last_err = None;
        for requested in requested_formats() {
            match Camera::new(index.clone(), requested) {
                Ok(mut camera) => match camera.open_stream() {
                    Ok(()) => {
                        log::info!(
                            "camera {} streaming {}",
                            camera.info().human_name(),
                            camera.camera_format()
                        );
                        return Ok(Self { camera });
                    }
                    Err(err) => last_err = Some(err.into()),
                },
                Err(err) => last_err = Some(err.into()),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("failed to open camera with any supported format")))
    }

    pub fn open_default() -> Result<Self> {
        Self::open(CameraIndex::Index(0))
    }
}

impl FrameSource for WebcamSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let buffer = self.camera.frame().context("camera frame read failed")?;
        let image = buffer
            .decode_image::<RgbAFormat>()
            .context("failed to decode camera frame")?;
        let (width, height) = (image.width(), image.height());
        Ok(Some(Frame::new(image.into_raw(), width, height)))
    }
}

impl Drop for WebcamSource {
    fn drop(&mut self) {
        if let Err(err) = self.camera.stop_stream() {
            log::warn!("failed to stop camera stream: {err}");
        }
    }
}
