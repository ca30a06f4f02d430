use std::{
    collections::BTreeSet,
    fmt,
    panic::{self, AssertUnwindSafe},
    str::FromStr,
    time::Instant,
};

use serde::Deserialize;

use crate::error::DetectError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Hand,
    Face,
    Pose,
    #[serde(rename = "hair")]
    HairSegment,
}

impl ModelType {
    pub const ALL: [ModelType; 4] = [
        ModelType::Hand,
        ModelType::Face,
        ModelType::Pose,
        ModelType::HairSegment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Hand => "hand",
            ModelType::Face => "face",
            ModelType::Pose => "pose",
            ModelType::HairSegment => "hair",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        ModelType::ALL
            .into_iter()
            .find(|model| model.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| DetectError::UnknownModel(needle.to_string()))
    }
}

/// Parses a comma separated list such as `"hand,face"`.
pub fn parse_model_list(list: &str) -> Result<BTreeSet<ModelType>, DetectError> {
    list.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// Borrowed RGBA pixels of a captured image.
#[derive(Clone, Copy, Debug)]
pub struct ImageView<'a> {
    pub rgba: &'a [u8],
    pub width: u32,
    pub height: u32,
}

impl ImageView<'_> {
    pub fn expected_len(&self) -> usize {
        (self.width as usize)
            .saturating_mul(self.height as usize)
            .saturating_mul(4)
    }
}

/// An image owned by whoever currently holds the [`FrameBuffer`] wrapping it.
pub trait ImageHandle: Send + 'static {
    fn view(&self) -> ImageView<'_>;

    /// Releases the underlying resource. Invoked exactly once, when the
    /// owning frame buffer is retired.
    fn close(&mut self) {}
}

/// Pixels captured from a camera or decoded from disk.
#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(rgba: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            rgba,
            width,
            height,
            captured_at: Instant::now(),
        }
    }
}

impl ImageHandle for Frame {
    fn view(&self) -> ImageView<'_> {
        ImageView {
            rgba: &self.rgba,
            width: self.width,
            height: self.height,
        }
    }

    fn close(&mut self) {
        self.rgba = Vec::new();
    }
}

/// Single-owner handle to one captured image plus its capture timestamp.
///
/// The buffer is neither `Clone` nor `Copy`: moving it into a queue or a
/// job transfers ownership, and whichever component holds it last releases
/// the image when the buffer is dropped. `release` only makes that explicit
/// at call sites.
pub struct FrameBuffer {
    image: Box<dyn ImageHandle>,
    timestamp_ms: f64,
    requested: BTreeSet<ModelType>,
}

impl FrameBuffer {
    pub fn new(
        image: impl ImageHandle,
        timestamp_ms: f64,
        requested: impl IntoIterator<Item = ModelType>,
    ) -> Self {
        Self {
            image: Box::new(image),
            timestamp_ms,
            requested: requested.into_iter().collect(),
        }
    }

    pub fn timestamp_ms(&self) -> f64 {
        self.timestamp_ms
    }

    /// Model types this frame should be run through. Empty means every
    /// model the receiving worker serves.
    pub fn requested_models(&self) -> &BTreeSet<ModelType> {
        &self.requested
    }

    pub fn view(&self) -> ImageView<'_> {
        self.image.view()
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for FrameBuffer {
    // Runs during unwinding too, where a second panic would abort.
    fn drop(&mut self) {
        let image = &mut self.image;
        if panic::catch_unwind(AssertUnwindSafe(|| image.close())).is_err() {
            log::error!("closing frame at {:.1}ms panicked", self.timestamp_ms);
        }
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let view = self.image.view();
        f.debug_struct("FrameBuffer")
            .field("timestamp_ms", &self.timestamp_ms)
            .field("width", &view.width)
            .field("height", &view.height)
            .field("requested", &self.requested)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handedness {
    Left,
    Right,
    Unknown,
}

impl Handedness {
    pub fn from_score(score: f32) -> Self {
        if !score.is_finite() {
            Handedness::Unknown
        } else if score >= 0.5 {
            Handedness::Right
        } else {
            Handedness::Left
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Handedness::Left => "left",
            Handedness::Right => "right",
            Handedness::Unknown => "unknown",
        }
    }
}

/// A landmark in source image pixel coordinates; `z` is model relative depth.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LandmarkSet {
    pub landmarks: Vec<Landmark>,
    pub score: f32,
    pub handedness: Option<Handedness>,
}

/// Per-pixel category labels at source image resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct CategoryMask {
    pub width: u32,
    pub height: u32,
    pub categories: Vec<u8>,
}

impl CategoryMask {
    pub fn coverage(&self, category: u8) -> f32 {
        if self.categories.is_empty() {
            return 0.0;
        }
        let hits = self.categories.iter().filter(|&&c| c == category).count();
        hits as f32 / self.categories.len() as f32
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ModelOutput {
    /// Hands, faces or poses. Empty when nothing was detected.
    Landmarks(Vec<LandmarkSet>),
    Segmentation(CategoryMask),
}

impl ModelOutput {
    pub fn is_empty(&self) -> bool {
        match self {
            ModelOutput::Landmarks(sets) => sets.is_empty(),
            ModelOutput::Segmentation(mask) => mask.categories.is_empty(),
        }
    }
}

/// Outcome of running one model on one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionResult {
    pub model: ModelType,
    pub timestamp_ms: f64,
    pub outcome: Result<ModelOutput, DetectError>,
}

impl DetectionResult {
    pub fn payload(&self) -> Option<&ModelOutput> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&DetectError> {
        self.outcome.as_ref().err()
    }
}
