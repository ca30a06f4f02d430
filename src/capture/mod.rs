//! Frame producers and the cadence at which their frames reach workers.

#[cfg(feature = "camera-nokhwa")]
pub mod camera;
pub mod replay;
pub mod scheduler;

use std::fmt;

use anyhow::Result;
use serde::Deserialize;

use crate::types::{Frame, ModelType};

pub use replay::ImageReplay;
pub use scheduler::{CaptureScheduler, Dispatch};

/// Something that yields captured frames.
pub trait FrameSource {
    /// `Ok(None)` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Screen of the consuming application; decides which models are needed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum View {
    Home,
    PersonalColor,
    PersonalBodyType,
    HairColor,
    #[default]
    PersonalMakeup,
    CosmeticSurgery,
}

impl View {
    pub fn required_models(&self) -> &'static [ModelType] {
        match self {
            View::Home => &[ModelType::Hand],
            View::HairColor => &[ModelType::Hand, ModelType::HairSegment],
            View::PersonalColor
            | View::PersonalBodyType
            | View::PersonalMakeup
            | View::CosmeticSurgery => &[ModelType::Hand, ModelType::Face],
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            View::Home => "home",
            View::PersonalColor => "personal_color",
            View::PersonalBodyType => "personal_body_type",
            View::HairColor => "hair_color",
            View::PersonalMakeup => "personal_makeup",
            View::CosmeticSurgery => "cosmetic_surgery",
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hand_is_required_everywhere() {
        for view in [
            View::Home,
            View::PersonalColor,
            View::PersonalBodyType,
            View::HairColor,
            View::PersonalMakeup,
            View::CosmeticSurgery,
        ] {
            assert!(view.required_models().contains(&ModelType::Hand), "{view}");
        }
        assert_eq!(
            View::HairColor.required_models(),
            &[ModelType::Hand, ModelType::HairSegment]
        );
        assert!(View::CosmeticSurgery.required_models().contains(&ModelType::Face));
    }
}
