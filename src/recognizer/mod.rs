pub mod assets;
pub mod common;
#[cfg(feature = "onnx")]
pub mod ort;

use std::sync::Arc;

use anyhow::Result;

use crate::{
    config::ModelConfig,
    pipeline::{InferenceSession, SessionFactory},
    types::{CategoryMask, ImageView, Landmark, LandmarkSet, ModelOutput, ModelType},
};

/// Which session implementation backs the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecognizerBackend {
    /// Brightness heuristics; needs no model files.
    Placeholder,
    #[cfg(feature = "onnx")]
    Onnx,
}

impl Default for RecognizerBackend {
    #[cfg(feature = "onnx")]
    fn default() -> Self {
        RecognizerBackend::Onnx
    }

    #[cfg(not(feature = "onnx"))]
    fn default() -> Self {
        RecognizerBackend::Placeholder
    }
}

impl RecognizerBackend {
    pub fn label(&self) -> &'static str {
        match self {
            RecognizerBackend::Placeholder => "placeholder",
            #[cfg(feature = "onnx")]
            RecognizerBackend::Onnx => "ort",
        }
    }

    pub fn factory(&self) -> Arc<dyn SessionFactory> {
        log::info!("using {} recognizer backend", self.label());
        match self {
            RecognizerBackend::Placeholder => Arc::new(BrightnessFactory),
            #[cfg(feature = "onnx")]
            RecognizerBackend::Onnx => Arc::new(ort::OrtSessionFactory),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BrightnessFactory;

impl SessionFactory for BrightnessFactory {
    fn create(&self, model: ModelType, config: &ModelConfig) -> Result<Box<dyn InferenceSession>> {
        Ok(Box::new(BrightnessSession {
            model,
            min_confidence: config.min_detection_confidence,
        }))
    }
}

/// Treats a bright image as a detection centred on its brightness
/// centroid; for hair, dark pixels form the mask.
#[derive(Clone, Debug)]
pub struct BrightnessSession {
    model: ModelType,
    min_confidence: f32,
}

const HAIR_LUMA_THRESHOLD: f32 = 60.0;

fn luma(px: &[u8]) -> f32 {
    (px[0] as f32 + px[1] as f32 + px[2] as f32) / 3.0
}

impl InferenceSession for BrightnessSession {
    fn infer(&mut self, image: ImageView<'_>, _timestamp_ms: f64) -> Result<ModelOutput> {
        if image.rgba.len() != image.expected_len() {
            anyhow::bail!(
                "frame buffer size mismatch: got {}, expected {}",
                image.rgba.len(),
                image.expected_len()
            );
        }

        if self.model == ModelType::HairSegment {
            let categories = image
                .rgba
                .chunks_exact(4)
                .map(|px| u8::from(luma(px) < HAIR_LUMA_THRESHOLD))
                .collect();
            return Ok(ModelOutput::Segmentation(CategoryMask {
                width: image.width,
                height: image.height,
                categories,
            }));
        }

        let width = image.width.max(1) as usize;
        let (mut total, mut cx, mut cy) = (0.0f32, 0.0f32, 0.0f32);
        for (i, px) in image.rgba.chunks_exact(4).enumerate() {
            let value = luma(px);
            total += value;
            cx += value * (i % width) as f32;
            cy += value * (i / width) as f32;
        }
        let pixels = (image.rgba.len() / 4).max(1) as f32;
        let confidence = (total / pixels / 255.0).clamp(0.0, 1.0);

        if confidence < self.min_confidence || total == 0.0 {
            return Ok(ModelOutput::Landmarks(Vec::new()));
        }
        Ok(ModelOutput::Landmarks(vec![LandmarkSet {
            landmarks: vec![Landmark {
                x: cx / total,
                y: cy / total,
                z: 0.0,
            }],
            score: confidence,
            handedness: None,
        }]))
    }
}
