use anyhow::{Context, Result, anyhow};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::{
    assets::ensure_model_ready_with_progress,
    common::{self, Letterbox},
};
use crate::{
    config::{Delegate, ModelConfig},
    pipeline::{InferenceSession, SessionFactory},
    types::{Handedness, ImageView, LandmarkSet, ModelOutput, ModelType},
};

#[derive(Clone, Copy, Debug)]
struct ModelSpec {
    input_size: u32,
    landmarks: usize,
    stride: usize,
}

fn spec(model: ModelType) -> ModelSpec {
    match model {
        ModelType::Hand => ModelSpec {
            input_size: 224,
            landmarks: 21,
            stride: 3,
        },
        ModelType::Face => ModelSpec {
            input_size: 192,
            landmarks: 468,
            stride: 3,
        },
        ModelType::Pose => ModelSpec {
            input_size: 256,
            landmarks: 39,
            stride: 5,
        },
        ModelType::HairSegment => ModelSpec {
            input_size: 512,
            landmarks: 0,
            stride: 0,
        },
    }
}

/// Builds ONNX Runtime sessions, fetching model files on first use.
#[derive(Clone, Copy, Debug, Default)]
pub struct OrtSessionFactory;

impl SessionFactory for OrtSessionFactory {
    fn create(&self, model: ModelType, config: &ModelConfig) -> Result<Box<dyn InferenceSession>> {
        ensure_model_ready_with_progress(model, config)?;
        let session = OrtSession::new(model, config)?;
        log::info!("{model} ORT session ready using {}", config.model_path.display());
        Ok(Box::new(session))
    }
}

pub struct OrtSession {
    model: ModelType,
    spec: ModelSpec,
    session: Session,
    min_confidence: f32,
    max_results: usize,
}

impl OrtSession {
    pub fn new(model: ModelType, config: &ModelConfig) -> Result<Self> {
        let threads = match config.delegate {
            Delegate::Cpu => 2,
            Delegate::Gpu => 4,
        };
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(threads)?
            .commit_from_file(&config.model_path)
            .with_context(|| {
                format!(
                    "failed to load ORT session from {}",
                    config.model_path.display()
                )
            })?;

        Ok(Self {
            model,
            spec: spec(model),
            session,
            min_confidence: config.min_detection_confidence,
            max_results: config.max_results.max(1),
        })
    }

    fn decode_landmarks(
        &self,
        flat: &[f32],
        score: f32,
        handedness: Option<f32>,
        letterbox: &Letterbox,
    ) -> Result<ModelOutput> {
        if score < self.min_confidence {
            return Ok(ModelOutput::Landmarks(Vec::new()));
        }
        let raw = common::decode_landmarks(flat, self.spec.landmarks, self.spec.stride)?;
        let set = LandmarkSet {
            landmarks: common::project_landmarks(&raw, letterbox),
            score,
            handedness: handedness.map(Handedness::from_score),
        };
        let mut sets = vec![set];
        sets.truncate(self.max_results);
        Ok(ModelOutput::Landmarks(sets))
    }
}

impl InferenceSession for OrtSession {
    fn infer(&mut self, image: ImageView<'_>, _timestamp_ms: f64) -> Result<ModelOutput> {
        let (input, letterbox) = common::prepare_letterboxed(image, self.spec.input_size)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run ORT session")?;

        if outputs.is_empty() {
            return Err(anyhow!("model returned no outputs"));
        }

        let primary = outputs[0].try_extract_array::<f32>()?;
        let flat: Vec<f32> = primary.iter().copied().collect();

        if self.model == ModelType::HairSegment {
            let classes = primary.shape().last().copied().unwrap_or(1);
            let mask = common::category_mask(
                &flat,
                self.spec.input_size as usize,
                classes,
                &letterbox,
            )?;
            return Ok(ModelOutput::Segmentation(mask));
        }

        let scalar = |index: usize| -> Option<f32> {
            if outputs.len() <= index {
                return None;
            }
            outputs[index]
                .try_extract_array::<f32>()
                .ok()
                .and_then(|arr| arr.iter().next().copied())
        };
        let score = scalar(1).unwrap_or(1.0).clamp(0.0, 1.0);
        let handedness = if self.model == ModelType::Hand {
            scalar(2)
        } else {
            None
        };
        drop(outputs);

        self.decode_landmarks(&flat, score, handedness, &letterbox)
    }

    fn dispose(&mut self) {
        log::debug!("releasing {} ORT session", self.model);
    }
}
