//! Model and pipeline configuration.
//!
//! Every model type has built-in defaults; a TOML file can override them per
//! model and describe which worker serves which models.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::{capture::View, types::ModelType};

const MODEL_DIR: &str = "models";
const HAND_LANDMARKER_FILENAME: &str = "handpose_estimation_mediapipe_2023feb.onnx";
const HAND_LANDMARKER_URL: &str = "https://raw.githubusercontent.com/214zzl995/gesture-universe/refs/heads/main/models/handpose_estimation_mediapipe_2023feb.onnx";

/// Compute backend preference handed to the session factory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delegate {
    Cpu,
    #[default]
    Gpu,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunningMode {
    /// Streaming frames with monotonically increasing timestamps.
    #[default]
    Video,
    /// Independent single-shot images.
    Image,
}

/// Immutable options a session is constructed with.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelConfig {
    pub delegate: Delegate,
    pub running_mode: RunningMode,
    pub min_detection_confidence: f32,
    pub min_presence_confidence: f32,
    pub max_results: usize,
    pub output_category_mask: bool,
    /// Admit only every Nth frame. `None` admits every frame.
    pub skip_every: Option<u32>,
    pub model_path: PathBuf,
    pub model_url: Option<String>,
}

impl ModelConfig {
    /// Sessions never run more than one detection at a time.
    pub const MAX_CONCURRENT_DETECTIONS: usize = 1;

    pub fn for_model(model: ModelType) -> Self {
        let base = Self {
            delegate: Delegate::Gpu,
            running_mode: RunningMode::Video,
            min_detection_confidence: 0.3,
            min_presence_confidence: 0.3,
            max_results: 1,
            output_category_mask: false,
            skip_every: None,
            model_path: PathBuf::new(),
            model_url: None,
        };

        match model {
            ModelType::Hand => Self {
                model_path: Path::new(MODEL_DIR).join(HAND_LANDMARKER_FILENAME),
                model_url: Some(HAND_LANDMARKER_URL.to_string()),
                ..base
            },
            ModelType::Face => Self {
                skip_every: Some(5),
                model_path: Path::new(MODEL_DIR).join("face_landmarker.onnx"),
                ..base
            },
            ModelType::Pose => Self {
                skip_every: Some(7),
                model_path: Path::new(MODEL_DIR).join("pose_landmarker.onnx"),
                ..base
            },
            ModelType::HairSegment => Self {
                skip_every: Some(7),
                output_category_mask: true,
                model_path: Path::new(MODEL_DIR).join("hair_segmenter.onnx"),
                ..base
            },
        }
    }
}

/// Partial per-model settings read from the config file.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelOverride {
    pub model: ModelType,
    pub delegate: Option<Delegate>,
    pub running_mode: Option<RunningMode>,
    pub min_detection_confidence: Option<f32>,
    pub min_presence_confidence: Option<f32>,
    pub max_results: Option<usize>,
    pub output_category_mask: Option<bool>,
    /// `0` disables throttling for the model.
    pub skip_every: Option<u32>,
    pub model_path: Option<PathBuf>,
    pub model_url: Option<String>,
}

impl ModelOverride {
    fn apply(&self, config: &mut ModelConfig) {
        if let Some(delegate) = self.delegate {
            config.delegate = delegate;
        }
        if let Some(mode) = self.running_mode {
            config.running_mode = mode;
        }
        if let Some(value) = self.min_detection_confidence {
            config.min_detection_confidence = value;
        }
        if let Some(value) = self.min_presence_confidence {
            config.min_presence_confidence = value;
        }
        if let Some(value) = self.max_results {
            config.max_results = value;
        }
        if let Some(value) = self.output_category_mask {
            config.output_category_mask = value;
        }
        if let Some(value) = self.skip_every {
            config.skip_every = (value > 1).then_some(value);
        }
        if let Some(path) = &self.model_path {
            config.model_path = path.clone();
        }
        if let Some(url) = &self.model_url {
            config.model_url = Some(url.clone());
        }
    }
}

fn default_inference_threads() -> usize {
    2
}

fn default_capture_interval_ms() -> u64 {
    80
}

/// One worker: an isolated actor owning the sessions for `models`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    pub name: String,
    pub models: Vec<ModelType>,
    #[serde(default = "default_inference_threads")]
    pub inference_threads: usize,
    /// Minimum spacing between frames captured for this worker.
    #[serde(default = "default_capture_interval_ms")]
    pub capture_interval_ms: u64,
}

impl WorkerConfig {
    pub fn dedicated(model: ModelType, capture_interval_ms: u64) -> Self {
        Self {
            name: model.as_str().to_string(),
            models: vec![model],
            inference_threads: default_inference_threads(),
            capture_interval_ms,
        }
    }

    pub fn shared(name: impl Into<String>, models: impl IntoIterator<Item = ModelType>) -> Self {
        Self {
            name: name.into(),
            models: models.into_iter().collect(),
            inference_threads: ModelType::ALL.len(),
            capture_interval_ms: default_capture_interval_ms(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub view: View,
    /// Model that bypasses the frame-skip throttle.
    pub always_admit: ModelType,
    pub workers: Vec<WorkerConfig>,
    pub models: Vec<ModelOverride>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            view: View::PersonalMakeup,
            always_admit: ModelType::Hand,
            workers: vec![
                WorkerConfig::dedicated(ModelType::Hand, 80),
                WorkerConfig::dedicated(ModelType::Face, 200),
            ],
            models: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers.is_empty() {
            bail!("at least one worker must be configured");
        }

        let mut names = BTreeSet::new();
        let mut served = BTreeMap::new();
        for worker in &self.workers {
            if !names.insert(worker.name.as_str()) {
                bail!("duplicate worker name {:?}", worker.name);
            }
            if worker.models.is_empty() {
                bail!("worker {:?} serves no models", worker.name);
            }
            if worker.inference_threads == 0 {
                bail!("worker {:?} needs at least one inference thread", worker.name);
            }
            for model in &worker.models {
                if let Some(other) = served.insert(*model, worker.name.as_str()) {
                    bail!(
                        "model {model} is served by both {other:?} and {:?}",
                        worker.name
                    );
                }
            }
        }

        Ok(())
    }

    pub fn model_config(&self, model: ModelType) -> ModelConfig {
        let mut config = ModelConfig::for_model(model);
        for entry in self.models.iter().filter(|entry| entry.model == model) {
            entry.apply(&mut config);
        }
        config
    }

    pub fn worker_models(&self, worker: &WorkerConfig) -> BTreeMap<ModelType, ModelConfig> {
        worker
            .models
            .iter()
            .map(|model| (*model, self.model_config(*model)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_per_model_policy() {
        assert_eq!(ModelConfig::for_model(ModelType::Hand).skip_every, None);
        assert_eq!(ModelConfig::for_model(ModelType::Face).skip_every, Some(5));
        assert_eq!(ModelConfig::for_model(ModelType::Pose).skip_every, Some(7));
        let hair = ModelConfig::for_model(ModelType::HairSegment);
        assert_eq!(hair.skip_every, Some(7));
        assert!(hair.output_category_mask);
        assert_eq!(ModelConfig::MAX_CONCURRENT_DETECTIONS, 1);
    }

    #[test]
    fn default_pipeline_runs_dedicated_hand_and_face_workers() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        let names: Vec<_> = config.workers.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, ["hand", "face"]);
        assert_eq!(config.workers[0].capture_interval_ms, 80);
        assert_eq!(config.workers[1].capture_interval_ms, 200);
    }

    #[test]
    fn toml_overrides_are_layered_on_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            view = "hair_color"

            [[workers]]
            name = "vision"
            models = ["hand", "face", "hair"]
            inference_threads = 3

            [[models]]
            model = "face"
            skip_every = 4
            delegate = "cpu"

            [[models]]
            model = "hair"
            skip_every = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.view, View::HairColor);
        assert_eq!(config.workers[0].capture_interval_ms, 80);

        let face = config.model_config(ModelType::Face);
        assert_eq!(face.skip_every, Some(4));
        assert_eq!(face.delegate, Delegate::Cpu);
        assert_eq!(face.min_detection_confidence, 0.3);

        assert_eq!(config.model_config(ModelType::HairSegment).skip_every, None);
        assert_eq!(config.worker_models(&config.workers[0]).len(), 3);
    }

    #[test]
    fn a_model_may_only_be_served_by_one_worker() {
        let err = PipelineConfig::from_toml_str(
            r#"
            [[workers]]
            name = "a"
            models = ["hand"]

            [[workers]]
            name = "b"
            models = ["face", "hand"]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("served by both"));
    }

    #[test]
    fn unknown_model_names_are_rejected() {
        assert!(
            PipelineConfig::from_toml_str(
                r#"
                [[workers]]
                name = "a"
                models = ["tail"]
                "#,
            )
            .is_err()
        );
    }
}
