//! Merges per-worker results into one consumer-facing view.

use std::collections::BTreeMap;

use crate::{
    error::DetectError,
    pipeline::WorkerEvent,
    types::{DetectionResult, ModelOutput, ModelType},
};

#[derive(Clone, Debug, PartialEq)]
pub struct TimedOutput {
    pub timestamp_ms: f64,
    pub output: ModelOutput,
}

/// Latest known outcome for one model.
///
/// A failed cycle records its error but keeps the previous output, so a
/// transient failure does not blank what consumers draw.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelState {
    pub latest: Option<TimedOutput>,
    pub error: Option<DetectError>,
    pub updates: u64,
}

/// Keys exist only for models that produced at least one result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregatedState {
    models: BTreeMap<ModelType, ModelState>,
}

impl AggregatedState {
    pub fn get(&self, model: ModelType) -> Option<&ModelState> {
        self.models.get(&model)
    }

    pub fn output(&self, model: ModelType) -> Option<&ModelOutput> {
        self.get(model)?.latest.as_ref().map(|timed| &timed.output)
    }

    pub fn error(&self, model: ModelType) -> Option<&DetectError> {
        self.get(model)?.error.as_ref()
    }

    pub fn contains(&self, model: ModelType) -> bool {
        self.models.contains_key(&model)
    }

    pub fn models(&self) -> impl Iterator<Item = (ModelType, &ModelState)> {
        self.models.iter().map(|(model, state)| (*model, state))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ResultAggregator {
    state: AggregatedState,
    readiness: BTreeMap<ModelType, (String, Result<(), DetectError>)>,
    merged: u64,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins per model. Other models are untouched.
    pub fn merge(&mut self, result: DetectionResult) {
        let entry = self.state.models.entry(result.model).or_default();
        match result.outcome {
            Ok(output) => {
                entry.latest = Some(TimedOutput {
                    timestamp_ms: result.timestamp_ms,
                    output,
                });
                entry.error = None;
            }
            Err(err) => entry.error = Some(err),
        }
        entry.updates += 1;
        self.merged += 1;
    }

    pub fn apply(&mut self, event: &WorkerEvent) {
        match event {
            WorkerEvent::Initialized {
                worker,
                model,
                result,
            } => {
                self.readiness
                    .insert(*model, (worker.clone(), result.clone()));
            }
            WorkerEvent::Detection { .. } => {
                for result in event.detection_results() {
                    self.merge(result);
                }
            }
            WorkerEvent::Cleaned {
                worker,
                model,
                result: Ok(()),
            } => match model {
                Some(model) => {
                    self.readiness.remove(model);
                }
                None => self.readiness.retain(|_, (owner, _)| owner != worker),
            },
            WorkerEvent::Cleaned { .. } => {}
        }
    }

    /// Whether the latest initialize for `model` succeeded and it has not
    /// been cleaned up since.
    pub fn is_ready(&self, model: ModelType) -> bool {
        matches!(self.readiness.get(&model), Some((_, Ok(()))))
    }

    pub fn init_error(&self, model: ModelType) -> Option<&DetectError> {
        self.readiness.get(&model)?.1.as_ref().err()
    }

    pub fn state(&self) -> &AggregatedState {
        &self.state
    }

    pub fn snapshot(&self) -> AggregatedState {
        self.state.clone()
    }

    pub fn merged_count(&self) -> u64 {
        self.merged
    }
}
