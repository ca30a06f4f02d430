use crate::{config::PipelineConfig, types::ModelType};

use super::View;

/// One frame to capture for one worker.
#[derive(Clone, Debug, PartialEq)]
pub struct Dispatch {
    pub worker: String,
    pub models: Vec<ModelType>,
}

#[derive(Clone, Debug)]
struct Cadence {
    worker: String,
    models: Vec<ModelType>,
    interval_ms: f64,
    last_ms: Option<f64>,
}

/// Decides, per tick, which workers get a fresh frame.
///
/// Each worker has its own minimum spacing between captures. A worker is
/// only fed when the current view needs one of its models, but its clock
/// advances either way so switching views does not cause a burst.
#[derive(Clone, Debug)]
pub struct CaptureScheduler {
    view: View,
    cadences: Vec<Cadence>,
}

impl CaptureScheduler {
    pub fn new(config: &PipelineConfig) -> Self {
        let cadences = config
            .workers
            .iter()
            .map(|worker| Cadence {
                worker: worker.name.clone(),
                models: worker.models.clone(),
                interval_ms: worker.capture_interval_ms as f64,
                last_ms: None,
            })
            .collect();
        Self {
            view: config.view,
            cadences,
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn set_view(&mut self, view: View) {
        if view != self.view {
            log::info!("capture view changed: {} -> {view}", self.view);
            self.view = view;
        }
    }

    pub fn due(&mut self, now_ms: f64) -> Vec<Dispatch> {
        let required = self.view.required_models();
        let mut due = Vec::new();
        for cadence in &mut self.cadences {
            if cadence
                .last_ms
                .is_some_and(|last| now_ms - last < cadence.interval_ms)
            {
                continue;
            }
            cadence.last_ms = Some(now_ms);

            let models: Vec<ModelType> = cadence
                .models
                .iter()
                .copied()
                .filter(|model| required.contains(model))
                .collect();
            if models.is_empty() {
                continue;
            }
            due.push(Dispatch {
                worker: cadence.worker.clone(),
                models,
            });
        }
        due
    }

    /// Time until the next worker becomes due.
    pub fn next_due_in(&self, now_ms: f64) -> f64 {
        self.cadences
            .iter()
            .map(|cadence| match cadence.last_ms {
                Some(last) => (last + cadence.interval_ms - now_ms).max(0.0),
                None => 0.0,
            })
            .fold(f64::INFINITY, f64::min)
    }
}
