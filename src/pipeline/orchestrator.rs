//! Fan-out of one frame to every admitted session, fan-in of their results.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;

use crate::{
    error::DetectError,
    types::{FrameBuffer, ModelOutput, ModelType},
};

use super::{
    lifecycle::{ModelSlot, SessionState},
    session::SessionHandle,
    throttle::FrameThrottle,
};

pub type ModelResults = BTreeMap<ModelType, Result<ModelOutput, DetectError>>;

/// Picks the models a frame is run through this cycle.
///
/// Only Ready sessions are considered, and only those are charged against
/// the throttle, so a model that is still loading does not burn its count.
pub fn admit_models(
    requested: &BTreeSet<ModelType>,
    slots: &BTreeMap<ModelType, ModelSlot>,
    throttle: &mut FrameThrottle,
) -> Vec<ModelType> {
    requested
        .iter()
        .copied()
        .filter(|model| {
            slots
                .get(model)
                .is_some_and(|slot| slot.state() == SessionState::Ready)
        })
        .filter(|model| throttle.admit(*model))
        .collect()
}

/// A frame together with the sessions lent to process it.
#[derive(Debug)]
pub struct DetectionJob {
    frame: FrameBuffer,
    sessions: Vec<SessionHandle>,
}

#[derive(Debug)]
pub struct DetectionOutcome {
    pub timestamp_ms: f64,
    pub results: ModelResults,
    /// Lent sessions, to be restored to their slots.
    pub sessions: Vec<SessionHandle>,
}

impl DetectionJob {
    pub fn new(frame: FrameBuffer, sessions: Vec<SessionHandle>) -> Self {
        Self { frame, sessions }
    }

    pub fn timestamp_ms(&self) -> f64 {
        self.frame.timestamp_ms()
    }

    pub fn models(&self) -> Vec<ModelType> {
        self.sessions.iter().map(SessionHandle::model).collect()
    }

    /// Runs every session on the frame, concurrently when there is more
    /// than one, then releases the frame. Failures stay per model.
    pub fn run(self) -> DetectionOutcome {
        let DetectionJob {
            frame,
            mut sessions,
        } = self;
        let timestamp_ms = frame.timestamp_ms();
        let image = frame.view();

        let results: ModelResults = if sessions.len() > 1 {
            sessions
                .par_iter_mut()
                .map(|session| (session.model(), session.infer(image, timestamp_ms)))
                .collect()
        } else {
            sessions
                .iter_mut()
                .map(|session| (session.model(), session.infer(image, timestamp_ms)))
                .collect()
        };
        frame.release();

        for (model, result) in &results {
            if let Err(err) = result {
                log::warn!("{model} detection at {timestamp_ms:.1}ms failed: {err}");
            }
        }

        DetectionOutcome {
            timestamp_ms,
            results,
            sessions,
        }
    }
}
