use std::collections::HashMap;

use crate::types::ModelType;

#[derive(Clone, Copy, Debug)]
struct SkipCounter {
    count: u32,
    skip_every: u32,
}

/// Per-model frame-skip gate.
///
/// Each check increments the model's counter; the check that brings it to
/// `skip_every` is admitted and resets it. Models without a configured
/// interval, and the designated always-admit model, pass every check.
#[derive(Clone, Debug)]
pub struct FrameThrottle {
    always_admit: ModelType,
    counters: HashMap<ModelType, SkipCounter>,
}

impl FrameThrottle {
    pub fn new(always_admit: ModelType) -> Self {
        Self {
            always_admit,
            counters: HashMap::new(),
        }
    }

    pub fn with_intervals(
        always_admit: ModelType,
        intervals: impl IntoIterator<Item = (ModelType, Option<u32>)>,
    ) -> Self {
        let mut throttle = Self::new(always_admit);
        for (model, skip_every) in intervals {
            throttle.set_interval(model, skip_every);
        }
        throttle
    }

    /// `None`, `0` and `1` all mean every frame is admitted.
    pub fn set_interval(&mut self, model: ModelType, skip_every: Option<u32>) {
        match skip_every {
            Some(skip_every) if skip_every > 1 && model != self.always_admit => {
                self.counters.insert(
                    model,
                    SkipCounter {
                        count: 0,
                        skip_every,
                    },
                );
            }
            _ => {
                self.counters.remove(&model);
            }
        }
    }

    pub fn admit(&mut self, model: ModelType) -> bool {
        if model == self.always_admit {
            return true;
        }
        let Some(counter) = self.counters.get_mut(&model) else {
            return true;
        };

        counter.count += 1;
        if counter.count >= counter.skip_every {
            counter.count = 0;
            true
        } else {
            log::trace!(
                "throttling {model}: {}/{}",
                counter.count,
                counter.skip_every
            );
            false
        }
    }

    pub fn reset(&mut self, model: ModelType) {
        if let Some(counter) = self.counters.get_mut(&model) {
            counter.count = 0;
        }
    }

    pub fn count(&self, model: ModelType) -> u32 {
        self.counters.get(&model).map_or(0, |counter| counter.count)
    }

    pub fn always_admit(&self) -> ModelType {
        self.always_admit
    }
}
