//! Per-session lifecycle: Uninitialized -> Initializing -> Ready <-> Detecting -> Terminated.

use std::fmt;

use crate::{config::ModelConfig, error::DetectError, types::ModelType};

use super::session::SessionHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Detecting,
    Terminated,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Detecting => "detecting",
            SessionState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What an initialize request resolved to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitStep {
    /// Construction must be started with the returned config.
    Start,
    /// A session already exists; report success for it.
    AlreadyReady,
    /// Construction is underway; its completion answers this request too.
    InProgress,
}

/// One model's session within a worker.
///
/// The handle is present only while `Ready`. During a detection it is lent
/// to the running job and must come back through [`ModelSlot::restore`].
#[derive(Debug)]
pub struct ModelSlot {
    model: ModelType,
    config: ModelConfig,
    state: SessionState,
    handle: Option<SessionHandle>,
}

impl ModelSlot {
    pub fn new(model: ModelType, config: ModelConfig) -> Self {
        Self {
            model,
            config,
            state: SessionState::Uninitialized,
            handle: None,
        }
    }

    pub fn model(&self) -> ModelType {
        self.model
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Ready or Detecting.
    pub fn is_live(&self) -> bool {
        matches!(self.state, SessionState::Ready | SessionState::Detecting)
    }

    /// A transition is in progress that must finish before cleanup.
    pub fn is_busy(&self) -> bool {
        matches!(
            self.state,
            SessionState::Initializing | SessionState::Detecting
        )
    }

    /// `config` replaces the stored options only when a new session is
    /// about to be built.
    pub fn begin_initialize(&mut self, config: Option<ModelConfig>) -> InitStep {
        match self.state {
            SessionState::Uninitialized | SessionState::Terminated => {
                if let Some(config) = config {
                    self.config = config;
                }
                self.state = SessionState::Initializing;
                InitStep::Start
            }
            SessionState::Initializing => InitStep::InProgress,
            SessionState::Ready | SessionState::Detecting => InitStep::AlreadyReady,
        }
    }

    pub fn finish_initialize(
        &mut self,
        outcome: Result<SessionHandle, DetectError>,
    ) -> Result<(), DetectError> {
        if self.state != SessionState::Initializing {
            // A handle nobody asked for is disposed on the spot.
            log::warn!(
                "{} session finished initializing while {}, discarding",
                self.model,
                self.state
            );
            return Err(DetectError::NotInitialized { model: self.model });
        }

        match outcome {
            Ok(handle) => {
                self.handle = Some(handle);
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(err) => {
                self.state = SessionState::Uninitialized;
                Err(err)
            }
        }
    }

    /// Ready -> Detecting, handing the session to a detection job.
    pub fn lend(&mut self) -> Option<SessionHandle> {
        if self.state != SessionState::Ready {
            return None;
        }
        let handle = self.handle.take()?;
        self.state = SessionState::Detecting;
        Some(handle)
    }

    /// Detecting -> Ready once the job hands the session back.
    pub fn restore(&mut self, handle: SessionHandle) {
        debug_assert_eq!(handle.model(), self.model);
        if self.state == SessionState::Detecting {
            self.handle = Some(handle);
            self.state = SessionState::Ready;
        } else {
            log::warn!(
                "{} session returned while {}, disposing",
                self.model,
                self.state
            );
        }
    }

    /// Detecting -> Uninitialized when the job holding the session died
    /// without handing it back. A fresh initialize may rebuild it.
    pub fn abandon(&mut self) {
        if self.state == SessionState::Detecting {
            log::error!("{} session lost during detection", self.model);
            self.handle = None;
            self.state = SessionState::Uninitialized;
        }
    }

    /// Disposes the session. Must not be called while busy.
    pub fn terminate(&mut self) -> bool {
        if self.is_busy() {
            return false;
        }
        if let Some(handle) = self.handle.take() {
            drop(handle);
        }
        self.state = SessionState::Terminated;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedFactory;

    fn slot() -> ModelSlot {
        ModelSlot::new(ModelType::Face, ModelConfig::for_model(ModelType::Face))
    }

    fn open(factory: &ScriptedFactory) -> Result<SessionHandle, DetectError> {
        SessionHandle::open(factory, ModelType::Face, &ModelConfig::for_model(ModelType::Face))
    }

    #[test]
    fn walks_the_full_lifecycle() {
        let factory = ScriptedFactory::default();
        let mut slot = slot();
        assert_eq!(slot.state(), SessionState::Uninitialized);

        assert_eq!(slot.begin_initialize(None), InitStep::Start);
        assert_eq!(slot.state(), SessionState::Initializing);
        assert_eq!(slot.begin_initialize(None), InitStep::InProgress);

        slot.finish_initialize(open(&factory)).unwrap();
        assert_eq!(slot.state(), SessionState::Ready);
        assert_eq!(slot.begin_initialize(None), InitStep::AlreadyReady);

        let handle = slot.lend().unwrap();
        assert_eq!(slot.state(), SessionState::Detecting);
        assert!(slot.lend().is_none());
        assert!(!slot.terminate());

        slot.restore(handle);
        assert_eq!(slot.state(), SessionState::Ready);

        assert!(slot.terminate());
        assert_eq!(slot.state(), SessionState::Terminated);
        assert_eq!(factory.created.get(), 1);
        assert_eq!(factory.disposed.get(), 1);
    }

    #[test]
    fn failed_construction_is_retry_eligible() {
        let mut slot = slot();
        slot.begin_initialize(None);
        let err = slot
            .finish_initialize(Err(DetectError::Init {
                model: ModelType::Face,
                reason: "missing asset".into(),
            }))
            .unwrap_err();
        assert!(matches!(err, DetectError::Init { .. }));
        assert_eq!(slot.state(), SessionState::Uninitialized);
        assert_eq!(slot.begin_initialize(None), InitStep::Start);
    }

    #[test]
    fn terminated_slot_can_be_initialized_again_with_new_options() {
        let factory = ScriptedFactory::default();
        let mut slot = slot();
        slot.begin_initialize(None);
        slot.finish_initialize(open(&factory)).unwrap();
        slot.terminate();

        let mut config = ModelConfig::for_model(ModelType::Face);
        config.max_results = 3;
        assert_eq!(slot.begin_initialize(Some(config)), InitStep::Start);
        assert_eq!(slot.config().max_results, 3);
    }

    #[test]
    fn unexpected_handle_is_discarded() {
        let factory = ScriptedFactory::default();
        let mut slot = slot();
        assert!(slot.finish_initialize(open(&factory)).is_err());
        assert_eq!(slot.state(), SessionState::Uninitialized);
        assert_eq!(factory.disposed.get(), 1);
    }
}
