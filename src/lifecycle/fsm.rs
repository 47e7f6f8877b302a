//! The state machine shared by `ServerManager` and `ClientManager`
//! (spec.md §4.5): `Start` illegal from `running`/`starting`, `Stop` illegal
//! from anything but `running`/`error`.

use serde::Serialize;

use crate::error::{Result, TwError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// Guards the bare state transitions; callers still run their own pipeline
/// in between `begin_start`/`finish_start` (or the stop equivalents).
#[derive(Debug, Clone, Copy)]
pub struct Fsm {
    state: LifecycleState,
}

impl Default for Fsm {
    fn default() -> Self {
        Self {
            state: LifecycleState::Stopped,
        }
    }
}

impl Fsm {
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn begin_start(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Running | LifecycleState::Starting => {
                Err(TwError::fsm("Start refused: already running or starting"))
            }
            _ => {
                self.state = LifecycleState::Starting;
                Ok(())
            }
        }
    }

    pub fn finish_start_ok(&mut self) {
        self.state = LifecycleState::Running;
    }

    pub fn finish_start_err(&mut self) {
        self.state = LifecycleState::Error;
    }

    pub fn begin_stop(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Running | LifecycleState::Error => {
                self.state = LifecycleState::Stopping;
                Ok(())
            }
            _ => Err(TwError::fsm("Stop refused: not running or in error")),
        }
    }

    pub fn finish_stop(&mut self) {
        self.state = LifecycleState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_refused_while_running() {
        let mut fsm = Fsm::default();
        fsm.begin_start().unwrap();
        fsm.finish_start_ok();
        assert!(fsm.begin_start().is_err());
    }

    #[test]
    fn start_refused_while_starting() {
        let mut fsm = Fsm::default();
        fsm.begin_start().unwrap();
        assert!(fsm.begin_start().is_err());
    }

    #[test]
    fn stop_refused_while_stopped() {
        let mut fsm = Fsm::default();
        assert!(fsm.begin_stop().is_err());
    }

    #[test]
    fn stop_allowed_from_error() {
        let mut fsm = Fsm::default();
        fsm.begin_start().unwrap();
        fsm.finish_start_err();
        assert!(fsm.begin_stop().is_ok());
    }

    #[test]
    fn full_cycle_returns_to_stopped() {
        let mut fsm = Fsm::default();
        fsm.begin_start().unwrap();
        fsm.finish_start_ok();
        assert_eq!(fsm.state(), LifecycleState::Running);
        fsm.begin_stop().unwrap();
        fsm.finish_stop();
        assert_eq!(fsm.state(), LifecycleState::Stopped);
    }
}
