use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;

/// Shared run-stop flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Ready,
    Running,
    Stopping,
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Failed => "Failed",
        };
        write!(f, "{name}")
    }
}

/// A state being entered or left, and when
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub state: RunState,
    pub entered: bool,
    pub unix_time: i64,
}

/// Tracks the run lifecycle: Ready -> Running -> Stopping -> Ready, with Failed
/// reachable from anywhere. Every exit and entry is kept in the history.
#[derive(Debug, Clone)]
pub struct RunControl {
    state: RunState,
    history: Vec<TransitionRecord>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        let mut control = Self {
            state: RunState::Ready,
            history: Vec::new(),
        };
        control.record(RunState::Ready, true);
        control
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    pub fn start(&mut self) -> bool {
        self.transition(RunState::Ready, RunState::Running)
    }

    pub fn begin_stop(&mut self) -> bool {
        self.transition(RunState::Running, RunState::Stopping)
    }

    pub fn finish_stop(&mut self) -> bool {
        self.transition(RunState::Stopping, RunState::Ready)
    }

    /// Failed can be entered from any state
    pub fn fail(&mut self) {
        if self.state != RunState::Failed {
            self.move_to(RunState::Failed);
        }
    }

    fn transition(&mut self, from: RunState, to: RunState) -> bool {
        if self.state != from {
            log::warn!("Ignoring transition {from} -> {to} while in state {}", self.state);
            return false;
        }
        self.move_to(to);
        true
    }

    fn move_to(&mut self, to: RunState) {
        self.record(self.state, false);
        self.state = to;
        self.record(to, true);
        log::info!("Run state is now {to}");
    }

    fn record(&mut self, state: RunState, entered: bool) {
        self.history.push(TransitionRecord {
            state,
            entered,
            unix_time: OffsetDateTime::now_utc().unix_timestamp(),
        });
    }
}
