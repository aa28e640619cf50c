use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::clock::Clock;
use crate::deferred::DeferredTask;

/// Opaque handle the scheduler hands out with every arm; a fired timer reports
/// it back so stale wakes can be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WakeToken(pub u64);

impl fmt::Display for WakeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wake#{}", self.0)
    }
}

/// The single OS-level wake primitive. Only the scheduler talks to it.
pub trait WakeTimer: Send {
    fn arm(&mut self, at: DateTime<Utc>, token: WakeToken);
    fn disarm(&mut self, token: WakeToken);
}

pub type WakeCallback = Arc<dyn Fn(WakeToken) + Send + Sync>;

/// Wake timer backed by a [`DeferredTask`] thread.
pub struct SoftwareWakeTimer {
    clock: Arc<dyn Clock>,
    on_fire: WakeCallback,
    pending: Option<(WakeToken, DeferredTask)>,
}

impl SoftwareWakeTimer {
    pub fn new(clock: Arc<dyn Clock>, on_fire: WakeCallback) -> Self {
        Self {
            clock,
            on_fire,
            pending: None,
        }
    }
}

impl WakeTimer for SoftwareWakeTimer {
    fn arm(&mut self, at: DateTime<Utc>, token: WakeToken) {
        debug!(%token, at = %at, "arming wake timer");
        let on_fire = Arc::clone(&self.on_fire);
        let task = DeferredTask::at(Arc::clone(&self.clock), at, move || on_fire(token));
        // Replacing drops (and cancels) the previous task.
        self.pending = Some((token, task));
    }

    fn disarm(&mut self, token: WakeToken) {
        if self
            .pending
            .as_ref()
            .is_some_and(|(current, _)| *current == token)
        {
            debug!(%token, "disarming wake timer");
            self.pending = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCall {
    Arm(DateTime<Utc>, WakeToken),
    Disarm(WakeToken),
}

/// Remembers arm/disarm calls instead of waking anything. The schedule report
/// reads the armed instant from it; tests assert on the call log.
#[derive(Clone, Default)]
pub struct RecordingWakeTimer {
    calls: Arc<Mutex<Vec<WakeCall>>>,
}

impl RecordingWakeTimer {
    pub fn calls(&self) -> Vec<WakeCall> {
        self.lock().clone()
    }

    /// The instant and token of the most recent arm that was not disarmed.
    pub fn armed(&self) -> Option<(DateTime<Utc>, WakeToken)> {
        let calls = self.lock();
        let mut armed = None;
        for call in calls.iter() {
            match *call {
                WakeCall::Arm(at, token) => armed = Some((at, token)),
                WakeCall::Disarm(token) if armed.is_some_and(|(_, t)| t == token) => armed = None,
                WakeCall::Disarm(_) => {}
            }
        }
        armed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<WakeCall>> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl WakeTimer for RecordingWakeTimer {
    fn arm(&mut self, at: DateTime<Utc>, token: WakeToken) {
        self.lock().push(WakeCall::Arm(at, token));
    }

    fn disarm(&mut self, token: WakeToken) {
        self.lock().push(WakeCall::Disarm(token));
    }
}
