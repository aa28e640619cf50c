use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;

/// Longest single sleep. The deadline is re-checked against the clock after
/// every slice, so wall-clock jumps are noticed within this bound.
const POLL_SLICE: Duration = Duration::from_secs(30);

/// Work scheduled on its own thread that runs once a deadline passes.
///
/// Dropping the task (or calling [`DeferredTask::cancel`]) stops it before it
/// runs and joins the thread. A task that already ran is unaffected.
pub struct DeferredTask {
    cancel: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl DeferredTask {
    /// Runs `task` once `clock.now()` reaches `deadline`.
    pub fn at<F>(clock: Arc<dyn Clock>, deadline: DateTime<Utc>, task: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let join = thread::spawn(move || {
            loop {
                let Ok(remaining) = (deadline - clock.now()).to_std() else {
                    break;
                };
                if remaining.is_zero() {
                    break;
                }
                match cancelled.recv_timeout(remaining.min(POLL_SLICE)) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            task();
        });
        Self {
            cancel: Some(cancel),
            join: Some(join),
        }
    }

    pub fn cancel(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(join) = self.join.take()
            && join.thread().id() != thread::current().id()
        {
            let _ = join.join();
        }
    }
}

impl Drop for DeferredTask {
    fn drop(&mut self) {
        self.stop();
    }
}
