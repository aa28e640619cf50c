use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::alarm::model::{AlarmId, AlarmRule, StoredAlarm};
use crate::engine::AlarmEngine;
use crate::error::AlarmError;
use crate::wake::{WakeCallback, WakeToken};

/// Requests the control surface can make of the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    List,
    Get(AlarmId),
    Create(AlarmRule),
    Update(AlarmId, AlarmRule),
    Delete(AlarmId),
    Enable(AlarmId),
    Disable(AlarmId),
    Snooze(AlarmId, Option<DateTime<Utc>>),
    Dismiss(AlarmId),
    Skip(AlarmId),
    Unskip(AlarmId),
    Boot,
    TimeZoneChanged,
    TimeChanged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Alarms(Vec<StoredAlarm>),
    Alarm(StoredAlarm),
    Deleted(AlarmId),
    Done,
}

enum Message {
    Request(Command, Sender<Result<Reply, AlarmError>>),
    WakeTimerFired(WakeToken),
    Shutdown,
}

/// Cloneable sender side of the service loop.
#[derive(Clone)]
pub struct ServiceHandle {
    sender: Sender<Message>,
}

impl ServiceHandle {
    /// Runs `command` on the service thread and waits for its reply.
    pub fn call(&self, command: Command) -> Result<Reply, AlarmError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.sender
            .send(Message::Request(command, reply_tx))
            .map_err(|_| AlarmError::ServiceStopped)?;
        reply_rx.recv().map_err(|_| AlarmError::ServiceStopped)?
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(Message::Shutdown);
    }
}

/// Single thread that owns the engine. The control API and the wake timer
/// only post messages, so every mutation is applied in arrival order.
pub struct AlarmService {
    handle: ServiceHandle,
    join: Option<JoinHandle<()>>,
}

impl AlarmService {
    /// Builds the engine with a wake callback that feeds this service's
    /// queue, starts it, then hands it to the service thread.
    pub fn start<F>(build: F) -> Result<Self>
    where
        F: FnOnce(WakeCallback) -> Result<AlarmEngine>,
    {
        let (sender, receiver) = mpsc::channel();
        let wake_sender = sender.clone();
        let on_wake: WakeCallback = Arc::new(move |token| {
            let _ = wake_sender.send(Message::WakeTimerFired(token));
        });

        let mut engine = build(on_wake)?;
        engine.start().context("failed to start alarm engine")?;

        let join = thread::Builder::new()
            .name("alarm-service".to_string())
            .spawn(move || run_service_loop(engine, receiver))
            .context("failed to spawn alarm service thread")?;
        Ok(Self {
            handle: ServiceHandle { sender },
            join: Some(join),
        })
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    /// Blocks until the loop stops (see [`ServiceHandle::shutdown`]).
    pub fn wait(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for AlarmService {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            self.handle.shutdown();
            let _ = join.join();
        }
    }
}

fn run_service_loop(mut engine: AlarmEngine, receiver: Receiver<Message>) {
    info!("alarm service running");
    for message in receiver {
        match message {
            Message::Request(command, reply) => {
                let result = execute(&mut engine, command);
                let _ = reply.send(result);
            }
            Message::WakeTimerFired(token) => {
                debug!(%token, "wake timer fired");
                engine.on_wake_timer_fired(token);
            }
            Message::Shutdown => break,
        }
    }
    info!("alarm service stopped");
}

fn execute(engine: &mut AlarmEngine, command: Command) -> Result<Reply, AlarmError> {
    match command {
        Command::List => Ok(Reply::Alarms(engine.alarms())),
        Command::Get(id) => engine.alarm(id).map(Reply::Alarm),
        Command::Create(rule) => {
            let id = engine.create(rule)?;
            engine.alarm(id).map(Reply::Alarm)
        }
        Command::Update(id, rule) => {
            engine.update(id, rule)?;
            engine.alarm(id).map(Reply::Alarm)
        }
        Command::Delete(id) => {
            engine.delete(id)?;
            Ok(Reply::Deleted(id))
        }
        Command::Enable(id) => after(engine, id, AlarmEngine::enable),
        Command::Disable(id) => after(engine, id, AlarmEngine::disable),
        Command::Snooze(id, until) => after(engine, id, |engine, id| engine.snooze(id, until)),
        Command::Dismiss(id) => after(engine, id, AlarmEngine::dismiss),
        Command::Skip(id) => after(engine, id, AlarmEngine::skip),
        Command::Unskip(id) => after(engine, id, AlarmEngine::unskip),
        Command::Boot => {
            engine.on_boot();
            Ok(Reply::Done)
        }
        Command::TimeZoneChanged => {
            engine.on_time_zone_changed();
            Ok(Reply::Done)
        }
        Command::TimeChanged => {
            engine.on_time_changed();
            Ok(Reply::Done)
        }
    }
}

/// Applies a per-alarm operation and replies with the alarm's new record.
fn after<F>(engine: &mut AlarmEngine, id: AlarmId, op: F) -> Result<Reply, AlarmError>
where
    F: FnOnce(&mut AlarmEngine, AlarmId) -> Result<(), AlarmError>,
{
    op(engine, id)?;
    engine.alarm(id).map(Reply::Alarm)
}
