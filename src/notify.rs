use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::alarm::model::AlarmId;

/// Lifecycle changes observers care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Lifecycle {
    Armed { next: DateTime<Utc> },
    Skipping { next: DateTime<Utc> },
    PreAlarmFiring,
    MainFiring,
    Snoozed { until: DateTime<Utc> },
    Dismissed,
    Disabled,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AlarmEvent {
    pub id: AlarmId,
    #[serde(flatten)]
    pub lifecycle: Lifecycle,
}

/// Receives lifecycle events. Delivery is fire-and-forget: implementations
/// must not block the engine.
pub trait Notifier: Send {
    fn publish(&self, event: AlarmEvent);
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn publish(&self, event: AlarmEvent) {
        match event.lifecycle {
            Lifecycle::Armed { next } => info!(id = event.id, next = %next, "alarm armed"),
            Lifecycle::Skipping { next } => {
                info!(id = event.id, next = %next, "alarm skipping next occurrence")
            }
            Lifecycle::PreAlarmFiring => info!(id = event.id, "pre-alarm firing"),
            Lifecycle::MainFiring => info!(id = event.id, "alarm firing"),
            Lifecycle::Snoozed { until } => info!(id = event.id, until = %until, "alarm snoozed"),
            Lifecycle::Dismissed => info!(id = event.id, "alarm dismissed"),
            Lifecycle::Disabled => info!(id = event.id, "alarm disabled"),
            Lifecycle::Deleted => info!(id = event.id, "alarm deleted"),
        }
    }
}

/// Pushes events onto a bounded channel for the presentation layer. A full
/// channel drops the event instead of stalling the engine.
pub struct ChannelNotifier {
    sender: SyncSender<AlarmEvent>,
}

impl ChannelNotifier {
    pub fn bounded(capacity: usize) -> (Self, Receiver<AlarmEvent>) {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        (Self { sender }, receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn publish(&self, event: AlarmEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                warn!(id = dropped.id, "event channel full, dropping lifecycle event");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

pub struct FanoutNotifier {
    sinks: Vec<Box<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(sinks: Vec<Box<dyn Notifier>>) -> Self {
        Self { sinks }
    }
}

impl Notifier for FanoutNotifier {
    fn publish(&self, event: AlarmEvent) {
        for sink in &self.sinks {
            sink.publish(event);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;

    #[test]
    fn channel_notifier_drops_when_full() {
        let (notifier, receiver) = ChannelNotifier::bounded(1);
        notifier.publish(AlarmEvent {
            id: 1,
            lifecycle: Lifecycle::MainFiring,
        });
        notifier.publish(AlarmEvent {
            id: 2,
            lifecycle: Lifecycle::Dismissed,
        });
        let received = receiver.try_iter().collect::<Vec<_>>();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, 1);
    }

    #[test]
    fn channel_notifier_ignores_closed_receiver() {
        let (notifier, receiver) = ChannelNotifier::bounded(4);
        drop(receiver);
        notifier.publish(AlarmEvent {
            id: 1,
            lifecycle: Lifecycle::Disabled,
        });
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let first = RecordingNotifier::default();
        let second = RecordingNotifier::default();
        let fanout = FanoutNotifier::new(vec![Box::new(first.clone()), Box::new(second.clone())]);
        fanout.publish(AlarmEvent {
            id: 3,
            lifecycle: Lifecycle::PreAlarmFiring,
        });
        assert_eq!(first.take().len(), 1);
        assert_eq!(second.take().len(), 1);
    }

    #[test]
    fn events_serialize_with_flat_tag() {
        let event = AlarmEvent {
            id: 9,
            lifecycle: Lifecycle::Dismissed,
        };
        let json = serde_json::to_value(event).expect("serialize");
        assert_eq!(json["id"], 9);
        assert_eq!(json["event"], "dismissed");
    }
}
