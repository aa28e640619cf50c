use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::alarm::model::AlarmId;
use crate::alarm::occurrence::OccurrenceKind;
use crate::wake::{WakeTimer, WakeToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFire {
    pub instant: DateTime<Utc>,
    pub kind: OccurrenceKind,
}

/// A pending entry that came due on a wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueFire {
    pub id: AlarmId,
    pub instant: DateTime<Utc>,
    pub kind: OccurrenceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArmedWake {
    instant: DateTime<Utc>,
    token: WakeToken,
}

/// Keeps at most one entry per alarm and exactly one wake timer armed at the
/// earliest of them (none when nothing is pending).
pub struct Scheduler {
    pending: BTreeMap<AlarmId, PendingFire>,
    armed: Option<ArmedWake>,
    next_token: u64,
    delivering: bool,
    timer: Box<dyn WakeTimer>,
}

impl Scheduler {
    pub fn new(timer: Box<dyn WakeTimer>) -> Self {
        Self {
            pending: BTreeMap::new(),
            armed: None,
            next_token: 1,
            delivering: false,
            timer,
        }
    }

    pub fn register(&mut self, id: AlarmId, instant: DateTime<Utc>, kind: OccurrenceKind) {
        self.pending.insert(id, PendingFire { instant, kind });
        self.rearm();
    }

    pub fn cancel(&mut self, id: AlarmId) {
        if self.pending.remove(&id).is_some() {
            self.rearm();
        }
    }

    /// Handles a wake. Returns every entry due at `now`, ordered by instant
    /// then id; a token from an older arm yields nothing. Until
    /// [`Scheduler::finish_delivery`] is called, registrations only update the
    /// pending set.
    pub fn on_external_fire(&mut self, token: WakeToken, now: DateTime<Utc>) -> Vec<DueFire> {
        if self.armed.map(|armed| armed.token) != Some(token) {
            debug!(%token, "ignoring stale wake");
            return Vec::new();
        }
        self.armed = None;
        self.delivering = true;

        let due_ids = self
            .pending
            .iter()
            .filter(|(_, fire)| fire.instant <= now)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        let mut due = due_ids
            .into_iter()
            .filter_map(|id| {
                self.pending.remove(&id).map(|fire| DueFire {
                    id,
                    instant: fire.instant,
                    kind: fire.kind,
                })
            })
            .collect::<Vec<_>>();
        due.sort_by(|a, b| a.instant.cmp(&b.instant).then_with(|| a.id.cmp(&b.id)));
        due
    }

    pub fn finish_delivery(&mut self) {
        self.delivering = false;
        self.rearm();
    }

    pub fn armed_instant(&self) -> Option<DateTime<Utc>> {
        self.armed.map(|armed| armed.instant)
    }

    pub fn armed_token(&self) -> Option<WakeToken> {
        self.armed.map(|armed| armed.token)
    }

    pub fn get(&self, id: AlarmId) -> Option<PendingFire> {
        self.pending.get(&id).copied()
    }

    pub fn pending(&self) -> Vec<(AlarmId, PendingFire)> {
        self.pending.iter().map(|(id, fire)| (*id, *fire)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn earliest(&self) -> Option<DateTime<Utc>> {
        self.pending.values().map(|fire| fire.instant).min()
    }

    fn rearm(&mut self) {
        if self.delivering {
            return;
        }
        match (self.earliest(), self.armed) {
            (None, None) => {}
            (None, Some(armed)) => {
                self.timer.disarm(armed.token);
                self.armed = None;
            }
            (Some(instant), Some(armed)) if armed.instant == instant => {}
            (Some(instant), previous) => {
                if let Some(previous) = previous {
                    self.timer.disarm(previous.token);
                }
                let token = WakeToken(self.next_token);
                self.next_token += 1;
                self.timer.arm(instant, token);
                self.armed = Some(ArmedWake { instant, token });
            }
        }
    }
}
