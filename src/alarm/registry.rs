use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use crate::alarm::machine::{AlarmMachine, Event, MachineContext, ScheduleChange, Transition};
use crate::alarm::model::{AlarmId, AlarmRule, StoredAlarm};
use crate::alarm::scheduler::Scheduler;
use crate::error::AlarmError;
use crate::notify::{AlarmEvent, Notifier};
use crate::store::AlarmStore;

/// Collaborators a transition's side effects are applied to.
pub struct Effects<'a> {
    pub scheduler: &'a mut Scheduler,
    pub notifier: &'a dyn Notifier,
}

/// Owns every alarm machine and mirrors each change into the store.
///
/// Store failures never undo an in-memory change: the affected ids stay
/// dirty and are written again on the next mutation.
pub struct AlarmRegistry {
    alarms: BTreeMap<AlarmId, AlarmMachine>,
    store: Box<dyn AlarmStore>,
    unsaved: BTreeSet<AlarmId>,
    unremoved: BTreeSet<AlarmId>,
    /// Largest id ever handed out or restored.
    last_id: AlarmId,
}

impl AlarmRegistry {
    pub fn new(store: Box<dyn AlarmStore>) -> Self {
        Self {
            alarms: BTreeMap::new(),
            store,
            unsaved: BTreeSet::new(),
            unremoved: BTreeSet::new(),
            last_id: 0,
        }
    }

    /// Loads every record from the store. Nothing is registered with the
    /// scheduler until the next refresh.
    pub fn load(&mut self) -> Result<usize, AlarmError> {
        let records = self.store.load_all()?;
        let count = records.len();
        self.restore(records);
        Ok(count)
    }

    pub fn restore(&mut self, records: impl IntoIterator<Item = StoredAlarm>) {
        for record in records {
            let machine = AlarmMachine::restore(record);
            let id = machine.id();
            self.last_id = self.last_id.max(id);
            self.alarms.insert(id, machine);
        }
    }

    pub fn is_store_fresh(&self) -> bool {
        self.store.is_fresh()
    }

    pub fn is_empty(&self) -> bool {
        self.alarms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.alarms.len()
    }

    /// Adds a new alarm. It starts disabled and is enabled right away when the
    /// rule asks for it.
    pub fn create(
        &mut self,
        rule: AlarmRule,
        ctx: &MachineContext<'_>,
        fx: &mut Effects<'_>,
    ) -> Result<AlarmId, AlarmError> {
        rule.validate()?;
        let enable = rule.enabled;
        let id = self.last_id.checked_add(1).ok_or_else(|| {
            AlarmError::InvalidInput(format!("no alarm id left above {}", self.last_id))
        })?;
        self.last_id = id;
        self.alarms
            .insert(id, AlarmMachine::new(AlarmRule { id, ..rule }));
        self.unsaved.insert(id);
        info!(id, "alarm created");
        if enable {
            self.dispatch(id, Event::Enable, ctx, fx)?;
        } else {
            self.flush();
        }
        Ok(id)
    }

    pub fn update(
        &mut self,
        id: AlarmId,
        rule: AlarmRule,
        ctx: &MachineContext<'_>,
        fx: &mut Effects<'_>,
    ) -> Result<Transition, AlarmError> {
        rule.validate()?;
        self.dispatch(id, Event::Change(rule), ctx, fx)
    }

    pub fn delete(
        &mut self,
        id: AlarmId,
        ctx: &MachineContext<'_>,
        fx: &mut Effects<'_>,
    ) -> Result<(), AlarmError> {
        self.dispatch(id, Event::Delete, ctx, fx).map(|_| ())
    }

    pub fn get(&self, id: AlarmId) -> Result<&AlarmMachine, AlarmError> {
        self.alarms.get(&id).ok_or(AlarmError::NotFound(id))
    }

    pub fn ids(&self) -> Vec<AlarmId> {
        self.alarms.keys().copied().collect()
    }

    pub fn snapshot(&self) -> Vec<StoredAlarm> {
        self.alarms.values().map(AlarmMachine::to_stored).collect()
    }

    /// Routes one event to its machine and applies the resulting transition:
    /// scheduler first, then notifications, then the store.
    pub fn dispatch(
        &mut self,
        id: AlarmId,
        event: Event,
        ctx: &MachineContext<'_>,
        fx: &mut Effects<'_>,
    ) -> Result<Transition, AlarmError> {
        let machine = self.alarms.get_mut(&id).ok_or(AlarmError::NotFound(id))?;
        let rule_changed = matches!(event, Event::Change(_));
        let transition = machine.apply(event, ctx)?;

        match transition.schedule {
            ScheduleChange::Register(instant, kind) => fx.scheduler.register(id, instant, kind),
            ScheduleChange::Cancel => fx.scheduler.cancel(id),
            ScheduleChange::Unchanged => {}
        }
        for lifecycle in &transition.notices {
            fx.notifier.publish(AlarmEvent {
                id,
                lifecycle: *lifecycle,
            });
        }

        if transition.deleted {
            self.alarms.remove(&id);
            self.unsaved.remove(&id);
            self.unremoved.insert(id);
        } else if rule_changed || !transition.is_noop() {
            self.unsaved.insert(id);
        }
        self.flush();
        Ok(transition)
    }

    /// Sends `TimeOrZoneChanged` to every alarm in ascending id order.
    pub fn refresh_all(&mut self, ctx: &MachineContext<'_>, fx: &mut Effects<'_>) {
        for id in self.ids() {
            if let Err(err) = self.dispatch(id, Event::TimeOrZoneChanged, ctx, fx) {
                warn!(id, error = %err, "failed to refresh alarm");
            }
        }
    }

    /// Number of records still waiting for a successful write or removal.
    pub fn dirty_count(&self) -> usize {
        self.unsaved.len() + self.unremoved.len()
    }

    fn flush(&mut self) {
        let removals = std::mem::take(&mut self.unremoved);
        for id in removals {
            if let Err(err) = self.store.remove(id) {
                warn!(id, error = %err, "failed to remove alarm record, will retry");
                self.unremoved.insert(id);
            }
        }

        let saves = std::mem::take(&mut self.unsaved);
        for id in saves {
            let Some(machine) = self.alarms.get(&id) else {
                continue;
            };
            if let Err(err) = self.store.save(&machine.to_stored()) {
                warn!(id, error = %err, "failed to persist alarm record, will retry");
                self.unsaved.insert(id);
            }
        }
    }
}
