use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::alarm::machine::{Event, MachineContext};
use crate::alarm::model::{AlarmId, AlarmRule, AlarmSettings, StoredAlarm, default_rules};
use crate::alarm::registry::{AlarmRegistry, Effects};
use crate::alarm::scheduler::Scheduler;
use crate::clock::{Clock, Zone};
use crate::error::AlarmError;
use crate::notify::Notifier;
use crate::store::AlarmStore;
use crate::wake::{WakeTimer, WakeToken};

/// The alarm engine: clock, settings, registry, scheduler and notifier wired
/// together. Every inbound trigger goes through one of its methods.
pub struct AlarmEngine {
    clock: Arc<dyn Clock>,
    settings: AlarmSettings,
    registry: AlarmRegistry,
    scheduler: Scheduler,
    notifier: Box<dyn Notifier>,
    last_now: Option<DateTime<Utc>>,
}

impl AlarmEngine {
    pub fn new(
        clock: Arc<dyn Clock>,
        settings: AlarmSettings,
        store: Box<dyn AlarmStore>,
        timer: Box<dyn WakeTimer>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            clock,
            settings,
            registry: AlarmRegistry::new(store),
            scheduler: Scheduler::new(timer),
            notifier,
            last_now: None,
        }
    }

    /// Loads persisted alarms, seeds the default set on a first start and
    /// arms everything.
    pub fn start(&mut self) -> Result<(), AlarmError> {
        let loaded = self.registry.load()?;
        info!(alarms = loaded, zone = %self.clock.zone(), "alarm records loaded");
        if loaded == 0 && self.registry.is_store_fresh() && self.settings.seed_defaults {
            for rule in default_rules() {
                let id = self.create(rule)?;
                debug!(id, "seeded default alarm");
            }
        }
        self.on_boot();
        Ok(())
    }

    pub fn create(&mut self, rule: AlarmRule) -> Result<AlarmId, AlarmError> {
        let now = self.observe_now();
        let ctx = MachineContext {
            now,
            zone: self.clock.zone(),
            settings: &self.settings,
        };
        let mut fx = Effects {
            scheduler: &mut self.scheduler,
            notifier: self.notifier.as_ref(),
        };
        self.registry.create(rule, &ctx, &mut fx)
    }

    pub fn update(&mut self, id: AlarmId, rule: AlarmRule) -> Result<(), AlarmError> {
        let now = self.observe_now();
        let ctx = MachineContext {
            now,
            zone: self.clock.zone(),
            settings: &self.settings,
        };
        let mut fx = Effects {
            scheduler: &mut self.scheduler,
            notifier: self.notifier.as_ref(),
        };
        self.registry.update(id, rule, &ctx, &mut fx).map(|_| ())
    }

    pub fn delete(&mut self, id: AlarmId) -> Result<(), AlarmError> {
        self.dispatch(id, Event::Delete)
    }

    pub fn enable(&mut self, id: AlarmId) -> Result<(), AlarmError> {
        self.dispatch(id, Event::Enable)
    }

    pub fn disable(&mut self, id: AlarmId) -> Result<(), AlarmError> {
        self.dispatch(id, Event::Disable)
    }

    pub fn snooze(&mut self, id: AlarmId, until: Option<DateTime<Utc>>) -> Result<(), AlarmError> {
        self.dispatch(id, Event::Snooze(until))
    }

    pub fn dismiss(&mut self, id: AlarmId) -> Result<(), AlarmError> {
        self.dispatch(id, Event::Dismiss)
    }

    pub fn skip(&mut self, id: AlarmId) -> Result<(), AlarmError> {
        self.dispatch(id, Event::Skip)
    }

    pub fn unskip(&mut self, id: AlarmId) -> Result<(), AlarmError> {
        self.dispatch(id, Event::Unskip)
    }

    pub fn on_boot(&mut self) {
        info!("boot: refreshing all alarms");
        let now = self.observe_now();
        self.refresh_at(now);
    }

    pub fn on_time_zone_changed(&mut self) {
        info!(zone = %self.clock.zone(), "time zone changed: refreshing all alarms");
        let now = self.observe_now();
        self.refresh_at(now);
    }

    /// A deliberate clock change. The new reading becomes the reference for
    /// anomaly detection instead of being reported as one.
    pub fn on_time_changed(&mut self) {
        let now = self.clock.now();
        info!(now = %now, "time changed: refreshing all alarms");
        self.last_now = Some(now);
        self.refresh_at(now);
    }

    /// Delivers every entry that came due on this wake, oldest first and by
    /// ascending id for equal instants.
    pub fn on_wake_timer_fired(&mut self, token: WakeToken) {
        let now = self.observe_now();
        let due = self.scheduler.on_external_fire(token, now);
        let ctx = MachineContext {
            now,
            zone: self.clock.zone(),
            settings: &self.settings,
        };
        let mut fx = Effects {
            scheduler: &mut self.scheduler,
            notifier: self.notifier.as_ref(),
        };
        for fire in due {
            debug!(id = fire.id, kind = ?fire.kind, at = %fire.instant, "delivering fire");
            match self.registry.dispatch(fire.id, Event::Fire(fire.kind), &ctx, &mut fx) {
                Ok(_) => {}
                Err(AlarmError::NotFound(id)) => warn!(id, "fire for unknown alarm ignored"),
                Err(err) => warn!(id = fire.id, error = %err, "fire delivery failed"),
            }
        }
        self.scheduler.finish_delivery();
    }

    pub fn alarms(&self) -> Vec<StoredAlarm> {
        self.registry.snapshot()
    }

    pub fn alarm(&self, id: AlarmId) -> Result<StoredAlarm, AlarmError> {
        self.registry.get(id).map(|machine| machine.to_stored())
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn settings(&self) -> &AlarmSettings {
        &self.settings
    }

    pub fn zone(&self) -> Zone {
        self.clock.zone()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn dispatch(&mut self, id: AlarmId, event: Event) -> Result<(), AlarmError> {
        let now = self.observe_now();
        let ctx = MachineContext {
            now,
            zone: self.clock.zone(),
            settings: &self.settings,
        };
        let mut fx = Effects {
            scheduler: &mut self.scheduler,
            notifier: self.notifier.as_ref(),
        };
        self.registry.dispatch(id, event, &ctx, &mut fx).map(|_| ())
    }

    fn refresh_at(&mut self, now: DateTime<Utc>) {
        let ctx = MachineContext {
            now,
            zone: self.clock.zone(),
            settings: &self.settings,
        };
        let mut fx = Effects {
            scheduler: &mut self.scheduler,
            notifier: self.notifier.as_ref(),
        };
        self.registry.refresh_all(&ctx, &mut fx);
    }

    /// Reads the clock. A reading earlier than the previous one means the
    /// clock was set back without notice; every alarm is recomputed before
    /// the caller continues.
    fn observe_now(&mut self) -> DateTime<Utc> {
        let now = self.clock.now();
        let previous = self.last_now.replace(now);
        if let Some(previous) = previous
            && now < previous
        {
            warn!(now = %now, previous = %previous, "clock moved backwards, refreshing all alarms");
            self.refresh_at(now);
        }
        now
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Weekday};

    use super::*;
    use crate::alarm::days::DaysOfWeek;
    use crate::alarm::machine::AlarmState;
    use crate::alarm::occurrence::OccurrenceKind;
    use crate::clock::ManualClock;
    use crate::notify::Lifecycle;
    use crate::notify::testing::RecordingNotifier;
    use crate::store::MemoryStore;
    use crate::wake::RecordingWakeTimer;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: MemoryStore,
        timer: RecordingWakeTimer,
        notifier: RecordingNotifier,
        engine: AlarmEngine,
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn fixture_with(store: MemoryStore, settings: AlarmSettings) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            utc(2026, 3, 1, 23, 0),
            Zone::Named(chrono_tz::UTC),
        ));
        let timer = RecordingWakeTimer::default();
        let notifier = RecordingNotifier::default();
        let mut engine = AlarmEngine::new(
            clock.clone(),
            settings,
            Box::new(store.clone()),
            Box::new(timer.clone()),
            Box::new(notifier.clone()),
        );
        engine.start().expect("start");
        Fixture {
            clock,
            store,
            timer,
            notifier,
            engine,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryStore::new(), AlarmSettings::default())
    }

    impl Fixture {
        /// Moves the clock to the armed wake instant and fires the timer.
        fn fire_next(&mut self) -> DateTime<Utc> {
            let (at, token) = self.timer.armed().expect("timer armed");
            self.clock.set(at);
            self.engine.on_wake_timer_fired(token);
            at
        }
    }

    fn mon_wed(hour: u32) -> AlarmRule {
        let days: DaysOfWeek = [Weekday::Mon, Weekday::Wed].into_iter().collect();
        AlarmRule::new(hour, 0).with_days(days).with_enabled(true)
    }

    #[test]
    fn fresh_store_seeds_disabled_defaults() {
        let f = fixture_with(MemoryStore::fresh(), AlarmSettings::default());
        let alarms = f.engine.alarms();
        assert_eq!(alarms.len(), 2);
        assert!(alarms.iter().all(|alarm| alarm.state == AlarmState::Disabled));
        assert_eq!(alarms[0].rule.days, DaysOfWeek::WEEKDAYS);
        assert_eq!((alarms[1].rule.hour, alarms[1].rule.minute), (9, 0));
        assert!(f.timer.armed().is_none());
        assert_eq!(f.store.records().len(), 2);
    }

    #[test]
    fn seeding_respects_setting() {
        let settings = AlarmSettings {
            seed_defaults: false,
            ..AlarmSettings::default()
        };
        let f = fixture_with(MemoryStore::fresh(), settings);
        assert!(f.engine.alarms().is_empty());
    }

    #[test]
    fn full_day_with_snooze_and_dismiss() {
        let mut f = fixture();
        let id = f.engine.create(mon_wed(7)).expect("create");
        assert_eq!(f.timer.armed().map(|(at, _)| at), Some(utc(2026, 3, 2, 7, 0)));

        let fired_at = f.fire_next();
        assert_eq!(f.engine.alarm(id).expect("alarm").state, AlarmState::MainFiring);
        f.engine.snooze(id, None).expect("snooze");
        assert_eq!(
            f.timer.armed().map(|(at, _)| at),
            Some(fired_at + chrono::Duration::minutes(10))
        );

        f.fire_next();
        f.clock.advance(chrono::Duration::minutes(1));
        f.engine.dismiss(id).expect("dismiss");
        let alarm = f.engine.alarm(id).expect("alarm");
        assert_eq!(alarm.state, AlarmState::Armed);
        assert_eq!(alarm.next_time, Some(utc(2026, 3, 4, 7, 0)));

        assert_eq!(
            f.notifier.lifecycles_for(id),
            vec![
                Lifecycle::Armed {
                    next: utc(2026, 3, 2, 7, 0)
                },
                Lifecycle::MainFiring,
                Lifecycle::Snoozed {
                    until: utc(2026, 3, 2, 7, 10)
                },
                Lifecycle::MainFiring,
                Lifecycle::Dismissed,
                Lifecycle::Armed {
                    next: utc(2026, 3, 4, 7, 0)
                },
            ]
        );
    }

    #[test]
    fn alarms_due_together_fire_by_ascending_id() {
        let mut f = fixture();
        let a = f.engine.create(mon_wed(7)).expect("create");
        let b = f.engine.create(mon_wed(7)).expect("create");
        f.notifier.take();
        f.fire_next();
        let fired = f
            .notifier
            .take()
            .into_iter()
            .filter(|event| event.lifecycle == Lifecycle::MainFiring)
            .map(|event| event.id)
            .collect::<Vec<_>>();
        assert_eq!(fired, vec![a, b]);
    }

    #[test]
    fn one_shot_fires_exactly_once() {
        let mut f = fixture();
        let id = f
            .engine
            .create(AlarmRule::new(0, 0).with_enabled(true))
            .expect("create");
        f.fire_next();
        f.engine.dismiss(id).expect("dismiss");
        assert_eq!(f.engine.alarm(id).expect("alarm").state, AlarmState::Disabled);
        assert!(f.timer.armed().is_none());

        f.clock.advance(chrono::Duration::days(3));
        f.engine.on_time_changed();
        let firings = f
            .notifier
            .lifecycles_for(id)
            .into_iter()
            .filter(|event| *event == Lifecycle::MainFiring)
            .count();
        assert_eq!(firings, 1);
    }

    #[test]
    fn pre_alarm_then_main_on_separate_wakes() {
        let mut f = fixture();
        let id = f
            .engine
            .create(mon_wed(7).with_pre_alarm(true))
            .expect("create");
        assert_eq!(f.fire_next(), utc(2026, 3, 2, 6, 30));
        assert_eq!(
            f.engine.alarm(id).expect("alarm").state,
            AlarmState::PreAlarmFiring
        );
        assert_eq!(f.fire_next(), utc(2026, 3, 2, 7, 0));
        assert_eq!(f.engine.alarm(id).expect("alarm").state, AlarmState::MainFiring);
    }

    #[test]
    fn disabled_alarm_never_fires_from_stale_wake() {
        let mut f = fixture();
        let id = f.engine.create(mon_wed(7)).expect("create");
        let (at, token) = f.timer.armed().expect("armed");
        f.engine.disable(id).expect("disable");
        f.clock.set(at);
        f.engine.on_wake_timer_fired(token);
        assert!(!f.notifier.lifecycles_for(id).contains(&Lifecycle::MainFiring));
    }

    #[test]
    fn backwards_clock_triggers_refresh() {
        let mut f = fixture();
        let id = f.engine.create(mon_wed(7)).expect("create");
        f.clock.set(utc(2026, 3, 2, 7, 30));
        f.engine.on_time_changed();
        assert_eq!(
            f.engine.scheduler().get(id).map(|fire| fire.instant),
            Some(utc(2026, 3, 4, 7, 0))
        );

        // Set back to Monday early morning without any notification. Enabling
        // an armed alarm changes nothing by itself, so only the refresh can
        // bring Monday's occurrence back.
        f.clock.set(utc(2026, 3, 2, 5, 0));
        f.engine.enable(id).expect("enable");
        assert_eq!(
            f.engine.scheduler().get(id).map(|fire| fire.instant),
            Some(utc(2026, 3, 2, 7, 0))
        );
    }

    #[test]
    fn zone_change_recomputes_wall_clock_instants() {
        let mut f = fixture();
        let id = f.engine.create(mon_wed(7)).expect("create");
        f.clock.set_zone(Zone::Named(chrono_tz::Europe::Berlin));
        f.engine.on_time_zone_changed();
        let fire = f.engine.scheduler().get(id).expect("pending");
        assert_eq!(fire.instant, utc(2026, 3, 2, 6, 0));
        assert_eq!(fire.kind, OccurrenceKind::Main);
    }

    #[test]
    fn restart_rearms_from_store() {
        let store = MemoryStore::new();
        let id = {
            let mut f = fixture_with(store.clone(), AlarmSettings::default());
            let id = f.engine.create(mon_wed(7)).expect("create");
            f.fire_next();
            id
        };
        assert_eq!(store.get(id).expect("stored").state, AlarmState::MainFiring);

        let f = fixture_with(store, AlarmSettings::default());
        let alarm = f.engine.alarm(id).expect("restored");
        assert_eq!(alarm.state, AlarmState::Armed);
        assert_eq!(f.timer.armed().map(|(at, _)| at), Some(utc(2026, 3, 2, 7, 0)));
    }

    #[test]
    fn skip_survives_restart_and_expires_once_passed() {
        let store = MemoryStore::new();
        let id = {
            let mut f = fixture_with(store.clone(), AlarmSettings::default());
            let id = f.engine.create(mon_wed(7)).expect("create");
            f.engine.skip(id).expect("skip");
            id
        };
        let stored = store.get(id).expect("stored");
        assert_eq!(stored.state, AlarmState::Skipping);
        assert_eq!(stored.skipped, Some(utc(2026, 3, 2, 7, 0)));

        let mut f = fixture_with(store, AlarmSettings::default());
        assert_eq!(f.engine.alarm(id).expect("alarm").state, AlarmState::Skipping);
        assert_eq!(f.timer.armed().map(|(at, _)| at), Some(utc(2026, 3, 4, 7, 0)));

        f.clock.set(utc(2026, 3, 2, 12, 0));
        f.engine.on_time_changed();
        let alarm = f.engine.alarm(id).expect("alarm");
        assert_eq!(alarm.state, AlarmState::Armed);
        assert_eq!(alarm.skipped, None);
        assert_eq!(f.timer.armed().map(|(at, _)| at), Some(utc(2026, 3, 4, 7, 0)));
    }

    #[test]
    fn invalid_requests_surface_errors() {
        let mut f = fixture();
        assert!(matches!(f.engine.enable(42), Err(AlarmError::NotFound(42))));
        let id = f.engine.create(mon_wed(7)).expect("create");
        assert!(matches!(
            f.engine.dismiss(id),
            Err(AlarmError::InvalidTransition { .. })
        ));
        assert!(matches!(
            f.engine.update(id, AlarmRule::new(30, 0)),
            Err(AlarmError::InvalidInput(_))
        ));
    }
}
