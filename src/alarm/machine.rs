use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::alarm::model::{AlarmId, AlarmRule, AlarmSettings, StoredAlarm};
use crate::alarm::occurrence::{Occurrence, OccurrenceKind, next_occurrence};
use crate::clock::Zone;
use crate::error::AlarmError;
use crate::notify::Lifecycle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    #[default]
    Disabled,
    Armed,
    /// Enabled repeating alarm that passes over its next occurrence.
    Skipping,
    PreAlarmFiring,
    MainFiring,
    Snoozed,
    /// Transient: a dismissed alarm is immediately re-armed or disabled.
    Dismissed,
}

impl AlarmState {
    pub fn name(self) -> &'static str {
        match self {
            AlarmState::Disabled => "disabled",
            AlarmState::Armed => "armed",
            AlarmState::Skipping => "skipping",
            AlarmState::PreAlarmFiring => "pre_alarm_firing",
            AlarmState::MainFiring => "main_firing",
            AlarmState::Snoozed => "snoozed",
            AlarmState::Dismissed => "dismissed",
        }
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Enable,
    Disable,
    Fire(OccurrenceKind),
    /// Snooze until the given instant, or for the configured duration.
    Snooze(Option<DateTime<Utc>>),
    Dismiss,
    TimeOrZoneChanged,
    Delete,
    Change(AlarmRule),
    Skip,
    Unskip,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Enable => "enable",
            Event::Disable => "disable",
            Event::Fire(OccurrenceKind::PreAlarm) => "fire(pre_alarm)",
            Event::Fire(OccurrenceKind::Main) => "fire(main)",
            Event::Snooze(_) => "snooze",
            Event::Dismiss => "dismiss",
            Event::TimeOrZoneChanged => "time_or_zone_changed",
            Event::Delete => "delete",
            Event::Change(_) => "change",
            Event::Skip => "skip",
            Event::Unskip => "unskip",
        }
    }
}

/// How the scheduler registration of one alarm must change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleChange {
    Unchanged,
    Register(DateTime<Utc>, OccurrenceKind),
    Cancel,
}

/// Result of applying one event. The registry turns it into scheduler,
/// notifier and store calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: AlarmState,
    pub to: AlarmState,
    pub schedule: ScheduleChange,
    pub notices: Vec<Lifecycle>,
    pub deleted: bool,
}

impl Transition {
    fn ignored(state: AlarmState) -> Self {
        Self {
            from: state,
            to: state,
            schedule: ScheduleChange::Unchanged,
            notices: Vec::new(),
            deleted: false,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.from == self.to
            && self.schedule == ScheduleChange::Unchanged
            && self.notices.is_empty()
            && !self.deleted
    }
}

/// Inputs every transition needs besides the event itself.
#[derive(Debug, Clone, Copy)]
pub struct MachineContext<'a> {
    pub now: DateTime<Utc>,
    pub zone: Zone,
    pub settings: &'a AlarmSettings,
}

#[derive(Debug, Clone)]
pub struct AlarmMachine {
    rule: AlarmRule,
    state: AlarmState,
    /// Main instant of the occurrence currently being tracked.
    occurrence: Option<DateTime<Utc>>,
    scheduled: Option<(DateTime<Utc>, OccurrenceKind)>,
    snoozed_to: Option<DateTime<Utc>>,
    /// Main instant passed over while skipping.
    skipped: Option<DateTime<Utc>>,
}

impl AlarmMachine {
    /// New machines start disabled regardless of `rule.enabled`.
    pub fn new(mut rule: AlarmRule) -> Self {
        rule.enabled = false;
        Self {
            rule,
            state: AlarmState::Disabled,
            occurrence: None,
            scheduled: None,
            snoozed_to: None,
            skipped: None,
        }
    }

    /// Rebuilds a machine from its persisted record without registering
    /// anything; the next refresh re-arms it. A ring cannot survive a restart,
    /// so firing states come back as armed.
    pub fn restore(stored: StoredAlarm) -> Self {
        let mut rule = stored.rule;
        let state = match stored.state {
            AlarmState::Disabled => AlarmState::Disabled,
            AlarmState::Skipping if stored.skipped.is_some() => AlarmState::Skipping,
            AlarmState::Snoozed if stored.snoozed_to.is_some() => AlarmState::Snoozed,
            _ if !rule.enabled => AlarmState::Disabled,
            _ => AlarmState::Armed,
        };
        rule.enabled = state != AlarmState::Disabled;
        Self {
            rule,
            state,
            occurrence: stored.next_time,
            scheduled: None,
            snoozed_to: stored.snoozed_to.filter(|_| state == AlarmState::Snoozed),
            skipped: stored.skipped.filter(|_| state == AlarmState::Skipping),
        }
    }

    pub fn id(&self) -> AlarmId {
        self.rule.id
    }

    pub fn rule(&self) -> &AlarmRule {
        &self.rule
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    pub fn scheduled(&self) -> Option<(DateTime<Utc>, OccurrenceKind)> {
        self.scheduled
    }

    pub fn occurrence(&self) -> Option<DateTime<Utc>> {
        self.occurrence
    }

    pub fn snoozed_to(&self) -> Option<DateTime<Utc>> {
        self.snoozed_to
    }

    pub fn skipped(&self) -> Option<DateTime<Utc>> {
        self.skipped
    }

    pub fn to_stored(&self) -> StoredAlarm {
        StoredAlarm {
            rule: self.rule.clone(),
            state: self.state,
            next_time: self.scheduled.map(|(at, _)| at).or(self.occurrence),
            next_kind: self.scheduled.map(|(_, kind)| kind),
            snoozed_to: self.snoozed_to,
            skipped: self.skipped,
        }
    }

    pub fn apply(
        &mut self,
        event: Event,
        ctx: &MachineContext<'_>,
    ) -> Result<Transition, AlarmError> {
        let from = self.state;
        let event_name = event.name();
        let outcome = match event {
            Event::Enable => Ok(self.on_enable(ctx)),
            Event::Disable => Ok(self.on_disable()),
            Event::Fire(kind) => Ok(self.on_fire(kind)),
            Event::Snooze(until) => self.on_snooze(until, ctx),
            Event::Dismiss => self.on_dismiss(ctx),
            Event::TimeOrZoneChanged => Ok(self.on_time_changed(ctx)),
            Event::Delete => Ok(self.on_delete()),
            Event::Change(rule) => self.on_change(rule, ctx),
            Event::Skip => self.on_skip(ctx),
            Event::Unskip => self.on_unskip(ctx),
        };
        let (schedule, notices, deleted) = match outcome {
            Ok(Some(effects)) => effects,
            Ok(None) => return Ok(Transition::ignored(from)),
            Err(Rejected::State) => {
                return Err(AlarmError::InvalidTransition {
                    id: self.rule.id,
                    state: from,
                    event: event_name,
                });
            }
            Err(Rejected::Input(reason)) => return Err(AlarmError::InvalidInput(reason)),
        };
        debug!(
            id = self.rule.id,
            event = event_name,
            from = %from,
            to = %self.state,
            "alarm transition"
        );
        Ok(Transition {
            from,
            to: self.state,
            schedule,
            notices,
            deleted,
        })
    }

    fn on_enable(&mut self, ctx: &MachineContext<'_>) -> Option<Effects> {
        if self.state != AlarmState::Disabled {
            return None;
        }
        Some(self.arm_after(ctx, ctx.now, Vec::new()))
    }

    fn on_disable(&mut self) -> Option<Effects> {
        if self.state == AlarmState::Disabled {
            return None;
        }
        Some(self.disable(Vec::new()))
    }

    fn on_fire(&mut self, kind: OccurrenceKind) -> Option<Effects> {
        match (self.state, kind) {
            (AlarmState::Armed | AlarmState::Skipping, OccurrenceKind::PreAlarm) => {
                self.state = AlarmState::PreAlarmFiring;
                self.skipped = None;
                // The main ring of this same occurrence is still ahead.
                let schedule = match self.occurrence {
                    Some(main) => {
                        self.scheduled = Some((main, OccurrenceKind::Main));
                        ScheduleChange::Register(main, OccurrenceKind::Main)
                    }
                    None => {
                        self.scheduled = None;
                        ScheduleChange::Cancel
                    }
                };
                Some((schedule, vec![Lifecycle::PreAlarmFiring], false))
            }
            (
                AlarmState::Armed
                | AlarmState::Skipping
                | AlarmState::PreAlarmFiring
                | AlarmState::Snoozed,
                OccurrenceKind::Main,
            ) => {
                self.state = AlarmState::MainFiring;
                self.scheduled = None;
                self.snoozed_to = None;
                self.skipped = None;
                Some((ScheduleChange::Cancel, vec![Lifecycle::MainFiring], false))
            }
            (state, kind) => {
                warn!(
                    id = self.rule.id,
                    state = %state,
                    kind = ?kind,
                    "ignoring fire for alarm that cannot ring now"
                );
                None
            }
        }
    }

    fn on_snooze(
        &mut self,
        until: Option<DateTime<Utc>>,
        ctx: &MachineContext<'_>,
    ) -> Result<Option<Effects>, Rejected> {
        if !matches!(
            self.state,
            AlarmState::PreAlarmFiring | AlarmState::MainFiring | AlarmState::Snoozed
        ) {
            return Err(Rejected::State);
        }
        let until = match until {
            Some(explicit) if explicit > ctx.now => explicit,
            Some(explicit) => {
                return Err(Rejected::Input(format!(
                    "snooze target {explicit} is not in the future"
                )));
            }
            None => match ctx.settings.snooze_duration() {
                Some(duration) => ctx.now + duration,
                None => {
                    return Err(Rejected::Input(
                        "snooze is disabled; pass an explicit target".to_string(),
                    ));
                }
            },
        };
        self.state = AlarmState::Snoozed;
        self.snoozed_to = Some(until);
        self.scheduled = Some((until, OccurrenceKind::Main));
        Ok(Some((
            ScheduleChange::Register(until, OccurrenceKind::Main),
            vec![Lifecycle::Snoozed { until }],
            false,
        )))
    }

    fn on_dismiss(&mut self, ctx: &MachineContext<'_>) -> Result<Option<Effects>, Rejected> {
        if !matches!(
            self.state,
            AlarmState::PreAlarmFiring | AlarmState::MainFiring | AlarmState::Snoozed
        ) {
            return Err(Rejected::State);
        }
        self.state = AlarmState::Dismissed;
        self.snoozed_to = None;
        let notices = vec![Lifecycle::Dismissed];
        if self.rule.is_one_shot() {
            return Ok(Some(self.disable(notices)));
        }
        // Dismissing a pre-alarm retires the whole occurrence, main ring included.
        let after = self
            .occurrence
            .map_or(ctx.now, |occurrence| occurrence.max(ctx.now));
        Ok(Some(self.arm_after(ctx, after, notices)))
    }

    fn on_time_changed(&mut self, ctx: &MachineContext<'_>) -> Option<Effects> {
        match self.state {
            AlarmState::Armed | AlarmState::Snoozed => Some(self.arm_after(ctx, ctx.now, Vec::new())),
            // Once the skipped occurrence is behind us the skip is spent.
            AlarmState::Skipping => match self.skipped {
                Some(skipped) if skipped > ctx.now => Some(self.skip_over(ctx, skipped)),
                _ => Some(self.arm_after(ctx, ctx.now, Vec::new())),
            },
            _ => None,
        }
    }

    fn on_delete(&mut self) -> Option<Effects> {
        self.rule.enabled = false;
        self.state = AlarmState::Disabled;
        self.occurrence = None;
        self.scheduled = None;
        self.snoozed_to = None;
        self.skipped = None;
        Some((ScheduleChange::Cancel, vec![Lifecycle::Deleted], true))
    }

    fn on_change(
        &mut self,
        rule: AlarmRule,
        ctx: &MachineContext<'_>,
    ) -> Result<Option<Effects>, Rejected> {
        let id = self.rule.id;
        let enabled = rule.enabled;
        self.rule = AlarmRule { id, ..rule };
        self.snoozed_to = None;
        if enabled {
            Ok(Some(self.arm_after(ctx, ctx.now, Vec::new())))
        } else if self.state == AlarmState::Disabled {
            self.rule.enabled = false;
            Ok(Some((ScheduleChange::Unchanged, Vec::new(), false)))
        } else {
            Ok(Some(self.disable(Vec::new())))
        }
    }

    fn on_skip(&mut self, ctx: &MachineContext<'_>) -> Result<Option<Effects>, Rejected> {
        if self.state != AlarmState::Armed || self.rule.is_one_shot() {
            return Err(Rejected::State);
        }
        let Some(skipped) = self.next_after(ctx, ctx.now).map(|occurrence| occurrence.main) else {
            warn!(id = self.rule.id, "no occurrence left to skip, disabling alarm");
            return Ok(Some(self.disable(Vec::new())));
        };
        Ok(Some(self.skip_over(ctx, skipped)))
    }

    fn on_unskip(&mut self, ctx: &MachineContext<'_>) -> Result<Option<Effects>, Rejected> {
        if self.state != AlarmState::Skipping {
            return Err(Rejected::State);
        }
        Ok(Some(self.arm_after(ctx, ctx.now, Vec::new())))
    }

    fn lead(&self, ctx: &MachineContext<'_>) -> Option<chrono::Duration> {
        ctx.settings.pre_alarm_lead()
    }

    fn next_after(&self, ctx: &MachineContext<'_>, after: DateTime<Utc>) -> Option<Occurrence> {
        next_occurrence(&self.rule, after, ctx.now, ctx.zone, self.lead(ctx))
    }

    fn arm_after(
        &mut self,
        ctx: &MachineContext<'_>,
        after: DateTime<Utc>,
        mut notices: Vec<Lifecycle>,
    ) -> Effects {
        let Some(occurrence) = self.next_after(ctx, after) else {
            warn!(id = self.rule.id, "no future occurrence found, disabling alarm");
            return self.disable(notices);
        };
        self.state = AlarmState::Armed;
        self.rule.enabled = true;
        self.snoozed_to = None;
        self.skipped = None;
        notices.push(Lifecycle::Armed {
            next: occurrence.main,
        });
        (self.track(occurrence), notices, false)
    }

    /// Arms for the first occurrence after `skipped`.
    fn skip_over(&mut self, ctx: &MachineContext<'_>, skipped: DateTime<Utc>) -> Effects {
        let Some(occurrence) = self.next_after(ctx, skipped) else {
            warn!(id = self.rule.id, "no occurrence left to skip to, disabling alarm");
            return self.disable(Vec::new());
        };
        self.state = AlarmState::Skipping;
        self.rule.enabled = true;
        self.snoozed_to = None;
        self.skipped = Some(skipped);
        let notices = vec![Lifecycle::Skipping {
            next: occurrence.main,
        }];
        (self.track(occurrence), notices, false)
    }

    fn track(&mut self, occurrence: Occurrence) -> ScheduleChange {
        let (at, kind) = occurrence.first();
        self.occurrence = Some(occurrence.main);
        self.scheduled = Some((at, kind));
        ScheduleChange::Register(at, kind)
    }

    fn disable(&mut self, mut notices: Vec<Lifecycle>) -> Effects {
        self.state = AlarmState::Disabled;
        self.rule.enabled = false;
        self.occurrence = None;
        self.scheduled = None;
        self.snoozed_to = None;
        self.skipped = None;
        notices.push(Lifecycle::Disabled);
        (ScheduleChange::Cancel, notices, false)
    }
}

type Effects = (ScheduleChange, Vec<Lifecycle>, bool);

enum Rejected {
    State,
    Input(String),
}
