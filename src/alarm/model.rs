use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alarm::days::DaysOfWeek;
use crate::alarm::machine::AlarmState;
use crate::alarm::occurrence::OccurrenceKind;
use crate::error::AlarmError;

pub type AlarmId = u32;

/// User-editable configuration of one alarm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmRule {
    #[serde(default)]
    pub id: AlarmId,
    pub hour: u32,
    pub minute: u32,
    #[serde(default)]
    pub days: DaysOfWeek,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub pre_alarm: bool,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound_uri: Option<String>,
    #[serde(default = "default_vibrate")]
    pub vibrate: bool,
}

impl AlarmRule {
    pub fn new(hour: u32, minute: u32) -> Self {
        Self {
            id: 0,
            hour,
            minute,
            days: DaysOfWeek::NONE,
            enabled: false,
            pre_alarm: false,
            label: String::new(),
            sound_uri: None,
            vibrate: default_vibrate(),
        }
    }

    pub fn with_days(mut self, days: DaysOfWeek) -> Self {
        self.days = days;
        self
    }

    pub fn with_pre_alarm(mut self, pre_alarm: bool) -> Self {
        self.pre_alarm = pre_alarm;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn is_one_shot(&self) -> bool {
        !self.days.is_repeating()
    }

    pub fn time(&self) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0)
    }

    pub fn validate(&self) -> Result<(), AlarmError> {
        if self.hour > 23 {
            return Err(AlarmError::InvalidInput(format!(
                "hour must be within 0..=23, got {}",
                self.hour
            )));
        }
        if self.minute > 59 {
            return Err(AlarmError::InvalidInput(format!(
                "minute must be within 0..=59, got {}",
                self.minute
            )));
        }
        Ok(())
    }
}

/// Engine-wide settings, stored in the `settings` block of the alarm file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmSettings {
    /// Implicit snooze length; `None` disables snoozing without an explicit target.
    #[serde(default = "default_snooze_minutes")]
    pub snooze_minutes: Option<u32>,
    #[serde(default = "default_pre_alarm_minutes")]
    pub pre_alarm_minutes: u32,
    #[serde(default = "default_seed_defaults")]
    pub seed_defaults: bool,
}

impl Default for AlarmSettings {
    fn default() -> Self {
        Self {
            snooze_minutes: default_snooze_minutes(),
            pre_alarm_minutes: default_pre_alarm_minutes(),
            seed_defaults: default_seed_defaults(),
        }
    }
}

impl AlarmSettings {
    pub fn snooze_duration(&self) -> Option<chrono::Duration> {
        self.snooze_minutes
            .filter(|minutes| *minutes > 0)
            .map(|minutes| chrono::Duration::minutes(i64::from(minutes)))
    }

    pub fn pre_alarm_lead(&self) -> Option<chrono::Duration> {
        (self.pre_alarm_minutes > 0)
            .then(|| chrono::Duration::minutes(i64::from(self.pre_alarm_minutes)))
    }
}

/// What gets persisted per alarm: the rule plus enough lifecycle state to
/// rebuild the machine after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAlarm {
    #[serde(flatten)]
    pub rule: AlarmRule,
    #[serde(default)]
    pub state: AlarmState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_kind: Option<OccurrenceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snoozed_to: Option<DateTime<Utc>>,
    /// Main instant of the occurrence a skipping alarm passes over.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<DateTime<Utc>>,
}

impl StoredAlarm {
    pub fn from_rule(rule: AlarmRule) -> Self {
        Self {
            rule,
            state: AlarmState::Disabled,
            next_time: None,
            next_kind: None,
            snoozed_to: None,
            skipped: None,
        }
    }
}

/// Rules inserted on the very first start: weekday mornings and a later
/// weekend alarm, both left disabled.
pub fn default_rules() -> Vec<AlarmRule> {
    vec![
        AlarmRule::new(8, 30).with_days(DaysOfWeek::WEEKDAYS),
        AlarmRule::new(9, 0).with_days(DaysOfWeek::WEEKENDS),
    ]
}

fn default_vibrate() -> bool {
    true
}

fn default_snooze_minutes() -> Option<u32> {
    Some(10)
}

fn default_pre_alarm_minutes() -> u32 {
    30
}

fn default_seed_defaults() -> bool {
    true
}
