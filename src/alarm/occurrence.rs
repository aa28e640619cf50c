use chrono::{DateTime, Datelike, Days, Utc};
use serde::{Deserialize, Serialize};

use crate::alarm::model::AlarmRule;
use crate::clock::Zone;

/// Repeating rules scan two weeks so a weekday whose time falls in a DST gap
/// still finds the following week's slot.
const REPEATING_SCAN_DAYS: u64 = 14;
/// One-shot rules fire today or tomorrow; the third day covers a DST gap tomorrow.
const ONE_SHOT_SCAN_DAYS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccurrenceKind {
    PreAlarm,
    Main,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub main: DateTime<Utc>,
    pub pre_alarm: Option<DateTime<Utc>>,
}

impl Occurrence {
    /// The instant the scheduler should wake for first.
    pub fn first(&self) -> (DateTime<Utc>, OccurrenceKind) {
        match self.pre_alarm {
            Some(pre) => (pre, OccurrenceKind::PreAlarm),
            None => (self.main, OccurrenceKind::Main),
        }
    }
}

/// Earliest main instant of `rule` strictly after `after`.
pub fn next_main_instant(
    rule: &AlarmRule,
    after: DateTime<Utc>,
    zone: Zone,
) -> Option<DateTime<Utc>> {
    let time_local = rule.time()?;
    let today = zone.local_datetime(after).date();
    let scan_days = if rule.days.is_repeating() {
        REPEATING_SCAN_DAYS
    } else {
        ONE_SHOT_SCAN_DAYS
    };

    for day_offset in 0..scan_days {
        let date = today.checked_add_days(Days::new(day_offset))?;
        if rule.days.is_repeating() && !rule.days.contains(date.weekday()) {
            continue;
        }
        let candidate = match zone.resolve(date.and_time(time_local)) {
            Some(value) => value,
            None => continue,
        };
        if candidate > after {
            return Some(candidate);
        }
    }

    None
}

/// Next occurrence after `after`. The pre-alarm sits `lead` before the main
/// instant and is dropped when it would not be in the future relative to `now`.
pub fn next_occurrence(
    rule: &AlarmRule,
    after: DateTime<Utc>,
    now: DateTime<Utc>,
    zone: Zone,
    lead: Option<chrono::Duration>,
) -> Option<Occurrence> {
    let main = next_main_instant(rule, after, zone)?;
    let pre_alarm = if rule.pre_alarm {
        lead.map(|lead| main - lead).filter(|pre| *pre > now)
    } else {
        None
    };
    Some(Occurrence { main, pre_alarm })
}
