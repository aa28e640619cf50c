use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use chrono::{DateTime, FixedOffset, Local, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Zone used to turn absolute instants into wall-clock dates and back.
///
/// `System` follows the host's configured zone on every call, so a zone
/// change on the device is picked up by the next computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    System,
    Named(Tz),
    Fixed(FixedOffset),
}

impl Zone {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("local") {
            return Ok(Zone::System);
        }
        if let Some(offset) = trimmed.strip_prefix("UTC").filter(|rest| !rest.is_empty()) {
            return parse_fixed_offset(offset).map(Zone::Fixed);
        }
        if trimmed.starts_with(['+', '-']) {
            return parse_fixed_offset(trimmed).map(Zone::Fixed);
        }
        trimmed
            .parse::<Tz>()
            .map(Zone::Named)
            .map_err(|err| anyhow!("unknown timezone '{trimmed}': {err}"))
    }

    pub fn local_datetime(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        match self {
            Zone::System => instant.with_timezone(&Local).naive_local(),
            Zone::Named(tz) => instant.with_timezone(tz).naive_local(),
            Zone::Fixed(offset) => instant.with_timezone(offset).naive_local(),
        }
    }

    /// Resolves a wall-clock time to an instant. Times inside a DST gap do not
    /// exist and yield `None`; ambiguous times pick the earlier instant.
    pub fn resolve(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            Zone::System => resolve_local_datetime(&Local, naive),
            Zone::Named(tz) => resolve_local_datetime(tz, naive),
            Zone::Fixed(offset) => resolve_local_datetime(offset, naive),
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Zone::System => f.write_str("system local"),
            Zone::Named(tz) => write!(f, "{}", tz.name()),
            Zone::Fixed(offset) => write!(f, "UTC{offset}"),
        }
    }
}

/// Parses `+HH:MM`, `-HH:MM` or `+HH`.
fn parse_fixed_offset(input: &str) -> Result<FixedOffset> {
    let invalid = || anyhow!("invalid UTC offset '{input}', expected +HH:MM or -HH:MM");
    let (sign, rest) = match input.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

fn resolve_local_datetime<Z>(timezone: &Z, naive: NaiveDateTime) -> Option<DateTime<Utc>>
where
    Z: TimeZone,
{
    match timezone.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(first, _second) => Some(first.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn zone(&self) -> Zone;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    fn zone(&self) -> Zone {
        (**self).zone()
    }
}

pub struct SystemClock {
    zone: Zone,
}

impl SystemClock {
    pub fn new(zone: Zone) -> Self {
        Self { zone }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn zone(&self) -> Zone {
        self.zone
    }
}

/// Clock that only moves when told to. Used by tests and by the schedule
/// report, which evaluates every alarm against a single frozen instant.
pub struct ManualClock {
    state: Mutex<(DateTime<Utc>, Zone)>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>, zone: Zone) -> Self {
        Self {
            state: Mutex::new((now, zone)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.lock().0 = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.lock();
        guard.0 += by;
    }

    pub fn set_zone(&self, zone: Zone) {
        self.lock().1 = zone;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, (DateTime<Utc>, Zone)> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().0
    }

    fn zone(&self) -> Zone {
        self.lock().1
    }
}
