use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::alarm::model::StoredAlarm;
use crate::alarm::occurrence::OccurrenceKind;
use crate::clock::{Clock, SystemClock, Zone};
use crate::engine::AlarmEngine;
use crate::notify::LogNotifier;
use crate::store::{MemoryStore, load_alarm_file};
use crate::wake::RecordingWakeTimer;

/// Loads `path`, arms every alarm against the current time without touching
/// the file, and prints the resulting schedule.
pub fn run_check(path: &Path, zone: Zone) -> Result<()> {
    let file = load_alarm_file(path).with_context(|| format!("failed to load {}", path.display()))?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(zone));
    let mut engine = AlarmEngine::new(
        clock,
        file.settings,
        Box::new(MemoryStore::with_records(file.alarms)),
        Box::new(RecordingWakeTimer::default()),
        Box::new(LogNotifier),
    );
    engine.start().context("failed to evaluate alarms")?;
    print!("{}", render_schedule_report(&engine));
    Ok(())
}

pub fn render_schedule_report(engine: &AlarmEngine) -> String {
    let zone = engine.zone();
    let alarms = engine.alarms();
    let settings = engine.settings();
    let mut out = String::new();

    let _ = writeln!(out, "Alarm schedule report");
    let _ = writeln!(out, "  now:        {}", format_instant(engine.now(), zone));
    let _ = writeln!(out, "  timezone:   {zone}");
    let _ = writeln!(
        out,
        "  snooze:     {}",
        settings
            .snooze_minutes
            .filter(|minutes| *minutes > 0)
            .map_or_else(|| "disabled".to_string(), |minutes| format!("{minutes} min"))
    );
    let _ = writeln!(out, "  pre-alarm:  {} min", settings.pre_alarm_minutes);
    let _ = writeln!(out, "  alarms:     {}", alarms.len());

    for alarm in &alarms {
        let _ = writeln!(out, "  {}", describe_alarm(alarm, zone));
    }

    match engine.scheduler().armed_instant() {
        Some(instant) => {
            let _ = writeln!(out, "  next wake:  {}", format_instant(instant, zone));
        }
        None => {
            let _ = writeln!(out, "  next wake:  none");
        }
    }
    out
}

fn describe_alarm(alarm: &StoredAlarm, zone: Zone) -> String {
    let rule = &alarm.rule;
    let mut line = format!(
        "#{:<3} {:02}:{:02}  {:<28} {:<16}",
        rule.id,
        rule.hour,
        rule.minute,
        rule.days.to_string(),
        alarm.state.to_string()
    );
    if let Some(next) = alarm.next_time {
        let kind = match alarm.next_kind {
            Some(OccurrenceKind::PreAlarm) => " (pre-alarm)",
            _ => "",
        };
        let _ = write!(line, " next {}{kind}", format_instant(next, zone));
    }
    if !rule.label.is_empty() {
        let _ = write!(line, "  \"{}\"", rule.label);
    }
    line.trim_end().to_string()
}

fn format_instant(instant: DateTime<Utc>, zone: Zone) -> String {
    zone.local_datetime(instant)
        .format("%a %Y-%m-%d %H:%M")
        .to_string()
}
