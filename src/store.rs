use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::alarm::model::{AlarmId, AlarmSettings, StoredAlarm};
use crate::error::StoreError;

pub const ALARM_FILE_VERSION: u32 = 1;

/// Durable home of the alarm records. Failures are reported to the caller,
/// which keeps its in-memory state and retries on a later mutation.
pub trait AlarmStore: Send {
    fn load_all(&mut self) -> Result<Vec<StoredAlarm>, StoreError>;
    fn save(&mut self, record: &StoredAlarm) -> Result<(), StoreError>;
    fn remove(&mut self, id: AlarmId) -> Result<(), StoreError>;

    /// True when the store has never held any data (first start).
    fn is_fresh(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmFile {
    pub version: u32,
    #[serde(default)]
    pub settings: AlarmSettings,
    #[serde(default)]
    pub alarms: Vec<StoredAlarm>,
}

impl Default for AlarmFile {
    fn default() -> Self {
        Self {
            version: ALARM_FILE_VERSION,
            settings: AlarmSettings::default(),
            alarms: Vec::new(),
        }
    }
}

pub fn load_alarm_file(path: &Path) -> Result<AlarmFile> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read alarm file {}", path.display()))?;
    Ok(parse_alarm_file_text(&content)?)
}

/// Parses and validates an alarm file. Records without an id (or id 0) get
/// fresh ids above the largest one present.
pub fn parse_alarm_file_text(content: &str) -> Result<AlarmFile, StoreError> {
    let mut file = serde_json::from_str::<AlarmFile>(content)?;
    if file.version != ALARM_FILE_VERSION {
        return Err(StoreError::Format(format!(
            "unsupported alarm file version {}; expected version {ALARM_FILE_VERSION}",
            file.version
        )));
    }

    let mut ids = HashSet::new();
    for alarm in &file.alarms {
        let id = alarm.rule.id;
        if id != 0 && !ids.insert(id) {
            return Err(StoreError::Format(format!("duplicate alarm id found: {id}")));
        }
        alarm
            .rule
            .validate()
            .map_err(|err| StoreError::Format(format!("alarm {id}: {err}")))?;
    }

    let mut last_id = ids.iter().copied().max().unwrap_or(0);
    for alarm in file.alarms.iter_mut().filter(|alarm| alarm.rule.id == 0) {
        last_id = last_id.checked_add(1).ok_or_else(|| {
            StoreError::Format(format!("no alarm id left above {last_id}"))
        })?;
        alarm.rule.id = last_id;
    }
    Ok(file)
}

/// Store backed by one versioned JSON document. Every mutation rewrites the
/// whole file through a temp file and a rename.
pub struct JsonFileStore {
    path: PathBuf,
    settings: AlarmSettings,
    records: BTreeMap<AlarmId, StoredAlarm>,
    fresh: bool,
}

impl JsonFileStore {
    /// Opens `path`; a missing file is a fresh, empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (file, fresh) = if path.exists() {
            let file = load_alarm_file(&path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            (file, false)
        } else {
            (AlarmFile::default(), true)
        };
        Ok(Self {
            path,
            settings: file.settings,
            records: file
                .alarms
                .into_iter()
                .map(|alarm| (alarm.rule.id, alarm))
                .collect(),
            fresh,
        })
    }

    pub fn settings(&self) -> AlarmSettings {
        self.settings
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&mut self) -> Result<(), StoreError> {
        let file = AlarmFile {
            version: ALARM_FILE_VERSION,
            settings: self.settings,
            alarms: self.records.values().cloned().collect(),
        };
        let text = serde_json::to_string_pretty(&file)?;
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        fs::write(&temp, format!("{text}\n"))?;
        fs::rename(&temp, &self.path)?;
        self.fresh = false;
        debug!(path = %self.path.display(), alarms = self.records.len(), "alarm file written");
        Ok(())
    }
}

impl AlarmStore for JsonFileStore {
    fn load_all(&mut self) -> Result<Vec<StoredAlarm>, StoreError> {
        Ok(self.records.values().cloned().collect())
    }

    fn save(&mut self, record: &StoredAlarm) -> Result<(), StoreError> {
        self.records.insert(record.rule.id, record.clone());
        self.write()
    }

    fn remove(&mut self, id: AlarmId) -> Result<(), StoreError> {
        let Some(record) = self.records.remove(&id) else {
            return Ok(());
        };
        // Keep the record until the file no longer holds it, so a retry writes again.
        if let Err(err) = self.write() {
            self.records.insert(id, record);
            return Err(err);
        }
        Ok(())
    }

    fn is_fresh(&self) -> bool {
        self.fresh
    }
}

/// In-memory store. Clones share the same records, so a test can keep a
/// handle while the engine owns the boxed store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<BTreeMap<AlarmId, StoredAlarm>>>,
    failing: Arc<AtomicBool>,
    fresh: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh() -> Self {
        Self {
            fresh: true,
            ..Self::default()
        }
    }

    pub fn with_records(records: impl IntoIterator<Item = StoredAlarm>) -> Self {
        let store = Self::default();
        store
            .lock()
            .extend(records.into_iter().map(|record| (record.rule.id, record)));
        store
    }

    /// Makes every later write fail with an I/O error until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<StoredAlarm> {
        self.lock().values().cloned().collect()
    }

    pub fn get(&self, id: AlarmId) -> Option<StoredAlarm> {
        self.lock().get(&id).cloned()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("store unavailable")));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<AlarmId, StoredAlarm>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AlarmStore for MemoryStore {
    fn load_all(&mut self) -> Result<Vec<StoredAlarm>, StoreError> {
        Ok(self.records())
    }

    fn save(&mut self, record: &StoredAlarm) -> Result<(), StoreError> {
        self.check()?;
        self.lock().insert(record.rule.id, record.clone());
        Ok(())
    }

    fn remove(&mut self, id: AlarmId) -> Result<(), StoreError> {
        self.check()?;
        self.lock().remove(&id);
        Ok(())
    }

    fn is_fresh(&self) -> bool {
        self.fresh && self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::alarm::days::DaysOfWeek;
    use crate::alarm::machine::AlarmState;
    use crate::alarm::model::AlarmRule;

    #[test]
    fn parses_valid_alarm_file() {
        let json = r#"
        {
          "version": 1,
          "settings": { "snooze_minutes": 5 },
          "alarms": [
            { "id": 3, "hour": 7, "minute": 0, "days": ["Mon", "Wed"], "enabled": true },
            { "hour": 6, "minute": 30, "label": "flight" }
          ]
        }
        "#;
        let file = parse_alarm_file_text(json).expect("valid file");
        assert_eq!(file.settings.snooze_minutes, Some(5));
        assert_eq!(file.settings.pre_alarm_minutes, 30);
        assert_eq!(file.alarms.len(), 2);
        assert_eq!(file.alarms[0].rule.days.bits(), 0b101);
        assert_eq!(file.alarms[1].rule.id, 4);
        assert_eq!(file.alarms[1].state, AlarmState::Disabled);
    }

    #[test]
    fn rejects_malformed_json_with_position() {
        let err = parse_alarm_file_text("{ \"version\": 1,").expect_err("truncated");
        assert!(err.to_string().contains("invalid JSON at line 1"));
    }

    #[test]
    fn rejects_unknown_version() {
        let err = parse_alarm_file_text(r#"{ "version": 2, "alarms": [] }"#).expect_err("v2");
        assert!(err.to_string().contains("unsupported alarm file version 2"));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let json = r#"{ "version": 1, "alarms": [
            { "id": 1, "hour": 7, "minute": 0 },
            { "id": 1, "hour": 8, "minute": 0 }
        ] }"#;
        let err = parse_alarm_file_text(json).expect_err("duplicate");
        assert!(err.to_string().contains("duplicate alarm id found: 1"));
    }

    #[test]
    fn exhausted_id_space_is_a_format_error() {
        let json = r#"{ "version": 1, "alarms": [
            { "id": 4294967295, "hour": 7, "minute": 0 },
            { "hour": 8, "minute": 0 }
        ] }"#;
        let err = parse_alarm_file_text(json).expect_err("no id left");
        assert!(matches!(err, StoreError::Format(_)));
        assert!(err.to_string().contains("no alarm id left"));

        let json = r#"{ "version": 1, "alarms": [ { "id": 4294967295, "hour": 7, "minute": 0 } ] }"#;
        let file = parse_alarm_file_text(json).expect("largest id alone is fine");
        assert_eq!(file.alarms[0].rule.id, AlarmId::MAX);
    }

    #[test]
    fn rejects_out_of_range_time() {
        let json = r#"{ "version": 1, "alarms": [ { "id": 1, "hour": 25, "minute": 0 } ] }"#;
        let err = parse_alarm_file_text(json).expect_err("hour 25");
        assert!(err.to_string().contains("alarm 1"));
    }

    #[test]
    fn rejects_unknown_weekday_token() {
        let json = r#"{ "version": 1, "alarms": [ { "id": 1, "hour": 7, "minute": 0, "days": ["Funday"] } ] }"#;
        assert!(parse_alarm_file_text(json).is_err());
    }

    #[test]
    fn missing_file_opens_fresh() {
        let dir = tempdir().expect("tempdir");
        let mut store = JsonFileStore::open(dir.path().join("alarms.json")).expect("open");
        assert!(store.is_fresh());
        assert!(store.load_all().expect("load").is_empty());
    }

    #[test]
    fn json_store_persists_across_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("alarms.json");
        let mut store = JsonFileStore::open(&path).expect("open");

        let mut record = StoredAlarm::from_rule(AlarmRule {
            id: 1,
            ..AlarmRule::new(7, 0).with_days(DaysOfWeek::WEEKDAYS)
        });
        record.state = AlarmState::Skipping;
        store.save(&record).expect("save");
        store
            .save(&StoredAlarm::from_rule(AlarmRule {
                id: 2,
                ..AlarmRule::new(9, 0)
            }))
            .expect("save second");
        store.remove(2).expect("remove");
        assert!(!store.is_fresh());
        assert!(!path.with_extension("json.tmp").exists());

        let mut reopened = JsonFileStore::open(&path).expect("reopen");
        let records = reopened.load_all().expect("load");
        assert_eq!(records, vec![record]);
        assert_eq!(reopened.settings(), AlarmSettings::default());
    }

    #[test]
    fn failed_remove_is_written_on_retry() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("alarms.json");
        let mut store = JsonFileStore::open(&path).expect("open");
        store
            .save(&StoredAlarm::from_rule(AlarmRule {
                id: 1,
                ..AlarmRule::new(7, 0)
            }))
            .expect("save");

        // A directory in place of the temp file makes the write fail.
        let blocker = path.with_extension("json.tmp");
        fs::create_dir(&blocker).expect("block temp file");
        assert!(store.remove(1).is_err());
        fs::remove_dir(&blocker).expect("unblock temp file");

        store.remove(1).expect("retried remove");
        let mut reopened = JsonFileStore::open(&path).expect("reopen");
        assert!(reopened.load_all().expect("load").is_empty());
    }

    #[test]
    fn memory_store_failure_toggle() {
        let mut store = MemoryStore::new();
        let handle = store.clone();
        handle.set_failing(true);
        let record = StoredAlarm::from_rule(AlarmRule {
            id: 1,
            ..AlarmRule::new(7, 0)
        });
        assert!(store.save(&record).is_err());
        handle.set_failing(false);
        store.save(&record).expect("save");
        assert_eq!(handle.get(1), Some(record));
    }
}
