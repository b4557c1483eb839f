use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::{Result, SyncError};
use crate::model::{AchievementRecord, LevelRecord, ProgressSnapshot};
use crate::storage::kv::KeyValueStore;
use crate::util::now_unix;

pub const LOCAL_FILE: &str = "local_save";
pub const CLOUD_FILE: &str = "cloud_save";

const LEVELS_KEY: &str = "levels";
const ACHIEVEMENTS_KEY: &str = "achievements";
const TIMESTAMP_KEY: &str = "lastModifiedTimestamp";

/// Change notifications for UI bindings.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "event", content = "data")]
pub enum ProgressEvent {
    #[serde(rename_all = "camelCase")]
    Saved { store: String, timestamp: i64 },
    #[serde(rename_all = "camelCase")]
    LevelUnlocked { level_id: String },
    #[serde(rename_all = "camelCase")]
    BestTimeUpdated { level_id: String, best_time: f64 },
    #[serde(rename_all = "camelCase")]
    AchievementUnlocked { achievement_id: String },
    #[serde(rename_all = "camelCase")]
    Cleared { store: String },
}

/// Durable storage for one progress snapshot (`local_save` or `cloud_save`).
pub struct ProgressStore {
    kv: Arc<dyn KeyValueStore>,
    file: String,
    clock: fn() -> i64,
    last_stamp: AtomicI64,
    events: broadcast::Sender<ProgressEvent>,
}

impl ProgressStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, file: impl Into<String>) -> Self {
        Self::with_clock(kv, file, now_unix)
    }

    pub fn with_clock(kv: Arc<dyn KeyValueStore>, file: impl Into<String>, clock: fn() -> i64) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            kv,
            file: file.into(),
            clock,
            last_stamp: AtomicI64::new(0),
            events,
        }
    }

    /// Gameplay source of truth.
    pub fn local(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::new(kv, LOCAL_FILE)
    }

    /// Last known server-accepted state.
    pub fn cloud(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::new(kv, CLOUD_FILE)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Never fails: missing or unreadable storage yields an empty snapshot.
    pub fn load(&self) -> ProgressSnapshot {
        match self.try_load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(store = %self.file, error = %e, "unreadable progress, using empty snapshot");
                ProgressSnapshot::default()
            }
        }
    }

    fn try_load(&self) -> Result<ProgressSnapshot> {
        let levels: BTreeMap<String, LevelRecord> = match self.kv.get(&self.file, LEVELS_KEY)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => BTreeMap::new(),
        };
        let achievements: BTreeMap<String, AchievementRecord> =
            match self.kv.get(&self.file, ACHIEVEMENTS_KEY)? {
                Some(raw) => serde_json::from_str(&raw)?,
                None => BTreeMap::new(),
            };
        let last_modified_timestamp: i64 = match self.kv.get(&self.file, TIMESTAMP_KEY)? {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| SyncError::Custom(format!("bad timestamp {raw:?}")))?,
            None => 0,
        };
        Ok(ProgressSnapshot {
            levels,
            achievements,
            last_modified_timestamp,
        })
    }

    /// Full replace of the stored snapshot, stamped with the current time.
    /// Returns the snapshot as written.
    pub fn save(&self, snapshot: ProgressSnapshot) -> Result<ProgressSnapshot> {
        let mut snapshot = snapshot;
        snapshot.last_modified_timestamp = self.next_stamp();

        self.kv.set_many(
            &self.file,
            &[
                (LEVELS_KEY, serde_json::to_string(&snapshot.levels)?),
                (ACHIEVEMENTS_KEY, serde_json::to_string(&snapshot.achievements)?),
                (TIMESTAMP_KEY, snapshot.last_modified_timestamp.to_string()),
            ],
        )?;
        tracing::debug!(
            store = %self.file,
            levels = snapshot.levels.len(),
            achievements = snapshot.achievements.len(),
            timestamp = snapshot.last_modified_timestamp,
            "progress saved"
        );
        self.notify(ProgressEvent::Saved {
            store: self.file.clone(),
            timestamp: snapshot.last_modified_timestamp,
        });
        Ok(snapshot)
    }

    /// Replaces this store's content with `other`'s current content.
    pub fn copy_from(&self, other: &ProgressStore) -> Result<ProgressSnapshot> {
        self.save(other.load())
    }

    /// Maintenance: drops the stored snapshot entirely.
    pub fn clear(&self) -> Result<()> {
        self.kv.delete_file(&self.file)?;
        tracing::info!(store = %self.file, "progress cleared");
        self.notify(ProgressEvent::Cleared {
            store: self.file.clone(),
        });
        Ok(())
    }

    /// Returns true when the level went from locked (or absent) to unlocked.
    pub fn unlock_level(&self, level_id: &str) -> Result<bool> {
        let mut snapshot = self.load();
        match snapshot.levels.get_mut(level_id) {
            Some(record) if record.unlocked => return Ok(false),
            Some(record) => record.unlocked = true,
            None => {
                snapshot.levels.insert(
                    level_id.to_string(),
                    LevelRecord {
                        best_time: 0.0,
                        current_time: 0.0,
                        unlocked: true,
                    },
                );
            }
        }
        self.save(snapshot)?;
        self.notify(ProgressEvent::LevelUnlocked {
            level_id: level_id.to_string(),
        });
        Ok(true)
    }

    /// Records a finished run. Returns true when the best time changed.
    pub fn update_level_time(&self, level_id: &str, time: f64) -> Result<bool> {
        if !time.is_finite() || time < 0.0 {
            return Err(SyncError::Custom(format!(
                "invalid time {time} for level {level_id}"
            )));
        }

        let mut snapshot = self.load();
        let improved = match snapshot.levels.get_mut(level_id) {
            Some(record) => {
                record.current_time = time;
                let previous = record.best_time;
                if previous <= 0.0 || time < previous {
                    record.best_time = time;
                }
                record.best_time != previous
            }
            None => {
                snapshot.levels.insert(
                    level_id.to_string(),
                    LevelRecord {
                        best_time: time,
                        current_time: time,
                        unlocked: true,
                    },
                );
                true
            }
        };

        self.save(snapshot)?;
        if improved {
            self.notify(ProgressEvent::BestTimeUpdated {
                level_id: level_id.to_string(),
                best_time: time,
            });
        }
        Ok(improved)
    }

    /// Returns true when the achievement went from locked (or absent) to unlocked.
    pub fn unlock_achievement(&self, id: &str, title: &str, description: &str) -> Result<bool> {
        let mut snapshot = self.load();
        let record = snapshot
            .achievements
            .entry(id.to_string())
            .or_insert_with(|| AchievementRecord {
                title: title.to_string(),
                description: description.to_string(),
                unlocked: false,
            });
        if record.unlocked {
            return Ok(false);
        }
        record.unlocked = true;

        self.save(snapshot)?;
        self.notify(ProgressEvent::AchievementUnlocked {
            achievement_id: id.to_string(),
        });
        Ok(true)
    }

    fn next_stamp(&self) -> i64 {
        let now = (self.clock)();
        let previous = self.last_stamp.fetch_max(now, Ordering::SeqCst);
        now.max(previous)
    }

    fn notify(&self, event: ProgressEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
