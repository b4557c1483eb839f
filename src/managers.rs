//! Gameplay-facing mutators over `LocalProgress`.
//!
//! Every call is a read-modify-write against the store; nothing here touches
//! the network.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::model::{AchievementRecord, LevelRecord};
use crate::storage::ProgressStore;

pub struct LevelManager {
    store: Arc<ProgressStore>,
}

impl LevelManager {
    pub fn new(store: Arc<ProgressStore>) -> Self {
        Self { store }
    }

    pub fn unlock_level(&self, level_id: &str) -> Result<bool> {
        self.store.unlock_level(level_id)
    }

    /// Records the time of a finished run.
    pub fn record_time(&self, level_id: &str, time: f64) -> Result<bool> {
        self.store.update_level_time(level_id, time)
    }

    pub fn is_unlocked(&self, level_id: &str) -> bool {
        self.store
            .load()
            .levels
            .get(level_id)
            .is_some_and(|l| l.unlocked)
    }

    /// Best recorded time, `None` until the level has a finished run.
    pub fn best_time(&self, level_id: &str) -> Option<f64> {
        self.store
            .load()
            .levels
            .get(level_id)
            .map(|l| l.best_time)
            .filter(|t| *t > 0.0)
    }

    pub fn levels(&self) -> BTreeMap<String, LevelRecord> {
        self.store.load().levels
    }
}

pub struct AchievementManager {
    store: Arc<ProgressStore>,
}

impl AchievementManager {
    pub fn new(store: Arc<ProgressStore>) -> Self {
        Self { store }
    }

    pub fn unlock_achievement(&self, id: &str, title: &str, description: &str) -> Result<bool> {
        self.store.unlock_achievement(id, title, description)
    }

    pub fn is_unlocked(&self, id: &str) -> bool {
        self.store
            .load()
            .achievements
            .get(id)
            .is_some_and(|a| a.unlocked)
    }

    pub fn achievements(&self) -> BTreeMap<String, AchievementRecord> {
        self.store.load().achievements
    }
}
