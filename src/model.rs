//! Progress snapshot data model and its wire format.
//!
//! The same camelCase JSON shape is used for the persisted store keys, the
//! upload payload and the body the server returns on fetch.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{Result, SyncError};
use crate::util::truncate_body;

const SNAPSHOT_KEYS: [&str; 3] = ["levels", "achievements", "lastModifiedTimestamp"];

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelRecord {
    #[serde(default)]
    pub best_time: f64,
    #[serde(default)]
    pub current_time: f64,
    #[serde(default)]
    pub unlocked: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AchievementRecord {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub unlocked: bool,
}

/// Full set of level and achievement progress at a point in time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    #[serde(default)]
    pub levels: BTreeMap<String, LevelRecord>,
    #[serde(default)]
    pub achievements: BTreeMap<String, AchievementRecord>,
    #[serde(default)]
    pub last_modified_timestamp: i64,
}

impl ProgressSnapshot {
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty() && self.achievements.is_empty()
    }

    /// True when both snapshots hold the same levels and achievements.
    /// `lastModifiedTimestamp` is ignored: every store write restamps it.
    pub fn same_progress(&self, other: &ProgressSnapshot) -> bool {
        self.levels == other.levels && self.achievements == other.achievements
    }

    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a fetch response body.
    ///
    /// Accepts an empty body, a snapshot object, a JSON string holding a
    /// snapshot, or an object wrapping either of those under `progress`.
    pub fn from_wire(body: &str) -> Result<Self> {
        if body.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_json::from_str(body).map_err(|e| rejected(body, e))?;
        Self::from_value(value, body)
    }

    fn from_value(value: Value, body: &str) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::String(inner) => Self::from_wire(&inner),
            Value::Object(mut map) => {
                let has_snapshot_keys = SNAPSHOT_KEYS.iter().any(|k| map.contains_key(*k));
                if !has_snapshot_keys {
                    if let Some(inner) = map.remove("progress") {
                        return Self::from_value(inner, body);
                    }
                    if !map.is_empty() {
                        return Err(SyncError::ServerRejected {
                            status: None,
                            message: format!("no progress in body: {}", truncate_body(body, 120)),
                        });
                    }
                }
                serde_json::from_value(Value::Object(map)).map_err(|e| rejected(body, e))
            }
            _ => Err(SyncError::ServerRejected {
                status: None,
                message: format!("unexpected progress body: {}", truncate_body(body, 120)),
            }),
        }
    }
}

fn rejected(body: &str, e: serde_json::Error) -> SyncError {
    SyncError::ServerRejected {
        status: None,
        message: format!("unparsable progress body ({e}): {}", truncate_body(body, 120)),
    }
}
