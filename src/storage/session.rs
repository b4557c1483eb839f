use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::storage::kv::KeyValueStore;

pub const SESSION_FILE: &str = "login_data";
const SECRET_KEY: &str = "password";
const RECORD_KEY: &str = "student";

/// Authenticated identity needed to call the remote service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    /// Server-side record id; every progress call is keyed by this.
    pub server_identity: i64,
    pub external_id: String,
    pub secret: String,
}

impl Session {
    /// Fails with `InvalidSession` when the record cannot authorize a call.
    pub fn validate(&self) -> Result<()> {
        if self.server_identity <= 0 {
            return Err(SyncError::InvalidSession(format!(
                "server identity {} is not valid",
                self.server_identity
            )));
        }
        if self.external_id.is_empty() || self.secret.is_empty() {
            return Err(SyncError::InvalidSession("missing credentials".into()));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    id: i64,
    student_id: String,
    #[serde(default)]
    profile: Value,
}

/// Persists the authenticated session in the `login_data` file.
pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn is_authenticated(&self) -> bool {
        self.read_record().is_some()
    }

    pub fn set_session(
        &self,
        secret: &str,
        server_identity: i64,
        external_id: &str,
        profile: Value,
    ) -> Result<()> {
        let session = Session {
            server_identity,
            external_id: external_id.to_string(),
            secret: secret.to_string(),
        };
        session.validate()?;

        let record = SessionRecord {
            id: server_identity,
            student_id: external_id.to_string(),
            profile,
        };
        self.kv.set_many(
            SESSION_FILE,
            &[
                (SECRET_KEY, secret.to_string()),
                (RECORD_KEY, serde_json::to_string(&record)?),
            ],
        )?;
        tracing::info!(server_identity, external_id, "session stored");
        Ok(())
    }

    /// Deletes the session. Safe to call when logged out.
    pub fn clear_session(&self) {
        if let Err(e) = self.kv.delete_file(SESSION_FILE) {
            tracing::warn!(error = %e, "failed to clear session");
        } else {
            tracing::info!("session cleared");
        }
    }

    /// Present session, or `NotAuthenticated`. A present but unusable
    /// record yields `InvalidSession`.
    pub fn session(&self) -> Result<Session> {
        let (secret, record) = self.read_record().ok_or(SyncError::NotAuthenticated)?;
        let session = Session {
            server_identity: record.id,
            external_id: record.student_id,
            secret,
        };
        session.validate()?;
        Ok(session)
    }

    /// Opaque profile fields returned by the server at login.
    pub fn profile(&self) -> Option<Value> {
        self.read_record().map(|(_, record)| record.profile)
    }

    fn read_record(&self) -> Option<(String, SessionRecord)> {
        let read = || -> Result<Option<(String, SessionRecord)>> {
            let Some(raw) = self.kv.get(SESSION_FILE, RECORD_KEY)? else {
                return Ok(None);
            };
            let record: SessionRecord = serde_json::from_str(&raw)?;
            let secret = self.kv.get(SESSION_FILE, SECRET_KEY)?.unwrap_or_default();
            Ok(Some((secret, record)))
        };
        match read() {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable session, treating as logged out");
                None
            }
        }
    }
}
