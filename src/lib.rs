//! Offline-first progress synchronization for the platformer.
//!
//! Three copies of progress exist: `LocalProgress` (mutated by gameplay),
//! `CloudMirror` (last state the server accepted or returned) and the remote
//! record. [`SyncOrchestrator`] moves data between them at fixed lifecycle
//! points; gameplay only ever touches `LocalProgress` through the managers.

pub mod config;
pub mod error;
pub mod managers;
pub mod model;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod util;

use std::sync::Arc;

pub use config::SyncConfig;
pub use error::{FailureKind, NetworkFailure, Result, SyncError};
pub use managers::{AchievementManager, LevelManager};
pub use model::{AchievementRecord, LevelRecord, ProgressSnapshot};
pub use remote::{RemoteSyncClient, Transport};
pub use storage::{FileKeyValueStore, KeyValueStore, ProgressStore, Session, SessionStore};
pub use sync::{SyncEvent, SyncGuard, SyncOrchestrator, SyncOutcome, Workflow};

/// Every service, constructed once per process and shared by reference.
pub struct SyncServices {
    pub session: Arc<SessionStore>,
    pub local: Arc<ProgressStore>,
    pub cloud: Arc<ProgressStore>,
    pub levels: LevelManager,
    pub achievements: AchievementManager,
    pub orchestrator: SyncOrchestrator,
    pub guard: SyncGuard,
}

impl SyncServices {
    /// File-backed stores under the configured data dir, reqwest transport.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let dir = config
            .data_dir()
            .ok_or_else(|| SyncError::Custom("Cannot find home directory".into()))?;
        tracing::info!(data_dir = %dir.display(), base_url = %config.base_url, "starting progress sync");
        let kv: Arc<dyn KeyValueStore> = Arc::new(FileKeyValueStore::new(dir));
        Ok(Self::with_parts(kv, RemoteSyncClient::from_config(config)?))
    }

    pub fn with_parts(kv: Arc<dyn KeyValueStore>, client: RemoteSyncClient) -> Self {
        let session = Arc::new(SessionStore::new(kv.clone()));
        let local = Arc::new(ProgressStore::local(kv.clone()));
        let cloud = Arc::new(ProgressStore::cloud(kv));
        Self {
            levels: LevelManager::new(local.clone()),
            achievements: AchievementManager::new(local.clone()),
            orchestrator: SyncOrchestrator::new(session.clone(), local.clone(), cloud.clone(), client),
            session,
            local,
            cloud,
            guard: SyncGuard::new(),
        }
    }

    /// Runs a workflow behind the shared single-flight guard.
    pub async fn trigger(&self, workflow: Workflow) -> SyncOutcome {
        self.orchestrator.run(&self.guard, workflow).await
    }
}
