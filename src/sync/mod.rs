//! Reconciliation workflows between `LocalProgress`, `CloudMirror` and the
//! remote record.
//!
//! Each workflow is one sequential chain: a step runs only if the previous
//! one succeeded, and the first failure becomes the workflow's terminal
//! result. Workflows are not transactional; a store written before a later
//! step fails keeps its new content. Dropping a workflow future abandons the
//! in-flight request and skips the remaining steps.

pub mod events;
pub mod guard;

pub use events::{SyncEvent, SyncOutcome, Workflow};
pub use guard::{SyncGuard, SyncTicket};

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::{Result, SyncError};
use crate::model::ProgressSnapshot;
use crate::remote::{Fetched, Pushed, RemoteSyncClient};
use crate::storage::{ProgressStore, Session, SessionStore};

pub struct SyncOrchestrator {
    session: Arc<SessionStore>,
    local: Arc<ProgressStore>,
    cloud: Arc<ProgressStore>,
    client: RemoteSyncClient,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncOrchestrator {
    pub fn new(
        session: Arc<SessionStore>,
        local: Arc<ProgressStore>,
        cloud: Arc<ProgressStore>,
        client: RemoteSyncClient,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            session,
            local,
            cloud,
            client,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Runs `workflow` unless another one already holds `guard`.
    pub async fn run(&self, guard: &SyncGuard, workflow: Workflow) -> SyncOutcome {
        let Some(_ticket) = guard.try_begin() else {
            tracing::warn!(%workflow, "sync already in progress, ignoring trigger");
            return SyncOutcome::failed(
                workflow,
                &SyncError::Custom("Sync already in progress".into()),
            );
        };
        match workflow {
            Workflow::Bootstrap => self.bootstrap().await,
            Workflow::LoginSync => self.login_sync().await,
            Workflow::MenuSync => self.menu_sync().await,
            Workflow::UploadOnly => self.upload_only().await,
        }
    }

    /// Authenticates and stores the session. Does not sync; run
    /// `login_sync` afterwards.
    pub async fn login(&self, external_id: &str, secret: &str) -> Result<Session> {
        if external_id.trim().is_empty() || secret.is_empty() {
            return Err(SyncError::InvalidSession("missing credentials".into()));
        }
        let login = self.client.authenticate(external_id, secret).await?;
        if !login.has_identity() {
            return Err(SyncError::InvalidSession(
                "server did not return a student id".into(),
            ));
        }
        self.session
            .set_session(secret, login.server_identity, external_id, login.profile)?;
        self.session.session()
    }

    /// Forgets the session. Local progress and the cloud mirror are kept.
    pub fn logout(&self) {
        self.session.clear_session();
    }

    /// First app start: make sure `CloudMirror` exists, filled from the
    /// server when logged in. Never touches `LocalProgress`.
    pub async fn bootstrap(&self) -> SyncOutcome {
        let workflow = Workflow::Bootstrap;
        self.started(workflow);
        let result = self.run_bootstrap().await;
        self.finish(workflow, result.map(|_| None))
    }

    async fn run_bootstrap(&self) -> Result<()> {
        let workflow = Workflow::Bootstrap;
        if !self.session.is_authenticated() {
            self.cloud.save(ProgressSnapshot::default())?;
            self.step(workflow, "cloud_mirror_reset");
            return Ok(());
        }

        let fetched = match self.session.session() {
            Ok(session) => self.fetch(&session).await,
            Err(e) => Err(e),
        };
        match fetched {
            Ok(fetched) => {
                self.cloud.save(fetched.snapshot)?;
                self.step(workflow, "cloud_mirror_updated");
                Ok(())
            }
            Err(e) => {
                // Later reads must never find the mirror missing.
                self.cloud.save(ProgressSnapshot::default())?;
                self.step(workflow, "cloud_mirror_reset");
                Err(e)
            }
        }
    }

    /// After an explicit login: local is pushed to the server, then the
    /// server's accepted state replaces both the mirror and local.
    pub async fn login_sync(&self) -> SyncOutcome {
        let workflow = Workflow::LoginSync;
        self.started(workflow);
        let result = self.run_login_sync().await;
        self.finish(workflow, result.map(|_| None))
    }

    async fn run_login_sync(&self) -> Result<()> {
        let workflow = Workflow::LoginSync;
        let session = self.session.session()?;

        let mirror = self.cloud.copy_from(&self.local)?;
        self.step(workflow, "local_copied_to_cloud");

        self.push(&session, &mirror).await?;
        self.step(workflow, "uploaded");

        let fetched = self.fetch(&session).await?;
        self.step(workflow, "downloaded");

        self.cloud.save(fetched.snapshot)?;
        self.local.copy_from(&self.cloud)?;
        self.step(workflow, "local_updated");
        Ok(())
    }

    /// On menu entry: refresh the mirror from the server and, when the
    /// server disagrees with what was cached, push the cached state back.
    ///
    /// The re-push prefers this device's cached mirror over the server's
    /// current value, which can overwrite changes made from another device.
    /// The mirror keeps the fetched content either way.
    pub async fn menu_sync(&self) -> SyncOutcome {
        let workflow = Workflow::MenuSync;
        self.started(workflow);
        let result = self.run_menu_sync().await;
        let uploaded = matches!(result, Ok(true));
        let mut outcome = self.finish(workflow, result.map(Some));
        outcome.uploaded = Some(uploaded);
        outcome
    }

    async fn run_menu_sync(&self) -> Result<bool> {
        let workflow = Workflow::MenuSync;
        let session = self.session.session()?;

        let cached = self.cloud.load();
        let fetched = self.fetch(&session).await?;
        let remote = fetched.snapshot;
        self.cloud.save(remote.clone())?;
        self.step(workflow, "downloaded");

        if cached.same_progress(&remote) {
            tracing::debug!("cloud mirror matches server, nothing to upload");
            return Ok(false);
        }

        tracing::warn!(
            cached_levels = cached.levels.len(),
            remote_levels = remote.levels.len(),
            "server progress differs from cached mirror, re-asserting cached state"
        );
        self.push(&session, &cached).await?;
        self.step(workflow, "uploaded");
        Ok(true)
    }

    /// Manual save: pushes the current mirror without fetching.
    pub async fn upload_only(&self) -> SyncOutcome {
        let workflow = Workflow::UploadOnly;
        self.started(workflow);
        let result = self.run_upload_only().await;
        self.finish(workflow, result.map(|_| None))
    }

    async fn run_upload_only(&self) -> Result<()> {
        let session = self.session.session()?;
        let mirror = self.cloud.load();
        self.push(&session, &mirror).await?;
        self.step(Workflow::UploadOnly, "uploaded");
        Ok(())
    }

    async fn fetch(&self, session: &Session) -> Result<Fetched> {
        self.client
            .fetch_snapshot(session.server_identity, &session.external_id, &session.secret)
            .await
    }

    async fn push(&self, session: &Session, snapshot: &ProgressSnapshot) -> Result<Pushed> {
        let payload = snapshot.to_wire()?;
        self.client
            .push_snapshot(
                session.server_identity,
                &session.external_id,
                &session.secret,
                &payload,
            )
            .await
    }

    fn started(&self, workflow: Workflow) {
        tracing::info!(%workflow, "sync started");
        let _ = self.events.send(SyncEvent::Started { workflow });
    }

    fn step(&self, workflow: Workflow, step: &'static str) {
        tracing::debug!(%workflow, step, "sync step completed");
        let _ = self.events.send(SyncEvent::StepCompleted { workflow, step });
    }

    fn finish(&self, workflow: Workflow, result: Result<Option<bool>>) -> SyncOutcome {
        let outcome = match result {
            Ok(uploaded) => {
                tracing::info!(%workflow, ?uploaded, "sync finished");
                SyncOutcome::succeeded(workflow, uploaded)
            }
            Err(e) => {
                tracing::warn!(%workflow, kind = ?e.kind(), error = %e, "sync failed");
                SyncOutcome::failed(workflow, &e)
            }
        };
        let _ = self.events.send(SyncEvent::Finished(outcome.clone()));
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureKind, NetworkFailure};
    use crate::model::LevelRecord;
    use crate::remote::transport::scripted::ScriptedTransport;
    use crate::remote::Method;
    use crate::storage::{KeyValueStore, MemoryKeyValueStore};
    use serde_json::Value;

    struct Harness {
        transport: Arc<ScriptedTransport>,
        session: Arc<SessionStore>,
        local: Arc<ProgressStore>,
        cloud: Arc<ProgressStore>,
        sync: SyncOrchestrator,
    }

    fn harness() -> Harness {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        let session = Arc::new(SessionStore::new(kv.clone()));
        let local = Arc::new(ProgressStore::local(kv.clone()));
        let cloud = Arc::new(ProgressStore::cloud(kv));
        let sync = SyncOrchestrator::new(
            session.clone(),
            local.clone(),
            cloud.clone(),
            RemoteSyncClient::new(transport.clone()),
        );
        Harness {
            transport,
            session,
            local,
            cloud,
            sync,
        }
    }

    fn logged_in() -> Harness {
        let h = harness();
        h.session.set_session("pw", 9, "s9", Value::Null).unwrap();
        h
    }

    fn snapshot_with(levels: &[(&str, f64)]) -> ProgressSnapshot {
        let mut snapshot = ProgressSnapshot::default();
        for (id, time) in levels {
            snapshot.levels.insert(
                (*id).to_string(),
                LevelRecord {
                    best_time: *time,
                    current_time: *time,
                    unlocked: true,
                },
            );
        }
        snapshot
    }

    fn body(levels: &[(&str, f64)]) -> String {
        snapshot_with(levels).to_wire().unwrap()
    }

    fn pushed_payload(transport: &ScriptedTransport) -> ProgressSnapshot {
        let request = transport
            .requests()
            .into_iter()
            .find(|r| r.path.starts_with("/progress/update/"))
            .expect("an upload request");
        let payload = request
            .params
            .iter()
            .find(|(k, _)| k == "payload")
            .map(|(_, v)| v.clone())
            .unwrap();
        ProgressSnapshot::from_wire(&payload).unwrap()
    }

    #[tokio::test]
    async fn test_login_sync_requires_session() {
        let h = harness();
        let outcome = h.sync.login_sync().await;

        assert!(!outcome.success);
        assert_eq!(outcome.reason.as_deref(), Some("Not logged in"));
        assert_eq!(outcome.failure, Some(FailureKind::NotAuthenticated));
        assert_eq!(h.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_session_fails_fast() {
        let h = harness();
        let kv = Arc::new(MemoryKeyValueStore::new());
        kv.set("login_data", "student", r#"{"id":0,"studentId":"s9"}"#).unwrap();
        kv.set("login_data", "password", "pw").unwrap();
        let session = Arc::new(SessionStore::new(kv.clone()));
        let sync = SyncOrchestrator::new(
            session,
            h.local.clone(),
            h.cloud.clone(),
            RemoteSyncClient::new(h.transport.clone()),
        );

        for outcome in [sync.login_sync().await, sync.menu_sync().await, sync.upload_only().await] {
            assert!(!outcome.success);
            assert_eq!(outcome.failure, Some(FailureKind::InvalidSession));
        }
        assert_eq!(h.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_login_sync_server_state_becomes_authoritative() {
        let h = logged_in();
        h.local.update_level_time("Level1", 45.0).unwrap();
        let server_after_push = body(&[("Level1", 45.0), ("Level2", 80.0)]);
        h.transport
            .reply(200, r#"{"status":"ok"}"#)
            .reply(200, &server_after_push);

        let outcome = h.sync.login_sync().await;
        assert!(outcome.success, "{outcome:?}");
        assert_eq!(outcome.uploaded, None);

        let requests = h.transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].path, "/progress/update/9/");
        assert_eq!(requests[1].path, "/progress/9/");
        assert!(pushed_payload(&h.transport).same_progress(&snapshot_with(&[("Level1", 45.0)])));

        let expected = snapshot_with(&[("Level1", 45.0), ("Level2", 80.0)]);
        assert!(h.cloud.load().same_progress(&expected));
        assert!(h.local.load().same_progress(&expected));
    }

    #[tokio::test]
    async fn test_login_sync_push_failure_leaves_local_untouched() {
        let h = logged_in();
        h.local.update_level_time("Level1", 45.0).unwrap();
        let before = h.local.load();
        h.transport.fail(NetworkFailure::Timeout);

        let outcome = h.sync.login_sync().await;
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureKind::Network));
        assert_eq!(outcome.reason.as_deref(), Some("Network error: timeout"));
        assert_eq!(h.transport.call_count(), 1);
        assert_eq!(h.local.load(), before);
        // Step 1 already ran and is not rolled back.
        assert!(h.cloud.load().same_progress(&before));
    }

    #[tokio::test]
    async fn test_login_sync_fetch_failure_leaves_local_untouched() {
        let h = logged_in();
        h.local.unlock_level("Level1").unwrap();
        let before = h.local.load();
        h.transport.reply(200, "ok").reply(500, "database down");

        let outcome = h.sync.login_sync().await;
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureKind::ServerRejected));
        assert_eq!(h.transport.call_count(), 2);
        assert_eq!(h.local.load(), before);
    }

    #[tokio::test]
    async fn test_login_sync_rejects_body_without_progress() {
        let h = logged_in();
        h.local.update_level_time("Level1", 45.0).unwrap();
        let before = h.local.load();
        h.transport
            .reply(200, "ok")
            .reply(200, r#"{"error":"progress unavailable"}"#);

        let outcome = h.sync.login_sync().await;
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureKind::ServerRejected));
        assert_eq!(h.local.load(), before);
        assert!(h.cloud.load().same_progress(&before));
    }

    #[tokio::test]
    async fn test_bootstrap_without_session_is_idempotent() {
        let h = harness();
        h.local.unlock_level("Level1").unwrap();
        let local_before = h.local.load();

        for _ in 0..2 {
            let outcome = h.sync.bootstrap().await;
            assert!(outcome.success);
            assert!(h.cloud.load().is_empty());
        }
        assert_eq!(h.transport.call_count(), 0);
        assert_eq!(h.local.load(), local_before);
    }

    #[tokio::test]
    async fn test_bootstrap_with_session_mirrors_server() {
        let h = logged_in();
        let server = body(&[("Level1", 33.0)]);
        h.transport.reply(200, &server).reply(200, &server);

        for _ in 0..2 {
            let outcome = h.sync.bootstrap().await;
            assert!(outcome.success);
            assert!(h.cloud.load().same_progress(&snapshot_with(&[("Level1", 33.0)])));
        }
        assert!(h.local.load().is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_fetch_failure_resets_mirror() {
        let h = logged_in();
        h.cloud.save(snapshot_with(&[("Stale", 1.0)])).unwrap();
        h.transport
            .fail(NetworkFailure::Connect("connection refused".into()));

        let outcome = h.sync.bootstrap().await;
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureKind::Network));
        assert!(h.cloud.load().is_empty());
        assert!(h.cloud.load().last_modified_timestamp > 0);
    }

    #[tokio::test]
    async fn test_bootstrap_treats_missing_remote_as_empty() {
        let h = logged_in();
        h.cloud.save(snapshot_with(&[("Stale", 1.0)])).unwrap();
        h.transport.reply(404, "").reply(404, "");

        let outcome = h.sync.bootstrap().await;
        assert!(outcome.success);
        assert!(h.cloud.load().is_empty());
    }

    #[tokio::test]
    async fn test_menu_sync_skips_upload_when_equal() {
        let h = logged_in();
        h.cloud.save(snapshot_with(&[("Level1", 40.0)])).unwrap();
        h.transport.reply(200, &body(&[("Level1", 40.0)]));

        let outcome = h.sync.menu_sync().await;
        assert!(outcome.success);
        assert_eq!(outcome.uploaded, Some(false));
        assert_eq!(h.transport.call_count(), 1);
        assert_eq!(h.transport.calls_to("/progress/update/"), 0);
    }

    #[tokio::test]
    async fn test_menu_sync_reasserts_cached_mirror() {
        let h = logged_in();
        let cached = snapshot_with(&[("Level1", 40.0), ("Level2", 70.0)]);
        h.cloud.save(cached.clone()).unwrap();
        h.transport
            .reply(200, &body(&[("Level1", 55.0)]))
            .reply(200, r#"{"status":"ok"}"#);

        let outcome = h.sync.menu_sync().await;
        assert!(outcome.success);
        assert_eq!(outcome.uploaded, Some(true));
        assert_eq!(h.transport.calls_to("/progress/update/"), 1);
        assert!(pushed_payload(&h.transport).same_progress(&cached));
        // The fetched body stays in the mirror after the re-push.
        assert!(h.cloud.load().same_progress(&snapshot_with(&[("Level1", 55.0)])));
        assert!(h.local.load().is_empty());
    }

    #[tokio::test]
    async fn test_menu_sync_failed_reupload() {
        let h = logged_in();
        h.cloud.save(snapshot_with(&[("Level1", 40.0)])).unwrap();
        h.transport
            .reply(200, &body(&[("Level1", 55.0)]))
            .reply(503, "maintenance");

        let outcome = h.sync.menu_sync().await;
        assert!(!outcome.success);
        assert_eq!(outcome.uploaded, Some(false));
        assert_eq!(outcome.failure, Some(FailureKind::ServerRejected));
        // The fetched body was persisted before the upload failed.
        assert!(h.cloud.load().same_progress(&snapshot_with(&[("Level1", 55.0)])));
    }

    #[tokio::test]
    async fn test_menu_sync_fetch_failure() {
        let h = logged_in();
        h.cloud.save(snapshot_with(&[("Level1", 40.0)])).unwrap();
        h.transport.fail(NetworkFailure::Timeout);

        let outcome = h.sync.menu_sync().await;
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureKind::Network));
        assert!(h.cloud.load().same_progress(&snapshot_with(&[("Level1", 40.0)])));
        assert!(h.local.load().is_empty());
    }

    #[tokio::test]
    async fn test_upload_only_pushes_mirror() {
        let h = logged_in();
        h.cloud.save(snapshot_with(&[("Level3", 21.0)])).unwrap();
        h.local.update_level_time("Level9", 99.0).unwrap();
        h.transport.reply(201, "created");

        let outcome = h.sync.upload_only().await;
        assert!(outcome.success);
        assert_eq!(h.transport.call_count(), 1);
        assert_eq!(h.transport.requests()[0].method, Method::Post);
        assert!(pushed_payload(&h.transport).same_progress(&snapshot_with(&[("Level3", 21.0)])));
    }

    #[tokio::test]
    async fn test_login_stores_session() {
        let h = harness();
        h.transport
            .reply(200, r#"{"student":{"id":12,"name":"Ada"}}"#);

        let session = h.sync.login("s12", "pw").await.unwrap();
        assert_eq!(session.server_identity, 12);
        assert!(h.session.is_authenticated());
        assert_eq!(h.session.profile().unwrap()["name"], "Ada");

        h.sync.logout();
        assert!(!h.session.is_authenticated());
    }

    #[tokio::test]
    async fn test_login_without_identity_is_not_stored() {
        let h = harness();
        h.transport.reply(200, r#"{"student":{"name":"Ada"}}"#);

        let err = h.sync.login("s12", "pw").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidSession);
        assert!(!h.session.is_authenticated());

        let err = h.sync.login("", "pw").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidSession);
        assert_eq!(h.transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_run_respects_guard() {
        let h = logged_in();
        let guard = SyncGuard::new();
        let _busy = guard.try_begin().unwrap();

        let outcome = h.sync.run(&guard, Workflow::MenuSync).await;
        assert!(!outcome.success);
        assert_eq!(outcome.reason.as_deref(), Some("Sync already in progress"));
        assert_eq!(h.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_run_dispatches_and_releases_guard() {
        let h = harness();
        let guard = SyncGuard::new();

        let outcome = h.sync.run(&guard, "bootstrap".parse().unwrap()).await;
        assert!(outcome.success);
        assert_eq!(outcome.workflow, Workflow::Bootstrap);
        assert!(!guard.is_active());
    }

    #[tokio::test]
    async fn test_events_report_completion() {
        let h = harness();
        let mut rx = h.sync.subscribe();

        h.sync.login_sync().await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events.first(),
            Some(&SyncEvent::Started {
                workflow: Workflow::LoginSync
            })
        );
        match events.last() {
            Some(SyncEvent::Finished(outcome)) => {
                assert!(!outcome.success);
                assert_eq!(outcome.reason.as_deref(), Some("Not logged in"));
            }
            other => panic!("expected Finished, got {other:?}"),
        }
    }
}
