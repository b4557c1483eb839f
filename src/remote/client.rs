use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::model::ProgressSnapshot;
use crate::remote::transport::{Method, ReqwestTransport, Transport, TransportRequest, TransportResponse};
use crate::util::truncate_body;

/// Successful login response.
#[derive(Clone, Debug)]
pub struct Login {
    /// `student.id` from the body, 0 when absent or non-positive.
    pub server_identity: i64,
    /// The `student` object as returned by the server, uninterpreted.
    pub profile: Value,
    pub raw_body: String,
    pub transport_code: u16,
}

impl Login {
    /// A 2xx login without a usable identity still can't authorize progress calls.
    pub fn has_identity(&self) -> bool {
        self.server_identity > 0
    }
}

#[derive(Clone, Debug)]
pub struct Fetched {
    pub snapshot: ProgressSnapshot,
    pub raw_body: String,
    pub transport_code: u16,
    /// The server has no record yet (final attempt answered 404).
    pub empty_remote: bool,
}

#[derive(Clone, Debug)]
pub struct Pushed {
    pub raw_body: String,
    pub transport_code: u16,
}

/// Stateless client for the login/progress endpoints. Every call takes its
/// credentials explicitly.
#[derive(Clone)]
pub struct RemoteSyncClient {
    transport: Arc<dyn Transport>,
}

impl RemoteSyncClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(&config.base_url, config.timeout())?;
        Ok(Self::new(Arc::new(transport)))
    }

    pub async fn authenticate(&self, external_id: &str, secret: &str) -> Result<Login> {
        let request = TransportRequest::new(Method::Post, "/student_login/")
            .param("student_id", external_id)
            .param("password", secret);
        let response = self.send(request).await?;
        let response = ensure_success(response)?;

        let body: Value = serde_json::from_str(&response.body).map_err(|e| SyncError::ServerRejected {
            status: Some(response.status),
            message: format!("unparsable login body: {e}"),
        })?;
        let profile = body.get("student").cloned().unwrap_or(Value::Null);
        let server_identity = profile
            .get("id")
            .and_then(Value::as_i64)
            .filter(|id| *id > 0)
            .unwrap_or(0);
        if server_identity == 0 {
            tracing::warn!(external_id, "login succeeded without a server identity");
        }

        Ok(Login {
            server_identity,
            profile,
            raw_body: response.body,
            transport_code: response.status,
        })
    }

    /// POST first; on 404/405 retry once as GET. A final 404 means the server
    /// has no record yet and is returned as an empty snapshot.
    pub async fn fetch_snapshot(&self, server_identity: i64, external_id: &str, secret: &str) -> Result<Fetched> {
        ensure_identity(server_identity)?;
        let path = format!("/progress/{server_identity}/");

        let post = TransportRequest::new(Method::Post, path.clone())
            .param("student_id", external_id)
            .param("password", secret);
        let mut response = self.send(post).await?;

        let refused = [StatusCode::NOT_FOUND, StatusCode::METHOD_NOT_ALLOWED];
        if refused.iter().any(|code| code.as_u16() == response.status) {
            tracing::debug!(status = response.status, %path, "fetch POST refused, retrying as GET");
            let get = TransportRequest::new(Method::Get, path)
                .param("student_id", external_id)
                .param("password", secret);
            response = self.send(get).await?;
        }

        if response.status == StatusCode::NOT_FOUND.as_u16() {
            tracing::info!(server_identity, "no remote progress yet");
            return Ok(Fetched {
                snapshot: ProgressSnapshot::default(),
                raw_body: String::new(),
                transport_code: response.status,
                empty_remote: true,
            });
        }

        let response = ensure_success(response)?;
        let snapshot = ProgressSnapshot::from_wire(&response.body).map_err(|e| match e {
            SyncError::ServerRejected { message, .. } => SyncError::ServerRejected {
                status: Some(response.status),
                message,
            },
            other => other,
        })?;
        Ok(Fetched {
            snapshot,
            raw_body: response.body,
            transport_code: response.status,
            empty_remote: false,
        })
    }

    /// Single POST, no fallback. Rejected locally without a request when the
    /// identity is not positive or the payload is empty.
    pub async fn push_snapshot(
        &self,
        server_identity: i64,
        external_id: &str,
        secret: &str,
        payload: &str,
    ) -> Result<Pushed> {
        ensure_identity(server_identity)?;
        if payload.trim().is_empty() {
            return Err(SyncError::Custom("Nothing to upload: payload is empty".into()));
        }

        let request = TransportRequest::new(Method::Post, format!("/progress/update/{server_identity}/"))
            .param("student_id", external_id)
            .param("password", secret)
            .param("payload", payload);
        let response = ensure_success(self.send(request).await?)?;
        Ok(Pushed {
            raw_body: response.body,
            transport_code: response.status,
        })
    }

    async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
        let method = request.method;
        let path = request.path.clone();
        match self.transport.send(request).await {
            Ok(response) => {
                tracing::debug!(?method, %path, status = response.status, "response received");
                Ok(response)
            }
            Err(failure) => {
                tracing::warn!(?method, %path, error = %failure, "request failed");
                Err(failure.into())
            }
        }
    }
}

fn ensure_identity(server_identity: i64) -> Result<()> {
    if server_identity <= 0 {
        return Err(SyncError::InvalidSession(format!(
            "server identity {server_identity} is not valid"
        )));
    }
    Ok(())
}

fn ensure_success(response: TransportResponse) -> Result<TransportResponse> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(SyncError::ServerRejected {
            status: Some(response.status),
            message: truncate_body(&response.body, 200),
        })
    }
}
