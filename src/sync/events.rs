use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::{FailureKind, SyncError};

/// The reconciliation procedures the host can trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Workflow {
    Bootstrap,
    LoginSync,
    MenuSync,
    UploadOnly,
}

impl Workflow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Workflow::Bootstrap => "bootstrap",
            Workflow::LoginSync => "login_sync",
            Workflow::MenuSync => "menu_sync",
            Workflow::UploadOnly => "upload_only",
        }
    }
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Workflow {
    type Err = SyncError;

    /// Parses trigger names as sent by lifecycle/FSM events.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "bootstrap" => Ok(Workflow::Bootstrap),
            "login_sync" | "loginsync" => Ok(Workflow::LoginSync),
            "menu_sync" | "menusync" => Ok(Workflow::MenuSync),
            "upload_only" | "uploadonly" | "upload" => Ok(Workflow::UploadOnly),
            other => Err(SyncError::Custom(format!("Unknown sync workflow: {other}"))),
        }
    }
}

/// Terminal result of one workflow run.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub workflow: Workflow,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// MenuSync only: a divergence was detected and an upload attempted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded: Option<bool>,
}

impl SyncOutcome {
    pub fn succeeded(workflow: Workflow, uploaded: Option<bool>) -> Self {
        Self {
            workflow,
            success: true,
            reason: None,
            failure: None,
            uploaded,
        }
    }

    pub fn failed(workflow: Workflow, error: &SyncError) -> Self {
        Self {
            workflow,
            success: false,
            reason: Some(error.to_string()),
            failure: Some(error.kind()),
            uploaded: None,
        }
    }
}

/// Notifications the orchestrator sends to UI bindings.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "event", content = "data")]
pub enum SyncEvent {
    Started { workflow: Workflow },
    StepCompleted { workflow: Workflow, step: &'static str },
    Finished(SyncOutcome),
}
