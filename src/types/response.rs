//! Task status state machine and response wire type.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::request::TaskRequest;

/// Task lifecycle status.
///
/// A task progresses through these states according to a fixed state
/// machine. Terminal states (`Success`, `Failed`, `Cancelled`) admit no
/// further transitions, and self-transitions are rejected.
///
/// ```text
/// Running    -> Success, Failed, Cancelling, Cancelled
/// Cancelling -> Failed, Cancelled
/// Success    -> (terminal)
/// Failed     -> (terminal)
/// Cancelled  -> (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The worker subprocess has been started.
    Running,
    /// The task completed and produced output (terminal).
    Success,
    /// The task failed: setup error, non-zero exit, or timeout (terminal).
    Failed,
    /// A cancellation signal was observed; termination is in progress.
    Cancelling,
    /// The task was cancelled before completing (terminal).
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelling => write!(f, "cancelling"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl TaskStatus {
    /// Returns `true` if no further status can follow this one.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskmill::types::TaskStatus;
    ///
    /// assert!(!TaskStatus::Running.is_terminal());
    /// assert!(!TaskStatus::Cancelling.is_terminal());
    /// assert!(TaskStatus::Success.is_terminal());
    /// ```
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` if moving from this status to `next` is a valid
    /// transition. Self-transitions are rejected.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        if self == next {
            return false;
        }
        match self {
            Self::Running => matches!(
                next,
                Self::Success | Self::Failed | Self::Cancelling | Self::Cancelled
            ),
            Self::Cancelling => matches!(next, Self::Failed | Self::Cancelled),
            Self::Success | Self::Failed | Self::Cancelled => false,
        }
    }
}

/// A status report for one task, published by the worker side.
///
/// A task emits any number of non-terminal responses (in practice one
/// `Running`, optionally one `Cancelling`) followed by exactly one terminal
/// response. `output` is present iff the status is `Success`; `stderr`
/// carries captured diagnostics on failure. `additional_properties` always
/// equals the originating request's value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    /// Id of the request this response answers.
    pub id: Uuid,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Result payload; present iff `status == Success`.
    #[serde(default, with = "super::base64_bytes_opt")]
    pub output: Option<Vec<u8>>,

    /// Captured worker stderr, for diagnostics only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,

    /// The request's caller context, echoed back untouched.
    #[serde(default)]
    pub additional_properties: Value,
}

impl TaskResponse {
    fn for_request(request: &TaskRequest, status: TaskStatus) -> Self {
        Self {
            id: request.id,
            status,
            output: None,
            stderr: None,
            additional_properties: request.additional_properties.clone(),
        }
    }

    /// The non-terminal response published when the subprocess starts.
    pub fn running(request: &TaskRequest) -> Self {
        Self::for_request(request, TaskStatus::Running)
    }

    /// The non-terminal response published when termination begins.
    pub fn cancelling(request: &TaskRequest) -> Self {
        Self::for_request(request, TaskStatus::Cancelling)
    }

    /// A terminal success carrying the worker's output payload.
    pub fn success(request: &TaskRequest, output: Vec<u8>) -> Self {
        let mut response = Self::for_request(request, TaskStatus::Success);
        response.output = Some(output);
        response
    }

    /// A terminal failure with captured diagnostics.
    pub fn failed(request: &TaskRequest, stderr: impl Into<String>) -> Self {
        let mut response = Self::for_request(request, TaskStatus::Failed);
        let stderr = stderr.into();
        if !stderr.is_empty() {
            response.stderr = Some(stderr);
        }
        response
    }

    /// A terminal cancellation, optionally with diagnostics captured before
    /// the process died.
    pub fn cancelled(request: &TaskRequest, stderr: Option<String>) -> Self {
        let mut response = Self::for_request(request, TaskStatus::Cancelled);
        response.stderr = stderr.filter(|s| !s.is_empty());
        response
    }

    /// Returns `true` if this response's status is terminal.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Typed view over the output payload, parsed as JSON.
    ///
    /// Returns `None` when there is no output (any non-success status).
    pub fn output_json<T: DeserializeOwned>(&self) -> Option<serde_json::Result<T>> {
        self.output.as_deref().map(serde_json::from_slice)
    }

    /// Typed view over the echoed caller context.
    pub fn properties_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.additional_properties.clone())
    }
}
