//! Task request wire type.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Wait budget applied when a caller does not set one explicitly.
pub const DEFAULT_TIMEOUT_MINUTES: u64 = 10;

/// A unit of work submitted to the engine.
///
/// The `family` routes the request to a worker pool (a script namespace);
/// the `script` selects the concrete computation inside that namespace.
/// `input` is an opaque payload handed to the worker verbatim, and
/// `additional_properties` is echoed back unchanged on every response for
/// the task, regardless of outcome.
///
/// The id is assigned at construction and never changes. Pipe endpoints for
/// the worker subprocess are allocated by the dispatcher per attempt; they
/// are not part of the request and cannot be supplied by the caller.
///
/// # Examples
///
/// ```
/// use taskmill::types::TaskRequest;
///
/// let request = TaskRequest::new("cards", "generate", br#"{"doi":"10.1/x"}"#.to_vec())
///     .with_timeout_minutes(5)
///     .with_user("u-123");
/// assert_eq!(request.family, "cards");
/// assert_eq!(request.timeout(), std::time::Duration::from_secs(300));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    /// Unique task id, immutable once assigned.
    pub id: Uuid,

    /// Coarse work category; routes to a worker pool.
    pub family: String,

    /// Concrete unit of work within the family.
    pub script: String,

    /// Opaque input payload, base64 on the wire.
    #[serde(with = "super::base64_bytes")]
    pub input: Vec<u8>,

    /// Caller context, round-tripped untouched onto every response.
    #[serde(default)]
    pub additional_properties: Value,

    /// Per-stage wait budget in minutes.
    pub timeout_minutes: u64,

    /// Identity of the requester, if known. Excluded from the cache
    /// fingerprint so identical work from different callers shares a result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl TaskRequest {
    /// Creates a request with a fresh id and the default timeout.
    pub fn new(
        family: impl Into<String>,
        script: impl Into<String>,
        input: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            family: family.into(),
            script: script.into(),
            input: input.into(),
            additional_properties: Value::Null,
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            user_id: None,
        }
    }

    /// Sets the per-stage timeout, in minutes.
    pub fn with_timeout_minutes(mut self, minutes: u64) -> Self {
        self.timeout_minutes = minutes;
        self
    }

    /// Sets the requester identity.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attaches caller context echoed back on every response.
    pub fn with_properties(mut self, properties: Value) -> Self {
        self.additional_properties = properties;
        self
    }

    /// The timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }
}
