//! Wire encoding for broker traffic.
//!
//! Requests and responses travel the broker as self-contained JSON frames.
//! Encoding is centralized here so the broker trait can stay byte-oriented:
//! the dispatcher decodes request frames (dropping undecodable ones), the
//! coordinator decodes response frames.

use bytes::Bytes;

use crate::error::Result;
use crate::types::{TaskRequest, TaskResponse};

/// Encodes a request into a broker frame.
pub fn encode_request(request: &TaskRequest) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(request)?))
}

/// Decodes a request frame.
pub fn decode_request(frame: &[u8]) -> Result<TaskRequest> {
    Ok(serde_json::from_slice(frame)?)
}

/// Encodes a response into a broker frame.
pub fn encode_response(response: &TaskResponse) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(response)?))
}

/// Decodes a response frame.
pub fn decode_response(frame: &[u8]) -> Result<TaskResponse> {
    Ok(serde_json::from_slice(frame)?)
}
