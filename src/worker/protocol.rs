//! Message bodies carried inside frames.
//!
//! A request body is the JSON-encoded payload itself. A reply body is a
//! tagged JSON object so that a task failure can never be confused with a
//! normal result.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;

/// A task failed while handling one payload.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct TaskFailure {
    pub message: String,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Outcome of one payload as seen by the parent.
pub type PayloadResult<O> = std::result::Result<O, TaskFailure>;

/// Reply from worker to parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Reply<O> {
    /// Task returned normally.
    #[serde(rename = "result")]
    Result { value: O },

    /// Task failed.
    #[serde(rename = "error")]
    Error { message: String },
}

impl<O> Reply<O> {
    /// Create an error reply.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn into_result(self) -> PayloadResult<O> {
        match self {
            Self::Result { value } => Ok(value),
            Self::Error { message } => Err(TaskFailure { message }),
        }
    }
}

impl<O> From<PayloadResult<O>> for Reply<O> {
    fn from(result: PayloadResult<O>) -> Self {
        match result {
            Ok(value) => Self::Result { value },
            Err(failure) => Self::Error {
                message: failure.message,
            },
        }
    }
}

impl<O: Serialize> Reply<O> {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl<O: DeserializeOwned> Reply<O> {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Encode a request payload.
pub fn encode_payload<P: Serialize>(payload: &P) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

/// Decode a request payload.
pub fn decode_payload<P: DeserializeOwned>(bytes: &[u8]) -> Result<P> {
    Ok(serde_json::from_slice(bytes)?)
}
