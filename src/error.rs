//! Error types for the sync core.
//!
//! [`SyncError`] is what the Rust API returns. [`ApiError`] describes a failed
//! call against the server and is either surfaced directly (online writes) or
//! folded into a [`FailureReason`](crate::sync_model::FailureReason) on a queued
//! action during a drain.

use std::time::Duration;

use thiserror::Error;

use crate::local_store::StoreError;
use crate::sync_model::{ActionStatus, FailureReason, LocalId};

/// Errors returned by the cache, the queue and the engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no pending action with id {0}")]
    UnknownAction(LocalId),

    #[error("action {local_id} cannot move from {from} to {to}")]
    InvalidTransition {
        local_id: LocalId,
        from: ActionStatus,
        to: ActionStatus,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl SyncError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        SyncError::InvalidInput(msg.into())
    }

    /// True when the underlying store ran out of space.
    pub fn is_storage_full(&self) -> bool {
        matches!(self, SyncError::Store(StoreError::QuotaExceeded))
    }
}

/// Failure of a single request against the server API.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("network unavailable: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed server response: {0}")]
    MalformedResponse(String),
}

impl ApiError {
    /// Connectivity-class failures: the request may never have reached the server.
    pub fn is_network(&self) -> bool {
        matches!(self, ApiError::Network(_) | ApiError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl From<&ApiError> for FailureReason {
    fn from(err: &ApiError) -> Self {
        match err {
            ApiError::Network(_) | ApiError::Timeout(_) => FailureReason::NetworkUnavailable {
                message: err.to_string(),
            },
            ApiError::Rejected { status, message } => FailureReason::ServerRejected {
                status: Some(*status),
                message: message.clone(),
            },
            ApiError::MalformedResponse(message) => FailureReason::ServerRejected {
                status: None,
                message: message.clone(),
            },
        }
    }
}
