use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{ApiError, SyncError};
use crate::local_store::StoreError;

/// Envelope returned as JSON by every C ABI function.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub enum AppResponse {
    StorageError(String),
    StorageFull(String),
    SerializationError(String),
    NetworkError(String),
    ServerRejected(String),
    NotFound(String),
    ValidationError(String),
    BadRequest(String),
    Ok(String),
}

impl Display for AppResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AppResponse::StorageError(msg) => write!(f, "Storage error: {}", msg),
            AppResponse::StorageFull(msg) => write!(f, "Storage full: {}", msg),
            AppResponse::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            AppResponse::NetworkError(msg) => write!(f, "Network error: {}", msg),
            AppResponse::ServerRejected(msg) => write!(f, "Server rejected: {}", msg),
            AppResponse::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppResponse::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppResponse::BadRequest(msg) => write!(f, "Bad Request: {}", msg),
            AppResponse::Ok(msg) => write!(f, "Ok: {}", msg),
        }
    }
}

impl From<StoreError> for AppResponse {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::QuotaExceeded => AppResponse::StorageFull(err.to_string()),
            StoreError::Backend(msg) => AppResponse::StorageError(msg),
        }
    }
}

impl From<ApiError> for AppResponse {
    fn from(err: ApiError) -> Self {
        if err.is_network() {
            AppResponse::NetworkError(err.to_string())
        } else {
            AppResponse::ServerRejected(err.to_string())
        }
    }
}

impl From<SyncError> for AppResponse {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Store(store) => AppResponse::from(store),
            SyncError::Serialization(e) => {
                AppResponse::SerializationError(format!("JSON serialization error: {}", e))
            }
            SyncError::UnknownAction(id) => {
                AppResponse::NotFound(format!("No pending action with id: {}", id))
            }
            e @ SyncError::InvalidTransition { .. } => AppResponse::ValidationError(e.to_string()),
            SyncError::InvalidInput(msg) => AppResponse::ValidationError(msg),
            SyncError::Config(msg) => AppResponse::BadRequest(format!("Invalid configuration: {}", msg)),
            SyncError::Api(api) => AppResponse::from(api),
        }
    }
}

impl From<serde_json::Error> for AppResponse {
    fn from(err: serde_json::Error) -> Self {
        AppResponse::SerializationError(format!("JSON serialization error: {}", err))
    }
}

impl AppResponse {
    pub fn success(msg: impl Into<String>) -> Self {
        AppResponse::Ok(msg.into())
    }
}
