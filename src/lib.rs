//! # Offline Sync Core
//!
//! Offline-first synchronization for the volunteer event client: writes made
//! without connectivity are queued durably on the device and replayed against
//! the REST API once the connection comes back, and server records are cached
//! for reading while offline.
//!
//! ## Components
//!
//! - [`local_store`] / [`lmdb_store`]: namespaced key-value persistence (LMDB on device)
//! - [`cache_manager`]: last-known-good copies of server entities
//! - [`pending_queue`]: queued `create-event`, `register` and `check-in` writes,
//!   temporary-id mappings and dependency rewriting
//! - [`connectivity`]: online/offline signal and listeners
//! - [`reconciler`]: ordered, coalesced replay of the queue
//! - [`engine`]: the facade UI code talks to
//!
//! ## Quick Start
//!
//! ```no_run
//! use offline_sync_core::{ActionKind, SubmitOutcome, SyncConfig, SyncEngine};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), offline_sync_core::SyncError> {
//! let config = SyncConfig::from_json_str(r#"{"store_path":"volunteer_app","api_base_url":"https://api.example.org"}"#)?;
//! let engine = SyncEngine::open(&config)?;
//! engine.start().await;
//!
//! engine.monitor().set_online(false);
//! let outcome = engine
//!     .submit(ActionKind::CreateEvent, json!({"title": "Beach cleanup"}))
//!     .await?;
//! if let SubmitOutcome::Queued(local_id) = outcome {
//!     println!("queued as {local_id}");
//! }
//!
//! // Reconnecting drains the queue automatically.
//! engine.monitor().set_online(true);
//! # Ok(())
//! # }
//! ```
//!
//! ## FFI Functions
//!
//! Mobile shells drive the engine through C-compatible functions. Each returns
//! a JSON [`AppResponse`](app_response::AppResponse) string that must be released
//! with [`free_response`]:
//!
//! - [`create_sync_engine`] / [`close_sync_engine`] - engine lifecycle
//! - [`submit_action`] - online-first write with offline fallback
//! - [`enqueue_action`], [`list_actions`], [`remove_action`] - queue access
//! - [`failed_summary`], [`retry_failed`], [`take_storage_warnings`] - failure reporting
//! - [`cache_put`], [`cache_get`], [`cache_get_all`], [`cache_invalidate`] - cache access
//! - [`set_online`], [`set_connectivity_listener`], [`drain_queue`] - connectivity and sync

pub mod app_response;
pub mod cache_manager;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod lmdb_store;
pub mod local_store;
pub mod pending_queue;
pub mod reconciler;
pub mod server_api;
pub mod sync_model;

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;

use crate::app_response::AppResponse;

pub use crate::cache_manager::CacheManager;
pub use crate::config::SyncConfig;
pub use crate::connectivity::ConnectivityMonitor;
pub use crate::engine::{SubmitOutcome, SyncEngine};
pub use crate::error::{ApiError, SyncError};
pub use crate::local_store::{LocalStore, MemoryStore, StoreError};
pub use crate::pending_queue::PendingActionQueue;
pub use crate::reconciler::{DrainOutcome, DrainReport, SyncReconciler};
pub use crate::server_api::{HttpServerApi, ServerApi};
pub use crate::sync_model::{ActionKind, ActionStatus, LocalId, PendingAction};

/// Engine plus the runtime that drives its network calls and auto-sync task.
pub struct SyncHandle {
    engine: Arc<SyncEngine>,
    runtime: tokio::runtime::Runtime,
}

/// Creates an engine from a JSON [`SyncConfig`].
///
/// Opens (or creates) the LMDB store at `<store_path>.lmdb`, loads any queued
/// actions left from a previous session and starts a background drain plus
/// the auto-sync task.
///
/// # Parameters
///
/// * `config_json` - Null-terminated JSON configuration; `{}` selects all defaults
///
/// # Returns
///
/// A pointer to the [`SyncHandle`], or null if the configuration is invalid or
/// the store cannot be opened. Release it with [`close_sync_engine`].
///
/// # Examples
///
/// ```no_run
/// use std::ffi::CString;
/// use offline_sync_core::create_sync_engine;
///
/// let config = CString::new(r#"{"store_path":"volunteer_app"}"#).unwrap();
/// let handle = create_sync_engine(config.as_ptr());
/// assert!(!handle.is_null());
/// ```
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn create_sync_engine(config_json: *const c_char) -> *mut SyncHandle {
    if config_json.is_null() {
        warn!("Null config pointer passed to create_sync_engine");
        return std::ptr::null_mut();
    }

    let raw = match unsafe { CStr::from_ptr(config_json).to_str() } {
        Ok(s) => s,
        Err(e) => {
            warn!("Invalid UTF-8 in config parameter: {e}");
            return std::ptr::null_mut();
        }
    };

    let config = match SyncConfig::from_json_str(raw) {
        Ok(config) => config,
        Err(e) => {
            warn!("Rejected sync config: {e}");
            return std::ptr::null_mut();
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("offline-sync")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!("Failed to start sync runtime: {e}");
            return std::ptr::null_mut();
        }
    };

    let engine = match SyncEngine::open(&config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            warn!("Failed to open sync engine at {}.lmdb: {e}", config.store_path);
            return std::ptr::null_mut();
        }
    };

    let starting = Arc::clone(&engine);
    runtime.spawn(async move {
        starting.start().await;
    });

    info!("Sync engine ready at {}.lmdb", config.store_path);
    Box::into_raw(Box::new(SyncHandle { engine, runtime }))
}

/// Releases a handle from [`create_sync_engine`]. Stops auto-sync; queued
/// actions stay on disk for the next session.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn close_sync_engine(handle: *mut SyncHandle) -> *const c_char {
    if handle.is_null() {
        let error = AppResponse::BadRequest("Null handle passed to close_sync_engine".to_string());
        return response_to_c_string(&error);
    }

    let handle = unsafe { Box::from_raw(handle) };
    drop(handle);
    response_to_c_string(&AppResponse::success("Sync engine closed"))
}

/// Online-first write: sends now when possible, queues otherwise.
///
/// # Parameters
///
/// * `handle` - Engine handle
/// * `kind` - `create-event`, `register` or `check-in`
/// * `payload_json` - The payload an online write would send
///
/// # Returns
///
/// `Ok` with `{"state":"sent","value":<server response>}` or
/// `{"state":"queued","value":"temp_..."}`; `ServerRejected` when the server
/// refused the write while online.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn submit_action(
    handle: *mut SyncHandle,
    kind: *const c_char,
    payload_json: *const c_char,
) -> *const c_char {
    let handle = match handle_ref(handle, "submit_action") {
        Ok(handle) => handle,
        Err(err) => return err,
    };
    let (kind, payload) = match parse_action(kind, payload_json) {
        Ok(parsed) => parsed,
        Err(err) => return err,
    };

    match handle.runtime.block_on(handle.engine.submit(kind, payload)) {
        Ok(outcome) => json_response(&outcome),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Queues a write without trying the server first.
///
/// Returns `Ok` with the new temporary id.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn enqueue_action(
    handle: *mut SyncHandle,
    kind: *const c_char,
    payload_json: *const c_char,
) -> *const c_char {
    let handle = match handle_ref(handle, "enqueue_action") {
        Ok(handle) => handle,
        Err(err) => return err,
    };
    let (kind, payload) = match parse_action(kind, payload_json) {
        Ok(parsed) => parsed,
        Err(err) => return err,
    };

    match handle.engine.queue().enqueue(kind, payload) {
        Ok(local_id) => response_to_c_string(&AppResponse::Ok(local_id.to_string())),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Lists queued actions, oldest first.
///
/// # Parameters
///
/// * `handle` - Engine handle
/// * `status` - `pending`, `syncing` or `failed` to filter; null for all
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn list_actions(handle: *mut SyncHandle, status: *const c_char) -> *const c_char {
    let handle = match handle_ref(handle, "list_actions") {
        Ok(handle) => handle,
        Err(err) => return err,
    };

    let filter = if status.is_null() {
        None
    } else {
        let raw = match c_ptr_to_string(status, "status") {
            Ok(raw) => raw,
            Err(err) => return err,
        };
        match ActionStatus::parse(&raw) {
            Some(status) => Some(status),
            None => {
                let error = AppResponse::ValidationError(format!("Unknown status: {raw}"));
                return response_to_c_string(&error);
            }
        }
    };

    json_response(&handle.engine.queue().list(filter))
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn remove_action(handle: *mut SyncHandle, local_id: *const c_char) -> *const c_char {
    let handle = match handle_ref(handle, "remove_action") {
        Ok(handle) => handle,
        Err(err) => return err,
    };
    let local_id = match parse_local_id(local_id) {
        Ok(local_id) => local_id,
        Err(err) => return err,
    };

    match handle.engine.queue().remove(&local_id) {
        Ok(Some(_)) => response_to_c_string(&AppResponse::success("Action removed")),
        Ok(None) => {
            let not_found = AppResponse::NotFound(format!("No pending action with id: {local_id}"));
            response_to_c_string(&not_found)
        }
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Count and per-item reasons of actions that will not be retried automatically.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn failed_summary(handle: *mut SyncHandle) -> *const c_char {
    match handle_ref(handle, "failed_summary") {
        Ok(handle) => json_response(&handle.engine.queue().failed_summary()),
        Err(err) => err,
    }
}

/// Moves failed actions back to `pending`. Returns `Ok` with the count; the
/// next drain picks them up.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn retry_failed(handle: *mut SyncHandle) -> *const c_char {
    let handle = match handle_ref(handle, "retry_failed") {
        Ok(handle) => handle,
        Err(err) => return err,
    };

    match handle.engine.queue().retry_failed() {
        Ok(count) => response_to_c_string(&AppResponse::Ok(count.to_string())),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Queue changes that could not be written because the device is full.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn take_storage_warnings(handle: *mut SyncHandle) -> *const c_char {
    match handle_ref(handle, "take_storage_warnings") {
        Ok(handle) => json_response(&handle.engine.queue().take_warnings()),
        Err(err) => err,
    }
}

/// Stores a snapshot of a server entity.
///
/// # Parameters
///
/// * `handle` - Engine handle
/// * `entity_type` - Namespace such as `event`
/// * `id` - Server id
/// * `payload_json` - The record as returned by the server
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn cache_put(
    handle: *mut SyncHandle,
    entity_type: *const c_char,
    id: *const c_char,
    payload_json: *const c_char,
) -> *const c_char {
    let handle = match handle_ref(handle, "cache_put") {
        Ok(handle) => handle,
        Err(err) => return err,
    };
    let (entity_type, id) = match parse_entity_key(entity_type, id) {
        Ok(key) => key,
        Err(err) => return err,
    };
    let payload = match parse_json(payload_json) {
        Ok(payload) => payload,
        Err(err) => return err,
    };

    match handle.engine.cache().put(&entity_type, &id, payload) {
        Ok(()) => response_to_c_string(&AppResponse::success(format!("Cached {entity_type}/{id}"))),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Reads a cached entity. A miss is `NotFound`, not an error.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn cache_get(
    handle: *mut SyncHandle,
    entity_type: *const c_char,
    id: *const c_char,
) -> *const c_char {
    let handle = match handle_ref(handle, "cache_get") {
        Ok(handle) => handle,
        Err(err) => return err,
    };
    let (entity_type, id) = match parse_entity_key(entity_type, id) {
        Ok(key) => key,
        Err(err) => return err,
    };

    match handle.engine.cache().get(&entity_type, &id) {
        Ok(Some(payload)) => json_response(&payload),
        Ok(None) => {
            let not_found = AppResponse::NotFound(format!("Nothing cached for {entity_type}/{id}"));
            response_to_c_string(&not_found)
        }
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn cache_get_all(handle: *mut SyncHandle, entity_type: *const c_char) -> *const c_char {
    let handle = match handle_ref(handle, "cache_get_all") {
        Ok(handle) => handle,
        Err(err) => return err,
    };
    let entity_type = match c_ptr_to_string(entity_type, "entity_type") {
        Ok(entity_type) => entity_type,
        Err(err) => return err,
    };

    match handle.engine.cache().get_all(&entity_type) {
        Ok(payloads) => json_response(&payloads),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn cache_invalidate(
    handle: *mut SyncHandle,
    entity_type: *const c_char,
    id: *const c_char,
) -> *const c_char {
    let handle = match handle_ref(handle, "cache_invalidate") {
        Ok(handle) => handle,
        Err(err) => return err,
    };
    let (entity_type, id) = match parse_entity_key(entity_type, id) {
        Ok(key) => key,
        Err(err) => return err,
    };

    match handle.engine.cache().invalidate(&entity_type, &id) {
        Ok(true) => response_to_c_string(&AppResponse::success("Cache entry removed")),
        Ok(false) => {
            let not_found = AppResponse::NotFound(format!("Nothing cached for {entity_type}/{id}"));
            response_to_c_string(&not_found)
        }
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Feeds the platform connectivity signal. Going online triggers a drain on
/// the engine's runtime.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn set_online(handle: *mut SyncHandle, online: bool) -> *const c_char {
    let handle = match handle_ref(handle, "set_online") {
        Ok(handle) => handle,
        Err(err) => return err,
    };

    handle.engine.monitor().set_online(online);
    let state = if online { "online" } else { "offline" };
    response_to_c_string(&AppResponse::success(state))
}

/// Registers a C callback invoked with the new status on every transition.
/// Passing null registers nothing.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn set_connectivity_listener(
    handle: *mut SyncHandle,
    callback: Option<extern "C" fn(bool)>,
) -> *const c_char {
    let handle = match handle_ref(handle, "set_connectivity_listener") {
        Ok(handle) => handle,
        Err(err) => return err,
    };

    match callback {
        Some(callback) => {
            handle.engine.monitor().on_change(move |online| callback(online));
            response_to_c_string(&AppResponse::success("Listener registered"))
        }
        None => {
            let error = AppResponse::BadRequest("Null callback passed to set_connectivity_listener".to_string());
            response_to_c_string(&error)
        }
    }
}

/// Runs one drain and blocks until it finishes. Returns the
/// [`DrainReport`] as JSON.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn drain_queue(handle: *mut SyncHandle) -> *const c_char {
    let handle = match handle_ref(handle, "drain_queue") {
        Ok(handle) => handle,
        Err(err) => return err,
    };

    let report = handle.runtime.block_on(handle.engine.sync_now());
    json_response(&report)
}

/// Frees a string returned by any function in this library.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn free_response(response: *const c_char) {
    if response.is_null() {
        return;
    }
    unsafe {
        drop(CString::from_raw(response as *mut c_char));
    }
}

/// Converts an [`AppResponse`] to a C-compatible string.
///
/// Returns a null pointer if serialization or C string creation fails.
fn response_to_c_string(response: &AppResponse) -> *const c_char {
    let json = match serde_json::to_string(response) {
        Ok(j) => j,
        Err(e) => {
            warn!("Error serializing response: {e}");
            return std::ptr::null();
        }
    };

    match CString::new(json) {
        Ok(c_str) => c_str.into_raw(),
        Err(e) => {
            warn!("Error creating CString: {e}");
            std::ptr::null()
        }
    }
}

/// Wraps `value` as JSON inside an `Ok` response.
fn json_response<T: Serialize>(value: &T) -> *const c_char {
    match serde_json::to_string(value) {
        Ok(json) => response_to_c_string(&AppResponse::Ok(json)),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Converts a C string pointer to a Rust String.
///
/// * `Ok(String)` - If conversion was successful
/// * `Err(*const c_char)` - Error response for null pointers or invalid UTF-8
fn c_ptr_to_string(ptr: *const c_char, field_name: &str) -> Result<String, *const c_char> {
    if ptr.is_null() {
        let error = AppResponse::BadRequest(format!("Null {field_name} pointer"));
        return Err(response_to_c_string(&error));
    }

    match unsafe { CStr::from_ptr(ptr).to_str() } {
        Ok(s) => Ok(s.to_string()),
        Err(e) => {
            let error = AppResponse::BadRequest(format!("Invalid UTF-8 in {field_name}: {e}"));
            Err(response_to_c_string(&error))
        }
    }
}

fn handle_ref<'a>(handle: *mut SyncHandle, fn_name: &str) -> Result<&'a SyncHandle, *const c_char> {
    match unsafe { handle.as_ref() } {
        Some(handle) => Ok(handle),
        None => {
            let error = AppResponse::BadRequest(format!("Null handle passed to {fn_name}"));
            Err(response_to_c_string(&error))
        }
    }
}

fn parse_json(ptr: *const c_char) -> Result<serde_json::Value, *const c_char> {
    let raw = c_ptr_to_string(ptr, "JSON")?;
    serde_json::from_str(&raw).map_err(|e| {
        let error = AppResponse::SerializationError(format!("Invalid JSON: {e}"));
        response_to_c_string(&error)
    })
}

fn parse_entity_key(
    entity_type: *const c_char,
    id: *const c_char,
) -> Result<(String, String), *const c_char> {
    let entity_type = c_ptr_to_string(entity_type, "entity_type")?;
    let id = c_ptr_to_string(id, "id")?;
    Ok((entity_type, id))
}

fn parse_action(
    kind: *const c_char,
    payload_json: *const c_char,
) -> Result<(ActionKind, serde_json::Value), *const c_char> {
    let raw_kind = c_ptr_to_string(kind, "kind")?;
    let kind = ActionKind::parse(&raw_kind).ok_or_else(|| {
        let error = AppResponse::ValidationError(format!("Unknown action kind: {raw_kind}"));
        response_to_c_string(&error)
    })?;
    let payload = parse_json(payload_json)?;
    Ok((kind, payload))
}

fn parse_local_id(ptr: *const c_char) -> Result<LocalId, *const c_char> {
    let raw = c_ptr_to_string(ptr, "local_id")?;
    LocalId::parse(&raw).ok_or_else(|| {
        let error = AppResponse::ValidationError(format!("Not a temporary id: {raw}"));
        response_to_c_string(&error)
    })
}
