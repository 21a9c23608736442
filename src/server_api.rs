//! The REST boundary consumed by the sync core.
//!
//! [`ServerApi`] is the seam: [`HttpServerApi`] talks to the real backend with
//! `reqwest`, tests plug in a scripted implementation. Replays send exactly the
//! payload an online write would have sent.

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value as JsonValue;

use crate::config::SyncConfig;
use crate::error::{ApiError, SyncError};
use crate::sync_model::ActionKind;

#[async_trait]
pub trait ServerApi: Send + Sync {
    /// Creates an event; the response is the created record including its `id`.
    async fn create_event(&self, payload: &JsonValue) -> Result<JsonValue, ApiError>;

    async fn register(&self, payload: &JsonValue) -> Result<JsonValue, ApiError>;

    async fn check_in(&self, payload: &JsonValue) -> Result<JsonValue, ApiError>;

    /// `Ok(None)` when the server has no such event.
    async fn get_event(&self, id: &str) -> Result<Option<JsonValue>, ApiError>;

    async fn list_events(&self) -> Result<Vec<JsonValue>, ApiError>;
}

/// Issues the online call equivalent to a queued action.
pub async fn replay(
    api: &dyn ServerApi,
    kind: ActionKind,
    payload: &JsonValue,
) -> Result<JsonValue, ApiError> {
    match kind {
        ActionKind::CreateEvent => api.create_event(payload).await,
        ActionKind::Register => api.register(payload).await,
        ActionKind::CheckIn => api.check_in(payload).await,
    }
}

/// Server id of a created record: `id` at the top level or under `data`,
/// as a string or a number.
pub fn server_id_of(resource: &JsonValue) -> Option<String> {
    let id = resource
        .get("id")
        .or_else(|| resource.get("data").and_then(|data| data.get("id")))?;
    match id {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Human-readable message from an error body: `message`, then `error`, then
/// the raw text.
pub fn rejection_message(body: &str, status: StatusCode) -> String {
    if let Ok(json) = serde_json::from_str::<JsonValue>(body) {
        for field in ["message", "error"] {
            if let Some(message) = json.get(field).and_then(JsonValue::as_str) {
                return message.to_string();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        trimmed.to_string()
    }
}

pub struct HttpServerApi {
    client: Client,
    config: SyncConfig,
}

impl HttpServerApi {
    pub fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SyncError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> ApiError {
        if err.is_timeout() {
            ApiError::Timeout(self.config.request_timeout())
        } else {
            ApiError::Network(err.to_string())
        }
    }

    async fn post_json(&self, path: &str, payload: &JsonValue) -> Result<JsonValue, ApiError> {
        let url = self.config.api_url(path);
        debug!("POST {url}");
        let response = self
            .authorized(self.client.post(&url))
            .json(payload)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.read_body(response).await
    }

    async fn get_json(&self, path: &str) -> Result<Option<JsonValue>, ApiError> {
        let url = self.config.api_url(path);
        debug!("GET {url}");
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        self.read_body(response).await.map(Some)
    }

    async fn read_body(&self, response: Response) -> Result<JsonValue, ApiError> {
        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            return Err(ApiError::Rejected {
                status: status.as_u16(),
                message: rejection_message(&body, status),
            });
        }
        if body.trim().is_empty() {
            return Ok(JsonValue::Null);
        }
        // A 2xx means the write happened; a non-JSON body is kept as text.
        match serde_json::from_str(&body) {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!("Non-JSON {status} body kept as text: {e}");
                Ok(JsonValue::String(body))
            }
        }
    }
}

#[async_trait]
impl ServerApi for HttpServerApi {
    async fn create_event(&self, payload: &JsonValue) -> Result<JsonValue, ApiError> {
        self.post_json(&self.config.endpoints.events, payload).await
    }

    async fn register(&self, payload: &JsonValue) -> Result<JsonValue, ApiError> {
        self.post_json(&self.config.endpoints.registrations, payload)
            .await
    }

    async fn check_in(&self, payload: &JsonValue) -> Result<JsonValue, ApiError> {
        self.post_json(&self.config.endpoints.check_ins, payload).await
    }

    async fn get_event(&self, id: &str) -> Result<Option<JsonValue>, ApiError> {
        let path = format!("{}/{id}", self.config.endpoints.events);
        match self.get_json(&path).await? {
            Some(JsonValue::Object(mut object)) if object.contains_key("data") && !object.contains_key("id") => {
                Ok(object.remove("data"))
            }
            other => Ok(other),
        }
    }

    async fn list_events(&self) -> Result<Vec<JsonValue>, ApiError> {
        let body = self
            .get_json(&self.config.endpoints.events)
            .await?
            .unwrap_or(JsonValue::Array(Vec::new()));
        match body {
            JsonValue::Array(events) => Ok(events),
            JsonValue::Object(mut object) => match object.remove("data").or_else(|| object.remove("events")) {
                Some(JsonValue::Array(events)) => Ok(events),
                _ => Err(ApiError::MalformedResponse(
                    "event list is neither an array nor {data: [...]}".into(),
                )),
            },
            _ => Err(ApiError::MalformedResponse("event list is not an array".into())),
        }
    }
}
