// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Ludus API plumbing: request model, executor and per-user fan-out

pub mod aggregate;
pub mod dispatch;
pub mod redeploy;

pub use dispatch::dispatch;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Name of the auth header Ludus expects on every call
pub const API_KEY_HEADER: &str = "X-Api-Key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    None,
    Json(Value),
    /// Multipart upload with a `file` part and a stringified `force` field
    Upload {
        content: Vec<u8>,
        file_name: String,
        force: bool,
    },
}

/// One upstream call on behalf of one user
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub method: Method,
    pub url: String,
    pub payload: Payload,
    pub user_id: String,
}

impl DispatchRequest {
    pub fn new(method: Method, url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            payload: Payload::None,
            user_id: user_id.into(),
        }
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.payload = Payload::Json(body);
        self
    }

    /// Uploads are always sent as PUT
    pub fn upload(url: impl Into<String>, user_id: impl Into<String>, content: Vec<u8>, force: bool) -> Self {
        Self {
            method: Method::Put,
            url: url.into(),
            payload: Payload::Upload {
                content,
                file_name: "topology.yml".to_string(),
                force,
            },
            user_id: user_id.into(),
        }
    }
}

/// Raw upstream answer: status plus the decoded body (or its text when not JSON)
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamReply {
    pub status: u16,
    pub body: Value,
}

impl UpstreamReply {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("{0}")]
    Transport(String),

    #[error("upstream returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("{0}")]
    Rejected(String),
}

/// Result of one dispatched request, tagged with the user it ran for
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub user_id: String,
    pub result: Result<Value, DispatchError>,
}

impl Outcome {
    pub fn success(user_id: impl Into<String>, value: Value) -> Self {
        Self { user_id: user_id.into(), result: Ok(value) }
    }

    pub fn failure(user_id: impl Into<String>, error: DispatchError) -> Self {
        Self { user_id: user_id.into(), result: Err(error) }
    }

    /// Single place where upstream replies become successes or failures.
    /// Non-2xx statuses and bodies carrying an `error` key are failures.
    pub fn classify(user_id: impl Into<String>, executed: Result<UpstreamReply, DispatchError>) -> Self {
        let user_id = user_id.into();
        let reply = match executed {
            Ok(reply) => reply,
            Err(e) => return Self::failure(user_id, e),
        };
        let embedded = embedded_error(&reply.body);
        if !(200..300).contains(&reply.status) {
            let message = embedded.unwrap_or_else(|| body_text(&reply.body));
            return Self::failure(user_id, DispatchError::Status { status: reply.status, message });
        }
        match embedded {
            Some(message) => Self::failure(user_id, DispatchError::Rejected(message)),
            None => Self::success(user_id, reply.body),
        }
    }

    pub fn value(&self) -> Option<&Value> {
        self.result.as_ref().ok()
    }

    /// `{userId, response}` or `{userId, error}`
    pub fn to_json(&self) -> Value {
        match &self.result {
            Ok(value) => serde_json::json!({ "userId": self.user_id, "response": value }),
            Err(e) => serde_json::json!({ "userId": self.user_id, "error": e.to_string() }),
        }
    }
}

fn embedded_error(body: &Value) -> Option<String> {
    body.as_object()?.get("error").map(body_text)
}

fn body_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Performs one upstream call. Only transport failures are errors here;
/// status interpretation is left to [`Outcome::classify`].
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: &DispatchRequest, api_key: &str) -> Result<UpstreamReply, DispatchError>;
}

/// reqwest-backed executor for the Ludus API
pub struct LudusClient {
    client: reqwest::Client,
}

impl LudusClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true) // Ludus ships self-signed certs
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Executor for LudusClient {
    async fn execute(&self, request: &DispatchRequest, api_key: &str) -> Result<UpstreamReply, DispatchError> {
        debug!("Ludus {:?} {} for {}", request.method, request.url, request.user_id);

        let builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
            Method::Put => self.client.put(&request.url),
            Method::Delete => self.client.delete(&request.url),
        }
        .header(API_KEY_HEADER, api_key);

        let builder = match &request.payload {
            Payload::None => builder,
            Payload::Json(body) => builder.json(body),
            Payload::Upload { content, file_name, force } => {
                let part = reqwest::multipart::Part::bytes(content.clone())
                    .file_name(file_name.clone())
                    .mime_str("application/octet-stream")
                    .map_err(|e| DispatchError::Transport(format!("Failed to build upload: {}", e)))?;
                let form = reqwest::multipart::Form::new()
                    .part("file", part)
                    .text("force", force.to_string());
                builder.multipart(form)
            }
        };

        let resp = builder
            .send()
            .await
            .map_err(|e| DispatchError::Transport(format!("Ludus request failed: {}", e)))?;
        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| DispatchError::Transport(format!("Ludus response read failed: {}", e)))?;

        Ok(UpstreamReply { status, body: decode_body(text) })
    }
}

/// JSON when it parses, the raw text otherwise
pub fn decode_body(text: String) -> Value {
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

/// URL builders for the two Ludus listeners (user API and admin API)
#[derive(Debug, Clone)]
pub struct LudusUrls {
    base: String,
    admin: String,
}

impl LudusUrls {
    pub fn new(base: &str, admin: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            admin: admin.trim_end_matches('/').to_string(),
        }
    }

    pub fn user_create(&self) -> String {
        format!("{}/user", self.admin)
    }

    pub fn user_delete(&self, user_id: &str) -> String {
        format!("{}/user/{}", self.admin, urlencoding::encode(user_id))
    }

    pub fn user(&self, user_id: &str) -> String {
        format!("{}/user?userID={}", self.base, urlencoding::encode(user_id))
    }

    pub fn wireguard(&self, user_id: &str) -> String {
        format!("{}/user/wireguard?userID={}", self.base, urlencoding::encode(user_id))
    }

    pub fn range(&self, user_id: &str) -> String {
        format!("{}/range/?userID={}", self.base, urlencoding::encode(user_id))
    }

    pub fn range_deploy(&self, user_id: &str) -> String {
        format!("{}/range/deploy/?userID={}", self.base, urlencoding::encode(user_id))
    }

    pub fn range_abort(&self, user_id: &str) -> String {
        format!("{}/range/abort/?userID={}", self.base, urlencoding::encode(user_id))
    }

    pub fn range_config(&self, user_id: &str) -> String {
        format!("{}/range/config?userID={}", self.base, urlencoding::encode(user_id))
    }

    pub fn range_logs(&self, user_id: &str) -> String {
        format!("{}/range/logs/?userID={}", self.base, urlencoding::encode(user_id))
    }

    pub fn range_access(&self) -> String {
        format!("{}/range/access", self.base)
    }

    pub fn ansible(&self) -> String {
        format!("{}/ansible", self.base)
    }
}

/// Body for a full deploy of every tag
pub fn deploy_body() -> Value {
    serde_json::json!({ "tags": "all", "force": true })
}
