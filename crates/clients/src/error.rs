use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// Backend call failures, split so callers can absorb idempotent conflicts.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    pub fn is_conflict(&self) -> bool { matches!(self, ClientError::Conflict(_)) }
    pub fn is_not_found(&self) -> bool { matches!(self, ClientError::NotFound(_)) }

    pub fn from_status(status: StatusCode, message: String) -> Self {
        match status {
            StatusCode::CONFLICT => ClientError::Conflict(message),
            StatusCode::NOT_FOUND => ClientError::NotFound(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClientError::Unauthorized(message),
            s => ClientError::Status { status: s.as_u16(), message },
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() { ClientError::Decode(e.to_string()) } else { ClientError::Transport(e.to_string()) }
    }
}

/// Pass successful responses through; turn the rest into a [`ClientError`]
/// carrying the body's `message`/`errors` text when there is one.
pub(crate) async fn check(what: &str, resp: reqwest::Response) -> ClientResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.bytes().await.unwrap_or_default();
    let detail = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .or_else(|| v.pointer("/errors/0/message").and_then(|m| m.as_str()).map(str::to_string))
        })
        .unwrap_or_else(|| String::from_utf8_lossy(&body).to_string());
    Err(ClientError::from_status(status, format!("{} ({}): {}", what, status.as_u16(), detail)))
}
