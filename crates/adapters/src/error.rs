use std::io;
use std::path::Path;
use std::time::Duration;

use reqwest::StatusCode;
use storyforge_core::{ModelError, ModelSpecError};
use thiserror::Error;

const MAX_BODY_CHARS: usize = 300;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid adapter configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid model selection: {0}")]
    ModelSpec(#[from] ModelSpecError),
    #[error("unexpected http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
    #[error("response blocked by the provider: {0}")]
    Blocked(String),
    #[error("io error at `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("API returned an empty response")]
    EmptyResponse,
}

impl AdapterError {
    pub fn io(path: &Path, source: io::Error) -> Self {
        AdapterError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Maps a transport failure onto the gateway's failure set. Connection
    /// problems, 5xx and 429 are worth retrying; everything else is a refusal.
    pub fn into_model_error(self, deadline: Duration) -> ModelError {
        match self {
            AdapterError::Http(err) if err.is_timeout() => ModelError::Timeout(deadline),
            AdapterError::Http(err) => ModelError::Unavailable(err.to_string()),
            AdapterError::HttpStatus { status, body }
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS =>
            {
                ModelError::Unavailable(format!("{status}: {}", clip(&body)))
            }
            AdapterError::HttpStatus { status, body } => {
                ModelError::Refusal(format!("{status}: {}", clip(&body)))
            }
            other => ModelError::Refusal(other.to_string()),
        }
    }
}

fn clip(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(MAX_BODY_CHARS) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
