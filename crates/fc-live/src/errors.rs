use thiserror::Error;

/// Errors from the Xbox Live service clients (MPSD and social).
#[derive(Error, Debug)]
pub enum LiveError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error {status}: {body_snippet}")]
    Http {
        status: reqwest::StatusCode,
        body_snippet: String,
    },

    #[error("JSON serialization/deserialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("no authenticated identities available")]
    NoIdentities,

    #[error("session is not running")]
    NotRunning,

    #[error("max reconnect attempts exceeded")]
    ReconnectExhausted,
}

impl LiveError {
    pub async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self::Http {
            status,
            body_snippet: body.chars().take(200).collect(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LiveError>;
