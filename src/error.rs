use reqwest::StatusCode;
use thiserror::Error;

/// Errors surfaced by the client layer. The tracker itself never fails.
#[derive(Debug, Error)]
pub enum Error {
    #[error("endpoint {endpoint} is rate limited; retry in {retry_after_secs}s")]
    RateLimited {
        endpoint: String,
        retry_after_secs: u64,
    },
    #[error("upstream returned {status}: {message}")]
    Upstream {
        status: StatusCode,
        message: String,
        retriable: bool,
    },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Stable machine-readable code for the error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::RateLimited { .. } => "rate_limited",
            Error::Upstream { status, .. } => status_code_name(*status),
            Error::Transport(_) => "upstream_error",
            Error::Decode(_) => "server_error",
            Error::Config(_) => "invalid_config",
        }
    }

    pub fn is_retriable(&self) -> bool {
        match self {
            Error::RateLimited { .. } | Error::Transport(_) => true,
            Error::Upstream { retriable, .. } => *retriable,
            Error::Decode(_) | Error::Config(_) => false,
        }
    }
}

fn status_code_name(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "bad_request",
        StatusCode::UNAUTHORIZED => "unauthorized",
        StatusCode::FORBIDDEN => "forbidden",
        StatusCode::NOT_FOUND => "not_found",
        StatusCode::CONFLICT => "conflict",
        StatusCode::TOO_MANY_REQUESTS => "rate_limited",
        s if s.is_server_error() => "upstream_error",
        _ => "server_error",
    }
}

/// Map a non-success status to an `Error::Upstream`.
pub fn map_status_to_error(status: StatusCode, message: String) -> Error {
    let retriable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
    Error::Upstream {
        status,
        message,
        retriable,
    }
}

pub type Result<T> = std::result::Result<T, Error>;
