use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::metrics::UPSTREAM_FAILURES;

/// Request-level failure categories. The player UI only gets a message
/// string, but the status code keeps caller mistakes (bad URL, missing file)
/// distinguishable from provider-side breakage.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The source URL matches no supported provider pattern.
    #[error("unsupported video url: {0}")]
    UnsupportedUrl(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Local file missing or unreadable.
    #[error("not found: {0}")]
    NotFound(String),

    /// Provider API returned a non-success status, malformed JSON, or a
    /// payload missing expected fields.
    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    fn status(&self) -> StatusCode {
        match self {
            RelayError::UnsupportedUrl(_) | RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        if let RelayError::Upstream(_) = self {
            UPSTREAM_FAILURES.inc();
        }
        let status = self.status();
        warn!("Request failed: status={} err={}", status.as_u16(), self);
        Response::builder()
            .status(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(Body::from(self.to_string()))
            .unwrap()
    }
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                RelayError::NotFound(e.to_string())
            }
            _ => RelayError::Internal(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        RelayError::Upstream(e.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
