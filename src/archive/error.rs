use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Failures talking to the object store
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object store answered HTTP {status} for {key}")]
    Status { key: String, status: u16 },

    #[error("Http request failed: {:?}", .0)]
    HttpRequestFailed(#[from] reqwest::Error),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("IOError: {:?}", .0)]
    IOError(#[from] std::io::Error),
}

/// Errors surfaced by the download service.
///
/// Everything except `UpstreamObjectError` and `StreamAborted` is detected
/// before the first archive byte is written.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Gallery expired")]
    Expired,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Part {0} does not exist")]
    PartNotFound(usize),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Archive of {0} bytes exceeds the store-mode limits, request it in parts")]
    ArchiveTooLarge(u64),

    #[error("Object {id} could not be fetched: {source}")]
    UpstreamObjectError {
        id: u64,
        #[source]
        source: StorageError,
    },

    #[error("Stream aborted: {0}")]
    StreamAborted(String),

    #[error("Signing error: {0}")]
    SigningError(String),
}

impl ArchiveError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ArchiveError::NotFound(_) | ArchiveError::PartNotFound(_) => StatusCode::NOT_FOUND,
            ArchiveError::Expired => StatusCode::GONE,
            ArchiveError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ArchiveError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ArchiveError::ArchiveTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ArchiveError::UpstreamObjectError { .. } => StatusCode::BAD_GATEWAY,
            ArchiveError::StreamAborted(_) | ArchiveError::SigningError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable name for the JSON body
    pub fn kind(&self) -> &'static str {
        match self {
            ArchiveError::NotFound(_) => "not_found",
            ArchiveError::Expired => "expired",
            ArchiveError::Unauthorized(_) => "unauthorized",
            ArchiveError::PartNotFound(_) => "part_not_found",
            ArchiveError::InvalidRequest(_) => "invalid_request",
            ArchiveError::ArchiveTooLarge(_) => "archive_too_large",
            ArchiveError::UpstreamObjectError { .. } => "upstream_object_error",
            ArchiveError::StreamAborted(_) => "stream_aborted",
            ArchiveError::SigningError(_) => "signing_error",
        }
    }
}

/// Response data struct
#[derive(Serialize)]
struct HttpErrorResponse {
    code: u16,
    error: &'static str,
    message: String,
}

impl IntoResponse for ArchiveError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = HttpErrorResponse {
            code: status.as_u16(),
            error: self.kind(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}
