//! Error kind to HTTP status mapping.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{error, warn};

use crate::db::DbError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("not found")]
    NotFound,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("tree db: {0}")]
    Db(#[from] DbError),

    #[error("blob store: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServeError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServeError::NotFound => StatusCode::NOT_FOUND,
            ServeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServeError::Db(DbError::NotFound) => StatusCode::NOT_FOUND,
            ServeError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServeError::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
            // a tree path resolving to a directory on disk is a bad
            // request, not a server fault
            ServeError::Store(StoreError::IsDirectory) => StatusCode::BAD_REQUEST,
            ServeError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServeError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error responses carry none of the content or caching headers, only a
/// plain-text status line.
impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_client_error() {
            warn!(%status, err = %self, "request failed");
        } else {
            error!(%status, err = %self, "request failed");
        }
        status_response(status)
    }
}

pub(crate) fn status_response(status: StatusCode) -> Response {
    let line = format!("{}\n", status.canonical_reason().unwrap_or("Error"));
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        line,
    )
        .into_response()
}
