use std::{io, result};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use landmarker_shared::{log::error, thiserror};

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Content error: {0}")]
    Content(#[from] landmarker_content::Error),
    #[error("IoError: {0}")]
    IoError(#[from] io::Error),
}

/// Error that is returned from a request handler.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Maps the content errors to status codes. Only missing items and failed saves are the client's
/// business, everything else is an internal error.
impl From<landmarker_content::Error> for ApiError {
    fn from(err: landmarker_content::Error) -> Self {
        use landmarker_content::Error as E;
        let status = match &err {
            E::NotFound(_) | E::InvalidTemplate { .. } => StatusCode::NOT_FOUND,
            E::SaveConflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {err}");
        }
        Self::new(status, err.to_string())
    }
}

impl From<io::Error> for ApiError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            _ => {
                error!("Request failed: {err}");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}
