#![allow(non_snake_case)]

use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;

use serde::Serialize;

pub type Result<T> = std::result::Result<T, Error>;

pub async fn handler404(path: Uri) -> (StatusCode, Json<Error>) {
    (
        StatusCode::NOT_FOUND,
        Json(Error::NotFound {
            message: format!("Invalid path: {}", path),
        }),
    )
}

pub fn Fine<V>(v: V) -> Success<V>
where
    V: Serialize,
{
    Success::of(v)
}

#[derive(Debug, Clone, Serialize)]
pub struct Success<V> {
    success: bool,
    #[serde(flatten)]
    value: V,
}

impl<V> IntoResponse for Success<V>
where
    V: Serialize,
{
    fn into_response(self) -> Response {
        Json::into_response(Json(self))
    }
}

impl<V: Serialize> Success<V> {
    pub fn of(value: V) -> Self {
        Self {
            success: true,
            value,
        }
    }
}

#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[serde(tag = "error")]
pub enum Error {
    #[error("{message}")]
    Validation { message: String },
    #[error("{message}")]
    NotFound { message: String },
    #[error("{message}")]
    InvalidPayload { message: String },
    #[error("{message}")]
    UnsupportedMediaType { message: String },
    #[error("{kind}: {message}")]
    Store { kind: &'static str, message: String },
}

impl Error {
    pub fn validation<S: Into<String>>(msg: S) -> Error {
        Error::Validation {
            message: msg.into(),
        }
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Error {
        Error::NotFound {
            message: msg.into(),
        }
    }

    pub fn invalid_payload<S: Into<String>>(msg: S) -> Error {
        Error::InvalidPayload {
            message: msg.into(),
        }
    }

    pub fn store<S: Into<String>>(kind: &'static str, msg: S) -> Error {
        Error::Store {
            kind,
            message: msg.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation { .. } | Error::InvalidPayload { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error comes from user input rather than the backing store.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Store { .. })
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Store {
            kind: "DatabaseError",
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Store {
            kind: "SerializationError",
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Store {
            kind: "StorageError",
            message: format!("{:#}", err),
        }
    }
}
