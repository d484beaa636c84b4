//! Handler errors

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum WebError {
    #[error(transparent)]
    Common(#[from] ghostrunner_common::Error),

    #[error("Invalid form: {0}")]
    BadRequest(String),
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        match self {
            WebError::Common(e) => {
                error!("Request failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, Html("<h1>Server error</h1>".to_string())).into_response()
            }
            WebError::BadRequest(msg) => (StatusCode::BAD_REQUEST, Html(format!("<h1>{}</h1>", msg))).into_response(),
        }
    }
}
