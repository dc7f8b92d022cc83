use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::billing::{BillingError, ErrorKind};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Billing(err) => match err.kind() {
                ErrorKind::InvalidArgument | ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::InvalidState
                | ErrorKind::ConcurrencyConflict
                | ErrorKind::DuplicateEvent => StatusCode::CONFLICT,
                ErrorKind::UnresolvableReference | ErrorKind::FanOut => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                ErrorKind::GatewayUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::GatewayRejected => StatusCode::BAD_GATEWAY,
                ErrorKind::TransactionFailure => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::warn!(?self);
        }
        let body = match &self {
            AppError::Billing(BillingError::FanOut(fan_out)) => json!({
                "message": self.to_string(),
                "kind": ErrorKind::FanOut.as_str(),
                "participants": fan_out.participants,
            }),
            AppError::Billing(err) => json!({
                "message": self.to_string(),
                "kind": err.kind().as_str(),
            }),
            _ => json!({ "message": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
