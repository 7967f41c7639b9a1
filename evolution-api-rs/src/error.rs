// evolution-api-rs/src/error.rs
// HTTP mapping of pipeline, store and ledger errors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use prompt_evolution::PipelineError;
use prompt_store::StoreError;
use run_ledger::LedgerError;
use serde::{Deserialize, Serialize};
use shared_types::ErrorClass;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("run {0} is not in flight")]
    NotInFlight(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

fn status_for_class(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Input => StatusCode::BAD_REQUEST,
        ErrorClass::Consistency => StatusCode::CONFLICT,
        ErrorClass::ExternalService | ErrorClass::Parse => StatusCode::BAD_GATEWAY,
        ErrorClass::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::VersionNotFound(_) | StoreError::NoActiveVersion => StatusCode::NOT_FOUND,
        other => status_for_class(other.class()),
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::NotInFlight(_) => StatusCode::CONFLICT,
            ApiError::Store(e) => store_status(e),
            ApiError::Pipeline(PipelineError::Store(e)) => store_status(e),
            ApiError::Pipeline(e) => status_for_class(e.class()),
            ApiError::Ledger(LedgerError::RunNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Ledger(e) => status_for_class(e.class()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request refused");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                code: status.as_u16(),
            }),
        )
            .into_response()
    }
}
