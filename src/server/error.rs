use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::rules::RuleError;
use crate::runtime::{ExecError, LifecycleError, TrafficError};
use crate::shaping::ShapingError;
use crate::store::StoreError;
use crate::sync::SyncError;

/// Every failure an API handler can return, by HTTP meaning
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    BadGateway(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            success: false,
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<ExecError> for ApiError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Timeout { .. } => ApiError::Timeout(err.to_string()),
            _ => ApiError::BadGateway(err.to_string()),
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::Exec(e) => e.into(),
            other => ApiError::BadGateway(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::Validation(_) => ApiError::BadRequest(message),
            StoreError::Conflict(_) => ApiError::Conflict(message),
            StoreError::ClusterNotFound(_) | StoreError::DeviceNotFound(_) => ApiError::NotFound(message),
            StoreError::InvalidTransition { .. } => ApiError::Unprocessable(message),
            StoreError::Exhausted(_) => ApiError::Unavailable(message),
            StoreError::Io(_) | StoreError::Parse(_) => ApiError::Internal(message),
        }
    }
}

impl From<ShapingError> for ApiError {
    fn from(err: ShapingError) -> Self {
        match err {
            ShapingError::Validation(_) => ApiError::BadRequest(err.to_string()),
            ShapingError::CommandFailure { .. } => ApiError::BadGateway(err.to_string()),
        }
    }
}

impl From<RuleError> for ApiError {
    fn from(err: RuleError) -> Self {
        let message = err.to_string();
        match err {
            RuleError::Validation(_) => ApiError::BadRequest(message),
            RuleError::StaleReference(_) => ApiError::NotFound(message),
            RuleError::NotRunning(_) => ApiError::Unprocessable(message),
            RuleError::Shaping(e) => e.into(),
            RuleError::Store(e) => e.into(),
            RuleError::Io(_) | RuleError::Parse(_) => ApiError::Internal(message),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let message = err.to_string();
        match err {
            SyncError::ClusterNotFound(_) => ApiError::NotFound(message),
            SyncError::InProgress(_) => ApiError::Conflict(message),
            SyncError::InvalidState(_) => ApiError::Unprocessable(message),
            SyncError::Store(e) => e.into(),
            SyncError::Lifecycle(e) => e.into(),
        }
    }
}

impl From<TrafficError> for ApiError {
    fn from(err: TrafficError) -> Self {
        match err {
            TrafficError::Validation(_) => ApiError::BadRequest(err.to_string()),
            TrafficError::Command { .. } => ApiError::BadGateway(err.to_string()),
            TrafficError::Exec(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::AllocError;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        let cases: Vec<(ApiError, StatusCode)> = vec![
            (StoreError::Validation("empty".into()).into(), StatusCode::BAD_REQUEST),
            (StoreError::ClusterNotFound(3).into(), StatusCode::NOT_FOUND),
            (
                StoreError::Exhausted(AllocError::ResourceExhausted { min: 1, max: 2 }).into(),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (SyncError::InProgress("cluster 1".into()).into(), StatusCode::CONFLICT),
            (RuleError::StaleReference("cam9".into()).into(), StatusCode::NOT_FOUND),
            (RuleError::NotRunning("cam1".into()).into(), StatusCode::UNPROCESSABLE_ENTITY),
            (
                ExecError::Timeout {
                    command: "docker ps".into(),
                    timeout: Duration::from_secs(1),
                }
                .into(),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                LifecycleError::Provisioning {
                    container: "qc_edge_cam1".into(),
                    step: "run",
                    message: "boom".into(),
                    interface: None,
                }
                .into(),
                StatusCode::BAD_GATEWAY,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(err.status(), status, "{}", err);
        }
    }

    #[test]
    fn test_shaping_error_through_rule_error() {
        let err: ApiError = RuleError::Shaping(ShapingError::Validation("ceil < rate".into())).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
