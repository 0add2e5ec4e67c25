//! Broker HTTP surface consumed by the score server.
//!
//! Bodies are plain descriptors, not the `/api/v1` envelope; failures carry
//! only a status code and the error text.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, error};

use crate::error::BrokerError;
use crate::{ApiState, blocking};

/// Body of `POST /problem`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AcquireRequest {
    pub problem_name: String,
}

/// GET /problem/{name}
pub async fn get_problem_environment(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Response {
    blocking(move || match state.broker.describe(&name) {
        Ok(descriptor) => Json(descriptor).into_response(),
        Err(e) => broker_error(e),
    })
    .await
}

/// POST /problem
pub async fn acquire_problem_environment(
    State(state): State<ApiState>,
    payload: Result<Json<AcquireRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) if !request.problem_name.is_empty() => request,
        Ok(_) => return (StatusCode::BAD_REQUEST, "problemName is empty").into_response(),
        Err(rejection) => {
            debug!(error = %rejection, "malformed acquire request");
            return (StatusCode::BAD_REQUEST, rejection.body_text()).into_response();
        }
    };

    blocking(move || match state.broker.acquire(&request.problem_name) {
        Ok(descriptor) => Json(descriptor).into_response(),
        Err(e) => broker_error(e),
    })
    .await
}

/// DELETE /problem/{name}
pub async fn release_problem_environment(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Response {
    blocking(move || match state.broker.release(&name) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => broker_error(e),
    })
    .await
}

/// GET /healthz
pub async fn healthz() -> &'static str {
    "ok"
}

/// HTTP status for a broker failure.
pub fn status_for(e: &BrokerError) -> StatusCode {
    match e {
        BrokerError::EnvironmentNotFound(_) | BrokerError::ProblemNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        BrokerError::NoAvailableEnvironment(_) => StatusCode::SERVICE_UNAVAILABLE,
        BrokerError::Conflict(_) => StatusCode::CONFLICT,
        BrokerError::WorkerNotFound(_) | BrokerError::State(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn broker_error(e: BrokerError) -> Response {
    let status = status_for(&e);
    if status.is_server_error() {
        error!(error = %e, "broker request failed");
    } else {
        debug!(error = %e, status = status.as_u16(), "broker request rejected");
    }
    (status, e.to_string()).into_response()
}
