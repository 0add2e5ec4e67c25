//! labgrid-api — HTTP surfaces for labgrid.
//!
//! Hosts the assignment broker used by the score server and the
//! administrative REST API used by operators, workers and the provisioning
//! driver.
//!
//! # Broker Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/problem/{name}` | Connection descriptor of an environment |
//! | POST | `/problem` | Acquire an environment (`{"problemName": ...}`) |
//! | DELETE | `/problem/{name}` | Release (delete) an environment |
//! | GET | `/healthz` | Liveness check |
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/problems` | List problems |
//! | GET/PUT/DELETE | `/api/v1/problems/{name}` | Read, apply or delete a problem |
//! | GET | `/api/v1/environments` | List problem environments |
//! | GET | `/api/v1/environments/{name}` | Get a problem environment |
//! | PUT | `/api/v1/environments/{name}/containers` | Report container status |
//! | GET | `/api/v1/workers` | List workers |
//! | GET/PUT | `/api/v1/workers/{name}` | Read or register a worker |
//! | POST | `/api/v1/workers/{name}/schedule` | Enable/disable scheduling |
//! | PUT | `/api/v1/leases/{name}` | Heartbeat |
//! | GET | `/metrics` | Prometheus exposition |

pub mod broker;
pub mod error;
pub mod gateway;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use labgrid_metrics::{LabgridMetrics, Registry};
use labgrid_state::StateStore;

pub use broker::{Broker, Descriptor};
pub use error::{BrokerError, BrokerResult};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub broker: Broker,
    pub registry: Arc<Registry>,
    /// Namespace heartbeat leases are written to.
    pub lease_namespace: String,
}

impl ApiState {
    pub fn new(
        store: StateStore,
        registry: Arc<Registry>,
        metrics: LabgridMetrics,
        lease_namespace: impl Into<String>,
    ) -> Self {
        Self {
            broker: Broker::new(store.clone(), metrics),
            store,
            registry,
            lease_namespace: lease_namespace.into(),
        }
    }
}

/// Run a handler body that touches the store on the blocking pool.
///
/// redb transactions are synchronous; keeping them off the async workers
/// means a slow commit cannot stall unrelated requests.
pub(crate) async fn blocking<F>(op: F) -> Response
where
    F: FnOnce() -> Response + Send + 'static,
{
    match tokio::task::spawn_blocking(op).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "request task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

/// Build the complete router (broker + REST API + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/problems", get(handlers::list_problems))
        .route(
            "/problems/{name}",
            get(handlers::get_problem)
                .put(handlers::put_problem)
                .delete(handlers::delete_problem),
        )
        .route("/environments", get(handlers::list_environments))
        .route("/environments/{name}", get(handlers::get_environment))
        .route(
            "/environments/{name}/containers",
            put(handlers::put_environment_containers),
        )
        .route("/workers", get(handlers::list_workers))
        .route(
            "/workers/{name}",
            get(handlers::get_worker).put(handlers::put_worker),
        )
        .route("/workers/{name}/schedule", post(handlers::set_worker_schedule))
        .route("/leases/{name}", put(handlers::put_lease))
        .with_state(state.clone());

    let broker_routes = Router::new()
        .route("/problem", post(gateway::acquire_problem_environment))
        .route(
            "/problem/{name}",
            get(gateway::get_problem_environment).delete(gateway::release_problem_environment),
        )
        .route("/healthz", get(gateway::healthz))
        .with_state(state.clone());

    Router::new()
        .merge(broker_routes)
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handler_bodies_run_off_the_async_thread() {
        let caller = std::thread::current().id();
        let resp = blocking(move || {
            assert_ne!(std::thread::current().id(), caller);
            StatusCode::NO_CONTENT.into_response()
        })
        .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn panicking_handler_body_is_500() {
        let resp = blocking(|| panic!("store exploded")).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
