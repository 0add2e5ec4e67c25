//! Administrative REST API handlers.
//!
//! Each handler reads/writes via `StateStore` on the blocking pool and returns
//! JSON responses.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{error, info};

use labgrid_state::*;

use crate::{ApiState, blocking};

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn state_error(e: &StateError) -> Response {
    let status = match e {
        StateError::NotFound { .. } => StatusCode::NOT_FOUND,
        StateError::AlreadyExists { .. } | StateError::Conflict { .. } => StatusCode::CONFLICT,
        StateError::Invalid(_) => StatusCode::BAD_REQUEST,
        _ => {
            error!(error = %e, "store operation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(&e.to_string(), status)
}

fn respond<T: serde::Serialize>(result: StateResult<T>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(e) => state_error(&e),
    }
}

fn respond_found<T: serde::Serialize>(result: StateResult<Option<T>>, what: &str) -> Response {
    match result {
        Ok(Some(data)) => ApiResponse::ok(data).into_response(),
        Ok(None) => error_response(&format!("{what} not found"), StatusCode::NOT_FOUND),
        Err(e) => state_error(&e),
    }
}

// ── Problems ───────────────────────────────────────────────────

/// GET /api/v1/problems
pub async fn list_problems(State(state): State<ApiState>) -> Response {
    blocking(move || respond(state.store.list::<Problem>())).await
}

/// GET /api/v1/problems/{name}
pub async fn get_problem(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    blocking(move || respond_found(state.store.get::<Problem>(&name), "problem")).await
}

/// PUT /api/v1/problems/{name}
///
/// Creates the problem, or replaces the spec of an existing one.
pub async fn put_problem(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(spec): Json<ProblemSpec>,
) -> Response {
    blocking(move || apply_problem(&state.store, &name, spec)).await
}

fn apply_problem(store: &StateStore, name: &str, spec: ProblemSpec) -> Response {
    let result = match store.get::<Problem>(name) {
        Ok(Some(mut problem)) => {
            problem.spec = spec;
            store.update(&problem).map(|p| (StatusCode::OK, p))
        }
        Ok(None) => store
            .create(Problem::new(ObjectMeta::named(name), spec))
            .map(|p| (StatusCode::CREATED, p)),
        Err(e) => Err(e),
    };

    match result {
        Ok((status, problem)) => {
            info!(problem = %name, generation = problem.metadata.generation, "problem applied");
            (status, ApiResponse::ok(problem)).into_response()
        }
        Err(e) => state_error(&e),
    }
}

/// DELETE /api/v1/problems/{name}
pub async fn delete_problem(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    blocking(move || match state.store.delete::<Problem>(&name) {
        Ok(true) => {
            info!(problem = %name, "problem deleted");
            ApiResponse::ok("deleted").into_response()
        }
        Ok(false) => error_response("problem not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(&e),
    })
    .await
}

// ── Environments ───────────────────────────────────────────────

/// GET /api/v1/environments
pub async fn list_environments(State(state): State<ApiState>) -> Response {
    blocking(move || respond(state.store.list::<ProblemEnvironment>())).await
}

/// GET /api/v1/environments/{name}
pub async fn get_environment(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    blocking(move || {
        respond_found(
            state.store.get::<ProblemEnvironment>(&name),
            "problem environment",
        )
    })
    .await
}

/// PUT /api/v1/environments/{name}/containers
///
/// Reported by the provisioning driver. Readiness itself is derived by the
/// scheduler from these details.
pub async fn put_environment_containers(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(containers): Json<ContainersStatus>,
) -> Response {
    blocking(move || report_containers(&state.store, &name, containers)).await
}

fn report_containers(store: &StateStore, name: &str, containers: ContainersStatus) -> Response {
    let mut pe = match store.get::<ProblemEnvironment>(name) {
        Ok(Some(pe)) => pe,
        Ok(None) => return error_response("problem environment not found", StatusCode::NOT_FOUND),
        Err(e) => return state_error(&e),
    };

    let deployed = !containers.details.is_empty();
    pe.status.containers = Some(containers);
    if deployed {
        set_condition(
            &mut pe,
            EnvironmentCondition::Deployed,
            ConditionStatus::True,
            "Deployed",
            "ProblemEnvironment is deployed to Worker",
        );
    } else {
        set_condition(
            &mut pe,
            EnvironmentCondition::Deployed,
            ConditionStatus::False,
            "NotDeployed",
            "ProblemEnvironment is not deployed to Worker",
        );
    }

    respond(store.update_status(&pe))
}

// ── Workers ────────────────────────────────────────────────────

/// Body of `PUT /api/v1/workers/{name}`.
#[derive(Debug, Default, Deserialize)]
pub struct RegisterWorkerRequest {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub worker_info: WorkerInfo,
}

/// Body of `POST /api/v1/workers/{name}/schedule`.
#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub disable: bool,
}

/// GET /api/v1/workers
pub async fn list_workers(State(state): State<ApiState>) -> Response {
    blocking(move || respond(state.store.list::<Worker>())).await
}

/// GET /api/v1/workers/{name}
pub async fn get_worker(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    blocking(move || respond_found(state.store.get::<Worker>(&name), "worker")).await
}

/// PUT /api/v1/workers/{name}
///
/// Worker self-registration and telemetry.
pub async fn put_worker(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<RegisterWorkerRequest>,
) -> Response {
    blocking(move || match register_worker(&state.store, &name, req) {
        Ok((status, worker)) => (status, ApiResponse::ok(worker)).into_response(),
        Err(e) => state_error(&e),
    })
    .await
}

fn register_worker(
    store: &StateStore,
    name: &str,
    req: RegisterWorkerRequest,
) -> StateResult<(StatusCode, Worker)> {
    let (status, mut worker) = match store.get::<Worker>(name)? {
        Some(mut worker) => {
            if worker.metadata.labels != req.labels {
                worker.metadata.labels = req.labels;
                worker = store.update(&worker)?;
            }
            (StatusCode::OK, worker)
        }
        None => {
            let mut meta = ObjectMeta::named(name);
            meta.labels = req.labels;
            let worker = store.create(Worker::new(meta, WorkerSpec::default()))?;
            info!(worker = %name, "worker registered");
            (StatusCode::CREATED, worker)
        }
    };

    if worker.status.worker_info != req.worker_info {
        worker.status.worker_info = req.worker_info;
        worker = store.update_status(&worker)?;
    }
    Ok((status, worker))
}

/// POST /api/v1/workers/{name}/schedule
pub async fn set_worker_schedule(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<ScheduleRequest>,
) -> Response {
    blocking(move || schedule_worker(&state.store, &name, req.disable)).await
}

fn schedule_worker(store: &StateStore, name: &str, disable: bool) -> Response {
    let mut worker = match store.get::<Worker>(name) {
        Ok(Some(worker)) => worker,
        Ok(None) => return error_response("worker not found", StatusCode::NOT_FOUND),
        Err(e) => return state_error(&e),
    };
    if worker.spec.disable_schedule == disable {
        return ApiResponse::ok(worker).into_response();
    }

    worker.spec.disable_schedule = disable;
    info!(worker = %name, disable, "worker scheduling changed");
    respond(store.update(&worker))
}

// ── Leases ─────────────────────────────────────────────────────

/// Body of `PUT /api/v1/leases/{name}`.
#[derive(Debug, Default, Deserialize)]
pub struct RenewLeaseRequest {
    #[serde(default)]
    pub lease_duration_seconds: Option<u32>,
}

/// PUT /api/v1/leases/{name}
///
/// Heartbeat: renew the worker's lease as of now.
pub async fn put_lease(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<RenewLeaseRequest>,
) -> Response {
    blocking(move || {
        respond(renew_lease(
            &state.store,
            &state.lease_namespace,
            &name,
            req.lease_duration_seconds,
            epoch_millis(),
        ))
    })
    .await
}

fn renew_lease(
    store: &StateStore,
    namespace: &str,
    name: &str,
    duration_seconds: Option<u32>,
    now_ms: u64,
) -> StateResult<Lease> {
    match store.get_namespaced::<Lease>(namespace, name)? {
        Some(mut lease) => {
            lease.spec.renew_time = Some(now_ms);
            if duration_seconds.is_some() {
                lease.spec.lease_duration_seconds = duration_seconds;
            }
            store.update(&lease)
        }
        None => store.create(Lease::new(
            ObjectMeta::namespaced(namespace, name),
            LeaseSpec {
                holder_identity: name.to_string(),
                renew_time: Some(now_ms),
                lease_duration_seconds: duration_seconds,
            },
        )),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = labgrid_metrics::render_prometheus(&state.registry);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    use labgrid_metrics::{LabgridMetrics, Registry};

    pub(crate) fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        let registry = Arc::new(Registry::new());
        let metrics = LabgridMetrics::register(&registry).unwrap();
        ApiState::new(store, registry, metrics, DEFAULT_LEASE_NAMESPACE)
    }

    fn test_spec() -> ProblemSpec {
        ProblemSpec {
            template: EnvironmentTemplate {
                metadata: TemplateMeta::default(),
                spec: EnvironmentSpec {
                    topology_ref: FileRef {
                        name: "p1-files".to_string(),
                        key: "topology.yaml".to_string(),
                    },
                    ..Default::default()
                },
            },
            assignable_replicas: 2,
        }
    }

    #[tokio::test]
    async fn list_problems_empty() {
        let state = test_state();
        let resp = list_problems(State(state)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn put_creates_then_updates_problem() {
        let state = test_state();

        let resp = put_problem(
            State(state.clone()),
            Path("p1".to_string()),
            Json(test_spec()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let mut spec = test_spec();
        spec.assignable_replicas = 5;
        let resp = put_problem(State(state.clone()), Path("p1".to_string()), Json(spec)).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let problem: Problem = state.store.get("p1").unwrap().unwrap();
        assert_eq!(problem.spec.assignable_replicas, 5);
        assert_eq!(problem.metadata.generation, 2);

        let resp = get_problem(State(state), Path("p1".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_nonexistent_problem() {
        let state = test_state();
        let resp = get_problem(State(state), Path("nope".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_problem_cascades() {
        let state = test_state();
        let problem = state
            .store
            .create(Problem::new(ObjectMeta::named("p1"), test_spec()))
            .unwrap();
        let mut meta = ObjectMeta::named("p1-aaaaa");
        meta.owner_references
            .push(problem.metadata.owner_reference(ResourceKind::Problem));
        state
            .store
            .create(ProblemEnvironment::new(meta, EnvironmentSpec::default()))
            .unwrap();

        let resp = delete_problem(State(state.clone()), Path("p1".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.store.list::<ProblemEnvironment>().unwrap().is_empty());

        let resp = delete_problem(State(state), Path("p1".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn container_report_sets_deployed() {
        let state = test_state();
        state
            .store
            .create(ProblemEnvironment::new(
                ObjectMeta::named("p1-aaaaa"),
                EnvironmentSpec::default(),
            ))
            .unwrap();

        let report = ContainersStatus {
            summary: "1/1".to_string(),
            details: vec![ContainerDetail {
                name: "r1".to_string(),
                ready: true,
                ..Default::default()
            }],
        };
        let resp = put_environment_containers(
            State(state.clone()),
            Path("p1-aaaaa".to_string()),
            Json(report),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let pe: ProblemEnvironment = state.store.get("p1-aaaaa").unwrap().unwrap();
        assert!(pe.containers_ready());
        let deployed = find_condition(&pe, EnvironmentCondition::Deployed).unwrap();
        assert_eq!(deployed.status, ConditionStatus::True);
        assert_eq!(deployed.reason, "Deployed");

        let resp = put_environment_containers(
            State(state),
            Path("missing".to_string()),
            Json(ContainersStatus::default()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn worker_registration_and_telemetry() {
        let state = test_state();
        let req = RegisterWorkerRequest {
            labels: BTreeMap::from([("zone".to_string(), "a".to_string())]),
            worker_info: WorkerInfo {
                external_ip_address: "192.0.2.1".to_string(),
                external_port: 22,
                cpu_used_percent: Some(12.5),
                ..Default::default()
            },
        };
        let resp = put_worker(State(state.clone()), Path("w1".to_string()), Json(req)).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let req = RegisterWorkerRequest {
            labels: BTreeMap::from([("zone".to_string(), "a".to_string())]),
            worker_info: WorkerInfo {
                external_ip_address: "192.0.2.1".to_string(),
                external_port: 22,
                cpu_used_percent: Some(40.0),
                ..Default::default()
            },
        };
        let resp = put_worker(State(state.clone()), Path("w1".to_string()), Json(req)).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let worker: Worker = state.store.get("w1").unwrap().unwrap();
        assert_eq!(worker.metadata.labels.get("zone").map(String::as_str), Some("a"));
        assert_eq!(worker.status.worker_info.cpu_used_percent, Some(40.0));
        // Labels were unchanged on the second report.
        assert_eq!(worker.metadata.generation, 1);
    }

    #[tokio::test]
    async fn schedule_toggle() {
        let state = test_state();
        state
            .store
            .create(Worker::new(ObjectMeta::named("w1"), WorkerSpec::default()))
            .unwrap();

        let resp = set_worker_schedule(
            State(state.clone()),
            Path("w1".to_string()),
            Json(ScheduleRequest { disable: true }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let worker: Worker = state.store.get("w1").unwrap().unwrap();
        assert!(worker.spec.disable_schedule);

        let resp = set_worker_schedule(
            State(state),
            Path("w2".to_string()),
            Json(ScheduleRequest { disable: true }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn lease_renewal_creates_then_renews() {
        let store = StateStore::open_in_memory().unwrap();

        let lease = renew_lease(&store, DEFAULT_LEASE_NAMESPACE, "w1", None, 1_000).unwrap();
        assert_eq!(lease.spec.holder_identity, "w1");
        assert_eq!(lease.spec.renew_time, Some(1_000));
        assert!(lease.spec.is_live_at(5_999));

        let lease = renew_lease(&store, DEFAULT_LEASE_NAMESPACE, "w1", Some(30), 2_000).unwrap();
        assert_eq!(lease.spec.renew_time, Some(2_000));
        assert_eq!(lease.spec.duration_seconds(), 30);

        // Omitting the duration keeps the one already set.
        let lease = renew_lease(&store, DEFAULT_LEASE_NAMESPACE, "w1", None, 3_000).unwrap();
        assert_eq!(lease.spec.duration_seconds(), 30);
        assert_eq!(lease.metadata.namespace, DEFAULT_LEASE_NAMESPACE);
    }

    #[tokio::test]
    async fn prometheus_endpoint_returns_text() {
        let state = test_state();
        let resp = prometheus_metrics(State(state)).await;
        let resp = resp.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.contains("text/plain"));
    }
}
