use std::sync::Arc;

use axum::{
    extract::{MatchedPath, Request},
    http::Method,
    routing::{get, post},
    Router,
};
use processor::{cancellation::RunCanceller, logs::RunLogsReader};
use state_store::SparkPilotState;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod environments;
mod jobs;
mod runs;
mod tenants;
mod usage;
use environments::{
    create_environment,
    get_environment,
    list_environments,
    resize_environment,
    set_environment_status,
};
use jobs::{create_job, get_job};
use runs::{cancel_run, create_run, get_run, get_run_logs, list_runs};
use tenants::{create_tenant, get_tenant, list_audit_events};
use usage::get_usage;

use crate::http_objects::{
    ApiError,
    AuditEvent,
    AuditEventList,
    CreateEnvironment,
    CreateJob,
    CreateRun,
    CreateTenant,
    Environment,
    EnvironmentList,
    EnvironmentStatus,
    Job,
    LogsStatus,
    ProvisioningMode,
    RequestedResources,
    ResizeEnvironment,
    Run,
    RunList,
    RunLogs,
    RunState,
    SetEnvironmentStatus,
    Tenant,
    UsageRecord,
    UsageSummary,
};

#[derive(OpenApi)]
#[openapi(
        paths(
            tenants::create_tenant,
            tenants::get_tenant,
            tenants::list_audit_events,
            environments::create_environment,
            environments::list_environments,
            environments::get_environment,
            environments::resize_environment,
            environments::set_environment_status,
            jobs::create_job,
            jobs::get_job,
            runs::create_run,
            runs::list_runs,
            runs::get_run,
            runs::cancel_run,
            runs::get_run_logs,
            usage::get_usage,
        ),
        components(
            schemas(
                ApiError,
                CreateTenant,
                Tenant,
                AuditEvent,
                AuditEventList,
                CreateEnvironment,
                Environment,
                EnvironmentList,
                EnvironmentStatus,
                ProvisioningMode,
                ResizeEnvironment,
                SetEnvironmentStatus,
                CreateJob,
                Job,
                CreateRun,
                RequestedResources,
                Run,
                RunList,
                RunState,
                RunLogs,
                LogsStatus,
                UsageRecord,
                UsageSummary,
            )
        ),
        tags(
            (name = "sparkpilot", description = "SparkPilot control plane API")
        )
    )]
struct ApiDoc;

#[derive(Clone)]
pub struct RouteState {
    pub state: Arc<SparkPilotState>,
    pub canceller: Arc<RunCanceller>,
    pub logs: Arc<RunLogsReader>,
    pub metrics: Arc<metrics::api::Metrics>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/docs/swagger").url("/docs/openapi.json", ApiDoc::openapi()))
        .route("/healthz", get(healthz))
        .route(
            "/v1/tenants",
            post(create_tenant).with_state(route_state.clone()),
        )
        .route(
            "/v1/tenants/{tenant_id}",
            get(get_tenant).with_state(route_state.clone()),
        )
        .route(
            "/v1/audit-events",
            get(list_audit_events).with_state(route_state.clone()),
        )
        .route(
            "/v1/environments",
            post(create_environment)
                .get(list_environments)
                .with_state(route_state.clone()),
        )
        .route(
            "/v1/environments/{environment_id}",
            get(get_environment).with_state(route_state.clone()),
        )
        .route(
            "/v1/environments/{environment_id}/resize",
            post(resize_environment).with_state(route_state.clone()),
        )
        .route(
            "/internal/environments/{environment_id}/status",
            post(set_environment_status).with_state(route_state.clone()),
        )
        .route("/v1/jobs", post(create_job).with_state(route_state.clone()))
        .route(
            "/v1/jobs/{job_id}",
            get(get_job).with_state(route_state.clone()),
        )
        .route(
            "/v1/jobs/{job_id}/runs",
            post(create_run).with_state(route_state.clone()),
        )
        .route("/v1/runs", get(list_runs).with_state(route_state.clone()))
        .route(
            "/v1/runs/{run_id}",
            get(get_run).with_state(route_state.clone()),
        )
        .route(
            "/v1/runs/{run_id}/cancel",
            post(cancel_run).with_state(route_state.clone()),
        )
        .route(
            "/v1/runs/{run_id}/logs",
            get(get_run_logs).with_state(route_state.clone()),
        )
        .route("/v1/usage", get(get_usage).with_state(route_state.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();

                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
        .layer(cors)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Counts a request against the API metrics.
pub(crate) fn record_request(state: &RouteState, route: &'static str) {
    state
        .metrics
        .requests
        .add(1, &[opentelemetry::KeyValue::new("route", route)]);
}
