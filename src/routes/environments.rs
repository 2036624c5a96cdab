use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use data_model::{EnvironmentBuilder, EnvironmentCapacity, EnvironmentId, Error};
use state_store::requests::{
    CreateEnvironmentRequest,
    RequestPayload,
    ResizeEnvironmentRequest,
    SetEnvironmentStatusRequest,
    StateMachineUpdateRequest,
};
use tracing::info;

use super::{record_request, RouteState};
use crate::{
    context::RequestActor,
    http_objects::{
        ApiError,
        CreateEnvironment,
        Environment,
        EnvironmentList,
        ListEnvironmentsParams,
        ResizeEnvironment,
        SetEnvironmentStatus,
    },
};

fn load_environment(state: &RouteState, environment_id: &str) -> Result<Environment, ApiError> {
    let environment = state
        .state
        .reader()
        .get_environment(&EnvironmentId::from(environment_id))?
        .ok_or_else(|| Error::not_found("environment", environment_id))?;
    Ok(environment.into())
}

/// Create an environment
#[utoipa::path(
    post,
    path = "/v1/environments",
    request_body = CreateEnvironment,
    tag = "environments",
    responses(
        (status = 201, description = "Environment created in provisioning", body = Environment),
        (status = NOT_FOUND, description = "Tenant not found", body = ApiError),
        (status = UNPROCESSABLE_ENTITY, description = "Invalid environment configuration", body = ApiError),
    ),
)]
pub async fn create_environment(
    State(state): State<RouteState>,
    RequestActor(actor): RequestActor,
    Json(request): Json<CreateEnvironment>,
) -> Result<(StatusCode, Json<Environment>), ApiError> {
    record_request(&state, "create_environment");
    let mut builder = EnvironmentBuilder::default();
    builder
        .tenant_id(request.tenant_id)
        .region(request.region)
        .provisioning_mode(request.provisioning_mode.into())
        .eks_namespace(request.eks_namespace)
        .warm_pool_enabled(request.warm_pool_enabled);
    if let Some(engine) = request.engine {
        builder.engine(engine);
    }
    if let Some(max_concurrent_runs) = request.max_concurrent_runs {
        builder.max_concurrent_runs(max_concurrent_runs);
    }
    if let Some(max_vcpu) = request.max_vcpu {
        builder.max_vcpu(max_vcpu);
    }
    if let Some(max_run_seconds) = request.max_run_seconds {
        builder.max_run_seconds(max_run_seconds);
    }
    let environment = builder.build()?;
    state
        .state
        .write(StateMachineUpdateRequest::new(
            RequestPayload::CreateEnvironment(CreateEnvironmentRequest {
                environment: environment.clone(),
            }),
            actor,
        ))
        .await?;
    info!(
        environment_id = environment.id.get(),
        tenant_id = environment.tenant_id.as_str(),
        "environment created"
    );
    Ok((StatusCode::CREATED, Json(environment.into())))
}

/// List environments, oldest first
#[utoipa::path(
    get,
    path = "/v1/environments",
    params(ListEnvironmentsParams),
    tag = "environments",
    responses(
        (status = 200, description = "Environments", body = EnvironmentList),
    ),
)]
pub async fn list_environments(
    State(state): State<RouteState>,
    Query(params): Query<ListEnvironmentsParams>,
) -> Result<Json<EnvironmentList>, ApiError> {
    record_request(&state, "list_environments");
    let environments = state
        .state
        .reader()
        .list_environments(params.tenant_id.as_deref())?
        .into_iter()
        .map(Environment::from)
        .collect();
    Ok(Json(EnvironmentList { environments }))
}

/// Get an environment
#[utoipa::path(
    get,
    path = "/v1/environments/{environment_id}",
    tag = "environments",
    responses(
        (status = 200, description = "Environment", body = Environment),
        (status = NOT_FOUND, description = "Environment not found", body = ApiError),
    ),
)]
pub async fn get_environment(
    State(state): State<RouteState>,
    Path(environment_id): Path<String>,
) -> Result<Json<Environment>, ApiError> {
    record_request(&state, "get_environment");
    Ok(Json(load_environment(&state, &environment_id)?))
}

/// Change environment capacity. Capacity cannot drop below what runs in
/// flight already hold.
#[utoipa::path(
    post,
    path = "/v1/environments/{environment_id}/resize",
    request_body = ResizeEnvironment,
    tag = "environments",
    responses(
        (status = 200, description = "Environment resized", body = Environment),
        (status = NOT_FOUND, description = "Environment not found", body = ApiError),
        (status = UNPROCESSABLE_ENTITY, description = "Invalid capacity", body = ApiError),
    ),
)]
pub async fn resize_environment(
    State(state): State<RouteState>,
    RequestActor(actor): RequestActor,
    Path(environment_id): Path<String>,
    Json(request): Json<ResizeEnvironment>,
) -> Result<Json<Environment>, ApiError> {
    record_request(&state, "resize_environment");
    state
        .state
        .write(StateMachineUpdateRequest::new(
            RequestPayload::ResizeEnvironment(ResizeEnvironmentRequest {
                environment_id: EnvironmentId::from(environment_id.as_str()),
                capacity: EnvironmentCapacity {
                    max_concurrent_runs: request.max_concurrent_runs,
                    max_vcpu: request.max_vcpu,
                },
            }),
            actor,
        ))
        .await?;
    Ok(Json(load_environment(&state, &environment_id)?))
}

/// Status callback for the provisioning workflow
#[utoipa::path(
    post,
    path = "/internal/environments/{environment_id}/status",
    request_body = SetEnvironmentStatus,
    tag = "internal",
    responses(
        (status = 200, description = "Status updated", body = Environment),
        (status = NOT_FOUND, description = "Environment not found", body = ApiError),
        (status = CONFLICT, description = "Status change not allowed", body = ApiError),
    ),
)]
pub async fn set_environment_status(
    State(state): State<RouteState>,
    RequestActor(actor): RequestActor,
    Path(environment_id): Path<String>,
    Json(request): Json<SetEnvironmentStatus>,
) -> Result<Json<Environment>, ApiError> {
    record_request(&state, "set_environment_status");
    state
        .state
        .write(StateMachineUpdateRequest::new(
            RequestPayload::SetEnvironmentStatus(SetEnvironmentStatusRequest {
                environment_id: EnvironmentId::from(environment_id.as_str()),
                status: request.status.into(),
            }),
            actor,
        ))
        .await?;
    Ok(Json(load_environment(&state, &environment_id)?))
}
