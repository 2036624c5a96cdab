use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use data_model::Error;
use sparkpilot_utils::get_epoch_time_in_ms;
use state_store::requests::{CreateTenantRequest, RequestPayload, StateMachineUpdateRequest};
use tracing::info;

use super::{record_request, RouteState};
use crate::{
    context::RequestActor,
    http_objects::{ApiError, AuditEvent, AuditEventList, AuditParams, CreateTenant, Tenant},
};

const DEFAULT_AUDIT_LIMIT: usize = 100;
const MAX_AUDIT_LIMIT: usize = 1_000;

/// Fails with `not_found` unless the tenant exists.
pub(crate) fn require_tenant(state: &RouteState, tenant_id: &str) -> Result<Tenant, ApiError> {
    let tenant = state
        .state
        .reader()
        .get_tenant(tenant_id)?
        .ok_or_else(|| Error::not_found("tenant", tenant_id))?;
    Ok(tenant.into())
}

/// Register a tenant. Names are unique.
#[utoipa::path(
    post,
    path = "/v1/tenants",
    request_body = CreateTenant,
    tag = "tenants",
    responses(
        (status = 201, description = "Tenant created", body = Tenant),
        (status = CONFLICT, description = "Tenant name already taken", body = ApiError),
        (status = UNPROCESSABLE_ENTITY, description = "Invalid tenant name", body = ApiError),
    ),
)]
pub async fn create_tenant(
    State(state): State<RouteState>,
    RequestActor(actor): RequestActor,
    Json(request): Json<CreateTenant>,
) -> Result<(StatusCode, Json<Tenant>), ApiError> {
    record_request(&state, "create_tenant");
    let tenant = data_model::Tenant::new(&request.name, get_epoch_time_in_ms())?;
    state
        .state
        .write(StateMachineUpdateRequest::new(
            RequestPayload::CreateTenant(CreateTenantRequest {
                tenant: tenant.clone(),
            }),
            actor,
        ))
        .await?;
    info!(tenant_id = tenant.id.as_str(), "tenant created");
    Ok((StatusCode::CREATED, Json(tenant.into())))
}

/// Get a tenant
#[utoipa::path(
    get,
    path = "/v1/tenants/{tenant_id}",
    tag = "tenants",
    responses(
        (status = 200, description = "Tenant", body = Tenant),
        (status = NOT_FOUND, description = "Tenant not found", body = ApiError),
    ),
)]
pub async fn get_tenant(
    State(state): State<RouteState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Tenant>, ApiError> {
    record_request(&state, "get_tenant");
    Ok(Json(require_tenant(&state, &tenant_id)?))
}

/// Audit trail of a tenant, oldest first
#[utoipa::path(
    get,
    path = "/v1/audit-events",
    params(AuditParams),
    tag = "tenants",
    responses(
        (status = 200, description = "Audit events", body = AuditEventList),
        (status = NOT_FOUND, description = "Tenant not found", body = ApiError),
        (status = UNPROCESSABLE_ENTITY, description = "Invalid limit", body = ApiError),
    ),
)]
pub async fn list_audit_events(
    State(state): State<RouteState>,
    Query(params): Query<AuditParams>,
) -> Result<Json<AuditEventList>, ApiError> {
    record_request(&state, "list_audit_events");
    let limit = params.limit.unwrap_or(DEFAULT_AUDIT_LIMIT);
    if limit == 0 || limit > MAX_AUDIT_LIMIT {
        return Err(Error::invalid_config(format!(
            "limit must be between 1 and {MAX_AUDIT_LIMIT}"
        ))
        .into());
    }
    require_tenant(&state, &params.tenant_id)?;
    let events = state
        .state
        .reader()
        .list_audit_events(&params.tenant_id, limit)?
        .into_iter()
        .map(AuditEvent::from)
        .collect();
    Ok(Json(AuditEventList { events }))
}
