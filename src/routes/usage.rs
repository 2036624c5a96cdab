use axum::{
    extract::{Query, State},
    Json,
};

use super::{record_request, tenants::require_tenant, RouteState};
use crate::http_objects::{ApiError, UsageParams, UsageRecord, UsageSummary};

/// Usage of a tenant's finished runs, optionally bounded by `from` and `to`
/// (epoch milliseconds, inclusive)
#[utoipa::path(
    get,
    path = "/v1/usage",
    params(UsageParams),
    tag = "usage",
    responses(
        (status = 200, description = "Usage summary", body = UsageSummary),
        (status = BAD_REQUEST, description = "Invalid range", body = ApiError),
        (status = NOT_FOUND, description = "Tenant not found", body = ApiError),
    ),
)]
pub async fn get_usage(
    State(state): State<RouteState>,
    Query(params): Query<UsageParams>,
) -> Result<Json<UsageSummary>, ApiError> {
    record_request(&state, "get_usage");
    if let (Some(from), Some(to)) = (params.from, params.to) {
        if from > to {
            return Err(ApiError::bad_request("from must not be after to"));
        }
    }
    require_tenant(&state, &params.tenant_id)?;
    let records = state
        .state
        .reader()
        .list_usage(&params.tenant_id, params.from, params.to)?;

    let mut summary = UsageSummary {
        tenant_id: params.tenant_id,
        from: params.from,
        to: params.to,
        total_vcpu_seconds: 0,
        total_memory_gb_seconds: 0,
        total_estimated_cost_usd_micros: 0,
        records: Vec::with_capacity(records.len()),
    };
    for record in records {
        summary.total_vcpu_seconds += record.vcpu_seconds;
        summary.total_memory_gb_seconds += record.memory_gb_seconds;
        summary.total_estimated_cost_usd_micros += record.estimated_cost_usd_micros;
        summary.records.push(UsageRecord::from(record));
    }
    Ok(Json(summary))
}
