use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use data_model::{EnvironmentId, Error, IdempotencyRecord, JobId, RunId};
use sparkpilot_utils::get_epoch_time_in_ms;
use state_store::{
    requests::{CreateRunRequest, RequestPayload, StateMachineUpdateRequest},
    scanner::RunFilter,
};
use tracing::info;

use super::{record_request, RouteState};
use crate::{
    context::RequestActor,
    http_objects::{ApiError, CreateRun, ListRunsParams, LogsParams, Run, RunList, RunLogs},
};

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

fn idempotency_key(headers: &HeaderMap) -> Result<Option<String>, ApiError> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };
    let key = value
        .to_str()
        .map_err(|_| ApiError::bad_request("Idempotency-Key must be ASCII"))?
        .trim();
    if key.is_empty() {
        return Ok(None);
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN || key.contains('|') {
        return Err(ApiError::bad_request(
            "Idempotency-Key must be at most 255 characters and must not contain '|'",
        ));
    }
    Ok(Some(key.to_string()))
}

fn load_run(state: &RouteState, run_id: &RunId) -> Result<data_model::Run, ApiError> {
    Ok(state
        .state
        .reader()
        .get_run(run_id)?
        .ok_or_else(|| Error::not_found("run", run_id))?)
}

/// Submit a run of a job. With an `Idempotency-Key` header a repeated
/// request returns the run created by the first one.
#[utoipa::path(
    post,
    path = "/v1/jobs/{job_id}/runs",
    request_body = CreateRun,
    params(
        ("Idempotency-Key" = Option<String>, Header, description = "Deduplicates run submissions per job"),
    ),
    tag = "runs",
    responses(
        (status = 201, description = "Run accepted", body = Run),
        (status = 200, description = "Run previously created with this idempotency key", body = Run),
        (status = NOT_FOUND, description = "Job not found", body = ApiError),
        (status = CONFLICT, description = "Idempotency key reused with a different request", body = ApiError),
        (status = UNPROCESSABLE_ENTITY, description = "Invalid run request", body = ApiError),
    ),
)]
pub async fn create_run(
    State(state): State<RouteState>,
    RequestActor(actor): RequestActor,
    Path(job_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CreateRun>,
) -> Result<(StatusCode, Json<Run>), ApiError> {
    record_request(&state, "create_run");
    let reader = state.state.reader();
    let job = reader
        .get_job(&JobId::from(job_id.as_str()))?
        .ok_or_else(|| Error::not_found("job", &job_id))?;
    let idempotency_key = idempotency_key(&headers)?;
    let fingerprint = request.fingerprint(job.id.get())?;

    if let Some(key) = &idempotency_key {
        if let Some(existing) = reader.get_idempotency_record(&job.id, key)? {
            if existing.fingerprint != fingerprint {
                return Err(Error::IdempotencyConflict(key.clone()).into());
            }
            return Ok((StatusCode::OK, Json(load_run(&state, &existing.run_id)?.into())));
        }
    }

    let environment = reader
        .get_environment(&job.environment_id)?
        .ok_or_else(|| Error::not_found("environment", &job.environment_id))?;
    let run = data_model::Run::new(
        &job,
        &environment,
        request.requested_resources.map(Into::into).unwrap_or_default(),
        request.timeout_seconds,
        idempotency_key.clone(),
        get_epoch_time_in_ms(),
    )?;
    let idempotency = idempotency_key.as_ref().map(|key| IdempotencyRecord {
        job_id: job.id.clone(),
        idempotency_key: key.clone(),
        fingerprint: fingerprint.clone(),
        run_id: run.id.clone(),
        created_at: run.created_at,
    });
    state
        .state
        .write(StateMachineUpdateRequest::new(
            RequestPayload::CreateRun(CreateRunRequest {
                run: run.clone(),
                idempotency,
            }),
            actor,
        ))
        .await?;

    // a concurrent request with the same key may have won the race
    let stored_run_id = match &idempotency_key {
        Some(key) => reader
            .get_idempotency_record(&job.id, key)?
            .map(|record| record.run_id)
            .unwrap_or_else(|| run.id.clone()),
        None => run.id.clone(),
    };
    if stored_run_id != run.id {
        return Ok((StatusCode::OK, Json(load_run(&state, &stored_run_id)?.into())));
    }
    state.metrics.runs_created.add(1, &[]);
    info!(
        run_id = run.id.get(),
        job_id = job.id.get(),
        environment_id = environment.id.get(),
        "run accepted"
    );
    Ok((StatusCode::CREATED, Json(run.into())))
}

/// List runs, newest first
#[utoipa::path(
    get,
    path = "/v1/runs",
    params(ListRunsParams),
    tag = "runs",
    responses(
        (status = 200, description = "Runs", body = RunList),
    ),
)]
pub async fn list_runs(
    State(state): State<RouteState>,
    Query(params): Query<ListRunsParams>,
) -> Result<Json<RunList>, ApiError> {
    record_request(&state, "list_runs");
    let filter = RunFilter {
        tenant_id: params.tenant_id,
        environment_id: params
            .environment_id
            .as_deref()
            .map(EnvironmentId::from),
        state: params.state.map(Into::into),
    };
    let runs = state
        .state
        .reader()
        .list_runs(&filter)?
        .into_iter()
        .map(Run::from)
        .collect();
    Ok(Json(RunList { runs }))
}

/// Get a run
#[utoipa::path(
    get,
    path = "/v1/runs/{run_id}",
    tag = "runs",
    responses(
        (status = 200, description = "Run", body = Run),
        (status = NOT_FOUND, description = "Run not found", body = ApiError),
    ),
)]
pub async fn get_run(
    State(state): State<RouteState>,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    record_request(&state, "get_run");
    Ok(Json(load_run(&state, &RunId::from(run_id.as_str()))?.into()))
}

/// Cancel a run. Returns once the cancellation is committed; the engine job
/// is stopped in the background. A run whose submission is in flight comes
/// back `accepted` with `cancellation_requested` set and is cancelled as
/// soon as the submission outcome is known.
#[utoipa::path(
    post,
    path = "/v1/runs/{run_id}/cancel",
    tag = "runs",
    responses(
        (status = 200, description = "Run cancelled or cancellation requested", body = Run),
        (status = NOT_FOUND, description = "Run not found", body = ApiError),
        (status = CONFLICT, description = "Run already finished", body = ApiError),
    ),
)]
pub async fn cancel_run(
    State(state): State<RouteState>,
    RequestActor(actor): RequestActor,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    record_request(&state, "cancel_run");
    let outcome = state
        .canceller
        .cancel(&RunId::from(run_id.as_str()), actor)
        .await?;
    Ok(Json(outcome.run.into()))
}

/// Read the driver logs of a run
#[utoipa::path(
    get,
    path = "/v1/runs/{run_id}/logs",
    params(LogsParams),
    tag = "runs",
    responses(
        (status = 200, description = "Log lines, possibly empty", body = RunLogs),
        (status = NOT_FOUND, description = "Run not found, or logs_unavailable before dispatch", body = ApiError),
        (status = UNPROCESSABLE_ENTITY, description = "Invalid limit", body = ApiError),
    ),
)]
pub async fn get_run_logs(
    State(state): State<RouteState>,
    Path(run_id): Path<String>,
    Query(params): Query<LogsParams>,
) -> Result<Json<RunLogs>, ApiError> {
    record_request(&state, "get_run_logs");
    let logs = state
        .logs
        .fetch(
            &state.state.reader(),
            &RunId::from(run_id.as_str()),
            params.limit,
        )
        .await?;
    Ok(Json(logs.into()))
}
