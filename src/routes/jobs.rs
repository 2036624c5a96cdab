use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use data_model::{EnvironmentId, Error, JobBuilder, JobId};
use state_store::requests::{CreateJobRequest, RequestPayload, StateMachineUpdateRequest};

use super::{record_request, RouteState};
use crate::{
    context::RequestActor,
    http_objects::{ApiError, CreateJob, Job},
};

/// Register a job definition in an environment
#[utoipa::path(
    post,
    path = "/v1/jobs",
    request_body = CreateJob,
    tag = "jobs",
    responses(
        (status = 201, description = "Job created", body = Job),
        (status = NOT_FOUND, description = "Environment not found", body = ApiError),
        (status = UNPROCESSABLE_ENTITY, description = "Invalid job definition", body = ApiError),
    ),
)]
pub async fn create_job(
    State(state): State<RouteState>,
    RequestActor(actor): RequestActor,
    Json(request): Json<CreateJob>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    record_request(&state, "create_job");
    let mut builder = JobBuilder::default();
    builder
        .environment_id(EnvironmentId::from(request.environment_id.as_str()))
        .name(request.name)
        .artifact_uri(request.artifact_uri)
        .artifact_digest(request.artifact_digest)
        .entrypoint(request.entrypoint)
        .args(request.args)
        .spark_conf(request.spark_conf);
    if let Some(timeout_seconds) = request.timeout_seconds {
        builder.timeout_seconds(timeout_seconds);
    }
    let job = builder.build()?;
    state
        .state
        .write(StateMachineUpdateRequest::new(
            RequestPayload::CreateJob(CreateJobRequest { job: job.clone() }),
            actor,
        ))
        .await?;
    Ok((StatusCode::CREATED, Json(job.into())))
}

/// Get a job definition
#[utoipa::path(
    get,
    path = "/v1/jobs/{job_id}",
    tag = "jobs",
    responses(
        (status = 200, description = "Job", body = Job),
        (status = NOT_FOUND, description = "Job not found", body = ApiError),
    ),
)]
pub async fn get_job(
    State(state): State<RouteState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    record_request(&state, "get_job");
    let job = state
        .state
        .reader()
        .get_job(&JobId::from(job_id.as_str()))?
        .ok_or_else(|| Error::not_found("job", &job_id))?;
    Ok(Json(job.into()))
}
