use std::collections::BTreeMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use data_model::{find_error, Error};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::error;
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    /// Machine-readable error code, e.g. `logs_unavailable`.
    error: String,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, error: &str, message: &str) -> Self {
        Self {
            status_code,
            error: error.to_string(),
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let message = err.to_string();
        let (status_code, code) = match find_error(&err) {
            Some(Error::InvalidConfig(_)) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_config"),
            Some(Error::NotFound { .. }) => (StatusCode::NOT_FOUND, "not_found"),
            Some(Error::InvalidTransition { .. }) => (StatusCode::CONFLICT, "invalid_transition"),
            Some(Error::IdempotencyConflict(_)) => (StatusCode::CONFLICT, "idempotency_conflict"),
            Some(Error::AlreadyExists { .. }) => (StatusCode::CONFLICT, "already_exists"),
            Some(Error::LogsUnavailable(_)) => (StatusCode::NOT_FOUND, "logs_unavailable"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        Self::new(status_code, code, &message)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        anyhow::Error::from(err).into()
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::bad_request(&e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status_code.is_server_error() {
            error!("API Error: {} - {}", self.status_code, self.message);
        }
        (self.status_code, Json(self)).into_response()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningMode {
    Full,
    ByocLite,
}

impl From<ProvisioningMode> for data_model::ProvisioningMode {
    fn from(mode: ProvisioningMode) -> Self {
        match mode {
            ProvisioningMode::Full => data_model::ProvisioningMode::Full,
            ProvisioningMode::ByocLite => data_model::ProvisioningMode::ByocLite,
        }
    }
}

impl From<data_model::ProvisioningMode> for ProvisioningMode {
    fn from(mode: data_model::ProvisioningMode) -> Self {
        match mode {
            data_model::ProvisioningMode::Full => ProvisioningMode::Full,
            data_model::ProvisioningMode::ByocLite => ProvisioningMode::ByocLite,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Provisioning,
    Active,
    Degraded,
    Deprovisioning,
    Terminated,
}

impl From<EnvironmentStatus> for data_model::EnvironmentStatus {
    fn from(status: EnvironmentStatus) -> Self {
        match status {
            EnvironmentStatus::Provisioning => data_model::EnvironmentStatus::Provisioning,
            EnvironmentStatus::Active => data_model::EnvironmentStatus::Active,
            EnvironmentStatus::Degraded => data_model::EnvironmentStatus::Degraded,
            EnvironmentStatus::Deprovisioning => data_model::EnvironmentStatus::Deprovisioning,
            EnvironmentStatus::Terminated => data_model::EnvironmentStatus::Terminated,
        }
    }
}

impl From<data_model::EnvironmentStatus> for EnvironmentStatus {
    fn from(status: data_model::EnvironmentStatus) -> Self {
        match status {
            data_model::EnvironmentStatus::Provisioning => EnvironmentStatus::Provisioning,
            data_model::EnvironmentStatus::Active => EnvironmentStatus::Active,
            data_model::EnvironmentStatus::Degraded => EnvironmentStatus::Degraded,
            data_model::EnvironmentStatus::Deprovisioning => EnvironmentStatus::Deprovisioning,
            data_model::EnvironmentStatus::Terminated => EnvironmentStatus::Terminated,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Accepted,
    Dispatching,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl From<RunState> for data_model::RunState {
    fn from(state: RunState) -> Self {
        match state {
            RunState::Accepted => data_model::RunState::Accepted,
            RunState::Dispatching => data_model::RunState::Dispatching,
            RunState::Running => data_model::RunState::Running,
            RunState::Succeeded => data_model::RunState::Succeeded,
            RunState::Failed => data_model::RunState::Failed,
            RunState::Cancelled => data_model::RunState::Cancelled,
        }
    }
}

impl From<data_model::RunState> for RunState {
    fn from(state: data_model::RunState) -> Self {
        match state {
            data_model::RunState::Accepted => RunState::Accepted,
            data_model::RunState::Dispatching => RunState::Dispatching,
            data_model::RunState::Running => RunState::Running,
            data_model::RunState::Succeeded => RunState::Succeeded,
            data_model::RunState::Failed => RunState::Failed,
            data_model::RunState::Cancelled => RunState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateTenant {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl From<data_model::Tenant> for Tenant {
    fn from(tenant: data_model::Tenant) -> Self {
        Self {
            id: tenant.id,
            name: tenant.name,
            created_at: tenant.created_at,
            updated_at: tenant.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateEnvironment {
    pub tenant_id: String,
    pub region: String,
    pub engine: Option<String>,
    pub provisioning_mode: ProvisioningMode,
    pub eks_namespace: Option<String>,
    #[serde(default)]
    pub warm_pool_enabled: bool,
    pub max_concurrent_runs: Option<u32>,
    pub max_vcpu: Option<u32>,
    pub max_run_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Environment {
    pub id: String,
    pub tenant_id: String,
    pub region: String,
    pub engine: String,
    pub provisioning_mode: ProvisioningMode,
    pub eks_namespace: Option<String>,
    pub warm_pool_enabled: bool,
    pub max_concurrent_runs: u32,
    pub max_vcpu: u32,
    pub max_run_seconds: u64,
    pub status: EnvironmentStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

impl From<data_model::Environment> for Environment {
    fn from(environment: data_model::Environment) -> Self {
        Self {
            id: environment.id.to_string(),
            tenant_id: environment.tenant_id,
            region: environment.region,
            engine: environment.engine,
            provisioning_mode: environment.provisioning_mode.into(),
            eks_namespace: environment.eks_namespace,
            warm_pool_enabled: environment.warm_pool_enabled,
            max_concurrent_runs: environment.max_concurrent_runs,
            max_vcpu: environment.max_vcpu,
            max_run_seconds: environment.max_run_seconds,
            status: environment.status.into(),
            created_at: environment.created_at,
            updated_at: environment.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EnvironmentList {
    pub environments: Vec<Environment>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ResizeEnvironment {
    pub max_concurrent_runs: u32,
    pub max_vcpu: u32,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SetEnvironmentStatus {
    pub status: EnvironmentStatus,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListEnvironmentsParams {
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateJob {
    pub environment_id: String,
    pub name: String,
    pub artifact_uri: String,
    pub artifact_digest: String,
    pub entrypoint: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub spark_conf: BTreeMap<String, String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Job {
    pub id: String,
    pub environment_id: String,
    pub name: String,
    pub artifact_uri: String,
    pub artifact_digest: String,
    pub entrypoint: String,
    pub args: Vec<String>,
    pub spark_conf: BTreeMap<String, String>,
    pub timeout_seconds: u64,
    pub created_at: u64,
}

impl From<data_model::Job> for Job {
    fn from(job: data_model::Job) -> Self {
        Self {
            id: job.id.to_string(),
            environment_id: job.environment_id.to_string(),
            name: job.name,
            artifact_uri: job.artifact_uri,
            artifact_digest: job.artifact_digest,
            entrypoint: job.entrypoint,
            args: job.args,
            spark_conf: job.spark_conf,
            timeout_seconds: job.timeout_seconds,
            created_at: job.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct RequestedResources {
    pub driver_vcpu: u32,
    pub driver_memory_gb: u32,
    pub executor_vcpu: u32,
    pub executor_memory_gb: u32,
    pub executor_instances: u32,
}

impl From<RequestedResources> for data_model::RequestedResources {
    fn from(r: RequestedResources) -> Self {
        Self {
            driver_vcpu: r.driver_vcpu,
            driver_memory_gb: r.driver_memory_gb,
            executor_vcpu: r.executor_vcpu,
            executor_memory_gb: r.executor_memory_gb,
            executor_instances: r.executor_instances,
        }
    }
}

impl From<data_model::RequestedResources> for RequestedResources {
    fn from(r: data_model::RequestedResources) -> Self {
        Self {
            driver_vcpu: r.driver_vcpu,
            driver_memory_gb: r.driver_memory_gb,
            executor_vcpu: r.executor_vcpu,
            executor_memory_gb: r.executor_memory_gb,
            executor_instances: r.executor_instances,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct CreateRun {
    pub requested_resources: Option<RequestedResources>,
    pub timeout_seconds: Option<u64>,
}

impl CreateRun {
    /// Digest of the request body, used to detect reuse of an
    /// `Idempotency-Key` with a different request.
    pub fn fingerprint(&self, job_id: &str) -> Result<String, serde_json::Error> {
        let mut hasher = Sha256::new();
        hasher.update(job_id.as_bytes());
        hasher.update(serde_json::to_vec(self)?);
        Ok(hex::encode(hasher.finalize()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Run {
    pub id: String,
    pub job_id: String,
    pub environment_id: String,
    pub tenant_id: String,
    pub state: RunState,
    pub requested_resources: RequestedResources,
    pub timeout_seconds: u64,
    pub idempotency_key: Option<String>,
    pub emr_job_run_id: Option<String>,
    pub started_at: Option<u64>,
    pub ended_at: Option<u64>,
    pub log_group: Option<String>,
    pub log_stream_prefix: Option<String>,
    pub error_message: Option<String>,
    pub cancellation_requested: bool,
    pub dispatch_attempts: u32,
    pub last_dispatch_attempt_at: Option<u64>,
    pub consecutive_status_failures: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

impl From<data_model::Run> for Run {
    fn from(run: data_model::Run) -> Self {
        Self {
            id: run.id.to_string(),
            job_id: run.job_id.to_string(),
            environment_id: run.environment_id.to_string(),
            tenant_id: run.tenant_id,
            state: run.state.into(),
            requested_resources: run.requested_resources.into(),
            timeout_seconds: run.timeout_seconds,
            idempotency_key: run.idempotency_key,
            emr_job_run_id: run.emr_job_run_id,
            started_at: run.started_at,
            ended_at: run.ended_at,
            log_group: run.log_group,
            log_stream_prefix: run.log_stream_prefix,
            error_message: run.error_message,
            cancellation_requested: run.cancellation_requested,
            dispatch_attempts: run.dispatch_attempts,
            last_dispatch_attempt_at: run.last_dispatch_attempt_at,
            consecutive_status_failures: run.consecutive_status_failures,
            created_at: run.created_at,
            updated_at: run.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RunList {
    pub runs: Vec<Run>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListRunsParams {
    pub tenant_id: Option<String>,
    pub environment_id: Option<String>,
    pub state: Option<RunState>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogsStatus {
    Available,
    Empty,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RunLogs {
    pub run_id: String,
    pub status: LogsStatus,
    pub log_group: String,
    pub log_stream_prefix: String,
    pub lines: Vec<String>,
}

impl From<processor::logs::RunLogs> for RunLogs {
    fn from(logs: processor::logs::RunLogs) -> Self {
        Self {
            run_id: logs.run_id.to_string(),
            status: match logs.status {
                processor::logs::LogsStatus::Available => LogsStatus::Available,
                processor::logs::LogsStatus::Empty => LogsStatus::Empty,
            },
            log_group: logs.log_group,
            log_stream_prefix: logs.log_stream_prefix,
            lines: logs.lines,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct LogsParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UsageRecord {
    pub run_id: String,
    pub environment_id: String,
    pub vcpu_seconds: u64,
    pub memory_gb_seconds: u64,
    pub estimated_cost_usd_micros: u64,
    pub recorded_at: u64,
}

impl From<data_model::UsageRecord> for UsageRecord {
    fn from(record: data_model::UsageRecord) -> Self {
        Self {
            run_id: record.run_id.to_string(),
            environment_id: record.environment_id.to_string(),
            vcpu_seconds: record.vcpu_seconds,
            memory_gb_seconds: record.memory_gb_seconds,
            estimated_cost_usd_micros: record.estimated_cost_usd_micros,
            recorded_at: record.recorded_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UsageSummary {
    pub tenant_id: String,
    pub from: Option<u64>,
    pub to: Option<u64>,
    pub total_vcpu_seconds: u64,
    pub total_memory_gb_seconds: u64,
    pub total_estimated_cost_usd_micros: u64,
    pub records: Vec<UsageRecord>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UsageParams {
    pub tenant_id: String,
    pub from: Option<u64>,
    pub to: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuditEvent {
    pub id: String,
    pub tenant_id: String,
    pub actor: String,
    pub source_ip: Option<String>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub details: BTreeMap<String, String>,
    pub created_at: u64,
}

impl From<data_model::AuditEvent> for AuditEvent {
    fn from(event: data_model::AuditEvent) -> Self {
        Self {
            id: event.id,
            tenant_id: event.tenant_id,
            actor: event.actor,
            source_ip: event.source_ip,
            action: event.action,
            entity_type: event.entity_type,
            entity_id: event.entity_id,
            details: event.details,
            created_at: event.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuditEventList {
    pub events: Vec<AuditEvent>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AuditParams {
    pub tenant_id: String,
    /// Oldest events first, at most this many (default 100, max 1000).
    pub limit: Option<usize>,
}
