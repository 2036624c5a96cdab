use data_model::{
    Actor,
    Environment,
    EnvironmentCapacity,
    EnvironmentId,
    EnvironmentStatus,
    IdempotencyRecord,
    Job,
    LogPointer,
    Run,
    RunId,
    Tenant,
};

pub struct StateMachineUpdateRequest {
    pub payload: RequestPayload,
    /// Recorded on the audit events the write produces.
    pub actor: Actor,
}

impl StateMachineUpdateRequest {
    pub fn new(payload: RequestPayload, actor: Actor) -> Self {
        Self { payload, actor }
    }
}

impl From<RequestPayload> for StateMachineUpdateRequest {
    fn from(payload: RequestPayload) -> Self {
        Self::new(payload, Actor::system())
    }
}

#[derive(Debug, Clone, strum::Display)]
pub enum RequestPayload {
    CreateTenant(CreateTenantRequest),
    CreateEnvironment(CreateEnvironmentRequest),
    SetEnvironmentStatus(SetEnvironmentStatusRequest),
    ResizeEnvironment(ResizeEnvironmentRequest),
    CreateJob(CreateJobRequest),
    CreateRun(CreateRunRequest),
    AdmitRun(AdmitRunRequest),
    ReleaseAdmission(ReleaseAdmissionRequest),
    RecordDispatchAttempt(RecordDispatchAttemptRequest),
    MarkDispatched(MarkDispatchedRequest),
    DispatchFailed(DispatchFailedRequest),
    ObserveRun(ObserveRunRequest),
    RecordStatusFailure(RecordStatusFailureRequest),
    FailRun(FailRunRequest),
    CancelRun(CancelRunRequest),
    RecordCancelAdvisory(RecordCancelAdvisoryRequest),
}

#[derive(Debug, Clone)]
pub struct CreateTenantRequest {
    pub tenant: Tenant,
}

#[derive(Debug, Clone)]
pub struct CreateEnvironmentRequest {
    pub environment: Environment,
}

#[derive(Debug, Clone)]
pub struct SetEnvironmentStatusRequest {
    pub environment_id: EnvironmentId,
    pub status: EnvironmentStatus,
}

#[derive(Debug, Clone)]
pub struct ResizeEnvironmentRequest {
    pub environment_id: EnvironmentId,
    pub capacity: EnvironmentCapacity,
}

#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub job: Job,
}

/// Creates a run in `accepted`. When `idempotency` is set and the key is
/// already bound with the same fingerprint the request is a no-op; a
/// different fingerprint fails with `IdempotencyConflict`.
#[derive(Debug, Clone)]
pub struct CreateRunRequest {
    pub run: Run,
    pub idempotency: Option<IdempotencyRecord>,
}

/// Reserves a concurrency slot and vCPU for an `accepted` run. Fails with
/// `AdmissionDenied` without writing anything when the environment cannot
/// take the run.
#[derive(Debug, Clone)]
pub struct AdmitRunRequest {
    pub run_id: RunId,
}

#[derive(Debug, Clone)]
pub struct ReleaseAdmissionRequest {
    pub run_id: RunId,
}

#[derive(Debug, Clone)]
pub struct RecordDispatchAttemptRequest {
    pub run_id: RunId,
}

#[derive(Debug, Clone)]
pub struct MarkDispatchedRequest {
    pub run_id: RunId,
    pub emr_job_run_id: String,
    pub log_pointer: Option<LogPointer>,
}

#[derive(Debug, Clone)]
pub struct DispatchFailedRequest {
    pub run_id: RunId,
    pub reason: String,
}

/// Status reported by the job engine for a dispatched run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedStatus {
    Queued,
    Running,
    Succeeded,
    Failed { reason: Option<String> },
}

#[derive(Debug, Clone)]
pub struct ObserveRunRequest {
    pub run_id: RunId,
    pub observed: ObservedStatus,
    pub log_pointer: Option<LogPointer>,
}

#[derive(Debug, Clone)]
pub struct RecordStatusFailureRequest {
    pub run_id: RunId,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct FailRunRequest {
    pub run_id: RunId,
    pub reason: String,
}

/// Cancels a run without waiting for work in progress on it. A run whose
/// submission is in flight only gets `cancellation_requested`; the dispatcher
/// cancels it when it records the submission outcome.
#[derive(Debug, Clone)]
pub struct CancelRunRequest {
    pub run_id: RunId,
}

/// Advisory note on a run that may already be terminal, e.g. a failed
/// external cancel. Never changes the run state.
#[derive(Debug, Clone)]
pub struct RecordCancelAdvisoryRequest {
    pub run_id: RunId,
    pub message: String,
}
