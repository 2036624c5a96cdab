use std::sync::Arc;

use anyhow::Result;
use data_model::{
    AuditEvent,
    Environment,
    EnvironmentCapacity,
    EnvironmentId,
    EnvironmentStatus,
    Error,
    IdempotencyRecord,
    Job,
    Run,
    RunId,
    RunState,
    Tenant,
    UsageRecord,
};
use rocksdb::{BoundColumnFamily, Transaction, TransactionDB};
use serde::de::DeserializeOwned;
use sparkpilot_utils::OptionInspectNone;
use strum::AsRefStr;
use tracing::{debug, info};

use crate::{
    requests::{
        CreateRunRequest,
        DispatchFailedRequest,
        MarkDispatchedRequest,
        ObserveRunRequest,
        ObservedStatus,
        RecordCancelAdvisoryRequest,
        RecordStatusFailureRequest,
    },
    serializer::{JsonEncode, JsonEncoder},
};

#[derive(AsRefStr, strum::Display, strum::EnumIter)]
pub enum SparkPilotColumns {
    Tenants,             //  TenantId -> Tenant
    TenantNames,         //  Name -> TenantId
    Environments,        //  EnvironmentId -> Environment
    EnvironmentsByTenant, // Tenant|CreatedAt|EnvironmentId -> Empty
    Jobs,                //  JobId -> Job
    Runs,                //  RunId -> Run
    RunsByEnvironment,   //  EnvironmentId|RunId -> Empty
    IdempotencyKeys,     //  JobId|Key -> IdempotencyRecord
    UsageRecords,        //  Tenant|RecordedAt|RunId -> UsageRecord
    AuditEvents,         //  Tenant|CreatedAt|EventId -> AuditEvent
}

impl SparkPilotColumns {
    pub fn cf_db<'a>(&'a self, db: &'a TransactionDB) -> Arc<BoundColumnFamily<'a>> {
        db.cf_handle(self.as_ref())
            .inspect_none(|| {
                tracing::error!("failed to get column family handle for {}", self.as_ref());
            })
            .unwrap()
    }
}

/// Records changed by a write, used to refresh the in-memory state after
/// the transaction commits, and the audit events committed with them.
#[derive(Debug, Default)]
pub struct WriteEffects {
    pub environments: Vec<Environment>,
    pub runs: Vec<Run>,
    pub audit: Vec<AuditEvent>,
}

impl WriteEffects {
    pub fn environment(environment: Environment) -> Self {
        Self {
            environments: vec![environment],
            ..Default::default()
        }
    }

    pub fn run(run: Option<Run>) -> Self {
        Self {
            runs: run.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn audited(mut self, event: AuditEvent) -> Self {
        self.audit.push(event);
        self
    }
}

fn get_for_update<T: DeserializeOwned>(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    column: SparkPilotColumns,
    key: &str,
) -> Result<Option<T>> {
    let value = txn.get_for_update_cf(&column.cf_db(db), key, true)?;
    value.map(|v| JsonEncoder::decode(&v)).transpose()
}

fn put<T: serde::Serialize + std::fmt::Debug>(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    column: SparkPilotColumns,
    key: &str,
    value: &T,
) -> Result<()> {
    let serialized = JsonEncoder::encode(value)?;
    txn.put_cf(&column.cf_db(db), key, serialized)?;
    Ok(())
}

fn put_index(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    column: SparkPilotColumns,
    key: &str,
) -> Result<()> {
    txn.put_cf(&column.cf_db(db), key, [])?;
    Ok(())
}

pub(crate) fn load_environment(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    environment_id: &EnvironmentId,
) -> Result<Environment> {
    get_for_update(db, txn, SparkPilotColumns::Environments, environment_id.get())?
        .ok_or_else(|| Error::not_found("environment", environment_id).into())
}

pub(crate) fn load_run(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    run_id: &RunId,
) -> Result<Run> {
    get_for_update(db, txn, SparkPilotColumns::Runs, run_id.get())?
        .ok_or_else(|| Error::not_found("run", run_id).into())
}

fn put_run(db: &TransactionDB, txn: &Transaction<TransactionDB>, run: &Run) -> Result<()> {
    put(db, txn, SparkPilotColumns::Runs, &run.key(), run)
}

/// Writes the usage of a run that just reached a terminal state. Called only
/// on the transition into the terminal state so each run is billed once.
fn record_usage(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    run: &Run,
    now: u64,
) -> Result<()> {
    if !run.state.is_terminal() {
        return Ok(());
    }
    if let Some(usage) = UsageRecord::for_run(run, now) {
        debug!(
            run_id = run.id.get(),
            vcpu_seconds = usage.vcpu_seconds,
            "recording usage"
        );
        put(db, txn, SparkPilotColumns::UsageRecords, &usage.key(), &usage)?;
    }
    Ok(())
}

pub(crate) fn put_audit_events(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    events: &[AuditEvent],
) -> Result<()> {
    for event in events {
        put(db, txn, SparkPilotColumns::AuditEvents, &event.key(), event)?;
    }
    Ok(())
}

pub(crate) fn create_tenant(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    tenant: &Tenant,
) -> Result<()> {
    let existing: Option<String> =
        get_for_update(db, txn, SparkPilotColumns::TenantNames, &tenant.name)?;
    if existing.is_some() {
        return Err(Error::AlreadyExists {
            kind: "tenant",
            id: tenant.name.clone(),
        }
        .into());
    }
    put(db, txn, SparkPilotColumns::Tenants, &tenant.key(), tenant)?;
    put(db, txn, SparkPilotColumns::TenantNames, &tenant.name, &tenant.id)?;
    info!(tenant_id = tenant.id.as_str(), "created tenant");
    Ok(())
}

pub(crate) fn create_environment(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    environment: &Environment,
) -> Result<()> {
    let tenant: Option<Tenant> =
        get_for_update(db, txn, SparkPilotColumns::Tenants, &environment.tenant_id)?;
    if tenant.is_none() {
        return Err(Error::not_found("tenant", &environment.tenant_id).into());
    }
    let existing: Option<Environment> =
        get_for_update(db, txn, SparkPilotColumns::Environments, &environment.key())?;
    if existing.is_some() {
        return Err(Error::invalid_config(format!(
            "environment {} already exists",
            environment.id
        ))
        .into());
    }
    put(
        db,
        txn,
        SparkPilotColumns::Environments,
        &environment.key(),
        environment,
    )?;
    put_index(
        db,
        txn,
        SparkPilotColumns::EnvironmentsByTenant,
        &environment.tenant_index_key(),
    )?;
    info!(
        environment_id = environment.id.get(),
        tenant_id = environment.tenant_id.as_str(),
        "created environment"
    );
    Ok(())
}

pub(crate) fn set_environment_status(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    environment_id: &EnvironmentId,
    status: EnvironmentStatus,
    now: u64,
) -> Result<Environment> {
    let mut environment = load_environment(db, txn, environment_id)?;
    environment.set_status(status, now)?;
    put(
        db,
        txn,
        SparkPilotColumns::Environments,
        &environment.key(),
        &environment,
    )?;
    Ok(environment)
}

/// Committed-usage checks are done by the caller against the in-memory
/// state, under the same write lock.
pub(crate) fn resize_environment(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    environment_id: &EnvironmentId,
    capacity: &EnvironmentCapacity,
    now: u64,
) -> Result<Environment> {
    capacity.validate()?;
    let mut environment = load_environment(db, txn, environment_id)?;
    if environment.status == EnvironmentStatus::Terminated {
        return Err(Error::invalid_config(format!(
            "environment {} is terminated",
            environment.id
        ))
        .into());
    }
    environment.max_concurrent_runs = capacity.max_concurrent_runs;
    environment.max_vcpu = capacity.max_vcpu;
    environment.updated_at = now;
    put(
        db,
        txn,
        SparkPilotColumns::Environments,
        &environment.key(),
        &environment,
    )?;
    Ok(environment)
}

/// Returns the tenant owning the job's environment.
pub(crate) fn create_job(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    job: &Job,
) -> Result<String> {
    let environment = load_environment(db, txn, &job.environment_id)?;
    if job.timeout_seconds > environment.max_run_seconds {
        return Err(Error::invalid_config(format!(
            "timeout_seconds must not exceed {}",
            environment.max_run_seconds
        ))
        .into());
    }
    put(db, txn, SparkPilotColumns::Jobs, &job.key(), job)?;
    Ok(environment.tenant_id)
}

/// Returns the created run, or `None` when an identical request already
/// created one under the same idempotency key.
pub(crate) fn create_run(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    request: &CreateRunRequest,
) -> Result<Option<Run>> {
    if let Some(idempotency) = &request.idempotency {
        let existing: Option<IdempotencyRecord> = get_for_update(
            db,
            txn,
            SparkPilotColumns::IdempotencyKeys,
            &idempotency.key(),
        )?;
        if let Some(existing) = existing {
            if existing.fingerprint != idempotency.fingerprint {
                return Err(Error::IdempotencyConflict(idempotency.idempotency_key.clone()).into());
            }
            return Ok(None);
        }
    }

    let run = &request.run;
    let environment = load_environment(db, txn, &run.environment_id)?;
    if !environment.status.accepts_runs() {
        return Err(Error::invalid_config(format!(
            "environment {} is {} and does not accept runs",
            environment.id, environment.status
        ))
        .into());
    }
    let job: Option<Job> = get_for_update(db, txn, SparkPilotColumns::Jobs, run.job_id.get())?;
    if job.is_none() {
        return Err(Error::not_found("job", &run.job_id).into());
    }

    put_run(db, txn, run)?;
    put_index(
        db,
        txn,
        SparkPilotColumns::RunsByEnvironment,
        &run.environment_index_key(),
    )?;
    if let Some(idempotency) = &request.idempotency {
        put(
            db,
            txn,
            SparkPilotColumns::IdempotencyKeys,
            &idempotency.key(),
            idempotency,
        )?;
    }
    Ok(Some(run.clone()))
}

pub(crate) fn record_dispatch_attempt(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    run_id: &RunId,
    now: u64,
) -> Result<Option<Run>> {
    let mut run = load_run(db, txn, run_id)?;
    if run.state.is_terminal() {
        return Ok(None);
    }
    run.record_dispatch_attempt(now);
    put_run(db, txn, &run)?;
    Ok(Some(run))
}

/// Records the engine handle. A cancellation requested while the
/// submission was in flight takes effect here, leaving the run `cancelled`
/// with its handle so the engine job can be stopped.
pub(crate) fn mark_dispatched(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    request: &MarkDispatchedRequest,
    now: u64,
) -> Result<Run> {
    let mut run = load_run(db, txn, &request.run_id)?;
    run.mark_dispatched(
        request.emr_job_run_id.clone(),
        request.log_pointer.clone(),
        now,
    )?;
    if run.cancellation_requested {
        run.cancel(now)?;
    }
    put_run(db, txn, &run)?;
    record_usage(db, txn, &run, now)?;
    Ok(run)
}

pub(crate) fn dispatch_failed(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    request: &DispatchFailedRequest,
    now: u64,
) -> Result<Run> {
    let mut run = load_run(db, txn, &request.run_id)?;
    if run.cancellation_requested {
        run.cancel(now)?;
        run.error_message = Some(request.reason.clone());
    } else {
        run.fail(request.reason.clone(), now)?;
    }
    run.dispatch_attempts += 1;
    run.last_dispatch_attempt_at = Some(now);
    put_run(db, txn, &run)?;
    record_usage(db, txn, &run, now)?;
    Ok(run)
}

/// Applies an engine observation. Returns `None` when nothing changed, so
/// repeating an observation is a no-op.
pub(crate) fn observe_run(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    request: &ObserveRunRequest,
    now: u64,
) -> Result<Option<Run>> {
    let mut run = load_run(db, txn, &request.run_id)?;
    if run.state.is_terminal() {
        return Ok(None);
    }
    if run.state == RunState::Accepted {
        return Err(Error::InvalidTransition {
            entity: "run",
            id: run.id.to_string(),
            from: run.state.to_string(),
            to: format!("observed {:?}", request.observed),
        }
        .into());
    }

    let mut changed = false;
    if run.consecutive_status_failures > 0 {
        run.consecutive_status_failures = 0;
        changed = true;
    }
    if let Some(pointer) = request.log_pointer.clone() {
        if run.emr_job_run_id.is_some() {
            changed |= run.attach_log_pointer(pointer);
        }
    }

    // A dispatching run observed as finished passes through running first.
    let started = |run: &mut Run| -> Result<(), Error> {
        if run.state == RunState::Dispatching {
            run.mark_running(now)?;
        }
        Ok(())
    };
    match &request.observed {
        ObservedStatus::Queued => {}
        ObservedStatus::Running => {
            if run.state != RunState::Running {
                started(&mut run)?;
                changed = true;
            }
        }
        ObservedStatus::Succeeded => {
            started(&mut run)?;
            run.transition_to(RunState::Succeeded, now)?;
            changed = true;
        }
        ObservedStatus::Failed { reason } => {
            started(&mut run)?;
            run.fail(
                reason
                    .clone()
                    .unwrap_or_else(|| "job failed in engine".to_string()),
                now,
            )?;
            changed = true;
        }
    }

    if !changed {
        return Ok(None);
    }
    run.updated_at = now;
    put_run(db, txn, &run)?;
    record_usage(db, txn, &run, now)?;
    Ok(Some(run))
}

pub(crate) fn record_status_failure(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    request: &RecordStatusFailureRequest,
    now: u64,
) -> Result<Option<Run>> {
    let mut run = load_run(db, txn, &request.run_id)?;
    if run.state.is_terminal() {
        return Ok(None);
    }
    run.consecutive_status_failures += 1;
    run.last_status_failure_at = Some(now);
    put_run(db, txn, &run)?;
    Ok(Some(run))
}

pub(crate) fn fail_run(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    run_id: &RunId,
    reason: &str,
    now: u64,
) -> Result<Run> {
    let mut run = load_run(db, txn, run_id)?;
    run.fail(reason, now)?;
    put_run(db, txn, &run)?;
    record_usage(db, txn, &run, now)?;
    Ok(run)
}

/// `submission_in_flight` is true while the run holds an admission
/// reservation; the run is then only flagged.
pub(crate) fn cancel_run(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    run_id: &RunId,
    submission_in_flight: bool,
    now: u64,
) -> Result<Run> {
    let mut run = load_run(db, txn, run_id)?;
    if submission_in_flight && run.state == RunState::Accepted {
        if !run.cancellation_requested {
            run.cancellation_requested = true;
            run.updated_at = now;
            put_run(db, txn, &run)?;
        }
        return Ok(run);
    }
    run.cancel(now)?;
    put_run(db, txn, &run)?;
    record_usage(db, txn, &run, now)?;
    Ok(run)
}

pub(crate) fn record_cancel_advisory(
    db: &TransactionDB,
    txn: &Transaction<TransactionDB>,
    request: &RecordCancelAdvisoryRequest,
    now: u64,
) -> Result<Run> {
    let mut run = load_run(db, txn, &request.run_id)?;
    run.error_message = Some(match run.error_message.take() {
        Some(existing) => format!("{}; {}", existing, request.message),
        None => request.message.clone(),
    });
    run.updated_at = now;
    put_run(db, txn, &run)?;
    Ok(run)
}
