use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use data_model::{AuditEvent, Error, RunState};
use in_memory_state::InMemoryState;
use metrics::{StateStoreMetrics, Timer};
use opentelemetry::KeyValue;
use requests::{RequestPayload, StateMachineUpdateRequest};
use rocksdb::{ColumnFamilyDescriptor, Options, TransactionDB, TransactionDBOptions};
use sparkpilot_utils::get_epoch_time_in_ms;
use state_machine::{SparkPilotColumns, WriteEffects};
use strum::IntoEnumIterator;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, span};

pub mod in_memory_state;
pub mod requests;
pub mod scanner;
pub mod serializer;
pub mod state_machine;
pub mod test_state_store;

pub struct SparkPilotState {
    pub db: Arc<TransactionDB>,
    pub metrics: Arc<StateStoreMetrics>,
    pub in_memory_state: Arc<RwLock<InMemoryState>>,
    pub change_events_tx: watch::Sender<()>,
    pub change_events_rx: watch::Receiver<()>,
}

impl SparkPilotState {
    pub async fn new(path: PathBuf) -> Result<Arc<Self>> {
        fs::create_dir_all(path.clone())
            .map_err(|e| anyhow!("failed to create state store dir: {}", e))?;

        let sm_column_families = SparkPilotColumns::iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.to_string(), Options::default()));
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);
        let db = Arc::new(
            TransactionDB::open_cf_descriptors(
                &db_opts,
                &TransactionDBOptions::default(),
                path,
                sm_column_families,
            )
            .map_err(|e| anyhow!("failed to open db: {}", e))?,
        );
        let state_store_metrics = Arc::new(StateStoreMetrics::new());
        let (change_events_tx, change_events_rx) = watch::channel(());
        let in_memory_state = InMemoryState::new(&scanner::StateReader::new(
            db.clone(),
            state_store_metrics.clone(),
        ))?;
        info!(
            pending_runs = in_memory_state
                .runs_in_states(&[RunState::Accepted])
                .len(),
            "initialized state store"
        );
        Ok(Arc::new(Self {
            db,
            metrics: state_store_metrics,
            in_memory_state: Arc::new(RwLock::new(in_memory_state)),
            change_events_tx,
            change_events_rx,
        }))
    }

    /// Fires after every committed write that changed a run or environment.
    pub fn get_change_watcher(&self) -> watch::Receiver<()> {
        self.change_events_rx.clone()
    }

    /// Applies a request in a single rocksdb transaction. Writes are
    /// serialized by the in-memory state lock, which is held from the
    /// admission checks until the in-memory view reflects the commit.
    #[tracing::instrument(
        skip(self, request),
        fields(
            request_type = request.payload.to_string(),
        )
    )]
    pub async fn write(&self, request: StateMachineUpdateRequest) -> Result<()> {
        let timer_kv = &[KeyValue::new("request", request.payload.to_string())];
        debug!("writing state machine update request");
        let _timer = Timer::start_with_labels(&self.metrics.state_write, timer_kv);
        let now = get_epoch_time_in_ms();
        let actor = &request.actor;
        let mut in_memory_state = self.in_memory_state.write().await;
        let txn = self.db.transaction();
        let effects = match &request.payload {
            RequestPayload::CreateTenant(req) => {
                state_machine::create_tenant(&self.db, &txn, &req.tenant)?;
                WriteEffects::default().audited(
                    AuditEvent::new(
                        actor,
                        &req.tenant.id,
                        "tenant.create",
                        "tenant",
                        &req.tenant.id,
                        now,
                    )
                    .with_detail("name", &req.tenant.name),
                )
            }
            RequestPayload::CreateEnvironment(req) => {
                let environment = &req.environment;
                state_machine::create_environment(&self.db, &txn, environment)?;
                WriteEffects::environment(environment.clone()).audited(
                    AuditEvent::new(
                        actor,
                        &environment.tenant_id,
                        "environment.create",
                        "environment",
                        environment.id.get(),
                        now,
                    )
                    .with_detail("region", &environment.region)
                    .with_detail("provisioning_mode", environment.provisioning_mode),
                )
            }
            RequestPayload::SetEnvironmentStatus(req) => {
                let environment = state_machine::set_environment_status(
                    &self.db,
                    &txn,
                    &req.environment_id,
                    req.status,
                    now,
                )?;
                info!(
                    environment_id = req.environment_id.get(),
                    status = %req.status,
                    "environment status changed"
                );
                let event = AuditEvent::new(
                    actor,
                    &environment.tenant_id,
                    "environment.status_change",
                    "environment",
                    environment.id.get(),
                    now,
                )
                .with_detail("status", req.status);
                WriteEffects::environment(environment).audited(event)
            }
            RequestPayload::ResizeEnvironment(req) => {
                in_memory_state.check_resize(&req.environment_id, &req.capacity)?;
                let environment = state_machine::resize_environment(
                    &self.db,
                    &txn,
                    &req.environment_id,
                    &req.capacity,
                    now,
                )?;
                let event = AuditEvent::new(
                    actor,
                    &environment.tenant_id,
                    "environment.resize",
                    "environment",
                    environment.id.get(),
                    now,
                )
                .with_detail("max_concurrent_runs", environment.max_concurrent_runs)
                .with_detail("max_vcpu", environment.max_vcpu);
                WriteEffects::environment(environment).audited(event)
            }
            RequestPayload::CreateJob(req) => {
                let tenant_id = state_machine::create_job(&self.db, &txn, &req.job)?;
                WriteEffects::default().audited(
                    AuditEvent::new(actor, &tenant_id, "job.create", "job", req.job.id.get(), now)
                        .with_detail("name", &req.job.name),
                )
            }
            RequestPayload::CreateRun(req) => {
                let _span = span!(
                    tracing::Level::INFO,
                    "create_run",
                    run_id = req.run.id.get(),
                    environment_id = req.run.environment_id.get(),
                )
                .entered();
                let created = state_machine::create_run(&self.db, &txn, req)?;
                let event = created.as_ref().map(|run| {
                    AuditEvent::for_run(actor, run, "run.create", now)
                        .with_detail("job_id", &run.job_id)
                });
                let mut effects = WriteEffects::run(created);
                effects.audit.extend(event);
                effects
            }
            RequestPayload::AdmitRun(req) => {
                let run = state_machine::load_run(&self.db, &txn, &req.run_id)?;
                if run.state != RunState::Accepted {
                    return Err(Error::InvalidTransition {
                        entity: "run",
                        id: run.id.to_string(),
                        from: run.state.to_string(),
                        to: RunState::Dispatching.to_string(),
                    }
                    .into());
                }
                in_memory_state.check_admission(&req.run_id)?;
                WriteEffects::default()
            }
            RequestPayload::ReleaseAdmission(_) => WriteEffects::default(),
            RequestPayload::RecordDispatchAttempt(req) => WriteEffects::run(
                state_machine::record_dispatch_attempt(&self.db, &txn, &req.run_id, now)?,
            ),
            RequestPayload::MarkDispatched(req) => {
                let run = state_machine::mark_dispatched(&self.db, &txn, req, now)?;
                let dispatched = AuditEvent::for_run(actor, &run, "run.dispatched", now)
                    .with_detail("emr_job_run_id", &req.emr_job_run_id);
                let cancelled = (run.state == RunState::Cancelled)
                    .then(|| AuditEvent::for_run(actor, &run, "run.cancel", now));
                let mut effects = WriteEffects::run(Some(run)).audited(dispatched);
                effects.audit.extend(cancelled);
                effects
            }
            RequestPayload::DispatchFailed(req) => {
                let run = state_machine::dispatch_failed(&self.db, &txn, req, now)?;
                let event = AuditEvent::for_run(actor, &run, "run.dispatch_failed", now)
                    .with_detail("error", &req.reason);
                WriteEffects::run(Some(run)).audited(event)
            }
            RequestPayload::ObserveRun(req) => {
                let observed = state_machine::observe_run(&self.db, &txn, req, now)?;
                let event = observed.as_ref().map(|run| {
                    AuditEvent::for_run(actor, run, "run.reconcile", now)
                        .with_detail("observed", format!("{:?}", req.observed))
                });
                let mut effects = WriteEffects::run(observed);
                effects.audit.extend(event);
                effects
            }
            RequestPayload::RecordStatusFailure(req) => WriteEffects::run(
                state_machine::record_status_failure(&self.db, &txn, req, now)?,
            ),
            RequestPayload::FailRun(req) => {
                let run = state_machine::fail_run(&self.db, &txn, &req.run_id, &req.reason, now)?;
                let event = AuditEvent::for_run(actor, &run, "run.fail", now)
                    .with_detail("reason", &req.reason);
                WriteEffects::run(Some(run)).audited(event)
            }
            RequestPayload::CancelRun(req) => {
                let in_flight = in_memory_state.is_reserved(&req.run_id);
                let run = state_machine::cancel_run(&self.db, &txn, &req.run_id, in_flight, now)?;
                let action = match run.state {
                    RunState::Cancelled => "run.cancel",
                    _ => "run.cancel.request",
                };
                let event = AuditEvent::for_run(actor, &run, action, now);
                WriteEffects::run(Some(run)).audited(event)
            }
            RequestPayload::RecordCancelAdvisory(req) => WriteEffects::run(Some(
                state_machine::record_cancel_advisory(&self.db, &txn, req, now)?,
            )),
        };
        state_machine::put_audit_events(&self.db, &txn, &effects.audit)?;
        txn.commit()?;
        in_memory_state
            .update_state(&request.payload, &effects)
            .map_err(|e| anyhow!("error updating in memory state: {:?}", e))?;
        drop(in_memory_state);
        if !effects.runs.is_empty() || !effects.environments.is_empty() {
            let _ = self.change_events_tx.send(());
        }
        Ok(())
    }

    pub fn reader(&self) -> scanner::StateReader {
        scanner::StateReader::new(self.db.clone(), self.metrics.clone())
    }
}

#[cfg(test)]
mod tests {
    use data_model::{
        find_error,
        test_objects::tests::{mock_job, TEST_TENANT},
        Actor,
        EnvironmentCapacity,
        EnvironmentStatus,
        Error,
        IdempotencyRecord,
        RequestedResources,
        Run,
        RunState,
        Tenant,
    };

    use super::*;
    use crate::{
        requests::*,
        scanner::RunFilter,
        test_state_store::TestStateStore,
    };

    #[tokio::test]
    async fn test_environment_listing_and_status() -> Result<()> {
        let store = TestStateStore::new().await?;
        let first = store.with_environment(EnvironmentStatus::Provisioning, 2, 8).await?;
        let second = store.with_environment(EnvironmentStatus::Provisioning, 2, 8).await?;

        let listed = store.state.reader().list_environments(Some(TEST_TENANT))?;
        assert_eq!(listed.len(), 2);
        assert!(listed[0].created_at <= listed[1].created_at);
        assert!(store
            .state
            .reader()
            .list_environments(Some("other-tenant"))?
            .is_empty());

        store
            .set_environment_status(&first, EnvironmentStatus::Active)
            .await?;
        let err = store
            .set_environment_status(&second, EnvironmentStatus::Terminated)
            .await
            .unwrap_err();
        assert!(matches!(
            find_error(&err),
            Some(Error::InvalidTransition { .. })
        ));
        let first = store.state.reader().get_environment(&first.id)?.unwrap();
        assert_eq!(first.status, EnvironmentStatus::Active);
        Ok(())
    }

    #[tokio::test]
    async fn test_admission_respects_concurrency_and_vcpu() -> Result<()> {
        let store = TestStateStore::new().await?;
        // default resources request 5 vCPU
        let env = store.with_environment(EnvironmentStatus::Active, 2, 8).await?;
        let job = store.with_job(&env).await?;
        let run_a = store.with_run(&job).await?;
        let run_b = store.with_run(&job).await?;

        store.admit(&run_a).await?;
        let err = store.admit(&run_b).await.unwrap_err();
        assert!(matches!(
            find_error(&err),
            Some(Error::AdmissionDenied { .. })
        ));

        // re-admitting a reserved run does not count it twice
        store.admit(&run_a).await?;
        let committed = store.state.in_memory_state.read().await.committed(&env.id);
        assert_eq!(committed.runs, 1);
        assert_eq!(committed.vcpu, 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_dispatch_failure_releases_reservation() -> Result<()> {
        let store = TestStateStore::new().await?;
        let env = store.with_environment(EnvironmentStatus::Active, 1, 16).await?;
        let job = store.with_job(&env).await?;
        let run_a = store.with_run(&job).await?;
        let run_b = store.with_run(&job).await?;

        store.admit(&run_a).await?;
        store
            .state
            .write(
                RequestPayload::DispatchFailed(DispatchFailedRequest {
                    run_id: run_a.id.clone(),
                    reason: "engine rejected submission".to_string(),
                })
                .into(),
            )
            .await?;
        let failed = store.state.reader().get_run(&run_a.id)?.unwrap();
        assert_eq!(failed.state, RunState::Failed);
        assert!(failed.emr_job_run_id.is_none());
        assert!(failed.check_invariants().is_ok());

        store.admit(&run_b).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_observations_are_idempotent() -> Result<()> {
        let store = TestStateStore::new().await?;
        let env = store.with_environment(EnvironmentStatus::Active, 2, 16).await?;
        let job = store.with_job(&env).await?;
        let run = store.with_run(&job).await?;
        store.admit(&run).await?;
        store.mark_dispatched(&run, &env, "emr-1").await?;

        let observe = |observed: ObservedStatus| {
            StateMachineUpdateRequest::from(RequestPayload::ObserveRun(ObserveRunRequest {
                run_id: run.id.clone(),
                observed,
                log_pointer: None,
            }))
        };
        store.state.write(observe(ObservedStatus::Running)).await?;
        let first = store.state.reader().get_run(&run.id)?.unwrap();
        store.state.write(observe(ObservedStatus::Running)).await?;
        let second = store.state.reader().get_run(&run.id)?.unwrap();
        assert_eq!(first, second);
        assert_eq!(second.state, RunState::Running);
        assert!(second.started_at.is_some());

        store.state.write(observe(ObservedStatus::Succeeded)).await?;
        store.state.write(observe(ObservedStatus::Failed { reason: None })).await?;
        let done = store.state.reader().get_run(&run.id)?.unwrap();
        assert_eq!(done.state, RunState::Succeeded);
        assert!(done.check_invariants().is_ok());

        let usage = store.state.reader().list_usage(TEST_TENANT, None, None)?;
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].run_id, run.id);
        Ok(())
    }

    #[tokio::test]
    async fn test_dispatching_run_observed_terminal_passes_running() -> Result<()> {
        let store = TestStateStore::new().await?;
        let env = store.with_environment(EnvironmentStatus::Active, 2, 16).await?;
        let job = store.with_job(&env).await?;
        let run = store.with_run(&job).await?;
        store.admit(&run).await?;
        store.mark_dispatched(&run, &env, "emr-2").await?;
        store
            .state
            .write(
                RequestPayload::ObserveRun(ObserveRunRequest {
                    run_id: run.id.clone(),
                    observed: ObservedStatus::Failed {
                        reason: Some("executor lost".to_string()),
                    },
                    log_pointer: None,
                })
                .into(),
            )
            .await?;
        let run = store.state.reader().get_run(&run.id)?.unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert!(run.started_at.is_some());
        assert_eq!(run.error_message.as_deref(), Some("executor lost"));
        Ok(())
    }

    #[tokio::test]
    async fn test_resize_cannot_drop_below_committed() -> Result<()> {
        let store = TestStateStore::new().await?;
        let env = store.with_environment(EnvironmentStatus::Active, 3, 32).await?;
        let job = store.with_job(&env).await?;
        for handle in ["emr-a", "emr-b"] {
            let run = store.with_run(&job).await?;
            store.admit(&run).await?;
            store.mark_dispatched(&run, &env, handle).await?;
        }

        let resize = |max_concurrent_runs, max_vcpu| {
            StateMachineUpdateRequest::from(RequestPayload::ResizeEnvironment(
                ResizeEnvironmentRequest {
                    environment_id: env.id.clone(),
                    capacity: EnvironmentCapacity {
                        max_concurrent_runs,
                        max_vcpu,
                    },
                },
            ))
        };
        let err = store.state.write(resize(1, 32)).await.unwrap_err();
        assert!(matches!(find_error(&err), Some(Error::InvalidConfig(_))));
        let err = store.state.write(resize(3, 9)).await.unwrap_err();
        assert!(matches!(find_error(&err), Some(Error::InvalidConfig(_))));
        store.state.write(resize(2, 10)).await?;
        let env = store.state.reader().get_environment(&env.id)?.unwrap();
        assert_eq!(env.max_concurrent_runs, 2);
        assert_eq!(env.max_vcpu, 10);
        Ok(())
    }

    #[tokio::test]
    async fn test_idempotent_run_creation() -> Result<()> {
        let store = TestStateStore::new().await?;
        let env = store.with_environment(EnvironmentStatus::Active, 2, 16).await?;
        let job = store.with_job(&env).await?;
        let create = |fingerprint: &str| -> Result<StateMachineUpdateRequest> {
            let run = Run::new(
                &job,
                &env,
                RequestedResources::default(),
                None,
                Some("key-1".to_string()),
                get_epoch_time_in_ms(),
            )?;
            let idempotency = IdempotencyRecord {
                job_id: job.id.clone(),
                idempotency_key: "key-1".to_string(),
                fingerprint: fingerprint.to_string(),
                run_id: run.id.clone(),
                created_at: run.created_at,
            };
            Ok(RequestPayload::CreateRun(CreateRunRequest {
                run,
                idempotency: Some(idempotency),
            })
            .into())
        };

        store.state.write(create("fp-1")?).await?;
        store.state.write(create("fp-1")?).await?;
        let runs = store.state.reader().list_runs(&RunFilter {
            environment_id: Some(env.id.clone()),
            ..Default::default()
        })?;
        assert_eq!(runs.len(), 1);
        let record = store
            .state
            .reader()
            .get_idempotency_record(&job.id, "key-1")?
            .unwrap();
        assert_eq!(record.run_id, runs[0].id);

        let err = store.state.write(create("fp-2")?).await.unwrap_err();
        assert!(matches!(
            find_error(&err),
            Some(Error::IdempotencyConflict(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_and_advisory() -> Result<()> {
        let store = TestStateStore::new().await?;
        let env = store.with_environment(EnvironmentStatus::Active, 2, 16).await?;
        let job = store.with_job(&env).await?;
        let run = store.with_run(&job).await?;
        let cancel =
            || StateMachineUpdateRequest::from(RequestPayload::CancelRun(CancelRunRequest {
                run_id: run.id.clone(),
            }));

        store.state.write(cancel()).await?;
        let err = store.state.write(cancel()).await.unwrap_err();
        assert!(matches!(
            find_error(&err),
            Some(Error::InvalidTransition { .. })
        ));

        store
            .state
            .write(
                RequestPayload::RecordCancelAdvisory(RecordCancelAdvisoryRequest {
                    run_id: run.id.clone(),
                    message: "external cancel failed".to_string(),
                })
                .into(),
            )
            .await?;
        let run = store.state.reader().get_run(&run.id)?.unwrap();
        assert_eq!(run.state, RunState::Cancelled);
        assert!(run.cancellation_requested);
        assert_eq!(run.error_message.as_deref(), Some("external cancel failed"));
        assert!(run.check_invariants().is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_during_submission_is_deferred() -> Result<()> {
        let store = TestStateStore::new().await?;
        let env = store.with_environment(EnvironmentStatus::Active, 2, 16).await?;
        let job = store.with_job(&env).await?;
        let acked = store.with_run(&job).await?;
        let rejected = store.with_run(&job).await?;
        for run in [&acked, &rejected] {
            store.admit(run).await?;
            store
                .state
                .write(RequestPayload::CancelRun(CancelRunRequest { run_id: run.id.clone() }).into())
                .await?;
            let flagged = store.state.reader().get_run(&run.id)?.unwrap();
            assert_eq!(flagged.state, RunState::Accepted);
            assert!(flagged.cancellation_requested);
        }
        // the reservations stay until the submission outcomes are recorded
        assert_eq!(store.state.in_memory_state.read().await.committed(&env.id).runs, 2);

        store.mark_dispatched(&acked, &env, "emr-3").await?;
        let acked = store.state.reader().get_run(&acked.id)?.unwrap();
        assert_eq!(acked.state, RunState::Cancelled);
        assert_eq!(acked.emr_job_run_id.as_deref(), Some("emr-3"));
        assert!(acked.check_invariants().is_ok());

        store
            .state
            .write(
                RequestPayload::DispatchFailed(DispatchFailedRequest {
                    run_id: rejected.id.clone(),
                    reason: "engine rejected submission".to_string(),
                })
                .into(),
            )
            .await?;
        let rejected = store.state.reader().get_run(&rejected.id)?.unwrap();
        assert_eq!(rejected.state, RunState::Cancelled);
        assert_eq!(rejected.dispatch_attempts, 1);
        assert!(rejected.check_invariants().is_ok());
        assert_eq!(
            store.state.in_memory_state.read().await.committed(&env.id),
            Default::default()
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_environment_requires_known_tenant() -> Result<()> {
        let store = TestStateStore::new().await?;
        let mut environment =
            data_model::test_objects::tests::mock_environment(EnvironmentStatus::Active);
        environment.tenant_id = "unknown-tenant".to_string();
        let err = store
            .state
            .write(RequestPayload::CreateEnvironment(CreateEnvironmentRequest { environment }).into())
            .await
            .unwrap_err();
        assert_eq!(
            find_error(&err),
            Some(&Error::not_found("tenant", "unknown-tenant"))
        );

        let duplicate = Tenant::new("test tenant", 2)?;
        let err = store
            .state
            .write(RequestPayload::CreateTenant(CreateTenantRequest { tenant: duplicate.clone() }).into())
            .await
            .unwrap_err();
        assert!(matches!(find_error(&err), Some(Error::AlreadyExists { .. })));
        assert!(store.state.reader().get_tenant(&duplicate.id)?.is_none());
        assert!(store.state.reader().get_tenant(TEST_TENANT)?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_audit_trail_follows_run_lifecycle() -> Result<()> {
        let store = TestStateStore::new().await?;
        let env = store.with_environment(EnvironmentStatus::Active, 2, 16).await?;
        let job = store.with_job(&env).await?;
        let run = store.with_run(&job).await?;
        store.admit(&run).await?;
        store
            .state
            .write(StateMachineUpdateRequest::new(
                RequestPayload::MarkDispatched(MarkDispatchedRequest {
                    run_id: run.id.clone(),
                    emr_job_run_id: "emr-5".to_string(),
                    log_pointer: None,
                }),
                Actor::worker("dispatcher"),
            ))
            .await?;
        store
            .state
            .write(StateMachineUpdateRequest::new(
                RequestPayload::CancelRun(CancelRunRequest { run_id: run.id.clone() }),
                Actor::new("alice", Some("10.1.2.3".to_string())),
            ))
            .await?;

        let events = store.state.reader().list_audit_events(TEST_TENANT, 100)?;
        let actions: Vec<&str> = events.iter().map(|e| e.action.as_str()).collect();
        for action in [
            "tenant.create",
            "environment.create",
            "job.create",
            "run.create",
            "run.dispatched",
            "run.cancel",
        ] {
            assert!(actions.contains(&action), "missing {action} in {actions:?}");
        }
        // admission bookkeeping is not audited
        assert_eq!(events.len(), 6);

        let dispatched = events.iter().find(|e| e.action == "run.dispatched").unwrap();
        assert_eq!(dispatched.actor, "worker:dispatcher");
        assert_eq!(dispatched.entity_id, run.id.get());
        assert_eq!(dispatched.details["emr_job_run_id"], "emr-5");
        let cancel = events.iter().find(|e| e.action == "run.cancel").unwrap();
        assert_eq!(cancel.actor, "alice");
        assert_eq!(cancel.source_ip.as_deref(), Some("10.1.2.3"));
        assert_eq!(cancel.details["state"], "cancelled");

        assert_eq!(store.state.reader().list_audit_events(TEST_TENANT, 2)?.len(), 2);
        assert!(store.state.reader().list_audit_events("other-tenant", 100)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_state_survives_restart() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("state");
        let (env_id, run_id) = {
            let state = SparkPilotState::new(path.clone()).await?;
            state
                .write(
                    RequestPayload::CreateTenant(CreateTenantRequest {
                        tenant: data_model::test_objects::tests::mock_tenant(),
                    })
                    .into(),
                )
                .await?;
            let env = data_model::test_objects::tests::mock_environment(EnvironmentStatus::Active);
            state
                .write(
                    RequestPayload::CreateEnvironment(CreateEnvironmentRequest {
                        environment: env.clone(),
                    })
                    .into(),
                )
                .await?;
            let job = mock_job(&env);
            state
                .write(RequestPayload::CreateJob(CreateJobRequest { job: job.clone() }).into())
                .await?;
            let run = data_model::test_objects::tests::mock_run(&job, &env);
            state
                .write(
                    RequestPayload::CreateRun(CreateRunRequest {
                        run: run.clone(),
                        idempotency: None,
                    })
                    .into(),
                )
                .await?;
            (env.id, run.id)
        };

        let state = SparkPilotState::new(path).await?;
        let in_memory = state.in_memory_state.read().await;
        assert!(in_memory.environment(&env_id).is_some());
        assert_eq!(
            in_memory.runs_in_states(&[RunState::Accepted]),
            vec![run_id.clone()]
        );
        Ok(())
    }
}
