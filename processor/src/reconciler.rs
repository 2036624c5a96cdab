use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::{find_error, Actor, Error, LogPointerResolver, Run, RunId, RunState};
use futures::StreamExt;
use metrics::Timer;
use serde::{Deserialize, Serialize};
use sparkpilot_utils::get_epoch_time_in_ms;
use state_store::{
    requests::{
        FailRunRequest,
        ObserveRunRequest,
        RecordStatusFailureRequest,
        RequestPayload,
        StateMachineUpdateRequest,
    },
    SparkPilotState,
};
use tracing::{debug, error, info, warn};

use crate::{
    backoff::BackoffPolicy,
    cancellation::spawn_external_cancel,
    engine::{EngineClient, EngineHandle},
    run_locks::RunLocks,
    runner::ProcessorLogic,
};

const MAX_CONCURRENT_QUERIES: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub interval_ms: u64,
    pub batch_size: usize,
    #[serde(flatten)]
    pub backoff: BackoffPolicy,
    pub transient_failure_threshold: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            batch_size: 50,
            backoff: BackoffPolicy::default(),
            transient_failure_threshold: 10,
        }
    }
}

impl ReconcilerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            anyhow::bail!("reconciler.interval_ms must be positive");
        }
        if self.batch_size == 0 {
            anyhow::bail!("reconciler.batch_size must be positive");
        }
        if self.transient_failure_threshold == 0 {
            anyhow::bail!("reconciler.transient_failure_threshold must be positive");
        }
        self.backoff.validate("reconciler")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Skipped,
    Unchanged,
    Transitioned { from: RunState, to: RunState },
    TransientFailure { consecutive_failures: u32 },
    TimedOut,
}

pub struct Reconciler {
    actor: Actor,
    state: Arc<SparkPilotState>,
    engine: Arc<EngineClient>,
    locks: Arc<RunLocks>,
    resolver: LogPointerResolver,
    config: ReconcilerConfig,
    metrics: metrics::reconciler::Metrics,
}

impl Reconciler {
    pub fn new(
        state: Arc<SparkPilotState>,
        engine: Arc<EngineClient>,
        locks: Arc<RunLocks>,
        resolver: LogPointerResolver,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            actor: Actor::worker("reconciler"),
            state,
            engine,
            locks,
            resolver,
            config,
            metrics: metrics::reconciler::Metrics::new(),
        }
    }

    async fn write(&self, payload: RequestPayload) -> Result<()> {
        self.state
            .write(StateMachineUpdateRequest::new(payload, self.actor.clone()))
            .await
    }

    async fn ready_runs(&self, now: u64) -> Result<Vec<Run>> {
        let candidates = self
            .state
            .in_memory_state
            .read()
            .await
            .runs_in_states(&[RunState::Dispatching, RunState::Running]);
        let reader = self.state.reader();
        let mut ready = Vec::new();
        for run_id in candidates {
            let Some(run) = reader.get_run(&run_id)? else {
                continue;
            };
            if !run.state.is_active() {
                continue;
            }
            // timeouts are enforced regardless of query backoff
            if !run.timed_out(now)
                && !self.config.backoff.is_ready(
                    run.id.get(),
                    run.consecutive_status_failures,
                    run.last_status_failure_at,
                    now,
                )
            {
                continue;
            }
            ready.push(run);
            if ready.len() >= self.config.batch_size {
                break;
            }
        }
        Ok(ready)
    }

    #[tracing::instrument(skip(self), fields(run_id = run_id.get()))]
    pub async fn reconcile_run(&self, run_id: &RunId) -> Result<ReconcileOutcome> {
        let _guard = self.locks.lock(run_id).await;
        let reader = self.state.reader();
        let Some(run) = reader.get_run(run_id)? else {
            return Ok(ReconcileOutcome::Skipped);
        };
        if !run.state.is_active() {
            return Ok(ReconcileOutcome::Skipped);
        }
        let handle = EngineHandle::new(
            run.emr_job_run_id
                .clone()
                .ok_or_else(|| anyhow!("{} run {} has no engine handle", run.state, run.id))?,
        );

        if run.timed_out(get_epoch_time_in_ms()) {
            return self.fail_timed_out(&run, handle).await;
        }

        let status = match self.engine.status(&handle).await {
            Ok(status) => status,
            Err(engine_err) => {
                let failure = Error::TransientQueryFailure(engine_err.to_string());
                self.metrics.transient_failures.add(1, &[]);
                self.write(RequestPayload::RecordStatusFailure(
                    RecordStatusFailureRequest {
                        run_id: run.id.clone(),
                        error: failure.to_string(),
                    },
                ))
                .await?;
                let consecutive_failures = run.consecutive_status_failures + 1;
                if consecutive_failures >= self.config.transient_failure_threshold {
                    warn!(
                        emr_job_run_id = handle.get(),
                        consecutive_failures, "engine status repeatedly unavailable: {}", failure
                    );
                } else {
                    debug!(
                        emr_job_run_id = handle.get(),
                        consecutive_failures, "engine status unavailable: {}", failure
                    );
                }
                return Ok(ReconcileOutcome::TransientFailure {
                    consecutive_failures,
                });
            }
        };
        self.metrics.observed.add(1, &[]);

        let log_pointer = match run.log_pointer() {
            Some(_) => None,
            None => reader
                .get_environment(&run.environment_id)?
                .and_then(|environment| self.resolver.resolve_for(&run, &environment)),
        };
        let observed = self
            .write(RequestPayload::ObserveRun(ObserveRunRequest {
                run_id: run.id.clone(),
                observed: status.into(),
                log_pointer,
            }))
            .await;
        if let Err(err) = observed {
            if let Some(Error::InvalidTransition { from, to, .. }) = find_error(&err) {
                error!(from, to, "engine status conflicts with run state");
                self.metrics.invalid_transitions.add(1, &[]);
                return Ok(ReconcileOutcome::Skipped);
            }
            return Err(err);
        }

        let updated = reader
            .get_run(run_id)?
            .ok_or_else(|| Error::not_found("run", run_id))?;
        if updated.state == run.state {
            return Ok(ReconcileOutcome::Unchanged);
        }
        self.metrics.transitions.add(1, &[]);
        info!(from = %run.state, to = %updated.state, "run state changed");
        Ok(ReconcileOutcome::Transitioned {
            from: run.state,
            to: updated.state,
        })
    }

    async fn fail_timed_out(&self, run: &Run, handle: EngineHandle) -> Result<ReconcileOutcome> {
        let reason = format!("run exceeded timeout of {} seconds", run.timeout_seconds);
        self.write(RequestPayload::FailRun(FailRunRequest {
            run_id: run.id.clone(),
            reason: reason.clone(),
        }))
        .await?;
        self.metrics.timeouts.add(1, &[]);
        warn!(emr_job_run_id = handle.get(), reason, "run timed out");
        spawn_external_cancel(
            self.state.clone(),
            self.engine.clone(),
            run.id.clone(),
            handle,
            true,
        );
        Ok(ReconcileOutcome::TimedOut)
    }
}

#[async_trait]
impl ProcessorLogic for Reconciler {
    fn name(&self) -> &'static str {
        "reconciler"
    }

    #[tracing::instrument(skip(self))]
    async fn run_once(&self) -> Result<usize> {
        let _timer = Timer::start(&self.metrics.pass_duration);
        let runs = self.ready_runs(get_epoch_time_in_ms()).await?;
        if runs.is_empty() {
            return Ok(0);
        }
        let outcomes = futures::stream::iter(runs)
            .map(|run| async move {
                let outcome = self.reconcile_run(&run.id).await;
                match &outcome {
                    Ok(ReconcileOutcome::TimedOut | ReconcileOutcome::Skipped) => {
                        self.locks.forget(&run.id)
                    }
                    Ok(ReconcileOutcome::Transitioned { to, .. }) if to.is_terminal() => {
                        self.locks.forget(&run.id)
                    }
                    Err(err) => error!(run_id = run.id.get(), "error reconciling run: {:?}", err),
                    _ => {}
                }
                outcome
            })
            .buffer_unordered(MAX_CONCURRENT_QUERIES)
            .collect::<Vec<_>>()
            .await;
        Ok(outcomes
            .iter()
            .filter(|outcome| {
                matches!(
                    outcome,
                    Ok(ReconcileOutcome::Transitioned { .. }) | Ok(ReconcileOutcome::TimedOut)
                )
            })
            .count())
    }
}

#[cfg(test)]
mod tests {
    use data_model::EnvironmentStatus;
    use state_store::{
        requests::{ObservedStatus, StateMachineUpdateRequest},
        test_state_store::TestStateStore,
    };

    use super::*;
    use crate::{
        engine::{EngineConfig, EngineError, EngineStatus},
        test_engine::FakeJobEngine,
    };

    fn reconciler(
        store: &TestStateStore,
        engine: Arc<FakeJobEngine>,
        config: ReconcilerConfig,
    ) -> Reconciler {
        Reconciler::new(
            store.state.clone(),
            Arc::new(EngineClient::new(engine, EngineConfig::default())),
            Arc::new(RunLocks::new()),
            LogPointerResolver::default(),
            config,
        )
    }

    async fn dispatched_run(store: &TestStateStore, handle: &str) -> Result<Run> {
        let env = store.with_environment(EnvironmentStatus::Active, 4, 64).await?;
        let job = store.with_job(&env).await?;
        let run = store.with_run(&job).await?;
        store.admit(&run).await?;
        store.mark_dispatched(&run, &env, handle).await?;
        Ok(store.state.reader().get_run(&run.id)?.unwrap())
    }

    #[tokio::test]
    async fn test_reconcile_follows_engine_status() -> Result<()> {
        let store = TestStateStore::new().await?;
        let run = dispatched_run(&store, "emr-1").await?;
        let engine = Arc::new(FakeJobEngine::new());
        let reconciler = reconciler(&store, engine.clone(), ReconcilerConfig::default());

        engine.set_status("emr-1", EngineStatus::Queued);
        assert_eq!(
            reconciler.reconcile_run(&run.id).await?,
            ReconcileOutcome::Unchanged
        );

        engine.set_status("emr-1", EngineStatus::Running);
        assert_eq!(
            reconciler.reconcile_run(&run.id).await?,
            ReconcileOutcome::Transitioned {
                from: RunState::Dispatching,
                to: RunState::Running
            }
        );
        let running = store.state.reader().get_run(&run.id)?.unwrap();
        assert!(running.started_at.is_some());

        // same observation twice changes nothing
        assert_eq!(
            reconciler.reconcile_run(&run.id).await?,
            ReconcileOutcome::Unchanged
        );
        assert_eq!(store.state.reader().get_run(&run.id)?.unwrap(), running);

        engine.set_status(
            "emr-1",
            EngineStatus::Failed {
                reason: Some("driver OOM".to_string()),
            },
        );
        assert_eq!(reconciler.run_once().await?, 1);
        let failed = store.state.reader().get_run(&run.id)?.unwrap();
        assert_eq!(failed.state, RunState::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("driver OOM"));
        assert!(failed.check_invariants().is_ok());
        assert_eq!(
            reconciler.reconcile_run(&run.id).await?,
            ReconcileOutcome::Skipped
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_transient_failures_do_not_block_others() -> Result<()> {
        let store = TestStateStore::new().await?;
        let flaky = dispatched_run(&store, "emr-1").await?;
        let healthy = dispatched_run(&store, "emr-2").await?;
        let engine = Arc::new(FakeJobEngine::new());
        engine.set_status_error("emr-1", EngineError::Unavailable("throttled".to_string()));
        engine.set_status("emr-2", EngineStatus::Succeeded);
        let reconciler = reconciler(
            &store,
            engine.clone(),
            ReconcilerConfig {
                transient_failure_threshold: 2,
                ..Default::default()
            },
        );

        assert_eq!(reconciler.run_once().await?, 1);
        let healthy = store.state.reader().get_run(&healthy.id)?.unwrap();
        assert_eq!(healthy.state, RunState::Succeeded);
        assert!(healthy.started_at.is_some());
        let flaky_run = store.state.reader().get_run(&flaky.id)?.unwrap();
        assert_eq!(flaky_run.state, RunState::Dispatching);
        assert_eq!(flaky_run.consecutive_status_failures, 1);

        // inside its backoff window the flaky run is not queried again
        assert_eq!(reconciler.run_once().await?, 0);
        let flaky_run = store.state.reader().get_run(&flaky.id)?.unwrap();
        assert_eq!(flaky_run.consecutive_status_failures, 1);

        assert_eq!(
            reconciler.reconcile_run(&flaky.id).await?,
            ReconcileOutcome::TransientFailure {
                consecutive_failures: 2
            }
        );

        // a successful observation clears the failure count
        engine.set_status("emr-1", EngineStatus::Running);
        reconciler.reconcile_run(&flaky.id).await?;
        let flaky_run = store.state.reader().get_run(&flaky.id)?.unwrap();
        assert_eq!(flaky_run.state, RunState::Running);
        assert_eq!(flaky_run.consecutive_status_failures, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_timed_out_run_fails_and_cancels() -> Result<()> {
        let store = TestStateStore::new().await?;
        let env = store.with_environment(EnvironmentStatus::Active, 4, 64).await?;
        let job = store.with_job(&env).await?;
        let run = Run::new(
            &job,
            &env,
            Default::default(),
            Some(1),
            None,
            get_epoch_time_in_ms(),
        )?;
        store
            .state
            .write(
                RequestPayload::CreateRun(state_store::requests::CreateRunRequest {
                    run: run.clone(),
                    idempotency: None,
                })
                .into(),
            )
            .await?;
        store.admit(&run).await?;
        store.mark_dispatched(&run, &env, "emr-9").await?;
        store
            .state
            .write(StateMachineUpdateRequest::from(RequestPayload::ObserveRun(
                ObserveRunRequest {
                    run_id: run.id.clone(),
                    observed: ObservedStatus::Running,
                    log_pointer: None,
                },
            )))
            .await?;
        tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;

        let engine = Arc::new(FakeJobEngine::new());
        engine.set_status("emr-9", EngineStatus::Running);
        let reconciler = reconciler(&store, engine.clone(), ReconcilerConfig::default());
        assert_eq!(
            reconciler.reconcile_run(&run.id).await?,
            ReconcileOutcome::TimedOut
        );
        let failed = store.state.reader().get_run(&run.id)?.unwrap();
        assert_eq!(failed.state, RunState::Failed);
        assert_eq!(
            failed.error_message.as_deref(),
            Some("run exceeded timeout of 1 seconds")
        );
        assert!(failed.check_invariants().is_ok());

        let usage = store.state.reader().list_usage(&failed.tenant_id, None, None)?;
        assert_eq!(usage.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_run_stuck_in_queue_times_out() -> Result<()> {
        let store = TestStateStore::new().await?;
        let env = store.with_environment(EnvironmentStatus::Active, 4, 64).await?;
        let job = store.with_job(&env).await?;
        let run = Run::new(
            &job,
            &env,
            Default::default(),
            Some(1),
            None,
            get_epoch_time_in_ms(),
        )?;
        store
            .state
            .write(
                RequestPayload::CreateRun(state_store::requests::CreateRunRequest {
                    run: run.clone(),
                    idempotency: None,
                })
                .into(),
            )
            .await?;
        store.admit(&run).await?;
        store.mark_dispatched(&run, &env, "emr-4").await?;

        let engine = Arc::new(FakeJobEngine::new());
        engine.set_status("emr-4", EngineStatus::Queued);
        let reconciler = reconciler(&store, engine.clone(), ReconcilerConfig::default());
        assert_eq!(
            reconciler.reconcile_run(&run.id).await?,
            ReconcileOutcome::Unchanged
        );
        assert_eq!(store.state.in_memory_state.read().await.committed(&env.id).runs, 1);

        tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;
        assert_eq!(reconciler.run_once().await?, 1);
        let failed = store.state.reader().get_run(&run.id)?.unwrap();
        assert_eq!(failed.state, RunState::Failed);
        assert!(failed.started_at.is_none());
        assert!(failed.check_invariants().is_ok());
        assert_eq!(store.state.in_memory_state.read().await.committed(&env.id).runs, 0);
        assert!(reconciler.locks.is_empty());

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while engine.cancel_count("emr-4") == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await?;

        let events = store.state.reader().list_audit_events(&failed.tenant_id, 100)?;
        let timed_out = events.iter().find(|e| e.action == "run.fail").unwrap();
        assert_eq!(timed_out.actor, "worker:reconciler");
        Ok(())
    }
}
