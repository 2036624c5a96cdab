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
        AdmitRunRequest,
        CancelRunRequest,
        DispatchFailedRequest,
        MarkDispatchedRequest,
        RecordDispatchAttemptRequest,
        ReleaseAdmissionRequest,
        RequestPayload,
        StateMachineUpdateRequest,
    },
    SparkPilotState,
};
use tracing::{debug, error, info, warn};

use crate::{
    backoff::BackoffPolicy,
    cancellation::spawn_external_cancel,
    engine::{EngineClient, JobSubmission},
    run_locks::RunLocks,
    runner::ProcessorLogic,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    pub interval_ms: u64,
    pub batch_size: usize,
    pub workers: usize,
    #[serde(flatten)]
    pub backoff: BackoffPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            batch_size: 20,
            workers: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            anyhow::bail!("dispatcher.interval_ms must be positive");
        }
        if self.batch_size == 0 {
            anyhow::bail!("dispatcher.batch_size must be positive");
        }
        if self.workers == 0 {
            anyhow::bail!("dispatcher.workers must be positive");
        }
        self.backoff.validate("dispatcher")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The run left `accepted` before this worker got to it.
    Skipped,
    /// No capacity; the run stays `accepted` and is retried after backoff.
    Denied,
    Dispatched { emr_job_run_id: String },
    Failed { reason: String },
    /// Cancellation was requested while the submission was in flight.
    Cancelled { emr_job_run_id: Option<String> },
}

impl DispatchOutcome {
    /// The run no longer needs the dispatcher.
    fn is_final(&self) -> bool {
        !matches!(self, DispatchOutcome::Denied)
    }
}

pub struct Dispatcher {
    actor: Actor,
    state: Arc<SparkPilotState>,
    engine: Arc<EngineClient>,
    locks: Arc<RunLocks>,
    resolver: LogPointerResolver,
    config: DispatcherConfig,
    metrics: metrics::dispatcher::Metrics,
}

impl Dispatcher {
    pub fn new(
        state: Arc<SparkPilotState>,
        engine: Arc<EngineClient>,
        locks: Arc<RunLocks>,
        resolver: LogPointerResolver,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            actor: Actor::worker("dispatcher"),
            state,
            engine,
            locks,
            resolver,
            config,
            metrics: metrics::dispatcher::Metrics::new(),
        }
    }

    /// Accepted runs whose backoff window has elapsed, oldest first.
    async fn ready_runs(&self, now: u64) -> Result<Vec<Run>> {
        let candidates = self
            .state
            .in_memory_state
            .read()
            .await
            .runs_in_states(&[RunState::Accepted]);
        let reader = self.state.reader();
        let mut ready = Vec::new();
        for run_id in candidates {
            let Some(run) = reader.get_run(&run_id)? else {
                continue;
            };
            if run.state != RunState::Accepted {
                continue;
            }
            if !self.config.backoff.is_ready(
                run.id.get(),
                run.dispatch_attempts,
                run.last_dispatch_attempt_at,
                now,
            ) {
                continue;
            }
            ready.push(run);
            if ready.len() >= self.config.batch_size {
                break;
            }
        }
        Ok(ready)
    }

    async fn write(&self, payload: RequestPayload) -> Result<()> {
        self.state
            .write(StateMachineUpdateRequest::new(payload, self.actor.clone()))
            .await
    }

    /// Takes the run through admission and submission while holding its
    /// lock. A cancel arriving meanwhile only flags the run; the flag is
    /// honored when the submission outcome is recorded.
    #[tracing::instrument(skip(self), fields(run_id = run_id.get()))]
    pub async fn dispatch_run(&self, run_id: &RunId) -> Result<DispatchOutcome> {
        let _guard = self.locks.lock(run_id).await;
        let reader = self.state.reader();
        let Some(run) = reader.get_run(run_id)? else {
            return Ok(DispatchOutcome::Skipped);
        };
        if run.state != RunState::Accepted {
            return Ok(DispatchOutcome::Skipped);
        }
        if run.cancellation_requested {
            // left behind when an earlier outcome could not be recorded
            self.write(RequestPayload::CancelRun(CancelRunRequest { run_id: run.id.clone() }))
                .await?;
            return Ok(DispatchOutcome::Cancelled { emr_job_run_id: None });
        }
        let job = reader
            .get_job(&run.job_id)?
            .ok_or_else(|| Error::not_found("job", &run.job_id))?;
        let environment = reader
            .get_environment(&run.environment_id)?
            .ok_or_else(|| Error::not_found("environment", &run.environment_id))?;

        if let Err(err) = self
            .write(RequestPayload::AdmitRun(AdmitRunRequest { run_id: run.id.clone() }))
            .await
        {
            return match find_error(&err) {
                Some(Error::AdmissionDenied { reason, .. }) => {
                    debug!(
                        environment_id = environment.id.get(),
                        reason, "admission denied"
                    );
                    self.metrics.denied.add(1, &[]);
                    self.write(RequestPayload::RecordDispatchAttempt(
                        RecordDispatchAttemptRequest { run_id: run.id.clone() },
                    ))
                    .await?;
                    Ok(DispatchOutcome::Denied)
                }
                Some(Error::InvalidTransition { .. }) => Ok(DispatchOutcome::Skipped),
                _ => Err(err),
            };
        }
        self.metrics.admitted.add(1, &[]);

        let submission = JobSubmission::new(&run, &job, &environment);
        let reason = match self.engine.submit(&submission).await {
            Ok(handle) => {
                let log_pointer = self.resolver.resolve(
                    run.id.get(),
                    environment.id.get(),
                    &environment.region,
                    Some(handle.get()),
                );
                let recorded = self
                    .write(RequestPayload::MarkDispatched(MarkDispatchedRequest {
                        run_id: run.id.clone(),
                        emr_job_run_id: handle.get().to_string(),
                        log_pointer,
                    }))
                    .await;
                if let Err(err) = recorded {
                    error!(
                        emr_job_run_id = handle.get(),
                        "failed to record dispatched run: {:?}", err
                    );
                    // the engine job is orphaned, stop it before a retry resubmits
                    spawn_external_cancel(
                        self.state.clone(),
                        self.engine.clone(),
                        run.id.clone(),
                        handle,
                        false,
                    );
                    return self
                        .record_failure(&run.id, format!("failed to record dispatch: {}", err))
                        .await;
                }
                let emr_job_run_id = handle.get().to_string();
                let cancelled = reader
                    .get_run(&run.id)?
                    .is_some_and(|run| run.state == RunState::Cancelled);
                if cancelled {
                    info!(emr_job_run_id = %emr_job_run_id, "run cancelled during submission");
                    spawn_external_cancel(
                        self.state.clone(),
                        self.engine.clone(),
                        run.id.clone(),
                        handle,
                        true,
                    );
                    return Ok(DispatchOutcome::Cancelled {
                        emr_job_run_id: Some(emr_job_run_id),
                    });
                }
                self.metrics.dispatched.add(1, &[]);
                info!(
                    environment_id = environment.id.get(),
                    emr_job_run_id = %emr_job_run_id,
                    "run dispatched"
                );
                return Ok(DispatchOutcome::Dispatched { emr_job_run_id });
            }
            Err(engine_err) => Error::DispatchFailure(engine_err.to_string()).to_string(),
        };
        warn!(environment_id = environment.id.get(), reason, "dispatch failed");
        self.record_failure(&run.id, reason).await
    }

    /// Records a failed submission. When even that write fails the attempt
    /// is still counted so the retry backs off.
    async fn record_failure(&self, run_id: &RunId, reason: String) -> Result<DispatchOutcome> {
        let recorded = self
            .write(RequestPayload::DispatchFailed(DispatchFailedRequest {
                run_id: run_id.clone(),
                reason: reason.clone(),
            }))
            .await;
        if let Err(err) = recorded {
            error!(run_id = run_id.get(), "failed to record dispatch failure: {:?}", err);
            if let Err(err) = self
                .write(RequestPayload::RecordDispatchAttempt(
                    RecordDispatchAttemptRequest { run_id: run_id.clone() },
                ))
                .await
            {
                error!(run_id = run_id.get(), "failed to record dispatch attempt: {:?}", err);
            }
            self.release(run_id).await;
            return Err(err);
        }
        let cancelled = self
            .state
            .reader()
            .get_run(run_id)?
            .is_some_and(|run| run.state == RunState::Cancelled);
        if cancelled {
            return Ok(DispatchOutcome::Cancelled { emr_job_run_id: None });
        }
        self.metrics.failed.add(1, &[]);
        Ok(DispatchOutcome::Failed { reason })
    }

    async fn release(&self, run_id: &RunId) {
        if let Err(err) = self
            .write(RequestPayload::ReleaseAdmission(ReleaseAdmissionRequest {
                run_id: run_id.clone(),
            }))
            .await
        {
            error!(run_id = run_id.get(), "failed to release admission: {:?}", err);
        }
    }
}

#[async_trait]
impl ProcessorLogic for Dispatcher {
    fn name(&self) -> &'static str {
        "dispatcher"
    }

    #[tracing::instrument(skip(self))]
    async fn run_once(&self) -> Result<usize> {
        let _timer = Timer::start(&self.metrics.pass_duration);
        let runs = self.ready_runs(get_epoch_time_in_ms()).await?;
        if runs.is_empty() {
            return Ok(0);
        }
        debug!(runs = runs.len(), "dispatching runs");
        let outcomes = futures::stream::iter(runs)
            .map(|run| async move {
                match self.dispatch_run(&run.id).await {
                    Ok(outcome) => {
                        if outcome.is_final() {
                            self.locks.forget(&run.id);
                        }
                        Some(outcome)
                    }
                    Err(err) => {
                        error!(run_id = run.id.get(), "error dispatching run: {:?}", err);
                        None
                    }
                }
            })
            .buffer_unordered(self.config.workers)
            .collect::<Vec<_>>()
            .await;
        let dispatched = outcomes
            .iter()
            .filter(|outcome| {
                matches!(
                    outcome,
                    Some(DispatchOutcome::Dispatched { .. } |
                        DispatchOutcome::Failed { .. } |
                        DispatchOutcome::Cancelled { .. })
                )
            })
            .count();
        if outcomes.iter().any(Option::is_none) {
            return Err(anyhow!("some runs could not be dispatched"));
        }
        Ok(dispatched)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use data_model::EnvironmentStatus;
    use state_store::test_state_store::TestStateStore;

    use super::*;
    use crate::{engine::EngineConfig, test_engine::FakeJobEngine};

    fn dispatcher(
        store: &TestStateStore,
        engine: Arc<FakeJobEngine>,
        engine_config: EngineConfig,
        config: DispatcherConfig,
    ) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            store.state.clone(),
            Arc::new(EngineClient::new(engine, engine_config)),
            Arc::new(RunLocks::new()),
            LogPointerResolver::default(),
            config,
        ))
    }

    #[tokio::test]
    async fn test_dispatch_records_handle_and_pointers() -> Result<()> {
        let store = TestStateStore::new().await?;
        let env = store.with_environment(EnvironmentStatus::Active, 2, 16).await?;
        let job = store.with_job(&env).await?;
        let run = store.with_run(&job).await?;
        let engine = Arc::new(FakeJobEngine::new());
        let dispatcher = dispatcher(
            &store,
            engine.clone(),
            EngineConfig::default(),
            DispatcherConfig::default(),
        );

        assert_eq!(dispatcher.run_once().await?, 1);
        let run = store.state.reader().get_run(&run.id)?.unwrap();
        assert_eq!(run.state, RunState::Dispatching);
        assert_eq!(run.emr_job_run_id.as_deref(), Some("emr-1"));
        assert_eq!(
            run.log_stream_prefix,
            Some(format!("{}/emr-1", run.id))
        );
        assert!(run.check_invariants().is_ok());
        let submission = engine.submission("emr-1").unwrap();
        assert_eq!(submission.run_id, run.id.to_string());
        assert_eq!(submission.timeout_seconds, run.timeout_seconds);

        // nothing left to do
        assert_eq!(dispatcher.run_once().await?, 0);
        assert_eq!(engine.submission_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_submission_fails_run() -> Result<()> {
        let store = TestStateStore::new().await?;
        let env = store.with_environment(EnvironmentStatus::Active, 1, 16).await?;
        let job = store.with_job(&env).await?;
        let run = store.with_run(&job).await?;
        let engine = Arc::new(FakeJobEngine::new());
        engine.reject_submissions(true);
        let dispatcher = dispatcher(
            &store,
            engine.clone(),
            EngineConfig::default(),
            DispatcherConfig::default(),
        );

        let outcome = dispatcher.dispatch_run(&run.id).await?;
        assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
        let run = store.state.reader().get_run(&run.id)?.unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert!(run.emr_job_run_id.is_none());
        assert!(run
            .error_message
            .as_deref()
            .unwrap()
            .contains("submission rejected"));
        assert!(run.check_invariants().is_ok());
        assert_eq!(
            store.state.in_memory_state.read().await.committed(&env.id),
            Default::default()
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_submit_timeout_fails_run() -> Result<()> {
        let store = TestStateStore::new().await?;
        let env = store.with_environment(EnvironmentStatus::Active, 1, 16).await?;
        let job = store.with_job(&env).await?;
        let run = store.with_run(&job).await?;
        let engine = Arc::new(FakeJobEngine::new());
        engine.set_submit_delay(Duration::from_millis(500));
        let dispatcher = dispatcher(
            &store,
            engine,
            EngineConfig {
                submit_timeout_ms: 20,
                ..Default::default()
            },
            DispatcherConfig::default(),
        );

        let outcome = dispatcher.dispatch_run(&run.id).await?;
        let reason = match outcome {
            DispatchOutcome::Failed { reason } => reason,
            other => panic!("expected a failed dispatch, got {:?}", other),
        };
        assert!(reason.contains("timed out"));
        let run = store.state.reader().get_run(&run.id)?.unwrap();
        assert_eq!(run.state, RunState::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn test_denied_run_waits_for_backoff() -> Result<()> {
        let store = TestStateStore::new().await?;
        let env = store
            .with_environment(EnvironmentStatus::Provisioning, 1, 16)
            .await?;
        let job = store.with_job(&env).await?;
        let run = store.with_run(&job).await?;
        let engine = Arc::new(FakeJobEngine::new());
        let dispatcher = dispatcher(
            &store,
            engine.clone(),
            EngineConfig::default(),
            DispatcherConfig {
                backoff: BackoffPolicy {
                    initial_backoff_ms: 60_000,
                    max_backoff_ms: 60_000,
                    jitter_ms: 0,
                },
                ..Default::default()
            },
        );

        dispatcher.run_once().await?;
        dispatcher.run_once().await?;
        let stored = store.state.reader().get_run(&run.id)?.unwrap();
        assert_eq!(stored.state, RunState::Accepted);
        assert_eq!(stored.dispatch_attempts, 1);
        assert!(stored.last_dispatch_attempt_at.is_some());
        assert!(stored.check_invariants().is_ok());
        assert_eq!(engine.submission_count(), 0);

        // once active the run is admitted regardless of backoff on a direct dispatch
        store
            .set_environment_status(&env, EnvironmentStatus::Active)
            .await?;
        let outcome = dispatcher.dispatch_run(&run.id).await?;
        assert!(matches!(outcome, DispatchOutcome::Dispatched { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_parallel_workers_admit_exactly_one() -> Result<()> {
        let store = TestStateStore::new().await?;
        let env = store.with_environment(EnvironmentStatus::Active, 1, 64).await?;
        let job = store.with_job(&env).await?;
        let mut runs = Vec::new();
        for _ in 0..8 {
            runs.push(store.with_run(&job).await?);
        }
        let engine = Arc::new(FakeJobEngine::new());
        engine.set_submit_delay(Duration::from_millis(50));
        let dispatcher = dispatcher(
            &store,
            engine.clone(),
            EngineConfig::default(),
            DispatcherConfig {
                workers: 8,
                ..Default::default()
            },
        );

        let tasks: Vec<_> = runs
            .iter()
            .map(|run| {
                let dispatcher = dispatcher.clone();
                let run_id = run.id.clone();
                tokio::spawn(async move { dispatcher.dispatch_run(&run_id).await })
            })
            .collect();
        let mut dispatched = 0;
        let mut denied = 0;
        for task in tasks {
            match task.await?? {
                DispatchOutcome::Dispatched { .. } => dispatched += 1,
                DispatchOutcome::Denied => denied += 1,
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(dispatched, 1);
        assert_eq!(denied, 7);
        assert_eq!(engine.submission_count(), 1);

        let committed = store.state.in_memory_state.read().await.committed(&env.id);
        assert_eq!(committed.runs, 1);
        for run in &runs {
            let run = store.state.reader().get_run(&run.id)?.unwrap();
            assert!(run.check_invariants().is_ok());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_unrecorded_dispatch_fails_run() -> Result<()> {
        let store = TestStateStore::new().await?;
        let env = store.with_environment(EnvironmentStatus::Active, 1, 16).await?;
        let job = store.with_job(&env).await?;
        let run = store.with_run(&job).await?;
        let engine = Arc::new(FakeJobEngine::new());
        engine.return_blank_handles(true);
        let dispatcher = dispatcher(
            &store,
            engine.clone(),
            EngineConfig::default(),
            DispatcherConfig::default(),
        );

        assert_eq!(dispatcher.run_once().await?, 1);
        let stored = store.state.reader().get_run(&run.id)?.unwrap();
        assert_eq!(stored.state, RunState::Failed);
        assert_eq!(stored.dispatch_attempts, 1);
        assert!(stored
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("failed to record dispatch"));
        assert!(stored.check_invariants().is_ok());
        assert_eq!(
            store.state.in_memory_state.read().await.committed(&env.id),
            Default::default()
        );
        assert!(dispatcher.locks.is_empty());

        // not resubmitted
        assert_eq!(dispatcher.run_once().await?, 0);
        assert_eq!(engine.submission_count(), 1);
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.cancel_count("") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        Ok(())
    }
}
