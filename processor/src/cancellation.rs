use std::sync::Arc;

use anyhow::Result;
use data_model::{Actor, Error, Run, RunId, RunState};
use state_store::{
    requests::{
        CancelRunRequest,
        RecordCancelAdvisoryRequest,
        RequestPayload,
        StateMachineUpdateRequest,
    },
    SparkPilotState,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::{EngineClient, EngineHandle};

pub struct CancelOutcome {
    pub run: Run,
    /// Best-effort engine cancel, present when the run had a handle.
    pub external_cancel: Option<JoinHandle<()>>,
}

/// Cancels the engine job in the background. A failure is appended to the
/// run's `error_message` when `record_advisory` is set.
pub fn spawn_external_cancel(
    state: Arc<SparkPilotState>,
    engine: Arc<EngineClient>,
    run_id: RunId,
    handle: EngineHandle,
    record_advisory: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Err(err) = engine.cancel(&handle).await else {
            info!(
                run_id = run_id.get(),
                emr_job_run_id = handle.get(),
                "external job cancelled"
            );
            return;
        };
        warn!(
            run_id = run_id.get(),
            emr_job_run_id = handle.get(),
            "external cancel failed: {}", err
        );
        if !record_advisory {
            return;
        }
        let advisory = state
            .write(
                RequestPayload::RecordCancelAdvisory(RecordCancelAdvisoryRequest {
                    run_id: run_id.clone(),
                    message: format!("external cancel failed: {}", err),
                })
                .into(),
            )
            .await;
        if let Err(err) = advisory {
            warn!(run_id = run_id.get(), "failed to record cancel advisory: {:?}", err);
        }
    })
}

pub struct RunCanceller {
    state: Arc<SparkPilotState>,
    engine: Arc<EngineClient>,
}

impl RunCanceller {
    pub fn new(state: Arc<SparkPilotState>, engine: Arc<EngineClient>) -> Self {
        Self { state, engine }
    }

    /// Records the cancellation and returns once it is committed. It only
    /// goes through the serialized store write, never a run lock, so it does
    /// not wait on an engine call in progress.
    ///
    /// A run whose submission is in flight comes back still `accepted` with
    /// `cancellation_requested` set; the dispatcher finishes the cancel when
    /// it records the submission outcome. Otherwise the run is `cancelled`
    /// and its engine job, if any, is cancelled in a spawned task.
    #[tracing::instrument(skip(self, actor), fields(run_id = run_id.get(), actor = actor.name))]
    pub async fn cancel(&self, run_id: &RunId, actor: Actor) -> Result<CancelOutcome> {
        self.state
            .write(StateMachineUpdateRequest::new(
                RequestPayload::CancelRun(CancelRunRequest { run_id: run_id.clone() }),
                actor,
            ))
            .await?;
        let run = self
            .state
            .reader()
            .get_run(run_id)?
            .ok_or_else(|| Error::not_found("run", run_id))?;
        if run.state != RunState::Cancelled {
            info!("cancellation requested during submission");
            return Ok(CancelOutcome {
                run,
                external_cancel: None,
            });
        }
        info!("run cancelled");

        let external_cancel = run.emr_job_run_id.clone().map(|handle| {
            spawn_external_cancel(
                self.state.clone(),
                self.engine.clone(),
                run.id.clone(),
                EngineHandle::new(handle),
                true,
            )
        });
        Ok(CancelOutcome {
            run,
            external_cancel,
        })
    }
}
