use std::sync::Arc;

use anyhow::{anyhow, Result};
use data_model::{
    test_objects::tests::{mock_environment_with_capacity, mock_job, mock_run, mock_tenant},
    Environment,
    EnvironmentStatus,
    Job,
    LogPointerResolver,
    Run,
};
use tempfile::TempDir;

use crate::{
    requests::{
        AdmitRunRequest,
        CreateEnvironmentRequest,
        CreateJobRequest,
        CreateRunRequest,
        CreateTenantRequest,
        MarkDispatchedRequest,
        RequestPayload,
        SetEnvironmentStatusRequest,
    },
    SparkPilotState,
};

pub struct TestStateStore {
    pub state: Arc<SparkPilotState>,
    // the store lives as long as the directory
    _temp_dir: TempDir,
}

impl TestStateStore {
    /// Opens an empty store holding only the mock tenant.
    pub async fn new() -> Result<TestStateStore> {
        let temp_dir = tempfile::tempdir()?;
        let state = SparkPilotState::new(temp_dir.path().join("state")).await?;
        state
            .write(
                RequestPayload::CreateTenant(CreateTenantRequest {
                    tenant: mock_tenant(),
                })
                .into(),
            )
            .await?;
        Ok(TestStateStore {
            state,
            _temp_dir: temp_dir,
        })
    }

    pub async fn with_environment(
        &self,
        status: EnvironmentStatus,
        max_concurrent_runs: u32,
        max_vcpu: u32,
    ) -> Result<Environment> {
        let environment = mock_environment_with_capacity(status, max_concurrent_runs, max_vcpu);
        self.state
            .write(
                RequestPayload::CreateEnvironment(CreateEnvironmentRequest {
                    environment: environment.clone(),
                })
                .into(),
            )
            .await?;
        Ok(environment)
    }

    pub async fn set_environment_status(
        &self,
        environment: &Environment,
        status: EnvironmentStatus,
    ) -> Result<()> {
        self.state
            .write(
                RequestPayload::SetEnvironmentStatus(SetEnvironmentStatusRequest {
                    environment_id: environment.id.clone(),
                    status,
                })
                .into(),
            )
            .await
    }

    pub async fn with_job(&self, environment: &Environment) -> Result<Job> {
        let job = mock_job(environment);
        self.state
            .write(RequestPayload::CreateJob(CreateJobRequest { job: job.clone() }).into())
            .await?;
        Ok(job)
    }

    pub async fn with_run(&self, job: &Job) -> Result<Run> {
        let environment = self
            .state
            .reader()
            .get_environment(&job.environment_id)?
            .ok_or(anyhow!("environment {} not found", job.environment_id))?;
        let run = mock_run(job, &environment);
        self.state
            .write(
                RequestPayload::CreateRun(CreateRunRequest {
                    run: run.clone(),
                    idempotency: None,
                })
                .into(),
            )
            .await?;
        Ok(run)
    }

    pub async fn admit(&self, run: &Run) -> Result<()> {
        self.state
            .write(
                RequestPayload::AdmitRun(AdmitRunRequest {
                    run_id: run.id.clone(),
                })
                .into(),
            )
            .await
    }

    pub async fn mark_dispatched(
        &self,
        run: &Run,
        environment: &Environment,
        emr_job_run_id: &str,
    ) -> Result<()> {
        let log_pointer = LogPointerResolver::default().resolve(
            run.id.get(),
            environment.id.get(),
            &environment.region,
            Some(emr_job_run_id),
        );
        self.state
            .write(
                RequestPayload::MarkDispatched(MarkDispatchedRequest {
                    run_id: run.id.clone(),
                    emr_job_run_id: emr_job_run_id.to_string(),
                    log_pointer,
                })
                .into(),
            )
            .await
    }
}
