use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use data_model::{Environment, Job, RequestedResources, Run};
use metrics::Timer;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use state_store::requests::ObservedStatus;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Use the in-process simulated engine instead of `endpoint`.
    pub dry_run: bool,
    pub endpoint: Option<String>,
    pub submit_timeout_ms: u64,
    pub status_timeout_ms: u64,
    pub cancel_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            endpoint: None,
            submit_timeout_ms: 10_000,
            status_timeout_ms: 5_000,
            cancel_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.dry_run {
            let endpoint = self
                .endpoint
                .as_ref()
                .ok_or(anyhow::anyhow!("engine.endpoint is required when dry_run is false"))?;
            url::Url::parse(endpoint)
                .map_err(|e| anyhow::anyhow!("invalid engine.endpoint {}: {}", endpoint, e))?;
        }
        if self.submit_timeout_ms == 0 || self.status_timeout_ms == 0 || self.cancel_timeout_ms == 0
        {
            anyhow::bail!("engine timeouts must be positive");
        }
        Ok(())
    }
}

/// Everything the engine needs to start a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSubmission {
    pub run_id: String,
    pub job_id: String,
    pub environment_id: String,
    pub region: String,
    pub engine: String,
    pub eks_namespace: Option<String>,
    pub name: String,
    pub artifact_uri: String,
    pub artifact_digest: String,
    pub entrypoint: String,
    pub args: Vec<String>,
    pub spark_conf: BTreeMap<String, String>,
    pub requested_resources: RequestedResources,
    pub timeout_seconds: u64,
}

impl JobSubmission {
    pub fn new(run: &Run, job: &Job, environment: &Environment) -> Self {
        Self {
            run_id: run.id.to_string(),
            job_id: job.id.to_string(),
            environment_id: environment.id.to_string(),
            region: environment.region.clone(),
            engine: environment.engine.clone(),
            eks_namespace: environment.eks_namespace.clone(),
            name: format!("{}-{}", job.name, run.id),
            artifact_uri: job.artifact_uri.clone(),
            artifact_digest: job.artifact_digest.clone(),
            entrypoint: job.entrypoint.clone(),
            args: job.args.clone(),
            spark_conf: job.spark_conf.clone(),
            requested_resources: run.requested_resources,
            timeout_seconds: run.timeout_seconds,
        }
    }
}

/// Opaque engine-side job run id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineHandle(String);

impl EngineHandle {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineStatus {
    Queued,
    Running,
    Succeeded,
    Failed { reason: Option<String> },
}

impl From<EngineStatus> for ObservedStatus {
    fn from(status: EngineStatus) -> Self {
        match status {
            EngineStatus::Queued => ObservedStatus::Queued,
            EngineStatus::Running => ObservedStatus::Running,
            EngineStatus::Succeeded => ObservedStatus::Succeeded,
            EngineStatus::Failed { reason } => ObservedStatus::Failed { reason },
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("engine rejected request: {0}")]
    Rejected(String),

    #[error("engine call timed out after {0:?}")]
    Timeout(Duration),

    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("unknown engine job run {0}")]
    NotFound(String),
}

#[async_trait]
pub trait JobEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, submission: &JobSubmission) -> Result<EngineHandle, EngineError>;

    async fn status(&self, handle: &EngineHandle) -> Result<EngineStatus, EngineError>;

    async fn cancel(&self, handle: &EngineHandle) -> Result<(), EngineError>;
}

/// Wraps a [`JobEngine`] with the configured per-call timeouts and latency
/// metrics. Processors only talk to the engine through this client.
pub struct EngineClient {
    engine: Arc<dyn JobEngine>,
    config: EngineConfig,
    metrics: metrics::engine::Metrics,
}

impl EngineClient {
    pub fn new(engine: Arc<dyn JobEngine>, config: EngineConfig) -> Self {
        Self {
            engine,
            config,
            metrics: metrics::engine::Metrics::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let engine: Arc<dyn JobEngine> = if config.dry_run {
            info!("using dry-run job engine");
            Arc::new(DryRunJobEngine::default())
        } else {
            let endpoint = config
                .endpoint
                .clone()
                .ok_or(anyhow::anyhow!("engine.endpoint is required"))?;
            info!(endpoint, "using http job engine");
            Arc::new(HttpJobEngine::new(&endpoint)?)
        };
        Ok(Self::new(engine, config.clone()))
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    async fn call<T>(
        &self,
        op: &'static str,
        timeout_ms: u64,
        fut: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        let kvs = &[
            KeyValue::new("op", op),
            KeyValue::new("engine", self.engine.name().to_string()),
        ];
        let _timer = Timer::start_with_labels(&self.metrics.calls, kvs);
        let timeout = Duration::from_millis(timeout_ms);
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(timeout)),
        }
    }

    pub async fn submit(&self, submission: &JobSubmission) -> Result<EngineHandle, EngineError> {
        self.call(
            "submit",
            self.config.submit_timeout_ms,
            self.engine.submit(submission),
        )
        .await
    }

    pub async fn status(&self, handle: &EngineHandle) -> Result<EngineStatus, EngineError> {
        self.call(
            "status",
            self.config.status_timeout_ms,
            self.engine.status(handle),
        )
        .await
    }

    pub async fn cancel(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.call(
            "cancel",
            self.config.cancel_timeout_ms,
            self.engine.cancel(handle),
        )
        .await
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
}

/// JSON client for an engine exposing `POST /job-runs`,
/// `GET /job-runs/{id}` and `POST /job-runs/{id}/cancel`.
pub struct HttpJobEngine {
    base_url: url::Url,
    client: reqwest::Client,
}

impl HttpJobEngine {
    pub fn new(endpoint: &str) -> Result<Self> {
        let mut base_url = url::Url::parse(endpoint)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            base_url,
            client: reqwest::Client::new(),
        })
    }

    fn url(&self, path: &str) -> Result<url::Url, EngineError> {
        self.base_url
            .join(path)
            .map_err(|e| EngineError::Unavailable(format!("invalid engine url: {}", e)))
    }

    async fn classify(response: reqwest::Response, id: Option<&str>) -> Result<reqwest::Response, EngineError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND {
            if let Some(id) = id {
                return Err(EngineError::NotFound(id.to_string()));
            }
        }
        if status.is_client_error() {
            return Err(EngineError::Rejected(format!("{}: {}", status, body)));
        }
        Err(EngineError::Unavailable(format!("{}: {}", status, body)))
    }
}

fn transport_error(err: reqwest::Error) -> EngineError {
    EngineError::Unavailable(err.to_string())
}

#[async_trait]
impl JobEngine for HttpJobEngine {
    fn name(&self) -> &str {
        "http"
    }

    async fn submit(&self, submission: &JobSubmission) -> Result<EngineHandle, EngineError> {
        let response = self
            .client
            .post(self.url("job-runs")?)
            .json(submission)
            .send()
            .await
            .map_err(transport_error)?;
        let response = Self::classify(response, None).await?;
        let body: SubmitResponse = response.json().await.map_err(transport_error)?;
        Ok(EngineHandle::new(body.id))
    }

    async fn status(&self, handle: &EngineHandle) -> Result<EngineStatus, EngineError> {
        let response = self
            .client
            .get(self.url(&format!("job-runs/{}", handle.get()))?)
            .send()
            .await
            .map_err(transport_error)?;
        let response = Self::classify(response, Some(handle.get())).await?;
        response.json().await.map_err(transport_error)
    }

    async fn cancel(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        let response = self
            .client
            .post(self.url(&format!("job-runs/{}/cancel", handle.get()))?)
            .send()
            .await
            .map_err(transport_error)?;
        Self::classify(response, Some(handle.get())).await?;
        Ok(())
    }
}

/// Finished dry-run jobs are forgotten this long after they end.
const DRY_RUN_RETENTION: Duration = Duration::from_secs(15 * 60);

struct DryRunJob {
    submitted_at: Instant,
    cancelled_at: Option<Instant>,
}

impl DryRunJob {
    fn finished_at(&self, engine: &DryRunJobEngine) -> Instant {
        self.cancelled_at
            .unwrap_or(self.submitted_at + engine.queued_for + engine.running_for)
    }
}

/// In-process engine: a run is queued for `queued_for`, running for
/// `running_for`, then succeeds.
pub struct DryRunJobEngine {
    runs: DashMap<String, DryRunJob>,
    queued_for: Duration,
    running_for: Duration,
}

impl Default for DryRunJobEngine {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(30))
    }
}

const HEX_ALPHABET: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

impl DryRunJobEngine {
    pub fn new(queued_for: Duration, running_for: Duration) -> Self {
        Self {
            runs: DashMap::new(),
            queued_for,
            running_for,
        }
    }
}

#[async_trait]
impl JobEngine for DryRunJobEngine {
    fn name(&self) -> &str {
        "dry_run"
    }

    async fn submit(&self, submission: &JobSubmission) -> Result<EngineHandle, EngineError> {
        let id = format!("jr-{}", nanoid::nanoid!(12, &HEX_ALPHABET));
        debug!(run_id = submission.run_id, handle = id, "dry-run submission");
        let now = Instant::now();
        self.runs
            .retain(|_, job| job.finished_at(self) + DRY_RUN_RETENTION > now);
        self.runs.insert(
            id.clone(),
            DryRunJob {
                submitted_at: now,
                cancelled_at: None,
            },
        );
        Ok(EngineHandle::new(id))
    }

    async fn status(&self, handle: &EngineHandle) -> Result<EngineStatus, EngineError> {
        let job = self
            .runs
            .get(handle.get())
            .ok_or_else(|| EngineError::NotFound(handle.get().to_string()))?;
        if job.cancelled_at.is_some() {
            return Ok(EngineStatus::Failed {
                reason: Some("cancelled".to_string()),
            });
        }
        let elapsed = job.submitted_at.elapsed();
        Ok(if elapsed < self.queued_for {
            EngineStatus::Queued
        } else if elapsed < self.queued_for + self.running_for {
            EngineStatus::Running
        } else {
            EngineStatus::Succeeded
        })
    }

    async fn cancel(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        let mut job = self
            .runs
            .get_mut(handle.get())
            .ok_or_else(|| EngineError::NotFound(handle.get().to_string()))?;
        job.cancelled_at.get_or_insert_with(Instant::now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission() -> JobSubmission {
        JobSubmission {
            run_id: "run-1".to_string(),
            job_id: "job-1".to_string(),
            environment_id: "env-1".to_string(),
            region: "us-east-1".to_string(),
            engine: "emr_on_eks".to_string(),
            eks_namespace: None,
            name: "job-run-1".to_string(),
            artifact_uri: "s3://bucket/job.py".to_string(),
            artifact_digest: "sha256:00".to_string(),
            entrypoint: "job.py".to_string(),
            args: vec![],
            spark_conf: BTreeMap::new(),
            requested_resources: RequestedResources::default(),
            timeout_seconds: 60,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_progression() {
        let engine = DryRunJobEngine::new(Duration::from_secs(10), Duration::from_secs(30));
        let handle = engine.submit(&submission()).await.unwrap();
        assert!(handle.get().starts_with("jr-"));
        assert_eq!(engine.status(&handle).await.unwrap(), EngineStatus::Queued);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(engine.status(&handle).await.unwrap(), EngineStatus::Running);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(engine.status(&handle).await.unwrap(), EngineStatus::Succeeded);

        let unknown = EngineHandle::new("jr-missing".to_string());
        assert!(matches!(
            engine.status(&unknown).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_forgets_finished_jobs() {
        let engine = DryRunJobEngine::new(Duration::from_secs(10), Duration::from_secs(30));
        let finished = engine.submit(&submission()).await.unwrap();
        let cancelled = engine.submit(&submission()).await.unwrap();
        engine.cancel(&cancelled).await.unwrap();

        tokio::time::advance(DRY_RUN_RETENTION).await;
        // the cancelled job is past retention, the completed one ended 40s later
        let fresh = engine.submit(&submission()).await.unwrap();
        assert_eq!(engine.runs.len(), 2);
        assert!(matches!(
            engine.status(&cancelled).await,
            Err(EngineError::NotFound(_))
        ));
        assert_eq!(engine.status(&finished).await.unwrap(), EngineStatus::Succeeded);

        tokio::time::advance(Duration::from_secs(60)).await;
        engine.submit(&submission()).await.unwrap();
        assert_eq!(engine.runs.len(), 2);
        assert_eq!(engine.status(&fresh).await.unwrap(), EngineStatus::Succeeded);
        assert!(engine.status(&finished).await.is_err());
    }

    struct SlowEngine;

    #[async_trait]
    impl JobEngine for SlowEngine {
        fn name(&self) -> &str {
            "slow"
        }

        async fn submit(&self, _submission: &JobSubmission) -> Result<EngineHandle, EngineError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(EngineHandle::new("late".to_string()))
        }

        async fn status(&self, _handle: &EngineHandle) -> Result<EngineStatus, EngineError> {
            Ok(EngineStatus::Running)
        }

        async fn cancel(&self, _handle: &EngineHandle) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_applies_submit_timeout() {
        let client = EngineClient::new(
            Arc::new(SlowEngine),
            EngineConfig {
                submit_timeout_ms: 100,
                ..Default::default()
            },
        );
        let result = client.submit(&submission()).await;
        assert!(matches!(result, Err(EngineError::Timeout(_))));
    }

    #[test]
    fn test_status_wire_format() {
        let status: EngineStatus =
            serde_json::from_str(r#"{"state":"failed","reason":"OOM"}"#).unwrap();
        assert_eq!(
            status,
            EngineStatus::Failed {
                reason: Some("OOM".to_string())
            }
        );
        let status: EngineStatus = serde_json::from_str(r#"{"state":"queued"}"#).unwrap();
        assert_eq!(status, EngineStatus::Queued);
    }

    #[test]
    fn test_config_requires_endpoint_without_dry_run() {
        let config = EngineConfig {
            dry_run: false,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = EngineConfig {
            dry_run: false,
            endpoint: Some("http://engine.internal:8080".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
