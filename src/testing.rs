use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use data_model::RunId;
use processor::{
    engine::{EngineClient, JobEngine},
    logs::{InMemoryLogSource, LogSource, RunLogsReader},
    runner::ProcessorLogic,
    test_engine::FakeJobEngine,
};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{config::ServerConfig, routes::create_routes, service::Service};

pub struct TestService {
    pub service: Service,
    pub engine: Arc<FakeJobEngine>,
    pub log_source: Arc<InMemoryLogSource>,
    /// Tenant owning the environments made by `active_environment`.
    pub tenant_id: String,
    _temp_dir: TempDir,
}

impl TestService {
    pub async fn new() -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let temp_dir = tempfile::tempdir()?;
        let config = ServerConfig {
            state_store_path: temp_dir
                .path()
                .join("state_store")
                .to_string_lossy()
                .to_string(),
            ..Default::default()
        };

        let engine = Arc::new(FakeJobEngine::new());
        let log_source = Arc::new(InMemoryLogSource::default());
        let engine_client = Arc::new(EngineClient::new(
            engine.clone() as Arc<dyn JobEngine>,
            config.engine.clone(),
        ));
        let logs = Arc::new(RunLogsReader::new(
            log_source.clone() as Arc<dyn LogSource>,
            config.logs.clone(),
        ));
        let service = Service::with_components(config, engine_client, logs).await?;

        let mut test_srv = Self {
            service,
            engine,
            log_source,
            tenant_id: String::new(),
            _temp_dir: temp_dir,
        };
        test_srv.tenant_id = test_srv.tenant("test tenant").await?;
        Ok(test_srv)
    }

    pub fn router(&self) -> Router {
        create_routes(self.service.route_state())
    }

    pub async fn dispatch_pass(&self) -> Result<usize> {
        self.service.dispatcher.run_once().await
    }

    pub async fn reconcile_pass(&self) -> Result<usize> {
        self.service.reconciler.run_once().await
    }

    /// Sends one request through the router and returns the status and
    /// decoded body: `Null` when empty, a JSON string when not JSON.
    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Result<(StatusCode, Value)> {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body)?))?,
            None => builder.body(Body::empty())?,
        };
        let response = self.router().oneshot(request).await?;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        Ok((status, value))
    }

    /// Registers a tenant. Returns its id.
    pub async fn tenant(&self, name: &str) -> Result<String> {
        let (status, tenant) = self
            .send(
                Method::POST,
                "/v1/tenants",
                Some(serde_json::json!({ "name": name })),
                &[],
            )
            .await?;
        assert_eq!(status, StatusCode::CREATED, "{tenant}");
        Ok(tenant["id"].as_str().unwrap_or_default().to_string())
    }

    /// Creates an environment and moves it to `active`. Returns its id.
    pub async fn active_environment(&self, max_concurrent_runs: u32, max_vcpu: u32) -> Result<String> {
        let (status, environment) = self
            .send(
                Method::POST,
                "/v1/environments",
                Some(serde_json::json!({
                    "tenant_id": self.tenant_id,
                    "region": "us-east-1",
                    "provisioning_mode": "full",
                    "max_concurrent_runs": max_concurrent_runs,
                    "max_vcpu": max_vcpu,
                })),
                &[],
            )
            .await?;
        assert_eq!(status, StatusCode::CREATED, "{environment}");
        let environment_id = environment["id"].as_str().unwrap_or_default().to_string();
        let (status, body) = self
            .send(
                Method::POST,
                &format!("/internal/environments/{environment_id}/status"),
                Some(serde_json::json!({ "status": "active" })),
                &[],
            )
            .await?;
        assert_eq!(status, StatusCode::OK, "{body}");
        Ok(environment_id)
    }

    /// Registers a job in the environment. Returns its id.
    pub async fn job(&self, environment_id: &str) -> Result<String> {
        let (status, job) = self
            .send(
                Method::POST,
                "/v1/jobs",
                Some(serde_json::json!({
                    "environment_id": environment_id,
                    "name": "nightly-aggregation",
                    "artifact_uri": "s3://artifacts/aggregation.jar",
                    "artifact_digest": "sha256:0f4c",
                    "entrypoint": "com.example.Aggregate",
                    "args": ["--date", "2026-01-01"],
                })),
                &[],
            )
            .await?;
        assert_eq!(status, StatusCode::CREATED, "{job}");
        Ok(job["id"].as_str().unwrap_or_default().to_string())
    }

    /// Submits a run with default resources (5 vCPU). Returns its id.
    pub async fn run(&self, job_id: &str) -> Result<String> {
        let (status, run) = self
            .send(
                Method::POST,
                &format!("/v1/jobs/{job_id}/runs"),
                Some(serde_json::json!({})),
                &[],
            )
            .await?;
        assert_eq!(status, StatusCode::CREATED, "{run}");
        Ok(run["id"].as_str().unwrap_or_default().to_string())
    }

    pub fn stored_run(&self, run_id: &str) -> Result<data_model::Run> {
        self.service
            .state
            .reader()
            .get_run(&RunId::from(run_id))?
            .ok_or_else(|| anyhow::anyhow!("run {run_id} not found"))
    }

    /// Asserts the record-level invariants of every stored run.
    pub fn assert_run_invariants(&self) -> Result<()> {
        let runs = self.service.state.reader().list_runs(&Default::default())?;
        for run in runs {
            if let Err(violation) = run.check_invariants() {
                panic!("{violation}");
            }
        }
        Ok(())
    }
}
