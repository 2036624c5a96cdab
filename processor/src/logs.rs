use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use data_model::{Error, LogPointer, LogPointerResolver, Run, RunId, DEFAULT_LOG_GROUP_PREFIX};
use serde::{Deserialize, Serialize};
use state_store::scanner::StateReader;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogsConfig {
    pub log_group_prefix: String,
    /// Log service base url. Without it lines are synthesized in dry-run
    /// engines and empty otherwise.
    pub endpoint: Option<String>,
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            log_group_prefix: DEFAULT_LOG_GROUP_PREFIX.to_string(),
            endpoint: None,
            default_limit: 200,
            max_limit: 2000,
        }
    }
}

impl LogsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.log_group_prefix.trim_end_matches('/').is_empty() {
            anyhow::bail!("logs.log_group_prefix must not be empty");
        }
        if self.default_limit == 0 || self.default_limit > self.max_limit {
            anyhow::bail!("logs.default_limit must be between 1 and logs.max_limit");
        }
        if let Some(endpoint) = &self.endpoint {
            url::Url::parse(endpoint)
                .map_err(|e| anyhow::anyhow!("invalid logs.endpoint {}: {}", endpoint, e))?;
        }
        Ok(())
    }

    pub fn resolver(&self) -> LogPointerResolver {
        LogPointerResolver::new(&self.log_group_prefix)
    }
}

#[async_trait]
pub trait LogSource: Send + Sync {
    /// Up to `limit` lines for the pointer. An unknown group or stream is an
    /// empty result, not an error.
    async fn fetch(&self, pointer: &LogPointer, region: &str, limit: usize) -> Result<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct LogEvent {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct LogEventsResponse {
    #[serde(default)]
    events: Vec<LogEvent>,
}

/// Reads `GET {endpoint}/log-events` from a log service.
pub struct HttpLogSource {
    base_url: url::Url,
    client: reqwest::Client,
}

impl HttpLogSource {
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
}

#[async_trait]
impl LogSource for HttpLogSource {
    async fn fetch(&self, pointer: &LogPointer, region: &str, limit: usize) -> Result<Vec<String>> {
        let url = self.base_url.join("log-events")?;
        let response = self
            .client
            .get(url)
            .query(&[
                ("log_group", pointer.log_group.as_str()),
                ("log_stream_prefix", pointer.log_stream_prefix.as_str()),
                ("region", region),
                ("limit", &limit.to_string()),
            ])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(vec![]);
        }
        if !response.status().is_success() {
            let status = response.status();
            warn!(
                log_group = pointer.log_group,
                log_stream_prefix = pointer.log_stream_prefix,
                %status,
                "log fetch failed"
            );
            anyhow::bail!("log service returned {}", status);
        }
        let body: LogEventsResponse = response.json().await?;
        Ok(body
            .events
            .into_iter()
            .take(limit)
            .map(|event| event.message)
            .collect())
    }
}

/// Serves lines from memory. In dry-run mode every pointer has three
/// synthetic lines.
#[derive(Default)]
pub struct InMemoryLogSource {
    lines: dashmap::DashMap<LogPointer, Vec<String>>,
    synthesize: bool,
}

impl InMemoryLogSource {
    pub fn dry_run() -> Self {
        Self {
            lines: Default::default(),
            synthesize: true,
        }
    }

    pub fn insert(&self, pointer: LogPointer, lines: Vec<String>) {
        self.lines.insert(pointer, lines);
    }
}

#[async_trait]
impl LogSource for InMemoryLogSource {
    async fn fetch(&self, pointer: &LogPointer, _region: &str, limit: usize) -> Result<Vec<String>> {
        if let Some(lines) = self.lines.get(pointer) {
            return Ok(lines.iter().take(limit).cloned().collect());
        }
        if !self.synthesize {
            return Ok(vec![]);
        }
        let hint = &pointer.log_stream_prefix;
        Ok([
            format!("[{hint}] Spark application started"),
            format!("[{hint}] Executors requested"),
            format!("[{hint}] Job completed successfully"),
        ]
        .into_iter()
        .take(limit)
        .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogsStatus {
    Available,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunLogs {
    pub run_id: RunId,
    pub status: LogsStatus,
    pub log_group: String,
    pub log_stream_prefix: String,
    pub lines: Vec<String>,
}

pub struct RunLogsReader {
    source: Arc<dyn LogSource>,
    config: LogsConfig,
}

impl RunLogsReader {
    pub fn new(source: Arc<dyn LogSource>, config: LogsConfig) -> Self {
        Self { source, config }
    }

    pub fn from_config(config: &LogsConfig, dry_run: bool) -> Result<Self> {
        let source: Arc<dyn LogSource> = match &config.endpoint {
            Some(endpoint) => Arc::new(HttpLogSource::new(endpoint)?),
            None if dry_run => Arc::new(InMemoryLogSource::dry_run()),
            None => Arc::new(InMemoryLogSource::default()),
        };
        Ok(Self::new(source, config.clone()))
    }

    fn effective_limit(&self, limit: Option<usize>) -> Result<usize, Error> {
        match limit {
            None => Ok(self.config.default_limit),
            Some(limit) if limit >= 1 && limit <= self.config.max_limit => Ok(limit),
            Some(limit) => Err(Error::invalid_config(format!(
                "limit {} must be between 1 and {}",
                limit, self.config.max_limit
            ))),
        }
    }

    /// Lines for a run. Runs without log pointers fail with
    /// `LogsUnavailable`; pointers with no lines yield `LogsStatus::Empty`.
    pub async fn fetch(
        &self,
        reader: &StateReader,
        run_id: &RunId,
        limit: Option<usize>,
    ) -> Result<RunLogs> {
        let limit = self.effective_limit(limit)?;
        let run = reader
            .get_run(run_id)?
            .ok_or_else(|| Error::not_found("run", run_id))?;
        let pointer = self.pointer_for(reader, &run)?;
        let region = reader
            .get_environment(&run.environment_id)?
            .map(|environment| environment.region)
            .unwrap_or_default();
        let lines = self.source.fetch(&pointer, &region, limit).await?;
        debug!(run_id = run.id.get(), lines = lines.len(), "fetched run logs");
        Ok(RunLogs {
            run_id: run.id,
            status: if lines.is_empty() {
                LogsStatus::Empty
            } else {
                LogsStatus::Available
            },
            log_group: pointer.log_group,
            log_stream_prefix: pointer.log_stream_prefix,
            lines,
        })
    }

    fn pointer_for(&self, reader: &StateReader, run: &Run) -> Result<LogPointer> {
        if let Some(pointer) = run.log_pointer() {
            return Ok(pointer);
        }
        // dispatched before pointers were recorded
        if run.emr_job_run_id.is_some() {
            if let Some(environment) = reader.get_environment(&run.environment_id)? {
                if let Some(pointer) = self.config.resolver().resolve_for(run, &environment) {
                    return Ok(pointer);
                }
            }
        }
        Err(Error::LogsUnavailable(format!("run {} has no log pointers", run.id)).into())
    }
}
