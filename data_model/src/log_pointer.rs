use serde::{Deserialize, Serialize};

use crate::{Environment, Run};

pub const DEFAULT_LOG_GROUP_PREFIX: &str = "/sparkpilot/runs";

/// Where the logs of a dispatched run live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogPointer {
    pub log_group: String,
    pub log_stream_prefix: String,
}

/// Derives log pointers from run identity. Pure and deterministic: the same
/// inputs always produce the same pointer, so it is safe to call repeatedly.
#[derive(Debug, Clone)]
pub struct LogPointerResolver {
    prefix: String,
}

impl Default for LogPointerResolver {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_GROUP_PREFIX)
    }
}

impl LogPointerResolver {
    pub fn new(prefix: &str) -> Self {
        let trimmed = prefix.trim_end_matches('/');
        Self {
            prefix: trimmed.to_string(),
        }
    }

    /// Returns `None` when the run has no engine handle yet; logs are
    /// unavailable until dispatch succeeds.
    pub fn resolve(
        &self,
        run_id: &str,
        environment_id: &str,
        region: &str,
        emr_job_run_id: Option<&str>,
    ) -> Option<LogPointer> {
        let emr_job_run_id = emr_job_run_id.filter(|id| !id.is_empty())?;
        Some(LogPointer {
            log_group: format!("{}/{}/{}", self.prefix, region, environment_id),
            log_stream_prefix: format!("{}/{}", run_id, emr_job_run_id),
        })
    }

    pub fn resolve_for(&self, run: &Run, environment: &Environment) -> Option<LogPointer> {
        self.resolve(
            run.id.get(),
            environment.id.get(),
            &environment.region,
            run.emr_job_run_id.as_deref(),
        )
    }
}
