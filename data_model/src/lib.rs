pub mod audit;
pub mod error;
pub mod log_pointer;
pub mod test_objects;

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
};

use anyhow::Result;
pub use audit::{Actor, AuditEvent, ANONYMOUS_ACTOR};
use derive_builder::Builder;
pub use error::{find_error, Error};
pub use log_pointer::{LogPointer, LogPointerResolver, DEFAULT_LOG_GROUP_PREFIX};
use serde::{Deserialize, Serialize};
use sparkpilot_utils::get_epoch_time_in_ms;
use strum::{AsRefStr, EnumIter, EnumString};

pub const DEFAULT_ENGINE: &str = "emr_on_eks";
pub const DEFAULT_MAX_CONCURRENT_RUNS: u32 = 10;
pub const DEFAULT_MAX_VCPU: u32 = 256;
pub const DEFAULT_MAX_RUN_SECONDS: u64 = 7200;

const VCPU_SECOND_PRICE_MICROS: u64 = 35;
const MEMORY_GB_SECOND_PRICE_MICROS: u64 = 4;

const TENANT_NAME_MIN_LEN: usize = 3;
const TENANT_NAME_MAX_LEN: usize = 255;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: String) -> Self {
                Self(id)
            }

            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn get(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_type!(EnvironmentId);
id_type!(RunId);
id_type!(JobId);

fn required<T: Clone>(field: &Option<T>, name: &str) -> Result<T, Error> {
    field
        .clone()
        .ok_or_else(|| Error::invalid_config(format!("{name} is required")))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Tenant {
    pub fn new(name: &str, now: u64) -> Result<Tenant, Error> {
        let name = name.trim();
        if name.len() < TENANT_NAME_MIN_LEN || name.len() > TENANT_NAME_MAX_LEN {
            return Err(Error::invalid_config(format!(
                "tenant name must be between {TENANT_NAME_MIN_LEN} and {TENANT_NAME_MAX_LEN} characters"
            )));
        }
        Ok(Tenant {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn key(&self) -> String {
        self.id.clone()
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProvisioningMode {
    /// The control plane owns the whole cluster.
    Full,
    /// Bring-your-own-cluster: runs land in a namespace of a tenant cluster.
    ByocLite,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EnvironmentStatus {
    Provisioning,
    Active,
    Degraded,
    Deprovisioning,
    Terminated,
}

impl EnvironmentStatus {
    pub fn can_transition_to(&self, target: EnvironmentStatus) -> bool {
        use EnvironmentStatus::*;
        matches!(
            (self, target),
            (Provisioning, Active) |
                (Provisioning, Deprovisioning) |
                (Active, Degraded) |
                (Active, Deprovisioning) |
                (Degraded, Active) |
                (Degraded, Deprovisioning) |
                (Deprovisioning, Terminated)
        )
    }

    /// Whether new runs may be created against the environment. Admission
    /// additionally requires `Active`.
    pub fn accepts_runs(&self) -> bool {
        !matches!(
            self,
            EnvironmentStatus::Deprovisioning | EnvironmentStatus::Terminated
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentCapacity {
    pub max_concurrent_runs: u32,
    pub max_vcpu: u32,
}

impl Default for EnvironmentCapacity {
    fn default() -> Self {
        Self {
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            max_vcpu: DEFAULT_MAX_VCPU,
        }
    }
}

impl EnvironmentCapacity {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_concurrent_runs == 0 {
            return Err(Error::invalid_config("max_concurrent_runs must be positive"));
        }
        if self.max_vcpu == 0 {
            return Err(Error::invalid_config("max_vcpu must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
#[builder(build_fn(skip))]
pub struct Environment {
    pub id: EnvironmentId,
    pub tenant_id: String,
    pub region: String,
    pub engine: String,
    pub provisioning_mode: ProvisioningMode,
    pub eks_namespace: Option<String>,
    pub warm_pool_enabled: bool,
    pub max_concurrent_runs: u32,
    pub max_vcpu: u32,
    pub max_run_seconds: u64,
    pub status: EnvironmentStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Environment {
    pub fn key(&self) -> String {
        self.id.get().to_string()
    }

    /// Key in the tenant index. Zero padded creation time keeps a prefix
    /// scan in creation order.
    pub fn tenant_index_key(&self) -> String {
        format!(
            "{}{:020}|{}",
            Self::tenant_index_prefix(&self.tenant_id),
            self.created_at,
            self.id
        )
    }

    pub fn tenant_index_prefix(tenant_id: &str) -> String {
        format!("{}|", tenant_id)
    }

    pub fn capacity(&self) -> EnvironmentCapacity {
        EnvironmentCapacity {
            max_concurrent_runs: self.max_concurrent_runs,
            max_vcpu: self.max_vcpu,
        }
    }

    /// Checks the configuration invariants shared by construction and the
    /// property tests.
    pub fn validate_config(
        mode: ProvisioningMode,
        eks_namespace: Option<&str>,
        capacity: &EnvironmentCapacity,
        max_run_seconds: u64,
    ) -> Result<(), Error> {
        let has_namespace = eks_namespace.is_some_and(|ns| !ns.trim().is_empty());
        match (mode, has_namespace) {
            (ProvisioningMode::ByocLite, false) => {
                return Err(Error::invalid_config(
                    "eks_namespace is required for byoc_lite environments",
                ));
            }
            (ProvisioningMode::Full, true) => {
                return Err(Error::invalid_config(
                    "eks_namespace is only allowed for byoc_lite environments",
                ));
            }
            _ => {}
        }
        capacity.validate()?;
        if max_run_seconds == 0 {
            return Err(Error::invalid_config("max_run_seconds must be positive"));
        }
        Ok(())
    }

    pub fn set_status(&mut self, status: EnvironmentStatus, now: u64) -> Result<(), Error> {
        if self.status == status {
            return Ok(());
        }
        if !self.status.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                entity: "environment",
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        self.status = status;
        self.updated_at = now;
        Ok(())
    }
}

impl EnvironmentBuilder {
    pub fn build(&mut self) -> Result<Environment> {
        let tenant_id = required(&self.tenant_id, "tenant_id")?;
        if tenant_id.trim().is_empty() || tenant_id.contains('|') {
            return Err(Error::invalid_config("tenant_id must be non-empty and must not contain '|'").into());
        }
        let region = required(&self.region, "region")?;
        if region.trim().is_empty() {
            return Err(Error::invalid_config("region must be non-empty").into());
        }
        let provisioning_mode = required(&self.provisioning_mode, "provisioning_mode")?;
        let eks_namespace = self
            .eks_namespace
            .clone()
            .flatten()
            .map(|ns| ns.trim().to_string())
            .filter(|ns| !ns.is_empty());
        let capacity = EnvironmentCapacity {
            max_concurrent_runs: self
                .max_concurrent_runs
                .unwrap_or(DEFAULT_MAX_CONCURRENT_RUNS),
            max_vcpu: self.max_vcpu.unwrap_or(DEFAULT_MAX_VCPU),
        };
        let max_run_seconds = self.max_run_seconds.unwrap_or(DEFAULT_MAX_RUN_SECONDS);
        Environment::validate_config(
            provisioning_mode,
            eks_namespace.as_deref(),
            &capacity,
            max_run_seconds,
        )?;

        let created_at = self.created_at.unwrap_or_else(get_epoch_time_in_ms);
        Ok(Environment {
            id: self.id.clone().unwrap_or_else(EnvironmentId::generate),
            tenant_id,
            region,
            engine: self
                .engine
                .clone()
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_ENGINE.to_string()),
            provisioning_mode,
            eks_namespace,
            warm_pool_enabled: self.warm_pool_enabled.unwrap_or(false),
            max_concurrent_runs: capacity.max_concurrent_runs,
            max_vcpu: capacity.max_vcpu,
            max_run_seconds,
            status: self.status.unwrap_or(EnvironmentStatus::Provisioning),
            created_at,
            updated_at: created_at,
        })
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunState {
    Accepted,
    Dispatching,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Cancelled
        )
    }

    /// States that hold a concurrency slot on the environment.
    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Dispatching | RunState::Running)
    }

    pub fn allowed_targets(&self) -> &'static [RunState] {
        use RunState::*;
        match self {
            Accepted => &[Dispatching, Failed, Cancelled],
            Dispatching => &[Running, Failed, Cancelled],
            Running => &[Succeeded, Failed, Cancelled],
            Succeeded | Failed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, target: RunState) -> bool {
        self.allowed_targets().contains(&target)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RequestedResources {
    pub driver_vcpu: u32,
    pub driver_memory_gb: u32,
    pub executor_vcpu: u32,
    pub executor_memory_gb: u32,
    pub executor_instances: u32,
}

impl Default for RequestedResources {
    fn default() -> Self {
        Self {
            driver_vcpu: 1,
            driver_memory_gb: 4,
            executor_vcpu: 2,
            executor_memory_gb: 8,
            executor_instances: 2,
        }
    }
}

impl RequestedResources {
    pub fn total_vcpu(&self) -> u32 {
        self.driver_vcpu
            .saturating_add(self.executor_vcpu.saturating_mul(self.executor_instances))
    }

    pub fn total_memory_gb(&self) -> u32 {
        self.driver_memory_gb.saturating_add(
            self.executor_memory_gb
                .saturating_mul(self.executor_instances),
        )
    }

    pub fn validate(&self) -> Result<(), Error> {
        let fields = [
            ("driver_vcpu", self.driver_vcpu),
            ("driver_memory_gb", self.driver_memory_gb),
            ("executor_vcpu", self.executor_vcpu),
            ("executor_memory_gb", self.executor_memory_gb),
            ("executor_instances", self.executor_instances),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(Error::invalid_config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
#[builder(build_fn(skip))]
pub struct Job {
    pub id: JobId,
    pub environment_id: EnvironmentId,
    pub name: String,
    pub artifact_uri: String,
    pub artifact_digest: String,
    pub entrypoint: String,
    pub args: Vec<String>,
    pub spark_conf: BTreeMap<String, String>,
    pub timeout_seconds: u64,
    pub created_at: u64,
}

impl Job {
    pub fn key(&self) -> String {
        self.id.get().to_string()
    }
}

impl JobBuilder {
    pub fn build(&mut self) -> Result<Job> {
        let environment_id = required(&self.environment_id, "environment_id")?;
        let non_blank = |field: &Option<String>, name: &str| -> Result<String, Error> {
            let value = required(field, name)?;
            if value.trim().is_empty() {
                return Err(Error::invalid_config(format!("{name} is required")));
            }
            Ok(value)
        };
        let name = non_blank(&self.name, "name")?;
        let artifact_uri = non_blank(&self.artifact_uri, "artifact_uri")?;
        let artifact_digest = non_blank(&self.artifact_digest, "artifact_digest")?;
        let entrypoint = non_blank(&self.entrypoint, "entrypoint")?;
        let timeout_seconds = self.timeout_seconds.unwrap_or(DEFAULT_MAX_RUN_SECONDS);
        if timeout_seconds == 0 {
            return Err(Error::invalid_config("timeout_seconds must be positive").into());
        }
        Ok(Job {
            id: self.id.clone().unwrap_or_else(JobId::generate),
            environment_id,
            name,
            artifact_uri,
            artifact_digest,
            entrypoint,
            args: self.args.clone().unwrap_or_default(),
            spark_conf: self.spark_conf.clone().unwrap_or_default(),
            timeout_seconds,
            created_at: self.created_at.unwrap_or_else(get_epoch_time_in_ms),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: RunId,
    pub job_id: JobId,
    pub environment_id: EnvironmentId,
    pub tenant_id: String,
    pub state: RunState,
    pub requested_resources: RequestedResources,
    pub requested_vcpu: u32,
    pub timeout_seconds: u64,
    pub idempotency_key: Option<String>,
    pub emr_job_run_id: Option<String>,
    pub started_at: Option<u64>,
    pub ended_at: Option<u64>,
    pub log_group: Option<String>,
    pub log_stream_prefix: Option<String>,
    pub error_message: Option<String>,
    pub cancellation_requested: bool,
    pub dispatch_attempts: u32,
    pub last_dispatch_attempt_at: Option<u64>,
    pub consecutive_status_failures: u32,
    pub last_status_failure_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Run {
    /// Creates a run in `accepted`. The environment must still accept runs and
    /// the effective timeout must fit the environment's limit.
    pub fn new(
        job: &Job,
        environment: &Environment,
        requested_resources: RequestedResources,
        timeout_seconds: Option<u64>,
        idempotency_key: Option<String>,
        now: u64,
    ) -> Result<Run> {
        if job.environment_id != environment.id {
            return Err(Error::invalid_config(format!(
                "job {} does not belong to environment {}",
                job.id, environment.id
            ))
            .into());
        }
        if !environment.status.accepts_runs() {
            return Err(Error::invalid_config(format!(
                "environment {} is {} and does not accept runs",
                environment.id, environment.status
            ))
            .into());
        }
        requested_resources.validate()?;
        let timeout_seconds = timeout_seconds.unwrap_or(job.timeout_seconds);
        if timeout_seconds == 0 || timeout_seconds > environment.max_run_seconds {
            return Err(Error::invalid_config(format!(
                "timeout_seconds must be between 1 and {}",
                environment.max_run_seconds
            ))
            .into());
        }
        Ok(Run {
            id: RunId::generate(),
            job_id: job.id.clone(),
            environment_id: environment.id.clone(),
            tenant_id: environment.tenant_id.clone(),
            state: RunState::Accepted,
            requested_vcpu: requested_resources.total_vcpu(),
            requested_resources,
            timeout_seconds,
            idempotency_key,
            emr_job_run_id: None,
            started_at: None,
            ended_at: None,
            log_group: None,
            log_stream_prefix: None,
            error_message: None,
            cancellation_requested: false,
            dispatch_attempts: 0,
            last_dispatch_attempt_at: None,
            consecutive_status_failures: 0,
            last_status_failure_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn key(&self) -> String {
        self.id.get().to_string()
    }

    pub fn environment_index_key(&self) -> String {
        format!(
            "{}{}",
            Self::environment_index_prefix(&self.environment_id),
            self.id
        )
    }

    pub fn environment_index_prefix(environment_id: &EnvironmentId) -> String {
        format!("{}|", environment_id)
    }

    pub fn log_pointer(&self) -> Option<LogPointer> {
        match (&self.log_group, &self.log_stream_prefix) {
            (Some(log_group), Some(log_stream_prefix)) => Some(LogPointer {
                log_group: log_group.clone(),
                log_stream_prefix: log_stream_prefix.clone(),
            }),
            _ => None,
        }
    }

    /// Guarded state change. Terminal targets stamp `ended_at`.
    pub fn transition_to(&mut self, target: RunState, now: u64) -> Result<(), Error> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidTransition {
                entity: "run",
                id: self.id.to_string(),
                from: self.state.to_string(),
                to: target.to_string(),
            });
        }
        self.state = target;
        self.updated_at = now;
        if target.is_terminal() {
            self.ended_at = Some(now);
        }
        Ok(())
    }

    pub fn mark_dispatched(
        &mut self,
        emr_job_run_id: String,
        pointer: Option<LogPointer>,
        now: u64,
    ) -> Result<(), Error> {
        if emr_job_run_id.trim().is_empty() {
            return Err(Error::invalid_config(format!(
                "engine returned an empty job run id for run {}",
                self.id
            )));
        }
        self.transition_to(RunState::Dispatching, now)?;
        self.emr_job_run_id = Some(emr_job_run_id);
        if let Some(pointer) = pointer {
            self.attach_log_pointer(pointer);
        }
        self.dispatch_attempts += 1;
        self.last_dispatch_attempt_at = Some(now);
        Ok(())
    }

    pub fn mark_running(&mut self, now: u64) -> Result<(), Error> {
        self.transition_to(RunState::Running, now)?;
        self.started_at.get_or_insert(now);
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: u64) -> Result<(), Error> {
        self.transition_to(RunState::Failed, now)?;
        self.error_message = Some(reason.into());
        Ok(())
    }

    pub fn cancel(&mut self, now: u64) -> Result<(), Error> {
        self.transition_to(RunState::Cancelled, now)?;
        self.cancellation_requested = true;
        Ok(())
    }

    /// Records a dispatch attempt that did not leave `accepted`.
    pub fn record_dispatch_attempt(&mut self, now: u64) {
        self.dispatch_attempts += 1;
        self.last_dispatch_attempt_at = Some(now);
        self.updated_at = now;
    }

    /// Fills missing pointers; returns whether anything changed.
    pub fn attach_log_pointer(&mut self, pointer: LogPointer) -> bool {
        if self.log_group.is_some() && self.log_stream_prefix.is_some() {
            return false;
        }
        self.log_group = Some(pointer.log_group);
        self.log_stream_prefix = Some(pointer.log_stream_prefix);
        true
    }

    /// The timeout clock starts when the run starts, or when it was handed
    /// to the engine if the engine still reports it queued.
    pub fn timed_out(&self, now: u64) -> bool {
        let since = match (self.state, self.started_at) {
            (state, _) if state.is_terminal() => return false,
            (_, Some(started_at)) => started_at,
            (RunState::Dispatching, None) => match self.last_dispatch_attempt_at {
                Some(dispatched_at) => dispatched_at,
                None => return false,
            },
            _ => return false,
        };
        now.saturating_sub(since) > self.timeout_seconds.saturating_mul(1000)
    }

    /// Verifies the record-level invariants between state and optional
    /// attributes.
    pub fn check_invariants(&self) -> Result<(), String> {
        let has_handle = self.emr_job_run_id.is_some();
        match self.state {
            RunState::Accepted if has_handle => {
                return Err(format!("accepted run {} has an engine handle", self.id));
            }
            RunState::Dispatching | RunState::Running | RunState::Succeeded if !has_handle => {
                return Err(format!(
                    "{} run {} has no engine handle",
                    self.state, self.id
                ));
            }
            _ => {}
        }
        if self.state.is_terminal() != self.ended_at.is_some() {
            return Err(format!(
                "run {} in {} has inconsistent ended_at",
                self.id, self.state
            ));
        }
        if self.log_pointer().is_some() && !has_handle {
            return Err(format!("run {} has log pointers without a handle", self.id));
        }
        if self.log_group.is_some() != self.log_stream_prefix.is_some() {
            return Err(format!("run {} has a partial log pointer", self.id));
        }
        Ok(())
    }
}

/// Binds an `Idempotency-Key` to the run it created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdempotencyRecord {
    pub job_id: JobId,
    pub idempotency_key: String,
    pub fingerprint: String,
    pub run_id: RunId,
    pub created_at: u64,
}

impl IdempotencyRecord {
    pub fn key(&self) -> String {
        Self::key_from(&self.job_id, &self.idempotency_key)
    }

    pub fn key_from(job_id: &JobId, idempotency_key: &str) -> String {
        format!("{}|{}", job_id, idempotency_key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub run_id: RunId,
    pub tenant_id: String,
    pub environment_id: EnvironmentId,
    pub vcpu_seconds: u64,
    pub memory_gb_seconds: u64,
    pub estimated_cost_usd_micros: u64,
    pub recorded_at: u64,
}

impl UsageRecord {
    /// Builds the usage of a terminal run. Runs that never started consumed
    /// nothing and produce no record.
    pub fn for_run(run: &Run, now: u64) -> Option<UsageRecord> {
        let started_at = run.started_at?;
        let ended_at = run.ended_at.unwrap_or(now);
        let duration_seconds = ended_at.saturating_sub(started_at).div_ceil(1000);
        let vcpu_seconds = duration_seconds * u64::from(run.requested_resources.total_vcpu());
        let memory_gb_seconds =
            duration_seconds * u64::from(run.requested_resources.total_memory_gb());
        Some(UsageRecord {
            run_id: run.id.clone(),
            tenant_id: run.tenant_id.clone(),
            environment_id: run.environment_id.clone(),
            vcpu_seconds,
            memory_gb_seconds,
            estimated_cost_usd_micros: vcpu_seconds * VCPU_SECOND_PRICE_MICROS +
                memory_gb_seconds * MEMORY_GB_SECOND_PRICE_MICROS,
            recorded_at: now,
        })
    }

    pub fn key(&self) -> String {
        Self::key_from(&self.tenant_id, self.recorded_at, &self.run_id)
    }

    pub fn key_from(tenant_id: &str, recorded_at: u64, run_id: &RunId) -> String {
        format!("{}|{:020}|{}", tenant_id, recorded_at, run_id)
    }

    pub fn tenant_prefix(tenant_id: &str) -> String {
        format!("{}|", tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use strum::IntoEnumIterator;

    use super::*;
    use crate::test_objects::tests::{mock_environment, mock_job, mock_run};

    #[test]
    fn test_transition_table_is_exhaustive() {
        use RunState::*;
        let allowed = [
            (Accepted, Dispatching),
            (Accepted, Failed),
            (Accepted, Cancelled),
            (Dispatching, Running),
            (Dispatching, Failed),
            (Dispatching, Cancelled),
            (Running, Succeeded),
            (Running, Failed),
            (Running, Cancelled),
        ];
        for from in RunState::iter() {
            for to in RunState::iter() {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{from} -> {to} expected {expected}"
                );
                if from.is_terminal() {
                    assert!(!expected);
                }
            }
        }
    }

    #[test]
    fn test_transition_out_of_terminal_is_rejected() {
        let env = mock_environment(EnvironmentStatus::Active);
        let job = mock_job(&env);
        let mut run = mock_run(&job, &env);
        run.cancel(10).unwrap();
        assert_eq!(run.ended_at, Some(10));

        let err = run.transition_to(RunState::Running, 11).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(run.state, RunState::Cancelled);
        assert!(run.check_invariants().is_ok());
    }

    #[test]
    fn test_run_lifecycle_keeps_invariants() {
        let env = mock_environment(EnvironmentStatus::Active);
        let job = mock_job(&env);
        let mut run = mock_run(&job, &env);
        assert!(run.check_invariants().is_ok());

        let pointer = LogPointerResolver::default()
            .resolve(run.id.get(), env.id.get(), &env.region, Some("emr-1"))
            .unwrap();
        run.mark_dispatched("emr-1".to_string(), Some(pointer), 5).unwrap();
        assert!(run.check_invariants().is_ok());
        assert_eq!(run.dispatch_attempts, 1);

        run.mark_running(6).unwrap();
        assert_eq!(run.started_at, Some(6));
        run.transition_to(RunState::Succeeded, 2006).unwrap();
        assert!(run.check_invariants().is_ok());

        let usage = UsageRecord::for_run(&run, 2007).unwrap();
        assert_eq!(usage.vcpu_seconds, 2 * 5);
        assert_eq!(usage.memory_gb_seconds, 2 * 20);
        assert_eq!(usage.estimated_cost_usd_micros, 10 * 35 + 40 * 4);
    }

    #[test]
    fn test_usage_requires_start() {
        let env = mock_environment(EnvironmentStatus::Active);
        let job = mock_job(&env);
        let mut run = mock_run(&job, &env);
        run.fail("submission rejected", 3).unwrap();
        assert!(UsageRecord::for_run(&run, 4).is_none());
    }

    #[test]
    fn test_environment_status_lifecycle() {
        let mut env = mock_environment(EnvironmentStatus::Provisioning);
        env.set_status(EnvironmentStatus::Active, 1).unwrap();
        env.set_status(EnvironmentStatus::Degraded, 2).unwrap();
        env.set_status(EnvironmentStatus::Active, 3).unwrap();
        env.set_status(EnvironmentStatus::Deprovisioning, 4).unwrap();
        assert!(env.set_status(EnvironmentStatus::Active, 5).is_err());
        env.set_status(EnvironmentStatus::Terminated, 6).unwrap();
        assert!(!env.status.accepts_runs());
    }

    #[test]
    fn test_run_rejects_timeout_over_environment_limit() {
        let env = mock_environment(EnvironmentStatus::Active);
        let job = mock_job(&env);
        let err = Run::new(
            &job,
            &env,
            RequestedResources::default(),
            Some(env.max_run_seconds + 1),
            None,
            1,
        )
        .unwrap_err();
        assert!(matches!(find_error(&err), Some(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_tenant_index_key_orders_by_creation() {
        let mut older = mock_environment(EnvironmentStatus::Active);
        older.created_at = 9;
        let mut newer = mock_environment(EnvironmentStatus::Active);
        newer.created_at = 10;
        assert!(older.tenant_index_key() < newer.tenant_index_key());
        assert!(older
            .tenant_index_key()
            .starts_with(&Environment::tenant_index_prefix(&older.tenant_id)));
    }

    #[test]
    fn test_builder_reports_missing_fields_as_invalid_config() {
        let err = EnvironmentBuilder::default()
            .tenant_id("tenant-a".to_string())
            .provisioning_mode(ProvisioningMode::Full)
            .build()
            .unwrap_err();
        assert_eq!(
            find_error(&err),
            Some(&Error::invalid_config("region is required"))
        );

        let err = JobBuilder::default()
            .name("nightly".to_string())
            .build()
            .unwrap_err();
        assert_eq!(
            find_error(&err),
            Some(&Error::invalid_config("environment_id is required"))
        );
    }

    #[test]
    fn test_queued_run_times_out_from_dispatch() {
        let env = mock_environment(EnvironmentStatus::Active);
        let job = mock_job(&env);
        let mut run = Run::new(&job, &env, RequestedResources::default(), Some(1), None, 0).unwrap();
        // accepted runs wait for capacity without a deadline
        assert!(!run.timed_out(60_000));

        run.mark_dispatched("emr-1".to_string(), None, 1_000).unwrap();
        assert!(run.started_at.is_none());
        assert!(!run.timed_out(2_000));
        assert!(run.timed_out(2_001));

        run.mark_running(1_500).unwrap();
        assert!(!run.timed_out(2_001));
        assert!(run.timed_out(2_501));
    }

    #[test]
    fn test_empty_engine_handle_is_rejected() {
        let env = mock_environment(EnvironmentStatus::Active);
        let job = mock_job(&env);
        let mut run = mock_run(&job, &env);
        let err = run.mark_dispatched(" ".to_string(), None, 5).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert_eq!(run.state, RunState::Accepted);
        assert!(run.check_invariants().is_ok());
    }

    #[test]
    fn test_tenant_name_bounds() {
        let tenant = Tenant::new("  acme  ", 7).unwrap();
        assert_eq!(tenant.name, "acme");
        assert_eq!(tenant.created_at, 7);
        assert!(!tenant.id.contains('|'));
        assert!(matches!(Tenant::new("ab", 7), Err(Error::InvalidConfig(_))));
        assert!(Tenant::new(&"x".repeat(256), 7).is_err());
    }

    fn mode_strategy() -> impl Strategy<Value = ProvisioningMode> {
        prop_oneof![Just(ProvisioningMode::Full), Just(ProvisioningMode::ByocLite)]
    }

    proptest! {
        #[test]
        fn environment_config_accepted_iff_invariants_hold(
            mode in mode_strategy(),
            namespace in proptest::option::of("[a-z ]{0,8}"),
            max_concurrent_runs in 0u32..4,
            max_vcpu in 0u32..4,
        ) {
            let result = EnvironmentBuilder::default()
                .tenant_id("tenant-a".to_string())
                .region("us-east-1".to_string())
                .provisioning_mode(mode)
                .eks_namespace(namespace.clone())
                .max_concurrent_runs(max_concurrent_runs)
                .max_vcpu(max_vcpu)
                .build();

            let has_namespace = namespace.as_deref().is_some_and(|ns| !ns.trim().is_empty());
            let namespace_ok = match mode {
                ProvisioningMode::ByocLite => has_namespace,
                ProvisioningMode::Full => !has_namespace,
            };
            let expected = namespace_ok && max_concurrent_runs > 0 && max_vcpu > 0;
            prop_assert_eq!(result.is_ok(), expected);
            match result {
                Ok(env) => {
                    prop_assert_eq!(env.status, EnvironmentStatus::Provisioning);
                    prop_assert_eq!(env.eks_namespace.is_some(), mode == ProvisioningMode::ByocLite);
                }
                Err(err) => {
                    prop_assert!(matches!(find_error(&err), Some(Error::InvalidConfig(_))));
                }
            }
        }
    }
}
