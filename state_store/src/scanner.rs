use std::sync::Arc;

use anyhow::{anyhow, Result};
use data_model::{
    AuditEvent,
    Environment,
    EnvironmentId,
    IdempotencyRecord,
    Job,
    JobId,
    Run,
    RunId,
    RunState,
    Tenant,
    UsageRecord,
};
use metrics::{StateStoreMetrics, Timer};
use opentelemetry::KeyValue;
use rocksdb::{Direction, IteratorMode, ReadOptions, TransactionDB};
use serde::de::DeserializeOwned;

use super::state_machine::SparkPilotColumns;
use crate::serializer::{JsonEncode, JsonEncoder};

/// Filters for run listings. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub tenant_id: Option<String>,
    pub environment_id: Option<EnvironmentId>,
    pub state: Option<RunState>,
}

impl RunFilter {
    fn matches(&self, run: &Run) -> bool {
        self.tenant_id
            .as_ref()
            .is_none_or(|tenant_id| &run.tenant_id == tenant_id) &&
            self.environment_id
                .as_ref()
                .is_none_or(|environment_id| &run.environment_id == environment_id) &&
            self.state.is_none_or(|state| run.state == state)
    }
}

pub struct StateReader {
    db: Arc<TransactionDB>,
    metrics: Arc<StateStoreMetrics>,
}

impl StateReader {
    pub fn new(db: Arc<TransactionDB>, metrics: Arc<StateStoreMetrics>) -> Self {
        Self { db, metrics }
    }

    pub fn get_from_cf<V>(&self, column: &SparkPilotColumns, key: &str) -> Result<Option<V>>
    where
        V: DeserializeOwned,
    {
        let kvs = &[KeyValue::new("op", "get_from_cf")];
        let _timer = Timer::start_with_labels(&self.metrics.state_read, kvs);
        let cf_handle = self
            .db
            .cf_handle(column.as_ref())
            .ok_or(anyhow!("failed to get column family {}", column))?;
        self.db
            .get_cf(&cf_handle, key)?
            .map(|value| JsonEncoder::decode::<V>(&value))
            .transpose()
    }

    /// Iterates keys under `key_prefix` starting at `start` (or the prefix
    /// itself), calling `visit` until it returns `false`.
    fn scan_prefix(
        &self,
        column: &SparkPilotColumns,
        key_prefix: &[u8],
        start: Option<&[u8]>,
        mut visit: impl FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        let cf_handle = self
            .db
            .cf_handle(column.as_ref())
            .ok_or(anyhow!("failed to get column family {}", column))?;
        let mut read_options = ReadOptions::default();
        read_options.set_readahead_size(4_194_304);
        let from = start.unwrap_or(key_prefix);
        let iter = self.db.iterator_cf_opt(
            &cf_handle,
            read_options,
            IteratorMode::From(from, Direction::Forward),
        );
        for kv in iter {
            let (key, value) = kv?;
            if !key.starts_with(key_prefix) {
                break;
            }
            if !visit(&key[..], &value[..])? {
                break;
            }
        }
        Ok(())
    }

    pub fn get_all_rows_from_cf<V>(&self, column: SparkPilotColumns) -> Result<Vec<V>>
    where
        V: DeserializeOwned,
    {
        let kvs = &[KeyValue::new("op", "get_all_rows_from_cf")];
        let _timer = Timer::start_with_labels(&self.metrics.state_read, kvs);
        let mut items = Vec::new();
        self.scan_prefix(&column, b"", None, |_, value| {
            items.push(JsonEncoder::decode::<V>(value)?);
            Ok(true)
        })?;
        Ok(items)
    }

    fn index_suffixes(&self, column: SparkPilotColumns, prefix: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        self.scan_prefix(&column, prefix.as_bytes(), None, |key, _| {
            let key = String::from_utf8(key.to_vec())?;
            if let Some(id) = key.rsplit('|').next() {
                ids.push(id.to_string());
            }
            Ok(true)
        })?;
        Ok(ids)
    }

    pub fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        self.get_from_cf(&SparkPilotColumns::Tenants, tenant_id)
    }

    pub fn get_environment(&self, environment_id: &EnvironmentId) -> Result<Option<Environment>> {
        self.get_from_cf(&SparkPilotColumns::Environments, environment_id.get())
    }

    /// Environments ordered by creation time, oldest first; ties by id.
    pub fn list_environments(&self, tenant_id: Option<&str>) -> Result<Vec<Environment>> {
        let kvs = &[KeyValue::new("op", "list_environments")];
        let _timer = Timer::start_with_labels(&self.metrics.state_read, kvs);
        let mut environments = match tenant_id {
            Some(tenant_id) => {
                let prefix = Environment::tenant_index_prefix(tenant_id);
                let mut environments = Vec::new();
                for id in self.index_suffixes(SparkPilotColumns::EnvironmentsByTenant, &prefix)? {
                    if let Some(environment) = self.get_environment(&EnvironmentId::new(id))? {
                        environments.push(environment);
                    }
                }
                environments
            }
            None => self.get_all_rows_from_cf::<Environment>(SparkPilotColumns::Environments)?,
        };
        environments.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(environments)
    }

    pub fn get_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        self.get_from_cf(&SparkPilotColumns::Jobs, job_id.get())
    }

    pub fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        self.get_from_cf(&SparkPilotColumns::Runs, run_id.get())
    }

    /// Runs matching `filter`, newest first. An environment filter is served
    /// from the environment index instead of a full scan.
    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let kvs = &[KeyValue::new("op", "list_runs")];
        let _timer = Timer::start_with_labels(&self.metrics.state_read, kvs);
        let candidates = match &filter.environment_id {
            Some(environment_id) => {
                let prefix = Run::environment_index_prefix(environment_id);
                let mut runs = Vec::new();
                for id in self.index_suffixes(SparkPilotColumns::RunsByEnvironment, &prefix)? {
                    if let Some(run) = self.get_run(&RunId::new(id))? {
                        runs.push(run);
                    }
                }
                runs
            }
            None => self.get_all_rows_from_cf::<Run>(SparkPilotColumns::Runs)?,
        };
        let mut runs: Vec<Run> = candidates
            .into_iter()
            .filter(|run| filter.matches(run))
            .collect();
        runs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(runs)
    }

    pub fn get_idempotency_record(
        &self,
        job_id: &JobId,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        self.get_from_cf(
            &SparkPilotColumns::IdempotencyKeys,
            &IdempotencyRecord::key_from(job_id, idempotency_key),
        )
    }

    /// Usage records of a tenant with `from <= recorded_at <= to`.
    pub fn list_usage(
        &self,
        tenant_id: &str,
        from: Option<u64>,
        to: Option<u64>,
    ) -> Result<Vec<UsageRecord>> {
        let kvs = &[KeyValue::new("op", "list_usage")];
        let _timer = Timer::start_with_labels(&self.metrics.state_read, kvs);
        let prefix = UsageRecord::tenant_prefix(tenant_id);
        let start = from.map(|from| format!("{}{:020}|", prefix, from));
        let to = to.unwrap_or(u64::MAX);
        let mut records = Vec::new();
        self.scan_prefix(
            &SparkPilotColumns::UsageRecords,
            prefix.as_bytes(),
            start.as_deref().map(str::as_bytes),
            |_, value| {
                let record = JsonEncoder::decode::<UsageRecord>(value)?;
                if record.recorded_at > to {
                    return Ok(false);
                }
                records.push(record);
                Ok(true)
            },
        )?;
        Ok(records)
    }

    /// Audit events of a tenant, oldest first, at most `limit` of them.
    pub fn list_audit_events(&self, tenant_id: &str, limit: usize) -> Result<Vec<AuditEvent>> {
        let kvs = &[KeyValue::new("op", "list_audit_events")];
        let _timer = Timer::start_with_labels(&self.metrics.state_read, kvs);
        let prefix = AuditEvent::tenant_prefix(tenant_id);
        let mut events = Vec::new();
        self.scan_prefix(
            &SparkPilotColumns::AuditEvents,
            prefix.as_bytes(),
            None,
            |_, value| {
                if events.len() >= limit {
                    return Ok(false);
                }
                events.push(JsonEncoder::decode::<AuditEvent>(value)?);
                Ok(true)
            },
        )?;
        Ok(events)
    }
}
