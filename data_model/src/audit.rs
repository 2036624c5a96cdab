use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Run;

pub const ANONYMOUS_ACTOR: &str = "anonymous";

/// Who issued a state change: an API caller or a background worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub name: String,
    pub source_ip: Option<String>,
}

impl Actor {
    pub fn new(name: impl Into<String>, source_ip: Option<String>) -> Self {
        Self {
            name: name.into(),
            source_ip,
        }
    }

    pub fn system() -> Self {
        Self::new("system", None)
    }

    pub fn worker(name: &str) -> Self {
        Self::new(format!("worker:{name}"), None)
    }
}

impl Default for Actor {
    fn default() -> Self {
        Self::system()
    }
}

/// Append-only record of a state change, written in the same transaction as
/// the change itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub id: String,
    pub tenant_id: String,
    pub actor: String,
    pub source_ip: Option<String>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub details: BTreeMap<String, String>,
    pub created_at: u64,
}

impl AuditEvent {
    pub fn new(
        actor: &Actor,
        tenant_id: &str,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        now: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            actor: actor.name.clone(),
            source_ip: actor.source_ip.clone(),
            action: action.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            details: BTreeMap::new(),
            created_at: now,
        }
    }

    /// Event about a run, carrying the state the run is left in.
    pub fn for_run(actor: &Actor, run: &Run, action: &str, now: u64) -> Self {
        Self::new(actor, &run.tenant_id, action, "run", run.id.get(), now)
            .with_detail("state", run.state)
    }

    pub fn with_detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }

    pub fn key(&self) -> String {
        format!(
            "{}{:020}|{}",
            Self::tenant_prefix(&self.tenant_id),
            self.created_at,
            self.id
        )
    }

    pub fn tenant_prefix(tenant_id: &str) -> String {
        format!("{}|", tenant_id)
    }
}
