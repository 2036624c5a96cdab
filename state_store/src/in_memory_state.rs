use anyhow::Result;
use data_model::{
    Environment,
    EnvironmentCapacity,
    EnvironmentId,
    EnvironmentStatus,
    Error,
    Run,
    RunId,
    RunState,
};

use crate::{
    requests::RequestPayload,
    scanner::StateReader,
    state_machine::{SparkPilotColumns, WriteEffects},
};

/// Capacity-relevant view of a non-terminal run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSlot {
    pub environment_id: EnvironmentId,
    pub state: RunState,
    pub requested_vcpu: u32,
    pub created_at: u64,
}

impl From<&Run> for RunSlot {
    fn from(run: &Run) -> Self {
        Self {
            environment_id: run.environment_id.clone(),
            state: run.state,
            requested_vcpu: run.requested_vcpu,
            created_at: run.created_at,
        }
    }
}

/// Concurrency and vCPU committed on an environment: runs in
/// dispatching/running plus in-flight admission reservations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommittedCapacity {
    pub runs: u32,
    pub vcpu: u32,
}

pub struct InMemoryState {
    environments: im::HashMap<EnvironmentId, Environment>,

    // RunId -> slot, non-terminal runs only
    runs: im::HashMap<RunId, RunSlot>,

    // Runs admitted but not yet dispatched or failed
    reservations: im::HashSet<RunId>,
}

impl InMemoryState {
    pub fn new(reader: &StateReader) -> Result<Self> {
        let mut environments = im::HashMap::new();
        for environment in reader.get_all_rows_from_cf::<Environment>(SparkPilotColumns::Environments)? {
            environments.insert(environment.id.clone(), environment);
        }
        let mut runs = im::HashMap::new();
        for run in reader.get_all_rows_from_cf::<Run>(SparkPilotColumns::Runs)? {
            if !run.state.is_terminal() {
                runs.insert(run.id.clone(), RunSlot::from(&run));
            }
        }
        Ok(Self {
            environments,
            runs,
            reservations: im::HashSet::new(),
        })
    }

    pub fn environment(&self, environment_id: &EnvironmentId) -> Option<&Environment> {
        self.environments.get(environment_id)
    }

    /// Whether the run was admitted and its submission outcome is not yet
    /// recorded.
    pub fn is_reserved(&self, run_id: &RunId) -> bool {
        self.reservations.contains(run_id)
    }

    pub fn committed(&self, environment_id: &EnvironmentId) -> CommittedCapacity {
        self.committed_excluding(environment_id, None)
    }

    fn committed_excluding(
        &self,
        environment_id: &EnvironmentId,
        excluded: Option<&RunId>,
    ) -> CommittedCapacity {
        let mut committed = CommittedCapacity::default();
        for (run_id, slot) in self.runs.iter() {
            if &slot.environment_id != environment_id || Some(run_id) == excluded {
                continue;
            }
            if slot.state.is_active() || self.reservations.contains(run_id) {
                committed.runs += 1;
                committed.vcpu = committed.vcpu.saturating_add(slot.requested_vcpu);
            }
        }
        committed
    }

    /// Admission decision for an accepted run. A run that already holds a
    /// reservation is admitted again without being counted twice.
    pub fn check_admission(&self, run_id: &RunId) -> Result<(), Error> {
        let slot = self
            .runs
            .get(run_id)
            .ok_or_else(|| Error::not_found("run", run_id))?;
        if slot.state != RunState::Accepted {
            return Err(Error::InvalidTransition {
                entity: "run",
                id: run_id.to_string(),
                from: slot.state.to_string(),
                to: RunState::Dispatching.to_string(),
            });
        }
        if self.reservations.contains(run_id) {
            return Ok(());
        }
        let environment = self
            .environments
            .get(&slot.environment_id)
            .ok_or_else(|| Error::not_found("environment", &slot.environment_id))?;
        let denied = |reason: String| Error::AdmissionDenied {
            environment_id: environment.id.to_string(),
            reason,
        };
        if environment.status != EnvironmentStatus::Active {
            return Err(denied(format!("environment is {}", environment.status)));
        }
        let committed = self.committed_excluding(&environment.id, Some(run_id));
        if committed.runs >= environment.max_concurrent_runs {
            return Err(denied(format!(
                "{} of {} concurrent runs in use",
                committed.runs, environment.max_concurrent_runs
            )));
        }
        if committed.vcpu.saturating_add(slot.requested_vcpu) > environment.max_vcpu {
            return Err(denied(format!(
                "{} vCPU requested with {} of {} committed",
                slot.requested_vcpu, committed.vcpu, environment.max_vcpu
            )));
        }
        Ok(())
    }

    /// A resize may not drop below what is already committed.
    pub fn check_resize(
        &self,
        environment_id: &EnvironmentId,
        capacity: &EnvironmentCapacity,
    ) -> Result<(), Error> {
        let committed = self.committed(environment_id);
        if capacity.max_concurrent_runs < committed.runs {
            return Err(Error::invalid_config(format!(
                "max_concurrent_runs {} is below the {} runs in flight",
                capacity.max_concurrent_runs, committed.runs
            )));
        }
        if capacity.max_vcpu < committed.vcpu {
            return Err(Error::invalid_config(format!(
                "max_vcpu {} is below the {} vCPU committed",
                capacity.max_vcpu, committed.vcpu
            )));
        }
        Ok(())
    }

    /// Run ids in `states`, oldest first.
    pub fn runs_in_states(&self, states: &[RunState]) -> Vec<RunId> {
        let mut runs: Vec<(&RunId, &RunSlot)> = self
            .runs
            .iter()
            .filter(|(_, slot)| states.contains(&slot.state))
            .collect();
        runs.sort_by(|(a_id, a), (b_id, b)| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a_id.cmp(b_id))
        });
        runs.into_iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn update_state(&mut self, payload: &RequestPayload, effects: &WriteEffects) -> Result<()> {
        for environment in &effects.environments {
            self.environments
                .insert(environment.id.clone(), environment.clone());
        }
        for run in &effects.runs {
            if run.state != RunState::Accepted {
                self.reservations.remove(&run.id);
            }
            if run.state.is_terminal() {
                self.runs.remove(&run.id);
            } else {
                self.runs.insert(run.id.clone(), RunSlot::from(run));
            }
        }
        match payload {
            RequestPayload::AdmitRun(req) => {
                self.reservations.insert(req.run_id.clone());
            }
            RequestPayload::ReleaseAdmission(req) => {
                self.reservations.remove(&req.run_id);
            }
            _ => {}
        }
        Ok(())
    }
}
