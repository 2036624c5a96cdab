use std::{
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::engine::{EngineError, EngineHandle, EngineStatus, JobEngine, JobSubmission};

/// Scriptable engine for processor and service tests. Handles are
/// `emr-1`, `emr-2`, ... in submission order.
#[derive(Default)]
pub struct FakeJobEngine {
    next_handle: AtomicUsize,
    reject_submissions: AtomicBool,
    blank_handles: AtomicBool,
    submit_delay_ms: AtomicU64,
    fail_cancels: AtomicBool,
    statuses: DashMap<String, Result<EngineStatus, EngineError>>,
    submissions: DashMap<String, JobSubmission>,
    cancels: DashMap<String, usize>,
}

impl FakeJobEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_submissions(&self, reject: bool) {
        self.reject_submissions.store(reject, Ordering::SeqCst);
    }

    /// Acknowledge submissions with an empty handle, which the store
    /// refuses to record.
    pub fn return_blank_handles(&self, blank: bool) {
        self.blank_handles.store(blank, Ordering::SeqCst);
    }

    pub fn set_submit_delay(&self, delay: Duration) {
        self.submit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_cancels(&self, fail: bool) {
        self.fail_cancels.store(fail, Ordering::SeqCst);
    }

    pub fn set_status(&self, handle: &str, status: EngineStatus) {
        self.statuses.insert(handle.to_string(), Ok(status));
    }

    pub fn set_status_error(&self, handle: &str, error: EngineError) {
        self.statuses.insert(handle.to_string(), Err(error));
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.len()
    }

    pub fn submission(&self, handle: &str) -> Option<JobSubmission> {
        self.submissions.get(handle).map(|s| s.clone())
    }

    pub fn cancel_count(&self, handle: &str) -> usize {
        self.cancels.get(handle).map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl JobEngine for FakeJobEngine {
    fn name(&self) -> &str {
        "fake"
    }

    async fn submit(&self, submission: &JobSubmission) -> Result<EngineHandle, EngineError> {
        let delay = self.submit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.reject_submissions.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("submission rejected".to_string()));
        }
        let handle = match self.blank_handles.load(Ordering::SeqCst) {
            true => String::new(),
            false => format!("emr-{}", self.next_handle.fetch_add(1, Ordering::SeqCst) + 1),
        };
        self.submissions.insert(handle.clone(), submission.clone());
        Ok(EngineHandle::new(handle))
    }

    async fn status(&self, handle: &EngineHandle) -> Result<EngineStatus, EngineError> {
        match self.statuses.get(handle.get()) {
            Some(status) => status.clone(),
            None if self.submissions.contains_key(handle.get()) => Ok(EngineStatus::Queued),
            None => Err(EngineError::NotFound(handle.get().to_string())),
        }
    }

    async fn cancel(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        *self.cancels.entry(handle.get().to_string()).or_insert(0) += 1;
        if self.fail_cancels.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable("cancel failed".to_string()));
        }
        Ok(())
    }
}
