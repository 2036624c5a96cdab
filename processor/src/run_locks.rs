use std::sync::Arc;

use dashmap::DashMap;
use data_model::RunId;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-run async locks serializing the multi-step operations on a run
/// (admit, submit, record; observe).
#[derive(Default)]
pub struct RunLocks {
    locks: DashMap<RunId, Arc<Mutex<()>>>,
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, run_id: &RunId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(run_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drops the lock of a run that reached a terminal state. Holders keep
    /// their guard.
    pub fn forget(&self, run_id: &RunId) {
        self.locks
            .remove_if(run_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_lock_serializes_same_run() {
        let locks = Arc::new(RunLocks::new());
        let run_id = RunId::new("run-1".to_string());
        let guard = locks.lock(&run_id).await;

        let waiter = {
            let locks = locks.clone();
            let run_id = run_id.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&run_id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // other runs are not blocked
        let _other = locks.lock(&RunId::new("run-2".to_string())).await;

        drop(guard);
        waiter.await.unwrap();
        locks.forget(&run_id);
        assert_eq!(locks.len(), 1);
    }
}
