pub mod backoff;
pub mod cancellation;
pub mod dispatcher;
pub mod engine;
pub mod logs;
pub mod reconciler;
pub mod run_locks;
pub mod runner;
pub mod test_engine;
