pub mod pool;
pub mod stage_worker;

pub use pool::{WorkerGroup, WorkerPool, WorkerReport};
pub use stage_worker::{PollOutcome, RetryPolicy, StageWorker, WorkerSettings};
