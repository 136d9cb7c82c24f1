pub mod backoff;
pub mod coordinator;
pub mod heartbeat;
pub mod pool;

pub use backoff::{BackoffPolicy, PollBackoff};
pub use coordinator::{LeaseCoordinator, RenewOutcome};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor, LeaseRegistry, RecoveryReport};
pub use pool::{MessageHandler, WorkerPool};
