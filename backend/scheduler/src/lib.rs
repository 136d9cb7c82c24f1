pub mod handle;
pub mod scheduler;

pub use handle::{json_payload, JobFire, JobHandle, PayloadFactory};
pub use scheduler::JobScheduler;
