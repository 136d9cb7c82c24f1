pub mod clock;
pub mod config;
pub mod cron;
pub mod error;
pub mod event;
pub mod job;
pub mod message;
pub mod shutdown;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::QueueConfig;
pub use cron::{CronSchedule, SlotGranularity};
pub use error::{GatewayError, GatewayResult, QueueError, Result};
pub use event::SchedulerEvent;
pub use job::JobRecord;
pub use message::{
    Headers, JobSlotKey, Lease, Message, MessageId, MessageStatus, NewMessage, OwnerToken,
    ERROR_HEADER, JOB_NAME_HEADER, JOB_SLOT_HEADER, LEASE_EXPIRED_TOO_MANY_TIMES,
    RETRY_COUNT_HEADER,
};
pub use shutdown::Shutdown;
pub use traits::StorageGateway;
