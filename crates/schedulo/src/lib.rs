mod bank;
mod breaker;
mod dispatch;
mod event;
mod metrics;
pub mod persist;
mod process;
mod queue;
mod router;
mod scheduler;
mod shard;

pub use bank::{BankConfig, ShardBank, DEFAULT_MAX_SHARD_CAPACITY};
pub use dispatch::DispatchConfig;
pub use event::{Event, EventRecord, Id, Mode};
pub use metrics::Metrics;
pub use queue::BoundedQueue;
pub use router::Router;
pub use scheduler::{DispatchFn, Scheduler, SchedulerConfig};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("the requested event cannot be found")]
    NotFound,
    #[error("the max intake queue capacity has been reached")]
    IntakeCapacityExceeded,
    #[error("the max shard capacity has been reached")]
    ShardCapacityExceeded,
    #[error("the max dispatch queue capacity has been reached")]
    DispatchCapacityExceeded,
    #[error("unknown topic: '{0}'")]
    UnknownTopic(String),
    #[error("invalid cron expression: '{0}'")]
    InvalidCron(String),
    #[error("this method is not implemented")]
    NotImplemented,
    #[error("unsupported sql driver: '{0}'")]
    UnsupportedDriver(String),
    #[error("the circuit breaker is open")]
    CircuitOpen,
    #[error(transparent)]
    Store(#[from] sqlx::Error),
    #[error(transparent)]
    Cache(#[from] redis::RedisError),
}
