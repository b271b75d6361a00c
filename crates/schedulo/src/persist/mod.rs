mod cache;
mod sql;

pub use cache::{RedisCache, RedisCacheConfig};
pub use sql::{Driver, SqlStore, SqlStoreConfig};

use crate::{Error, Event};

/// Persistence is the durable face of the scheduler: the SQL store, the
/// write-through Redis cache, and test doubles all implement it.
///
/// `get` on the store falls through cache → store and re-populates the cache;
/// `get_all` is a startup-only full scan.
#[async_trait::async_trait]
pub trait Persistence: Send + Sync + 'static {
    async fn add(&self, event: Event) -> Result<(), Error>;
    async fn add_bulk(&self, events: &[Event]) -> Result<(), Error>;
    async fn delete(&self, id: &str) -> Result<(), Error>;
    async fn get(&self, id: &str) -> Result<Event, Error>;
    async fn get_all(&self) -> Result<Vec<Event>, Error>;
}
