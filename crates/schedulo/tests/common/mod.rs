use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use schedulo::persist::Persistence;
use schedulo::{
    BankConfig, DispatchConfig, DispatchFn, Error, Event, Mode, SchedulerConfig,
};

/// In-memory stand-in for the SQL store and the Redis cache, so the engine
/// tests run without external services.
#[derive(Default)]
pub struct MemoryPersistence {
    events: Mutex<HashMap<String, Event>>,
    fail_writes: AtomicBool,
}

impl MemoryPersistence {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.events.lock().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    fn check_writable(&self) -> Result<(), Error> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::NotImplemented);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Persistence for MemoryPersistence {
    async fn add(&self, event: Event) -> Result<(), Error> {
        self.check_writable()?;
        self.events.lock().unwrap().insert(event.id.clone(), event);
        Ok(())
    }

    async fn add_bulk(&self, events: &[Event]) -> Result<(), Error> {
        self.check_writable()?;
        let mut map = self.events.lock().unwrap();
        for event in events {
            map.insert(event.id.clone(), event.clone());
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), Error> {
        self.check_writable()?;
        self.events.lock().unwrap().remove(id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Event, Error> {
        self.events
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn get_all(&self) -> Result<Vec<Event>, Error> {
        Ok(self.events.lock().unwrap().values().cloned().collect())
    }
}

/// A dispatch callback that records every delivered event with its delivery
/// time.
#[derive(Default)]
pub struct Fired {
    events: Mutex<Vec<(Event, DateTime<Utc>)>>,
}

impl Fired {
    pub fn callback(fired: &Arc<Fired>) -> DispatchFn {
        let fired = Arc::clone(fired);
        Arc::new(move |event| {
            let fired = Arc::clone(&fired);
            async move {
                fired.events.lock().unwrap().push((event, Utc::now()));
                Ok(())
            }
            .boxed()
        })
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn snapshot(&self) -> Vec<(Event, DateTime<Utc>)> {
        self.events.lock().unwrap().clone()
    }
}

pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        bank: BankConfig {
            shards: 4,
            default_shard_capacity: 64,
            max_shard_capacity: 256,
        },
        dispatch: DispatchConfig {
            workers: 4,
            default_queue_capacity: 64,
            max_queue_capacity: 256,
        },
        default_input_queue_capacity: 64,
        max_input_queue_capacity: 256,
        max_bulk_limit: 100,
    }
}

pub fn one_shot(offset: chrono::Duration, topic: &str, payload: Vec<u8>) -> Event {
    Event {
        id: String::new(),
        cron_expression: String::new(),
        should_execute_at: Utc::now() + offset,
        mode: Mode::Timestamp,
        topic: topic.to_string(),
        payload,
    }
}

pub fn cron_event(expression: &str, topic: &str) -> Event {
    Event {
        id: String::new(),
        cron_expression: expression.to_string(),
        should_execute_at: Utc::now(),
        mode: Mode::Cron,
        topic: topic.to_string(),
        payload: Vec::new(),
    }
}

/// Poll `condition` every 25 ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}
