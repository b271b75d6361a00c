use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::event::{EventRecord, Mode};
use crate::metrics::Metrics;
use crate::persist::Persistence;
use crate::queue::BoundedQueue;
use crate::scheduler::DispatchFn;
use crate::Error;

/// How long an idle dispatch worker sleeps before re-polling the queue.
const IDLE_TICK: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    pub workers: usize,
    pub default_queue_capacity: usize,
    pub max_queue_capacity: usize,
}

struct Pool {
    config: DispatchConfig,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// DispatchManager owns the post-firing path: a bounded queue of due records
/// and a pool of workers that re-fetch the full event, clear one-shot
/// persistence, and invoke the dispatch callback.
///
/// The manager outlives reconfiguration: `set_config` swaps the worker pool
/// and queue bounds in place, so processing workers keep a valid handle.
pub(crate) struct DispatchManager {
    queue: Mutex<BoundedQueue<EventRecord>>,
    persistence: Arc<dyn Persistence>,
    callback: DispatchFn,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    pool: Mutex<Pool>,
}

impl DispatchManager {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        callback: DispatchFn,
        config: DispatchConfig,
        metrics: Arc<Metrics>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let cancel = parent.child_token();
        Arc::new(Self {
            queue: Mutex::new(BoundedQueue::new(
                config.default_queue_capacity,
                config.max_queue_capacity,
            )),
            persistence,
            callback,
            metrics,
            pool: Mutex::new(Pool {
                config,
                cancel: cancel.child_token(),
                handles: Vec::new(),
            }),
            cancel,
        })
    }

    /// Non-blocking enqueue. A full queue rejects the record with
    /// [`Error::DispatchCapacityExceeded`]; the processing worker swallows it
    /// and the record is dropped. For one-shots the durable row survives
    /// until a delivery attempt after restart.
    pub fn dispatch(&self, record: EventRecord) -> Result<(), Error> {
        self.queue
            .lock()
            .unwrap()
            .push(record)
            .map_err(|_| Error::DispatchCapacityExceeded)
    }

    pub fn run(self: &Arc<Self>) {
        let mut pool = self.pool.lock().unwrap();
        let cancel = self.cancel.child_token();
        pool.cancel = cancel.clone();
        pool.handles = (0..pool.config.workers)
            .map(|_| {
                let manager = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(manager.worker_loop(cancel))
            })
            .collect();
    }

    pub fn stop(&self) {
        let pool = self.pool.lock().unwrap();
        pool.cancel.cancel();
    }

    /// Replace the worker pool and queue bounds. Queued records are kept.
    pub fn set_config(self: &Arc<Self>, config: DispatchConfig) {
        {
            let mut pool = self.pool.lock().unwrap();
            pool.cancel.cancel();
            pool.config = config;
        }
        self.queue
            .lock()
            .unwrap()
            .set_capacity(config.default_queue_capacity, config.max_queue_capacity);
        self.run();
    }

    async fn worker_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let record = self.queue.lock().unwrap().pop();
            match record {
                Some(record) => {
                    self.deliver(record).await;
                    tokio::task::yield_now().await;
                }
                None => {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(IDLE_TICK) => {}
                    }
                }
            }
        }
    }

    async fn deliver(&self, record: EventRecord) {
        // The full event is re-fetched here: only the header lived in memory.
        let event = match self.persistence.get(&record.id).await {
            Ok(event) => event,
            // Already unscheduled; the record drops out naturally.
            Err(Error::NotFound) => return,
            Err(err) => {
                tracing::warn!(?err, id = %record.id, "failed to fetch event for dispatch");
                return;
            }
        };

        // One-shot rows are cleared before the callback runs: a crash in
        // between loses the event rather than re-delivering it.
        if event.mode == Mode::Timestamp {
            if let Err(err) = self.persistence.delete(&event.id).await {
                tracing::warn!(?err, id = %event.id, "failed to delete one-shot event");
                return;
            }
        }

        if let Err(err) = (self.callback)(event).await {
            tracing::debug!(?err, id = %record.id, "dispatch callback failed");
        }

        self.metrics.op();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Event;
    use chrono::Utc;
    use futures::FutureExt;

    struct NoPersistence;

    #[async_trait::async_trait]
    impl Persistence for NoPersistence {
        async fn add(&self, _event: Event) -> Result<(), Error> {
            Ok(())
        }

        async fn add_bulk(&self, _events: &[Event]) -> Result<(), Error> {
            Ok(())
        }

        async fn delete(&self, _id: &str) -> Result<(), Error> {
            Ok(())
        }

        async fn get(&self, _id: &str) -> Result<Event, Error> {
            Err(Error::NotFound)
        }

        async fn get_all(&self) -> Result<Vec<Event>, Error> {
            Ok(Vec::new())
        }
    }

    fn record(i: usize) -> EventRecord {
        EventRecord {
            id: format!("ev-{i}"),
            cron_expression: String::new(),
            should_execute_at: Utc::now(),
            mode: Mode::Timestamp,
        }
    }

    #[test]
    fn full_queue_rejects_with_dispatch_capacity() {
        let callback: DispatchFn = Arc::new(|_| async { Ok(()) }.boxed());
        let manager = DispatchManager::new(
            Arc::new(NoPersistence),
            callback,
            DispatchConfig {
                workers: 0,
                default_queue_capacity: 1,
                max_queue_capacity: 2,
            },
            Arc::new(Metrics::new()),
            &CancellationToken::new(),
        );

        // No workers are running, so the queue can only fill.
        manager.dispatch(record(0)).unwrap();
        manager.dispatch(record(1)).unwrap();
        assert!(matches!(
            manager.dispatch(record(2)),
            Err(Error::DispatchCapacityExceeded)
        ));

        // Draining one slot re-admits the next record.
        manager.queue.lock().unwrap().pop().unwrap();
        manager.dispatch(record(2)).unwrap();
    }
}
