use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bank::{BankConfig, ShardBank};
use crate::breaker::ThresholdBreaker;
use crate::dispatch::{DispatchConfig, DispatchManager};
use crate::event::{Event, EventRecord, Id, Mode};
use crate::metrics::Metrics;
use crate::persist::Persistence;
use crate::process::ProcessingWorker;
use crate::queue::BoundedQueue;
use crate::Error;

/// DispatchFn is the user-provided callback invoked with each fired event,
/// normally [`crate::Router::dispatch_fn`].
pub type DispatchFn = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Sleep applied by the intake drain when there is nothing to batch.
const DRAIN_IDLE_TICK: Duration = Duration::from_millis(100);

/// Store/cache bulk writes trip the breaker after this many consecutive
/// failures; it half-opens again after [`BREAKER_RESET_TIMEOUT`].
const BREAKER_FAILURE_THRESHOLD: u32 = 12;
const BREAKER_RESET_TIMEOUT: Duration = Duration::from_secs(10);

/// The adaptive batch targets roughly this many seconds of arrivals.
const BATCH_TARGET_SECONDS: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub bank: BankConfig,
    pub dispatch: DispatchConfig,
    pub default_input_queue_capacity: usize,
    pub max_input_queue_capacity: usize,
    pub max_bulk_limit: usize,
}

/// Scheduler is the orchestrator: it owns the intake queue, the shard bank,
/// the processing workers, the dispatch pool, and the drain task connecting
/// intake to durable storage.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    bank: ShardBank,
    dispatch: Arc<DispatchManager>,
    store: Arc<dyn Persistence>,
    cache: Arc<dyn Persistence>,
    intake: Mutex<BoundedQueue<Event>>,
    input_metrics: Metrics,
    cancel: CancellationToken,
    workers: Mutex<Vec<ProcessingWorker>>,
    config: Mutex<SchedulerConfig>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn Persistence>,
        cache: Arc<dyn Persistence>,
        callback: DispatchFn,
    ) -> Self {
        let cancel = CancellationToken::new();

        let dispatch = DispatchManager::new(
            Arc::clone(&store),
            callback,
            config.dispatch,
            Arc::new(Metrics::new()),
            &cancel,
        );

        let inner = Arc::new(Inner {
            bank: ShardBank::new(config.bank),
            dispatch,
            store,
            cache,
            intake: Mutex::new(BoundedQueue::new(
                config.default_input_queue_capacity,
                config.max_input_queue_capacity,
            )),
            input_metrics: Metrics::new(),
            cancel,
            workers: Mutex::new(Vec::new()),
            config: Mutex::new(config),
        });

        Self { inner }
    }

    /// Accept an event: assign a fresh id, normalize its firing time, and
    /// queue it for the batching drain. The id is returned immediately; the
    /// event becomes durable when its batch is written through.
    pub fn schedule(&self, mut event: Event) -> Result<Id, Error> {
        let inner = &self.inner;
        inner.input_metrics.op();

        let now = Utc::now();
        if event.should_execute_at < now {
            event.should_execute_at = now;
        }

        if event.mode == Mode::Cron {
            let schedule = parse_cron(&event.cron_expression)?;
            event.should_execute_at = next_fire(&schedule, event.should_execute_at)
                .ok_or_else(|| Error::InvalidCron(event.cron_expression.clone()))?;
        }

        let id = Uuid::new_v4().to_string();
        event.id = id.clone();

        inner
            .intake
            .lock()
            .unwrap()
            .push(event)
            .map_err(|_| Error::IntakeCapacityExceeded)?;

        Ok(id)
    }

    /// Remove an event's durable row (store and cache). The in-memory record
    /// is left alone: when it pops, the dispatch fetch misses and the record
    /// is dropped silently.
    pub async fn unschedule(&self, id: &str) -> Result<(), Error> {
        self.inner.store.delete(id).await
    }

    /// Start the dispatch pool, the per-shard processing workers, and the
    /// intake drain, then reload every durable row into the shards. Past-due
    /// one-shots become immediately due and fire in the first polling pass.
    pub async fn start(&self) -> Result<(), Error> {
        let inner = &self.inner;

        inner.dispatch.run();

        {
            let mut workers = inner.workers.lock().unwrap();
            for i in 0..inner.bank.shard_count() {
                workers.push(self.spawn_worker(i));
            }
        }

        let drain = Arc::clone(inner);
        tokio::spawn(async move { drain.drain_loop().await });

        inner.restore().await
    }

    /// Stop the dispatch pool, the processing workers, and then cancel the
    /// root token; every task exits at its next yield point.
    pub fn stop(&self) {
        self.inner.dispatch.stop();
        for worker in self.inner.workers.lock().unwrap().iter() {
            worker.stop();
        }
        self.inner.cancel.cancel();
    }

    /// Apply a new configuration: resize the shard bank, swap the dispatch
    /// pool, and grow or shrink the worker population to match.
    pub fn set_config(&self, config: SchedulerConfig) -> Result<(), Error> {
        let inner = &self.inner;

        inner.bank.set_config(config.bank)?;
        inner.dispatch.set_config(config.dispatch);

        let mut workers = inner.workers.lock().unwrap();
        let old_count = workers.len();

        if config.bank.shards < old_count {
            for worker in workers.drain(..old_count - config.bank.shards) {
                worker.stop();
            }
        } else {
            for i in old_count..config.bank.shards {
                workers.push(self.spawn_worker(i));
            }
        }
        drop(workers);

        *inner.config.lock().unwrap() = config;
        Ok(())
    }

    fn spawn_worker(&self, shard_index: usize) -> ProcessingWorker {
        let inner = &self.inner;
        let shard = inner
            .bank
            .shard(shard_index)
            .expect("worker spawned for a shard that exists");
        ProcessingWorker::spawn(
            shard,
            Arc::downgrade(inner),
            Arc::clone(&inner.dispatch),
            &inner.cancel,
        )
    }
}

impl Inner {
    /// Recurrence entry point, called by processing workers on a cron fire:
    /// verify the event still exists, advance to the next fire, re-insert.
    pub(crate) async fn reschedule(&self, mut record: EventRecord) {
        match self.store.get(&record.id).await {
            // Unscheduled by the user between pop and here; drop it.
            Err(Error::NotFound) => return,
            Err(err) => {
                tracing::debug!(?err, id = %record.id, "recurrence lookup failed, re-inserting anyway");
            }
            Ok(_) => {}
        }

        if record.mode == Mode::Cron {
            let Ok(schedule) = parse_cron(&record.cron_expression) else {
                return;
            };
            let Some(next) = next_fire(&schedule, record.should_execute_at) else {
                return;
            };
            record.should_execute_at = next;
        }

        if let Err(err) = self.bank.push(record) {
            tracing::warn!(?err, "failed to re-insert recurring event");
        }
    }

    /// The intake drain: batch recent arrivals into bulk writes sized to
    /// roughly five seconds of the observed input rate, write them through
    /// (store first, then cache), then seed the shards.
    async fn drain_loop(self: Arc<Self>) {
        let mut breaker =
            ThresholdBreaker::new(BREAKER_FAILURE_THRESHOLD, BREAKER_RESET_TIMEOUT);

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            if self.intake.lock().unwrap().is_empty() {
                tokio::select! {
                    () = self.cancel.cancelled() => return,
                    () = tokio::time::sleep(DRAIN_IDLE_TICK) => {}
                }
                continue;
            }

            let max_bulk_limit = self.config.lock().unwrap().max_bulk_limit;
            let rate = self.input_metrics.op_rate();
            let limit = ((rate * BATCH_TARGET_SECONDS).ceil() as usize).clamp(1, max_bulk_limit);

            let batch: Vec<Event> = {
                let mut intake = self.intake.lock().unwrap();
                std::iter::from_fn(|| intake.pop()).take(limit).collect()
            };
            if batch.is_empty() {
                continue;
            }

            if let Err(err) = breaker.call(self.store.add_bulk(&batch)).await {
                tracing::warn!(?err, dropped = batch.len(), "intake batch dropped: store write failed");
                continue;
            }
            if let Err(err) = breaker.call(self.cache.add_bulk(&batch)).await {
                tracing::warn!(?err, dropped = batch.len(), "intake batch dropped: cache write failed");
                continue;
            }

            for event in &batch {
                if let Err(err) = self.bank.push(EventRecord::from(event)) {
                    tracing::warn!(?err, id = %event.id, "failed to insert scheduled event into a shard");
                    break;
                }
            }
        }
    }

    /// Reload every durable row into the shards. No clamping is applied:
    /// past-due one-shots fire in the first polling pass.
    async fn restore(&self) -> Result<(), Error> {
        let events = self.store.get_all().await?;
        let restored = events.len();

        for event in &events {
            self.bank.push(EventRecord::from(event))?;
        }

        tracing::info!(restored, "restored persisted events into shards");
        Ok(())
    }
}

/// Parse a cron expression: six-field (seconds first) or descriptor form;
/// classic five-field expressions get an implicit `0` seconds field.
fn parse_cron(expression: &str) -> Result<cron::Schedule, Error> {
    let invalid = || Error::InvalidCron(expression.to_string());

    if expression.starts_with('@') {
        return cron::Schedule::from_str(expression).map_err(|_| invalid());
    }

    match expression.split_whitespace().count() {
        5 => cron::Schedule::from_str(&format!("0 {expression}")).map_err(|_| invalid()),
        _ => cron::Schedule::from_str(expression).map_err(|_| invalid()),
    }
}

fn next_fire(schedule: &cron::Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}
