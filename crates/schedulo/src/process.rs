use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dispatch::DispatchManager;
use crate::event::Mode;
use crate::scheduler::Inner;
use crate::shard::Shard;

/// Poll cadence for a shard whose head is not yet due. Scheduling precision
/// is bounded by this tick (the system targets ~1 s resolution).
const POLL_TICK: Duration = Duration::from_millis(250);

/// ProcessingWorker drives one shard: it pops records whose firing time has
/// arrived, hands them to the dispatch manager, and re-submits cron records
/// through the scheduler's recurrence path.
pub(crate) struct ProcessingWorker {
    cancel: CancellationToken,
    _handle: JoinHandle<()>,
}

impl ProcessingWorker {
    pub fn spawn(
        shard: Arc<Mutex<Shard>>,
        scheduler: Weak<Inner>,
        dispatch: Arc<DispatchManager>,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            run(shard, scheduler, dispatch, token).await;
        });
        Self {
            cancel,
            _handle: handle,
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn run(
    shard: Arc<Mutex<Shard>>,
    scheduler: Weak<Inner>,
    dispatch: Arc<DispatchManager>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        // The shard lock is never held across an await point.
        let due = {
            let mut shard = shard.lock().unwrap();
            match shard.peek() {
                Some(head) if head.should_execute_at <= Utc::now() => shard.pop(),
                _ => None,
            }
        };

        match due {
            Some(record) => {
                if let Err(err) = dispatch.dispatch(record.clone()) {
                    tracing::debug!(?err, id = %record.id, "dropping due event");
                }

                if record.mode == Mode::Cron {
                    match scheduler.upgrade() {
                        Some(inner) => inner.reschedule(record).await,
                        None => return,
                    }
                }

                tokio::task::yield_now().await;
            }
            None => {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(POLL_TICK) => {}
                }
            }
        }
    }
}
