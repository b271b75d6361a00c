use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::FutureExt;

use crate::scheduler::DispatchFn;
use crate::{Error, Event};

struct Listener {
    id: i64,
    callback: DispatchFn,
}

/// Router maps topics to subscriber callbacks and fans fired events out to
/// them. Dispatch reads vastly outnumber register/unregister writes, so the
/// registry sits behind a read-write lock.
pub struct Router {
    topics: RwLock<HashMap<String, Vec<Listener>>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Add a listener; the returned id is monotone within the topic and is
    /// the handle for [`Router::unregister`].
    pub fn register(&self, topic: &str, callback: DispatchFn) -> i64 {
        let mut topics = self.topics.write().unwrap();
        let listeners = topics.entry(topic.to_string()).or_default();
        let id = listeners.last().map(|l| l.id + 1).unwrap_or(0);
        listeners.push(Listener { id, callback });
        id
    }

    pub fn unregister(&self, topic: &str, id: i64) {
        let mut topics = self.topics.write().unwrap();
        if let Some(listeners) = topics.get_mut(topic) {
            listeners.retain(|l| l.id != id);
        }
    }

    /// Deliver a fired event. An empty topic broadcasts to every listener of
    /// every topic; otherwise listeners of the event's topic are invoked in
    /// registration order. Callback errors are collected and the last one
    /// surfaces.
    pub async fn on_dispatch(&self, event: Event) -> anyhow::Result<()> {
        let callbacks: Vec<DispatchFn> = {
            let topics = self.topics.read().unwrap();

            if event.topic.is_empty() {
                topics
                    .values()
                    .flat_map(|listeners| listeners.iter().map(|l| l.callback.clone()))
                    .collect()
            } else {
                match topics.get(&event.topic) {
                    None => return Err(Error::UnknownTopic(event.topic.clone()).into()),
                    Some(listeners) => listeners.iter().map(|l| l.callback.clone()).collect(),
                }
            }
        };

        let mut last_err = None;
        for callback in callbacks {
            if let Err(err) = callback(event.clone()).await {
                last_err = Some(err);
            }
        }

        match last_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// The callback to install as the scheduler's dispatch function.
    pub fn dispatch_fn(self: Arc<Self>) -> DispatchFn {
        Arc::new(move |event| {
            let router = Arc::clone(&self);
            async move { router.on_dispatch(event).await }.boxed()
        })
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Mode;
    use chrono::Utc;
    use std::sync::Mutex;

    fn event(topic: &str) -> Event {
        Event {
            id: "ev-1".to_string(),
            cron_expression: String::new(),
            should_execute_at: Utc::now(),
            mode: Mode::Timestamp,
            topic: topic.to_string(),
            payload: b"payload".to_vec(),
        }
    }

    fn recording(seen: &Arc<Mutex<Vec<String>>>, tag: &str) -> DispatchFn {
        let seen = Arc::clone(seen);
        let tag = tag.to_string();
        Arc::new(move |_event| {
            let seen = Arc::clone(&seen);
            let tag = tag.clone();
            async move {
                seen.lock().unwrap().push(tag);
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn delivers_to_every_listener_of_the_topic_once() {
        let router = Router::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        router.register("x", recording(&seen, "a"));
        router.register("x", recording(&seen, "b"));
        router.register("y", recording(&seen, "c"));

        router.on_dispatch(event("x")).await.unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn empty_topic_broadcasts_to_all_topics() {
        let router = Router::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        router.register("x", recording(&seen, "a"));
        router.register("x", recording(&seen, "b"));
        router.register("y", recording(&seen, "c"));

        router.on_dispatch(event("")).await.unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn unknown_topic_fails() {
        let router = Router::new();
        router.register("x", Arc::new(|_| async { Ok(()) }.boxed()));

        let err = router.on_dispatch(event("nope")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnknownTopic(topic)) if topic == "nope"
        ));
    }

    #[tokio::test]
    async fn unregistered_listener_is_skipped() {
        let router = Router::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = router.register("x", recording(&seen, "a"));
        router.register("x", recording(&seen, "b"));
        router.unregister("x", id);

        router.on_dispatch(event("x")).await.unwrap();
        assert_eq!(seen.lock().unwrap().clone(), vec!["b"]);
    }

    #[tokio::test]
    async fn last_callback_error_surfaces() {
        let router = Router::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        router.register(
            "x",
            Arc::new(|_| async { Err(anyhow::anyhow!("listener failed")) }.boxed()),
        );
        router.register("x", recording(&seen, "ok"));

        let err = router.on_dispatch(event("x")).await.unwrap_err();
        assert_eq!(err.to_string(), "listener failed");
        assert_eq!(seen.lock().unwrap().clone(), vec!["ok"]);
    }
}
