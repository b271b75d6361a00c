use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use proto_schedulo::schedulo as proto;
use schedulo::persist::Persistence;
use schedulo::{Error, Event, Mode, Router, Scheduler, SchedulerConfig};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

/// Per-stream buffer between the dispatch path and the gRPC sender. A
/// subscriber that stops reading stalls its own stream only.
const STREAM_BUFFER: usize = 16;

/// ScheduloServer implements the `schedulo.Scheduler` gRPC service on top of
/// the core scheduler and the subscription router.
pub struct ScheduloServer {
    scheduler: Scheduler,
    router: Arc<Router>,
}

impl ScheduloServer {
    /// Build the router + scheduler pair and start the scheduler (which also
    /// restores persisted events into the shards).
    pub async fn new(
        config: SchedulerConfig,
        store: Arc<dyn Persistence>,
        cache: Arc<dyn Persistence>,
    ) -> Result<Self, Error> {
        let router = Arc::new(Router::new());
        let scheduler = Scheduler::new(config, store, cache, Arc::clone(&router).dispatch_fn());
        scheduler.start().await?;
        Ok(Self { scheduler, router })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

#[tonic::async_trait]
impl proto::scheduler_server::Scheduler for ScheduloServer {
    async fn schedule(
        &self,
        request: Request<proto::ScheduleRequest>,
    ) -> Result<Response<proto::ScheduleResponse>, Status> {
        let event = request
            .into_inner()
            .event
            .ok_or_else(|| Status::invalid_argument("event is required"))?;

        let id = self
            .scheduler
            .schedule(event_from_proto(event))
            .map_err(error_to_status)?;

        Ok(Response::new(proto::ScheduleResponse { id }))
    }

    async fn unschedule(
        &self,
        request: Request<proto::UnscheduleRequest>,
    ) -> Result<Response<proto::UnscheduleResponse>, Status> {
        self.scheduler
            .unschedule(&request.into_inner().id)
            .await
            .map_err(error_to_status)?;

        Ok(Response::new(proto::UnscheduleResponse {}))
    }

    type StreamEventsStream = ReceiverStream<Result<proto::StreamEventsResponse, Status>>;

    async fn stream_events(
        &self,
        request: Request<proto::StreamEventsRequest>,
    ) -> Result<Response<Self::StreamEventsStream>, Status> {
        let topic = request.into_inner().topic;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        let sender = tx.clone();
        let id = self.router.register(
            &topic,
            Arc::new(move |event| {
                let sender = sender.clone();
                async move {
                    sender
                        .send(Ok(proto::StreamEventsResponse {
                            event: Some(event_to_proto(event)),
                        }))
                        .await
                        .map_err(|_| anyhow::anyhow!("subscriber stream closed"))
                }
                .boxed()
            }),
        );

        // Guaranteed unregister on every exit path: the receiver half drops
        // whenever the stream terminates, which resolves `closed()`.
        let router = Arc::clone(&self.router);
        tokio::spawn(async move {
            tx.closed().await;
            router.unregister(&topic, id);
            tracing::debug!(%topic, id, "unregistered stream listener");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

fn error_to_status(err: Error) -> Status {
    match &err {
        Error::NotFound | Error::UnknownTopic(_) => Status::not_found(err.to_string()),
        Error::InvalidCron(_) => Status::invalid_argument(err.to_string()),
        Error::IntakeCapacityExceeded
        | Error::ShardCapacityExceeded
        | Error::DispatchCapacityExceeded => Status::resource_exhausted(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

/// Wire timestamps are unix seconds: sub-second precision ends here.
pub fn event_from_proto(event: proto::Event) -> Event {
    Event {
        id: event.id,
        cron_expression: event.cron_expression,
        should_execute_at: DateTime::from_timestamp(event.should_execute_at, 0)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        mode: match proto::EventMode::try_from(event.mode) {
            Ok(proto::EventMode::Cron) => Mode::Cron,
            _ => Mode::Timestamp,
        },
        topic: event.topic,
        payload: event.payload,
    }
}

pub fn event_to_proto(event: Event) -> proto::Event {
    proto::Event {
        id: event.id,
        cron_expression: event.cron_expression,
        should_execute_at: event.should_execute_at.timestamp(),
        mode: match event.mode {
            Mode::Timestamp => proto::EventMode::Timestamp,
            Mode::Cron => proto::EventMode::Cron,
        } as i32,
        topic: event.topic,
        payload: event.payload,
    }
}
