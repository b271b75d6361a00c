//! Client library for the `schedulo.Scheduler` service: schedule and
//! unschedule events, and subscribe to a topic's fired-event stream.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use proto_schedulo::schedulo as proto;
use proto_schedulo::schedulo::scheduler_client::SchedulerClient;
use schedulo::{Event, Id, Mode};
use tonic::transport::{Channel, Endpoint};

/// Deadline applied to the dial and to each RPC.
const RPC_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid gRPC endpoint: '{0}'")]
    InvalidEndpoint(String),
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
    #[error(transparent)]
    Grpc(#[from] tonic::Status),
    #[error("{0}")]
    Protocol(&'static str),
}

/// Typed wrapper over the generated scheduler client.
#[derive(Debug, Clone)]
pub struct Client {
    inner: SchedulerClient<Channel>,
}

impl Client {
    /// Connect to a scheduler endpoint, e.g. `http://127.0.0.1:9876`.
    pub async fn connect(addr: &str) -> Result<Self, Error> {
        let endpoint = Endpoint::from_shared(addr.to_string())
            .map_err(|_| Error::InvalidEndpoint(addr.to_string()))?
            .connect_timeout(RPC_TIMEOUT)
            .timeout(RPC_TIMEOUT);
        let channel = endpoint.connect().await?;

        Ok(Self {
            inner: SchedulerClient::new(channel),
        })
    }

    /// Schedule an event and return its assigned id.
    pub async fn schedule(&mut self, event: Event) -> Result<Id, Error> {
        let response = self
            .inner
            .schedule(proto::ScheduleRequest {
                event: Some(event_to_proto(event)),
            })
            .await?;
        Ok(response.into_inner().id)
    }

    pub async fn unschedule(&mut self, id: &str) -> Result<(), Error> {
        self.inner
            .unschedule(proto::UnscheduleRequest { id: id.to_string() })
            .await?;
        Ok(())
    }

    /// Open a server-side stream of events fired on `topic`. The listener
    /// stays registered until the returned stream is dropped.
    pub async fn stream_events(
        &mut self,
        topic: &str,
    ) -> Result<impl Stream<Item = Result<Event, Error>>, Error> {
        let stream = self
            .inner
            .stream_events(proto::StreamEventsRequest {
                topic: topic.to_string(),
            })
            .await?
            .into_inner();

        Ok(stream.map(|item| match item {
            Err(status) => Err(Error::Grpc(status)),
            Ok(response) => response
                .event
                .map(event_from_proto)
                .ok_or(Error::Protocol("stream response carried no event")),
        }))
    }
}

fn event_to_proto(event: Event) -> proto::Event {
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

fn event_from_proto(event: proto::Event) -> Event {
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
