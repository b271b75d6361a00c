use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use redis::aio::ConnectionManager;

use super::Persistence;
use crate::event::Mode;
use crate::{Error, Event};

const KEY_PREFIX: &str = "schedulo_ns:";
/// The store stays authoritative; cache entries only live this long.
const ENTRY_TTL_SECS: i64 = 30 * 60;

#[derive(Debug, Clone)]
pub struct RedisCacheConfig {
    pub addr: String,
    pub pass: String,
    pub db: i64,
}

/// RedisCache holds hot copies of persisted events as hashes, one field per
/// event attribute, under `schedulo_ns:<id>`.
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(config: RedisCacheConfig) -> Result<Self, Error> {
        let url = if config.pass.is_empty() {
            format!("redis://{}/{}", config.addr, config.db)
        } else {
            format!("redis://:{}@{}/{}", config.pass, config.addr, config.db)
        };

        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;

        // Fail at startup rather than on first use.
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self { conn })
    }

    fn key(id: &str) -> String {
        format!("{KEY_PREFIX}{id}")
    }

    fn push_entry(pipe: &mut redis::Pipeline, event: &Event) {
        let key = Self::key(&event.id);
        let mut hset = redis::cmd("HSET");
        hset.arg(&key);
        for (field, value) in hash_fields(event) {
            hset.arg(field).arg(value);
        }
        pipe.add_command(hset).ignore();
        pipe.cmd("EXPIRE").arg(&key).arg(ENTRY_TTL_SECS).ignore();
    }
}

#[async_trait::async_trait]
impl Persistence for RedisCache {
    async fn add(&self, event: Event) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        Self::push_entry(&mut pipe, &event);
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn add_bulk(&self, events: &[Event]) -> Result<(), Error> {
        if events.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for event in events {
            Self::push_entry(&mut pipe, event);
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(Self::key(id))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Event, Error> {
        let mut conn = self.conn.clone();
        let key = Self::key(id);

        let exists: i64 = redis::cmd("EXISTS").arg(&key).query_async(&mut conn).await?;
        if exists == 0 {
            return Err(Error::NotFound);
        }

        let fields: HashMap<String, Vec<u8>> = redis::cmd("HGETALL")
            .arg(&key)
            .query_async(&mut conn)
            .await?;
        // The entry can expire between EXISTS and HGETALL.
        if fields.is_empty() {
            return Err(Error::NotFound);
        }

        event_from_hash(id, fields)
    }

    async fn get_all(&self) -> Result<Vec<Event>, Error> {
        Err(Error::NotImplemented)
    }
}

/// The hash representation of an event. Timestamps keep nanosecond precision
/// through an RFC 3339 encoding; the payload field is raw bytes.
fn hash_fields(event: &Event) -> [(&'static str, Vec<u8>); 5] {
    [
        (
            "cron_expression",
            event.cron_expression.clone().into_bytes(),
        ),
        (
            "should_execute_at",
            event
                .should_execute_at
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .into_bytes(),
        ),
        ("mode", event.mode.as_i16().to_string().into_bytes()),
        ("topic", event.topic.clone().into_bytes()),
        ("payload", event.payload.clone()),
    ]
}

fn event_from_hash(id: &str, mut fields: HashMap<String, Vec<u8>>) -> Result<Event, Error> {
    fn malformed(what: &'static str) -> Error {
        Error::Cache(redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "malformed cached event field",
            what.to_string(),
        )))
    }

    let mut text = |field: &str| -> String {
        String::from_utf8_lossy(&fields.remove(field).unwrap_or_default()).into_owned()
    };

    let cron_expression = text("cron_expression");
    let should_execute_at = DateTime::parse_from_rfc3339(&text("should_execute_at"))
        .map_err(|_| malformed("should_execute_at"))?
        .with_timezone(&Utc);
    let mode = Mode::from_i16(
        text("mode")
            .parse::<i16>()
            .map_err(|_| malformed("mode"))?,
    );
    let topic = text("topic");
    let payload = fields.remove("payload").unwrap_or_default();

    Ok(Event {
        id: id.to_string(),
        cron_expression,
        should_execute_at,
        mode,
        topic,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event() -> Event {
        Event {
            id: "8d9d2a0a-7a70-4d53-8ecb-2a30cbcd4b3a".to_string(),
            cron_expression: "0/4 * * * * *".to_string(),
            should_execute_at: Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap(),
            mode: Mode::Cron,
            topic: "billing".to_string(),
            payload: vec![0x00, 0x01, 0xfe, 0xff],
        }
    }

    #[test]
    fn hash_round_trip_preserves_every_field() {
        let original = event();
        let fields: HashMap<String, Vec<u8>> = hash_fields(&original)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let decoded = event_from_hash(&original.id, fields).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn timestamp_keeps_nanosecond_precision() {
        let original = event();
        let fields: HashMap<String, Vec<u8>> = hash_fields(&original)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let decoded = event_from_hash(&original.id, fields).unwrap();
        assert_eq!(
            decoded.should_execute_at.timestamp_subsec_nanos(),
            123_456_789
        );
    }

    #[test]
    fn malformed_timestamp_is_an_error() {
        let mut fields: HashMap<String, Vec<u8>> = hash_fields(&event())
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        fields.insert("should_execute_at".to_string(), b"yesterday".to_vec());

        assert!(event_from_hash("some-id", fields).is_err());
    }
}
