use chrono::{DateTime, Utc};

/// Id is the opaque, UUID-shaped identity assigned to an event by the
/// scheduler. It is empty on input and unique once scheduled.
pub type Id = String;

/// Mode selects how an event's firing time is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i16)]
pub enum Mode {
    /// Fire once at `should_execute_at`.
    Timestamp = 0,
    /// Re-fire on every match of `cron_expression`.
    Cron = 1,
}

impl Mode {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(mode: i16) -> Self {
        match mode {
            1 => Mode::Cron,
            _ => Mode::Timestamp,
        }
    }
}

/// Event is the external form of a scheduled unit of work, as submitted by
/// callers and as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: Id,
    /// Meaningful only in [`Mode::Cron`].
    pub cron_expression: String,
    pub should_execute_at: DateTime<Utc>,
    pub mode: Mode,
    /// Channel on which the event is dispatched. Empty means broadcast.
    pub topic: String,
    pub payload: Vec<u8>,
}

/// EventRecord is the in-memory header kept in the shards: a strict subset
/// of [`Event`]. Payload and topic stay in persistence and are re-fetched at
/// dispatch time, keeping the pending footprint small.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub id: Id,
    pub cron_expression: String,
    pub should_execute_at: DateTime<Utc>,
    pub mode: Mode,
}

impl From<&Event> for EventRecord {
    fn from(e: &Event) -> Self {
        Self {
            id: e.id.clone(),
            cron_expression: e.cron_expression.clone(),
            should_execute_at: e.should_execute_at,
            mode: e.mode,
        }
    }
}
