use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use super::Persistence;
use crate::event::Mode;
use crate::{Error, Event};

// Sized off the driver default of 10 connections: 0.8x open, ~0.35x idle.
const MAX_OPEN_CONNS: u32 = 8;
const MIN_IDLE_CONNS: u32 = 2;
const MAX_CONN_LIFETIME: Duration = Duration::from_secs(15 * 60);

const POSTGRES_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS migrations (
        id INT PRIMARY KEY,
        created_at TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS events (
        id CHAR(36) PRIMARY KEY,
        cron_expression TEXT,
        should_execute_at TIMESTAMP,
        mode SMALLINT,
        topic VARCHAR(255),
        payload BYTEA
    );",
];

const MYSQL_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS migrations (
        id INT PRIMARY KEY,
        created_at DATETIME(6)
    );",
    "CREATE TABLE IF NOT EXISTS events (
        id CHAR(36) PRIMARY KEY,
        cron_expression TEXT,
        should_execute_at DATETIME(6),
        mode SMALLINT,
        topic VARCHAR(255),
        payload BLOB
    );",
];

struct Migration {
    id: i32,
    postgres: &'static str,
    mysql: &'static str,
    /// MySQL has no `ADD COLUMN IF NOT EXISTS`: when this query returns a
    /// row, the statement is already in place and is skipped.
    mysql_applied_check: Option<&'static str>,
}

/// Declarative migrations, keyed by integer. On startup everything past the
/// recorded high-water mark runs in order inside one transaction.
const MIGRATIONS: &[Migration] = &[Migration {
    id: 1,
    postgres: "ALTER TABLE events ADD COLUMN IF NOT EXISTS topic VARCHAR(255);",
    mysql: "ALTER TABLE events ADD COLUMN topic VARCHAR(255);",
    mysql_applied_check: Some(
        "SELECT 1 FROM information_schema.columns
         WHERE table_schema = DATABASE()
           AND table_name = 'events'
           AND column_name = 'topic'",
    ),
}];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    Postgres,
    MySql,
}

impl FromStr for Driver {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgres" => Ok(Driver::Postgres),
            "mysql" => Ok(Driver::MySql),
            other => Err(Error::UnsupportedDriver(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqlStoreConfig {
    pub url: String,
    pub driver: Driver,
}

enum Db {
    Postgres(PgPool),
    MySql(MySqlPool),
}

/// SqlStore is the authoritative event store, wired through to the cache on
/// every mutation so reads can be served hot.
pub struct SqlStore {
    db: Db,
    cache: Arc<dyn Persistence>,
}

impl SqlStore {
    /// Connect, create the schema if absent, and run pending migrations.
    pub async fn connect(
        cache: Arc<dyn Persistence>,
        config: SqlStoreConfig,
    ) -> Result<Self, Error> {
        let db = match config.driver {
            Driver::Postgres => Db::Postgres(
                PgPoolOptions::new()
                    .max_connections(MAX_OPEN_CONNS)
                    .min_connections(MIN_IDLE_CONNS)
                    .max_lifetime(MAX_CONN_LIFETIME)
                    .connect(&config.url)
                    .await?,
            ),
            Driver::MySql => Db::MySql(
                MySqlPoolOptions::new()
                    .max_connections(MAX_OPEN_CONNS)
                    .min_connections(MIN_IDLE_CONNS)
                    .max_lifetime(MAX_CONN_LIFETIME)
                    .connect(&config.url)
                    .await?,
            ),
        };

        let store = Self { db, cache };
        store.init_schema().await?;
        store.run_migrations().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), Error> {
        match &self.db {
            Db::Postgres(pool) => {
                for statement in POSTGRES_SCHEMA {
                    sqlx::query(statement).execute(pool).await?;
                }
            }
            Db::MySql(pool) => {
                for statement in MYSQL_SCHEMA {
                    sqlx::query(statement).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    async fn run_migrations(&self) -> Result<(), Error> {
        let applied = self.applied_migration().await?;
        let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.id > applied).collect();
        let Some(high_water) = pending.last().map(|m| m.id) else {
            return Ok(());
        };

        match &self.db {
            Db::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                for migration in &pending {
                    sqlx::query(migration.postgres).execute(&mut tx).await?;
                }
                sqlx::query("INSERT INTO migrations (id, created_at) VALUES ($1, $2)")
                    .bind(high_water)
                    .bind(chrono::Utc::now().naive_utc())
                    .execute(&mut tx)
                    .await?;
                tx.commit().await?;
            }
            Db::MySql(pool) => {
                let mut tx = pool.begin().await?;
                for migration in &pending {
                    if let Some(check) = migration.mysql_applied_check {
                        if sqlx::query(check).fetch_optional(&mut tx).await?.is_some() {
                            continue;
                        }
                    }
                    sqlx::query(migration.mysql).execute(&mut tx).await?;
                }
                sqlx::query("INSERT INTO migrations (id, created_at) VALUES (?, ?)")
                    .bind(high_water)
                    .bind(chrono::Utc::now().naive_utc())
                    .execute(&mut tx)
                    .await?;
                tx.commit().await?;
            }
        }

        tracing::info!(high_water, "applied pending schema migrations");
        Ok(())
    }

    async fn applied_migration(&self) -> Result<i32, Error> {
        let query = "SELECT id FROM migrations ORDER BY created_at DESC LIMIT 1";
        let id = match &self.db {
            Db::Postgres(pool) => sqlx::query(query)
                .fetch_optional(pool)
                .await?
                .map(|row| row.try_get::<i32, _>("id"))
                .transpose()?,
            Db::MySql(pool) => sqlx::query(query)
                .fetch_optional(pool)
                .await?
                .map(|row| row.try_get::<i32, _>("id"))
                .transpose()?,
        };
        Ok(id.unwrap_or(0))
    }
}

#[async_trait::async_trait]
impl Persistence for SqlStore {
    async fn add(&self, event: Event) -> Result<(), Error> {
        match &self.db {
            Db::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                sqlx::query(
                    "INSERT INTO events (id, cron_expression, should_execute_at, mode, topic, payload)
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(&event.id)
                .bind(&event.cron_expression)
                .bind(event.should_execute_at.naive_utc())
                .bind(event.mode.as_i16())
                .bind(&event.topic)
                .bind(&event.payload)
                .execute(&mut tx)
                .await?;

                // A cache failure drops the transaction, rolling the row back.
                self.cache.add(event).await?;
                tx.commit().await?;
            }
            Db::MySql(pool) => {
                let mut tx = pool.begin().await?;
                sqlx::query(
                    "INSERT INTO events (id, cron_expression, should_execute_at, mode, topic, payload)
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(&event.id)
                .bind(&event.cron_expression)
                .bind(event.should_execute_at.naive_utc())
                .bind(event.mode.as_i16())
                .bind(&event.topic)
                .bind(&event.payload)
                .execute(&mut tx)
                .await?;

                self.cache.add(event).await?;
                tx.commit().await?;
            }
        }
        Ok(())
    }

    async fn add_bulk(&self, events: &[Event]) -> Result<(), Error> {
        if events.is_empty() {
            return Ok(());
        }

        match &self.db {
            // Single-round-trip array insert; the Postgres analog of COPY for
            // batches of this size.
            Db::Postgres(pool) => {
                let ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
                let crons: Vec<String> =
                    events.iter().map(|e| e.cron_expression.clone()).collect();
                let ats: Vec<NaiveDateTime> = events
                    .iter()
                    .map(|e| e.should_execute_at.naive_utc())
                    .collect();
                let modes: Vec<i16> = events.iter().map(|e| e.mode.as_i16()).collect();
                let topics: Vec<String> = events.iter().map(|e| e.topic.clone()).collect();
                let payloads: Vec<Vec<u8>> = events.iter().map(|e| e.payload.clone()).collect();

                let mut tx = pool.begin().await?;
                sqlx::query(
                    "INSERT INTO events (id, cron_expression, should_execute_at, mode, topic, payload)
                     SELECT * FROM UNNEST($1::text[], $2::text[], $3::timestamp[], $4::smallint[], $5::text[], $6::bytea[])",
                )
                .bind(&ids)
                .bind(&crons)
                .bind(&ats)
                .bind(&modes)
                .bind(&topics)
                .bind(&payloads)
                .execute(&mut tx)
                .await?;
                tx.commit().await?;
            }
            // One parameterized multi-row INSERT.
            Db::MySql(pool) => {
                let mut builder = sqlx::QueryBuilder::<sqlx::MySql>::new(
                    "INSERT INTO events (id, cron_expression, should_execute_at, mode, topic, payload) ",
                );
                builder.push_values(events, |mut row, event| {
                    row.push_bind(event.id.clone())
                        .push_bind(event.cron_expression.clone())
                        .push_bind(event.should_execute_at.naive_utc())
                        .push_bind(event.mode.as_i16())
                        .push_bind(event.topic.clone())
                        .push_bind(event.payload.clone());
                });

                let mut tx = pool.begin().await?;
                builder.build().execute(&mut tx).await?;
                tx.commit().await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), Error> {
        match &self.db {
            Db::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                sqlx::query("DELETE FROM events WHERE id = $1")
                    .bind(id)
                    .execute(&mut tx)
                    .await?;
                self.cache.delete(id).await?;
                tx.commit().await?;
            }
            Db::MySql(pool) => {
                let mut tx = pool.begin().await?;
                sqlx::query("DELETE FROM events WHERE id = ?")
                    .bind(id)
                    .execute(&mut tx)
                    .await?;
                self.cache.delete(id).await?;
                tx.commit().await?;
            }
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Event, Error> {
        match self.cache.get(id).await {
            Ok(event) => return Ok(event),
            Err(Error::NotFound) => {}
            Err(err) => return Err(err),
        }

        let event = match &self.db {
            Db::Postgres(pool) => {
                let row = sqlx::query(
                    "SELECT id, cron_expression, should_execute_at, mode, topic, payload
                     FROM events WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(pool)
                .await?;
                match row {
                    None => return Err(Error::NotFound),
                    Some(row) => pg_event(&row)?,
                }
            }
            Db::MySql(pool) => {
                let row = sqlx::query(
                    "SELECT id, cron_expression, should_execute_at, mode, topic, payload
                     FROM events WHERE id = ?",
                )
                .bind(id)
                .fetch_optional(pool)
                .await?;
                match row {
                    None => return Err(Error::NotFound),
                    Some(row) => mysql_event(&row)?,
                }
            }
        };

        // Cache miss with a store hit: re-populate before returning.
        self.cache.add(event.clone()).await?;
        Ok(event)
    }

    async fn get_all(&self) -> Result<Vec<Event>, Error> {
        let query = "SELECT id, cron_expression, should_execute_at, mode, topic, payload FROM events";

        let events: Vec<Event> = match &self.db {
            Db::Postgres(pool) => sqlx::query(query)
                .fetch_all(pool)
                .await?
                .iter()
                .map(pg_event)
                .collect::<Result<_, _>>()?,
            Db::MySql(pool) => sqlx::query(query)
                .fetch_all(pool)
                .await?
                .iter()
                .map(mysql_event)
                .collect::<Result<_, _>>()?,
        };

        self.cache.add_bulk(&events).await?;
        Ok(events)
    }
}

fn pg_event(row: &PgRow) -> Result<Event, sqlx::Error> {
    Ok(Event {
        id: row.try_get::<String, _>("id")?.trim_end().to_string(),
        cron_expression: row.try_get("cron_expression")?,
        should_execute_at: row.try_get::<NaiveDateTime, _>("should_execute_at")?.and_utc(),
        mode: Mode::from_i16(row.try_get("mode")?),
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
    })
}

fn mysql_event(row: &MySqlRow) -> Result<Event, sqlx::Error> {
    Ok(Event {
        id: row.try_get::<String, _>("id")?.trim_end().to_string(),
        cron_expression: row.try_get("cron_expression")?,
        should_execute_at: row.try_get::<NaiveDateTime, _>("should_execute_at")?.and_utc(),
        mode: Mode::from_i16(row.try_get("mode")?),
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
    })
}

// The #[sqlx::test] cases run against a managed test database reachable
// through DATABASE_URL; run them per dialect with `cargo test -- --ignored`.
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory stand-in for the Redis tier, so the write-through paths are
    /// observable without a cache server.
    #[derive(Default)]
    struct TestCache {
        events: Mutex<HashMap<String, Event>>,
    }

    #[async_trait::async_trait]
    impl Persistence for TestCache {
        async fn add(&self, event: Event) -> Result<(), Error> {
            self.events.lock().unwrap().insert(event.id.clone(), event);
            Ok(())
        }

        async fn add_bulk(&self, events: &[Event]) -> Result<(), Error> {
            let mut map = self.events.lock().unwrap();
            for event in events {
                map.insert(event.id.clone(), event.clone());
            }
            Ok(())
        }

        async fn delete(&self, id: &str) -> Result<(), Error> {
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
            Err(Error::NotImplemented)
        }
    }

    fn store(db: Db) -> SqlStore {
        SqlStore {
            db,
            cache: Arc::new(TestCache::default()),
        }
    }

    fn event(id: &str, topic: &str) -> Event {
        Event {
            id: id.to_string(),
            cron_expression: String::new(),
            // Whole seconds: TIMESTAMP/DATETIME round-trip exactly.
            should_execute_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            mode: Mode::Timestamp,
            topic: topic.to_string(),
            payload: b"payload".to_vec(),
        }
    }

    const ID_A: &str = "aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaaa";
    const ID_B: &str = "bbbbbbbb-bbbb-4bbb-8bbb-bbbbbbbbbbbb";

    #[sqlx::test(migrations = false)]
    #[ignore = "exercises a live Postgres server through DATABASE_URL"]
    async fn postgres_bootstrap_is_idempotent_and_rows_round_trip(
        pool: sqlx::PgPool,
    ) -> Result<(), Error> {
        let store = store(Db::Postgres(pool));
        store.init_schema().await?;
        store.run_migrations().await?;

        // A second boot against the same database is a no-op.
        store.init_schema().await?;
        store.run_migrations().await?;
        assert_eq!(
            store.applied_migration().await?,
            MIGRATIONS.last().unwrap().id
        );

        store.add_bulk(&[event(ID_A, "jobs"), event(ID_B, "billing")]).await?;

        // add_bulk does not pre-warm the cache, so this get takes the
        // cache-miss path and re-populates it from the store.
        let fetched = store.get(ID_A).await?;
        assert_eq!(fetched, event(ID_A, "jobs"));
        assert_eq!(store.cache.get(ID_A).await?, fetched);

        assert_eq!(store.get_all().await?.len(), 2);

        store.delete(ID_A).await?;
        assert!(matches!(store.get(ID_A).await, Err(Error::NotFound)));
        Ok(())
    }

    #[sqlx::test(migrations = false)]
    #[ignore = "exercises a live Postgres server through DATABASE_URL"]
    async fn postgres_migration_heals_a_pre_topic_schema(
        pool: sqlx::PgPool,
    ) -> Result<(), Error> {
        sqlx::query("CREATE TABLE migrations (id INT PRIMARY KEY, created_at TIMESTAMP)")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE TABLE events (
                id CHAR(36) PRIMARY KEY,
                cron_expression TEXT,
                should_execute_at TIMESTAMP,
                mode SMALLINT,
                payload BYTEA
            )",
        )
        .execute(&pool)
        .await?;

        let store = store(Db::Postgres(pool.clone()));
        store.run_migrations().await?;

        assert_eq!(store.applied_migration().await?, 1);
        sqlx::query("SELECT topic FROM events").fetch_all(&pool).await?;

        store.add(event(ID_A, "jobs")).await?;
        Ok(())
    }

    #[sqlx::test(migrations = false)]
    #[ignore = "exercises a live MySQL server through DATABASE_URL"]
    async fn mysql_bootstrap_is_idempotent_and_rows_round_trip(
        pool: sqlx::MySqlPool,
    ) -> Result<(), Error> {
        let store = store(Db::MySql(pool));
        store.init_schema().await?;
        store.run_migrations().await?;

        store.init_schema().await?;
        store.run_migrations().await?;
        assert_eq!(
            store.applied_migration().await?,
            MIGRATIONS.last().unwrap().id
        );

        store.add_bulk(&[event(ID_A, "jobs"), event(ID_B, "billing")]).await?;

        let fetched = store.get(ID_A).await?;
        assert_eq!(fetched, event(ID_A, "jobs"));
        assert_eq!(store.cache.get(ID_A).await?, fetched);

        assert_eq!(store.get_all().await?.len(), 2);

        store.delete(ID_A).await?;
        assert!(matches!(store.get(ID_A).await, Err(Error::NotFound)));
        Ok(())
    }

    #[sqlx::test(migrations = false)]
    #[ignore = "exercises a live MySQL server through DATABASE_URL"]
    async fn mysql_migration_heals_a_pre_topic_schema(
        pool: sqlx::MySqlPool,
    ) -> Result<(), Error> {
        sqlx::query("CREATE TABLE migrations (id INT PRIMARY KEY, created_at DATETIME(6))")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE TABLE events (
                id CHAR(36) PRIMARY KEY,
                cron_expression TEXT,
                should_execute_at DATETIME(6),
                mode SMALLINT,
                payload BLOB
            )",
        )
        .execute(&pool)
        .await?;

        let store = store(Db::MySql(pool.clone()));
        store.run_migrations().await?;

        assert_eq!(store.applied_migration().await?, 1);
        sqlx::query("SELECT topic FROM events").fetch_all(&pool).await?;

        store.add(event(ID_A, "jobs")).await?;
        Ok(())
    }
}
