//! Durable, append-only change log with checkpointed consumers.
//!
//! Events are rows in the local database. A consumer is a named checkpoint
//! (`last_acked_seq`) on one topic. Pruning old events also destroys every
//! consumer that had not acknowledged them yet, since it could no longer
//! catch up from the log alone.

pub mod replicator;

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use thiserror::Error;

use crate::db::{Database, DatabaseError};

pub use replicator::{
    BootstrapOutcome, DeleteResult, FatalHook, Replicator, ReplicatorError, ReplicatorSettings,
    ReplicatorSignal, ReplicatorTarget, StepOutcome, UpsertReport, UpsertResult,
};

/// Errors from the event log.
#[derive(Error, Debug)]
pub enum EventLogError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// The consumer was destroyed, usually by pruning.
    #[error("Consumer '{0}' no longer exists")]
    ConsumerNotFound(String),
}

impl From<rusqlite::Error> for EventLogError {
    fn from(err: rusqlite::Error) -> Self {
        EventLogError::Database(DatabaseError::Sqlite(err))
    }
}

pub type Result<T> = std::result::Result<T, EventLogError>;

/// One entry of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub seq: i64,
    pub topic: String,
    pub entity_id: String,
    pub created_at: DateTime<Utc>,
}

/// What [`EventLog::prune`] removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub events_deleted: usize,
    pub consumers_destroyed: usize,
}

impl PruneReport {
    /// Nothing was removed.
    pub fn is_empty(&self) -> bool {
        self.events_deleted == 0 && self.consumers_destroyed == 0
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    // Fixed width, so stored timestamps compare correctly as text.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            EventLogError::Database(DatabaseError::CorruptRow {
                table: "topic_events",
                reason: format!("bad timestamp '{}': {}", raw, e),
            })
        })
}

/// The log as a whole.
#[derive(Clone)]
pub struct EventLog {
    db: Database,
}

impl EventLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn topic(&self, name: &str) -> Topic {
        Topic {
            db: self.db.clone(),
            name: name.to_string(),
        }
    }

    /// Deletes events older than `retention` and the consumers that still
    /// needed them.
    pub fn prune(&self, retention: Duration) -> Result<PruneReport> {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.prune_before(cutoff)
    }

    /// Deletes events created before `cutoff`.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<PruneReport> {
        let cutoff = timestamp(cutoff);
        let report = self.db.with_transaction(|tx| {
            let consumers_destroyed = tx.execute(
                "DELETE FROM consumers WHERE last_acked_seq < (
                    SELECT MAX(e.seq) FROM topic_events e
                    WHERE e.topic = consumers.topic AND e.created_at < ?1
                )",
                params![cutoff],
            )?;
            let events_deleted =
                tx.execute("DELETE FROM topic_events WHERE created_at < ?1", params![cutoff])?;
            Ok(PruneReport {
                events_deleted,
                consumers_destroyed,
            })
        })?;

        if report.consumers_destroyed > 0 {
            log::warn!(
                "Event log pruning destroyed {} lagging consumers",
                report.consumers_destroyed
            );
        }
        log::debug!("Pruned {} events", report.events_deleted);
        Ok(report)
    }
}

/// A named stream of entity ids.
#[derive(Clone)]
pub struct Topic {
    db: Database,
    name: String,
}

impl Topic {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends one event per entity id and returns the last sequence number.
    pub fn publish<I, S>(&self, entity_ids: I) -> Result<Option<i64>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let now = timestamp(Utc::now());
        let last = self.db.with_transaction(|tx| {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO topic_events (topic, entity_id, created_at) VALUES (?1, ?2, ?3)",
            )?;
            let mut last = None;
            for id in entity_ids {
                stmt.execute(params![self.name, id.as_ref(), now])?;
                last = Some(tx.last_insert_rowid());
            }
            Ok(last)
        })?;
        Ok(last)
    }

    /// Highest sequence number in the log, 0 when empty.
    pub fn head(&self) -> Result<i64> {
        let head = self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM topic_events", [], |r| {
                r.get(0)
            })?)
        })?;
        Ok(head)
    }

    /// Registers a consumer positioned at the current end of the log.
    pub fn create_consumer(&self) -> Result<Consumer> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = timestamp(Utc::now());
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO consumers (id, topic, last_acked_seq, created_at, updated_at)
                 VALUES (?1, ?2, (SELECT COALESCE(MAX(seq), 0) FROM topic_events), ?3, ?3)",
                params![id, self.name, now],
            )?;
            Ok(())
        })?;

        log::info!("Created consumer {} on topic '{}'", id, self.name);
        Ok(Consumer {
            db: self.db.clone(),
            topic: self.name.clone(),
            id,
        })
    }

    /// Reattaches to an existing consumer; `None` if the log forgot it.
    pub fn restore_consumer(&self, id: &str) -> Result<Option<Consumer>> {
        let exists = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT 1 FROM consumers WHERE id = ?1 AND topic = ?2",
                    params![id, self.name],
                    |_| Ok(()),
                )
                .optional()?
                .is_some())
        })?;

        Ok(exists.then(|| Consumer {
            db: self.db.clone(),
            topic: self.name.clone(),
            id: id.to_string(),
        }))
    }

    /// Removes a consumer. Returns false if it did not exist.
    pub fn destroy_consumer(&self, id: &str) -> Result<bool> {
        let removed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM consumers WHERE id = ?1 AND topic = ?2",
                params![id, self.name],
            )?)
        })?;
        Ok(removed > 0)
    }
}

/// A checkpointed reader of one topic.
pub struct Consumer {
    db: Database,
    topic: String,
    id: String,
}

impl Consumer {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Last acknowledged sequence number.
    pub fn position(&self) -> Result<i64> {
        let position = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT last_acked_seq FROM consumers WHERE id = ?1",
                    params![self.id],
                    |r| r.get::<_, i64>(0),
                )
                .optional()?)
        })?;
        position.ok_or_else(|| EventLogError::ConsumerNotFound(self.id.clone()))
    }

    /// Up to `limit` unacknowledged events, oldest first.
    pub fn pull(&self, limit: usize) -> Result<Vec<LogEvent>> {
        let position = self.position()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT seq, topic, entity_id, created_at FROM topic_events
                 WHERE topic = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![self.topic, position, limit], |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(seq, topic, entity_id, created_at)| {
                Ok(LogEvent {
                    seq,
                    topic,
                    entity_id,
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect()
    }

    /// Acknowledges every event up to and including `seq`.
    ///
    /// The checkpoint never moves backwards.
    pub fn ack(&self, seq: i64) -> Result<()> {
        let now = timestamp(Utc::now());
        let updated = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE consumers SET last_acked_seq = MAX(last_acked_seq, ?1), updated_at = ?2
                 WHERE id = ?3",
                params![seq, now, self.id],
            )?)
        })?;
        if updated == 0 {
            return Err(EventLogError::ConsumerNotFound(self.id.clone()));
        }
        Ok(())
    }
}
