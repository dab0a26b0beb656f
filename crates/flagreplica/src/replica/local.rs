//! Durable replica target: SQLite rows mirrored into the in-memory store.
//!
//! Every change is classified against the store, persisted, then applied to
//! the store, so readers never see data that is not on disk yet.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::store::{ReplicaStore, UpsertOutcome};
use crate::db::{Database, DatabaseError};
use crate::eventlog::{DeleteResult, ReplicatorTarget, UpsertReport, UpsertResult};
use crate::model::{ReplicatedVariant, VariantKey};

/// Local, restart-surviving copy of the replica.
pub struct LocalReplica {
    db: Database,
    store: Arc<ReplicaStore>,
}

impl LocalReplica {
    /// Loads the persisted variants into `store`.
    pub fn open(db: Database, store: Arc<ReplicaStore>) -> Result<Self, DatabaseError> {
        let variants = load_variants(&db)?;
        let count = variants.len();
        store.replace_all(variants);
        log::info!("Loaded {} variants from the local replica", count);
        Ok(Self { db, store })
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.store
    }
}

fn load_variants(db: &Database) -> Result<Vec<ReplicatedVariant>, DatabaseError> {
    let bodies = db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT variant_id, body FROM replica_variants")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;

    bodies
        .into_iter()
        .map(|(id, body)| {
            serde_json::from_str(&body).map_err(|e| DatabaseError::CorruptRow {
                table: "replica_variants",
                reason: format!("variant {}: {}", id, e),
            })
        })
        .collect()
}

fn upsert_result(outcome: UpsertOutcome) -> UpsertResult {
    match outcome {
        UpsertOutcome::Created => UpsertResult::Created,
        UpsertOutcome::Updated => UpsertResult::Updated,
        UpsertOutcome::Spurious | UpsertOutcome::Stale => UpsertResult::Ignored,
    }
}

impl ReplicatorTarget for LocalReplica {
    fn replicator_consumer_id(&self) -> Result<Option<String>, DatabaseError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT consumer_id FROM replicator_state WHERE id = 1",
                    [],
                    |r| r.get(0),
                )
                .optional()?)
        })
    }

    fn insert_replicator_consumer_id(&self, consumer_id: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO replicator_state (id, consumer_id, created_at)
                 VALUES (1, ?1, ?2)",
                params![consumer_id, now],
            )?;
            Ok(())
        })
    }

    fn upsert(&self, entities: Vec<ReplicatedVariant>) -> Result<Vec<UpsertReport>, DatabaseError> {
        let classified: Vec<(UpsertOutcome, ReplicatedVariant)> = entities
            .into_iter()
            .map(|entity| (self.store.classify(&entity), entity))
            .collect();

        let now = Utc::now().to_rfc3339();
        self.db.with_transaction(|tx| {
            let mut evict = tx.prepare_cached(
                "DELETE FROM replica_variants
                 WHERE project_id = ?1 AND config_name = ?2 AND environment_id = ?3
                   AND variant_id <> ?4",
            )?;
            let mut write = tx.prepare_cached(
                "INSERT INTO replica_variants
                    (variant_id, project_id, config_name, environment_id, body, version, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (variant_id) DO UPDATE SET
                    project_id = excluded.project_id,
                    config_name = excluded.config_name,
                    environment_id = excluded.environment_id,
                    body = excluded.body,
                    version = excluded.version,
                    updated_at = excluded.updated_at",
            )?;

            for (outcome, entity) in &classified {
                if !outcome.is_change() {
                    continue;
                }
                let body = serde_json::to_string(entity).map_err(|e| DatabaseError::CorruptRow {
                    table: "replica_variants",
                    reason: format!("variant {}: {}", entity.variant_id, e),
                })?;
                evict.execute(params![
                    entity.project_id,
                    entity.config_name,
                    entity.environment_id,
                    entity.variant_id
                ])?;
                write.execute(params![
                    entity.variant_id,
                    entity.project_id,
                    entity.config_name,
                    entity.environment_id,
                    body,
                    entity.version,
                    now
                ])?;
            }
            Ok(())
        })?;

        Ok(classified
            .into_iter()
            .map(|(_, entity)| {
                let applied = self.store.upsert(entity);
                UpsertReport {
                    result: upsert_result(applied.outcome),
                    entity: applied.entity,
                    displaced: applied.displaced,
                }
            })
            .collect())
    }

    fn delete(&self, variant_id: &str) -> Result<DeleteResult, DatabaseError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM replica_variants WHERE variant_id = ?1",
                params![variant_id],
            )?;
            Ok(())
        })?;

        Ok(match self.store.delete_by_id(variant_id) {
            Some(entity) => DeleteResult::Deleted(entity),
            None => DeleteResult::Ignored,
        })
    }

    fn variant_ids(&self) -> Result<Vec<String>, DatabaseError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT variant_id FROM replica_variants ORDER BY variant_id")?;
            let ids = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    fn dependent_ids(&self, key: &VariantKey) -> Vec<String> {
        self.store
            .dependents(key)
            .iter()
            .map(|dependent| dependent.variant_id.clone())
            .collect()
    }

    fn clear(&self) -> Result<(), DatabaseError> {
        self.db.with_transaction(|tx| {
            tx.execute("DELETE FROM replica_variants", [])?;
            tx.execute("DELETE FROM replicator_state", [])?;
            Ok(())
        })?;
        let removed = self.store.clear();
        log::info!("Cleared local replica ({} variants)", removed.len());
        Ok(())
    }
}
