//! Postgres source of truth.
//!
//! Expected schema (owned by the authoring service):
//!
//! ```sql
//! CREATE TABLE configs (
//!     id          TEXT PRIMARY KEY,
//!     project_id  TEXT NOT NULL,
//!     name        TEXT NOT NULL,
//!     UNIQUE (project_id, name)
//! );
//! CREATE TABLE config_variants (
//!     id              TEXT PRIMARY KEY,
//!     config_id       TEXT NOT NULL REFERENCES configs (id) ON DELETE CASCADE,
//!     environment_id  TEXT NOT NULL,
//!     value           JSONB NOT NULL,
//!     overrides       JSONB,
//!     version         BIGINT NOT NULL,
//!     UNIQUE (config_id, environment_id)
//! );
//! ```
//!
//! `overrides` holds authored overrides with reference values; they are
//! rendered against the same project and environment before being returned.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::Instrument;

use super::pool::LazyPool;
use super::retry::{with_retry, RetryPolicy};
use super::{DumpFilter, ReplicaSource, Result, SourceError};
use crate::evaluator::{collect_references, render_overrides};
use crate::model::{Override, ReplicatedVariant};

const VARIANT_COLUMNS: &str = "v.id AS variant_id, c.name AS config_name, c.project_id, \
     v.environment_id, v.value, v.overrides, v.version";

/// A variant row with its overrides still authored.
#[derive(Debug, Clone)]
struct VariantRow {
    variant_id: String,
    config_name: String,
    project_id: String,
    environment_id: String,
    value: JsonValue,
    overrides: Vec<Override>,
    version: i64,
}

impl VariantRow {
    fn from_row(row: &PgRow) -> Result<Self> {
        let variant_id: String = row.try_get("variant_id")?;
        let overrides: Option<JsonValue> = row.try_get("overrides")?;
        let overrides = match overrides {
            None | Some(JsonValue::Null) => Vec::new(),
            Some(raw) => serde_json::from_value(raw).map_err(|e| SourceError::InvalidRow {
                id: variant_id.clone(),
                message: format!("overrides: {}", e),
            })?,
        };

        Ok(Self {
            config_name: row.try_get("config_name")?,
            project_id: row.try_get("project_id")?,
            environment_id: row.try_get("environment_id")?,
            value: row.try_get("value")?,
            version: row.try_get("version")?,
            overrides,
            variant_id,
        })
    }

    /// Renders references with `values`, keyed by `(project, environment, config name)`.
    ///
    /// References are resolved inside the variant's own project only; a
    /// reference into another project renders as unresolved.
    fn render(self, values: &HashMap<(String, String, String), JsonValue>) -> ReplicatedVariant {
        let references = self.local_references();
        let (project_id, environment_id) = (self.project_id.clone(), self.environment_id.clone());
        let overrides = render_overrides(&self.overrides, |reference| {
            if reference.project_id != project_id {
                log::warn!(
                    "Variant {} references config {} of foreign project {}",
                    self.variant_id,
                    reference.config_name,
                    reference.project_id
                );
                return None;
            }
            values
                .get(&(
                    project_id.clone(),
                    environment_id.clone(),
                    reference.config_name.clone(),
                ))
                .cloned()
        });
        ReplicatedVariant {
            variant_id: self.variant_id,
            config_name: self.config_name,
            project_id: self.project_id,
            environment_id: self.environment_id,
            value: self.value,
            overrides,
            version: self.version,
            references,
        }
    }

    /// Config names referenced within the variant's own project.
    fn local_references(&self) -> Vec<String> {
        let names: BTreeSet<String> = collect_references(&self.overrides)
            .into_iter()
            .filter(|reference| reference.project_id == self.project_id)
            .map(|reference| reference.config_name)
            .collect();
        names.into_iter().collect()
    }
}

/// Reads rendered variants from Postgres.
pub struct PgReplicaSource {
    pool: Arc<LazyPool>,
    retry: RetryPolicy,
    /// Restricts every query to one project.
    project_id: Option<String>,
}

impl PgReplicaSource {
    pub fn new(pool: Arc<LazyPool>) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
            project_id: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Only replicate `project_id`.
    pub fn scoped_to(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    fn scope<'a>(&'a self, filter: &'a DumpFilter) -> Option<&'a str> {
        filter.project_id.as_deref().or(self.project_id.as_deref())
    }

    async fn dump_once(&self, project_id: Option<&str>) -> Result<Vec<ReplicatedVariant>> {
        let pool = self.pool.get().await?;
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            "SELECT {} FROM config_variants v JOIN configs c ON c.id = v.config_id \
             WHERE ($1::text IS NULL OR c.project_id = $1) ORDER BY v.id",
            VARIANT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(project_id)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        let rows = rows
            .iter()
            .map(VariantRow::from_row)
            .collect::<Result<Vec<_>>>()?;

        // References never leave their project, so the dump itself holds
        // every value an override can point at.
        let values: HashMap<_, _> = rows
            .iter()
            .map(|row| {
                (
                    (
                        row.project_id.clone(),
                        row.environment_id.clone(),
                        row.config_name.clone(),
                    ),
                    row.value.clone(),
                )
            })
            .collect();

        Ok(rows.into_iter().map(|row| row.render(&values)).collect())
    }

    async fn fetch_rows(&self, ids: &[String]) -> Result<Vec<VariantRow>> {
        let pool = self.pool.get().await?;
        let sql = format!(
            "SELECT {} FROM config_variants v JOIN configs c ON c.id = v.config_id \
             WHERE v.id = ANY($1) AND ($2::text IS NULL OR c.project_id = $2)",
            VARIANT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(ids)
            .bind(self.project_id.as_deref())
            .fetch_all(pool)
            .await?;
        rows.iter().map(VariantRow::from_row).collect()
    }

    /// Loads the values referenced by `rows`.
    async fn referenced_values(
        &self,
        rows: &[VariantRow],
    ) -> Result<HashMap<(String, String, String), JsonValue>> {
        let mut wanted: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
        for row in rows {
            for name in row.local_references() {
                wanted
                    .entry((row.project_id.clone(), row.environment_id.clone()))
                    .or_default()
                    .insert(name);
            }
        }

        let mut values = HashMap::new();
        if wanted.is_empty() {
            return Ok(values);
        }

        let pool = self.pool.get().await?;
        for ((project_id, environment_id), names) in wanted {
            let names: Vec<String> = names.into_iter().collect();
            let found = sqlx::query(
                "SELECT c.name, v.value \
                 FROM config_variants v JOIN configs c ON c.id = v.config_id \
                 WHERE c.project_id = $1 AND v.environment_id = $2 AND c.name = ANY($3)",
            )
            .bind(&project_id)
            .bind(&environment_id)
            .bind(&names)
            .fetch_all(pool)
            .await?;

            for row in found {
                let name: String = row.try_get("name")?;
                let value: JsonValue = row.try_get("value")?;
                values.insert((project_id.clone(), environment_id.clone(), name), value);
            }
        }
        Ok(values)
    }

    async fn by_ids_once(&self, ids: &[String]) -> Result<Vec<ReplicatedVariant>> {
        let rows = self.fetch_rows(ids).await?;
        let values = self.referenced_values(&rows).await?;
        Ok(rows.into_iter().map(|row| row.render(&values)).collect())
    }
}

#[async_trait]
impl ReplicaSource for PgReplicaSource {
    async fn get_replica_dump(&self, filter: &DumpFilter) -> Result<Vec<ReplicatedVariant>> {
        let project_id = self.scope(filter);
        let span = tracing::info_span!("replica_dump", project = project_id.unwrap_or("*"));
        async {
            let variants = with_retry(&self.retry, "Replica dump", || self.dump_once(project_id))
                .await?;
            tracing::debug!(count = variants.len(), "Replica dump loaded");
            Ok::<_, SourceError>(variants)
        }
        .instrument(span)
        .await
    }

    async fn get_replica_config(&self, variant_id: &str) -> Result<Option<ReplicatedVariant>> {
        let ids = [variant_id.to_string()];
        let mut found = with_retry(&self.retry, "Variant fetch", || self.by_ids_once(&ids)).await?;
        Ok(found.pop())
    }

    async fn get_ids(&self, after: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        with_retry(&self.retry, "Variant id page", || async move {
            let pool = self.pool.get().await?;
            let rows = sqlx::query(
                "SELECT v.id FROM config_variants v JOIN configs c ON c.id = v.config_id \
                 WHERE ($1::text IS NULL OR v.id > $1) AND ($2::text IS NULL OR c.project_id = $2) \
                 ORDER BY v.id LIMIT $3",
            )
            .bind(after)
            .bind(self.project_id.as_deref())
            .bind(limit)
            .fetch_all(pool)
            .await?;
            rows.iter()
                .map(|row| row.try_get::<String, _>("id").map_err(SourceError::from))
                .collect()
        })
        .await
    }

    async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<ReplicatedVariant>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        with_retry(&self.retry, "Variant batch fetch", || self.by_ids_once(ids)).await
    }
}
