//! Postgres-backed dataset catalog
//!
//! Feature rows, layers and dataset versions. Activation serializes on a
//! per-country transaction-scoped advisory lock; the partial unique index on
//! `dataset_versions (country_iso) WHERE is_active` backs it up. The new
//! layer is inserted in the same transaction, replacing any layer of the same
//! version and admin level, so readers never see a half-swapped version.

use async_trait::async_trait;
use gisdash_common::types::CountryCode;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};
use uuid::Uuid;

use crate::features::shared::error_helpers::{check_constraint_violation, ConstraintViolation};
use crate::ingest::error::StoreError;
use crate::ingest::loader::FeatureStore;
use crate::ingest::models::{DatasetVersion, FeatureRecord, Layer};
use crate::ingest::publisher::{Activation, VersionCatalog};

pub const VERSION_COLUMNS: &str = "id, country_iso, title, is_active, activated_at, created_at";

pub const LAYER_COLUMNS: &str = "id, version_id, admin_level, format, crs, source_bucket, \
     source_path, checksum, feature_count, created_at";

/// Advisory lock key shared by every activation of one country
fn activation_lock_key(country: &CountryCode) -> String {
    format!("dataset_versions:{}", country)
}

#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_version(&self, version_id: &str) -> Result<Option<DatasetVersion>, StoreError> {
        let sql = format!("SELECT {} FROM dataset_versions WHERE id = $1", VERSION_COLUMNS);
        let version = sqlx::query_as::<_, DatasetVersion>(&sql)
            .bind(version_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(version)
    }
}

#[async_trait]
impl FeatureStore for PgCatalog {
    async fn insert_batch(&self, layer_id: Uuid, batch: &[FeatureRecord]) -> Result<u64, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO features (layer_id, pcode, name, geometry, properties) ");
        builder.push_values(batch, |mut row, feature| {
            row.push_bind(layer_id)
                .push_bind(&feature.pcode)
                .push_bind(&feature.name)
                .push_bind(&feature.geometry)
                .push_bind(&feature.properties);
        });

        let result = builder.build().execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }

    async fn count_features(&self, layer_id: Uuid) -> Result<i64, StoreError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM features WHERE layer_id = $1")
                .bind(layer_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn delete_features(&self, layer_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM features WHERE layer_id = $1")
            .bind(layer_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl VersionCatalog for PgCatalog {
    async fn register_version(
        &self,
        country: &CountryCode,
        version_id: &str,
        title: &str,
    ) -> Result<DatasetVersion, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO dataset_versions (id, country_iso, title, is_active)
            VALUES ($1, $2, $3, FALSE)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(version_id)
        .bind(country.as_str())
        .bind(title)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let version = self
            .find_version(version_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("version {}", version_id)))?;

        if version.country_iso != country.as_str() {
            return Err(StoreError::Conflict(format!(
                "version {} belongs to {}",
                version_id, version.country_iso
            )));
        }
        if inserted == 1 {
            debug!(version_id, country_iso = %country, "Registered dataset version");
        }
        Ok(version)
    }

    async fn activate(&self, country: &CountryCode, layer: &Layer) -> Result<Activation, StoreError> {
        let version_id = layer.version_id.as_str();
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(activation_lock_key(country))
            .execute(&mut *tx)
            .await?;

        let owner = sqlx::query_scalar::<_, String>(
            "SELECT country_iso FROM dataset_versions WHERE id = $1 FOR UPDATE",
        )
        .bind(version_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("version {}", version_id)))?;

        if owner != country.as_str() {
            return Err(StoreError::Conflict(format!(
                "version {} belongs to {}",
                version_id, owner
            )));
        }

        let sql = format!(
            "DELETE FROM layers WHERE version_id = $1 AND admin_level = $2 RETURNING {}",
            LAYER_COLUMNS
        );
        let replaced = sqlx::query_as::<_, Layer>(&sql)
            .bind(version_id)
            .bind(layer.admin_level)
            .fetch_all(&mut *tx)
            .await?;

        if !replaced.is_empty() {
            let replaced_ids: Vec<Uuid> = replaced.iter().map(|l| l.id).collect();
            sqlx::query("DELETE FROM features WHERE layer_id = ANY($1)")
                .bind(&replaced_ids)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO layers
                (id, version_id, admin_level, format, crs, source_bucket, source_path,
                 checksum, feature_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(layer.id)
        .bind(&layer.version_id)
        .bind(layer.admin_level)
        .bind(&layer.format)
        .bind(&layer.crs)
        .bind(&layer.source_bucket)
        .bind(&layer.source_path)
        .bind(&layer.checksum)
        .bind(layer.feature_count)
        .bind(layer.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match check_constraint_violation(e) {
            ConstraintViolation::UniqueViolation => {
                StoreError::Conflict(format!("layer {} exists", layer.id))
            },
            ConstraintViolation::ForeignKeyViolation => {
                StoreError::NotFound(format!("version {}", layer.version_id))
            },
            ConstraintViolation::Other(e) => StoreError::Database(e),
        })?;

        let demoted = sqlx::query(
            r#"
            UPDATE dataset_versions
            SET is_active = FALSE, updated_at = NOW()
            WHERE country_iso = $1 AND is_active AND id <> $2
            "#,
        )
        .bind(country.as_str())
        .bind(version_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let sql = format!(
            r#"
            UPDATE dataset_versions
            SET is_active = TRUE, activated_at = NOW(), updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            VERSION_COLUMNS
        );
        let version = sqlx::query_as::<_, DatasetVersion>(&sql)
            .bind(version_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| match check_constraint_violation(e) {
                ConstraintViolation::UniqueViolation => StoreError::Conflict(format!(
                    "another version of {} is already active",
                    country
                )),
                ConstraintViolation::ForeignKeyViolation => {
                    StoreError::NotFound(format!("version {}", version_id))
                },
                ConstraintViolation::Other(e) => StoreError::Database(e),
            })?;

        tx.commit().await?;

        info!(
            version_id,
            layer_id = %layer.id,
            country_iso = %country,
            demoted,
            replaced = replaced.len(),
            "Activated dataset version"
        );
        Ok(Activation { version, replaced })
    }

    async fn active_version(&self, country: &CountryCode) -> Result<Option<DatasetVersion>, StoreError> {
        let sql = format!(
            "SELECT {} FROM dataset_versions WHERE country_iso = $1 AND is_active",
            VERSION_COLUMNS
        );
        let version = sqlx::query_as::<_, DatasetVersion>(&sql)
            .bind(country.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(version)
    }
}
