//! Get active version query
//!
//! Returns the version currently served for a country together with its
//! layers.

use gisdash_common::types::CountryCode;
use gisdash_common::GisError;
use mediator::Request;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::db::catalog::{LAYER_COLUMNS, VERSION_COLUMNS};
use crate::ingest::models::{DatasetVersion, Layer};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetActiveVersionQuery {
    pub country_iso: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveVersion {
    pub version: DatasetVersion,
    pub layers: Vec<Layer>,
}

#[derive(Debug, thiserror::Error)]
pub enum GetActiveVersionError {
    #[error("{0}")]
    InvalidCountry(#[from] GisError),
    #[error("No active version for {0}")]
    NoActiveVersion(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Request<Result<ActiveVersion, GetActiveVersionError>> for GetActiveVersionQuery {}

#[tracing::instrument(skip(pool))]
pub async fn handle(
    pool: PgPool,
    query: GetActiveVersionQuery,
) -> Result<ActiveVersion, GetActiveVersionError> {
    let country: CountryCode = query.country_iso.parse()?;

    let sql = format!(
        "SELECT {} FROM dataset_versions WHERE country_iso = $1 AND is_active",
        VERSION_COLUMNS
    );
    let version = sqlx::query_as::<_, DatasetVersion>(&sql)
        .bind(country.as_str())
        .fetch_optional(&pool)
        .await?
        .ok_or_else(|| GetActiveVersionError::NoActiveVersion(country.to_string()))?;

    let sql = format!(
        "SELECT {} FROM layers WHERE version_id = $1 ORDER BY admin_level, created_at",
        LAYER_COLUMNS
    );
    let layers = sqlx::query_as::<_, Layer>(&sql)
        .bind(&version.id)
        .fetch_all(&pool)
        .await?;

    Ok(ActiveVersion { version, layers })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_country_rejected_before_query() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let result = handle(
            pool,
            GetActiveVersionQuery {
                country_iso: "P1".to_string(),
            },
        )
        .await;
        assert!(matches!(result, Err(GetActiveVersionError::InvalidCountry(_))));
    }
}
