//! List dataset versions query

use gisdash_common::types::CountryCode;
use gisdash_common::GisError;
use mediator::Request;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::db::catalog::VERSION_COLUMNS;
use crate::ingest::models::DatasetVersion;

/// Query to list dataset versions, optionally for one country
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVersionsQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_iso: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ListVersionsError {
    #[error("{0}")]
    InvalidFilter(#[from] GisError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Request<Result<Vec<DatasetVersion>, ListVersionsError>> for ListVersionsQuery {}

impl ListVersionsQuery {
    fn country(&self) -> Result<Option<CountryCode>, GisError> {
        self.country_iso
            .as_deref()
            .filter(|c| !c.is_empty())
            .map(str::parse)
            .transpose()
    }
}

/// Versions newest first; the active one for each country is flagged
#[tracing::instrument(skip(pool))]
pub async fn handle(
    pool: PgPool,
    query: ListVersionsQuery,
) -> Result<Vec<DatasetVersion>, ListVersionsError> {
    let country = query.country()?;

    let mut builder =
        QueryBuilder::<Postgres>::new(format!("SELECT {} FROM dataset_versions", VERSION_COLUMNS));
    if let Some(country) = &country {
        builder.push(" WHERE country_iso = ").push_bind(country.as_str());
    }
    builder.push(" ORDER BY created_at DESC");

    let versions = builder
        .build_query_as::<DatasetVersion>()
        .fetch_all(&pool)
        .await?;
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_country_filter() {
        assert_eq!(ListVersionsQuery::default().country().unwrap(), None);

        let query = ListVersionsQuery {
            country_iso: Some("ken".to_string()),
        };
        assert_eq!(query.country().unwrap().unwrap().as_str(), "KEN");

        let query = ListVersionsQuery {
            country_iso: Some("kenya".to_string()),
        };
        assert!(query.country().is_err());
    }
}
