//! List jobs query
//!
//! Query to list ingestion jobs, newest first.

use gisdash_common::types::{CountryCode, JobStatus};
use gisdash_common::GisError;
use mediator::Request;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::db::jobs::JOB_COLUMNS;
use crate::ingest::Job;

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

/// Query to list jobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListJobsQuery {
    /// Filter by status (`pending`, `processing`, `done`, `failed`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Filter by ISO 3166-1 alpha-3 country code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_iso: Option<String>,
    /// Limit number of results
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    /// Offset for pagination
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}

/// Response for list jobs query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<Job>,
    pub total: i64,
}

/// Error type for list jobs query
#[derive(Debug, thiserror::Error)]
pub enum ListJobsError {
    #[error("{0}")]
    InvalidFilter(#[from] GisError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Request<Result<ListJobsResponse, ListJobsError>> for ListJobsQuery {}

/// Parsed filters, ready to bind
#[derive(Debug, Default, PartialEq, Eq)]
struct JobFilters {
    status: Option<JobStatus>,
    country: Option<CountryCode>,
}

impl ListJobsQuery {
    fn filters(&self) -> Result<JobFilters, GisError> {
        let status = match self.status.as_deref().filter(|s| !s.is_empty()) {
            Some(s) => Some(s.parse::<JobStatus>()?),
            None => None,
        };
        let country = match self.country_iso.as_deref().filter(|c| !c.is_empty()) {
            Some(c) => Some(c.parse::<CountryCode>()?),
            None => None,
        };
        Ok(JobFilters { status, country })
    }

    fn page(&self) -> (i64, i64) {
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

fn push_filters<'a>(builder: &mut QueryBuilder<'a, Postgres>, filters: &'a JobFilters) {
    builder.push(" WHERE 1=1");
    if let Some(status) = filters.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(country) = &filters.country {
        builder.push(" AND country_iso = ").push_bind(country.as_str());
    }
}

#[tracing::instrument(skip(pool))]
pub async fn handle(pool: PgPool, query: ListJobsQuery) -> Result<ListJobsResponse, ListJobsError> {
    let filters = query.filters()?;
    let (limit, offset) = query.page();

    let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM ingestion_jobs", JOB_COLUMNS));
    push_filters(&mut select, &filters);
    select
        .push(" ORDER BY created_at DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);

    let jobs = select.build_query_as::<Job>().fetch_all(&pool).await?;

    let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM ingestion_jobs");
    push_filters(&mut count, &filters);
    let total: i64 = count.build_query_scalar().fetch_one(&pool).await?;

    Ok(ListJobsResponse { jobs, total })
}
