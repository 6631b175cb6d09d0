//! Postgres-backed job queue

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::ingest::error::StoreError;
use crate::ingest::models::{IngestRequest, Job};
use crate::ingest::queue::JobQueue;

pub const JOB_COLUMNS: &str = "id, status, source_bucket, source_path, country_iso, version_id, \
     title, admin_level, format, payload, worker_id, claimed_at, lease_expires_at, attempts, \
     layer_id, error_message, created_at, finished_at";

#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, request: &IngestRequest) -> Result<Job, StoreError> {
        let job = Job::pending(request);

        let sql = format!(
            r#"
            INSERT INTO ingestion_jobs
                (id, status, source_bucket, source_path, country_iso, version_id,
                 title, admin_level, format, payload)
            VALUES ($1, 'pending', $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let row = sqlx::query_as::<_, Job>(&sql)
            .bind(job.id)
            .bind(&job.source_bucket)
            .bind(&job.source_path)
            .bind(&job.country_iso)
            .bind(&job.version_id)
            .bind(&job.title)
            .bind(job.admin_level)
            .bind(&job.format)
            .bind(&job.payload)
            .fetch_one(&self.pool)
            .await?;

        Ok(row)
    }

    async fn next_candidate(&self, max_claims: i32) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM ingestion_jobs
            WHERE status = 'pending'
               OR (status = 'processing' AND lease_expires_at <= NOW() AND attempts < $1)
            ORDER BY created_at
            LIMIT 1
            "#,
            JOB_COLUMNS
        );

        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(max_claims)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    async fn try_claim(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
        max_claims: i32,
    ) -> Result<Option<Job>, StoreError> {
        // A lapsed `processing` job is re-owned in place; its status never
        // goes back to `pending`.
        let sql = format!(
            r#"
            UPDATE ingestion_jobs
            SET status = 'processing',
                worker_id = $2,
                claimed_at = NOW(),
                lease_expires_at = NOW() + make_interval(secs => $3),
                attempts = attempts + 1
            WHERE id = $1
              AND (status = 'pending'
                   OR (status = 'processing' AND lease_expires_at <= NOW() AND attempts < $4))
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(job_id)
            .bind(worker_id)
            .bind(lease.as_secs_f64())
            .bind(max_claims)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    async fn renew_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET lease_expires_at = NOW() + make_interval(secs => $3)
            WHERE id = $1 AND status = 'processing' AND worker_id = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn reap_expired(&self, max_claims: i32) -> Result<Vec<Uuid>, StoreError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE ingestion_jobs
            SET status = 'failed',
                finished_at = NOW(),
                lease_expires_at = NULL,
                error_message = format(
                    'Lease expired after %s claims (last worker: %s)',
                    attempts, COALESCE(worker_id, 'unknown'))
            WHERE status = 'processing'
              AND lease_expires_at <= NOW()
              AND attempts >= $1
            RETURNING id
            "#,
        )
        .bind(max_claims)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn mark_done(
        &self,
        job_id: Uuid,
        worker_id: &str,
        layer_id: Uuid,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET status = 'done',
                layer_id = $3,
                finished_at = NOW(),
                lease_expires_at = NULL,
                error_message = NULL
            WHERE id = $1 AND status = 'processing' AND worker_id = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(layer_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error_message: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET status = 'failed',
                error_message = $3,
                finished_at = NOW(),
                lease_expires_at = NULL
            WHERE id = $1 AND status = 'processing' AND worker_id = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {} FROM ingestion_jobs WHERE id = $1", JOB_COLUMNS);

        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }
}
