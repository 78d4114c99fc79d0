//! Users, job watermarks and project counter maintenance.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::results::group_counters;
use super::Database;
use crate::error::{Error, Result};
use crate::project::lifecycle::{self, GroupCounters};
use crate::project::ProjectStatus;

/// A contributor imported from the live store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserRecord {
    pub user_id: String,
    pub username: Option<String>,
    pub created: Option<DateTime<Utc>>,
}

/// Derived counters of one project, recomputed from history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectCounters {
    pub progress: u8,
    pub result_count: u64,
    pub contributor_count: u64,
    /// Current counters of every group, by group id.
    pub groups: BTreeMap<String, GroupCounters>,
}

impl Database {
    /// Insert or refresh users. A known `created` timestamp is never
    /// overwritten with an unknown one.
    pub async fn upsert_users(&self, users: &[UserRecord]) -> Result<u64> {
        if users.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = users.iter().map(|u| u.user_id.clone()).collect();
        let names: Vec<Option<String>> = users.iter().map(|u| u.username.clone()).collect();
        let created: Vec<Option<DateTime<Utc>>> = users.iter().map(|u| u.created).collect();
        let affected = sqlx::query(
            "INSERT INTO users (user_id, username, created)
             SELECT * FROM UNNEST($1::text[], $2::text[], $3::timestamptz[])
             ON CONFLICT (user_id) DO UPDATE
             SET username = COALESCE(EXCLUDED.username, users.username),
                 created = COALESCE(users.created, EXCLUDED.created)",
        )
        .bind(&ids)
        .bind(&names)
        .bind(&created)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    pub async fn get_watermark(&self, job: &str) -> Result<Option<DateTime<Utc>>> {
        let ts: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT last_processed FROM sync_watermarks WHERE job = $1")
                .bind(job)
                .fetch_optional(&self.pool)
                .await?;
        Ok(ts)
    }

    /// Move a job's watermark forward. An older timestamp never replaces a
    /// newer one.
    pub async fn set_watermark(&self, job: &str, last_processed: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_watermarks (job, last_processed, updated_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (job) DO UPDATE
             SET last_processed = GREATEST(sync_watermarks.last_processed, EXCLUDED.last_processed),
                 updated_at = NOW()",
        )
        .bind(job)
        .bind(last_processed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Projects that received results at or after `since`, with the newest
    /// result timestamp seen overall.
    pub async fn projects_with_results_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<(Vec<String>, Option<DateTime<Utc>>)> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT project_id FROM results
             WHERE $1::timestamptz IS NULL OR \"timestamp\" >= $1
             ORDER BY project_id",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        let newest: Option<DateTime<Utc>> = sqlx::query_scalar("SELECT MAX(\"timestamp\") FROM results")
            .fetch_one(&self.pool)
            .await?;
        Ok((ids, newest))
    }

    /// Recompute progress, result count and contributor count of a project
    /// from its group rows and result history.
    pub async fn refresh_project_counters(&self, project_id: &str) -> Result<ProjectCounters> {
        let run = async {
            let mut tx = self.pool.begin().await?;
            let (verification_number, required_results): (i32, i64) = sqlx::query_as(
                "SELECT verification_number, required_results FROM projects
                 WHERE project_id = $1 FOR UPDATE",
            )
            .bind(project_id)
            .fetch_one(&mut *tx)
            .await?;
            let groups = group_counters(&mut *tx, project_id).await?;
            let counters: Vec<GroupCounters> = groups.values().copied().collect();
            let progress = lifecycle::project_progress(
                verification_number.max(0) as u32,
                required_results.max(0) as u64,
                &counters,
            );
            let (result_count, contributor_count): (i64, i64) = sqlx::query_as(
                "UPDATE projects
                 SET progress = $2,
                     result_count = (SELECT COUNT(*) FROM results WHERE project_id = $1),
                     contributor_count = (SELECT COUNT(DISTINCT user_id) FROM mapping_sessions WHERE project_id = $1)
                 WHERE project_id = $1
                 RETURNING result_count, contributor_count",
            )
            .bind(project_id)
            .bind(progress as i16)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(ProjectCounters {
                progress,
                result_count: result_count.max(0) as u64,
                contributor_count: contributor_count.max(0) as u64,
                groups,
            })
        };
        run.await.map_err(|e| Error::from_db(project_id, e))
    }

    /// Copy live-store metadata onto the relational row. Returns false when
    /// the row does not exist.
    pub async fn update_project_metadata(
        &self,
        project_id: &str,
        name: Option<&str>,
        status: Option<ProjectStatus>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE projects
             SET name = COALESCE($2, name),
                 status = COALESCE($3, status)
             WHERE project_id = $1",
        )
        .bind(project_id)
        .bind(name)
        .bind(status.map(|s| s.as_str()))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }
}
