//! Ordered removal of a project's rows.
//!
//! Rows are deleted child-first so foreign keys never block: results →
//! mapping_sessions → tasks → groups → project_statistics → projects.
//! `project_statistics` is an optional reporting table; it is deleted inside
//! a savepoint and an undefined-table error is swallowed.

use serde::Serialize;
use sqlx::postgres::PgConnection;
use sqlx::Connection;
use tracing::{debug, info};

use super::Database;
use crate::error::{Error, Result};
use crate::project::ProjectStatus;

const UNDEFINED_TABLE: &str = "42P01";

/// Rows removed per table by [`Database::delete_project_rows`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeletionSummary {
    pub results: u64,
    pub mapping_sessions: u64,
    pub tasks: u64,
    pub groups: u64,
    pub project_statistics: u64,
    pub projects: u64,
}

impl DeletionSummary {
    pub fn total(&self) -> u64 {
        self.results + self.mapping_sessions + self.tasks + self.groups + self.project_statistics + self.projects
    }
}

impl Database {
    /// Delete every row belonging to `project_id` in one transaction.
    /// Deleting a project that does not exist is a no-op.
    pub async fn delete_project_rows(&self, project_id: &str) -> Result<DeletionSummary> {
        let run = async {
            let mut tx = self.pool.begin().await?;
            let summary = delete_rows(&mut *tx, project_id).await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(summary)
        };
        let summary = run.await.map_err(|e| Error::from_db(project_id, e))?;
        info!(
            project_id,
            results = summary.results,
            sessions = summary.mapping_sessions,
            tasks = summary.tasks,
            groups = summary.groups,
            "project rows deleted"
        );
        Ok(summary)
    }

    /// Set the relational status to `archived`, keeping all history.
    /// Returns false when the project row does not exist.
    pub async fn archive_project_row(&self, project_id: &str) -> Result<bool> {
        let updated = sqlx::query("UPDATE projects SET status = $2 WHERE project_id = $1")
            .bind(project_id)
            .bind(ProjectStatus::Archived.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated > 0)
    }
}

/// Delete a project's rows on an open connection, child tables first.
pub(super) async fn delete_rows(conn: &mut PgConnection, project_id: &str) -> sqlx::Result<DeletionSummary> {
    let mut summary = DeletionSummary::default();

    summary.results = delete_from(conn, "results", project_id).await?;
    summary.mapping_sessions = delete_from(conn, "mapping_sessions", project_id).await?;
    summary.tasks = delete_from(conn, "tasks", project_id).await?;
    summary.groups = delete_from(conn, "groups", project_id).await?;

    let mut savepoint = conn.begin().await?;
    match delete_from(&mut *savepoint, "project_statistics", project_id).await {
        Ok(n) => {
            savepoint.commit().await?;
            summary.project_statistics = n;
        }
        Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(UNDEFINED_TABLE) => {
            savepoint.rollback().await?;
            debug!(project_id, "project_statistics table absent, skipped");
        }
        Err(e) => return Err(e),
    }

    summary.projects = delete_from(conn, "projects", project_id).await?;
    Ok(summary)
}

async fn delete_from(conn: &mut PgConnection, table: &str, project_id: &str) -> sqlx::Result<u64> {
    // `table` is always one of the fixed names above.
    let sql = format!("DELETE FROM {} WHERE project_id = $1", table);
    Ok(sqlx::query(&sql).bind(project_id).execute(conn).await?.rows_affected())
}
