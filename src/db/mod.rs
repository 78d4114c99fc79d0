//! # Database — Relational Mirror and Result History
//!
//! Async PostgreSQL access via `sqlx::PgPool`. The relational store keeps
//! every project, group and task created in the live store, plus the full
//! history of mapping sessions and per-task results that the live store
//! only holds until they are transferred.
//!
//! ## Schema
//!
//! - `projects`, `groups`, `tasks`: mirror of the live-store documents,
//!   geometries as WKT text, type-specific keys in `project_type_specifics`
//! - `users`: contributors referenced by sessions
//! - `mapping_sessions`: one row per `(project, group, user)` submission
//! - `results`: one row per `(project, group, user, task)`, the idempotency key
//! - `sync_watermarks`: last processed timestamp per batch job
//!
//! ## Module Structure
//!
//! - [`projects`] — project insertion (COPY through staging tables), reads
//! - [`results`] — exactly-once loading of transferred results
//! - [`users`] — user upserts, watermarks, counter refresh
//! - [`deletion`] — ordered deletion and archival of project rows
//!
//! ## Store seam
//!
//! The batch jobs talk to the relational store through [`RelationalStore`],
//! implemented here by [`Database`], so they can also run against an
//! in-process stand-in.
//!
//! ## Bulk loading
//!
//! Groups, tasks, sessions and results are streamed with `COPY … FROM STDIN`
//! in CSV format into temporary `ON COMMIT DROP` tables, then moved into the
//! permanent tables with `INSERT … SELECT`. Staging tables never outlive the
//! transaction that created them.

mod deletion;
mod projects;
mod results;
mod users;

pub use deletion::DeletionSummary;
pub use results::{LoadOutcome, ResultBatch, ResultRecord, SessionRecord};
pub use users::{ProjectCounters, UserRecord};

use std::collections::HashSet;
use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions};

use crate::error::{Error, Result};
use crate::project::{PartitionedProject, ProjectStatus};

/// Schema applied by [`Database::apply_schema`].
pub const SCHEMA_SQL: &str = include_str!("../../migrations/001_initial_schema.sql");

/// Watermark key of the result transfer job.
pub const TRANSFER_RESULTS_JOB: &str = "transfer_results";
/// Watermark key of the user import job.
pub const USER_DATA_JOB: &str = "user_data";
/// Watermark key of the project metadata job.
pub const PROJECT_DATA_JOB: &str = "project_data";

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL using the provided database URL.
    ///
    /// The URL is parsed by hand so percent-encoded user names and passwords
    /// (pooler user names carry a `.tenant` suffix) reach the server intact.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let url = url::Url::parse(database_url)
            .map_err(|e| Error::Configuration(format!("invalid DATABASE_URL: {}", e)))?;
        let username = urlencoding::decode(url.username())
            .map_err(|e| Error::Configuration(format!("invalid database user name: {}", e)))?
            .into_owned();
        let password = url
            .password()
            .map(|p| urlencoding::decode(p).map(|s| s.into_owned()))
            .transpose()
            .map_err(|e| Error::Configuration(format!("invalid database password: {}", e)))?;
        let mut opts = PgConnectOptions::new()
            .host(url.host_str().unwrap_or("localhost"))
            .port(url.port().unwrap_or(5432))
            .database(url.path().trim_start_matches('/'))
            .username(&username)
            .statement_cache_capacity(0);
        if let Some(ref pw) = password {
            opts = opts.password(pw);
        }
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(opts)
            .await?;
        Ok(Database { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Database { pool }
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Execute `SELECT 1` to verify database connectivity.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    /// Create any missing tables and indexes. Safe to run repeatedly.
    pub async fn apply_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

// ── Store seam ──────────────────────────────────────────────────

#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn insert_project(&self, partitioned: &PartitionedProject) -> Result<()>;
    async fn delete_project_rows(&self, project_id: &str) -> Result<DeletionSummary>;
    async fn archive_project_row(&self, project_id: &str) -> Result<bool>;
    async fn existing_project_ids(&self, ids: &[String]) -> Result<HashSet<String>>;
    async fn load_results(&self, project_id: &str, batch: &ResultBatch) -> Result<LoadOutcome>;
    async fn upsert_users(&self, users: &[UserRecord]) -> Result<u64>;
    async fn get_watermark(&self, job: &str) -> Result<Option<DateTime<Utc>>>;
    async fn set_watermark(&self, job: &str, last_processed: DateTime<Utc>) -> Result<()>;
    async fn projects_with_results_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<(Vec<String>, Option<DateTime<Utc>>)>;
    async fn refresh_project_counters(&self, project_id: &str) -> Result<ProjectCounters>;
    async fn update_project_metadata(
        &self,
        project_id: &str,
        name: Option<&str>,
        status: Option<ProjectStatus>,
    ) -> Result<bool>;
}

#[async_trait]
impl RelationalStore for Database {
    async fn insert_project(&self, partitioned: &PartitionedProject) -> Result<()> {
        Database::insert_project(self, partitioned).await
    }

    async fn delete_project_rows(&self, project_id: &str) -> Result<DeletionSummary> {
        Database::delete_project_rows(self, project_id).await
    }

    async fn archive_project_row(&self, project_id: &str) -> Result<bool> {
        Database::archive_project_row(self, project_id).await
    }

    async fn existing_project_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        Database::existing_project_ids(self, ids).await
    }

    async fn load_results(&self, project_id: &str, batch: &ResultBatch) -> Result<LoadOutcome> {
        Database::load_results(self, project_id, batch).await
    }

    async fn upsert_users(&self, users: &[UserRecord]) -> Result<u64> {
        Database::upsert_users(self, users).await
    }

    async fn get_watermark(&self, job: &str) -> Result<Option<DateTime<Utc>>> {
        Database::get_watermark(self, job).await
    }

    async fn set_watermark(&self, job: &str, last_processed: DateTime<Utc>) -> Result<()> {
        Database::set_watermark(self, job, last_processed).await
    }

    async fn projects_with_results_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<(Vec<String>, Option<DateTime<Utc>>)> {
        Database::projects_with_results_since(self, since).await
    }

    async fn refresh_project_counters(&self, project_id: &str) -> Result<ProjectCounters> {
        Database::refresh_project_counters(self, project_id).await
    }

    async fn update_project_metadata(
        &self,
        project_id: &str,
        name: Option<&str>,
        status: Option<ProjectStatus>,
    ) -> Result<bool> {
        Database::update_project_metadata(self, project_id, name, status).await
    }
}

// ── CSV staging ─────────────────────────────────────────────────

/// Rows encoded for `COPY … WITH (FORMAT csv)`.
///
/// Text is always quoted so an empty string stays distinct from `NULL`,
/// which is written as an empty unquoted field.
#[derive(Debug, Default)]
pub(crate) struct CsvBuffer {
    buf: String,
    row_open: bool,
    rows: usize,
}

impl CsvBuffer {
    fn separator(&mut self) {
        if self.row_open {
            self.buf.push(',');
        }
        self.row_open = true;
    }

    pub(crate) fn text(&mut self, value: &str) -> &mut Self {
        self.separator();
        self.buf.push('"');
        self.buf.push_str(&value.replace('"', "\"\""));
        self.buf.push('"');
        self
    }

    pub(crate) fn opt_text(&mut self, value: Option<&str>) -> &mut Self {
        match value {
            Some(v) => self.text(v),
            None => self.null(),
        }
    }

    pub(crate) fn value(&mut self, value: impl Display) -> &mut Self {
        self.separator();
        self.buf.push_str(&value.to_string());
        self
    }

    pub(crate) fn opt_value<T: Display>(&mut self, value: Option<T>) -> &mut Self {
        match value {
            Some(v) => self.value(v),
            None => self.null(),
        }
    }

    pub(crate) fn null(&mut self) -> &mut Self {
        self.separator();
        self
    }

    pub(crate) fn end_row(&mut self) {
        self.buf.push('\n');
        self.row_open = false;
        self.rows += 1;
    }

    pub(crate) fn rows(&self) -> usize {
        self.rows
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.buf
    }
}

/// Stream `data` into `target` (a table name with column list). Returns the
/// number of rows copied.
pub(crate) async fn copy_csv(conn: &mut PgConnection, target: &str, data: &CsvBuffer) -> sqlx::Result<u64> {
    if data.rows() == 0 {
        return Ok(0);
    }
    let statement = format!("COPY {} FROM STDIN WITH (FORMAT csv)", target);
    let mut copy = conn.copy_in_raw(&statement).await?;
    copy.send(data.as_str().as_bytes()).await?;
    copy.finish().await
}

// ── Tests ───────────────────────────────────────────────────────
