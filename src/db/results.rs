//! Exactly-once loading of transferred results.
//!
//! The idempotency key is `(project_id, group_id, user_id, task_id)` for
//! results and `(project_id, group_id, user_id)` for sessions. Loading the
//! same batch twice inserts nothing the second time and leaves every counter
//! untouched, which is what makes a crash between the relational commit and
//! the live-store clear harmless.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgConnection;
use tracing::debug;

use super::{copy_csv, CsvBuffer, Database};
use crate::error::{Error, Result};
use crate::project::lifecycle::{self, GroupCounters};

/// One user's submission for one group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub group_id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub items_count: i32,
    pub app_version: Option<String>,
    pub client_type: Option<String>,
}

/// One answer for one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
    pub group_id: String,
    pub user_id: String,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub result: i32,
}

/// Everything derived from one project's pending live-store results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultBatch {
    pub sessions: Vec<SessionRecord>,
    pub results: Vec<ResultRecord>,
}

impl ResultBatch {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.results.is_empty()
    }

    /// Ids of every group referenced by a session or result.
    pub fn group_ids(&self) -> BTreeSet<&str> {
        self.sessions
            .iter()
            .map(|s| s.group_id.as_str())
            .chain(self.results.iter().map(|r| r.group_id.as_str()))
            .collect()
    }
}

/// What a load changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadOutcome {
    pub sessions_inserted: u64,
    pub results_inserted: u64,
    /// Current counters of every group the batch touches, by group id,
    /// whether or not this load changed them.
    pub groups: BTreeMap<String, GroupCounters>,
    pub progress: u8,
    pub result_count: u64,
    pub contributor_count: u64,
}

fn session_csv(project_id: &str, sessions: &[SessionRecord]) -> CsvBuffer {
    let mut csv = CsvBuffer::default();
    for s in sessions {
        csv.text(project_id)
            .text(&s.group_id)
            .text(&s.user_id)
            .value(s.start_time.to_rfc3339())
            .value(s.end_time.to_rfc3339())
            .value(s.items_count)
            .opt_text(s.app_version.as_deref())
            .opt_text(s.client_type.as_deref())
            .end_row();
    }
    csv
}

fn result_csv(project_id: &str, results: &[ResultRecord]) -> CsvBuffer {
    let mut csv = CsvBuffer::default();
    for r in results {
        csv.text(project_id)
            .text(&r.group_id)
            .text(&r.user_id)
            .text(&r.task_id)
            .value(r.timestamp.to_rfc3339())
            .value(r.start_time.to_rfc3339())
            .value(r.end_time.to_rfc3339())
            .value(r.result)
            .end_row();
    }
    csv
}

const SESSION_COLUMNS: &str =
    "project_id, group_id, user_id, start_time, end_time, items_count, app_version, client_type";
const RESULT_COLUMNS: &str = "project_id, group_id, user_id, task_id, \"timestamp\", start_time, end_time, result";

/// Number of newly inserted sessions per group.
fn sessions_per_group(inserted_group_ids: Vec<String>) -> BTreeMap<String, u32> {
    let mut counts = BTreeMap::new();
    for g in inserted_group_ids {
        *counts.entry(g).or_insert(0u32) += 1;
    }
    counts
}

impl Database {
    /// Load one project's batch in a single transaction.
    ///
    /// A result that references an unknown task or group violates a foreign
    /// key; the transaction is rolled back and the failure is reported as
    /// [`Error::Consistency`] for this project only.
    pub async fn load_results(&self, project_id: &str, batch: &ResultBatch) -> Result<LoadOutcome> {
        self.load_results_tx(project_id, batch)
            .await
            .map_err(|e| Error::from_db(project_id, e))
    }

    async fn load_results_tx(&self, project_id: &str, batch: &ResultBatch) -> sqlx::Result<LoadOutcome> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("CREATE TEMP TABLE staging_sessions (LIKE mapping_sessions INCLUDING DEFAULTS) ON COMMIT DROP")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE TEMP TABLE staging_results (LIKE results INCLUDING DEFAULTS) ON COMMIT DROP")
            .execute(&mut *tx)
            .await?;
        copy_csv(
            &mut *tx,
            &format!("staging_sessions ({})", SESSION_COLUMNS),
            &session_csv(project_id, &batch.sessions),
        )
        .await?;
        copy_csv(
            &mut *tx,
            &format!("staging_results ({})", RESULT_COLUMNS),
            &result_csv(project_id, &batch.results),
        )
        .await?;

        sqlx::query(
            "INSERT INTO users (user_id)
             SELECT DISTINCT user_id FROM staging_sessions
             ON CONFLICT (user_id) DO NOTHING",
        )
        .execute(&mut *tx)
        .await?;

        let inserted_groups: Vec<String> = sqlx::query_scalar(&format!(
            "INSERT INTO mapping_sessions ({cols})
             SELECT {cols} FROM staging_sessions
             ON CONFLICT (project_id, group_id, user_id) DO NOTHING
             RETURNING group_id",
            cols = SESSION_COLUMNS
        ))
        .fetch_all(&mut *tx)
        .await?;
        let sessions_inserted = inserted_groups.len() as u64;

        let results_inserted = sqlx::query(&format!(
            "INSERT INTO results ({cols})
             SELECT {cols} FROM staging_results
             ON CONFLICT (project_id, group_id, user_id, task_id) DO NOTHING",
            cols = RESULT_COLUMNS
        ))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // BTreeMap order doubles as a stable lock order across workers.
        for (group_id, n) in sessions_per_group(inserted_groups) {
            apply_to_group(&mut *tx, project_id, &group_id, n).await?;
        }

        let (verification_number, required_results): (i32, i64) = sqlx::query_as(
            "SELECT verification_number, required_results FROM projects
             WHERE project_id = $1 FOR UPDATE",
        )
        .bind(project_id)
        .fetch_one(&mut *tx)
        .await?;
        let mut all_counters = group_counters(&mut *tx, project_id).await?;
        let progress = lifecycle::project_progress(
            verification_number.max(0) as u32,
            required_results.max(0) as u64,
            &all_counters.values().copied().collect::<Vec<_>>(),
        );
        let touched = batch.group_ids();
        all_counters.retain(|group_id, _| touched.contains(group_id.as_str()));
        let groups = all_counters;

        let (result_count, contributor_count): (i64, i64) = sqlx::query_as(
            "UPDATE projects
             SET progress = $2,
                 result_count = result_count + $3,
                 contributor_count = (SELECT COUNT(DISTINCT user_id) FROM mapping_sessions WHERE project_id = $1)
             WHERE project_id = $1
             RETURNING result_count, contributor_count",
        )
        .bind(project_id)
        .bind(progress as i16)
        .bind(results_inserted as i64)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(project_id, sessions_inserted, results_inserted, "results loaded");

        Ok(LoadOutcome {
            sessions_inserted,
            results_inserted,
            groups,
            progress,
            result_count: result_count.max(0) as u64,
            contributor_count: contributor_count.max(0) as u64,
        })
    }
}

async fn apply_to_group(
    conn: &mut PgConnection,
    project_id: &str,
    group_id: &str,
    new_sessions: u32,
) -> sqlx::Result<GroupCounters> {
    let (number_of_tasks, finished_count, required_count, progress): (i32, i32, i32, i16) = sqlx::query_as(
        "SELECT number_of_tasks, finished_count, required_count, progress
         FROM groups WHERE project_id = $1 AND group_id = $2
         FOR UPDATE",
    )
    .bind(project_id)
    .bind(group_id)
    .fetch_one(&mut *conn)
    .await?;

    let current = GroupCounters {
        number_of_tasks: number_of_tasks.max(0) as u32,
        finished_count: finished_count.max(0) as u32,
        required_count: required_count.max(0) as u32,
        progress: progress.clamp(0, 100) as u8,
    };
    let next = lifecycle::apply_submissions(current, new_sessions);

    sqlx::query(
        "UPDATE groups SET finished_count = $3, required_count = $4, progress = $5
         WHERE project_id = $1 AND group_id = $2",
    )
    .bind(project_id)
    .bind(group_id)
    .bind(next.finished_count as i32)
    .bind(next.required_count as i32)
    .bind(next.progress as i16)
    .execute(&mut *conn)
    .await?;
    Ok(next)
}

pub(super) async fn group_counters(
    conn: &mut PgConnection,
    project_id: &str,
) -> sqlx::Result<BTreeMap<String, GroupCounters>> {
    let rows: Vec<(String, i32, i32, i32, i16)> = sqlx::query_as(
        "SELECT group_id, number_of_tasks, finished_count, required_count, progress
         FROM groups WHERE project_id = $1",
    )
    .bind(project_id)
    .fetch_all(conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(group_id, n, f, r, p)| {
            let counters = GroupCounters {
                number_of_tasks: n.max(0) as u32,
                finished_count: f.max(0) as u32,
                required_count: r.max(0) as u32,
                progress: p.clamp(0, 100) as u8,
            };
            (group_id, counters)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn sessions_are_counted_per_group() {
        let counts = sessions_per_group(vec!["g101".into(), "g100".into(), "g101".into()]);
        assert_eq!(counts.get("g100"), Some(&1));
        assert_eq!(counts.get("g101"), Some(&2));
        assert_eq!(counts.keys().next().map(String::as_str), Some("g100"));
    }

    #[test]
    fn session_rows_carry_project_id_and_nullable_metadata() {
        let sessions = vec![SessionRecord {
            group_id: "g100".into(),
            user_id: "u1".into(),
            start_time: ts(0),
            end_time: ts(60),
            items_count: 12,
            app_version: None,
            client_type: Some("web".into()),
        }];
        let csv = session_csv("p1", &sessions);
        assert_eq!(
            csv.as_str(),
            "\"p1\",\"g100\",\"u1\",2023-11-14T22:13:20+00:00,2023-11-14T22:14:20+00:00,12,,\"web\"\n"
        );
        assert_eq!(SESSION_COLUMNS.split(',').count(), 8);
    }

    #[test]
    fn result_rows_follow_column_order() {
        let results = vec![ResultRecord {
            group_id: "g100".into(),
            user_id: "u1".into(),
            task_id: "18-1-2".into(),
            timestamp: ts(60),
            start_time: ts(0),
            end_time: ts(60),
            result: 2,
        }];
        let csv = result_csv("p1", &results);
        assert!(csv.as_str().starts_with("\"p1\",\"g100\",\"u1\",\"18-1-2\","));
        assert!(csv.as_str().ends_with(",2\n"));
        assert_eq!(RESULT_COLUMNS.split(',').count(), 8);
    }

    #[test]
    fn empty_batch() {
        assert!(ResultBatch::default().is_empty());
        assert!(ResultBatch::default().group_ids().is_empty());
    }

    #[test]
    fn batch_group_ids_cover_sessions_and_results() {
        let batch = ResultBatch {
            sessions: vec![SessionRecord {
                group_id: "g101".into(),
                user_id: "u1".into(),
                start_time: ts(0),
                end_time: ts(60),
                items_count: 1,
                app_version: None,
                client_type: None,
            }],
            results: vec![ResultRecord {
                group_id: "g100".into(),
                user_id: "u1".into(),
                task_id: "t1".into(),
                timestamp: ts(60),
                start_time: ts(0),
                end_time: ts(60),
                result: 1,
            }],
        };
        assert_eq!(batch.group_ids().into_iter().collect::<Vec<_>>(), vec!["g100", "g101"]);
    }
}
