//! # Sync — Result Transfer and Companion Jobs
//!
//! Moves submitted results from the live store into the relational store
//! exactly once, then keeps derived counters in step.
//!
//! ## `transfer_results`
//!
//! For every project with pending results under `results/{projectId}`:
//!
//! 1. Read the pending subtree
//! 2. Derive session and result rows ([`derive_rows`]); malformed
//!    submissions are skipped with a warning and stay in the live store
//! 3. Load them in one relational transaction (idempotent, retried with
//!    backoff on transient errors)
//! 4. Publish the current counters of every group in the batch and of the
//!    project
//! 5. Clear exactly the transferred submissions through a live-store
//!    transaction, keeping anything that changed meanwhile
//!
//! Results stay pending until their counters are published, so a failure
//! anywhere after 3 is repaired by the next pass: it loads nothing new,
//! publishes the counters again and clears the leftovers. The
//! `transfer_results` watermark advances to the newest transferred result.
//!
//! ## Companion jobs
//!
//! - [`SyncPipeline::update_user_data`] imports users created since the
//!   `user_data` watermark.
//! - [`SyncPipeline::update_project_data`] refreshes name, status and
//!   counters of projects that received results since the `project_data`
//!   watermark.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::db::{
    LoadOutcome, RelationalStore, ResultBatch, ResultRecord, SessionRecord, UserRecord, PROJECT_DATA_JOB,
    TRANSFER_RESULTS_JOB, USER_DATA_JOB,
};
use crate::error::{Error, JobFailure, LiveStoreError, Result};
use crate::live::{transaction, LiveStore};
use crate::project::lifecycle::GroupCounters;
use crate::project::ProjectStatus;
use crate::retry::{with_backoff, RetryPolicy};

pub const RESULTS_PATH: &str = "results";
pub const USERS_PATH: &str = "users";

/// Project ids in this namespace hold onboarding data and are never synced.
pub const TUTORIAL_PREFIX: &str = "tutorial";

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: Vec<JobFailure>,
    pub results_inserted: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectDataReport {
    pub updated: usize,
    pub failed: Vec<JobFailure>,
}

/// Outcome of one project's transfer.
#[derive(Debug, Clone, Default)]
struct ProjectTransfer {
    results_inserted: u64,
    newest: Option<DateTime<Utc>>,
}

/// A submission that made it into the batch, with the exact value read so
/// the clear step can tell whether it changed meanwhile.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferredSubmission {
    pub group_id: String,
    pub user_id: String,
    pub snapshot: Value,
}

/// Rows derived from one project's pending results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedRows {
    pub batch: ResultBatch,
    pub transferred: Vec<TransferredSubmission>,
    pub malformed: usize,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct SyncPipeline {
    db: Arc<dyn RelationalStore>,
    live: Arc<dyn LiveStore>,
    retry: RetryPolicy,
    workers: usize,
}

impl SyncPipeline {
    pub fn new(db: Arc<dyn RelationalStore>, live: Arc<dyn LiveStore>) -> Self {
        SyncPipeline {
            db,
            live,
            retry: RetryPolicy::default(),
            workers: 1,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Number of projects transferred concurrently.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    // ── transfer_results ────────────────────────────────────────

    /// Transfer pending results of `project_ids`, or of every project that
    /// has any when `None`.
    pub async fn transfer_results(&self, project_ids: Option<&[String]>) -> Result<TransferReport> {
        let mut candidates = match project_ids {
            Some(ids) => ids.to_vec(),
            None => self.live.shallow_keys(RESULTS_PATH).await?,
        };
        candidates.sort();
        candidates.dedup();

        let mut report = TransferReport::default();
        candidates.retain(|id| {
            let tutorial = id.starts_with(TUTORIAL_PREFIX);
            if tutorial {
                report.skipped += 1;
            }
            !tutorial
        });

        let known = self.db.existing_project_ids(&candidates).await?;
        let mut eligible = Vec::with_capacity(candidates.len());
        for id in candidates {
            if known.contains(&id) {
                eligible.push(id);
            } else {
                warn!(project_id = %id, "results for unknown project, skipped");
                report.skipped += 1;
            }
        }

        let outcomes = if self.workers <= 1 {
            let mut outcomes = Vec::with_capacity(eligible.len());
            for id in eligible {
                let span = info_span!("transfer_results", project_id = %id);
                let outcome = self.transfer_project(&id).instrument(span).await;
                outcomes.push((id, outcome));
            }
            outcomes
        } else {
            self.transfer_concurrently(eligible).await
        };

        let mut newest: Option<DateTime<Utc>> = None;
        for (id, outcome) in outcomes {
            match outcome {
                Ok(t) => {
                    report.processed += 1;
                    report.results_inserted += t.results_inserted;
                    newest = newest.max(t.newest);
                }
                Err(e) => {
                    error!(project_id = %id, error = %e, kind = ?e.kind(), "result transfer failed");
                    report.failed.push(JobFailure::new(&id, &e));
                }
            }
        }

        if let Some(ts) = newest {
            self.db.set_watermark(TRANSFER_RESULTS_JOB, ts).await?;
        }
        info!(
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed.len(),
            results_inserted = report.results_inserted,
            "transfer_results finished"
        );
        Ok(report)
    }

    async fn transfer_concurrently(&self, ids: Vec<String>) -> Vec<(String, Result<ProjectTransfer>)> {
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut set = JoinSet::new();
        for id in ids {
            let this = self.clone();
            let permits = Arc::clone(&permits);
            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let span = info_span!("transfer_results", project_id = %id);
                let outcome = this.transfer_project(&id).instrument(span).await;
                (id, outcome)
            });
        }
        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(pair) => outcomes.push(pair),
                Err(e) => error!(error = %e, "transfer worker panicked"),
            }
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        outcomes
    }

    async fn transfer_project(&self, project_id: &str) -> Result<ProjectTransfer> {
        let path = format!("{}/{}", RESULTS_PATH, project_id);
        let Some(pending) = self.live.get(&path).await? else {
            return Ok(ProjectTransfer::default());
        };

        let derived = derive_rows(project_id, &pending);
        if derived.malformed > 0 {
            warn!(project_id, malformed = derived.malformed, "malformed submissions left in place");
        }
        if derived.transferred.is_empty() {
            return Ok(ProjectTransfer::default());
        }

        let batch = &derived.batch;
        let outcome = with_backoff(&self.retry, "load_results", || self.db.load_results(project_id, batch)).await?;

        let counters = counter_update(project_id, &outcome);
        with_backoff(&self.retry, "publish_counters", || async {
            self.live.update("", &counters).await.map_err(Error::from)
        })
        .await?;

        let transferred = &derived.transferred;
        match transaction(self.live.as_ref(), &path, |current| remove_transferred(current, transferred)).await {
            Ok(cleared) => debug!(project_id, cleared, "transferred submissions cleared"),
            Err(LiveStoreError::TransactionAborted { .. }) => {
                warn!(project_id, "clearing transferred results aborted, retried next pass");
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            project_id,
            sessions = outcome.sessions_inserted,
            results = outcome.results_inserted,
            progress = outcome.progress,
            "results transferred"
        );
        Ok(ProjectTransfer {
            results_inserted: outcome.results_inserted,
            newest: derived.newest,
        })
    }

    // ── Companion jobs ──────────────────────────────────────────

    /// Import users created since the `user_data` watermark. Returns the
    /// number of users written.
    pub async fn update_user_data(&self) -> Result<usize> {
        let since = self.db.get_watermark(USER_DATA_JOB).await?;
        let start_at = since.map(iso_timestamp);
        let raw = self.live.query_ordered(USERS_PATH, "created", start_at.as_deref()).await?;

        let users = parse_users(&raw);
        if users.is_empty() {
            debug!("no new users");
            return Ok(0);
        }
        with_backoff(&self.retry, "upsert_users", || self.db.upsert_users(&users)).await?;

        let newest = users.iter().filter_map(|u| u.created).max();
        if let Some(ts) = newest {
            self.db.set_watermark(USER_DATA_JOB, ts).await?;
        }
        info!(users = users.len(), "user data updated");
        Ok(users.len())
    }

    /// Copy name and status from the live store onto the relational rows
    /// and recompute counters, for `project_ids` or for every project with
    /// results newer than the `project_data` watermark.
    pub async fn update_project_data(&self, project_ids: Option<&[String]>) -> Result<ProjectDataReport> {
        let (ids, newest) = match project_ids {
            Some(ids) => (ids.to_vec(), None),
            None => {
                let since = self.db.get_watermark(PROJECT_DATA_JOB).await?;
                self.db.projects_with_results_since(since).await?
            }
        };

        let mut report = ProjectDataReport::default();
        for id in ids {
            match self.update_one_project(&id).await {
                Ok(()) => report.updated += 1,
                Err(e) => {
                    error!(project_id = %id, error = %e, "project data update failed");
                    report.failed.push(JobFailure::new(&id, &e));
                }
            }
        }
        if let Some(ts) = newest {
            self.db.set_watermark(PROJECT_DATA_JOB, ts).await?;
        }
        info!(updated = report.updated, failed = report.failed.len(), "project data updated");
        Ok(report)
    }

    async fn update_one_project(&self, project_id: &str) -> Result<()> {
        let live_project = self.live.get(&format!("projects/{}", project_id)).await?;
        if let Some(doc) = &live_project {
            let name = doc.get("name").and_then(Value::as_str);
            let status = doc
                .get("status")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<ProjectStatus>().ok());
            self.db.update_project_metadata(project_id, name, status).await?;
        }

        let counters = self.db.refresh_project_counters(project_id).await?;
        if live_project.is_some() {
            let mut update = Map::new();
            insert_group_counters(&mut update, project_id, &counters.groups);
            let base = format!("projects/{}", project_id);
            update.insert(format!("{}/progress", base), json!(counters.progress));
            update.insert(format!("{}/resultCount", base), json!(counters.result_count));
            update.insert(format!("{}/contributorCount", base), json!(counters.contributor_count));
            self.live.update("", &update).await?;
        }
        Ok(())
    }
}

// ── Row derivation ──────────────────────────────────────────────

/// Parse a live-store timestamp: ISO-8601 text or epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// Timestamps as the clients write them (`2024-05-01T10:00:00.000Z`).
pub fn iso_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_answer(value: &Value) -> Option<i32> {
    if let Some(i) = value.as_i64() {
        return i32::try_from(i).ok();
    }
    let f = value.as_f64()?;
    if f.fract() == 0.0 && f >= i32::MIN as f64 && f <= i32::MAX as f64 {
        Some(f as i32)
    } else {
        None
    }
}

/// `results` is an object keyed by task id, or an array when the task ids
/// are small integers.
fn answers(value: &Value) -> Vec<(String, &Value)> {
    match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_null())
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        _ => Vec::new(),
    }
}

/// Derive session and result rows from `results/{projectId}`, laid out as
/// `{groupId: {userId: submission}}`.
///
/// A submission without `startTime` or `endTime` is malformed and skipped
/// whole. Non-integer answers are skipped individually.
pub fn derive_rows(project_id: &str, pending: &Value) -> DerivedRows {
    let mut derived = DerivedRows::default();
    let Some(groups) = pending.as_object() else {
        return derived;
    };

    for (group_id, users) in groups {
        let Some(users) = users.as_object() else {
            continue;
        };
        for (user_id, submission) in users {
            let start = submission.get("startTime").and_then(parse_timestamp);
            let end = submission.get("endTime").and_then(parse_timestamp);
            let (Some(start_time), Some(end_time)) = (start, end) else {
                warn!(project_id, group_id = %group_id, user_id = %user_id, "submission missing startTime/endTime, skipped");
                derived.malformed += 1;
                continue;
            };
            let timestamp = submission
                .get("timestamp")
                .and_then(parse_timestamp)
                .unwrap_or(end_time);

            let mut items = 0;
            for (task_id, answer) in submission.get("results").map(answers).unwrap_or_default() {
                let Some(result) = parse_answer(answer) else {
                    debug!(project_id, group_id = %group_id, task_id = %task_id, "non-integer answer skipped");
                    continue;
                };
                derived.batch.results.push(ResultRecord {
                    group_id: group_id.clone(),
                    user_id: user_id.clone(),
                    task_id,
                    timestamp,
                    start_time,
                    end_time,
                    result,
                });
                items += 1;
            }

            derived.batch.sessions.push(SessionRecord {
                group_id: group_id.clone(),
                user_id: user_id.clone(),
                start_time,
                end_time,
                items_count: items,
                app_version: submission.get("appVersion").and_then(Value::as_str).map(str::to_string),
                client_type: submission.get("clientType").and_then(Value::as_str).map(str::to_string),
            });
            derived.transferred.push(TransferredSubmission {
                group_id: group_id.clone(),
                user_id: user_id.clone(),
                snapshot: submission.clone(),
            });
            derived.newest = derived.newest.max(Some(timestamp));
        }
    }
    derived
}

/// Transaction body for the clear step: drop every transferred submission
/// that still holds the value that was read. Returns how many were removed.
pub fn remove_transferred(current: Option<&Value>, transferred: &[TransferredSubmission]) -> (Option<Value>, usize) {
    let Some(Value::Object(groups)) = current else {
        return (current.cloned(), 0);
    };
    let mut groups = groups.clone();
    let mut removed = 0;
    for t in transferred {
        let Some(Value::Object(users)) = groups.get_mut(&t.group_id) else {
            continue;
        };
        if users.get(&t.user_id) == Some(&t.snapshot) {
            users.remove(&t.user_id);
            removed += 1;
        }
        if users.is_empty() {
            groups.remove(&t.group_id);
        }
    }
    let next = if groups.is_empty() {
        None
    } else {
        Some(Value::Object(groups))
    };
    (next, removed)
}

/// Absolute counter values to publish, as one root-relative multi-path
/// update.
pub fn counter_update(project_id: &str, outcome: &LoadOutcome) -> Map<String, Value> {
    let mut update = Map::new();
    insert_group_counters(&mut update, project_id, &outcome.groups);
    let base = format!("projects/{}", project_id);
    update.insert(format!("{}/progress", base), json!(outcome.progress));
    update.insert(format!("{}/resultCount", base), json!(outcome.result_count));
    update.insert(format!("{}/contributorCount", base), json!(outcome.contributor_count));
    update
}

fn insert_group_counters(update: &mut Map<String, Value>, project_id: &str, groups: &BTreeMap<String, GroupCounters>) {
    for (group_id, c) in groups {
        let base = format!("groups/{}/{}", project_id, group_id);
        update.insert(format!("{}/finishedCount", base), json!(c.finished_count));
        update.insert(format!("{}/requiredCount", base), json!(c.required_count));
        update.insert(format!("{}/progress", base), json!(c.progress));
    }
}

fn parse_users(raw: &Map<String, Value>) -> Vec<UserRecord> {
    let mut users: BTreeMap<&str, UserRecord> = BTreeMap::new();
    for (user_id, doc) in raw {
        users.insert(
            user_id,
            UserRecord {
                user_id: user_id.clone(),
                username: doc.get("username").and_then(Value::as_str).map(str::to_string),
                created: doc.get("created").and_then(parse_timestamp),
            },
        );
    }
    users.into_values().collect()
}
