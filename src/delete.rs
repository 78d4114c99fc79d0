//! # Delete — Project Deletion and Archival
//!
//! Removes a project from both stores, or archives it.
//!
//! | Operation | Live store | Relational store |
//! |-----------|------------|------------------|
//! | delete | results, tasks, groupsUsers, groups, project | all rows, child tables first |
//! | archive | results, tasks, groupsUsers, groups | status `archived`, history kept |
//!
//! Large live subtrees are deleted in chunks of [`DELETE_CHUNK_SIZE`] keys.
//! Every step is idempotent, so a failed run is simply repeated; transient
//! failures are retried with backoff inside one run.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{info, info_span, warn, Instrument};

use crate::db::{DeletionSummary, RelationalStore};
use crate::error::{Error, JobFailure, Result};
use crate::live::{chunked_delete, LiveStore, DELETE_CHUNK_SIZE};
use crate::project::{lifecycle, ProjectStatus};
use crate::retry::{with_backoff, RetryPolicy};

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeletionReport {
    pub project_id: String,
    /// Multi-path delete calls made against the live store.
    pub live_calls: usize,
    pub rows: DeletionSummary,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub done: Vec<String>,
    pub failed: Vec<JobFailure>,
}

pub struct DeletionCoordinator {
    db: Arc<dyn RelationalStore>,
    live: Arc<dyn LiveStore>,
    retry: RetryPolicy,
    chunk_size: usize,
}

impl DeletionCoordinator {
    pub fn new(db: Arc<dyn RelationalStore>, live: Arc<dyn LiveStore>) -> Self {
        DeletionCoordinator {
            db,
            live,
            retry: RetryPolicy::default(),
            chunk_size: DELETE_CHUNK_SIZE,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Delete a project everywhere. Deleting an unknown project succeeds
    /// and changes nothing.
    pub async fn delete_project(&self, project_id: &str) -> Result<DeletionReport> {
        let span = info_span!("delete_project", project_id);
        async {
            let live_calls = with_backoff(&self.retry, "delete_live_project", || {
                self.purge_live(lifecycle::on_project_deleted(project_id))
            })
            .await?;
            let rows = with_backoff(&self.retry, "delete_project_rows", || {
                self.db.delete_project_rows(project_id)
            })
            .await?;
            info!(project_id, live_calls, rows = rows.total(), "project deleted");
            Ok(DeletionReport {
                project_id: project_id.to_string(),
                live_calls,
                rows,
            })
        }
        .instrument(span)
        .await
    }

    /// Empty a project's live subtrees and mark it archived in both stores.
    /// Relational results and sessions are kept.
    pub async fn archive_project(&self, project_id: &str) -> Result<DeletionReport> {
        let span = info_span!("archive_project", project_id);
        async {
            let live_calls = with_backoff(&self.retry, "purge_live_project", || {
                self.purge_live(lifecycle::archived_subtrees(project_id))
            })
            .await?;

            let status_path = format!("projects/{}/status", project_id);
            if self.live.get(&format!("projects/{}", project_id)).await?.is_some() {
                with_backoff(&self.retry, "archive_live_project", || async {
                    self.live
                        .set(&status_path, &json!(ProjectStatus::Archived.as_str()))
                        .await
                        .map_err(Error::from)
                })
                .await?;
            } else {
                warn!(project_id, "project document absent from live store");
            }

            let found = with_backoff(&self.retry, "archive_project_row", || {
                self.db.archive_project_row(project_id)
            })
            .await?;
            if !found {
                warn!(project_id, "project row absent from relational store");
            }
            info!(project_id, live_calls, "project archived");
            Ok(DeletionReport {
                project_id: project_id.to_string(),
                live_calls,
                rows: DeletionSummary::default(),
            })
        }
        .instrument(span)
        .await
    }

    /// Delete each project in turn; one failure does not stop the rest.
    pub async fn delete_projects(&self, project_ids: &[String]) -> BatchReport {
        let mut report = BatchReport::default();
        for id in project_ids {
            match self.delete_project(id).await {
                Ok(_) => report.done.push(id.clone()),
                Err(e) => {
                    warn!(project_id = %id, error = %e, "deletion failed");
                    report.failed.push(JobFailure::new(id, &e));
                }
            }
        }
        report
    }

    pub async fn archive_projects(&self, project_ids: &[String]) -> BatchReport {
        let mut report = BatchReport::default();
        for id in project_ids {
            match self.archive_project(id).await {
                Ok(_) => report.done.push(id.clone()),
                Err(e) => {
                    warn!(project_id = %id, error = %e, "archival failed");
                    report.failed.push(JobFailure::new(id, &e));
                }
            }
        }
        report
    }

    async fn purge_live(&self, paths: Vec<String>) -> Result<usize> {
        let mut calls = 0;
        for path in paths {
            calls += chunked_delete(self.live.as_ref(), &path, self.chunk_size).await?;
        }
        Ok(calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LoadOutcome, ProjectCounters, ResultBatch, UserRecord};
    use crate::live::memory::MemoryLiveStore;
    use crate::project::PartitionedProject;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::{Map, Value};
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Records deletions and archivals only.
    #[derive(Default)]
    struct RecordingStore {
        deleted: Mutex<Vec<String>>,
        archived: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RelationalStore for RecordingStore {
        async fn insert_project(&self, _: &PartitionedProject) -> Result<()> {
            Ok(())
        }
        async fn delete_project_rows(&self, project_id: &str) -> Result<DeletionSummary> {
            self.deleted.lock().unwrap().push(project_id.to_string());
            Ok(DeletionSummary {
                projects: 1,
                ..Default::default()
            })
        }
        async fn archive_project_row(&self, project_id: &str) -> Result<bool> {
            self.archived.lock().unwrap().push(project_id.to_string());
            Ok(true)
        }
        async fn existing_project_ids(&self, _: &[String]) -> Result<HashSet<String>> {
            Ok(HashSet::new())
        }
        async fn load_results(&self, _: &str, _: &ResultBatch) -> Result<LoadOutcome> {
            Ok(LoadOutcome::default())
        }
        async fn upsert_users(&self, _: &[UserRecord]) -> Result<u64> {
            Ok(0)
        }
        async fn get_watermark(&self, _: &str) -> Result<Option<DateTime<Utc>>> {
            Ok(None)
        }
        async fn set_watermark(&self, _: &str, _: DateTime<Utc>) -> Result<()> {
            Ok(())
        }
        async fn projects_with_results_since(
            &self,
            _: Option<DateTime<Utc>>,
        ) -> Result<(Vec<String>, Option<DateTime<Utc>>)> {
            Ok((Vec::new(), None))
        }
        async fn refresh_project_counters(&self, _: &str) -> Result<ProjectCounters> {
            Ok(ProjectCounters::default())
        }
        async fn update_project_metadata(
            &self,
            _: &str,
            _: Option<&str>,
            _: Option<ProjectStatus>,
        ) -> Result<bool> {
            Ok(true)
        }
    }

    fn project_tree(groups: usize) -> Value {
        let mut group_docs = Map::new();
        let mut task_docs = Map::new();
        for i in 0..groups {
            let gid = format!("g{}", 100 + i);
            group_docs.insert(gid.clone(), json!({"groupId": gid, "numberOfTasks": 1}));
            task_docs.insert(gid, json!([{"taskId": "0"}]));
        }
        json!({
            "projects": {"p1": {"name": "Test", "status": "active"}, "p2": {"name": "Other"}},
            "groups": {"p1": group_docs},
            "tasks": {"p1": task_docs},
            "results": {"p1": {"g100": {"u1": {"startTime": "x"}}}},
            "groupsUsers": {"p1": {"g100": {"u1": true}}},
        })
    }

    #[tokio::test]
    async fn delete_removes_every_subtree_in_chunks() {
        let live = MemoryLiveStore::with_data(project_tree(600));
        let db = Arc::new(RecordingStore::default());
        let coordinator = DeletionCoordinator::new(db.clone(), Arc::new(live.clone()));

        let report = coordinator.delete_project("p1").await.unwrap();
        // results 1 + tasks 3 + groupsUsers 1 + groups 3 + project 1
        assert_eq!(report.live_calls, 9);
        for path in ["projects/p1", "groups/p1", "tasks/p1", "results/p1", "groupsUsers/p1"] {
            assert_eq!(live.get(path).await.unwrap(), None, "{} left behind", path);
        }
        assert!(live.get("projects/p2").await.unwrap().is_some());
        assert_eq!(db.deleted.lock().unwrap().as_slice(), ["p1".to_string()]);
    }

    #[tokio::test]
    async fn deleting_twice_is_harmless() {
        let live = MemoryLiveStore::with_data(project_tree(3));
        let coordinator = DeletionCoordinator::new(Arc::new(RecordingStore::default()), Arc::new(live.clone()));
        coordinator.delete_project("p1").await.unwrap();
        let again = coordinator.delete_project("p1").await.unwrap();
        assert_eq!(again.live_calls, 0);
    }

    #[tokio::test]
    async fn archive_keeps_project_document_with_archived_status() {
        let live = MemoryLiveStore::with_data(project_tree(5));
        let db = Arc::new(RecordingStore::default());
        let coordinator = DeletionCoordinator::new(db.clone(), Arc::new(live.clone()));

        coordinator.archive_project("p1").await.unwrap();
        assert_eq!(live.get("projects/p1/status").await.unwrap(), Some(json!("archived")));
        assert_eq!(live.get("projects/p1/name").await.unwrap(), Some(json!("Test")));
        assert_eq!(live.get("groups/p1").await.unwrap(), None);
        assert_eq!(live.get("tasks/p1").await.unwrap(), None);
        assert_eq!(db.archived.lock().unwrap().as_slice(), ["p1".to_string()]);
        assert!(db.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn live_failure_stops_before_relational_delete() {
        let live = MemoryLiveStore::with_data(project_tree(3));
        live.inject_failure("tasks/p1");
        let db = Arc::new(RecordingStore::default());
        let coordinator =
            DeletionCoordinator::new(db.clone(), Arc::new(live.clone())).with_retry(RetryPolicy::immediate(2));

        let err = coordinator.delete_project("p1").await.unwrap_err();
        assert!(err.is_transient());
        assert!(db.deleted.lock().unwrap().is_empty());
        assert_eq!(live.get("results/p1").await.unwrap(), None);
        assert!(live.get("projects/p1").await.unwrap().is_some());

        live.clear_failures();
        let report = coordinator.delete_projects(&["p1".to_string()]).await;
        assert_eq!(report.done, vec!["p1".to_string()]);
        assert!(live.get("projects/p1").await.unwrap().is_none());
    }
}
