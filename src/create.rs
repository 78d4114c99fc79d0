//! # Create — Dual-Write Project Creation
//!
//! Turns drafts under `projectDrafts/{id}` into projects in both stores.
//!
//! ## Order of writes
//!
//! 1. Validate and partition the draft (no side effects on failure)
//! 2. Refuse when `projects/{id}` already exists in the live store
//! 3. Relational transaction: project, groups, tasks
//! 4. Live store: `groups/{id}`, then `tasks/{id}/{groupId}` in chunks of
//!    [`TASK_CHUNK_GROUPS`] groups, then `projects/{id}` last so clients
//!    never see a project whose groups are missing
//! 5. Remove the draft
//!
//! A live-store failure in step 4 triggers compensation: the partial live
//! writes are removed and the relational rows deleted. The returned
//! [`Error::Create`] names the failing side and whether the cleanup held.

use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, info_span, warn, Instrument};

use crate::db::RelationalStore;
use crate::error::{Error, ErrorKind, JobFailure, Result, StoreSide, ValidationError};
use crate::live::{chunked_delete, LiveStore, DELETE_CHUNK_SIZE};
use crate::project::{
    build_project, lifecycle, Group, PartitionedProject, ProjectDraft, ProjectStatistics, Task, TaskStorage,
};

/// Groups per multi-path task write.
pub const TASK_CHUNK_GROUPS: usize = 250;

/// Task lists whose JSON exceeds this many bytes are stored compressed.
pub const COMPRESSION_THRESHOLD_BYTES: usize = 64 * 1024;

pub const DRAFTS_PATH: &str = "projectDrafts";

/// Summary of one created project.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedProject {
    pub project_id: String,
    pub project_type: i64,
    pub statistics: ProjectStatistics,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateReport {
    pub created: Vec<CreatedProject>,
    pub failed: Vec<JobFailure>,
}

pub struct ProjectCreator {
    db: Arc<dyn RelationalStore>,
    live: Arc<dyn LiveStore>,
    /// Lower-case tile-server name → API key.
    tileserver_keys: BTreeMap<String, String>,
}

impl ProjectCreator {
    pub fn new(
        db: Arc<dyn RelationalStore>,
        live: Arc<dyn LiveStore>,
        tileserver_keys: BTreeMap<String, String>,
    ) -> Self {
        ProjectCreator {
            db,
            live,
            tileserver_keys,
        }
    }

    /// Create every pending draft, or only `ids` when given. A failing draft
    /// is recorded in the report and does not stop the others.
    pub async fn create_projects(&self, ids: Option<&[String]>) -> Result<CreateReport> {
        let mut draft_ids = match ids {
            Some(ids) => ids.to_vec(),
            None => self.live.shallow_keys(DRAFTS_PATH).await?,
        };
        draft_ids.sort();
        draft_ids.dedup();

        let mut report = CreateReport::default();
        for draft_id in draft_ids {
            let span = info_span!("create_project", project_id = %draft_id);
            match self.create_project(&draft_id).instrument(span).await {
                Ok(created) => report.created.push(created),
                Err(e) => {
                    match e.kind() {
                        ErrorKind::Validation => warn!(project_id = %draft_id, error = %e, "draft rejected"),
                        _ => error!(project_id = %draft_id, error = %e, "project creation failed"),
                    }
                    report.failed.push(JobFailure::new(&draft_id, &e));
                }
            }
        }
        info!(
            created = report.created.len(),
            failed = report.failed.len(),
            "create_projects finished"
        );
        Ok(report)
    }

    /// Read `projectDrafts/{draft_id}` and create the project from it.
    pub async fn create_project(&self, draft_id: &str) -> Result<CreatedProject> {
        let path = format!("{}/{}", DRAFTS_PATH, draft_id);
        let value = self
            .live
            .get(&path)
            .await?
            .ok_or_else(|| ValidationError::InvalidDraft(format!("no draft at {}", path)))?;
        let draft = ProjectDraft::from_value(draft_id, value)?;
        self.create_from_draft(&draft).await
    }

    pub async fn create_from_draft(&self, draft: &ProjectDraft) -> Result<CreatedProject> {
        let project_id = draft.draft_id.as_str();

        for name in draft.keyed_tile_servers() {
            if !self.tileserver_keys.contains_key(name) {
                return Err(ValidationError::MissingTileServerKey(name.to_string()).into());
            }
        }
        let partitioned = build_project(draft, Utc::now())?;

        if self.live.get(&format!("projects/{}", project_id)).await?.is_some() {
            return Err(ValidationError::ProjectExists(project_id.to_string()).into());
        }

        self.db
            .insert_project(&partitioned)
            .await
            .map_err(|source| Error::Create {
                side: StoreSide::Relational,
                project_id: project_id.to_string(),
                // The transaction rolled back; nothing reached the live store.
                compensated: true,
                source: Box::new(source),
            })?;

        if let Err(source) = self.write_live(&partitioned).await {
            error!(project_id, error = %source, "live-store write failed, compensating");
            let compensated = self.compensate(project_id).await;
            return Err(Error::Create {
                side: StoreSide::LiveStore,
                project_id: project_id.to_string(),
                compensated,
                source: Box::new(source),
            });
        }

        if let Err(e) = self.live.delete(&format!("{}/{}", DRAFTS_PATH, project_id)).await {
            warn!(project_id, error = %e, "project created but draft could not be removed");
        }

        info!(
            project_id,
            groups = partitioned.statistics.number_of_groups,
            tasks = partitioned.statistics.number_of_tasks,
            "project created"
        );
        Ok(CreatedProject {
            project_id: project_id.to_string(),
            project_type: partitioned.project.project_type.as_i64(),
            statistics: partitioned.statistics,
        })
    }

    async fn write_live(&self, partitioned: &PartitionedProject) -> Result<()> {
        let project_id = partitioned.project.project_id.as_str();

        let groups = groups_document(&partitioned.groups)?;
        self.live.set(&format!("groups/{}", project_id), &groups).await?;

        if partitioned.task_storage == TaskStorage::LiveAndRelational {
            let tasks_path = format!("tasks/{}", project_id);
            for chunk in task_chunks(&partitioned.groups, &partitioned.tasks)? {
                self.live.update(&tasks_path, &chunk).await?;
            }
        }

        let project = serde_json::to_value(&partitioned.project)
            .map_err(|e| Error::Encode(format!("project {}: {}", project_id, e)))?;
        self.live.set(&format!("projects/{}", project_id), &project).await?;
        Ok(())
    }

    /// Best-effort removal of a half-created project from both stores.
    /// Returns true when every step succeeded.
    async fn compensate(&self, project_id: &str) -> bool {
        let mut clean = true;
        for path in lifecycle::on_project_deleted(project_id) {
            if let Err(e) = chunked_delete(self.live.as_ref(), &path, DELETE_CHUNK_SIZE).await {
                warn!(project_id, path = %path, error = %e, "live-store cleanup failed");
                clean = false;
            }
        }
        if let Err(e) = self.db.delete_project_rows(project_id).await {
            error!(project_id, error = %e, "relational cleanup failed, manual repair needed");
            clean = false;
        }
        clean
    }
}

/// `{groupId: group}` as written to `groups/{projectId}`.
pub fn groups_document(groups: &[Group]) -> Result<Value> {
    let mut doc = Map::new();
    for g in groups {
        let value = serde_json::to_value(g).map_err(|e| Error::Encode(format!("group {}: {}", g.group_id, e)))?;
        doc.insert(g.group_id.clone(), value);
    }
    Ok(Value::Object(doc))
}

/// Multi-path payloads for `tasks/{projectId}`, at most
/// [`TASK_CHUNK_GROUPS`] groups each, in group order.
pub fn task_chunks(groups: &[Group], tasks: &[Task]) -> Result<Vec<Map<String, Value>>> {
    let mut by_group: BTreeMap<&str, Vec<&Task>> = BTreeMap::new();
    for t in tasks {
        by_group.entry(t.group_id.as_str()).or_default().push(t);
    }
    let known: HashSet<&str> = groups.iter().map(|g| g.group_id.as_str()).collect();

    let mut chunks = Vec::new();
    let mut current = Map::new();
    for (group_id, group_tasks) in by_group {
        if !known.contains(group_id) {
            continue;
        }
        let list = serde_json::to_value(&group_tasks)
            .map_err(|e| Error::Encode(format!("tasks of {}: {}", group_id, e)))?;
        current.insert(group_id.to_string(), encode_task_list(list)?);
        if current.len() == TASK_CHUNK_GROUPS {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    Ok(chunks)
}

/// Task lists above [`COMPRESSION_THRESHOLD_BYTES`] become a base64 string
/// of the gzipped JSON.
pub fn encode_task_list(list: Value) -> Result<Value> {
    let json = list.to_string();
    if json.len() <= COMPRESSION_THRESHOLD_BYTES {
        return Ok(list);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(json.as_bytes())
        .map_err(|e| Error::Encode(format!("task list: {}", e)))?;
    let compressed = encoder.finish().map_err(|e| Error::Encode(format!("task list: {}", e)))?;
    Ok(Value::String(BASE64.encode(compressed)))
}

/// Inverse of [`encode_task_list`] as performed by clients.
pub fn decode_task_list(value: &Value) -> Result<Value> {
    let Value::String(encoded) = value else {
        return Ok(value.clone());
    };
    let compressed = BASE64
        .decode(encoded)
        .map_err(|e| Error::Encode(format!("task list base64: {}", e)))?;
    let mut json = String::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_string(&mut json)
        .map_err(|e| Error::Encode(format!("task list gzip: {}", e)))?;
    serde_json::from_str(&json).map_err(|e| Error::Encode(format!("task list json: {}", e)))
}
