//! Project, group and task rows.
//!
//! ## Creation
//!
//! `insert_project` writes a whole partitioned project in one transaction:
//!
//! 1. Purge leftovers of an earlier failed attempt with the same id
//! 2. Insert the project row
//! 3. COPY groups and tasks into `ON COMMIT DROP` staging tables
//! 4. `INSERT … SELECT` from staging into `groups` and `tasks`
//!
//! A project with hundreds of thousands of tasks goes through in two COPY
//! round trips instead of one INSERT per row.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use tracing::{info, warn};

use super::{copy_csv, deletion, CsvBuffer, Database};
use crate::error::{Error, Result};
use crate::project::{Group, PartitionedProject, Project, ProjectStatus, ProjectType, Task};

#[derive(sqlx::FromRow)]
struct ProjectRow {
    project_id: String,
    name: String,
    project_type: i16,
    status: String,
    project_details: String,
    look_for: String,
    image: String,
    created_by: String,
    created: DateTime<Utc>,
    team_id: Option<String>,
    zoom_level: Option<i16>,
    verification_number: i32,
    required_results: i64,
    result_count: i64,
    contributor_count: i64,
    progress: i16,
    geometry: Option<String>,
    project_type_specifics: Json<Map<String, Value>>,
}

impl ProjectRow {
    fn into_project(self) -> Result<Project> {
        let project_type = ProjectType::try_from(self.project_type as i64)?;
        let status: ProjectStatus = self.status.parse().map_err(|message| Error::Consistency {
            project_id: self.project_id.clone(),
            message,
        })?;
        Ok(Project {
            project_id: self.project_id,
            name: self.name,
            project_type,
            status,
            project_details: self.project_details,
            look_for: self.look_for,
            image: self.image,
            created_by: self.created_by,
            created: self.created,
            team_id: self.team_id,
            zoom_level: self.zoom_level.map(|z| z as u8),
            verification_number: self.verification_number.max(0) as u32,
            required_results: self.required_results.max(0) as u64,
            result_count: self.result_count.max(0) as u64,
            contributor_count: self.contributor_count.max(0) as u64,
            progress: self.progress.clamp(0, 100) as u8,
            geometry: self.geometry,
            extension: self.project_type_specifics.0,
        })
    }
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    project_id: String,
    group_id: String,
    number_of_tasks: i32,
    finished_count: i32,
    required_count: i32,
    progress: i16,
    x_min: Option<i32>,
    x_max: Option<i32>,
    y_min: Option<i32>,
    y_max: Option<i32>,
    project_type_specifics: Json<Map<String, Value>>,
}

impl From<GroupRow> for Group {
    fn from(row: GroupRow) -> Self {
        Group {
            project_id: row.project_id,
            group_id: row.group_id,
            number_of_tasks: row.number_of_tasks.max(0) as u32,
            finished_count: row.finished_count.max(0) as u32,
            required_count: row.required_count.max(0) as u32,
            progress: row.progress.clamp(0, 100) as u8,
            x_min: row.x_min.map(|v| v as u32),
            x_max: row.x_max.map(|v| v as u32),
            y_min: row.y_min.map(|v| v as u32),
            y_max: row.y_max.map(|v| v as u32),
            extension: row.project_type_specifics.0,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    project_id: String,
    group_id: String,
    task_id: String,
    geometry: Option<String>,
    project_type_specifics: Json<Map<String, Value>>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Task {
            project_id: row.project_id,
            group_id: row.group_id,
            task_id: row.task_id,
            geometry: row.geometry,
            extension: row.project_type_specifics.0,
        }
    }
}

fn extension_json(extension: &Map<String, Value>) -> String {
    Value::Object(extension.clone()).to_string()
}

pub(crate) fn group_csv(groups: &[Group]) -> CsvBuffer {
    let mut csv = CsvBuffer::default();
    for g in groups {
        csv.text(&g.project_id)
            .text(&g.group_id)
            .value(g.number_of_tasks)
            .value(g.finished_count)
            .value(g.required_count)
            .value(g.progress)
            .opt_value(g.x_min)
            .opt_value(g.x_max)
            .opt_value(g.y_min)
            .opt_value(g.y_max)
            .text(&extension_json(&g.extension))
            .end_row();
    }
    csv
}

pub(crate) fn task_csv(tasks: &[Task]) -> CsvBuffer {
    let mut csv = CsvBuffer::default();
    for t in tasks {
        csv.text(&t.project_id)
            .text(&t.group_id)
            .text(&t.task_id)
            .opt_text(t.geometry.as_deref())
            .text(&extension_json(&t.extension))
            .end_row();
    }
    csv
}

const GROUP_COLUMNS: &str = "project_id, group_id, number_of_tasks, finished_count, required_count, \
     progress, x_min, x_max, y_min, y_max, project_type_specifics";
const TASK_COLUMNS: &str = "project_id, group_id, task_id, geometry, project_type_specifics";

impl Database {
    /// Insert a partitioned project with all its groups and tasks.
    ///
    /// Rows left behind by an earlier attempt for the same id are removed
    /// first, so a retried creation never trips over its own debris. A
    /// leftover that already has mapping sessions is real history and is
    /// never purged; the insert fails with [`Error::Consistency`] instead.
    pub async fn insert_project(&self, partitioned: &PartitionedProject) -> Result<()> {
        let project = &partitioned.project;
        let project_id = project.project_id.as_str();
        let inserted = self
            .insert_project_tx(partitioned)
            .await
            .map_err(|e| Error::from_db(project_id, e))?;
        if !inserted {
            warn!(project_id, "project id already has mapping sessions, refusing to overwrite");
            return Err(Error::Consistency {
                project_id: project_id.to_string(),
                message: "project already exists with mapping sessions".to_string(),
            });
        }
        info!(
            project_id,
            groups = partitioned.groups.len(),
            tasks = partitioned.tasks.len(),
            "project rows inserted"
        );
        Ok(())
    }

    /// Returns false, with nothing written, when the id already has history.
    async fn insert_project_tx(&self, partitioned: &PartitionedProject) -> sqlx::Result<bool> {
        let project = &partitioned.project;
        let mut tx = self.pool.begin().await?;

        let has_history: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM mapping_sessions WHERE project_id = $1)",
        )
        .bind(&project.project_id)
        .fetch_one(&mut *tx)
        .await?;
        if has_history {
            tx.rollback().await?;
            return Ok(false);
        }
        deletion::delete_rows(&mut *tx, &project.project_id).await?;

        sqlx::query(
            "INSERT INTO projects (project_id, name, project_type, status, project_details, look_for,
                                   image, created_by, created, team_id, zoom_level, verification_number,
                                   required_results, result_count, contributor_count, progress,
                                   geometry, project_type_specifics)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
        )
        .bind(&project.project_id)
        .bind(&project.name)
        .bind(project.project_type.as_i64() as i16)
        .bind(project.status.as_str())
        .bind(&project.project_details)
        .bind(&project.look_for)
        .bind(&project.image)
        .bind(&project.created_by)
        .bind(project.created)
        .bind(&project.team_id)
        .bind(project.zoom_level.map(i16::from))
        .bind(project.verification_number as i32)
        .bind(project.required_results as i64)
        .bind(project.result_count as i64)
        .bind(project.contributor_count as i64)
        .bind(project.progress as i16)
        .bind(&project.geometry)
        .bind(Json(&project.extension))
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE TEMP TABLE staging_groups (LIKE groups INCLUDING DEFAULTS) ON COMMIT DROP")
            .execute(&mut *tx)
            .await?;
        copy_csv(
            &mut *tx,
            &format!("staging_groups ({})", GROUP_COLUMNS),
            &group_csv(&partitioned.groups),
        )
        .await?;
        sqlx::query(&format!(
            "INSERT INTO groups ({cols}) SELECT {cols} FROM staging_groups",
            cols = GROUP_COLUMNS
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE TEMP TABLE staging_tasks (LIKE tasks INCLUDING DEFAULTS) ON COMMIT DROP")
            .execute(&mut *tx)
            .await?;
        copy_csv(
            &mut *tx,
            &format!("staging_tasks ({})", TASK_COLUMNS),
            &task_csv(&partitioned.tasks),
        )
        .await?;
        sqlx::query(&format!(
            "INSERT INTO tasks ({cols}) SELECT {cols} FROM staging_tasks",
            cols = TASK_COLUMNS
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// The subset of `ids` that exist as project rows.
    pub async fn existing_project_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT project_id FROM projects WHERE project_id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
        let row: Option<ProjectRow> = sqlx::query_as(
            "SELECT project_id, name, project_type, status, project_details, look_for, image,
                    created_by, created, team_id, zoom_level, verification_number, required_results,
                    result_count, contributor_count, progress, geometry, project_type_specifics
             FROM projects WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ProjectRow::into_project).transpose()
    }

    /// Groups of a project ordered by group id.
    pub async fn get_groups(&self, project_id: &str) -> Result<Vec<Group>> {
        let rows: Vec<GroupRow> = sqlx::query_as(&format!(
            "SELECT {} FROM groups WHERE project_id = $1 ORDER BY group_id",
            GROUP_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Group::from).collect())
    }

    /// Tasks of a project ordered by group and task id.
    pub async fn get_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM tasks WHERE project_id = $1 ORDER BY group_id, task_id",
            TASK_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Task::from).collect())
    }

    pub async fn count_tasks(&self, project_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE project_id = $1")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Returns false when the project row does not exist.
    pub async fn set_project_status(&self, project_id: &str, status: ProjectStatus) -> Result<bool> {
        let updated = sqlx::query("UPDATE projects SET status = $2 WHERE project_id = $1")
            .bind(project_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated > 0)
    }
}
