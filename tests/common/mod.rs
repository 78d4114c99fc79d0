//! Shared test helpers for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, Once};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crowdmap::db::{
    DeletionSummary, LoadOutcome, ProjectCounters, RelationalStore, ResultBatch, UserRecord,
};
use crowdmap::error::{Error, Result};
use crowdmap::project::lifecycle::{self, GroupCounters};
use crowdmap::project::{Group, PartitionedProject, Project, ProjectStatus, Task};
use serde_json::{json, Value};

// ── Postgres ────────────────────────────────────────────────────

/// Returns the test database URL from the `TEST_DATABASE_URL` environment variable.
/// Panics if the variable is not set.
pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for integration tests")
}

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

static SCHEMA_INIT: Once = Once::new();

/// Apply the schema once per test binary.
pub fn ensure_schema() {
    SCHEMA_INIT.call_once(|| {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let pool = sqlx::PgPool::connect(&test_db_url()).await.unwrap();
            sqlx::raw_sql(crowdmap::db::SCHEMA_SQL)
                .execute(&pool)
                .await
                .unwrap_or_else(|e| panic!("schema failed: {}", e));
        });
    });
}

/// Connect to the test database with empty tables.
pub async fn setup_test_db() -> crowdmap::db::Database {
    ensure_schema();
    let db = crowdmap::db::Database::connect(&test_db_url(), 5)
        .await
        .expect("Failed to connect to test database");
    truncate_all_tables(db.pool()).await;
    db
}

/// Truncate all tables to ensure test isolation.
pub async fn truncate_all_tables(pool: &sqlx::PgPool) {
    sqlx::raw_sql(
        "TRUNCATE TABLE results, mapping_sessions, tasks, groups, projects, users, sync_watermarks CASCADE",
    )
    .execute(pool)
    .await
    .unwrap();
}

// ── Fixtures ────────────────────────────────────────────────────

/// A ~1 km square starting at (`lon`, `lat`) as a FeatureCollection.
pub fn square(lon: f64, lat: f64, side: f64) -> Value {
    json!({
        "type": "FeatureCollection",
        "features": [{
            "type": "Feature",
            "properties": {},
            "geometry": {
                "type": "Polygon",
                "coordinates": [[
                    [lon, lat], [lon + side, lat], [lon + side, lat + side], [lon, lat + side], [lon, lat]
                ]]
            }
        }]
    })
}

pub fn grid_draft_value() -> Value {
    json!({
        "name": "Lake Malawi shore",
        "projectType": 1,
        "zoomLevel": 18,
        "groupSize": 20,
        "verificationNumber": 3,
        "projectDetails": "Find buildings",
        "lookFor": "buildings",
        "createdBy": "manager-1",
        "geometry": square(34.5, -12.0, 0.01),
        "tileServer": {"name": "custom", "url": "https://tiles.example/{z}/{x}/{y}.png"}
    })
}

pub fn footprint_draft_value(features: usize) -> Value {
    let features: Vec<Value> = (0..features)
        .map(|i| {
            json!({
                "type": "Feature",
                "id": format!("b{}", i),
                "properties": {"osm_id": i},
                "geometry": {"type": "Point", "coordinates": [30.0 + i as f64 * 0.0001, -1.0]}
            })
        })
        .collect();
    json!({
        "name": "Buildings",
        "projectType": 2,
        "groupSize": 10,
        "verificationNumber": 2,
        "geometry": {"type": "FeatureCollection", "features": features}
    })
}

/// One submission as the mobile client writes it.
pub fn submission(results: Value, end: &str) -> Value {
    json!({
        "startTime": "2024-05-01T10:00:00.000Z",
        "endTime": end,
        "appVersion": "2.4.1",
        "clientType": "mobile-android",
        "results": results,
    })
}

// ── In-memory relational store ──────────────────────────────────

#[derive(Default)]
struct Tables {
    projects: BTreeMap<String, Project>,
    groups: BTreeMap<(String, String), Group>,
    tasks: BTreeMap<(String, String, String), Task>,
    users: BTreeMap<String, UserRecord>,
    sessions: BTreeSet<(String, String, String)>,
    results: BTreeMap<(String, String, String, String), DateTime<Utc>>,
    watermarks: BTreeMap<String, DateTime<Utc>>,
}

/// Relational store kept in memory with the same key and counter rules as
/// the Postgres schema.
#[derive(Default)]
pub struct MemoryRelationalStore {
    tables: Mutex<Tables>,
    fail_inserts: Mutex<bool>,
    fail_loads: Mutex<bool>,
}

impl MemoryRelationalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_inserts(&self, fail: bool) {
        *self.fail_inserts.lock().unwrap() = fail;
    }

    pub fn fail_loads(&self, fail: bool) {
        *self.fail_loads.lock().unwrap() = fail;
    }

    pub fn project(&self, id: &str) -> Option<Project> {
        self.tables.lock().unwrap().projects.get(id).cloned()
    }

    pub fn groups(&self, id: &str) -> Vec<Group> {
        let t = self.tables.lock().unwrap();
        t.groups.values().filter(|g| g.project_id == id).cloned().collect()
    }

    pub fn task_count(&self, id: &str) -> usize {
        self.tables.lock().unwrap().tasks.keys().filter(|k| k.0 == id).count()
    }

    pub fn session_count(&self, id: &str) -> usize {
        self.tables.lock().unwrap().sessions.iter().filter(|k| k.0 == id).count()
    }

    pub fn result_count(&self, id: &str) -> usize {
        self.tables.lock().unwrap().results.keys().filter(|k| k.0 == id).count()
    }

    pub fn user(&self, id: &str) -> Option<UserRecord> {
        self.tables.lock().unwrap().users.get(id).cloned()
    }

    pub fn watermark(&self, job: &str) -> Option<DateTime<Utc>> {
        self.tables.lock().unwrap().watermarks.get(job).copied()
    }

    fn purge(t: &mut Tables, id: &str) -> DeletionSummary {
        let before = (t.results.len(), t.sessions.len(), t.tasks.len(), t.groups.len(), t.projects.len());
        t.results.retain(|k, _| k.0 != id);
        t.sessions.retain(|k| k.0 != id);
        t.tasks.retain(|k, _| k.0 != id);
        t.groups.retain(|k, _| k.0 != id);
        t.projects.remove(id);
        DeletionSummary {
            results: (before.0 - t.results.len()) as u64,
            mapping_sessions: (before.1 - t.sessions.len()) as u64,
            tasks: (before.2 - t.tasks.len()) as u64,
            groups: (before.3 - t.groups.len()) as u64,
            project_statistics: 0,
            projects: (before.4 - t.projects.len()) as u64,
        }
    }
}

#[async_trait]
impl RelationalStore for MemoryRelationalStore {
    async fn insert_project(&self, p: &PartitionedProject) -> Result<()> {
        if *self.fail_inserts.lock().unwrap() {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        let mut t = self.tables.lock().unwrap();
        let id = p.project.project_id.clone();
        if t.sessions.iter().any(|k| k.0 == id) {
            return Err(Error::Consistency {
                project_id: id,
                message: "project already exists with mapping sessions".to_string(),
            });
        }
        Self::purge(&mut t, &id);
        t.projects.insert(id.clone(), p.project.clone());
        for g in &p.groups {
            t.groups.insert((id.clone(), g.group_id.clone()), g.clone());
        }
        for task in &p.tasks {
            t.tasks
                .insert((id.clone(), task.group_id.clone(), task.task_id.clone()), task.clone());
        }
        Ok(())
    }

    async fn delete_project_rows(&self, project_id: &str) -> Result<DeletionSummary> {
        let mut t = self.tables.lock().unwrap();
        Ok(Self::purge(&mut t, project_id))
    }

    async fn archive_project_row(&self, project_id: &str) -> Result<bool> {
        let mut t = self.tables.lock().unwrap();
        match t.projects.get_mut(project_id) {
            Some(p) => {
                p.status = ProjectStatus::Archived;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn existing_project_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let t = self.tables.lock().unwrap();
        Ok(ids.iter().filter(|id| t.projects.contains_key(*id)).cloned().collect())
    }

    async fn load_results(&self, project_id: &str, batch: &ResultBatch) -> Result<LoadOutcome> {
        if *self.fail_loads.lock().unwrap() {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        let mut guard = self.tables.lock().unwrap();
        let t = &mut *guard;
        let mut outcome = LoadOutcome::default();

        let mut per_group: BTreeMap<String, u32> = BTreeMap::new();
        for s in &batch.sessions {
            t.users.entry(s.user_id.clone()).or_insert_with(|| UserRecord {
                user_id: s.user_id.clone(),
                username: None,
                created: None,
            });
            if t.sessions
                .insert((project_id.to_string(), s.group_id.clone(), s.user_id.clone()))
            {
                outcome.sessions_inserted += 1;
                *per_group.entry(s.group_id.clone()).or_default() += 1;
            }
        }
        for r in &batch.results {
            let key = (
                project_id.to_string(),
                r.group_id.clone(),
                r.user_id.clone(),
                r.task_id.clone(),
            );
            if !t.results.contains_key(&key) {
                t.results.insert(key, r.timestamp);
                outcome.results_inserted += 1;
            }
        }

        for (group_id, n) in per_group {
            if let Some(g) = t.groups.get_mut(&(project_id.to_string(), group_id)) {
                let next = lifecycle::apply_submissions(g.counters(), n);
                g.set_counters(next);
            }
        }
        for group_id in batch.group_ids() {
            if let Some(g) = t.groups.get(&(project_id.to_string(), group_id.to_string())) {
                outcome.groups.insert(group_id.to_string(), g.counters());
            }
        }

        let counters: Vec<GroupCounters> = t
            .groups
            .values()
            .filter(|g| g.project_id == project_id)
            .map(Group::counters)
            .collect();
        let contributors: HashSet<&String> = t
            .sessions
            .iter()
            .filter(|k| k.0 == project_id)
            .map(|k| &k.2)
            .collect();
        let contributor_count = contributors.len() as u64;
        if let Some(p) = t.projects.get_mut(project_id) {
            p.progress = lifecycle::project_progress(p.verification_number, p.required_results, &counters);
            p.result_count += outcome.results_inserted;
            p.contributor_count = contributor_count;
            outcome.progress = p.progress;
            outcome.result_count = p.result_count;
            outcome.contributor_count = p.contributor_count;
        }
        Ok(outcome)
    }

    async fn upsert_users(&self, users: &[UserRecord]) -> Result<u64> {
        let mut t = self.tables.lock().unwrap();
        for u in users {
            let entry = t.users.entry(u.user_id.clone()).or_insert_with(|| u.clone());
            entry.username = u.username.clone().or(entry.username.take());
            entry.created = u.created.or(entry.created);
        }
        Ok(users.len() as u64)
    }

    async fn get_watermark(&self, job: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.watermark(job))
    }

    async fn set_watermark(&self, job: &str, ts: DateTime<Utc>) -> Result<()> {
        let mut t = self.tables.lock().unwrap();
        let entry = t.watermarks.entry(job.to_string()).or_insert(ts);
        *entry = (*entry).max(ts);
        Ok(())
    }

    async fn projects_with_results_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<(Vec<String>, Option<DateTime<Utc>>)> {
        let t = self.tables.lock().unwrap();
        let mut ids = BTreeSet::new();
        let mut newest = None;
        for (key, ts) in &t.results {
            if since.map_or(true, |s| *ts > s) {
                ids.insert(key.0.clone());
                newest = newest.max(Some(*ts));
            }
        }
        Ok((ids.into_iter().collect(), newest))
    }

    async fn refresh_project_counters(&self, project_id: &str) -> Result<ProjectCounters> {
        let t = self.tables.lock().unwrap();
        let Some(p) = t.projects.get(project_id) else {
            return Ok(ProjectCounters::default());
        };
        Ok(ProjectCounters {
            progress: p.progress,
            result_count: t.results.keys().filter(|k| k.0 == project_id).count() as u64,
            contributor_count: t
                .sessions
                .iter()
                .filter(|k| k.0 == project_id)
                .map(|k| &k.2)
                .collect::<HashSet<_>>()
                .len() as u64,
            groups: t
                .groups
                .values()
                .filter(|g| g.project_id == project_id)
                .map(|g| (g.group_id.clone(), g.counters()))
                .collect(),
        })
    }

    async fn update_project_metadata(
        &self,
        project_id: &str,
        name: Option<&str>,
        status: Option<ProjectStatus>,
    ) -> Result<bool> {
        let mut t = self.tables.lock().unwrap();
        let Some(p) = t.projects.get_mut(project_id) else {
            return Ok(false);
        };
        if let Some(name) = name {
            p.name = name.to_string();
        }
        if let Some(status) = status {
            p.status = status;
        }
        Ok(true)
    }
}
