//! Per-project-type behaviour behind one trait.
//!
//! [`ProjectType::strategy`] picks the implementation; [`build_project`]
//! drives it from draft to a fully partitioned project ready for both stores.

use chrono::{DateTime, Utc};
use geo::{BoundingRect, Centroid, Geometry, MultiPoint, Point};
use serde_json::{json, Map, Value};
use tracing::info;

use super::draft::{ImageRef, ProjectDraft};
use super::lifecycle;
use super::types::{Group, Project, ProjectStatistics, ProjectStatus, ProjectType, Task};
use crate::error::ValidationError;
use crate::geometry::aoi::{self, Aoi};
use crate::geometry::cluster::{ClusterItem, ClusterPartitioner};
use crate::geometry::geojson::{self, geometry_type_name};
use crate::geometry::grid::{self, GridPartitioner};
use crate::geometry::{number_groups, wkt, GroupExtent, GroupPlan, Partitioner};

pub const DEFAULT_GRID_GROUP_WIDTH: u32 = 40;
pub const DEFAULT_FOOTPRINT_GROUP_SIZE: u32 = 120;
pub const DEFAULT_IMAGE_GROUP_SIZE: u32 = 25;

/// Whether task lists are mirrored into the live store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStorage {
    /// Clients derive tasks from the group's tile box.
    RelationalOnly,
    LiveAndRelational,
}

/// A footprint task candidate after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureInput {
    pub task_id: String,
    pub wkt: String,
    pub centroid: ClusterItem,
    pub properties: Map<String, Value>,
}

/// Validated geometry input, one variant per strategy family.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedInput {
    Area(Aoi),
    Features(Vec<FeatureInput>),
    Images(Vec<ImageRef>),
}

pub trait ProjectStrategy: Send + Sync {
    fn validate_geometry(&self, draft: &ProjectDraft) -> Result<PreparedInput, ValidationError>;

    fn create_groups(
        &self,
        draft: &ProjectDraft,
        input: &PreparedInput,
    ) -> Result<Vec<GroupPlan>, ValidationError>;

    fn create_tasks(&self, project_id: &str, plan: &GroupPlan, input: &PreparedInput) -> Vec<Task>;

    fn save_tasks(&self) -> TaskStorage;

    fn compute_statistics(&self, groups: &[Group], _input: &PreparedInput) -> ProjectStatistics {
        base_statistics(groups, None)
    }
}

impl ProjectType {
    pub fn strategy(self) -> &'static dyn ProjectStrategy {
        match self {
            ProjectType::BuildArea | ProjectType::ChangeDetection | ProjectType::Completeness => {
                &TileGridStrategy
            }
            ProjectType::Footprint => &FootprintStrategy,
            ProjectType::ImageValidation => &ImageValidationStrategy,
        }
    }
}

fn base_statistics(groups: &[Group], area_km2: Option<f64>) -> ProjectStatistics {
    let number_of_tasks: u64 = groups.iter().map(|g| g.number_of_tasks as u64).sum();
    let mean_group_size = if groups.is_empty() {
        0.0
    } else {
        number_of_tasks as f64 / groups.len() as f64
    };
    ProjectStatistics {
        number_of_groups: groups.len(),
        number_of_tasks,
        required_results: lifecycle::required_results(groups),
        max_group_size: groups.iter().map(|g| g.number_of_tasks).max().unwrap_or(0),
        mean_group_size,
        area_km2,
    }
}

fn mismatched_input() -> ValidationError {
    ValidationError::InvalidDraft("geometry input does not match the project type".into())
}

// ── Tile grid ───────────────────────────────────────────────────

pub struct TileGridStrategy;

impl ProjectStrategy for TileGridStrategy {
    fn validate_geometry(&self, draft: &ProjectDraft) -> Result<PreparedInput, ValidationError> {
        let geometry = draft
            .geometry
            .as_ref()
            .ok_or(ValidationError::MissingField("geometry"))?;
        Ok(PreparedInput::Area(Aoi::from_geojson(geometry, draft.zoom_level())?))
    }

    fn create_groups(
        &self,
        draft: &ProjectDraft,
        input: &PreparedInput,
    ) -> Result<Vec<GroupPlan>, ValidationError> {
        let PreparedInput::Area(aoi) = input else {
            return Err(mismatched_input());
        };
        let width = draft.group_size_or(DEFAULT_GRID_GROUP_WIDTH)?;
        GridPartitioner::new(aoi.zoom(), width).partition(aoi)
    }

    fn create_tasks(&self, project_id: &str, plan: &GroupPlan, input: &PreparedInput) -> Vec<Task> {
        let (Some(tile_box), PreparedInput::Area(aoi)) = (plan.tile_box(), input) else {
            return Vec::new();
        };
        grid::tasks_for_group(aoi.zoom(), tile_box)
            .into_iter()
            .map(|t| {
                let mut extension = Map::new();
                extension.insert("taskX".into(), json!(t.x));
                extension.insert("taskY".into(), json!(t.y));
                extension.insert("taskZ".into(), json!(t.z));
                extension.insert("quadkey".into(), json!(t.quadkey()));
                Task {
                    project_id: project_id.to_string(),
                    group_id: plan.group_id.clone(),
                    task_id: t.task_id(),
                    geometry: Some(wkt::polygon_to_wkt(&t.polygon())),
                    extension,
                }
            })
            .collect()
    }

    fn save_tasks(&self) -> TaskStorage {
        TaskStorage::RelationalOnly
    }

    fn compute_statistics(&self, groups: &[Group], input: &PreparedInput) -> ProjectStatistics {
        let area = match input {
            PreparedInput::Area(aoi) => Some(aoi.area_km2()),
            _ => None,
        };
        base_statistics(groups, area)
    }
}

// ── Footprints ──────────────────────────────────────────────────

pub struct FootprintStrategy;

impl ProjectStrategy for FootprintStrategy {
    fn validate_geometry(&self, draft: &ProjectDraft) -> Result<PreparedInput, ValidationError> {
        let value = draft
            .geometry
            .as_ref()
            .ok_or(ValidationError::MissingField("geometry"))?;
        let features = geojson::parse_features(value)?;
        if features.is_empty() {
            return Err(ValidationError::EmptyGeometry);
        }

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::with_capacity(features.len());
        for (index, feature) in features.into_iter().enumerate() {
            match &feature.geometry {
                Geometry::Point(_) | Geometry::MultiPoint(_) => {}
                Geometry::Polygon(p) => aoi::validate_polygon(p)?,
                Geometry::MultiPolygon(mp) => {
                    for p in &mp.0 {
                        aoi::validate_polygon(p)?;
                    }
                }
                other => {
                    return Err(ValidationError::UnsupportedGeometry(
                        geometry_type_name(other).to_string(),
                    ))
                }
            }
            let centroid = feature
                .geometry
                .centroid()
                .ok_or(ValidationError::EmptyGeometry)?;
            let task_id = feature.id.clone().unwrap_or_else(|| index.to_string());
            if !seen.insert(task_id.clone()) {
                return Err(ValidationError::InvalidGeoJson(format!(
                    "duplicate feature id {}",
                    task_id
                )));
            }
            let wkt = wkt::geometry_to_wkt(&feature.geometry).ok_or_else(|| {
                ValidationError::UnsupportedGeometry(geometry_type_name(&feature.geometry).to_string())
            })?;
            out.push(FeatureInput {
                task_id,
                wkt,
                centroid: ClusterItem {
                    lon: centroid.x(),
                    lat: centroid.y(),
                },
                properties: feature.properties,
            });
        }
        Ok(PreparedInput::Features(out))
    }

    fn create_groups(
        &self,
        draft: &ProjectDraft,
        input: &PreparedInput,
    ) -> Result<Vec<GroupPlan>, ValidationError> {
        let PreparedInput::Features(features) = input else {
            return Err(mismatched_input());
        };
        let zoom = draft.zoom_level();
        if !crate::tile::is_valid_zoom(zoom) {
            return Err(ValidationError::ZoomOutOfRange(zoom));
        }
        let size = draft.group_size_or(DEFAULT_FOOTPRINT_GROUP_SIZE)?;
        let items: Vec<ClusterItem> = features.iter().map(|f| f.centroid).collect();
        ClusterPartitioner::new(zoom as u8, size as usize).partition(&items)
    }

    fn create_tasks(&self, project_id: &str, plan: &GroupPlan, input: &PreparedInput) -> Vec<Task> {
        let (GroupExtent::Items(indices), PreparedInput::Features(features)) = (&plan.extent, input) else {
            return Vec::new();
        };
        indices
            .iter()
            .filter_map(|&i| features.get(i))
            .map(|f| {
                let mut extension = Map::new();
                if !f.properties.is_empty() {
                    extension.insert("properties".into(), Value::Object(f.properties.clone()));
                }
                Task {
                    project_id: project_id.to_string(),
                    group_id: plan.group_id.clone(),
                    task_id: f.task_id.clone(),
                    geometry: Some(f.wkt.clone()),
                    extension,
                }
            })
            .collect()
    }

    fn save_tasks(&self) -> TaskStorage {
        TaskStorage::LiveAndRelational
    }
}

// ── Image validation ────────────────────────────────────────────

pub struct ImageValidationStrategy;

impl ProjectStrategy for ImageValidationStrategy {
    fn validate_geometry(&self, draft: &ProjectDraft) -> Result<PreparedInput, ValidationError> {
        if draft.images.is_empty() {
            return Err(ValidationError::MissingField("images"));
        }
        let mut seen = std::collections::HashSet::new();
        for (index, image) in draft.images.iter().enumerate() {
            if image.url.trim().is_empty() {
                return Err(ValidationError::InvalidDraft(format!("image {} has no url", index)));
            }
            let id = image.id.clone().unwrap_or_else(|| index.to_string());
            if !seen.insert(id.clone()) {
                return Err(ValidationError::InvalidDraft(format!("duplicate image id {}", id)));
            }
        }
        Ok(PreparedInput::Images(draft.images.clone()))
    }

    fn create_groups(
        &self,
        draft: &ProjectDraft,
        input: &PreparedInput,
    ) -> Result<Vec<GroupPlan>, ValidationError> {
        let PreparedInput::Images(images) = input else {
            return Err(mismatched_input());
        };
        let size = draft.group_size_or(DEFAULT_IMAGE_GROUP_SIZE)? as usize;
        let indices: Vec<usize> = (0..images.len()).collect();
        Ok(number_groups(
            indices.chunks(size).map(|c| GroupExtent::Items(c.to_vec())),
        ))
    }

    fn create_tasks(&self, project_id: &str, plan: &GroupPlan, input: &PreparedInput) -> Vec<Task> {
        let (GroupExtent::Items(indices), PreparedInput::Images(images)) = (&plan.extent, input) else {
            return Vec::new();
        };
        indices
            .iter()
            .filter_map(|&i| images.get(i).map(|img| (i, img)))
            .map(|(i, img)| {
                let mut extension = img.extension.clone();
                extension.insert("url".into(), json!(img.url));
                if let Some(name) = &img.file_name {
                    extension.insert("fileName".into(), json!(name));
                }
                Task {
                    project_id: project_id.to_string(),
                    group_id: plan.group_id.clone(),
                    task_id: img.id.clone().unwrap_or_else(|| i.to_string()),
                    geometry: None,
                    extension,
                }
            })
            .collect()
    }

    fn save_tasks(&self) -> TaskStorage {
        TaskStorage::LiveAndRelational
    }
}

// ── Driver ──────────────────────────────────────────────────────

/// A project partitioned into groups and tasks, not yet persisted.
#[derive(Debug, Clone)]
pub struct PartitionedProject {
    pub project: Project,
    pub groups: Vec<Group>,
    pub tasks: Vec<Task>,
    pub statistics: ProjectStatistics,
    pub task_storage: TaskStorage,
}

fn project_geometry(input: &PreparedInput) -> Option<String> {
    match input {
        PreparedInput::Area(aoi) => Some(aoi.to_wkt()),
        PreparedInput::Features(features) => {
            let points: Vec<Point<f64>> = features
                .iter()
                .map(|f| Point::new(f.centroid.lon, f.centroid.lat))
                .collect();
            MultiPoint(points)
                .bounding_rect()
                .map(|r| wkt::polygon_to_wkt(&r.to_polygon()))
        }
        PreparedInput::Images(_) => None,
    }
}

/// Validate a draft and partition it. No side effects.
pub fn build_project(draft: &ProjectDraft, now: DateTime<Utc>) -> Result<PartitionedProject, ValidationError> {
    let project_type = ProjectType::try_from(draft.project_type_code()?)?;
    let name = draft.name()?.to_string();
    let verification_number = draft.verification_number()?;
    let strategy = project_type.strategy();

    let input = strategy.validate_geometry(draft)?;
    let plans = strategy.create_groups(draft, &input)?;

    let project_id = draft.draft_id.as_str();
    let mut groups = Vec::with_capacity(plans.len());
    let mut tasks = Vec::new();
    for plan in &plans {
        let group_tasks = strategy.create_tasks(project_id, plan, &input);
        if group_tasks.is_empty() {
            continue;
        }
        groups.push(Group::from_plan(project_id, plan, group_tasks.len() as u32));
        tasks.extend(group_tasks);
    }
    if groups.is_empty() {
        return Err(ValidationError::NoGroups);
    }

    let mut extension = draft.extension.clone();
    if let Some(ts) = &draft.tile_server {
        extension.insert("tileServer".into(), json!(ts));
    }
    if let Some(ts) = &draft.tile_server_b {
        extension.insert("tileServerB".into(), json!(ts));
    }
    let zoom_level = match &input {
        PreparedInput::Area(aoi) => Some(aoi.zoom()),
        PreparedInput::Features(_) => Some(draft.zoom_level() as u8),
        PreparedInput::Images(_) => None,
    };

    let mut project = Project {
        project_id: project_id.to_string(),
        name,
        project_type,
        status: if draft.team_id.is_some() {
            ProjectStatus::PrivateInactive
        } else {
            ProjectStatus::Inactive
        },
        project_details: draft.project_details.clone(),
        look_for: draft.look_for.clone(),
        image: draft.image.clone(),
        created_by: draft.created_by.clone(),
        created: now,
        team_id: draft.team_id.clone(),
        zoom_level,
        verification_number,
        required_results: 0,
        result_count: 0,
        contributor_count: 0,
        progress: 0,
        geometry: project_geometry(&input),
        extension,
    };
    lifecycle::on_project_created(&mut project, &mut groups);
    let statistics = strategy.compute_statistics(&groups, &input);

    info!(
        project_id,
        project_type = project_type.as_i64(),
        groups = statistics.number_of_groups,
        tasks = statistics.number_of_tasks,
        required_results = statistics.required_results,
        "project partitioned"
    );

    Ok(PartitionedProject {
        project,
        groups,
        tasks,
        statistics,
        task_storage: strategy.save_tasks(),
    })
}
