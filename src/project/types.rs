//! Project, group and task types shared by both stores.
//!
//! The serde representation is the live-store JSON (camelCase). Fields that
//! only some project types use live in the flattened `extension` map and are
//! stored verbatim in the relational `project_type_specifics` columns.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::geometry::{GroupPlan, TileBox};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum ProjectType {
    BuildArea,
    Footprint,
    ChangeDetection,
    Completeness,
    ImageValidation,
}

impl ProjectType {
    pub fn as_i64(self) -> i64 {
        match self {
            ProjectType::BuildArea => 1,
            ProjectType::Footprint => 2,
            ProjectType::ChangeDetection => 3,
            ProjectType::Completeness => 4,
            ProjectType::ImageValidation => 5,
        }
    }

    /// Types whose tasks are the tiles of each group's box.
    pub fn is_tile_grid(self) -> bool {
        matches!(
            self,
            ProjectType::BuildArea | ProjectType::ChangeDetection | ProjectType::Completeness
        )
    }
}

impl TryFrom<i64> for ProjectType {
    type Error = ValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ProjectType::BuildArea),
            2 => Ok(ProjectType::Footprint),
            3 => Ok(ProjectType::ChangeDetection),
            4 => Ok(ProjectType::Completeness),
            5 => Ok(ProjectType::ImageValidation),
            other => Err(ValidationError::UnknownProjectType(other)),
        }
    }
}

impl From<ProjectType> for i64 {
    fn from(t: ProjectType) -> i64 {
        t.as_i64()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Inactive,
    Active,
    Finished,
    Archived,
    PrivateInactive,
    PrivateActive,
    PrivateFinished,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectStatus::Inactive => "inactive",
            ProjectStatus::Active => "active",
            ProjectStatus::Finished => "finished",
            ProjectStatus::Archived => "archived",
            ProjectStatus::PrivateInactive => "private_inactive",
            ProjectStatus::PrivateActive => "private_active",
            ProjectStatus::PrivateFinished => "private_finished",
        }
    }

    pub fn is_private(self) -> bool {
        matches!(
            self,
            ProjectStatus::PrivateInactive | ProjectStatus::PrivateActive | ProjectStatus::PrivateFinished
        )
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(ProjectStatus::Inactive),
            "active" => Ok(ProjectStatus::Active),
            "finished" => Ok(ProjectStatus::Finished),
            "archived" => Ok(ProjectStatus::Archived),
            "private_inactive" => Ok(ProjectStatus::PrivateInactive),
            "private_active" => Ok(ProjectStatus::PrivateActive),
            "private_finished" => Ok(ProjectStatus::PrivateFinished),
            other => Err(format!("unknown project status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub project_id: String,
    pub name: String,
    pub project_type: ProjectType,
    pub status: ProjectStatus,
    #[serde(default)]
    pub project_details: String,
    #[serde(default)]
    pub look_for: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub created_by: String,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom_level: Option<u8>,
    pub verification_number: u32,
    pub required_results: u64,
    #[serde(default)]
    pub result_count: u64,
    #[serde(default)]
    pub contributor_count: u64,
    #[serde(default)]
    pub progress: u8,
    /// AOI as WKT; kept out of the live document.
    #[serde(skip)]
    pub geometry: Option<String>,
    #[serde(flatten)]
    pub extension: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub project_id: String,
    pub group_id: String,
    pub number_of_tasks: u32,
    #[serde(default)]
    pub finished_count: u32,
    #[serde(default)]
    pub required_count: u32,
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_min: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_max: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_min: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_max: Option<u32>,
    #[serde(flatten)]
    pub extension: Map<String, Value>,
}

impl Group {
    /// A fresh group for `plan` with zeroed counters.
    pub fn from_plan(project_id: &str, plan: &GroupPlan, number_of_tasks: u32) -> Self {
        let tile_box = plan.tile_box();
        Group {
            project_id: project_id.to_string(),
            group_id: plan.group_id.clone(),
            number_of_tasks,
            finished_count: 0,
            required_count: 0,
            progress: 0,
            x_min: tile_box.map(|b| b.x_min),
            x_max: tile_box.map(|b| b.x_max),
            y_min: tile_box.map(|b| b.y_min),
            y_max: tile_box.map(|b| b.y_max),
            extension: Map::new(),
        }
    }

    pub fn tile_box(&self) -> Option<TileBox> {
        Some(TileBox {
            x_min: self.x_min?,
            x_max: self.x_max?,
            y_min: self.y_min?,
            y_max: self.y_max?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub project_id: String,
    pub group_id: String,
    pub task_id: String,
    /// WKT of the task footprint, when the task has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<String>,
    #[serde(flatten)]
    pub extension: Map<String, Value>,
}

/// Summary numbers computed once at creation and logged/returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatistics {
    pub number_of_groups: usize,
    pub number_of_tasks: u64,
    pub required_results: u64,
    pub max_group_size: u32,
    pub mean_group_size: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area_km2: Option<f64>,
}
