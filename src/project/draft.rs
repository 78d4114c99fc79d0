//! Project drafts as submitted by the project manager UI.
//!
//! Drafts live under `projectDrafts/{id}` in the live store. The draft id
//! becomes the project id. Keys this crate does not interpret are kept in
//! `extension` and copied onto the project document unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

pub const DEFAULT_VERIFICATION_NUMBER: i64 = 3;
pub const DEFAULT_ZOOM_LEVEL: i64 = 18;

/// Tile servers whose imagery needs an API key configured on the worker.
pub const KEYED_TILE_SERVERS: &[&str] = &["bing", "mapbox", "maxar_premium", "maxar_standard"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileServer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits: Option<String>,
    #[serde(flatten)]
    pub extension: Map<String, Value>,
}

impl TileServer {
    pub fn requires_api_key(&self) -> bool {
        KEYED_TILE_SERVERS.contains(&self.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(flatten)]
    pub extension: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDraft {
    /// Filled from the store key, not from the document.
    #[serde(skip)]
    pub draft_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub project_type: Option<i64>,
    #[serde(default)]
    pub project_details: String,
    #[serde(default)]
    pub look_for: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub verification_number: Option<i64>,
    #[serde(default)]
    pub group_size: Option<i64>,
    #[serde(default)]
    pub zoom_level: Option<i64>,
    #[serde(default)]
    pub geometry: Option<Value>,
    #[serde(default)]
    pub tile_server: Option<TileServer>,
    #[serde(default)]
    pub tile_server_b: Option<TileServer>,
    #[serde(default)]
    pub images: Vec<ImageRef>,
    #[serde(flatten)]
    pub extension: Map<String, Value>,
}

impl ProjectDraft {
    pub fn from_value(draft_id: &str, value: Value) -> Result<Self, ValidationError> {
        let mut draft: ProjectDraft =
            serde_json::from_value(value).map_err(|e| ValidationError::InvalidDraft(e.to_string()))?;
        draft.draft_id = draft_id.to_string();
        Ok(draft)
    }

    pub fn name(&self) -> Result<&str, ValidationError> {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .ok_or(ValidationError::MissingField("name"))
    }

    pub fn project_type_code(&self) -> Result<i64, ValidationError> {
        self.project_type.ok_or(ValidationError::MissingField("projectType"))
    }

    pub fn verification_number(&self) -> Result<u32, ValidationError> {
        let v = self.verification_number.unwrap_or(DEFAULT_VERIFICATION_NUMBER);
        if v <= 0 || v > u32::MAX as i64 {
            return Err(ValidationError::InvalidVerificationNumber(v));
        }
        Ok(v as u32)
    }

    /// Group width (grid types) or size (others), falling back to `default`.
    pub fn group_size_or(&self, default: u32) -> Result<u32, ValidationError> {
        match self.group_size {
            None => Ok(default),
            Some(n) if n > 0 && n <= u32::MAX as i64 => Ok(n as u32),
            Some(n) => Err(ValidationError::InvalidGroupSize(n)),
        }
    }

    pub fn zoom_level(&self) -> i64 {
        self.zoom_level.unwrap_or(DEFAULT_ZOOM_LEVEL)
    }

    /// Names of the configured tile servers that need an API key.
    pub fn keyed_tile_servers(&self) -> Vec<&str> {
        [&self.tile_server, &self.tile_server_b]
            .into_iter()
            .flatten()
            .filter(|t| t.requires_api_key())
            .map(|t| t.name.as_str())
            .collect()
    }
}
