//! # Geometry — AOI Validation and Partitioning
//!
//! Turns an area of interest into groups of tasks. Two partitioners share the
//! [`Partitioner`] contract:
//!
//! - [`grid::GridPartitioner`] — slices a validated [`aoi::Aoi`] into 3-row
//!   bands and fixed-width columns of map tiles.
//! - [`cluster::ClusterPartitioner`] — groups irregular items (building
//!   footprints, points) by tile proximity, bisecting oversized clusters on a
//!   small rayon pool.
//!
//! Both are pure: identical input always yields identical groups in the same
//! order, with ids `g100`, `g101`, … assigned in output order.
//!
//! ## Submodules
//!
//! - [`geojson`] — GeoJSON parsing into `geo` types
//! - [`wkt`] — WKT text for relational geometry columns
//! - [`aoi`] — shape validation and the zoom-dependent area ceiling

pub mod aoi;
pub mod cluster;
pub mod geojson;
pub mod grid;
pub mod wkt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::tile::{self, Tile};

/// Group ids start here, so ids sort the same as strings and as numbers.
pub const FIRST_GROUP_NUMBER: usize = 100;

pub fn group_id(index: usize) -> String {
    format!("g{}", FIRST_GROUP_NUMBER + index)
}

/// Inclusive block of tiles `[x_min, x_max] × [y_min, y_max]` at one zoom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileBox {
    pub x_min: u32,
    pub x_max: u32,
    pub y_min: u32,
    pub y_max: u32,
}

impl TileBox {
    pub fn width(&self) -> u32 {
        self.x_max.saturating_sub(self.x_min) + 1
    }

    pub fn height(&self) -> u32 {
        self.y_max.saturating_sub(self.y_min) + 1
    }

    pub fn number_of_tasks(&self) -> u64 {
        if self.x_max < self.x_min || self.y_max < self.y_min {
            return 0;
        }
        self.width() as u64 * self.height() as u64
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        (self.x_min..=self.x_max).contains(&x) && (self.y_min..=self.y_max).contains(&y)
    }

    /// Row-major enumeration of the tiles in the box.
    pub fn tiles(&self, zoom: u8) -> impl Iterator<Item = Tile> + '_ {
        (self.y_min..=self.y_max)
            .flat_map(move |y| (self.x_min..=self.x_max).map(move |x| Tile::new(x, y, zoom)))
    }

    pub fn polygon(&self, zoom: u8) -> geo::Polygon<f64> {
        tile::tile_range_bounds(self.x_min, self.x_max, self.y_min, self.y_max, zoom).to_polygon()
    }
}

/// Where a group's tasks come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupExtent {
    /// Every tile of the box is a task.
    Tiles(TileBox),
    /// Indices into the partitioner's input, ascending.
    Items(Vec<usize>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPlan {
    pub group_id: String,
    pub extent: GroupExtent,
}

impl GroupPlan {
    pub fn number_of_tasks(&self) -> u64 {
        match &self.extent {
            GroupExtent::Tiles(b) => b.number_of_tasks(),
            GroupExtent::Items(items) => items.len() as u64,
        }
    }

    pub fn tile_box(&self) -> Option<&TileBox> {
        match &self.extent {
            GroupExtent::Tiles(b) => Some(b),
            GroupExtent::Items(_) => None,
        }
    }
}

/// Deterministic split of some input into ordered groups.
pub trait Partitioner {
    type Input: ?Sized;

    fn partition(&self, input: &Self::Input) -> Result<Vec<GroupPlan>, ValidationError>;
}

/// Number plans in order, dropping any that ended up empty.
pub(crate) fn number_groups(extents: impl IntoIterator<Item = GroupExtent>) -> Vec<GroupPlan> {
    extents
        .into_iter()
        .filter(|e| match e {
            GroupExtent::Tiles(b) => b.number_of_tasks() > 0,
            GroupExtent::Items(items) => !items.is_empty(),
        })
        .enumerate()
        .map(|(i, extent)| GroupPlan {
            group_id: group_id(i),
            extent,
        })
        .collect()
}
