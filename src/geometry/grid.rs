//! Tile-grid partitioner for build-area style projects.
//!
//! The AOI's tile bounding box is cut into bands of [`BAND_HEIGHT`] tile
//! rows. Each band is clipped against the AOI; the x-extent of every
//! resulting piece becomes a slice, and overlapping slices in the same band
//! are merged. Slices are then cut into columns of at most `group_width`
//! tiles, with the last column absorbing the remainder.

use geo::{Area, BooleanOps, BoundingRect, MultiPolygon};
use tracing::debug;

use super::aoi::Aoi;
use super::{number_groups, GroupExtent, GroupPlan, Partitioner, TileBox};
use crate::error::ValidationError;
use crate::tile::{self, Tile};

pub const BAND_HEIGHT: u32 = 3;

/// Clipped pieces smaller than this (in square degrees) are numerical
/// artifacts of the boolean operation, not real coverage.
pub const SLIVER_EPSILON: f64 = 1e-14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridPartitioner {
    pub zoom: u8,
    pub group_width: u32,
}

impl GridPartitioner {
    pub fn new(zoom: u8, group_width: u32) -> Self {
        GridPartitioner { zoom, group_width }
    }
}

impl Partitioner for GridPartitioner {
    type Input = Aoi;

    fn partition(&self, aoi: &Aoi) -> Result<Vec<GroupPlan>, ValidationError> {
        if self.group_width == 0 {
            return Err(ValidationError::InvalidGroupSize(0));
        }
        if !tile::is_valid_zoom(self.zoom as i64) {
            return Err(ValidationError::ZoomOutOfRange(self.zoom as i64));
        }
        let slices = horizontal_slices(aoi.geometry(), self.zoom)?;
        let boxes = vertical_slices(&slices, self.group_width);
        debug!(
            zoom = self.zoom,
            slices = slices.len(),
            groups = boxes.len(),
            "grid partition"
        );
        let plans = number_groups(boxes.into_iter().map(GroupExtent::Tiles));
        if plans.is_empty() {
            return Err(ValidationError::NoGroups);
        }
        Ok(plans)
    }
}

/// One slice per band and connected x-run of the clipped AOI.
pub fn horizontal_slices(aoi: &MultiPolygon<f64>, zoom: u8) -> Result<Vec<TileBox>, ValidationError> {
    let rect = aoi.bounding_rect().ok_or(ValidationError::EmptyGeometry)?;
    let (x_left, x_right) = tile::tile_x_span(rect.min().x, rect.max().x, zoom);
    let (y_top, y_bottom) = tile::tile_y_span(rect.min().y, rect.max().y, zoom);
    let last_row = tile::tiles_per_axis(zoom) - 1;

    let mut slices = Vec::new();
    let mut y = y_top;
    while y <= y_bottom {
        let band_bottom = (y + BAND_HEIGHT - 1).min(last_row);
        let band = MultiPolygon(vec![
            tile::tile_range_bounds(x_left, x_right, y, band_bottom, zoom).to_polygon(),
        ]);
        let clipped = band.intersection(aoi);

        let mut spans: Vec<(u32, u32)> = clipped
            .0
            .iter()
            .filter(|piece| piece.unsigned_area() >= SLIVER_EPSILON)
            .filter_map(|piece| piece.bounding_rect())
            .map(|r| tile::tile_x_span(r.min().x, r.max().x, zoom))
            .collect();
        spans.sort_unstable();

        for (x_min, x_max) in merge_overlapping(spans) {
            slices.push(TileBox {
                x_min,
                x_max,
                y_min: y,
                y_max: band_bottom,
            });
        }
        if band_bottom == last_row {
            break;
        }
        y += BAND_HEIGHT;
    }
    Ok(slices)
}

/// Merge sorted inclusive spans that share at least one tile.
fn merge_overlapping(spans: Vec<(u32, u32)>) -> Vec<(u32, u32)> {
    let mut merged: Vec<(u32, u32)> = Vec::with_capacity(spans.len());
    for (lo, hi) in spans {
        match merged.last_mut() {
            Some(last) if lo <= last.1 => last.1 = last.1.max(hi),
            _ => merged.push((lo, hi)),
        }
    }
    merged
}

/// Cut each slice into `ceil(w / width)` columns of `ceil(w / cols)` tiles.
pub fn vertical_slices(slices: &[TileBox], group_width: u32) -> Vec<TileBox> {
    let group_width = group_width.max(1);
    let mut boxes = Vec::new();
    for slice in slices {
        let w = slice.width();
        let cols = w.div_ceil(group_width);
        let step = w.div_ceil(cols);
        let mut x = slice.x_min;
        for col in 0..cols {
            if x > slice.x_max {
                break;
            }
            let x_max = if col == cols - 1 {
                slice.x_max
            } else {
                (x + step - 1).min(slice.x_max)
            };
            boxes.push(TileBox {
                x_min: x,
                x_max,
                ..*slice
            });
            x = x_max + 1;
        }
    }
    boxes
}

/// Every tile of the group box, row by row.
pub fn tasks_for_group(zoom: u8, group: &TileBox) -> Vec<Tile> {
    group.tiles(zoom).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn aoi(value: serde_json::Value, zoom: i64) -> Aoi {
        Aoi::from_geojson(&value, zoom).unwrap()
    }

    /// Square with the given south-west corner and side in degrees.
    fn square(lon: f64, lat: f64, side: f64) -> serde_json::Value {
        json!({
            "type": "Polygon",
            "coordinates": [[
                [lon, lat], [lon + side, lat], [lon + side, lat + side], [lon, lat + side], [lon, lat]
            ]]
        })
    }

    #[test]
    fn columns_split_evenly_with_remainder_last() {
        let slice = TileBox {
            x_min: 0,
            x_max: 99,
            y_min: 0,
            y_max: 2,
        };
        let boxes = vertical_slices(&[slice], 40);
        // w=100, cols=3, step=34
        let widths: Vec<u32> = boxes.iter().map(|b| b.width()).collect();
        assert_eq!(widths, vec![34, 34, 32]);
        assert_eq!(boxes[2].x_max, 99);
    }

    #[test]
    fn narrow_slice_is_one_group() {
        let slice = TileBox {
            x_min: 5,
            x_max: 7,
            y_min: 0,
            y_max: 2,
        };
        assert_eq!(vertical_slices(&[slice], 40), vec![slice]);
    }

    #[test]
    fn overlapping_spans_merge() {
        assert_eq!(
            merge_overlapping(vec![(0, 4), (3, 8), (10, 12), (12, 12)]),
            vec![(0, 8), (10, 12)]
        );
    }

    #[test]
    fn bands_are_three_rows() {
        let a = aoi(square(13.0, 52.0, 0.02), 18);
        let slices = horizontal_slices(a.geometry(), 18).unwrap();
        assert!(!slices.is_empty());
        for pair in slices.windows(2) {
            assert!(pair[0].y_min <= pair[1].y_min);
        }
        for s in &slices[..slices.len() - 1] {
            assert_eq!(s.height(), BAND_HEIGHT);
        }
    }

    #[test]
    fn ten_km_square_at_zoom_18() {
        // ~10 km on each side around the equator.
        let side = 10.0 / 111.32;
        let a = aoi(square(20.0, 0.0, side), 18);
        let partitioner = GridPartitioner::new(18, 15);
        let plans = partitioner.partition(&a).unwrap();

        let slices = horizontal_slices(a.geometry(), 18).unwrap();
        let expected: u32 = slices.iter().map(|s| s.width().div_ceil(15)).sum();
        assert_eq!(plans.len() as u32, expected);

        // Every tile of the square's tile bounding box, counted once.
        let (x_left, x_right) = tile::tile_x_span(20.0, 20.0 + side, 18);
        let (y_top, y_bottom) = tile::tile_y_span(0.0, side, 18);
        let full = (x_right - x_left + 1) as u64 * (y_bottom - y_top + 1) as u64;
        let total: u64 = plans.iter().map(|p| p.number_of_tasks()).sum();
        assert_eq!(total, full);
        // A zoom-18 tile is ~153 m wide at the equator: ~66 tiles per side.
        for span in [x_right - x_left + 1, y_bottom - y_top + 1] {
            assert!((65..=67).contains(&span), "span {}", span);
        }
        assert!((65 * 65..=67 * 67).contains(&total), "total {}", total);

        // A square yields one slice per band, each the full width.
        let w = slices[0].width();
        assert!(slices.iter().all(|s| s.width() == w));
        for plan in &plans {
            let b = plan.tile_box().unwrap();
            assert!(b.height() <= 3);
            assert!(b.width() <= 15);
        }
        assert_eq!(plans[0].group_id, "g100");
    }

    #[test]
    fn concave_shape_yields_two_slices_per_band() {
        // U shape: two prongs joined at the bottom.
        let u = json!({
            "type": "Polygon",
            "coordinates": [[
                [0.0, 0.0], [0.03, 0.0], [0.03, 0.03], [0.02, 0.03], [0.02, 0.01],
                [0.01, 0.01], [0.01, 0.03], [0.0, 0.03], [0.0, 0.0]
            ]]
        });
        let a = aoi(u, 16);
        let slices = horizontal_slices(a.geometry(), 16).unwrap();
        let top_row = slices[0].y_min;
        let top: Vec<_> = slices.iter().filter(|s| s.y_min == top_row).collect();
        assert_eq!(top.len(), 2);
        assert!(top[0].x_max < top[1].x_min);
    }

    #[test]
    fn partition_is_deterministic() {
        let a = aoi(square(-3.7, 40.4, 0.05), 17);
        let p = GridPartitioner::new(17, 20);
        assert_eq!(p.partition(&a).unwrap(), p.partition(&a).unwrap());
    }

    #[test]
    fn task_count_matches_box() {
        let b = TileBox {
            x_min: 3,
            x_max: 6,
            y_min: 9,
            y_max: 11,
        };
        let tasks = tasks_for_group(18, &b);
        assert_eq!(tasks.len() as u64, b.number_of_tasks());
        assert_eq!(tasks[0].task_id(), "18-3-9");
    }

    #[test]
    fn zero_width_is_rejected() {
        let a = aoi(square(13.0, 52.0, 0.01), 18);
        assert_eq!(
            GridPartitioner::new(18, 0).partition(&a),
            Err(ValidationError::InvalidGroupSize(0))
        );
    }
}
