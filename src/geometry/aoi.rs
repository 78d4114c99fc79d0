//! AOI validation: shape checks and the zoom-dependent area ceiling.

use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
use geo::{Area, BoundingRect, ChamberlainDuquetteArea, Geometry, Line, LineString, MultiPolygon, Polygon, Rect};
use serde_json::Value;

use super::geojson::{self, geometry_type_name};
use super::wkt;
use crate::error::ValidationError;
use crate::tile;

/// Rings longer than this skip the quadratic self-intersection scan.
const MAX_SEGMENTS_CHECKED: usize = 5_000;

/// Area ceiling in km² for an AOI mapped at `zoom`. Each zoom step quarters
/// the tile footprint, so the ceiling shrinks by the same factor.
pub fn max_area_km2(zoom: u8) -> f64 {
    5000.0 * 4f64.powi(18 - zoom as i32)
}

/// A validated area of interest.
#[derive(Debug, Clone, PartialEq)]
pub struct Aoi {
    geometry: MultiPolygon<f64>,
    area_km2: f64,
    zoom: u8,
}

impl Aoi {
    /// Parse and validate a GeoJSON AOI for mapping at `zoom`.
    pub fn from_geojson(value: &Value, zoom: i64) -> Result<Self, ValidationError> {
        let features = geojson::parse_features(value)?;
        if features.is_empty() {
            return Err(ValidationError::EmptyGeometry);
        }
        let mut polygons = Vec::new();
        for feature in features {
            match feature.geometry {
                Geometry::Polygon(p) => polygons.push(p),
                Geometry::MultiPolygon(mp) => polygons.extend(mp.0),
                other => {
                    return Err(ValidationError::UnsupportedGeometry(
                        geometry_type_name(&other).to_string(),
                    ))
                }
            }
        }
        Self::from_multipolygon(MultiPolygon(polygons), zoom)
    }

    pub fn from_multipolygon(geometry: MultiPolygon<f64>, zoom: i64) -> Result<Self, ValidationError> {
        if !tile::is_valid_zoom(zoom) {
            return Err(ValidationError::ZoomOutOfRange(zoom));
        }
        let zoom = zoom as u8;
        if geometry.0.is_empty() {
            return Err(ValidationError::EmptyGeometry);
        }
        for polygon in &geometry.0 {
            validate_polygon(polygon)?;
        }

        // Parts are summed, not unioned; overlapping parts count twice.
        let area_km2 = geometry.chamberlain_duquette_unsigned_area() / 1_000_000.0;
        let max_km2 = max_area_km2(zoom);
        if area_km2 > max_km2 {
            return Err(ValidationError::AreaTooLarge {
                area_km2,
                max_km2,
                zoom,
            });
        }
        Ok(Aoi {
            geometry,
            area_km2,
            zoom,
        })
    }

    pub fn geometry(&self) -> &MultiPolygon<f64> {
        &self.geometry
    }

    pub fn area_km2(&self) -> f64 {
        self.area_km2
    }

    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    pub fn bounding_rect(&self) -> Option<Rect<f64>> {
        self.geometry.bounding_rect()
    }

    pub fn to_wkt(&self) -> String {
        wkt::multipolygon_to_wkt(&self.geometry)
    }
}

pub fn validate_polygon(polygon: &Polygon<f64>) -> Result<(), ValidationError> {
    validate_ring(polygon.exterior(), "exterior")?;
    for interior in polygon.interiors() {
        validate_ring(interior, "interior")?;
    }
    if polygon.unsigned_area() <= 0.0 {
        return Err(ValidationError::InvalidGeometry("polygon has zero area".into()));
    }
    Ok(())
}

fn validate_ring(ring: &LineString<f64>, which: &str) -> Result<(), ValidationError> {
    let n = ring.0.len();
    if n < 4 {
        return Err(ValidationError::InvalidGeometry(format!(
            "{} ring has {} positions, at least 4 required",
            which, n
        )));
    }
    if !ring.is_closed() {
        return Err(ValidationError::InvalidGeometry(format!("{} ring is not closed", which)));
    }
    for c in ring.coords() {
        if !c.x.is_finite() || !c.y.is_finite() {
            return Err(ValidationError::InvalidGeometry("non-finite coordinate".into()));
        }
        if !(-180.0..=180.0).contains(&c.x) || !(-90.0..=90.0).contains(&c.y) {
            return Err(ValidationError::InvalidGeometry(format!(
                "coordinate ({}, {}) outside lon/lat range",
                c.x, c.y
            )));
        }
    }
    if ring_self_intersects(ring) {
        return Err(ValidationError::InvalidGeometry(format!("{} ring self-intersects", which)));
    }
    Ok(())
}

/// True when two non-adjacent segments of a closed ring touch, or adjacent
/// segments overlap collinearly.
pub fn ring_self_intersects(ring: &LineString<f64>) -> bool {
    let segments: Vec<Line<f64>> = ring.lines().filter(|l| l.start != l.end).collect();
    let n = segments.len();
    if n > MAX_SEGMENTS_CHECKED {
        return false;
    }
    for i in 0..n {
        for j in (i + 1)..n {
            let adjacent = j == i + 1 || (i == 0 && j == n - 1);
            match line_intersection(segments[i], segments[j]) {
                None => {}
                Some(LineIntersection::SinglePoint { .. }) if adjacent => {}
                Some(_) => return true,
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn square(lon: f64, lat: f64, size: f64) -> Value {
        json!({
            "type": "Polygon",
            "coordinates": [[
                [lon, lat], [lon + size, lat], [lon + size, lat + size], [lon, lat + size], [lon, lat]
            ]]
        })
    }

    #[test]
    fn ceiling_shrinks_by_four_per_zoom() {
        assert_eq!(max_area_km2(18), 5000.0);
        assert_eq!(max_area_km2(17), 20_000.0);
        assert_eq!(max_area_km2(19), 1250.0);
    }

    #[test]
    fn accepts_small_square() {
        let aoi = Aoi::from_geojson(&square(13.0, 52.0, 0.1), 18).unwrap();
        // ~6.8 km x 11.1 km at this latitude
        assert!(aoi.area_km2() > 70.0 && aoi.area_km2() < 80.0, "{}", aoi.area_km2());
        assert_eq!(aoi.zoom(), 18);
        assert!(aoi.to_wkt().starts_with("MULTIPOLYGON"));
    }

    #[test]
    fn rejects_oversized_area() {
        // One degree square near the equator is ~12,300 km².
        let err = Aoi::from_geojson(&square(10.0, 0.0, 1.0), 18).unwrap_err();
        assert!(matches!(err, ValidationError::AreaTooLarge { zoom: 18, .. }));
        // ...which is fine at zoom 17.
        assert!(Aoi::from_geojson(&square(10.0, 0.0, 1.0), 17).is_ok());
    }

    #[test]
    fn multi_feature_areas_are_summed() {
        // Each part alone fits at zoom 19 (1250 km²), together they do not.
        let fc = json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {}, "geometry": square(10.0, 0.0, 0.25)},
                {"type": "Feature", "properties": {}, "geometry": square(11.0, 0.0, 0.25)}
            ]
        });
        let single = Aoi::from_geojson(&square(10.0, 0.0, 0.25), 19).unwrap();
        assert!(single.area_km2() < 1250.0);
        assert!(matches!(
            Aoi::from_geojson(&fc, 19),
            Err(ValidationError::AreaTooLarge { .. })
        ));
    }

    #[test]
    fn rejects_zoom_out_of_range() {
        assert_eq!(
            Aoi::from_geojson(&square(13.0, 52.0, 0.01), 23),
            Err(ValidationError::ZoomOutOfRange(23))
        );
        assert_eq!(
            Aoi::from_geojson(&square(13.0, 52.0, 0.01), 0),
            Err(ValidationError::ZoomOutOfRange(0))
        );
    }

    #[test]
    fn rejects_points() {
        let value = json!({"type": "Point", "coordinates": [1.0, 2.0]});
        assert_eq!(
            Aoi::from_geojson(&value, 18),
            Err(ValidationError::UnsupportedGeometry("Point".into()))
        );
    }

    #[test]
    fn rejects_bow_tie() {
        let value = json!({
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [0.01, 0.01], [0.01, 0.0], [0.0, 0.01], [0.0, 0.0]]]
        });
        assert!(matches!(
            Aoi::from_geojson(&value, 18),
            Err(ValidationError::InvalidGeometry(msg)) if msg.contains("self-intersects")
        ));
    }

    #[test]
    fn rejects_unclosed_and_short_rings() {
        let open = json!({
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [0.01, 0.0], [0.01, 0.01], [0.0, 0.01]]]
        });
        assert!(matches!(
            Aoi::from_geojson(&open, 18),
            Err(ValidationError::InvalidGeometry(_))
        ));
        let short = json!({
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [0.01, 0.0], [0.0, 0.0]]]
        });
        assert!(matches!(
            Aoi::from_geojson(&short, 18),
            Err(ValidationError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(matches!(
            Aoi::from_geojson(&square(179.99, 10.0, 0.1), 18),
            Err(ValidationError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn rejects_empty_collection() {
        let fc = json!({"type": "FeatureCollection", "features": []});
        assert_eq!(Aoi::from_geojson(&fc, 18), Err(ValidationError::EmptyGeometry));
    }
}
