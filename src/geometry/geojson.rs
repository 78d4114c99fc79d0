//! Minimal GeoJSON reader/writer for the shapes project drafts carry.
//!
//! Accepts a `FeatureCollection`, a single `Feature` or a bare geometry
//! object. Geometry collections and line geometries are rejected by the
//! callers that cannot use them, not here.

use geo::{Coord, Geometry, LineString, MultiPoint, MultiPolygon, Point, Polygon};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::ValidationError;

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: Option<String>,
    pub geometry: Geometry<f64>,
    pub properties: Map<String, Value>,
}

/// `[lon, lat]` with an optional altitude, which is ignored.
type Position = Vec<f64>;

#[derive(Debug, Deserialize)]
struct FeatureCollectionDoc {
    features: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct FeatureDoc {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    geometry: Option<Value>,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum GeometryDoc {
    Point { coordinates: Position },
    MultiPoint { coordinates: Vec<Position> },
    LineString { coordinates: Vec<Position> },
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
}

const SUPPORTED_GEOMETRIES: [&str; 5] = ["Point", "MultiPoint", "LineString", "Polygon", "MultiPolygon"];

pub fn geometry_type_name(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

/// Parse any supported GeoJSON object into a list of features.
pub fn parse_features(value: &Value) -> Result<Vec<Feature>, ValidationError> {
    match type_of(value)? {
        "FeatureCollection" => {
            let doc: FeatureCollectionDoc = decode(value)?;
            doc.features.iter().map(parse_feature).collect()
        }
        "Feature" => Ok(vec![parse_feature(value)?]),
        _ => Ok(vec![Feature {
            id: None,
            geometry: parse_geometry(value)?,
            properties: Map::new(),
        }]),
    }
}

fn parse_feature(value: &Value) -> Result<Feature, ValidationError> {
    let doc: FeatureDoc = decode(value)?;
    if doc.kind != "Feature" {
        return Err(invalid("expected a Feature"));
    }
    let geometry = match &doc.geometry {
        Some(g) if !g.is_null() => parse_geometry(g)?,
        _ => return Err(ValidationError::EmptyGeometry),
    };
    let id = match doc.id {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    Ok(Feature {
        id,
        geometry,
        properties: doc.properties.unwrap_or_default(),
    })
}

pub fn parse_geometry(value: &Value) -> Result<Geometry<f64>, ValidationError> {
    let kind = type_of(value)?;
    if !SUPPORTED_GEOMETRIES.contains(&kind) {
        return Err(ValidationError::UnsupportedGeometry(kind.to_string()));
    }
    let geometry = match decode::<GeometryDoc>(value)? {
        GeometryDoc::Point { coordinates } => Geometry::Point(Point(position(&coordinates)?)),
        GeometryDoc::MultiPoint { coordinates } => {
            let points = coordinates
                .iter()
                .map(|p| position(p).map(Point))
                .collect::<Result<Vec<_>, _>>()?;
            Geometry::MultiPoint(MultiPoint(points))
        }
        GeometryDoc::LineString { coordinates } => Geometry::LineString(line_string(&coordinates)?),
        GeometryDoc::Polygon { coordinates } => Geometry::Polygon(polygon(&coordinates)?),
        GeometryDoc::MultiPolygon { coordinates } => {
            let polygons = coordinates
                .iter()
                .map(|rings| polygon(rings))
                .collect::<Result<Vec<_>, _>>()?;
            Geometry::MultiPolygon(MultiPolygon(polygons))
        }
    };
    Ok(geometry)
}

fn type_of(value: &Value) -> Result<&str, ValidationError> {
    value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("object without a `type` member"))
}

fn decode<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T, ValidationError> {
    T::deserialize(value).map_err(|e| invalid(&e.to_string()))
}

fn invalid(msg: &str) -> ValidationError {
    ValidationError::InvalidGeoJson(msg.to_string())
}

fn position(parts: &[f64]) -> Result<Coord<f64>, ValidationError> {
    match parts {
        [x, y, ..] => Ok(Coord { x: *x, y: *y }),
        _ => Err(invalid("position needs at least two numbers")),
    }
}

fn line_string(positions: &[Position]) -> Result<LineString<f64>, ValidationError> {
    let coords = positions
        .iter()
        .map(|p| position(p))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(LineString(coords))
}

fn polygon(rings: &[Vec<Position>]) -> Result<Polygon<f64>, ValidationError> {
    let rings = rings
        .iter()
        .map(|r| line_string(r))
        .collect::<Result<Vec<_>, _>>()?;
    // Polygon::new closes open rings silently; GeoJSON requires them closed.
    if let Some(open) = rings.iter().find(|r| !r.0.is_empty() && !r.is_closed()) {
        return Err(ValidationError::InvalidGeometry(format!(
            "ring starting at ({}, {}) is not closed",
            open.0[0].x, open.0[0].y
        )));
    }
    let mut rings = rings.into_iter();
    let exterior = rings.next().ok_or(ValidationError::EmptyGeometry)?;
    Ok(Polygon::new(exterior, rings.collect()))
}

/// GeoJSON geometry object for a polygon (used by the partition preview).
pub fn polygon_to_geojson(polygon: &Polygon<f64>) -> Value {
    let ring = |ls: &LineString<f64>| -> Vec<[f64; 2]> { ls.coords().map(|c| [c.x, c.y]).collect() };
    let mut rings = vec![ring(polygon.exterior())];
    rings.extend(polygon.interiors().iter().map(ring));
    json!({ "type": "Polygon", "coordinates": rings })
}
