//! Well-known-text output for the relational store's geometry columns.

use std::fmt::Write;

use geo::{Coord, Geometry, LineString, MultiPolygon, Polygon};

fn push_coord(out: &mut String, c: &Coord<f64>) {
    let _ = write!(out, "{} {}", c.x, c.y);
}

fn push_ring(out: &mut String, ring: &LineString<f64>) {
    out.push('(');
    for (i, c) in ring.coords().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        push_coord(out, c);
    }
    out.push(')');
}

fn push_polygon_body(out: &mut String, polygon: &Polygon<f64>) {
    out.push('(');
    push_ring(out, polygon.exterior());
    for interior in polygon.interiors() {
        out.push_str(", ");
        push_ring(out, interior);
    }
    out.push(')');
}

pub fn polygon_to_wkt(polygon: &Polygon<f64>) -> String {
    let mut out = String::from("POLYGON ");
    push_polygon_body(&mut out, polygon);
    out
}

pub fn multipolygon_to_wkt(mp: &MultiPolygon<f64>) -> String {
    if mp.0.is_empty() {
        return "MULTIPOLYGON EMPTY".to_string();
    }
    let mut out = String::from("MULTIPOLYGON (");
    for (i, polygon) in mp.0.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        push_polygon_body(&mut out, polygon);
    }
    out.push(')');
    out
}

/// WKT for the geometry kinds tasks can carry. Returns `None` for kinds
/// that never reach the store (collections, rects, triangles).
pub fn geometry_to_wkt(geometry: &Geometry<f64>) -> Option<String> {
    match geometry {
        Geometry::Point(p) => Some(format!("POINT ({} {})", p.x(), p.y())),
        Geometry::MultiPoint(mp) => {
            let mut out = String::from("MULTIPOINT (");
            for (i, p) in mp.0.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push('(');
                push_coord(&mut out, &p.0);
                out.push(')');
            }
            out.push(')');
            Some(out)
        }
        Geometry::LineString(ls) => {
            let mut out = String::from("LINESTRING ");
            push_ring(&mut out, ls);
            Some(out)
        }
        Geometry::Polygon(p) => Some(polygon_to_wkt(p)),
        Geometry::MultiPolygon(mp) => Some(multipolygon_to_wkt(mp)),
        _ => None,
    }
}
