//! # Tile Math — Web-Mercator Slippy-Map Coordinates
//!
//! Pure conversions between longitude/latitude, global pixel coordinates and
//! tile addresses for the standard 256-pixel tiling scheme. Tile `(0, 0)` is
//! the north-west corner; `y` grows southwards.
//!
//! Latitudes are clamped to the Mercator limit (±85.05112878°) and pixel
//! coordinates to the map size, so every function is total over finite input.

use std::f64::consts::PI;

use geo::{coord, Polygon, Rect};

pub const TILE_SIZE: f64 = 256.0;
pub const MIN_ZOOM: u8 = 1;
pub const MAX_ZOOM: u8 = 22;
pub const MAX_LATITUDE: f64 = 85.051_128_78;

/// Tolerance, in tile units, for snapping interval edges onto tile borders.
const SNAP_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pixel {
    pub x: i64,
    pub y: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

impl Tile {
    pub fn new(x: u32, y: u32, z: u8) -> Self {
        Tile { x, y, z }
    }

    /// Stable task id, `"{z}-{x}-{y}"`.
    pub fn task_id(&self) -> String {
        format!("{}-{}-{}", self.z, self.x, self.y)
    }

    pub fn quadkey(&self) -> String {
        quadkey(self.x, self.y, self.z)
    }

    pub fn bounds(&self) -> Rect<f64> {
        tile_bounds(self.x, self.y, self.z)
    }

    pub fn polygon(&self) -> Polygon<f64> {
        tile_polygon(self.x, self.y, self.z)
    }

    /// Centre of the tile as (lon, lat).
    pub fn center(&self) -> (f64, f64) {
        let px = (self.x as f64 + 0.5) * TILE_SIZE;
        let py = (self.y as f64 + 0.5) * TILE_SIZE;
        pixel_to_lat_lon_f64(px, py, self.z)
    }
}

pub fn map_size(zoom: u8) -> f64 {
    TILE_SIZE * 2f64.powi(zoom as i32)
}

/// Number of tiles along one axis at `zoom`.
pub fn tiles_per_axis(zoom: u8) -> u32 {
    1u32 << zoom.min(31)
}

pub fn is_valid_zoom(zoom: i64) -> bool {
    (MIN_ZOOM as i64..=MAX_ZOOM as i64).contains(&zoom)
}

/// Fractional global pixel coordinate of a lon/lat pair.
pub fn lat_lon_to_pixel_f64(lat: f64, lon: f64, zoom: u8) -> (f64, f64) {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let size = map_size(zoom);
    let sin_lat = (lat * PI / 180.0).sin();
    let x = ((lon + 180.0) / 360.0) * size;
    let y = (0.5 - ((1.0 + sin_lat) / (1.0 - sin_lat)).ln() / (4.0 * PI)) * size;
    (x.clamp(0.0, size), y.clamp(0.0, size))
}

pub fn lat_lon_to_pixel(lat: f64, lon: f64, zoom: u8) -> Pixel {
    let (x, y) = lat_lon_to_pixel_f64(lat, lon, zoom);
    Pixel {
        x: x.floor() as i64,
        y: y.floor() as i64,
    }
}

pub fn pixel_to_tile(pixel: Pixel, zoom: u8) -> Tile {
    let last = tiles_per_axis(zoom) as i64 - 1;
    Tile {
        x: (pixel.x.div_euclid(TILE_SIZE as i64)).clamp(0, last) as u32,
        y: (pixel.y.div_euclid(TILE_SIZE as i64)).clamp(0, last) as u32,
        z: zoom,
    }
}

/// Pixel coordinate of the north-west corner of a tile.
pub fn tile_to_pixel(tile: Tile) -> Pixel {
    Pixel {
        x: tile.x as i64 * TILE_SIZE as i64,
        y: tile.y as i64 * TILE_SIZE as i64,
    }
}

pub fn lat_lon_to_tile(lat: f64, lon: f64, zoom: u8) -> Tile {
    pixel_to_tile(lat_lon_to_pixel(lat, lon, zoom), zoom)
}

/// Inverse of [`lat_lon_to_pixel_f64`]; returns (lon, lat).
pub fn pixel_to_lat_lon_f64(px: f64, py: f64, zoom: u8) -> (f64, f64) {
    let size = map_size(zoom);
    let x = px.clamp(0.0, size) / size - 0.5;
    let y = 0.5 - py.clamp(0.0, size) / size;
    let lat = 90.0 - 360.0 * (-y * 2.0 * PI).exp().atan() / PI;
    let lon = 360.0 * x;
    (lon, lat)
}

pub fn pixel_to_lat_lon(pixel: Pixel, zoom: u8) -> (f64, f64) {
    pixel_to_lat_lon_f64(pixel.x as f64, pixel.y as f64, zoom)
}

/// Fractional tile x coordinate of a longitude.
pub fn lon_to_tile_x_f64(lon: f64, zoom: u8) -> f64 {
    lat_lon_to_pixel_f64(0.0, lon, zoom).0 / TILE_SIZE
}

/// Fractional tile y coordinate of a latitude.
pub fn lat_to_tile_y_f64(lat: f64, zoom: u8) -> f64 {
    lat_lon_to_pixel_f64(lat, 0.0, zoom).1 / TILE_SIZE
}

/// Inclusive range of tile indices touched by the fractional interval
/// `[lo, hi]`. An upper edge that lies exactly on a tile boundary does not
/// pull in the following tile.
fn span_from_fractional(lo: f64, hi: f64, zoom: u8) -> (u32, u32) {
    let last = tiles_per_axis(zoom) - 1;
    let first = ((lo + SNAP_EPSILON).floor().max(0.0) as u32).min(last);
    let end = (((hi - SNAP_EPSILON).ceil() - 1.0).max(0.0) as u32).min(last);
    (first, end.max(first))
}

/// Inclusive tile-x range covered by `[min_lon, max_lon]`.
pub fn tile_x_span(min_lon: f64, max_lon: f64, zoom: u8) -> (u32, u32) {
    span_from_fractional(
        lon_to_tile_x_f64(min_lon, zoom),
        lon_to_tile_x_f64(max_lon, zoom),
        zoom,
    )
}

/// Inclusive tile-y range covered by `[min_lat, max_lat]` (north first).
pub fn tile_y_span(min_lat: f64, max_lat: f64, zoom: u8) -> (u32, u32) {
    span_from_fractional(
        lat_to_tile_y_f64(max_lat, zoom),
        lat_to_tile_y_f64(min_lat, zoom),
        zoom,
    )
}

/// Lon/lat bounds of a tile.
pub fn tile_bounds(x: u32, y: u32, zoom: u8) -> Rect<f64> {
    let (west, north) = pixel_to_lat_lon_f64(x as f64 * TILE_SIZE, y as f64 * TILE_SIZE, zoom);
    let (east, south) = pixel_to_lat_lon_f64(
        (x as f64 + 1.0) * TILE_SIZE,
        (y as f64 + 1.0) * TILE_SIZE,
        zoom,
    );
    Rect::new(coord! { x: west, y: south }, coord! { x: east, y: north })
}

/// Bounds of the block of tiles `[x_min, x_max] × [y_min, y_max]`.
pub fn tile_range_bounds(x_min: u32, x_max: u32, y_min: u32, y_max: u32, zoom: u8) -> Rect<f64> {
    let nw = tile_bounds(x_min, y_min, zoom);
    let se = tile_bounds(x_max, y_max, zoom);
    Rect::new(
        coord! { x: nw.min().x, y: se.min().y },
        coord! { x: se.max().x, y: nw.max().y },
    )
}

pub fn tile_polygon(x: u32, y: u32, zoom: u8) -> Polygon<f64> {
    tile_bounds(x, y, zoom).to_polygon()
}

/// Bing-style quadkey for a tile.
pub fn quadkey(x: u32, y: u32, zoom: u8) -> String {
    let mut key = String::with_capacity(zoom as usize);
    for i in (1..=zoom).rev() {
        let mask = 1u32 << (i - 1);
        let mut digit = b'0';
        if x & mask != 0 {
            digit += 1;
        }
        if y & mask != 0 {
            digit += 2;
        }
        key.push(digit as char);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, eps: f64) -> bool {
        (a - b).abs() < eps
    }

    #[test]
    fn origin_maps_to_map_center() {
        let p = lat_lon_to_pixel(0.0, 0.0, 1);
        assert_eq!(p, Pixel { x: 256, y: 256 });
        let t = pixel_to_tile(p, 1);
        assert_eq!(t, Tile::new(1, 1, 1));
    }

    #[test]
    fn known_tile_for_berlin() {
        // Brandenburg Gate at zoom 18
        let t = lat_lon_to_tile(52.516_275, 13.377_704, 18);
        assert_eq!((t.x, t.y), (140_813, 85_975));
    }

    #[test]
    fn pixel_roundtrip_is_close() {
        for &(lat, lon) in &[(52.5, 13.4), (-33.9, 18.4), (0.1, -0.1), (60.0, 179.0)] {
            let (px, py) = lat_lon_to_pixel_f64(lat, lon, 16);
            let (lon2, lat2) = pixel_to_lat_lon_f64(px, py, 16);
            assert!(close(lat, lat2, 1e-9), "lat {} vs {}", lat, lat2);
            assert!(close(lon, lon2, 1e-9), "lon {} vs {}", lon, lon2);
        }
    }

    #[test]
    fn latitude_is_clamped() {
        let p = lat_lon_to_pixel(89.9, 0.0, 3);
        assert_eq!(p.y, 0);
        let t = lat_lon_to_tile(-89.9, 179.99, 3);
        assert_eq!((t.x, t.y), (7, 7));
    }

    #[test]
    fn tile_bounds_share_edges() {
        let a = tile_bounds(10, 20, 12);
        let b = tile_bounds(11, 20, 12);
        let c = tile_bounds(10, 21, 12);
        assert!(close(a.max().x, b.min().x, 1e-12));
        assert!(close(a.min().y, c.max().y, 1e-12));
        assert!(a.max().y > a.min().y);
    }

    #[test]
    fn span_excludes_exact_upper_boundary() {
        let b = tile_bounds(100, 200, 10);
        // Interval ending exactly on the east edge of tile 100 stays in tile 100.
        let (x0, x1) = tile_x_span(b.min().x + 1e-9, b.max().x, 10);
        assert_eq!((x0, x1), (100, 100));
        let (y0, y1) = tile_y_span(b.min().y, b.max().y - 1e-9, 10);
        assert_eq!((y0, y1), (200, 200));
    }

    #[test]
    fn tile_center_lies_inside_bounds() {
        let t = Tile::new(140_813, 85_975, 18);
        let (lon, lat) = t.center();
        let b = t.bounds();
        assert!(lon > b.min().x && lon < b.max().x);
        assert!(lat > b.min().y && lat < b.max().y);
        assert_eq!(lat_lon_to_tile(lat, lon, 18), t);
    }

    #[test]
    fn quadkey_matches_reference() {
        // Reference example from the Bing Maps tile system documentation.
        assert_eq!(quadkey(3, 5, 3), "213");
        assert_eq!(Tile::new(0, 0, 1).quadkey(), "0");
        assert_eq!(Tile::new(1, 1, 1).quadkey(), "3");
    }

    #[test]
    fn task_id_format() {
        assert_eq!(Tile::new(1, 2, 18).task_id(), "18-1-2");
    }

    #[test]
    fn zoom_validity() {
        assert!(!is_valid_zoom(0));
        assert!(is_valid_zoom(1));
        assert!(is_valid_zoom(22));
        assert!(!is_valid_zoom(23));
    }
}
