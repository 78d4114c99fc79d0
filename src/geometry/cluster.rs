//! Adaptive cluster partitioner for irregular inputs (footprints, points).
//!
//! Items are first grouped by proximity: every item sits in the tile of its
//! centroid, and items whose tiles are within one tile of each other end up
//! in the same cluster (union-find over the 3×3 neighbourhood). Clusters
//! larger than `group_size` are bisected at the median of their wider axis
//! until every piece fits.
//!
//! Bisection runs on a dedicated rayon pool. Each work unit is owned by
//! exactly one task; finished pieces are sent over a channel to the
//! collector, which sorts them so the output never depends on scheduling.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Sender};

use tracing::{debug, warn};

use super::{number_groups, GroupExtent, GroupPlan, Partitioner};
use crate::error::ValidationError;
use crate::tile;

pub const MAX_WORKERS: usize = 8;

/// Representative point of one input item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterItem {
    pub lon: f64,
    pub lat: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterPartitioner {
    pub zoom: u8,
    pub group_size: usize,
    pub workers: usize,
}

impl ClusterPartitioner {
    pub fn new(zoom: u8, group_size: usize) -> Self {
        ClusterPartitioner {
            zoom,
            group_size,
            workers: MAX_WORKERS,
        }
    }
}

impl Partitioner for ClusterPartitioner {
    type Input = [ClusterItem];

    fn partition(&self, items: &[ClusterItem]) -> Result<Vec<GroupPlan>, ValidationError> {
        if self.group_size == 0 {
            return Err(ValidationError::InvalidGroupSize(0));
        }
        if !tile::is_valid_zoom(self.zoom as i64) {
            return Err(ValidationError::ZoomOutOfRange(self.zoom as i64));
        }
        if items.is_empty() {
            return Err(ValidationError::EmptyGeometry);
        }
        if let Some(bad) = items.iter().find(|i| !i.lon.is_finite() || !i.lat.is_finite()) {
            return Err(ValidationError::InvalidGeometry(format!(
                "non-finite centroid ({}, {})",
                bad.lon, bad.lat
            )));
        }

        let clusters = proximity_clusters(items, self.zoom);
        let (fits, oversized): (Vec<_>, Vec<_>) =
            clusters.into_iter().partition(|c| c.len() <= self.group_size);
        debug!(
            items = items.len(),
            clusters = fits.len() + oversized.len(),
            oversized = oversized.len(),
            "cluster partition"
        );

        let mut groups = fits;
        if !oversized.is_empty() {
            groups.extend(split_oversized(items, oversized, self.group_size, self.workers, self.zoom));
        }
        for g in &mut groups {
            g.sort_unstable();
        }
        groups.sort_unstable_by_key(|g| g.first().copied());

        Ok(number_groups(groups.into_iter().map(GroupExtent::Items)))
    }
}

// ── Proximity clustering ────────────────────────────────────────

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        UnionFind {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Connected components of items whose centroid tiles touch (8-neighbourhood).
/// Components are returned ordered by their smallest item index.
fn proximity_clusters(items: &[ClusterItem], zoom: u8) -> Vec<Vec<usize>> {
    let mut by_tile: BTreeMap<(u32, u32), Vec<usize>> = BTreeMap::new();
    for (i, item) in items.iter().enumerate() {
        let t = tile::lat_lon_to_tile(item.lat, item.lon, zoom);
        by_tile.entry((t.x, t.y)).or_default().push(i);
    }

    let mut uf = UnionFind::new(items.len());
    for (&(x, y), members) in &by_tile {
        let first = members[0];
        for &other in &members[1..] {
            uf.union(first, other);
        }
        for dx in -1i64..=1 {
            for dy in -1i64..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let (nx, ny) = (x as i64 + dx, y as i64 + dy);
                if nx < 0 || ny < 0 {
                    continue;
                }
                if let Some(neighbours) = by_tile.get(&(nx as u32, ny as u32)) {
                    uf.union(first, neighbours[0]);
                }
            }
        }
    }

    let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..items.len() {
        let root = uf.find(i);
        components.entry(root).or_default().push(i);
    }
    let mut out: Vec<Vec<usize>> = components.into_values().collect();
    out.sort_unstable_by_key(|c| c[0]);
    out
}

// ── Parallel bisection ──────────────────────────────────────────

fn split_oversized(
    items: &[ClusterItem],
    oversized: Vec<Vec<usize>>,
    group_size: usize,
    workers: usize,
    zoom: u8,
) -> Vec<Vec<usize>> {
    let workers = workers.clamp(1, MAX_WORKERS);
    let (tx, rx) = mpsc::channel::<Vec<usize>>();

    match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
        Ok(pool) => pool.scope(|s| seed_units(s, items, oversized, group_size, zoom, &tx)),
        Err(e) => {
            warn!(error = %e, "could not build partition pool, using the global pool");
            rayon::scope(|s| seed_units(s, items, oversized, group_size, zoom, &tx))
        }
    }
    // The scope has joined every task; dropping the last sender ends the stream.
    drop(tx);
    rx.into_iter().collect()
}

fn seed_units<'s>(
    scope: &rayon::Scope<'s>,
    items: &'s [ClusterItem],
    units: Vec<Vec<usize>>,
    group_size: usize,
    zoom: u8,
    tx: &Sender<Vec<usize>>,
) {
    for unit in units {
        let tx = tx.clone();
        scope.spawn(move |s| bisect_until_fits(s, items, unit, group_size, zoom, tx));
    }
}

fn bisect_until_fits<'s>(
    scope: &rayon::Scope<'s>,
    items: &'s [ClusterItem],
    unit: Vec<usize>,
    group_size: usize,
    zoom: u8,
    tx: Sender<Vec<usize>>,
) {
    if unit.len() <= group_size {
        // The receiver outlives the scope, so a send cannot fail here.
        let _ = tx.send(unit);
        return;
    }
    let (left, right) = bisect(items, unit, zoom);
    for half in [left, right] {
        let tx = tx.clone();
        scope.spawn(move |s| bisect_until_fits(s, items, half, group_size, zoom, tx));
    }
}

/// Split at the median along the wider axis of the centroid bounding box,
/// measured in tile units so both axes are comparable.
fn bisect(items: &[ClusterItem], mut unit: Vec<usize>, zoom: u8) -> (Vec<usize>, Vec<usize>) {
    let coords = |i: usize| {
        let it = items[i];
        (
            tile::lon_to_tile_x_f64(it.lon, zoom),
            tile::lat_to_tile_y_f64(it.lat, zoom),
        )
    };
    let (mut min_x, mut max_x, mut min_y, mut max_y) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
    for &i in &unit {
        let (x, y) = coords(i);
        min_x = min_x.min(x);
        max_x = max_x.max(x);
        min_y = min_y.min(y);
        max_y = max_y.max(y);
    }
    let along_x = (max_x - min_x) >= (max_y - min_y);
    unit.sort_unstable_by(|&a, &b| {
        let (ka, kb) = if along_x {
            (coords(a).0, coords(b).0)
        } else {
            (coords(a).1, coords(b).1)
        };
        ka.total_cmp(&kb).then(a.cmp(&b))
    });
    let right = unit.split_off(unit.len() / 2);
    (unit, right)
}
