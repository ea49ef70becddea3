//! Single-level spatial bucketing of extruded solids.

use crate::bounds::{Aabb, BoundingVolume, VolumeKind};
use crate::extrude::SolidMesh;
use crate::footprint::FootprintRecord;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_CELL_SIZE: f64 = 500.0;
pub const DEFAULT_MAX_SINGLE: usize = 256;

/// How solids are grouped into tiles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TilingScheme {
    /// Everything in one tile.
    Single,
    /// Square cells of `cell_size` scene units, keyed by footprint center.
    Grid { cell_size: f64 },
    /// `Single` up to `max_single` solids, `Grid` above.
    Auto { cell_size: f64, max_single: usize },
}

impl Default for TilingScheme {
    fn default() -> Self {
        TilingScheme::Auto {
            cell_size: DEFAULT_CELL_SIZE,
            max_single: DEFAULT_MAX_SINGLE,
        }
    }
}

impl TilingScheme {
    /// Grid cell size in effect for a scene of `solids` solids, `None` for one tile.
    fn cell_size_for(&self, solids: usize) -> Option<f64> {
        match *self {
            TilingScheme::Single => None,
            TilingScheme::Grid { cell_size } => Some(cell_size),
            TilingScheme::Auto {
                cell_size,
                max_single,
            } => (solids > max_single).then_some(cell_size),
        }
    }
}

/// Grid cell coordinates; ordering is row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BucketKey {
    pub row: i64,
    pub col: i64,
}

impl BucketKey {
    pub const SINGLE: BucketKey = BucketKey { row: 0, col: 0 };

    fn of(aabb: &Aabb, cell_size: f64) -> Self {
        let [cx, cy, _] = aabb.center();
        BucketKey {
            row: (cy / cell_size).floor() as i64,
            col: (cx / cell_size).floor() as i64,
        }
    }
}

/// One solid plus what the batch table records about its origin.
#[derive(Debug, Clone)]
pub struct BucketMember {
    pub mesh: SolidMesh,
    pub source_index: usize,
    pub id: Option<String>,
    pub height: f64,
}

#[derive(Debug, Clone)]
pub struct TileBucket {
    pub key: BucketKey,
    pub volume: BoundingVolume,
    pub members: Vec<BucketMember>,
    /// Filled in by the encoder.
    pub payload: Vec<u8>,
}

/// Group solids into buckets ordered by key.
///
/// Source indices follow input order. An empty input gives no buckets.
pub fn partition(
    solids: Vec<(SolidMesh, &FootprintRecord)>,
    scheme: TilingScheme,
    kind: VolumeKind,
) -> Vec<TileBucket> {
    let mut cell_size = scheme.cell_size_for(solids.len());
    if let Some(size) = cell_size {
        if !(size > 0.0 && size.is_finite()) {
            warn!("Ignoring grid cell size {size}; using a single tile.");
            cell_size = None;
        }
    }

    let mut groups: BTreeMap<BucketKey, (Aabb, Vec<BucketMember>)> = BTreeMap::new();

    for (source_index, (mesh, record)) in solids.into_iter().enumerate() {
        let Some(aabb) = mesh.aabb() else {
            warn!("Solid {source_index} has no vertices; dropped.");
            continue;
        };

        let key = cell_size.map_or(BucketKey::SINGLE, |size| BucketKey::of(&aabb, size));
        let member = BucketMember {
            mesh,
            source_index,
            id: record.id.clone(),
            height: record.height,
        };

        groups
            .entry(key)
            .and_modify(|(bounds, members)| {
                *bounds = bounds.merge(&aabb);
            })
            .or_insert_with(|| (aabb, Vec::new()))
            .1
            .push(member);
    }

    debug!("Partitioned into {} bucket(s) (cell size {:?}).", groups.len(), cell_size);

    groups
        .into_iter()
        .map(|(key, (aabb, members))| TileBucket {
            key,
            volume: BoundingVolume::from_aabb(aabb, kind),
            members,
            payload: Vec::new(),
        })
        .collect()
}
