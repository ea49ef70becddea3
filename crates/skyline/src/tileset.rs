//! 3D Tiles 1.0 manifest emission.
//!
//! Layout of one output directory:
//!
//! ```text
//! <out>/tileset.json
//! <out>/tiles/tile_0.b3dm
//! <out>/tiles/tile_1.b3dm
//! ...
//! ```
//!
//! One flat level: the root refines additively into one child per bucket.

use crate::bounds::{Aabb, BoundingVolume, VolumeKind};
use crate::error::{PipelineError, Result};
use crate::partition::TileBucket;
use chrono::{DateTime, SecondsFormat, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

pub const MANIFEST_FILE: &str = "tileset.json";
pub const TILES_DIR: &str = "tiles";
pub const TILES_VERSION: &str = "1.0";
pub const GENERATOR: &str = concat!("skyline ", env!("CARGO_PKG_VERSION"));

/// Relative content path of bucket `index`.
pub fn tile_file_name(index: usize) -> String {
    format!("{TILES_DIR}/tile_{index}.b3dm")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub asset: Asset,
    pub geometric_error: f64,
    pub root: Tile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub version: String,
    pub gltf_up_axis: String,
    pub generator: String,
    /// Generation timestamp; the only field that differs between identical runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tileset_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tile {
    pub bounding_volume: Volume,
    pub geometric_error: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refine: Option<Refine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default)]
    pub children: Vec<Tile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Refine {
    Add,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub uri: String,
}

/// Exactly one of the fields is set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Volume {
    #[serde(rename = "box", default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sphere: Option<Vec<f64>>,
}

impl From<&BoundingVolume> for Volume {
    fn from(v: &BoundingVolume) -> Self {
        match v.to_manifest() {
            ("sphere", numbers) => Volume {
                sphere: Some(numbers),
                ..Volume::default()
            },
            (_, numbers) => Volume {
                bbox: Some(numbers),
                ..Volume::default()
            },
        }
    }
}

impl Manifest {
    pub fn children(&self) -> &[Tile] {
        &self.root.children
    }
}

/// Write every bucket payload and the manifest under `output_dir`.
///
/// Buckets must already be encoded. `generated_at`, when given, is recorded in
/// `asset.tilesetVersion`; everything else is a pure function of the buckets.
pub fn assemble(
    buckets: &[TileBucket],
    output_dir: &Path,
    generated_at: Option<DateTime<Utc>>,
    kind: VolumeKind,
) -> Result<Manifest> {
    if let Some(i) = buckets.iter().position(|b| b.payload.is_empty()) {
        return Err(PipelineError::MissingPayload(i));
    }

    let tiles_dir = output_dir.join(TILES_DIR);
    fs::create_dir_all(&tiles_dir).map_err(|e| PipelineError::write(&tiles_dir, e))?;

    for (i, bucket) in buckets.iter().enumerate() {
        let path = output_dir.join(tile_file_name(i));
        fs::write(&path, &bucket.payload).map_err(|e| PipelineError::write(&path, e))?;
    }

    let manifest = build_manifest(buckets, generated_at, kind);

    let path = output_dir.join(MANIFEST_FILE);
    let json = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| PipelineError::write(&path, e.into()))?;
    fs::write(&path, json).map_err(|e| PipelineError::write(&path, e))?;

    info!(
        "Wrote {} with {} tile(s), geometric error {:.3}.",
        path.display(),
        buckets.len(),
        manifest.geometric_error
    );

    Ok(manifest)
}

/// Manifest for `buckets` without touching the filesystem.
pub fn build_manifest(
    buckets: &[TileBucket],
    generated_at: Option<DateTime<Utc>>,
    kind: VolumeKind,
) -> Manifest {
    let root_volume = BoundingVolume::union(buckets.iter().map(|b| &b.volume), kind)
        .unwrap_or_else(|| BoundingVolume::from_aabb(Aabb::zero(), kind));

    let scene_error = root_volume.diagonal();
    let largest = buckets
        .iter()
        .map(|b| b.volume.diagonal())
        .fold(0.0f64, f64::max);
    let per_bucket = scene_error / buckets.len().max(1) as f64;

    let children = buckets
        .iter()
        .enumerate()
        .map(|(i, bucket)| {
            let share = if largest > 0.0 {
                bucket.volume.diagonal() / largest
            } else {
                0.0
            };

            Tile {
                bounding_volume: Volume::from(&bucket.volume),
                geometric_error: per_bucket * share,
                refine: None,
                content: Some(Content {
                    uri: tile_file_name(i),
                }),
                children: Vec::new(),
            }
        })
        .collect();

    Manifest {
        asset: Asset {
            version: TILES_VERSION.into(),
            gltf_up_axis: "Z".into(),
            generator: GENERATOR.into(),
            tileset_version: generated_at.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
        },
        geometric_error: scene_error,
        root: Tile {
            bounding_volume: Volume::from(&root_volume),
            geometric_error: scene_error,
            refine: Some(Refine::Add),
            content: None,
            children,
        },
    }
}
