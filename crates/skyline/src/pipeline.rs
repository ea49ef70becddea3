//! One request, end to end: extrude, partition, encode, assemble, recommend.

use crate::config::PipelineConfig;
use crate::encode::encode_buckets;
use crate::error::{PipelineError, Result};
use crate::extrude::{extrude_with, SolidMesh};
use crate::footprint::{FootprintRecord, PlotRecord};
use crate::partition::partition;
use crate::recommend::{recommend, HeightRecommendation};
use crate::tileset::{assemble, MANIFEST_FILE};
use chrono::Utc;
use log::info;
use rayon::prelude::*;
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    time::Instant,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneOutput {
    /// Manifest path relative to the output directory.
    pub manifest_path: PathBuf,
    pub tile_count: usize,
    pub recommendation: Option<HeightRecommendation>,
}

/// Build the tileset for `buildings` under `output_dir` and, when a plot is
/// given, its height recommendation.
///
/// Input errors (bad buildings, bad plot, oversized tiles) are reported
/// before anything is written to `output_dir`. After an I/O failure its
/// contents are undefined.
pub fn generate_scene(
    buildings: &[FootprintRecord],
    target_plot: Option<&PlotRecord>,
    output_dir: &Path,
    config: &PipelineConfig,
) -> Result<SceneOutput> {
    config.validate()?;
    let started = Instant::now();

    let solids: Vec<(SolidMesh, &FootprintRecord)> = buildings
        .par_iter()
        .enumerate()
        .map(|(i, record)| {
            extrude_with(record, config.shading)
                .map(|mesh| (mesh, record))
                .map_err(|e| with_building(i, record, e))
        })
        .collect::<Result<_>>()?;

    // Everything that can reject the input runs before the first file is written.
    let recommendation = match target_plot {
        Some(plot) => recommend(buildings, plot, config.proximity)?,
        None => None,
    };

    let mut buckets = partition(solids, config.tiling, config.volume);
    encode_buckets(&mut buckets)?;

    let generated_at = config.timestamp.then(Utc::now);
    assemble(&buckets, output_dir, generated_at, config.volume)?;

    info!(
        "Scene of {} building(s) in {} tile(s) written to {} in {:.2?}.",
        buildings.len(),
        buckets.len(),
        output_dir.display(),
        started.elapsed()
    );

    Ok(SceneOutput {
        manifest_path: PathBuf::from(MANIFEST_FILE),
        tile_count: buckets.len(),
        recommendation,
    })
}

fn with_building(index: usize, record: &FootprintRecord, err: PipelineError) -> PipelineError {
    let label = match &record.id {
        Some(id) => format!("building {index} ({id})"),
        None => format!("building {index}"),
    };

    match err {
        PipelineError::DegenerateGeometry(msg) => {
            PipelineError::DegenerateGeometry(format!("{label}: {msg}"))
        }
        other => other,
    }
}
