use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn};
use skyline::{
    find_plot, generate_scene, load_footprints, load_plots, PipelineConfig, SceneOutput, Shading,
    TilingScheme, VolumeKind,
};
use std::{fs, path::PathBuf};

/// How buildings are grouped into tiles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Tiling {
    /// One tile up to `--max-single-tile` buildings, a grid above.
    Auto,
    /// Always one tile.
    Single,
    /// Always a grid of `--cell-size` cells.
    Grid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Volume {
    Box,
    Sphere,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Normals {
    /// Shared vertices with blended corner normals.
    Smooth,
    /// Per-face vertices with exact face normals.
    Flat,
}

impl std::fmt::Display for Tiling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Tiling::Auto => "auto",
            Tiling::Single => "single",
            Tiling::Grid => "grid",
        };

        f.write_str(s)
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "footprints2tiles", version)]
struct Args {
    /// GeoJSON FeatureCollection of building footprints.
    #[arg(long, env = "SKYLINE_BUILDINGS")]
    buildings: PathBuf,

    /// GeoJSON FeatureCollection of land-use plots (needed for a recommendation).
    #[arg(long, env = "SKYLINE_PLOTS")]
    plots: Option<PathBuf>,

    /// Plot to recommend a height for.
    #[arg(long, requires = "plots")]
    target_plot: Option<String>,

    #[arg(long, default_value = "height")]
    height_property: String,

    /// Building property copied into the tile batch tables as `id`.
    #[arg(long)]
    id_property: Option<String>,

    #[arg(long, default_value = "plot_ID")]
    plot_id_property: String,

    #[arg(long, default_value = "tileset_out")]
    output_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = Tiling::Auto)]
    tiling: Tiling,

    /// Grid cell edge in scene units.
    #[arg(long, default_value_t = skyline::partition::DEFAULT_CELL_SIZE)]
    cell_size: f64,

    /// Largest scene `auto` tiling keeps in a single tile.
    #[arg(long, default_value_t = skyline::partition::DEFAULT_MAX_SINGLE)]
    max_single_tile: usize,

    #[arg(long, value_enum, default_value_t = Volume::Box)]
    volume: Volume,

    #[arg(long, value_enum, default_value_t = Normals::Smooth)]
    shading: Normals,

    /// Neighbour distance for the height recommendation, in scene units.
    #[arg(long, default_value_t = skyline::DEFAULT_PROXIMITY)]
    proximity: f64,

    /// Record the generation time in `asset.tilesetVersion`.
    #[arg(long, default_value_t = false)]
    timestamp: bool,

    /// Replace a non-empty output directory.
    #[arg(long, default_value_t = false)]
    overwrite: bool,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        let tiling = match self.tiling {
            Tiling::Single => TilingScheme::Single,
            Tiling::Grid => TilingScheme::Grid {
                cell_size: self.cell_size,
            },
            Tiling::Auto => TilingScheme::Auto {
                cell_size: self.cell_size,
                max_single: self.max_single_tile,
            },
        };

        PipelineConfig {
            tiling,
            volume: match self.volume {
                Volume::Box => VolumeKind::Box,
                Volume::Sphere => VolumeKind::Sphere,
            },
            shading: match self.shading {
                Normals::Smooth => Shading::Smooth,
                Normals::Flat => Shading::Flat,
            },
            proximity: self.proximity,
            timestamp: self.timestamp,
        }
    }
}

/// Make sure `args.output_dir` exists and holds nothing from a previous run.
fn prepare_output_dir(args: &Args) -> Result<()> {
    let dir = &args.output_dir;

    let occupied = match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    };

    if occupied {
        if !args.overwrite {
            bail!(
                "{} is not empty; pass --overwrite to replace it",
                dir.display()
            );
        }
        warn!("Removing previous contents of {}", dir.display());
        fs::remove_dir_all(dir).with_context(|| format!("removing {}", dir.display()))?;
    }

    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))
}

fn run(args: &Args) -> Result<SceneOutput> {
    let config = args.pipeline_config();

    let buildings = load_footprints(&args.buildings, &args.height_property, args.id_property.as_deref())
        .context("loading buildings")?;

    let plots = match &args.plots {
        Some(path) => load_plots(path, &args.plot_id_property).context("loading plots")?,
        None => Vec::new(),
    };

    let target = match &args.target_plot {
        Some(id) => {
            let plot = find_plot(&plots, id);
            if plot.is_none() {
                warn!("Target plot {id} not found; no recommendation.");
            }
            plot
        }
        None => None,
    };

    prepare_output_dir(args)?;

    info!(
        "Generating {} tiling for {} building(s) into {}",
        args.tiling,
        buildings.len(),
        args.output_dir.display()
    );

    let output = generate_scene(&buildings, target, &args.output_dir, &config)
        .with_context(|| format!("generating scene in {}", args.output_dir.display()))?;

    Ok(output)
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let output = run(&args)?;

    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUILDINGS: &str = r#"{"type": "FeatureCollection", "features": [
        {"type": "Feature", "properties": {"height": 10, "name": "a"},
         "geometry": {"type": "Polygon", "coordinates": [[[0, 0], [10, 0], [10, 10], [0, 10], [0, 0]]]}},
        {"type": "Feature", "properties": {"height": "30", "name": "b"},
         "geometry": {"type": "Polygon", "coordinates": [[[20, 0], [30, 0], [30, 10], [20, 10], [20, 0]]]}}
    ]}"#;

    const PLOTS: &str = r#"{"type": "FeatureCollection", "features": [
        {"type": "Feature", "properties": {"plot_ID": "P1"},
         "geometry": {"type": "Polygon", "coordinates": [[[0, 20], [30, 20], [30, 40], [0, 40], [0, 20]]]}}
    ]}"#;

    fn args(dir: &std::path::Path, extra: &[&str]) -> Args {
        let buildings = dir.join("buildings.geojson");
        let plots = dir.join("plots.geojson");
        fs::write(&buildings, BUILDINGS).unwrap();
        fs::write(&plots, PLOTS).unwrap();

        let out = dir.join("out");
        let mut argv = vec![
            "footprints2tiles".to_string(),
            "--buildings".into(),
            buildings.display().to_string(),
            "--plots".into(),
            plots.display().to_string(),
            "--output-dir".into(),
            out.display().to_string(),
        ];
        argv.extend(extra.iter().map(|s| s.to_string()));

        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn flags_map_onto_pipeline_config() {
        let dir = tempfile::tempdir().unwrap();
        let args = args(
            dir.path(),
            &["--tiling", "grid", "--cell-size", "40", "--volume", "sphere", "--shading", "flat"],
        );
        let config = args.pipeline_config();

        assert_eq!(config.tiling, TilingScheme::Grid { cell_size: 40.0 });
        assert_eq!(config.volume, VolumeKind::Sphere);
        assert_eq!(config.shading, Shading::Flat);
        assert_eq!(config.proximity, 50.0);
    }

    #[test]
    fn target_plot_requires_plots() {
        let res = Args::try_parse_from(["footprints2tiles", "--buildings", "b.geojson", "--target-plot", "P1"]);
        assert!(res.is_err());
    }

    #[test]
    fn run_writes_tileset_and_recommends() {
        let dir = tempfile::tempdir().unwrap();
        let args = args(dir.path(), &["--target-plot", "P1", "--id-property", "name"]);

        let out = run(&args).unwrap();
        assert_eq!(out.tile_count, 1);
        assert!(args.output_dir.join("tileset.json").is_file());
        assert!(args.output_dir.join("tiles/tile_0.b3dm").is_file());

        // Both buildings sit 10 units south of the plot.
        let rec = out.recommendation.unwrap();
        assert_eq!(rec.value, 20.0);
        assert_eq!(rec.plot_id, "P1");
    }

    #[test]
    fn unknown_plot_gives_no_recommendation() {
        let dir = tempfile::tempdir().unwrap();
        let out = run(&args(dir.path(), &["--target-plot", "nope"])).unwrap();

        assert!(out.recommendation.is_none());
    }

    #[test]
    fn occupied_output_needs_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let first = args(dir.path(), &[]);
        run(&first).unwrap();

        assert!(run(&first).is_err());
        assert!(run(&args(dir.path(), &["--overwrite"])).is_ok());
    }
}
