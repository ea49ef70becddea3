//! Building footprints to a streamable 3D Tiles scene, plus a neighbourhood
//! height recommendation for a target plot.
//!
//! ```text
//! FootprintRecord ──extrude──▶ SolidMesh ──partition──▶ TileBucket
//!                                                          │ encode (b3dm)
//!                                                          ▼
//!                                     tileset.json + tiles/tile_<i>.b3dm
//! PlotRecord + FootprintRecords ──recommend──▶ HeightRecommendation
//! ```
//!
//! [`generate_scene`] runs the whole chain for one request.

pub mod bounds;
pub mod config;
pub mod encode;
pub mod error;
pub mod extrude;
pub mod footprint;
pub mod geojson;
pub mod geometry;
pub mod partition;
pub mod pipeline;
pub mod recommend;
pub mod tileset;

pub use bounds::{Aabb, BoundingVolume, VolumeKind};
pub use config::PipelineConfig;
pub use encode::{encode, encode_bucket, encode_buckets};
pub use error::{PipelineError, Result};
pub use extrude::{extrude, extrude_with, Shading, SolidMesh};
pub use footprint::{find_plot, FootprintRecord, PlotRecord};
pub use geojson::{load_footprints, load_plots, LoadError};
pub use partition::{partition, BucketKey, BucketMember, TileBucket, TilingScheme};
pub use pipeline::{generate_scene, SceneOutput};
pub use recommend::{recommend, HeightRecommendation, DEFAULT_PROXIMITY};
pub use tileset::{assemble, Manifest, MANIFEST_FILE, TILES_DIR};
