//! GeoJSON FeatureCollection loader.
//!
//! Attribute lookups happen here, once; the rest of the crate only sees
//! typed records. Only outer rings are read, holes are ignored.

use crate::footprint::{FootprintRecord, PlotRecord};
use crate::geometry::{self, Point2};
use log::{info, warn};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not a GeoJSON FeatureCollection: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl LoadError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, LoadError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    geometry: Option<Geometry>,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    coordinates: Value,
}

type Position = Vec<f64>;

/// Outer ring of every polygon part, positions truncated to x/y.
fn outer_rings(geometry: &Geometry) -> Result<Vec<Vec<Point2>>, String> {
    fn ring(positions: &[Position]) -> Result<Vec<Point2>, String> {
        positions
            .iter()
            .map(|p| match p[..] {
                [x, y, ..] => Ok([x, y]),
                _ => Err(format!("position has {} coordinate(s)", p.len())),
            })
            .collect()
    }

    fn parse<T: serde::de::DeserializeOwned>(v: &Value) -> Result<T, String> {
        T::deserialize(v).map_err(|e| e.to_string())
    }

    match geometry.kind.as_str() {
        "Polygon" => {
            let rings: Vec<Vec<Position>> = parse(&geometry.coordinates)?;
            let outer = rings.first().ok_or("polygon has no rings")?;
            Ok(vec![ring(outer)?])
        }
        "MultiPolygon" => {
            let parts: Vec<Vec<Vec<Position>>> = parse(&geometry.coordinates)?;
            parts
                .iter()
                .filter_map(|rings| rings.first())
                .map(|outer| ring(outer))
                .collect()
        }
        other => Err(format!("unsupported geometry type {other}")),
    }
}

fn property<'a>(feature: &'a Feature, name: &str) -> Option<&'a Value> {
    feature.properties.as_ref()?.get(name).filter(|v| !v.is_null())
}

/// Numbers, or strings holding a number.
fn as_height(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn read_collection(path: &Path) -> Result<FeatureCollection, LoadError> {
    let file = File::open(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_reader(BufReader::new(file)).map_err(|source| LoadError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Building footprints with heights from `height_property`.
///
/// Features without a usable height or geometry are skipped with a warning.
/// Each part of a MultiPolygon becomes its own record sharing the feature's id.
pub fn load_footprints(
    path: &Path,
    height_property: &str,
    id_property: Option<&str>,
) -> Result<Vec<FootprintRecord>, LoadError> {
    let collection = read_collection(path)?;
    let records = footprints_from(collection, height_property, id_property);

    info!("Loaded {} footprint(s) from {}.", records.len(), path.display());
    Ok(records)
}

/// Land-use plots keyed by `id_property`.
pub fn load_plots(path: &Path, id_property: &str) -> Result<Vec<PlotRecord>, LoadError> {
    let collection = read_collection(path)?;
    let plots = plots_from(collection, id_property);

    info!("Loaded {} plot(s) from {}.", plots.len(), path.display());
    Ok(plots)
}

pub fn parse_footprints(
    json: &str,
    height_property: &str,
    id_property: Option<&str>,
) -> Result<Vec<FootprintRecord>, serde_json::Error> {
    Ok(footprints_from(serde_json::from_str(json)?, height_property, id_property))
}

pub fn parse_plots(json: &str, id_property: &str) -> Result<Vec<PlotRecord>, serde_json::Error> {
    Ok(plots_from(serde_json::from_str(json)?, id_property))
}

fn footprints_from(
    collection: FeatureCollection,
    height_property: &str,
    id_property: Option<&str>,
) -> Vec<FootprintRecord> {
    let mut records = Vec::with_capacity(collection.features.len());

    for (index, feature) in collection.features.iter().enumerate() {
        let height = match property(feature, height_property).and_then(as_height) {
            Some(h) if h > 0.0 && h.is_finite() => h,
            Some(h) => {
                warn!("Feature {index}: height {h} is not positive; skipped.");
                continue;
            }
            None => {
                warn!("Feature {index}: no numeric '{height_property}'; skipped.");
                continue;
            }
        };

        let Some(geometry) = &feature.geometry else {
            warn!("Feature {index}: no geometry; skipped.");
            continue;
        };

        let rings = match outer_rings(geometry) {
            Ok(rings) => rings,
            Err(e) => {
                warn!("Feature {index}: {e}; skipped.");
                continue;
            }
        };

        let id = id_property.and_then(|name| property(feature, name).and_then(as_id));

        records.extend(rings.into_iter().map(|ring| FootprintRecord {
            ring,
            height,
            id: id.clone(),
        }));
    }

    records
}

fn plots_from(collection: FeatureCollection, id_property: &str) -> Vec<PlotRecord> {
    let mut plots = Vec::with_capacity(collection.features.len());

    for (index, feature) in collection.features.iter().enumerate() {
        let Some(id) = property(feature, id_property).and_then(as_id) else {
            warn!("Plot feature {index}: no '{id_property}'; skipped.");
            continue;
        };

        let rings = match feature.geometry.as_ref().map(outer_rings) {
            Some(Ok(rings)) => rings,
            Some(Err(e)) => {
                warn!("Plot {id}: {e}; skipped.");
                continue;
            }
            None => {
                warn!("Plot {id}: no geometry; skipped.");
                continue;
            }
        };

        if rings.len() > 1 {
            warn!("Plot {id}: {} parts, keeping the largest.", rings.len());
        }

        let largest = rings
            .into_iter()
            .max_by(|a, b| geometry::signed_area(a).abs().total_cmp(&geometry::signed_area(b).abs()));

        if let Some(ring) = largest {
            plots.push(PlotRecord { ring, id });
        }
    }

    plots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::footprint::find_plot;

    const BUILDINGS: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            { "type": "Feature",
              "properties": { "height": 12.5, "osm_id": 101 },
              "geometry": { "type": "Polygon",
                            "coordinates": [[[0, 0], [10, 0], [10, 10], [0, 10], [0, 0]]] } },
            { "type": "Feature",
              "properties": { "height": "7", "osm_id": "w-2" },
              "geometry": { "type": "Polygon",
                            "coordinates": [[[20, 0, 3.5], [30, 0, 3.5], [30, 10, 3.5], [20, 0, 3.5]],
                                            [[22, 1], [23, 1], [23, 2], [22, 1]]] } },
            { "type": "Feature",
              "properties": { "osm_id": 3 },
              "geometry": { "type": "Polygon", "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 0]]] } },
            { "type": "Feature",
              "properties": { "height": -4 },
              "geometry": { "type": "Polygon", "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 0]]] } },
            { "type": "Feature",
              "properties": { "height": 30, "osm_id": 5 },
              "geometry": { "type": "MultiPolygon",
                            "coordinates": [[[[40, 0], [50, 0], [50, 10], [40, 0]]],
                                            [[[60, 0], [70, 0], [70, 10], [60, 0]]]] } },
            { "type": "Feature",
              "properties": { "height": 9 },
              "geometry": { "type": "LineString", "coordinates": [[0, 0], [1, 1]] } },
            { "type": "Feature", "properties": { "height": 9 }, "geometry": null }
        ]
    }"#;

    #[test]
    fn footprints_keep_only_usable_features() {
        let records = parse_footprints(BUILDINGS, "height", Some("osm_id")).unwrap();

        let summary: Vec<(f64, Option<&str>)> =
            records.iter().map(|r| (r.height, r.id.as_deref())).collect();
        assert_eq!(
            summary,
            vec![(12.5, Some("101")), (7.0, Some("w-2")), (30.0, Some("5")), (30.0, Some("5"))]
        );
    }

    #[test]
    fn rings_are_outer_and_planar() {
        let records = parse_footprints(BUILDINGS, "height", None).unwrap();

        assert_eq!(records[0].ring.len(), 5);
        assert_eq!(records[1].ring, vec![[20.0, 0.0], [30.0, 0.0], [30.0, 10.0], [20.0, 0.0]]);
        assert_eq!(records[3].ring[0], [60.0, 0.0]);
        assert!(records.iter().all(|r| r.id.is_none()));
    }

    #[test]
    fn plots_are_found_by_string_or_numeric_id() {
        let json = r#"{
            "type": "FeatureCollection",
            "features": [
                { "type": "Feature", "properties": { "plot_ID": "PlotA123" },
                  "geometry": { "type": "Polygon", "coordinates": [[[0, 0], [5, 0], [5, 5], [0, 5], [0, 0]]] } },
                { "type": "Feature", "properties": { "plot_ID": 42 },
                  "geometry": { "type": "MultiPolygon",
                                "coordinates": [[[[0, 0], [1, 0], [1, 1], [0, 0]]],
                                                [[[10, 10], [20, 10], [20, 20], [10, 20], [10, 10]]]] } },
                { "type": "Feature", "properties": {},
                  "geometry": { "type": "Polygon", "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 0]]] } }
            ]
        }"#;

        let plots = parse_plots(json, "plot_ID").unwrap();
        assert_eq!(plots.len(), 2);
        assert!(find_plot(&plots, "PlotA123").is_some());

        let numeric = find_plot(&plots, "42").unwrap();
        assert_eq!(numeric.ring[0], [10.0, 10.0]);
    }

    #[test]
    fn missing_file_is_reported_as_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_plots(&dir.path().join("absent.geojson"), "plot_ID").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buildings.geojson");
        std::fs::write(&path, BUILDINGS).unwrap();

        assert_eq!(load_footprints(&path, "height", None).unwrap().len(), 4);

        std::fs::write(&path, "{ not json").unwrap();
        let err = load_footprints(&path, "height", None).unwrap_err();
        assert!(matches!(err, LoadError::Json { .. }));
    }
}
