//! Solid meshes to b3dm tile payloads.
//!
//! Each payload is one drawable batch: the meshes' vertex buffers are
//! concatenated with shifted indices and every vertex carries the batch id
//! of the solid it came from. Positions are stored as f32 offsets from the
//! batch's bounding-box center (`RTC_CENTER`).

use crate::bounds::Aabb;
use crate::error::{PipelineError, Result};
use crate::extrude::SolidMesh;
use crate::partition::TileBucket;
use b3dm::{BatchedModel, DEFAULT_BASE_COLOR};
use log::debug;
use rayon::prelude::*;
use serde_json::{Map, Value};

/// Batch table row for one solid.
struct Feature<'a> {
    mesh: &'a SolidMesh,
    id: Option<&'a str>,
    height: f64,
    source_index: usize,
}

/// Encode bare meshes; batch ids and `source_index` follow slice order.
pub fn encode(meshes: &[SolidMesh]) -> Result<Vec<u8>> {
    let features = meshes.iter().enumerate().map(|(i, mesh)| Feature {
        mesh,
        id: None,
        height: mesh.aabb().map_or(0.0, |b| b.max[2] - b.min[2]),
        source_index: i,
    });

    encode_features(features.collect())
}

/// Encode one bucket's members, carrying their identifiers and heights.
pub fn encode_bucket(bucket: &TileBucket) -> Result<Vec<u8>> {
    let features = bucket
        .members
        .iter()
        .map(|m| Feature {
            mesh: &m.mesh,
            id: m.id.as_deref(),
            height: m.height,
            source_index: m.source_index,
        })
        .collect();

    encode_features(features)
}

/// Fill every bucket's payload, one rayon task per bucket.
pub fn encode_buckets(buckets: &mut [TileBucket]) -> Result<()> {
    buckets.par_iter_mut().try_for_each(|bucket| {
        bucket.payload = encode_bucket(bucket)?;
        debug!(
            "Encoded bucket ({}, {}): {} solid(s), {} bytes.",
            bucket.key.row,
            bucket.key.col,
            bucket.members.len(),
            bucket.payload.len()
        );
        Ok(())
    })
}

fn encode_features(features: Vec<Feature<'_>>) -> Result<Vec<u8>> {
    let vertex_total: usize = features.iter().map(|f| f.mesh.vertex_count()).sum();
    let index_total: usize = features.iter().map(|f| 3 * f.mesh.triangle_count()).sum();

    if u32::try_from(vertex_total).is_err() {
        return Err(PipelineError::EncodingOverflow(format!(
            "{vertex_total} vertices exceed the u32 index range"
        )));
    }
    let batch_length = u32::try_from(features.len()).map_err(|_| {
        PipelineError::EncodingOverflow(format!("{} solids in one batch", features.len()))
    })?;

    let center = Aabb::from_points(features.iter().flat_map(|f| f.mesh.positions.iter().copied()))
        .map_or([0.0; 3], |b| b.center());

    let mut positions = Vec::with_capacity(vertex_total);
    let mut normals = Vec::with_capacity(vertex_total);
    let mut batch_ids = Vec::with_capacity(vertex_total);
    let mut indices = Vec::with_capacity(index_total);

    let mut ids = Vec::with_capacity(features.len());
    let mut heights = Vec::with_capacity(features.len());
    let mut sources = Vec::with_capacity(features.len());

    for (batch_id, feature) in (0u32..).zip(&features) {
        let mesh = feature.mesh;
        // Fits: vertex_total was checked against u32 above.
        let base = positions.len() as u32;

        positions.extend(mesh.positions.iter().map(|p| {
            [
                (p[0] - center[0]) as f32,
                (p[1] - center[1]) as f32,
                (p[2] - center[2]) as f32,
            ]
        }));
        normals.extend_from_slice(&mesh.normals);
        batch_ids.extend(std::iter::repeat(batch_id).take(mesh.vertex_count()));
        indices.extend(mesh.triangles.iter().flatten().map(|&i| base + i));

        ids.push(feature.id.map_or(Value::Null, Value::from));
        heights.push(Value::from(feature.height));
        sources.push(Value::from(feature.source_index));
    }

    let mut batch_table = Map::new();
    batch_table.insert("id".into(), Value::Array(ids));
    batch_table.insert("height".into(), Value::Array(heights));
    batch_table.insert("source_index".into(), Value::Array(sources));

    let model = BatchedModel {
        rtc_center: Some(center),
        positions,
        normals,
        batch_ids,
        indices,
        batch_length,
        batch_table,
        base_color: DEFAULT_BASE_COLOR,
    };

    Ok(b3dm::to_bytes(&model)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::VolumeKind;
    use crate::extrude::{extrude, extrude_with, Shading};
    use crate::footprint::FootprintRecord;
    use crate::partition::{partition, TilingScheme};

    fn block(x: f64, y: f64, size: f64, height: f64) -> FootprintRecord {
        FootprintRecord::new(vec![[x, y], [x + size, y], [x + size, y + size], [x, y + size]], height)
    }

    #[test]
    fn payload_decodes_to_the_same_solids() {
        // Projected coordinates: far from the origin, where bare f32 would lose centimetres.
        let meshes = vec![
            extrude(&block(500_000.0, 4_000_000.0, 12.0, 9.0)).unwrap(),
            extrude_with(&block(500_030.0, 4_000_010.0, 8.0, 21.5), Shading::Flat).unwrap(),
        ];

        let bytes = encode(&meshes).unwrap();
        assert_eq!(&bytes[..4], b"b3dm");
        assert_eq!(bytes.len() % 8, 0);

        let model = b3dm::parse_b3dm_bytes(&bytes).unwrap();
        assert_eq!(model.batch_length, 2);
        assert_eq!(model.index_width(), b3dm::IndexWidth::U16);

        let world = model.world_positions();
        let expected: Vec<[f64; 3]> = meshes.iter().flat_map(|m| m.positions.clone()).collect();
        assert_eq!(world.len(), expected.len());
        for (got, want) in world.iter().zip(&expected) {
            for k in 0..3 {
                assert!((got[k] - want[k]).abs() < 1e-3, "{got:?} vs {want:?}");
            }
        }

        let expected_normals: Vec<[f32; 3]> = meshes.iter().flat_map(|m| m.normals.clone()).collect();
        assert_eq!(model.normals, expected_normals);

        // Second mesh's indices are shifted past the first mesh's vertices.
        let first = meshes[0].vertex_count() as u32;
        let split = 3 * meshes[0].triangle_count();
        assert!(model.indices[..split].iter().all(|&i| i < first));
        assert!(model.indices[split..].iter().all(|&i| i >= first));

        assert!(model.batch_ids[..first as usize].iter().all(|&b| b == 0));
        assert!(model.batch_ids[first as usize..].iter().all(|&b| b == 1));
    }

    #[test]
    fn bucket_batch_table_names_its_sources() {
        let records = vec![
            block(0.0, 0.0, 10.0, 5.0).with_id("a"),
            block(20.0, 0.0, 10.0, 7.5),
        ];
        let solids = records.iter().map(|r| (extrude(r).unwrap(), r)).collect();
        let mut buckets = partition(solids, TilingScheme::Single, VolumeKind::Box);

        encode_buckets(&mut buckets).unwrap();
        let model = b3dm::parse_b3dm_bytes(&buckets[0].payload).unwrap();

        assert_eq!(model.batch_table["id"], serde_json::json!(["a", null]));
        assert_eq!(model.batch_table["height"], serde_json::json!([5.0, 7.5]));
        assert_eq!(model.batch_table["source_index"], serde_json::json!([0, 1]));
    }

    #[test]
    fn rtc_center_is_the_batch_center() {
        let meshes = vec![extrude(&block(100.0, 200.0, 10.0, 4.0)).unwrap()];
        let model = b3dm::parse_b3dm_bytes(&encode(&meshes).unwrap()).unwrap();

        assert_eq!(model.rtc_center, Some([105.0, 205.0, 2.0]));
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(encode(&[]).is_err());
    }
}
