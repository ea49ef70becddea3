//! B3DM: Batched 3D Model tiles wrapping one binary glTF 2.0 batch.
//!
//! - Positions are stored as f32 offsets from an f64 `RTC_CENTER` anchor so
//!   projected (large) coordinates keep their precision.
//! - One primitive per tile: POSITION, NORMAL, _BATCHID, indices (u16 or u32).
//! - Per-feature attributes travel in the batch table JSON.
//!
//! File layout (little-endian):
//!   00  : [u8;4]  magic = b"b3dm"
//!   04  : u32     version = 1
//!   08  : u32     byte_length (whole tile)
//!   0C  : u32     feature_table_json_len
//!   10  : u32     feature_table_bin_len   (always 0 here)
//!   14  : u32     batch_table_json_len
//!   18  : u32     batch_table_bin_len     (always 0 here)
//!   1C  : feature table JSON  {"BATCH_LENGTH": n, "RTC_CENTER": [x, y, z]}
//!   ..  : batch table JSON    {"<attribute>": [value per feature], ...}
//!   ..  : GLB
//!
//! Every section starts and ends on an 8-byte boundary; JSON is padded with
//! spaces, binary with zeros.
//!
//! GLB layout:
//!   "glTF" u32 version=2 u32 length
//!   u32 json_len  u32 "JSON"  [json_len bytes]
//!   u32 bin_len   u32 "BIN\0" [bin_len bytes]
//!
//! BIN chunk: positions (f32x3) | normals (f32x3) | batch ids (f32) | indices.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::{self, ErrorKind};
use std::path::Path;

pub mod gltf;

pub const B3DM_MAGIC: [u8; 4] = *b"b3dm";
pub const B3DM_VERSION: u32 = 1;
pub const B3DM_HEADER_LEN: usize = 28;

pub const GLB_MAGIC: [u8; 4] = *b"glTF";
pub const GLB_VERSION: u32 = 2;
const GLB_HEADER_LEN: usize = 12;
const CHUNK_HEADER_LEN: usize = 8;
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;

/// Vertex count from which indices no longer fit u16 (0xFFFF stays reserved).
pub const MAX_U16_VERTICES: usize = 65_535;

/// Batch ids are written as float32, which is exact up to 2^24.
pub const MAX_BATCH_LENGTH: usize = 1 << 24;

pub const DEFAULT_BASE_COLOR: [f32; 4] = [0.8, 0.8, 0.8, 1.0];

const GENERATOR: &str = "b3dm-rs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexWidth {
    U16,
    U32,
}

impl IndexWidth {
    #[inline]
    pub fn for_vertex_count(vertices: usize) -> Self {
        if vertices < MAX_U16_VERTICES {
            IndexWidth::U16
        } else {
            IndexWidth::U32
        }
    }

    #[inline]
    fn component_type(self) -> u32 {
        match self {
            IndexWidth::U16 => gltf::COMPONENT_UNSIGNED_SHORT,
            IndexWidth::U32 => gltf::COMPONENT_UNSIGNED_INT,
        }
    }
}

/// One drawable batch: everything a tile carries.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchedModel {
    /// Anchor the f32 positions are relative to.
    pub rtc_center: Option<[f64; 3]>,
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    /// Feature index per vertex, `< batch_length`.
    pub batch_ids: Vec<u32>,
    /// Flat triangle list.
    pub indices: Vec<u32>,
    pub batch_length: u32,
    pub batch_table: Map<String, Value>,
    pub base_color: [f32; 4],
}

impl BatchedModel {
    /// Positions with the RTC anchor re-applied.
    pub fn world_positions(&self) -> Vec<[f64; 3]> {
        let c = self.rtc_center.unwrap_or([0.0; 3]);
        self.positions
            .iter()
            .map(|p| [c[0] + p[0] as f64, c[1] + p[1] as f64, c[2] + p[2] as f64])
            .collect()
    }

    #[inline]
    pub fn index_width(&self) -> IndexWidth {
        IndexWidth::for_vertex_count(self.positions.len())
    }

    pub fn validate(&self) -> Result<(), EncodeError> {
        let vertices = self.positions.len();

        if vertices == 0 {
            return Err(EncodeError::Empty);
        }
        if u32::try_from(vertices).is_err() {
            return Err(EncodeError::TooManyVertices(vertices));
        }
        if u32::try_from(self.indices.len()).is_err() {
            return Err(EncodeError::TooManyIndices(self.indices.len()));
        }
        if self.batch_length as usize > MAX_BATCH_LENGTH {
            return Err(EncodeError::TooManyFeatures(self.batch_length as usize));
        }
        if self.normals.len() != vertices {
            return Err(EncodeError::AttributeMismatch {
                attribute: gltf::ATTR_NORMAL,
                expected: vertices,
                got: self.normals.len(),
            });
        }
        if self.batch_ids.len() != vertices {
            return Err(EncodeError::AttributeMismatch {
                attribute: gltf::ATTR_BATCHID,
                expected: vertices,
                got: self.batch_ids.len(),
            });
        }
        if self.indices.len() % 3 != 0 {
            return Err(EncodeError::PartialTriangle(self.indices.len()));
        }
        if let Some(&index) = self.indices.iter().find(|&&i| i as usize >= vertices) {
            return Err(EncodeError::IndexOutOfRange { index, vertices });
        }
        if let Some(&id) = self.batch_ids.iter().find(|&&id| id >= self.batch_length) {
            return Err(EncodeError::BatchIdOutOfRange {
                id,
                batch_length: self.batch_length,
            });
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("batch has no vertices")]
    Empty,
    #[error("{0} vertices exceed the u32 index range")]
    TooManyVertices(usize),
    #[error("{0} indices exceed the u32 accessor count")]
    TooManyIndices(usize),
    #[error("{0} features exceed float32 batch id precision")]
    TooManyFeatures(usize),
    #[error("tile of {0} bytes exceeds the u32 length field")]
    TooLarge(usize),
    #[error("{attribute} has {got} elements, expected {expected}")]
    AttributeMismatch {
        attribute: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("index count {0} is not a multiple of 3")]
    PartialTriangle(usize),
    #[error("index {index} out of range for {vertices} vertices")]
    IndexOutOfRange { index: u32, vertices: usize },
    #[error("batch id {id} out of range for batch length {batch_length}")]
    BatchIdOutOfRange { id: u32, batch_length: u32 },
    #[error("failed to serialize JSON section: {0}")]
    Json(#[from] serde_json::Error),
}

impl EncodeError {
    /// True when the batch is well-formed but too large for the container.
    pub fn is_overflow(&self) -> bool {
        matches!(
            self,
            EncodeError::TooManyVertices(_)
                | EncodeError::TooManyIndices(_)
                | EncodeError::TooManyFeatures(_)
                | EncodeError::TooLarge(_)
        )
    }
}

/// The fixed 28-byte tile header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct B3dmHeader {
    pub version: u32,
    pub byte_length: u32,
    pub feature_table_json_len: u32,
    pub feature_table_bin_len: u32,
    pub batch_table_json_len: u32,
    pub batch_table_bin_len: u32,
}

#[inline(always)]
fn need(buf: &[u8], want: usize) -> io::Result<()> {
    if buf.len() < want {
        Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated b3dm"))
    } else {
        Ok(())
    }
}

#[inline(always)]
fn take<'a>(buf: &mut &'a [u8], n: usize) -> io::Result<&'a [u8]> {
    need(buf, n)?;
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

#[inline(always)]
fn le_u32(buf: &mut &[u8]) -> io::Result<u32> {
    let b = take(buf, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[cold]
fn bad(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg)
}

pub fn parse_header(mut p: &[u8]) -> io::Result<B3dmHeader> {
    if take(&mut p, 4)? != B3DM_MAGIC {
        return Err(bad("bad b3dm magic"));
    }

    let version = le_u32(&mut p)?;
    if version != B3DM_VERSION {
        return Err(bad("unsupported b3dm version"));
    }

    Ok(B3dmHeader {
        version,
        byte_length: le_u32(&mut p)?,
        feature_table_json_len: le_u32(&mut p)?,
        feature_table_bin_len: le_u32(&mut p)?,
        batch_table_json_len: le_u32(&mut p)?,
        batch_table_bin_len: le_u32(&mut p)?,
    })
}

/// Parse a tile from a contiguous byte slice. This is the single source of truth for parsing.
pub fn parse_b3dm_bytes(bytes: &[u8]) -> io::Result<BatchedModel> {
    let header = parse_header(bytes)?;
    if header.byte_length as usize != bytes.len() {
        return Err(bad("b3dm byte_length does not match buffer size"));
    }

    let mut p = &bytes[B3DM_HEADER_LEN..];
    let feature_json = take(&mut p, header.feature_table_json_len as usize)?;
    take(&mut p, header.feature_table_bin_len as usize)?;
    let batch_json = take(&mut p, header.batch_table_json_len as usize)?;
    take(&mut p, header.batch_table_bin_len as usize)?;

    // Feature table
    let feature_table: Map<String, Value> = serde_json::from_slice(feature_json)
        .map_err(|e| bad(&format!("invalid feature table JSON: {e}")))?;

    let batch_length = feature_table
        .get("BATCH_LENGTH")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| bad("feature table lacks BATCH_LENGTH"))?;

    let rtc_center = match feature_table.get("RTC_CENTER") {
        Some(Value::Array(xyz)) if xyz.len() == 3 => {
            let mut c = [0.0f64; 3];
            for (slot, v) in c.iter_mut().zip(xyz) {
                *slot = v.as_f64().ok_or_else(|| bad("RTC_CENTER must be numeric"))?;
            }
            Some(c)
        }
        Some(_) => return Err(bad("RTC_CENTER must hold three numbers")),
        None => None,
    };

    // Batch table
    let batch_table: Map<String, Value> = if batch_json.is_empty() {
        Map::new()
    } else {
        serde_json::from_slice(batch_json)
            .map_err(|e| bad(&format!("invalid batch table JSON: {e}")))?
    };

    // GLB
    let (doc, bin) = parse_glb(p)?;

    let primitive = doc
        .meshes
        .first()
        .and_then(|m| m.primitives.first())
        .ok_or_else(|| bad("glTF has no primitive"))?;

    if primitive.mode != gltf::MODE_TRIANGLES {
        return Err(bad("only triangle primitives are supported"));
    }

    let position_accessor = *primitive
        .attributes
        .get(gltf::ATTR_POSITION)
        .ok_or_else(|| bad("primitive lacks POSITION"))?;
    let positions = read_vec3(&doc, bin, position_accessor)?;

    let normals = match primitive.attributes.get(gltf::ATTR_NORMAL) {
        Some(&index) => read_vec3(&doc, bin, index)?,
        None => Vec::new(),
    };

    let batch_ids = match primitive.attributes.get(gltf::ATTR_BATCHID) {
        Some(&index) => read_f32(&doc, bin, index)?
            .into_iter()
            .map(|id| id as u32)
            .collect(),
        None => Vec::new(),
    };

    let indices = read_indices(&doc, bin, primitive.indices)?;
    if let Some(&i) = indices.iter().find(|&&i| i as usize >= positions.len()) {
        return Err(bad(&format!("index {i} out of range")));
    }

    let base_color = primitive
        .material
        .and_then(|m| doc.materials.get(m as usize))
        .map(|m| m.pbr_metallic_roughness.base_color_factor)
        .unwrap_or(DEFAULT_BASE_COLOR);

    Ok(BatchedModel {
        rtc_center,
        positions,
        normals,
        batch_ids,
        indices,
        batch_length,
        batch_table,
        base_color,
    })
}

fn parse_glb(bytes: &[u8]) -> io::Result<(gltf::Document, &[u8])> {
    let mut p = bytes;

    if take(&mut p, 4)? != GLB_MAGIC {
        return Err(bad("bad glTF magic"));
    }

    let version = le_u32(&mut p)?;
    if version != GLB_VERSION {
        return Err(bad("unsupported glTF container version"));
    }

    let length = le_u32(&mut p)? as usize;
    if length < GLB_HEADER_LEN || length > bytes.len() {
        return Err(bad("GLB length out of range"));
    }
    let mut p = &bytes[GLB_HEADER_LEN..length];

    let json_len = le_u32(&mut p)? as usize;
    if le_u32(&mut p)? != CHUNK_JSON {
        return Err(bad("expected JSON chunk"));
    }
    let json = take(&mut p, json_len)?;
    let doc: gltf::Document =
        serde_json::from_slice(json).map_err(|e| bad(&format!("invalid glTF JSON: {e}")))?;

    let bin: &[u8] = if p.is_empty() {
        &[]
    } else {
        let bin_len = le_u32(&mut p)? as usize;
        if le_u32(&mut p)? != CHUNK_BIN {
            return Err(bad("expected BIN chunk"));
        }
        take(&mut p, bin_len)?
    };

    Ok((doc, bin))
}

/// Bytes an accessor covers, bounds-checked against its view and the BIN chunk.
fn accessor_bytes<'a>(
    doc: &'a gltf::Document,
    bin: &'a [u8],
    index: u32,
) -> io::Result<(&'a gltf::Accessor, &'a [u8])> {
    let accessor = doc
        .accessors
        .get(index as usize)
        .ok_or_else(|| bad("accessor index out of range"))?;
    let view = doc
        .buffer_views
        .get(accessor.buffer_view as usize)
        .ok_or_else(|| bad("buffer view index out of range"))?;

    let components = accessor
        .components()
        .ok_or_else(|| bad("unsupported accessor type"))?;
    let size = gltf::component_size(accessor.component_type)
        .ok_or_else(|| bad("unsupported component type"))?;

    let len = (accessor.count as usize)
        .checked_mul(components * size)
        .ok_or_else(|| bad("accessor size overflow"))?;
    let start = view.byte_offset as usize + accessor.byte_offset as usize;
    let end = start.checked_add(len).ok_or_else(|| bad("accessor size overflow"))?;
    let view_end = view.byte_offset as usize + view.byte_length as usize;

    if end > view_end || end > bin.len() {
        return Err(bad("accessor exceeds buffer view"));
    }

    Ok((accessor, &bin[start..end]))
}

fn read_f32(doc: &gltf::Document, bin: &[u8], index: u32) -> io::Result<Vec<f32>> {
    let (accessor, raw) = accessor_bytes(doc, bin, index)?;
    if accessor.component_type != gltf::COMPONENT_FLOAT {
        return Err(bad("expected float accessor"));
    }

    Ok(raw
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn read_vec3(doc: &gltf::Document, bin: &[u8], index: u32) -> io::Result<Vec<[f32; 3]>> {
    if doc.accessors.get(index as usize).and_then(|a| a.components()) != Some(3) {
        return Err(bad("expected VEC3 accessor"));
    }

    let flat = read_f32(doc, bin, index)?;
    Ok(flat.chunks_exact(3).map(|v| [v[0], v[1], v[2]]).collect())
}

fn read_indices(doc: &gltf::Document, bin: &[u8], index: u32) -> io::Result<Vec<u32>> {
    let (accessor, raw) = accessor_bytes(doc, bin, index)?;

    match accessor.component_type {
        gltf::COMPONENT_UNSIGNED_SHORT => Ok(raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]) as u32)
            .collect()),
        gltf::COMPONENT_UNSIGNED_INT => Ok(raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()),
        _ => Err(bad("unsupported index component type")),
    }
}

/// Read and decode one tile from disk.
pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<BatchedModel> {
    let bytes = std::fs::read(path)?;
    parse_b3dm_bytes(&bytes)
}

/// Serialize a batch into a complete tile.
pub fn to_bytes(model: &BatchedModel) -> Result<Vec<u8>, EncodeError> {
    model.validate()?;

    let glb = encode_glb(model)?;

    let mut feature_table = Map::new();
    feature_table.insert("BATCH_LENGTH".into(), Value::from(model.batch_length));
    if let Some(c) = model.rtc_center {
        feature_table.insert(
            "RTC_CENTER".into(),
            Value::Array(c.iter().map(|&v| Value::from(v)).collect()),
        );
    }

    let mut feature_json = serde_json::to_vec(&feature_table)?;
    pad_to(&mut feature_json, B3DM_HEADER_LEN, 8, b' ');

    let mut batch_json = if model.batch_table.is_empty() {
        Vec::new()
    } else {
        serde_json::to_vec(&model.batch_table)?
    };
    pad_to(&mut batch_json, B3DM_HEADER_LEN + feature_json.len(), 8, b' ');

    let total = B3DM_HEADER_LEN + feature_json.len() + batch_json.len() + glb.len();
    let byte_length = u32::try_from(total).map_err(|_| EncodeError::TooLarge(total))?;

    let mut out = Vec::with_capacity(total);

    out.extend_from_slice(&B3DM_MAGIC);
    push_u32(&mut out, B3DM_VERSION);
    push_u32(&mut out, byte_length);
    push_u32(&mut out, feature_json.len() as u32);
    push_u32(&mut out, 0);
    push_u32(&mut out, batch_json.len() as u32);
    push_u32(&mut out, 0);

    out.extend_from_slice(&feature_json);
    out.extend_from_slice(&batch_json);
    out.extend_from_slice(&glb);

    Ok(out)
}

fn encode_glb(model: &BatchedModel) -> Result<Vec<u8>, EncodeError> {
    let vertices = model.positions.len();
    let width = model.index_width();

    // BIN chunk; every block before the indices is a multiple of 4 bytes.
    let mut bin = Vec::<u8>::new();

    let position_offset = bin.len();
    extend_f32x3(&mut bin, &model.positions);
    let normal_offset = bin.len();
    extend_f32x3(&mut bin, &model.normals);
    let batch_offset = bin.len();
    for &id in &model.batch_ids {
        bin.extend_from_slice(&(id as f32).to_le_bytes());
    }
    let index_offset = bin.len();
    match width {
        IndexWidth::U16 => {
            for &i in &model.indices {
                bin.extend_from_slice(&(i as u16).to_le_bytes());
            }
        }
        IndexWidth::U32 => extend_u32(&mut bin, &model.indices),
    }
    let index_len = bin.len() - index_offset;
    pad_to(&mut bin, 0, 8, 0);

    let (min, max) = position_bounds(&model.positions);

    let view = |offset: usize, len: usize, target: u32| gltf::BufferView {
        buffer: 0,
        byte_offset: offset as u32,
        byte_length: len as u32,
        target: Some(target),
    };

    let accessor = |view: u32, component_type: u32, count: usize, kind: &str| gltf::Accessor {
        buffer_view: view,
        byte_offset: 0,
        component_type,
        count: count as u32,
        kind: kind.to_owned(),
        min: None,
        max: None,
    };

    let mut attributes = BTreeMap::new();
    attributes.insert(gltf::ATTR_POSITION.to_owned(), 0);
    attributes.insert(gltf::ATTR_NORMAL.to_owned(), 1);
    attributes.insert(gltf::ATTR_BATCHID.to_owned(), 2);

    let doc = gltf::Document {
        asset: gltf::Asset {
            version: "2.0".into(),
            generator: Some(GENERATOR.into()),
        },
        scene: 0,
        scenes: vec![gltf::Scene { nodes: vec![0] }],
        nodes: vec![gltf::Node { mesh: 0 }],
        meshes: vec![gltf::Mesh {
            primitives: vec![gltf::Primitive {
                attributes,
                indices: 3,
                material: Some(0),
                mode: gltf::MODE_TRIANGLES,
            }],
        }],
        materials: vec![gltf::Material {
            pbr_metallic_roughness: gltf::PbrMetallicRoughness {
                base_color_factor: model.base_color,
                metallic_factor: 0.0,
                roughness_factor: 1.0,
            },
            double_sided: false,
        }],
        buffers: vec![gltf::Buffer {
            byte_length: bin.len() as u32,
        }],
        buffer_views: vec![
            view(position_offset, normal_offset - position_offset, gltf::TARGET_ARRAY_BUFFER),
            view(normal_offset, batch_offset - normal_offset, gltf::TARGET_ARRAY_BUFFER),
            view(batch_offset, index_offset - batch_offset, gltf::TARGET_ARRAY_BUFFER),
            view(index_offset, index_len, gltf::TARGET_ELEMENT_ARRAY_BUFFER),
        ],
        accessors: vec![
            gltf::Accessor {
                min: Some(min.to_vec()),
                max: Some(max.to_vec()),
                ..accessor(0, gltf::COMPONENT_FLOAT, vertices, "VEC3")
            },
            accessor(1, gltf::COMPONENT_FLOAT, vertices, "VEC3"),
            accessor(2, gltf::COMPONENT_FLOAT, vertices, "SCALAR"),
            accessor(3, width.component_type(), model.indices.len(), "SCALAR"),
        ],
    };

    let mut json = serde_json::to_vec(&doc)?;
    pad_to(&mut json, GLB_HEADER_LEN + CHUNK_HEADER_LEN, 8, b' ');

    let total = GLB_HEADER_LEN + 2 * CHUNK_HEADER_LEN + json.len() + bin.len();
    let length = u32::try_from(total).map_err(|_| EncodeError::TooLarge(total))?;

    let mut out = Vec::with_capacity(total);

    out.extend_from_slice(&GLB_MAGIC);
    push_u32(&mut out, GLB_VERSION);
    push_u32(&mut out, length);

    push_u32(&mut out, json.len() as u32);
    push_u32(&mut out, CHUNK_JSON);
    out.extend_from_slice(&json);

    push_u32(&mut out, bin.len() as u32);
    push_u32(&mut out, CHUNK_BIN);
    out.extend_from_slice(&bin);

    Ok(out)
}

fn position_bounds(positions: &[[f32; 3]]) -> ([f32; 3], [f32; 3]) {
    let mut min = [f32::INFINITY; 3];
    let mut max = [f32::NEG_INFINITY; 3];

    for p in positions {
        for axis in 0..3 {
            min[axis] = min[axis].min(p[axis]);
            max[axis] = max[axis].max(p[axis]);
        }
    }

    (min, max)
}

/// Pad `buf` so that `offset + buf.len()` lands on an `align` boundary.
#[inline]
fn pad_to(buf: &mut Vec<u8>, offset: usize, align: usize, fill: u8) {
    while (offset + buf.len()) % align != 0 {
        buf.push(fill);
    }
}

#[inline]
fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

#[inline]
fn extend_f32x3(out: &mut Vec<u8>, values: &[[f32; 3]]) {
    #[cfg(target_endian = "little")]
    {
        out.extend_from_slice(bytemuck::cast_slice(values));
    }

    #[cfg(not(target_endian = "little"))]
    {
        for v in values {
            for c in v {
                out.extend_from_slice(&c.to_le_bytes());
            }
        }
    }
}

#[inline]
fn extend_u32(out: &mut Vec<u8>, values: &[u32]) {
    #[cfg(target_endian = "little")]
    {
        out.extend_from_slice(bytemuck::cast_slice(values));
    }

    #[cfg(not(target_endian = "little"))]
    {
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
}
