//! Footprint extrusion: a 2D ring plus a height becomes a closed prism.
//!
//! Base ring at z = 0, top ring at z = height, ear-clipped caps, two wall
//! triangles per ring edge. All triangles wind counter-clockwise seen from
//! outside the solid.

use crate::bounds::Aabb;
use crate::error::{PipelineError, Result};
use crate::footprint::{normalize_ring, FootprintRecord};
use crate::geometry::{self, Point2};
use serde::{Deserialize, Serialize};

/// How vertices are shared between caps and walls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shading {
    /// 2n shared vertices; normals blend the cap and the two adjacent walls.
    #[default]
    Smooth,
    /// Caps and walls own their vertices; every normal is the exact face normal.
    Flat,
}

/// Closed triangle mesh of one extruded footprint.
#[derive(Debug, Clone, PartialEq)]
pub struct SolidMesh {
    pub positions: Vec<[f64; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub triangles: Vec<[u32; 3]>,
}

impl SolidMesh {
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    pub fn aabb(&self) -> Option<Aabb> {
        Aabb::from_points(self.positions.iter().copied())
    }

    /// Unnormalised face normal (twice the triangle's area vector).
    pub fn face_normal(&self, triangle: usize) -> [f64; 3] {
        let [a, b, c] = self.triangles[triangle].map(|i| self.positions[i as usize]);
        let u = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
        let v = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];

        [
            u[1] * v[2] - u[2] * v[1],
            u[2] * v[0] - u[0] * v[2],
            u[0] * v[1] - u[1] * v[0],
        ]
    }

    /// Every index addresses a vertex, every triangle has area, one normal per vertex.
    pub fn validate(&self) -> Result<()> {
        if self.normals.len() != self.positions.len() {
            return Err(PipelineError::degenerate(format!(
                "{} normals for {} vertices",
                self.normals.len(),
                self.positions.len()
            )));
        }

        for (t, tri) in self.triangles.iter().enumerate() {
            if let Some(&i) = tri.iter().find(|&&i| i as usize >= self.positions.len()) {
                return Err(PipelineError::degenerate(format!(
                    "triangle {t} references vertex {i} of {}",
                    self.positions.len()
                )));
            }

            let n = self.face_normal(t);
            let area2 = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
            if !(area2 > 0.0 && area2.is_finite()) {
                return Err(PipelineError::degenerate(format!("triangle {t} has zero area")));
            }
        }

        Ok(())
    }
}

/// Extrude with the default (smooth) vertex layout.
pub fn extrude(footprint: &FootprintRecord) -> Result<SolidMesh> {
    extrude_with(footprint, Shading::Smooth)
}

pub fn extrude_with(footprint: &FootprintRecord, shading: Shading) -> Result<SolidMesh> {
    let height = footprint.height;
    if !(height > 0.0 && height.is_finite()) {
        return Err(PipelineError::InvalidHeight(height));
    }

    let ring = normalize_ring(&footprint.ring)?;
    let cap = triangulate(&ring)?;
    let edges = edge_normals(&ring);

    let mesh = match shading {
        Shading::Smooth => smooth_prism(&ring, &cap, &edges, height),
        Shading::Flat => flat_prism(&ring, &cap, &edges, height),
    };

    mesh.validate()?;
    Ok(mesh)
}

/// Outward unit normal of edge i -> i+1 of a counter-clockwise ring.
fn edge_normals(ring: &[Point2]) -> Vec<[f64; 2]> {
    let n = ring.len();

    (0..n)
        .map(|i| {
            let a = ring[i];
            let b = ring[(i + 1) % n];
            let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
            let len = (dx * dx + dy * dy).sqrt();
            [dy / len, -dx / len]
        })
        .collect()
}

#[inline]
fn normalize3(v: [f64; 3]) -> [f32; 3] {
    let len = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    [(v[0] / len) as f32, (v[1] / len) as f32, (v[2] / len) as f32]
}

fn smooth_prism(ring: &[Point2], cap: &[[u32; 3]], edges: &[[f64; 2]], height: f64) -> SolidMesh {
    let n = ring.len();
    let top = n as u32;

    let mut positions = Vec::with_capacity(2 * n);
    let mut normals = Vec::with_capacity(2 * n);

    for (z, up) in [(0.0, -1.0), (height, 1.0)] {
        for i in 0..n {
            let [x, y] = ring[i];
            let prev = edges[(i + n - 1) % n];
            let next = edges[i];

            positions.push([x, y, z]);
            normals.push(normalize3([prev[0] + next[0], prev[1] + next[1], up]));
        }
    }

    let mut triangles = Vec::with_capacity(2 * (n - 2) + 2 * n);
    for &[a, b, c] in cap {
        triangles.push([c, b, a]);
    }
    for &[a, b, c] in cap {
        triangles.push([a + top, b + top, c + top]);
    }
    for i in 0..n as u32 {
        let j = (i + 1) % n as u32;
        triangles.push([i, j, j + top]);
        triangles.push([i, j + top, i + top]);
    }

    SolidMesh {
        positions,
        normals,
        triangles,
    }
}

fn flat_prism(ring: &[Point2], cap: &[[u32; 3]], edges: &[[f64; 2]], height: f64) -> SolidMesh {
    let n = ring.len();
    let top = n as u32;

    let mut positions = Vec::with_capacity(6 * n);
    let mut normals = Vec::with_capacity(6 * n);

    for (z, up) in [(0.0, -1.0f32), (height, 1.0f32)] {
        for &[x, y] in ring {
            positions.push([x, y, z]);
            normals.push([0.0, 0.0, up]);
        }
    }

    let mut triangles = Vec::with_capacity(2 * (n - 2) + 2 * n);
    for &[a, b, c] in cap {
        triangles.push([c, b, a]);
    }
    for &[a, b, c] in cap {
        triangles.push([a + top, b + top, c + top]);
    }

    for i in 0..n {
        let [x0, y0] = ring[i];
        let [x1, y1] = ring[(i + 1) % n];
        let normal = [edges[i][0] as f32, edges[i][1] as f32, 0.0];
        let k = positions.len() as u32;

        positions.extend_from_slice(&[[x0, y0, 0.0], [x1, y1, 0.0], [x1, y1, height], [x0, y0, height]]);
        normals.extend_from_slice(&[normal; 4]);

        triangles.push([k, k + 1, k + 2]);
        triangles.push([k, k + 2, k + 3]);
    }

    SolidMesh {
        positions,
        normals,
        triangles,
    }
}

/// Cap triangulation of a simple counter-clockwise ring via `earcutr`.
/// Produces `n - 2` counter-clockwise triangles indexing into `ring`.
pub(crate) fn triangulate(ring: &[Point2]) -> Result<Vec<[u32; 3]>> {
    let flat: Vec<f64> = ring.iter().flatten().copied().collect();
    let indices = earcutr::earcut(&flat, &[], 2)
        .map_err(|e| PipelineError::degenerate(format!("cap triangulation failed: {e:?}")))?;

    let triangles: Vec<[u32; 3]> = indices
        .chunks_exact(3)
        .map(|t| {
            let [a, b, c] = [t[0] as u32, t[1] as u32, t[2] as u32];
            if geometry::signed_area(&[ring[t[0]], ring[t[1]], ring[t[2]]]) < 0.0 {
                [a, c, b]
            } else {
                [a, b, c]
            }
        })
        .collect();

    // A self-intersecting ring still yields triangles, but they no longer tile the ring.
    let covered: f64 = triangles
        .iter()
        .map(|t| geometry::signed_area(&t.map(|i| ring[i as usize])))
        .sum();
    let area = geometry::signed_area(ring);
    if triangles.is_empty() || (covered - area).abs() > 1e-9 * area.abs().max(1.0) {
        return Err(PipelineError::degenerate(
            "footprint ring self-intersects and cannot be triangulated",
        ));
    }

    Ok(triangles)
}
