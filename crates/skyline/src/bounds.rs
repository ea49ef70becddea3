use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in scene coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Aabb {
    pub fn from_points(points: impl IntoIterator<Item = [f64; 3]>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;

        Some(iter.fold(
            Aabb {
                min: first,
                max: first,
            },
            |mut acc, p| {
                for k in 0..3 {
                    acc.min[k] = acc.min[k].min(p[k]);
                    acc.max[k] = acc.max[k].max(p[k]);
                }
                acc
            },
        ))
    }

    /// Zero-size box at the origin; the root volume of an empty scene.
    pub const fn zero() -> Self {
        Aabb {
            min: [0.0; 3],
            max: [0.0; 3],
        }
    }

    #[inline]
    pub fn center(&self) -> [f64; 3] {
        std::array::from_fn(|k| 0.5 * (self.min[k] + self.max[k]))
    }

    #[inline]
    pub fn half_extents(&self) -> [f64; 3] {
        std::array::from_fn(|k| 0.5 * (self.max[k] - self.min[k]))
    }

    pub fn diagonal(&self) -> f64 {
        let h = self.half_extents();
        2.0 * (h[0] * h[0] + h[1] * h[1] + h[2] * h[2]).sqrt()
    }

    pub fn merge(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: std::array::from_fn(|k| self.min[k].min(other.min[k])),
            max: std::array::from_fn(|k| self.max[k].max(other.max[k])),
        }
    }

    pub fn contains_point(&self, p: [f64; 3], eps: f64) -> bool {
        (0..3).all(|k| p[k] >= self.min[k] - eps && p[k] <= self.max[k] + eps)
    }

    /// 3D Tiles `box`: center followed by the three half-axis vectors.
    pub fn to_box_array(&self) -> [f64; 12] {
        let [cx, cy, cz] = self.center();
        let [hx, hy, hz] = self.half_extents();

        [cx, cy, cz, hx, 0.0, 0.0, 0.0, hy, 0.0, 0.0, 0.0, hz]
    }
}

/// Shape of the bounding volumes written to the manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeKind {
    #[default]
    Box,
    Sphere,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundingVolume {
    Box(Aabb),
    Sphere { center: [f64; 3], radius: f64 },
}

impl BoundingVolume {
    /// Sphere volumes circumscribe the box rather than being minimal.
    pub fn from_aabb(aabb: Aabb, kind: VolumeKind) -> Self {
        match kind {
            VolumeKind::Box => BoundingVolume::Box(aabb),
            VolumeKind::Sphere => BoundingVolume::Sphere {
                center: aabb.center(),
                radius: 0.5 * aabb.diagonal(),
            },
        }
    }

    pub fn kind(&self) -> VolumeKind {
        match self {
            BoundingVolume::Box(_) => VolumeKind::Box,
            BoundingVolume::Sphere { .. } => VolumeKind::Sphere,
        }
    }

    /// Tightest box around the volume.
    pub fn aabb(&self) -> Aabb {
        match *self {
            BoundingVolume::Box(b) => b,
            BoundingVolume::Sphere { center, radius } => Aabb {
                min: center.map(|c| c - radius),
                max: center.map(|c| c + radius),
            },
        }
    }

    pub fn contains_point(&self, p: [f64; 3], eps: f64) -> bool {
        match *self {
            BoundingVolume::Box(b) => b.contains_point(p, eps),
            BoundingVolume::Sphere { center, radius } => {
                let d2: f64 = (0..3).map(|k| (p[k] - center[k]).powi(2)).sum();
                d2.sqrt() <= radius + eps
            }
        }
    }

    /// Whether every corner of `aabb` lies inside the volume.
    pub fn contains_aabb(&self, aabb: &Aabb, eps: f64) -> bool {
        (0..8).all(|corner| {
            let p = std::array::from_fn(|k| {
                if corner & (1 << k) == 0 {
                    aabb.min[k]
                } else {
                    aabb.max[k]
                }
            });
            self.contains_point(p, eps)
        })
    }

    pub fn diagonal(&self) -> f64 {
        match *self {
            BoundingVolume::Box(b) => b.diagonal(),
            BoundingVolume::Sphere { radius, .. } => 2.0 * radius,
        }
    }

    /// Volume of `kind` enclosing all `volumes`, or `None` when there are none.
    pub fn union<'a>(
        volumes: impl IntoIterator<Item = &'a BoundingVolume>,
        kind: VolumeKind,
    ) -> Option<BoundingVolume> {
        let merged = volumes
            .into_iter()
            .map(BoundingVolume::aabb)
            .reduce(|a, b| a.merge(&b))?;

        Some(BoundingVolume::from_aabb(merged, kind))
    }

    /// Manifest field name and flat number array.
    pub fn to_manifest(&self) -> (&'static str, Vec<f64>) {
        match *self {
            BoundingVolume::Box(b) => ("box", b.to_box_array().to_vec()),
            BoundingVolume::Sphere { center, radius } => {
                ("sphere", vec![center[0], center[1], center[2], radius])
            }
        }
    }
}
