use crate::error::{PipelineError, Result};
use crate::geometry::{self, Point2};
use serde::{Deserialize, Serialize};

/// A building's ground plan and height, as handed over by the GIS loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintRecord {
    /// Outer ring; a repeated closing point is accepted.
    pub ring: Vec<Point2>,
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl FootprintRecord {
    pub fn new(ring: Vec<Point2>, height: f64) -> Self {
        Self {
            ring,
            height,
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A land-use parcel used as the target of a height recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotRecord {
    pub ring: Vec<Point2>,
    pub id: String,
}

impl PlotRecord {
    pub fn new(id: impl Into<String>, ring: Vec<Point2>) -> Self {
        Self {
            ring,
            id: id.into(),
        }
    }
}

/// Look up a plot by identifier.
pub fn find_plot<'a>(plots: &'a [PlotRecord], id: &str) -> Option<&'a PlotRecord> {
    plots.iter().find(|p| p.id == id)
}

/// Clean a loader ring into a simple counter-clockwise ring:
/// closing and consecutive duplicate points dropped, collinear vertices removed.
pub(crate) fn normalize_ring(ring: &[Point2]) -> Result<Vec<Point2>> {
    if ring.iter().any(|p| !p[0].is_finite() || !p[1].is_finite()) {
        return Err(PipelineError::degenerate("ring has a non-finite coordinate"));
    }

    let mut pts: Vec<Point2> = Vec::with_capacity(ring.len());
    for &p in ring {
        if pts.last() != Some(&p) {
            pts.push(p);
        }
    }
    while pts.len() > 1 && pts.first() == pts.last() {
        pts.pop();
    }

    if pts.len() < 3 {
        return Err(PipelineError::degenerate(format!(
            "ring has {} distinct points, need at least 3",
            pts.len()
        )));
    }

    loop {
        let n = pts.len();
        if n < 3 {
            break;
        }

        let collinear = (0..n)
            .find(|&i| geometry::is_collinear(pts[(i + n - 1) % n], pts[i], pts[(i + 1) % n]));

        match collinear {
            Some(i) => {
                pts.remove(i);
            }
            None => break,
        }
    }

    if pts.len() < 3 || geometry::is_zero_area(&pts) {
        return Err(PipelineError::degenerate("ring has zero planar area"));
    }

    if geometry::signed_area(&pts) < 0.0 {
        pts.reverse();
    }

    Ok(pts)
}
