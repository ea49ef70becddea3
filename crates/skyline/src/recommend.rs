//! Height recommendation for a plot from the buildings around it.

use crate::error::{PipelineError, Result};
use crate::footprint::{normalize_ring, FootprintRecord, PlotRecord};
use crate::geometry::{self, Point2};
use log::{debug, warn};
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

/// Buildings whose footprint lies within this distance of the plot count as neighbours.
pub const DEFAULT_PROXIMITY: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeightRecommendation {
    /// Mean height of the neighbouring buildings.
    pub value: f64,
    pub plot_id: String,
    /// Plot centroid at ground level.
    pub position: [f64; 3],
    pub neighbor_count: usize,
}

struct Candidate<'a> {
    index: usize,
    ring: Vec<Point2>,
    height: f64,
    id: Option<&'a str>,
    env: AABB<Point2>,
}

impl RTreeObject for Candidate<'_> {
    type Envelope = AABB<Point2>;

    #[inline]
    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

fn envelope(ring: &[Point2], pad: f64) -> Option<AABB<Point2>> {
    let (min, max) = geometry::bounds(ring)?;
    Some(AABB::from_corners(
        [min[0] - pad, min[1] - pad],
        [max[0] + pad, max[1] + pad],
    ))
}

/// Mean height of the buildings within `proximity` of `plot`.
///
/// `Ok(None)` when no building qualifies. Buildings with unusable heights or
/// rings are skipped; an unusable plot ring is an error.
pub fn recommend(
    buildings: &[FootprintRecord],
    plot: &PlotRecord,
    proximity: f64,
) -> Result<Option<HeightRecommendation>> {
    if !(proximity >= 0.0 && proximity.is_finite()) {
        return Err(PipelineError::InvalidConfig(format!(
            "proximity must be a non-negative number, got {proximity}"
        )));
    }

    let plot_ring = normalize_ring(&plot.ring).map_err(|e| match e {
        PipelineError::DegenerateGeometry(msg) => {
            PipelineError::degenerate(format!("plot {}: {msg}", plot.id))
        }
        other => other,
    })?;
    let [cx, cy] = geometry::centroid(&plot_ring)
        .ok_or_else(|| PipelineError::degenerate(format!("plot {} has no centroid", plot.id)))?;

    let candidates: Vec<Candidate<'_>> = buildings
        .iter()
        .enumerate()
        .filter_map(|(index, b)| {
            if !(b.height > 0.0 && b.height.is_finite()) {
                warn!("Building {index}: height {} skipped.", b.height);
                return None;
            }

            let ring = match normalize_ring(&b.ring) {
                Ok(ring) => ring,
                Err(e) => {
                    warn!("Building {index}: {e}; skipped.");
                    return None;
                }
            };

            let env = envelope(&ring, proximity)?;
            Some(Candidate {
                index,
                ring,
                height: b.height,
                id: b.id.as_deref(),
                env,
            })
        })
        .collect();

    let tree = RTree::bulk_load(candidates);
    let Some(plot_env) = envelope(&plot_ring, 0.0) else {
        return Ok(None);
    };

    let mut neighbours: Vec<&Candidate<'_>> = tree
        .locate_in_envelope_intersecting(&plot_env)
        .filter(|c| geometry::polygon_distance(&c.ring, &plot_ring) <= proximity)
        .collect();

    // R-tree iteration order is unspecified; sum in input order.
    neighbours.sort_unstable_by_key(|c| c.index);

    if neighbours.is_empty() {
        debug!("Plot {}: no buildings within {proximity}.", plot.id);
        return Ok(None);
    }

    for c in &neighbours {
        debug!(
            "Plot {}: neighbour {} ({}) at height {}.",
            plot.id,
            c.index,
            c.id.unwrap_or("-"),
            c.height
        );
    }

    let value = if let [only] = neighbours[..] {
        only.height
    } else {
        neighbours.iter().map(|c| c.height).sum::<f64>() / neighbours.len() as f64
    };

    Ok(Some(HeightRecommendation {
        value,
        plot_id: plot.id.clone(),
        position: [cx, cy, 0.0],
        neighbor_count: neighbours.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: f64, y: f64, size: f64) -> Vec<Point2> {
        vec![[x, y], [x + size, y], [x + size, y + size], [x, y + size]]
    }

    fn plot() -> PlotRecord {
        PlotRecord::new("P1", square(0.0, 0.0, 100.0))
    }

    #[test]
    fn mean_of_touching_buildings() {
        let buildings = vec![
            FootprintRecord::new(square(10.0, 10.0, 10.0), 10.0),
            FootprintRecord::new(square(100.0, 40.0, 10.0), 20.0),
            FootprintRecord::new(square(-5.0, -5.0, 10.0), 30.0),
        ];

        let rec = recommend(&buildings, &plot(), 0.0).unwrap().unwrap();
        assert_eq!(rec.value, 20.0);
        assert_eq!(rec.neighbor_count, 3);
        assert_eq!(rec.plot_id, "P1");
        assert_eq!(rec.position, [50.0, 50.0, 0.0]);
    }

    #[test]
    fn nothing_nearby_is_none() {
        let buildings = vec![FootprintRecord::new(square(500.0, 500.0, 10.0), 12.0)];
        assert_eq!(recommend(&buildings, &plot(), DEFAULT_PROXIMITY).unwrap(), None);
        assert_eq!(recommend(&[], &plot(), DEFAULT_PROXIMITY).unwrap(), None);
    }

    #[test]
    fn single_neighbour_returns_its_height() {
        let buildings = vec![FootprintRecord::new(square(40.0, 40.0, 5.0), 15.0)];
        let rec = recommend(&buildings, &plot(), DEFAULT_PROXIMITY).unwrap().unwrap();

        assert_eq!(rec.value, 15.0);
        assert_eq!(rec.neighbor_count, 1);
    }

    #[test]
    fn proximity_bounds_the_neighbourhood() {
        // 30 units east of the plot edge.
        let buildings = vec![
            FootprintRecord::new(square(130.0, 50.0, 10.0), 8.0),
            FootprintRecord::new(square(20.0, 20.0, 10.0), 4.0),
        ];

        let near = recommend(&buildings, &plot(), 29.0).unwrap().unwrap();
        assert_eq!((near.value, near.neighbor_count), (4.0, 1));

        let wide = recommend(&buildings, &plot(), 30.0).unwrap().unwrap();
        assert_eq!((wide.value, wide.neighbor_count), (6.0, 2));
    }

    #[test]
    fn unusable_buildings_are_skipped() {
        let buildings = vec![
            FootprintRecord::new(square(10.0, 10.0, 10.0), -3.0),
            FootprintRecord::new(vec![[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]], 50.0),
            FootprintRecord::new(square(30.0, 30.0, 10.0), 9.0),
        ];

        let rec = recommend(&buildings, &plot(), 0.0).unwrap().unwrap();
        assert_eq!((rec.value, rec.neighbor_count), (9.0, 1));
    }

    #[test]
    fn degenerate_plot_is_an_error() {
        let flat = PlotRecord::new("flat", vec![[0.0, 0.0], [5.0, 0.0], [10.0, 0.0]]);
        let err = recommend(&[], &flat, 0.0).unwrap_err();
        assert!(matches!(err, PipelineError::DegenerateGeometry(_)));
    }

    #[test]
    fn negative_proximity_is_rejected() {
        let err = recommend(&[], &plot(), -1.0).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }
}
