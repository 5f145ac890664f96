//! Per-cell stream recharge: candidate lookup plus exact polygon clipping.
//!
//! The engine owns the catalog and its spatial index. Given a boundary cell
//! footprint it finds candidate segments through the BVH, clips the
//! footprint against each candidate's buffered outline, and emits one
//! `(centroid, area x rate)` contribution per non-empty intersection. A
//! failed clip for one candidate is skipped and logged; it never aborts the
//! rest of the cell.

use crate::geometry::{Aabb, clip_convex, point_in_polygon, polygon_area, polygon_centroid};
use crate::mesh::Dim;
use crate::streams::catalog::{StreamCatalog, StreamSegment};
use crate::streams::index::StreamIndex;

/// One rate-weighted source term from a footprint/outline intersection.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RechargeContribution {
    /// Area centroid of the intersection polygon.
    pub centroid: [f64; 2],
    /// Intersection area times the segment rate.
    pub weighted_rate: f64,
}

/// Outcome of clipping one candidate outline against a cell footprint.
#[derive(Clone, Debug, PartialEq)]
pub enum ClipOutcome {
    /// Proper intersection with positive area.
    Intersection {
        /// Intersection area.
        area: f64,
        /// Intersection centroid.
        centroid: [f64; 2],
    },
    /// Clean miss; not an error.
    Empty,
    /// Candidate could not be processed and was dropped.
    Skipped(&'static str),
}

/// Read-only recharge engine shared by all assembly passes.
#[derive(Clone, Debug)]
pub struct StreamRechargeEngine {
    catalog: StreamCatalog,
    index: StreamIndex,
    active: bool,
}

impl StreamRechargeEngine {
    /// Build the engine for a run of dimensionality `dim`.
    ///
    /// Streams exist on the planar top surface of a 3-D aquifer. For any
    /// other dimensionality the engine stays constructible but contributes
    /// nothing, matching the "warn, don't throw" policy.
    pub fn new(catalog: StreamCatalog, dim: Dim) -> Self {
        let active = dim == Dim::Three;
        if !active {
            log::warn!("stream recharge only supports 3-D runs; engine will contribute nothing");
        }
        let index = StreamIndex::build(catalog.triangles());
        Self {
            catalog,
            index,
            active,
        }
    }

    /// Underlying catalog.
    pub fn catalog(&self) -> &StreamCatalog {
        &self.catalog
    }

    /// Whether the engine contributes anything (3-D runs only).
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Rate-weighted contributions of all streams intersecting `footprint`.
    ///
    /// The footprint is the top-face polygon of a boundary cell projected
    /// onto the horizontal plane.
    pub fn recharge(&self, footprint: &[[f64; 2]]) -> Vec<RechargeContribution> {
        let mut contributions = Vec::new();
        if !self.active || footprint.len() < 3 {
            return contributions;
        }
        let query = Aabb::from_points(footprint);
        for segment_id in self.index.query_aabb(&query) {
            let segment = &self.catalog.segments()[segment_id as usize];
            match clip_candidate(footprint, segment) {
                ClipOutcome::Intersection { area, centroid } => {
                    contributions.push(RechargeContribution {
                        centroid,
                        weighted_rate: area * segment.rate,
                    });
                }
                ClipOutcome::Empty => {}
                ClipOutcome::Skipped(reason) => {
                    log::warn!("stream segment {segment_id} skipped for this cell: {reason}");
                }
            }
        }
        contributions
    }

    /// Flag active cells whose top face crosses any stream outline.
    ///
    /// Used to pre-refine the mesh around streams before the first solve.
    /// Returns the number of cells flagged. Inert engines flag nothing.
    pub fn flag_cells_for_refinement(
        &self,
        mesh: &mut crate::mesh::Mesh,
        top: &crate::mesh::TopBoundary,
    ) -> usize {
        if !self.active {
            return 0;
        }
        let active: Vec<crate::mesh::CellId> = mesh.active_cells().collect();
        let mut flagged = 0;
        for c in active {
            let crossed = (0..mesh.dim().faces_per_cell()).any(|face| {
                mesh.boundary_tag(c, face)
                    .is_some_and(|t| top.contains(t))
                    && !self.recharge(&mesh.face_footprint(c, face)).is_empty()
            });
            if crossed {
                mesh.flag_for_refinement(c);
                flagged += 1;
            }
        }
        flagged
    }

    /// Stream rate at a single point.
    ///
    /// Linear scan over segments with a bounding-box prefilter; the first
    /// outline containing the point wins. Correct as long as no two stream
    /// outlines overlap at the query point (not otherwise enforced).
    pub fn rate_at(&self, p: [f64; 2]) -> f64 {
        if !self.active {
            return 0.0;
        }
        for segment in self.catalog.segments() {
            if segment.bbox.contains(p) && point_in_polygon(p, &segment.outline) {
                return segment.rate;
            }
        }
        0.0
    }
}

/// Clip one candidate outline against the footprint.
fn clip_candidate(footprint: &[[f64; 2]], segment: &StreamSegment) -> ClipOutcome {
    if segment.outline.len() < 3 {
        return ClipOutcome::Skipped("outline has fewer than 3 vertices");
    }
    let intersection = clip_convex(footprint, &segment.outline);
    if intersection.len() < 3 {
        return ClipOutcome::Empty;
    }
    let area = polygon_area(&intersection);
    match polygon_centroid(&intersection) {
        Some(centroid) if area > 0.0 => ClipOutcome::Intersection { area, centroid },
        _ => ClipOutcome::Empty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(segments: &[([f64; 2], [f64; 2], f64, f64)], dim: Dim) -> StreamRechargeEngine {
        let mut catalog = StreamCatalog::default();
        for (a, b, rate, hw) in segments {
            catalog.push_segment(*a, *b, *rate, *hw);
        }
        StreamRechargeEngine::new(catalog, dim)
    }

    #[test]
    fn footprint_inside_single_stream_gets_full_area() {
        let engine = engine_with(&[([0.0, 0.0], [10.0, 0.0], 5.0, 1.0)], Dim::Three);
        let cell = [[2.0, -0.5], [3.0, -0.5], [3.0, 0.5], [2.0, 0.5]];
        let out = engine.recharge(&cell);
        assert_eq!(out.len(), 1);
        assert!((out[0].weighted_rate - 5.0).abs() < 1e-9);
        assert!((out[0].centroid[0] - 2.5).abs() < 1e-9);
        assert!(out[0].centroid[1].abs() < 1e-9);
    }

    #[test]
    fn footprint_outside_all_bboxes_is_empty() {
        let engine = engine_with(&[([0.0, 0.0], [10.0, 0.0], 5.0, 1.0)], Dim::Three);
        let cell = [[50.0, 50.0], [51.0, 50.0], [51.0, 51.0], [50.0, 51.0]];
        assert!(engine.recharge(&cell).is_empty());
    }

    #[test]
    fn partial_overlap_weights_by_clipped_area() {
        let engine = engine_with(&[([0.0, 0.0], [10.0, 0.0], 2.0, 1.0)], Dim::Three);
        // Cell straddles the outline's upper edge: only y in [0, 1] overlaps.
        let cell = [[4.0, 0.0], [5.0, 0.0], [5.0, 2.0], [4.0, 2.0]];
        let out = engine.recharge(&cell);
        assert_eq!(out.len(), 1);
        assert!((out[0].weighted_rate - 2.0).abs() < 1e-9);
        assert!((out[0].centroid[1] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn rate_at_is_idempotent_and_zero_outside() {
        let engine = engine_with(&[([0.0, 0.0], [10.0, 0.0], 5.0, 1.0)], Dim::Three);
        let inside = [5.0, 0.25];
        assert_eq!(engine.rate_at(inside), 5.0);
        assert_eq!(engine.rate_at(inside), 5.0);
        assert_eq!(engine.rate_at([5.0, 3.0]), 0.0);
    }

    #[test]
    fn two_dimensional_engine_is_inert() {
        let engine = engine_with(&[([0.0, 0.0], [10.0, 0.0], 5.0, 1.0)], Dim::Two);
        assert!(!engine.is_active());
        let cell = [[2.0, -0.5], [3.0, -0.5], [3.0, 0.5], [2.0, 0.5]];
        assert!(engine.recharge(&cell).is_empty());
        assert_eq!(engine.rate_at([5.0, 0.0]), 0.0);
    }

    #[test]
    fn flags_exactly_the_stream_crossed_top_cells() {
        use crate::mesh::{Mesh, RefineFlag, TopBoundary};

        let engine = engine_with(&[([0.0, 0.0], [10.0, 0.0], 5.0, 1.0)], Dim::Three);
        let mut mesh = Mesh::rectangle(
            Dim::Three,
            [4, 4, 1],
            [0.0, -2.0, 0.0],
            [10.0, 2.0, 1.0],
        )
        .unwrap();
        let top = TopBoundary::box_mesh_default(Dim::Three);
        let flagged = engine.flag_cells_for_refinement(&mut mesh, &top);
        // The outline spans y in [-1, 1]: the two middle cell rows.
        assert_eq!(flagged, 8);
        for c in mesh.active_cells().collect::<Vec<_>>() {
            let y = mesh.cell_center(c)[1];
            let expected = y.abs() < 1.0;
            assert_eq!(mesh.cell(c).flag == RefineFlag::Refine, expected);
        }
    }

    #[test]
    fn overlapping_streams_each_contribute() {
        let engine = engine_with(
            &[
                ([0.0, 0.0], [10.0, 0.0], 5.0, 1.0),
                ([0.0, 0.5], [10.0, 0.5], 1.0, 1.0),
            ],
            Dim::Three,
        );
        let cell = [[2.0, -0.25], [3.0, -0.25], [3.0, 0.25], [2.0, 0.25]];
        let out = engine.recharge(&cell);
        assert_eq!(out.len(), 2);
        let total: f64 = out.iter().map(|c| c.weighted_rate).sum();
        // Both outlines fully cover the cell: 0.5 * 5 + 0.5 * 1.
        assert!((total - 3.0).abs() < 1e-9);
    }
}
