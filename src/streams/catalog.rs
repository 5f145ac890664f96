//! Stream segment catalog: input parsing and buffered outlines.
//!
//! Streams are line segments living on the top of the aquifer. Each segment
//! carries a recharge/discharge rate and a half-width; the catalog converts
//! every segment into a 4-vertex buffered outline (a rectangle for
//! axis-aligned segments, an oblique quadrilateral otherwise) together with
//! its bounding box, and triangulates the outlines for the spatial index.
//!
//! Input format (plain text):
//! ```text
//! N_seg
//! Ax Ay Bx By rate halfWidth     (repeated N_seg times)
//! ```

use crate::error::GwError;
use crate::geometry::{Aabb, distance, line_line_intersection};
use crate::streams::index::IndexedTriangle;
use std::io::BufRead;
use std::path::Path;

/// One immutable stream segment and its derived geometry.
#[derive(Clone, Debug)]
pub struct StreamSegment {
    /// One endpoint (which end is "start" does not matter).
    pub a: [f64; 2],
    /// The other endpoint.
    pub b: [f64; 2],
    /// Recharge (positive) or discharge (negative) rate.
    pub rate: f64,
    /// Half of the physical stream width.
    pub half_width: f64,
    /// Segment length, `distance(a, b)`.
    pub length: f64,
    /// Buffered outline ring; 4 vertices normally, fewer when an offset
    /// line intersection degenerated. Downstream code tolerates short rings.
    pub outline: Vec<[f64; 2]>,
    /// Bounding box over the outline vertices.
    pub bbox: Aabb,
}

/// Parsed stream catalog: segments plus the triangle soup for the index.
#[derive(Clone, Debug, Default)]
pub struct StreamCatalog {
    segments: Vec<StreamSegment>,
    triangles: Vec<IndexedTriangle>,
}

impl StreamCatalog {
    /// Axis-alignment / degeneracy threshold on endpoint deltas, in the
    /// length unit of the input coordinates.
    pub const ALIGN_EPS: f64 = 0.1;

    /// Read a catalog from a stream input file.
    ///
    /// An unreadable file is a hard error and produces no partial catalog.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, GwError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|source| GwError::StreamLoad {
            path: path.display().to_string(),
            source,
        })?;
        Self::read_from(std::io::BufReader::new(file))
    }

    /// Read a catalog from any buffered reader (used directly by tests).
    pub fn read_from<R: BufRead>(reader: R) -> Result<Self, GwError> {
        let mut lines = reader.lines().enumerate();
        let n_seg = match lines.next() {
            Some((_, line)) => {
                let line = line?;
                line.trim()
                    .parse::<usize>()
                    .map_err(|_| GwError::StreamParse {
                        line: 1,
                        reason: format!("expected segment count, got `{}`", line.trim()),
                    })?
            }
            None => {
                return Err(GwError::StreamParse {
                    line: 1,
                    reason: "empty stream file".into(),
                });
            }
        };

        let mut catalog = StreamCatalog::default();
        for _ in 0..n_seg {
            let (idx, line) = lines.next().ok_or_else(|| GwError::StreamParse {
                line: n_seg + 1,
                reason: format!("expected {n_seg} records, input ended early"),
            })?;
            let line = line?;
            let fields: Vec<f64> = line
                .split_whitespace()
                .map(str::parse::<f64>)
                .collect::<Result<_, _>>()
                .map_err(|e| GwError::StreamParse {
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            if fields.len() != 6 {
                return Err(GwError::StreamParse {
                    line: idx + 1,
                    reason: format!("expected 6 fields, got {}", fields.len()),
                });
            }
            catalog.push_segment(
                [fields[0], fields[1]],
                [fields[2], fields[3]],
                fields[4],
                fields[5],
            );
        }
        log::info!("loaded {} stream segments", catalog.segments.len());
        Ok(catalog)
    }

    /// Append a segment, deriving outline, bounding box, and index triangles.
    pub fn push_segment(&mut self, a: [f64; 2], b: [f64; 2], rate: f64, half_width: f64) {
        let outline = buffered_outline(a, b, half_width);
        let bbox = Aabb::from_points(&outline);
        let id = self.segments.len() as u32;
        // Outline split along the diagonal; short rings yield fewer triangles.
        if outline.len() >= 3 {
            self.triangles.push(IndexedTriangle {
                vertices: [outline[0], outline[1], outline[2]],
                segment: id,
            });
        }
        if outline.len() == 4 {
            self.triangles.push(IndexedTriangle {
                vertices: [outline[0], outline[2], outline[3]],
                segment: id,
            });
        }
        self.segments.push(StreamSegment {
            a,
            b,
            rate,
            half_width,
            length: distance(a, b),
            outline,
            bbox,
        });
    }

    /// All segments, in input order (segment id = position).
    pub fn segments(&self) -> &[StreamSegment] {
        &self.segments
    }

    /// Triangulated outlines tagged with their owning segment id.
    pub fn triangles(&self) -> &[IndexedTriangle] {
        &self.triangles
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True when no segments were loaded.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Convert a line segment into its buffered quadrilateral outline.
///
/// Vertex order is fixed: offset-lower at A, offset-upper at A, offset-upper
/// at B, offset-lower at B, forming a simple ring. Oblique segments derive
/// the four vertices from line–line intersections of the two offset lines
/// with the perpendiculars through A and B; a parallel pair simply drops its
/// vertex, so the ring can come back with fewer than 4 points.
pub fn buffered_outline(a: [f64; 2], b: [f64; 2], half_width: f64) -> Vec<[f64; 2]> {
    let dx = (a[0] - b[0]).abs();
    let dy = (a[1] - b[1]).abs();
    let eps = StreamCatalog::ALIGN_EPS;
    if dx < eps && dy < eps {
        // Near-zero length: keep the segment (policy), emit best-effort
        // geometry — a half-width square around the midpoint.
        log::warn!(
            "stream segment ({:.3}, {:.3}) -> ({:.3}, {:.3}) has near-zero length",
            a[0],
            a[1],
            b[0],
            b[1]
        );
        let m = [0.5 * (a[0] + b[0]), 0.5 * (a[1] + b[1])];
        let w = half_width;
        return vec![
            [m[0] - w, m[1] - w],
            [m[0] - w, m[1] + w],
            [m[0] + w, m[1] + w],
            [m[0] + w, m[1] - w],
        ];
    }
    if dx < eps {
        // Vertical segment: offset along x.
        return vec![
            [a[0] - half_width, a[1]],
            [a[0] + half_width, a[1]],
            [b[0] + half_width, b[1]],
            [b[0] - half_width, b[1]],
        ];
    }
    if dy < eps {
        // Horizontal segment: offset along y.
        return vec![
            [a[0], a[1] - half_width],
            [a[0], a[1] + half_width],
            [b[0], b[1] + half_width],
            [b[0], b[1] - half_width],
        ];
    }
    // Oblique segment: slope/intercept of the segment line ...
    let m = (b[1] - a[1]) / (b[0] - a[0]);
    let intercept = a[1] - m * a[0];
    // ... the two parallel offset lines at distance half_width ...
    let shift = half_width * (m * m + 1.0).sqrt();
    let lower = intercept - shift;
    let upper = intercept + shift;
    // ... and the perpendiculars through A and B.
    let m_p = -1.0 / m;
    let through_a = a[1] - m_p * a[0];
    let through_b = b[1] - m_p * b[0];

    let mut outline = Vec::with_capacity(4);
    for (b1, m1, b2, m2) in [
        (through_a, m_p, lower, m),
        (through_a, m_p, upper, m),
        (through_b, m_p, upper, m),
        (through_b, m_p, lower, m),
    ] {
        match line_line_intersection(b1, m1, b2, m2) {
            Some(p) => outline.push(p),
            None => log::warn!("degenerate stream outline vertex dropped (parallel lines)"),
        }
    }
    outline
}
