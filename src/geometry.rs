//! Planar geometry kernels for the stream subsystem.
//!
//! All routines are pure value-in/value-out functions over plain coordinate
//! arrays. There is no reusable scratch state anywhere: a polygon is a
//! `&[[f64; 2]]` ring and results are freshly allocated. Rings may be given
//! in either winding; routines normalize orientation where it matters.

use itertools::Itertools;

/// Tolerance for degenerate predicates (parallel lines, zero areas).
pub const EPS: f64 = 1e-12;

/// Axis-aligned bounding box in the footprint plane.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb {
    /// Lower corner.
    pub min: [f64; 2],
    /// Upper corner.
    pub max: [f64; 2],
}

impl Aabb {
    /// Empty box that grows under [`Aabb::extend`].
    pub fn empty() -> Self {
        Self {
            min: [f64::INFINITY; 2],
            max: [f64::NEG_INFINITY; 2],
        }
    }

    /// Bounding box of a point set. Empty input yields [`Aabb::empty`].
    pub fn from_points(points: &[[f64; 2]]) -> Self {
        let mut b = Self::empty();
        for p in points {
            b.extend(*p);
        }
        b
    }

    /// Grow to contain `p`.
    pub fn extend(&mut self, p: [f64; 2]) {
        for axis in 0..2 {
            self.min[axis] = self.min[axis].min(p[axis]);
            self.max[axis] = self.max[axis].max(p[axis]);
        }
    }

    /// Grow to contain `other`.
    pub fn merge(&mut self, other: &Aabb) {
        self.extend(other.min);
        self.extend(other.max);
    }

    /// Closed-interval overlap test.
    pub fn overlaps(&self, other: &Aabb) -> bool {
        (0..2).all(|a| self.min[a] <= other.max[a] && self.max[a] >= other.min[a])
    }

    /// Closed-interval containment test.
    pub fn contains(&self, p: [f64; 2]) -> bool {
        (0..2).all(|a| p[a] >= self.min[a] && p[a] <= self.max[a])
    }

    /// Box center.
    pub fn center(&self) -> [f64; 2] {
        [
            0.5 * (self.min[0] + self.max[0]),
            0.5 * (self.min[1] + self.max[1]),
        ]
    }

    /// Index of the longest axis (0 = x, 1 = y).
    pub fn longest_axis(&self) -> usize {
        if self.max[0] - self.min[0] >= self.max[1] - self.min[1] {
            0
        } else {
            1
        }
    }
}

/// Intersection of two lines given in slope/intercept form `y = m x + b`.
///
/// Returns `None` when the lines are parallel within [`EPS`]. The
/// slope/intercept form matches how stream outlines are derived from a
/// segment's offset and perpendicular lines; vertical lines never reach
/// this routine because axis-aligned segments take the rectangular path.
pub fn line_line_intersection(b1: f64, m1: f64, b2: f64, m2: f64) -> Option<[f64; 2]> {
    let denom = m1 - m2;
    if denom.abs() < EPS {
        return None;
    }
    let x = (b2 - b1) / denom;
    let y = m1 * x + b1;
    Some([x, y])
}

/// Signed polygon area (positive for counter-clockwise rings).
pub fn polygon_signed_area(ring: &[[f64; 2]]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let twice: f64 = ring
        .iter()
        .circular_tuple_windows()
        .map(|(p, q)| p[0] * q[1] - q[0] * p[1])
        .sum();
    0.5 * twice
}

/// Unsigned polygon area.
pub fn polygon_area(ring: &[[f64; 2]]) -> f64 {
    polygon_signed_area(ring).abs()
}

/// Area centroid of a simple polygon.
///
/// Returns `None` for rings with fewer than 3 vertices or with area below
/// [`EPS`]; callers treat that as a degenerate intersection and skip it.
pub fn polygon_centroid(ring: &[[f64; 2]]) -> Option<[f64; 2]> {
    if ring.len() < 3 {
        return None;
    }
    let a = polygon_signed_area(ring);
    if a.abs() < EPS {
        return None;
    }
    let mut cx = 0.0;
    let mut cy = 0.0;
    for (p, q) in ring.iter().circular_tuple_windows() {
        let cross = p[0] * q[1] - q[0] * p[1];
        cx += (p[0] + q[0]) * cross;
        cy += (p[1] + q[1]) * cross;
    }
    Some([cx / (6.0 * a), cy / (6.0 * a)])
}

/// Even-odd ray-cast point-in-polygon test (boundary points count as inside).
pub fn point_in_polygon(p: [f64; 2], ring: &[[f64; 2]]) -> bool {
    if ring.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let a = ring[i];
        let b = ring[j];
        // On-edge points are accepted.
        if point_on_segment(p, a, b) {
            return true;
        }
        if (a[1] > p[1]) != (b[1] > p[1]) {
            let x_cross = (b[0] - a[0]) * (p[1] - a[1]) / (b[1] - a[1]) + a[0];
            if p[0] < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn point_on_segment(p: [f64; 2], a: [f64; 2], b: [f64; 2]) -> bool {
    let cross = (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0]);
    if cross.abs() > 1e-9 {
        return false;
    }
    let dot = (p[0] - a[0]) * (b[0] - a[0]) + (p[1] - a[1]) * (b[1] - a[1]);
    let len2 = (b[0] - a[0]).powi(2) + (b[1] - a[1]).powi(2);
    dot >= -EPS && dot <= len2 + EPS
}

/// Clip `subject` against a convex `clip` ring (Sutherland–Hodgman).
///
/// Winding of either input does not matter; the clip ring is normalized to
/// counter-clockwise first. The result ring may be empty (no overlap) and
/// may be degenerate (collinear touch); callers decide via area/centroid.
pub fn clip_convex(subject: &[[f64; 2]], clip: &[[f64; 2]]) -> Vec<[f64; 2]> {
    if subject.len() < 3 || clip.len() < 3 {
        return Vec::new();
    }
    let mut clip_ccw: Vec<[f64; 2]> = clip.to_vec();
    if polygon_signed_area(&clip_ccw) < 0.0 {
        clip_ccw.reverse();
    }
    let mut output: Vec<[f64; 2]> = subject.to_vec();
    if polygon_signed_area(&output) < 0.0 {
        output.reverse();
    }
    for i in 0..clip_ccw.len() {
        if output.is_empty() {
            break;
        }
        let a = clip_ccw[i];
        let b = clip_ccw[(i + 1) % clip_ccw.len()];
        let input = std::mem::take(&mut output);
        for j in 0..input.len() {
            let p = input[j];
            let q = input[(j + 1) % input.len()];
            let p_in = half_plane(a, b, p) >= -EPS;
            let q_in = half_plane(a, b, q) >= -EPS;
            if p_in {
                output.push(p);
                if !q_in {
                    if let Some(x) = edge_intersection(a, b, p, q) {
                        output.push(x);
                    }
                }
            } else if q_in {
                if let Some(x) = edge_intersection(a, b, p, q) {
                    output.push(x);
                }
            }
        }
    }
    output
}

/// Signed distance proxy of `p` to the directed line `a -> b` (positive = left).
fn half_plane(a: [f64; 2], b: [f64; 2], p: [f64; 2]) -> f64 {
    (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0])
}

/// Intersection of segment `p -> q` with the infinite line through `a -> b`.
fn edge_intersection(a: [f64; 2], b: [f64; 2], p: [f64; 2], q: [f64; 2]) -> Option<[f64; 2]> {
    let d1 = half_plane(a, b, p);
    let d2 = half_plane(a, b, q);
    let denom = d1 - d2;
    if denom.abs() < EPS {
        return None;
    }
    let t = d1 / denom;
    Some([p[0] + t * (q[0] - p[0]), p[1] + t * (q[1] - p[1])])
}

/// Euclidean distance between two planar points.
pub fn distance(a: [f64; 2], b: [f64; 2]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_square_area_and_centroid() {
        let ring = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        assert!((polygon_area(&ring) - 1.0).abs() < 1e-14);
        let c = polygon_centroid(&ring).unwrap();
        assert!((c[0] - 0.5).abs() < 1e-14 && (c[1] - 0.5).abs() < 1e-14);
    }

    #[test]
    fn winding_does_not_change_clip_result() {
        let subject = [[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 2.0]];
        let clip_cw = [[1.0, 3.0], [3.0, 3.0], [3.0, 1.0], [1.0, 1.0]];
        let out = clip_convex(&subject, &clip_cw);
        assert!((polygon_area(&out) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn disjoint_clip_is_empty() {
        let subject = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        let clip = [[5.0, 5.0], [6.0, 5.0], [6.0, 6.0], [5.0, 6.0]];
        let out = clip_convex(&subject, &clip);
        assert!(polygon_area(&out) < 1e-12);
    }

    #[test]
    fn parallel_lines_have_no_intersection() {
        assert!(line_line_intersection(0.0, 1.0, 2.0, 1.0).is_none());
        let p = line_line_intersection(0.0, 1.0, 4.0, -1.0).unwrap();
        assert!((p[0] - 2.0).abs() < 1e-12 && (p[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn point_on_edge_counts_as_inside() {
        let ring = [[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 2.0]];
        assert!(point_in_polygon([1.0, 0.0], &ring));
        assert!(point_in_polygon([1.0, 1.0], &ring));
        assert!(!point_in_polygon([3.0, 1.0], &ring));
    }

    #[test]
    fn degenerate_rings_are_rejected() {
        assert!(polygon_centroid(&[[0.0, 0.0], [1.0, 0.0]]).is_none());
        assert!(clip_convex(&[[0.0, 0.0], [1.0, 0.0]], &[[0.0; 2], [1.0, 0.0], [0.0, 1.0]]).is_empty());
    }
}
