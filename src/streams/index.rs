//! Static bounding-volume hierarchy over triangulated stream outlines.
//!
//! Built once after the catalog loads, read-only for the rest of the run,
//! safe to share across threads and solver iterations. Queries are
//! conservative: they return every segment whose outline triangles overlap
//! the query box, and the caller resolves exact intersections.

use crate::geometry::Aabb;

/// One outline triangle tagged with its owning stream segment.
#[derive(Copy, Clone, Debug)]
pub struct IndexedTriangle {
    /// Triangle corner coordinates in the footprint plane.
    pub vertices: [[f64; 2]; 3],
    /// Id of the segment this triangle was split from.
    pub segment: u32,
}

impl IndexedTriangle {
    fn aabb(&self) -> Aabb {
        Aabb::from_points(&self.vertices)
    }
}

#[derive(Clone, Debug)]
enum BvhNode {
    Leaf {
        aabb: Aabb,
        /// Range into the reordered triangle array.
        start: u32,
        end: u32,
    },
    Inner {
        aabb: Aabb,
        left: u32,
        right: u32,
    },
}

impl BvhNode {
    fn aabb(&self) -> &Aabb {
        match self {
            BvhNode::Leaf { aabb, .. } | BvhNode::Inner { aabb, .. } => aabb,
        }
    }
}

/// Build-once AABB tree over stream outline triangles.
#[derive(Clone, Debug, Default)]
pub struct StreamIndex {
    nodes: Vec<BvhNode>,
    triangles: Vec<IndexedTriangle>,
    root: Option<u32>,
}

const LEAF_SIZE: usize = 4;

impl StreamIndex {
    /// Build the hierarchy. One-shot; the index is immutable afterwards.
    pub fn build(triangles: &[IndexedTriangle]) -> Self {
        let mut index = StreamIndex {
            nodes: Vec::new(),
            triangles: triangles.to_vec(),
            root: None,
        };
        if index.triangles.is_empty() {
            return index;
        }
        let n = index.triangles.len();
        let root = index.build_node(0, n);
        index.root = Some(root);
        index
    }

    fn build_node(&mut self, start: usize, end: usize) -> u32 {
        let mut aabb = Aabb::empty();
        for tri in &self.triangles[start..end] {
            aabb.merge(&tri.aabb());
        }
        if end - start <= LEAF_SIZE {
            self.nodes.push(BvhNode::Leaf {
                aabb,
                start: start as u32,
                end: end as u32,
            });
            return (self.nodes.len() - 1) as u32;
        }
        // Median split along the longest box axis.
        let axis = aabb.longest_axis();
        self.triangles[start..end].sort_by(|t1, t2| {
            let c1 = t1.aabb().center()[axis];
            let c2 = t2.aabb().center()[axis];
            c1.partial_cmp(&c2).unwrap_or(std::cmp::Ordering::Equal)
        });
        let mid = start + (end - start) / 2;
        let left = self.build_node(start, mid);
        let right = self.build_node(mid, end);
        self.nodes.push(BvhNode::Inner { aabb, left, right });
        (self.nodes.len() - 1) as u32
    }

    /// Candidate segment ids whose outline triangles overlap `query`.
    ///
    /// Conservative superset, sorted and deduplicated.
    pub fn query_aabb(&self, query: &Aabb) -> Vec<u32> {
        let mut hits = Vec::new();
        if let Some(root) = self.root {
            let mut stack = vec![root];
            while let Some(node_idx) = stack.pop() {
                let node = &self.nodes[node_idx as usize];
                if !node.aabb().overlaps(query) {
                    continue;
                }
                match node {
                    BvhNode::Leaf { start, end, .. } => {
                        for tri in &self.triangles[*start as usize..*end as usize] {
                            if tri.aabb().overlaps(query) {
                                hits.push(tri.segment);
                            }
                        }
                    }
                    BvhNode::Inner { left, right, .. } => {
                        stack.push(*left);
                        stack.push(*right);
                    }
                }
            }
        }
        hits.sort_unstable();
        hits.dedup();
        hits
    }

    /// Number of indexed triangles.
    pub fn len(&self) -> usize {
        self.triangles.len()
    }

    /// True when nothing was indexed.
    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tri(x: f64, y: f64, segment: u32) -> IndexedTriangle {
        IndexedTriangle {
            vertices: [[x, y], [x + 1.0, y], [x, y + 1.0]],
            segment,
        }
    }

    #[test]
    fn empty_index_answers_nothing() {
        let index = StreamIndex::build(&[]);
        let q = Aabb {
            min: [-10.0, -10.0],
            max: [10.0, 10.0],
        };
        assert!(index.query_aabb(&q).is_empty());
    }

    #[test]
    fn query_returns_overlapping_segments_deduplicated() {
        let tris: Vec<_> = (0..20)
            .flat_map(|i| {
                let x = i as f64 * 3.0;
                // Two triangles per segment, like a split outline.
                [tri(x, 0.0, i), tri(x + 0.5, 0.2, i)]
            })
            .collect();
        let index = StreamIndex::build(&tris);
        let q = Aabb {
            min: [2.5, 0.0],
            max: [6.5, 0.5],
        };
        // Segments 1 (x=3) and 2 (x=6) overlap; segment 0 (x in [0,1.5]) does not.
        assert_eq!(index.query_aabb(&q), vec![1, 2]);
    }

    #[test]
    fn disjoint_query_is_empty() {
        let tris = vec![tri(0.0, 0.0, 0), tri(5.0, 5.0, 1)];
        let index = StreamIndex::build(&tris);
        let q = Aabb {
            min: [100.0, 100.0],
            max: [101.0, 101.0],
        };
        assert!(index.query_aabb(&q).is_empty());
    }
}
