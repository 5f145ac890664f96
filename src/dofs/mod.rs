//! Degree-of-freedom numbering, ownership, constraints and sparsity.
//!
//! One scalar DOF per active mesh vertex, numbered in vertex order. Because
//! the mesh topology is replicated, every rank derives the same global
//! numbering and can compute the full ownership map and consumer lists
//! locally, without a numbering exchange.

pub mod constraints;

pub use constraints::{ConstraintLine, Constraints};

use std::collections::BTreeSet;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::error::GwError;
use crate::linalg::{DofPartition, SparsityPattern};
use crate::mesh::{BoundaryTag, Mesh, VertexId};

/// Boundary value function, evaluated at vertex coordinates.
pub type BoundaryValueFn = Box<dyn Fn(&[f64; 3]) -> f64 + Send + Sync>;

/// Dirichlet data: boundary tag -> prescribed-value function.
#[derive(Default)]
pub struct DirichletSpec {
    values: HashMap<BoundaryTag, BoundaryValueFn>,
}

impl DirichletSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prescribe a spatially varying value on `tag`.
    pub fn with_fn<F>(mut self, tag: BoundaryTag, f: F) -> Self
    where
        F: Fn(&[f64; 3]) -> f64 + Send + Sync + 'static,
    {
        self.values.insert(tag, Box::new(f));
        self
    }

    /// Prescribe a constant value on `tag`.
    pub fn with_constant(self, tag: BoundaryTag, value: f64) -> Self {
        self.with_fn(tag, move |_| value)
    }

    /// The value function attached to `tag`, if any.
    pub fn get(&self, tag: BoundaryTag) -> Option<&BoundaryValueFn> {
        self.values.get(&tag)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Everything the assembler and solver need about the DOF layout.
pub struct DofSetup {
    /// Ownership partition, shared with the algebra containers.
    pub partition: Arc<DofPartition>,
    /// Vertex id of every global DOF.
    pub vertex_of_dof: Vec<VertexId>,
    /// Inverse map.
    pub dof_of_vertex: HashMap<VertexId, usize>,
    /// Closed hanging-node + Dirichlet constraints.
    pub constraints: Constraints,
    /// Pattern over the locally-owned rows, constraint coupling included.
    pub pattern: SparsityPattern,
}

impl DofSetup {
    /// Global DOF count.
    pub fn n_dofs(&self) -> usize {
        self.partition.global_size
    }

    /// DOF attached to `vertex`, if the vertex carries one.
    pub fn dof_of(&self, vertex: VertexId) -> Option<usize> {
        self.dof_of_vertex.get(&vertex).copied()
    }
}

/// Builds [`DofSetup`] instances from a mesh.
pub struct DofField;

impl DofField {
    /// Number DOFs on the active mesh, derive ownership for `rank`, close
    /// the constraint set and build the sparsity pattern.
    pub fn setup(mesh: &Mesh, dirichlet: &DirichletSpec, rank: usize) -> Result<DofSetup, GwError> {
        let incidence = mesh.active_vertex_cells();

        // Vertex-order numbering over the active vertices.
        let mut vertex_of_dof: Vec<VertexId> = incidence.keys().copied().collect();
        vertex_of_dof.sort_unstable();
        let dof_of_vertex: HashMap<VertexId, usize> = vertex_of_dof
            .iter()
            .enumerate()
            .map(|(d, &v)| (v, d))
            .collect();
        let n_dofs = vertex_of_dof.len();

        // A shared DOF belongs to the lowest rank among its cells.
        let owner: Vec<usize> = vertex_of_dof
            .iter()
            .map(|v| {
                incidence[v]
                    .iter()
                    .map(|&c| mesh.cell(c).owner)
                    .min()
                    .unwrap_or(0)
            })
            .collect();

        let mut constraints = Constraints::new();
        for (v, parents) in mesh.hanging_vertices() {
            let dof = dof_of_vertex[&v];
            let weight = 1.0 / parents.len() as f64;
            let entries = parents
                .iter()
                .map(|p| (dof_of_vertex[p], weight))
                .collect();
            constraints.add_line(dof, entries, 0.0);
        }
        // Dirichlet values win over hanging-node lines on the boundary.
        for c in mesh.active_cells() {
            for face in 0..mesh.dim().faces_per_cell() {
                let Some(tag) = mesh.boundary_tag(c, face) else {
                    continue;
                };
                let Some(value_fn) = dirichlet.get(tag) else {
                    continue;
                };
                for v in mesh.face_vertices(c, face) {
                    let dof = dof_of_vertex[&v];
                    constraints.add_dirichlet(dof, value_fn(&mesh.vertex(v)));
                }
            }
        }
        constraints.close()?;

        let relevant = relevant_dofs(mesh, &dof_of_vertex, &constraints, rank);
        let owned: Vec<usize> = (0..n_dofs).filter(|&d| owner[d] == rank).collect();

        // Replicated topology: consumer lists come from recomputing each
        // peer's relevant set rather than from a reverse exchange.
        let mut consumers: HashMap<usize, Vec<usize>> = HashMap::new();
        for peer in 0..mesh.n_ranks() {
            if peer == rank {
                continue;
            }
            for dof in relevant_dofs(mesh, &dof_of_vertex, &constraints, peer) {
                if owner[dof] == rank {
                    consumers.entry(dof).or_default().push(peer);
                }
            }
        }

        let partition = Arc::new(DofPartition {
            rank,
            global_size: n_dofs,
            owner,
            owned,
            relevant,
            consumers,
        });

        let pattern = build_pattern(mesh, &dof_of_vertex, &constraints, &partition);

        Ok(DofSetup {
            partition,
            vertex_of_dof,
            dof_of_vertex,
            constraints,
            pattern,
        })
    }
}

/// DOFs of the rank's relevant cells, widened by constraint targets so that
/// back-substitution and ghost reads never miss a free DOF.
fn relevant_dofs(
    mesh: &Mesh,
    dof_of_vertex: &HashMap<VertexId, usize>,
    constraints: &Constraints,
    rank: usize,
) -> Vec<usize> {
    let mut set: BTreeSet<usize> = BTreeSet::new();
    for c in mesh.relevant_cells(rank) {
        for &v in &mesh.cell(c).vertices {
            set.insert(dof_of_vertex[&v]);
        }
    }
    let mut frontier: Vec<usize> = set.iter().copied().collect();
    while let Some(dof) = frontier.pop() {
        if let Some(line) = constraints.line(dof) {
            for &(target, _) in &line.entries {
                if set.insert(target) {
                    frontier.push(target);
                }
            }
        }
    }
    set.into_iter().collect()
}

/// Cell-stencil sparsity with constrained DOFs expanded onto their targets.
fn build_pattern(
    mesh: &Mesh,
    dof_of_vertex: &HashMap<VertexId, usize>,
    constraints: &Constraints,
    partition: &DofPartition,
) -> SparsityPattern {
    let expand = |dof: usize| -> Vec<usize> {
        match constraints.line(dof) {
            Some(line) => line.entries.iter().map(|&(t, _)| t).collect(),
            None => vec![dof],
        }
    };
    let row_index: HashMap<usize, usize> = partition
        .owned
        .iter()
        .enumerate()
        .map(|(i, &g)| (g, i))
        .collect();
    let mut rows: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); partition.owned.len()];
    // Every active cell can scatter into rows owned here, including cells
    // assembled on other ranks whose contributions arrive at compress.
    for c in mesh.active_cells() {
        let dofs: Vec<usize> = mesh.cell(c).vertices.iter().map(|v| dof_of_vertex[v]).collect();
        for &di in &dofs {
            // Placeholder diagonal for eliminated rows.
            if let Some(&r) = row_index.get(&di) {
                rows[r].insert(di);
            }
            for ti in expand(di) {
                let Some(&r) = row_index.get(&ti) else {
                    continue;
                };
                rows[r].insert(ti);
                for &dj in &dofs {
                    for tj in expand(dj) {
                        rows[r].insert(tj);
                    }
                }
            }
        }
    }
    SparsityPattern {
        rows: rows
            .into_iter()
            .map(|set| set.into_iter().collect())
            .collect(),
    }
}
