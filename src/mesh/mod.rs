//! Arena-style distributed adaptive mesh of quadrilaterals or hexahedra.
//!
//! Cells and vertices are addressed by stable integer ids within a single
//! arena; refinement deactivates a parent and appends its children, so ids
//! never move. The dimensionality is a run-time tag ([`Dim`]) and cell
//! corners follow lexicographic (binary) ordering: corner `i` sits at the
//! reference position whose axis-`a` coordinate is bit `a` of `i`. Faces
//! are numbered `2 * axis + side`, so the top boundary of a 3-D box mesh
//! carries tag 5 and of a 2-D box mesh tag 3 — but nothing downstream
//! hard-codes those values; consumers receive an explicit [`TopBoundary`]
//! tag set.
//!
//! The topology is replicated on every rank; ownership of active cells is a
//! strict partition and all distributed state (DOFs, matrices, vectors) is
//! built from it. Refinement and coarsening run as one transaction with
//! vertex-granular 2:1 balancing, so hanging nodes are always one level.

use crate::error::GwError;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

/// Run-time dimensionality tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dim {
    /// Quadrilateral cells in the xy plane.
    Two,
    /// Hexahedral cells.
    Three,
}

impl Dim {
    /// Number of spatial coordinates.
    pub fn spatial(self) -> usize {
        match self {
            Dim::Two => 2,
            Dim::Three => 3,
        }
    }

    /// Corners per cell (`2^d`).
    pub fn vertices_per_cell(self) -> usize {
        1 << self.spatial()
    }

    /// Faces per cell (`2d`).
    pub fn faces_per_cell(self) -> usize {
        2 * self.spatial()
    }

    /// Children per refined cell (`2^d`).
    pub fn children_per_cell(self) -> usize {
        1 << self.spatial()
    }
}

/// Stable vertex id into the mesh arena.
pub type VertexId = u32;
/// Stable cell id into the mesh arena.
pub type CellId = u32;
/// Boundary face tag.
pub type BoundaryTag = i32;

/// Configurable set of face tags playing the "top boundary" role.
///
/// Supplied by the caller; recharge and stream terms apply only on faces
/// carrying one of these tags.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopBoundary(pub Vec<BoundaryTag>);

impl TopBoundary {
    /// Membership test.
    pub fn contains(&self, tag: BoundaryTag) -> bool {
        self.0.contains(&tag)
    }

    /// The conventional top tag of a box mesh built by [`Mesh::rectangle`]:
    /// the upper side of the last axis.
    pub fn box_mesh_default(dim: Dim) -> Self {
        let axis = dim.spatial() - 1;
        TopBoundary(vec![(2 * axis + 1) as BoundaryTag])
    }
}

/// Adaptation mark carried by an active cell.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RefineFlag {
    /// Leave the cell alone.
    #[default]
    Keep,
    /// Split into `2^d` children.
    Refine,
    /// Merge back into the parent (if all siblings agree).
    Coarsen,
}

/// One cell of the arena forest.
#[derive(Clone, Debug)]
pub struct Cell {
    /// Corner vertex ids in binary ordering.
    pub vertices: Vec<VertexId>,
    /// Refinement level (0 = coarse mesh).
    pub level: u8,
    /// Parent cell, if refined from one.
    pub parent: Option<CellId>,
    /// Children ids (empty for never-refined cells).
    pub children: Vec<CellId>,
    /// Owning rank.
    pub owner: usize,
    /// Per-face boundary tag; `None` marks interior faces.
    pub boundary: Vec<Option<BoundaryTag>>,
    /// Adaptation mark.
    pub flag: RefineFlag,
    /// Whether the cell is a leaf of the forest.
    pub active: bool,
}

/// Distributed adaptive mesh arena.
#[derive(Clone, Debug)]
pub struct Mesh {
    dim: Dim,
    vertices: Vec<[f64; 3]>,
    cells: Vec<Cell>,
    /// Parents of every midpoint vertex created during refinement, with
    /// equal interpolation weights. Key ingredient for hanging-node
    /// constraints and for deciding whether a vertex lies on a coarse face.
    midpoint_parents: HashMap<VertexId, Vec<VertexId>>,
    /// Dedup map: sorted parent ids -> midpoint vertex.
    midpoint_lookup: HashMap<Vec<VertexId>, VertexId>,
    n_ranks: usize,
}

impl Mesh {
    /// Build a structured box mesh of `divisions` cells per axis spanning
    /// `lower..upper`. For [`Dim::Two`] the z components are ignored.
    ///
    /// Outer faces carry tag `2 * axis + side` (side 0 = lower).
    pub fn rectangle(
        dim: Dim,
        divisions: [usize; 3],
        lower: [f64; 3],
        upper: [f64; 3],
    ) -> Result<Self, GwError> {
        let d = dim.spatial();
        for a in 0..d {
            if divisions[a] == 0 {
                return Err(GwError::InvalidGeometry(format!(
                    "axis {a} has zero subdivisions"
                )));
            }
            if upper[a] <= lower[a] {
                return Err(GwError::InvalidGeometry(format!(
                    "axis {a} has non-positive extent"
                )));
            }
        }
        let counts: Vec<usize> = (0..d).map(|a| divisions[a] + 1).collect();
        let mut vertices = Vec::new();
        let grid_index = |ijk: &[usize]| -> usize {
            let mut idx = 0;
            for a in (0..d).rev() {
                idx = idx * counts[a] + ijk[a];
            }
            idx
        };
        // Vertex grid, z-major last axis.
        let total: usize = counts.iter().product();
        vertices.resize(total, [0.0; 3]);
        let mut ijk = vec![0usize; d];
        'grid: loop {
            let mut p = [0.0; 3];
            for a in 0..d {
                p[a] = lower[a] + (upper[a] - lower[a]) * ijk[a] as f64 / divisions[a] as f64;
            }
            vertices[grid_index(&ijk)] = p;
            for a in 0..d {
                ijk[a] += 1;
                if ijk[a] < counts[a] {
                    continue 'grid;
                }
                ijk[a] = 0;
                if a == d - 1 {
                    break 'grid;
                }
            }
        }

        let mut cells = Vec::new();
        let mut cell_ijk = vec![0usize; d];
        'cells: loop {
            let mut corners = Vec::with_capacity(1 << d);
            for bits in 0..(1usize << d) {
                let corner: Vec<usize> = (0..d).map(|a| cell_ijk[a] + ((bits >> a) & 1)).collect();
                corners.push(grid_index(&corner) as VertexId);
            }
            let mut boundary = vec![None; 2 * d];
            for a in 0..d {
                if cell_ijk[a] == 0 {
                    boundary[2 * a] = Some((2 * a) as BoundaryTag);
                }
                if cell_ijk[a] == divisions[a] - 1 {
                    boundary[2 * a + 1] = Some((2 * a + 1) as BoundaryTag);
                }
            }
            cells.push(Cell {
                vertices: corners,
                level: 0,
                parent: None,
                children: Vec::new(),
                owner: 0,
                boundary,
                flag: RefineFlag::Keep,
                active: true,
            });
            for a in 0..d {
                cell_ijk[a] += 1;
                if cell_ijk[a] < divisions[a] {
                    continue 'cells;
                }
                cell_ijk[a] = 0;
                if a == d - 1 {
                    break 'cells;
                }
            }
        }

        Ok(Mesh {
            dim,
            vertices,
            cells,
            midpoint_parents: HashMap::new(),
            midpoint_lookup: HashMap::new(),
            n_ranks: 1,
        })
    }

    /// Dimensionality tag.
    pub fn dim(&self) -> Dim {
        self.dim
    }

    /// Number of cooperating ranks in the current partition.
    pub fn n_ranks(&self) -> usize {
        self.n_ranks
    }

    /// Vertex coordinates.
    pub fn vertex(&self, v: VertexId) -> [f64; 3] {
        self.vertices[v as usize]
    }

    /// Total vertex count (active and historical).
    pub fn n_vertices(&self) -> usize {
        self.vertices.len()
    }

    /// Borrow a cell record.
    pub fn cell(&self, c: CellId) -> &Cell {
        &self.cells[c as usize]
    }

    /// Ids of all active cells, ascending.
    pub fn active_cells(&self) -> impl Iterator<Item = CellId> + '_ {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.active)
            .map(|(i, _)| i as CellId)
    }

    /// Number of active cells.
    pub fn n_active_cells(&self) -> usize {
        self.cells.iter().filter(|c| c.active).count()
    }

    /// Corner coordinates of a cell, binary-ordered.
    pub fn cell_corner_coords(&self, c: CellId) -> Vec<[f64; 3]> {
        self.cells[c as usize]
            .vertices
            .iter()
            .map(|&v| self.vertices[v as usize])
            .collect()
    }

    /// Cell barycenter (mean of corners; exact for our box children).
    pub fn cell_center(&self, c: CellId) -> [f64; 3] {
        let corners = self.cell_corner_coords(c);
        let mut center = [0.0; 3];
        for p in &corners {
            for a in 0..3 {
                center[a] += p[a];
            }
        }
        for a in 0..3 {
            center[a] /= corners.len() as f64;
        }
        center
    }

    /// Longest corner-to-corner distance.
    pub fn cell_diameter(&self, c: CellId) -> f64 {
        let corners = self.cell_corner_coords(c);
        let mut best: f64 = 0.0;
        for i in 0..corners.len() {
            for j in (i + 1)..corners.len() {
                let d2: f64 = (0..3).map(|a| (corners[i][a] - corners[j][a]).powi(2)).sum();
                best = best.max(d2.sqrt());
            }
        }
        best
    }

    /// Ring-ordered local corner indices of face `2 * axis + side`.
    pub fn face_corner_locals(dim: Dim, face: usize) -> Vec<usize> {
        let d = dim.spatial();
        let axis = face / 2;
        let side = face % 2;
        let free: Vec<usize> = (0..d).filter(|a| *a != axis).collect();
        let ring: &[[usize; 2]] = match free.len() {
            1 => &[[0, 0], [1, 0]],
            2 => &[[0, 0], [1, 0], [1, 1], [0, 1]],
            _ => unreachable!("faces exist only for 2-D and 3-D cells"),
        };
        ring.iter()
            .map(|bits| {
                let mut local = side << axis;
                for (k, a) in free.iter().enumerate() {
                    local |= bits[k] << a;
                }
                local
            })
            .collect()
    }

    /// Ring-ordered vertex ids of a cell face.
    pub fn face_vertices(&self, c: CellId, face: usize) -> Vec<VertexId> {
        let cell = &self.cells[c as usize];
        Self::face_corner_locals(self.dim, face)
            .into_iter()
            .map(|l| cell.vertices[l])
            .collect()
    }

    /// Ring-ordered coordinates of a cell face.
    pub fn face_coords(&self, c: CellId, face: usize) -> Vec<[f64; 3]> {
        self.face_vertices(c, face)
            .into_iter()
            .map(|v| self.vertices[v as usize])
            .collect()
    }

    /// Boundary tag of a face (`None` = interior).
    pub fn boundary_tag(&self, c: CellId, face: usize) -> Option<BoundaryTag> {
        self.cells[c as usize].boundary[face]
    }

    /// Face ring projected onto the horizontal plane (z dropped).
    pub fn face_footprint(&self, c: CellId, face: usize) -> Vec<[f64; 2]> {
        self.face_coords(c, face)
            .into_iter()
            .map(|p| [p[0], p[1]])
            .collect()
    }

    /// Parents of a refinement midpoint vertex, if `v` is one.
    pub fn midpoint_parents(&self, v: VertexId) -> Option<&[VertexId]> {
        self.midpoint_parents.get(&v).map(|p| p.as_slice())
    }

    // --- adaptation ---

    /// Mark an active cell for refinement.
    pub fn flag_for_refinement(&mut self, c: CellId) {
        let cell = &mut self.cells[c as usize];
        if cell.active {
            cell.flag = RefineFlag::Refine;
        }
    }

    /// Mark an active cell for coarsening.
    ///
    /// A refine mark always wins over a coarsen mark.
    pub fn flag_for_coarsening(&mut self, c: CellId) {
        let cell = &mut self.cells[c as usize];
        if cell.active && cell.flag != RefineFlag::Refine {
            cell.flag = RefineFlag::Coarsen;
        }
    }

    /// Drop every adaptation mark.
    pub fn clear_flags(&mut self) {
        for cell in &mut self.cells {
            cell.flag = RefineFlag::Keep;
        }
    }

    /// Execute the marked refinement and coarsening as one transaction.
    ///
    /// Refinement runs first, then coarsening of sibling groups whose
    /// members all agreed (and none got refined). Marks are consumed. The
    /// ownership partition is rebuilt afterwards since cell ids shifted
    /// between active and inactive.
    pub fn execute_coarsening_and_refinement(&mut self) -> Result<(), GwError> {
        self.balance_refine_flags();

        let to_refine: Vec<CellId> = self
            .cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.active && cell.flag == RefineFlag::Refine)
            .map(|(i, _)| i as CellId)
            .collect();
        for c in &to_refine {
            self.refine_cell(*c)?;
        }

        self.coarsen_marked();

        self.clear_flags();
        let ranks = self.n_ranks;
        self.partition(ranks);
        log::debug!(
            "mesh adaptation: refined {} cells, {} active cells now",
            to_refine.len(),
            self.n_active_cells()
        );
        Ok(())
    }

    /// Strict partition of active cells over `n_ranks`, striped in id order.
    ///
    /// Deterministic and identical on every rank (the topology is
    /// replicated), which keeps exchange plans computable without any
    /// cross-rank negotiation.
    pub fn partition(&mut self, n_ranks: usize) {
        let n_ranks = n_ranks.max(1);
        self.n_ranks = n_ranks;
        let active: Vec<CellId> = self.active_cells().collect();
        let n = active.len().max(1);
        for (idx, c) in active.iter().enumerate() {
            self.cells[*c as usize].owner = idx * n_ranks / n;
        }
    }

    /// Active cells owned by `rank`.
    pub fn owned_cells(&self, rank: usize) -> Vec<CellId> {
        self.active_cells()
            .filter(|c| self.cells[*c as usize].owner == rank)
            .collect()
    }

    /// Owned cells plus the ghost layer (active cells sharing a vertex).
    pub fn relevant_cells(&self, rank: usize) -> Vec<CellId> {
        let incidence = self.active_vertex_cells();
        let mut relevant: Vec<CellId> = Vec::new();
        let mut seen = vec![false; self.cells.len()];
        for c in self.active_cells() {
            if self.cells[c as usize].owner != rank {
                continue;
            }
            if !seen[c as usize] {
                seen[c as usize] = true;
                relevant.push(c);
            }
            for &v in &self.cells[c as usize].vertices {
                if let Some(neighbors) = incidence.get(&v) {
                    for &other in neighbors {
                        if !seen[other as usize] {
                            seen[other as usize] = true;
                            relevant.push(other);
                        }
                    }
                }
            }
        }
        relevant.sort_unstable();
        relevant
    }

    /// Corner incidence of active cells: vertex -> active cells using it.
    pub fn active_vertex_cells(&self) -> HashMap<VertexId, Vec<CellId>> {
        let mut map: HashMap<VertexId, Vec<CellId>> = HashMap::new();
        for c in self.active_cells() {
            for &v in &self.cells[c as usize].vertices {
                map.entry(v).or_default().push(c);
            }
        }
        map
    }

    /// Hanging vertices of the active mesh with their constraint parents.
    ///
    /// A vertex is hanging when some active cell contains all of its
    /// refinement parents as corners but not the vertex itself — i.e. the
    /// vertex sits strictly inside that cell's edge or face. Each entry
    /// constrains the vertex to the equal-weight mean of its parents.
    pub fn hanging_vertices(&self) -> Vec<(VertexId, Vec<VertexId>)> {
        let incidence = self.active_vertex_cells();
        let mut hanging = Vec::new();
        let mut used: Vec<VertexId> = incidence.keys().copied().collect();
        used.sort_unstable();
        for v in used {
            let Some(parents) = self.midpoint_parents.get(&v) else {
                continue;
            };
            let Some(candidates) = incidence.get(&parents[0]) else {
                continue;
            };
            let is_hanging = candidates.iter().any(|&cell| {
                let corners = &self.cells[cell as usize].vertices;
                !corners.contains(&v) && parents.iter().all(|p| corners.contains(p))
            });
            if is_hanging {
                hanging.push((v, parents.clone()));
            }
        }
        hanging
    }

    /// Bounding box of a cell in the horizontal plane.
    pub fn cell_bbox(&self, c: CellId) -> crate::geometry::Aabb {
        let pts: Vec<[f64; 2]> = self
            .cell_corner_coords(c)
            .into_iter()
            .map(|p| [p[0], p[1]])
            .collect();
        crate::geometry::Aabb::from_points(&pts)
    }

    // Vertex-granular 2:1 balance: a refine mark forces refine marks on
    // every coarser active cell sharing a vertex, transitively.
    fn balance_refine_flags(&mut self) {
        loop {
            let incidence = self.active_vertex_cells();
            let mut force: Vec<CellId> = Vec::new();
            for c in self.active_cells() {
                if self.cells[c as usize].flag != RefineFlag::Refine {
                    continue;
                }
                let level = self.cells[c as usize].level;
                for &v in &self.cells[c as usize].vertices {
                    // Include vertices this cell sees through hanging
                    // midpoints: their parents belong to coarser neighbors.
                    let mut reach: Vec<VertexId> = vec![v];
                    if let Some(parents) = self.midpoint_parents.get(&v) {
                        reach.extend_from_slice(parents);
                    }
                    for r in reach {
                        if let Some(neighbors) = incidence.get(&r) {
                            for &other in neighbors {
                                let cell = &self.cells[other as usize];
                                if cell.level < level && cell.flag != RefineFlag::Refine {
                                    force.push(other);
                                }
                            }
                        }
                    }
                }
            }
            if force.is_empty() {
                break;
            }
            for c in force {
                self.cells[c as usize].flag = RefineFlag::Refine;
            }
        }
    }

    fn refine_cell(&mut self, c: CellId) -> Result<(), GwError> {
        let d = self.dim.spatial();
        let cell = self.cells[c as usize].clone();
        if !cell.active {
            return Err(GwError::Adaptation(format!("cell {c} is not active")));
        }
        if cell.level == u8::MAX {
            return Err(GwError::Adaptation(format!("cell {c} at maximum level")));
        }

        // Refinement lattice: positions in {0, 1, 2}^d, units of h/2.
        let lattice_size = 3usize.pow(d as u32);
        let mut lattice = vec![0 as VertexId; lattice_size];
        for enc in 0..lattice_size {
            let digits: Vec<usize> = {
                let mut e = enc;
                (0..d)
                    .map(|_| {
                        let digit = e % 3;
                        e /= 3;
                        digit
                    })
                    .collect()
            };
            // Parent corners: bit patterns compatible with each digit
            // (digit 1 means "both sides of this axis").
            let mut parents: Vec<VertexId> = Vec::new();
            for bits in 0..(1usize << d) {
                let compatible = (0..d).all(|a| {
                    let bit = (bits >> a) & 1;
                    digits[a] == 1 || digits[a] == 2 * bit
                });
                if compatible {
                    parents.push(cell.vertices[bits]);
                }
            }
            lattice[enc] = if parents.len() == 1 {
                parents[0]
            } else {
                self.midpoint_vertex(parents)
            };
        }

        // Children: offsets q in {0, 1}^d, corners at lattice q + b.
        let mut children = Vec::with_capacity(1 << d);
        for q in 0..(1usize << d) {
            let mut corners = Vec::with_capacity(1 << d);
            for bits in 0..(1usize << d) {
                let mut enc = 0;
                for a in (0..d).rev() {
                    let digit = ((q >> a) & 1) + ((bits >> a) & 1);
                    enc = enc * 3 + digit;
                }
                corners.push(lattice[enc]);
            }
            // A child face lies on the parent face of the same axis/side
            // exactly when the child sits on that side.
            let mut boundary = vec![None; 2 * d];
            for a in 0..d {
                for s in 0..2 {
                    if ((q >> a) & 1) == s {
                        boundary[2 * a + s] = cell.boundary[2 * a + s];
                    }
                }
            }
            let child_id = self.cells.len() as CellId;
            self.cells.push(Cell {
                vertices: corners,
                level: cell.level + 1,
                parent: Some(c),
                children: Vec::new(),
                owner: cell.owner,
                boundary,
                flag: RefineFlag::Keep,
                active: true,
            });
            children.push(child_id);
        }

        let parent = &mut self.cells[c as usize];
        parent.active = false;
        parent.children = children;
        parent.flag = RefineFlag::Keep;
        Ok(())
    }

    fn midpoint_vertex(&mut self, mut parents: Vec<VertexId>) -> VertexId {
        parents.sort_unstable();
        parents.dedup();
        if let Some(&v) = self.midpoint_lookup.get(&parents) {
            return v;
        }
        let mut p = [0.0; 3];
        for &parent in &parents {
            let coords = self.vertices[parent as usize];
            for a in 0..3 {
                p[a] += coords[a];
            }
        }
        for a in 0..3 {
            p[a] /= parents.len() as f64;
        }
        let v = self.vertices.len() as VertexId;
        self.vertices.push(p);
        self.midpoint_lookup.insert(parents.clone(), v);
        self.midpoint_parents.insert(v, parents);
        v
    }

    fn coarsen_marked(&mut self) {
        // Group coarsen marks by parent.
        let mut by_parent: HashMap<CellId, Vec<CellId>> = HashMap::new();
        for (i, cell) in self.cells.iter().enumerate() {
            if cell.active && cell.flag == RefineFlag::Coarsen {
                if let Some(parent) = cell.parent {
                    by_parent.entry(parent).or_default().push(i as CellId);
                }
            }
        }
        let incidence = self.active_vertex_cells();
        for (parent, marked) in by_parent {
            let siblings = self.cells[parent as usize].children.clone();
            if marked.len() != siblings.len() {
                continue; // not all siblings agreed
            }
            if siblings.iter().any(|&s| !self.cells[s as usize].active) {
                continue; // a sibling got refined in this transaction
            }
            // Reactivating the parent must not create a two-level hanging
            // node against a finer active neighbor.
            let parent_level = self.cells[parent as usize].level;
            let violates = self.cells[parent as usize].vertices.iter().any(|v| {
                incidence.get(v).is_some_and(|neighbors| {
                    neighbors
                        .iter()
                        .any(|&n| self.cells[n as usize].level > parent_level + 1)
                })
            });
            if violates {
                continue;
            }
            for s in siblings {
                self.cells[s as usize].active = false;
                self.cells[s as usize].flag = RefineFlag::Keep;
            }
            self.cells[parent as usize].active = true;
            self.cells[parent as usize].children.clear();
        }
    }
}
