//! Legacy-VTK (ASCII `UNSTRUCTURED_GRID`) snapshot shards.
//!
//! Each rank writes its owned active cells to
//! `{prefix}{iter:03}.{rank:04}.vtk`; rank 0 additionally writes
//! `{prefix}{iter:03}.manifest` listing every shard so downstream tooling
//! can reassemble the distributed snapshot.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::assembly::ConductivityField;
use crate::dofs::DofSetup;
use crate::error::GwError;
use crate::io::OutputSink;
use crate::linalg::DistributedVector;
use crate::mesh::{Dim, Mesh, VertexId};

/// Per-rank legacy-VTK writer.
pub struct VtkSnapshotWriter {
    directory: PathBuf,
    prefix: String,
}

impl VtkSnapshotWriter {
    pub fn new(directory: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            prefix: prefix.into(),
        }
    }

    /// Shard file name for an iteration and rank.
    pub fn shard_name(&self, iteration: usize, rank: usize) -> String {
        format!("{}{iteration:03}.{rank:04}.vtk", self.prefix)
    }

    /// Manifest file name for an iteration.
    pub fn manifest_name(&self, iteration: usize) -> String {
        format!("{}{iteration:03}.manifest", self.prefix)
    }

    fn shard_path(&self, iteration: usize, rank: usize) -> PathBuf {
        self.directory.join(self.shard_name(iteration, rank))
    }

    fn write_manifest(&self, iteration: usize, n_ranks: usize) -> Result<(), GwError> {
        let path: &Path = &self.directory.join(self.manifest_name(iteration));
        let mut out = BufWriter::new(File::create(path)?);
        for rank in 0..n_ranks {
            writeln!(out, "{}", self.shard_name(iteration, rank))?;
        }
        Ok(())
    }
}

/// VTK cell type codes for the two cell shapes.
fn vtk_cell_type(dim: Dim) -> u8 {
    match dim {
        Dim::Two => 9,   // VTK_QUAD
        Dim::Three => 12, // VTK_HEXAHEDRON
    }
}

/// VTK corner order from binary corner order.
fn vtk_corner_order(dim: Dim) -> &'static [usize] {
    match dim {
        Dim::Two => &[0, 1, 3, 2],
        Dim::Three => &[0, 1, 3, 2, 4, 5, 7, 6],
    }
}

impl OutputSink for VtkSnapshotWriter {
    fn write_snapshot(
        &self,
        mesh: &Mesh,
        setup: &DofSetup,
        solution: &DistributedVector,
        conductivity: &dyn ConductivityField,
        iteration: usize,
    ) -> Result<(), GwError> {
        let rank = setup.partition.rank;
        let cells = mesh.owned_cells(rank);

        // Compact the shard's vertex set.
        let mut local_of_vertex: HashMap<VertexId, usize> = HashMap::new();
        let mut vertex_order: Vec<VertexId> = Vec::new();
        for &c in &cells {
            for &v in &mesh.cell(c).vertices {
                if !local_of_vertex.contains_key(&v) {
                    local_of_vertex.insert(v, vertex_order.len());
                    vertex_order.push(v);
                }
            }
        }

        let path = self.shard_path(iteration, rank);
        let mut out = BufWriter::new(File::create(&path)?);
        writeln!(out, "# vtk DataFile Version 3.0")?;
        writeln!(out, "groundwater head, iteration {iteration}, rank {rank}")?;
        writeln!(out, "ASCII")?;
        writeln!(out, "DATASET UNSTRUCTURED_GRID")?;

        writeln!(out, "POINTS {} double", vertex_order.len())?;
        for &v in &vertex_order {
            let p = mesh.vertex(v);
            writeln!(out, "{} {} {}", p[0], p[1], p[2])?;
        }

        let corners = mesh.dim().vertices_per_cell();
        writeln!(out, "CELLS {} {}", cells.len(), cells.len() * (corners + 1))?;
        let order = vtk_corner_order(mesh.dim());
        for &c in &cells {
            let verts = &mesh.cell(c).vertices;
            write!(out, "{corners}")?;
            for &local in order {
                write!(out, " {}", local_of_vertex[&verts[local]])?;
            }
            writeln!(out)?;
        }
        writeln!(out, "CELL_TYPES {}", cells.len())?;
        let code = vtk_cell_type(mesh.dim());
        for _ in &cells {
            writeln!(out, "{code}")?;
        }

        writeln!(out, "POINT_DATA {}", vertex_order.len())?;
        writeln!(out, "SCALARS head double 1")?;
        writeln!(out, "LOOKUP_TABLE default")?;
        for &v in &vertex_order {
            let dof = setup.dof_of(v).ok_or_else(|| {
                GwError::InvalidGeometry(format!("vertex {v} carries no DOF"))
            })?;
            writeln!(out, "{}", solution.get(dof)?)?;
        }

        writeln!(out, "CELL_DATA {}", cells.len())?;
        writeln!(out, "SCALARS owner int 1")?;
        writeln!(out, "LOOKUP_TABLE default")?;
        for &c in &cells {
            writeln!(out, "{}", mesh.cell(c).owner)?;
        }
        writeln!(out, "SCALARS conductivity double 1")?;
        writeln!(out, "LOOKUP_TABLE default")?;
        for &c in &cells {
            let k = conductivity.conductivity(&mesh.cell_center(c));
            writeln!(out, "{}", k[0])?;
        }
        out.flush()?;
        log::debug!("wrote snapshot shard {}", path.display());

        if rank == 0 {
            self.write_manifest(iteration, mesh.n_ranks())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::IsotropicConductivity;
    use crate::dofs::{DirichletSpec, DofField};

    #[test]
    fn shard_and_manifest_names_follow_the_scheme() {
        let writer = VtkSnapshotWriter::new("/tmp", "head_");
        assert_eq!(writer.shard_name(7, 3), "head_007.0003.vtk");
        assert_eq!(writer.manifest_name(7), "head_007.manifest");
    }

    #[test]
    fn writes_a_parseable_shard_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = Mesh::rectangle(
            Dim::Two,
            [2, 2, 1],
            [0.0, 0.0, 0.0],
            [1.0, 1.0, 1.0],
        )
        .unwrap();
        let setup = DofField::setup(&mesh, &DirichletSpec::new(), 0).unwrap();
        let mut solution = DistributedVector::new(setup.partition.clone());
        for d in 0..setup.n_dofs() {
            solution.set(d, d as f64).unwrap();
        }
        let writer = VtkSnapshotWriter::new(dir.path(), "head_");
        writer
            .write_snapshot(&mesh, &setup, &solution, &IsotropicConductivity(2.5), 1)
            .unwrap();

        let shard = std::fs::read_to_string(dir.path().join("head_001.0000.vtk")).unwrap();
        assert!(shard.contains("DATASET UNSTRUCTURED_GRID"));
        assert!(shard.contains("POINTS 9 double"));
        assert!(shard.contains("CELLS 4 20"));
        assert!(shard.contains("SCALARS head double 1"));
        assert!(shard.contains("SCALARS conductivity double 1"));

        let manifest = std::fs::read_to_string(dir.path().join("head_001.manifest")).unwrap();
        assert_eq!(manifest.trim(), "head_001.0000.vtk");
    }
}
