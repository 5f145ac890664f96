//! Snapshot output.
//!
//! The orchestrator publishes each solved iteration through an
//! [`OutputSink`]; the shipped implementation writes one legacy-VTK shard
//! per rank plus a rank-0 manifest, but tests and embedders can substitute
//! their own sink.

pub mod vtk;

pub use vtk::VtkSnapshotWriter;

use crate::assembly::ConductivityField;
use crate::dofs::DofSetup;
use crate::error::GwError;
use crate::linalg::DistributedVector;
use crate::mesh::Mesh;

/// Receiver for solved head fields, one call per iteration per rank.
pub trait OutputSink {
    fn write_snapshot(
        &self,
        mesh: &Mesh,
        setup: &DofSetup,
        solution: &DistributedVector,
        conductivity: &dyn ConductivityField,
        iteration: usize,
    ) -> Result<(), GwError>;
}

/// Discards every snapshot.
pub struct NullSink;

impl OutputSink for NullSink {
    fn write_snapshot(
        &self,
        _mesh: &Mesh,
        _setup: &DofSetup,
        _solution: &DistributedVector,
        _conductivity: &dyn ConductivityField,
        _iteration: usize,
    ) -> Result<(), GwError> {
        Ok(())
    }
}
