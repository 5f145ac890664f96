//! Solve-loop orchestration.
//!
//! [`GwFlow`] owns the pieces that stay fixed across iterations (boundary
//! data, material fields, solver controls, the output sink) and drives one
//! iteration as Setup -> SourceInjection -> Assemble -> Solve -> Output,
//! optionally followed by EstimateAndRefine. The stopping criterion is the
//! caller's: each call is one pass over the current mesh.

use crate::assembly::{
    ConductivityField, IsotropicConductivity, RechargeField, UniformRecharge, WellSource, assemble,
};
use crate::comm::Communicator;
use crate::dofs::{DirichletSpec, DofField, DofSetup};
use crate::error::GwError;
use crate::estimate::{estimate, refine_and_coarsen_fixed_number};
use crate::io::{NullSink, OutputSink};
use crate::linalg::solver::{SolveStatus, SolverControl, solve_cg};
use crate::linalg::{DistributedMatrix, DistributedVector};
use crate::mesh::{Mesh, TopBoundary};
use crate::streams::StreamRechargeEngine;

const TAG_SOLUTION_SYNC: u16 = 60;

/// One iteration's published state.
pub struct SimulationOutcome {
    /// DOF layout of the mesh the iteration ran on.
    pub setup: DofSetup,
    /// Ghost-synchronized head field with constraints back-substituted.
    pub solution: DistributedVector,
    /// Solver report.
    pub status: SolveStatus,
}

/// Steady-state groundwater-flow driver.
pub struct GwFlow<C: Communicator> {
    pub comm: C,
    pub dirichlet: DirichletSpec,
    pub conductivity: Box<dyn ConductivityField>,
    pub recharge: Box<dyn RechargeField>,
    pub top: TopBoundary,
    /// `max_iterations == 0` means "use the DOF count".
    pub control: SolverControl,
    pub sink: Box<dyn OutputSink>,
}

impl<C: Communicator> GwFlow<C> {
    /// Driver with neutral defaults: unit isotropic conductivity, no diffuse
    /// recharge, box-mesh top tags, silent output.
    pub fn new(comm: C, top: TopBoundary) -> Self {
        Self {
            comm,
            dirichlet: DirichletSpec::new(),
            conductivity: Box::new(IsotropicConductivity(1.0)),
            recharge: Box::new(UniformRecharge(0.0)),
            top,
            control: SolverControl::new(0, 1e-10),
            sink: Box::new(NullSink),
        }
    }

    /// Run one Setup -> Assemble -> Solve -> Output pass.
    pub fn simulate(
        &self,
        mesh: &mut Mesh,
        iteration: usize,
        wells: &dyn WellSource,
        streams: Option<&StreamRechargeEngine>,
    ) -> Result<SimulationOutcome, GwError> {
        if mesh.n_ranks() != self.comm.size() {
            mesh.partition(self.comm.size());
        }
        log::info!(
            "setting up system, iteration {iteration}: {} active cells",
            mesh.n_active_cells()
        );
        let setup = DofField::setup(mesh, &self.dirichlet, self.comm.rank())?;
        log::info!("{} DOFs ({} owned here)", setup.n_dofs(), setup.partition.n_owned());

        let mut matrix = DistributedMatrix::from_pattern(setup.partition.clone(), &setup.pattern);
        let mut rhs = DistributedVector::new(setup.partition.clone());
        assemble(
            &self.comm,
            mesh,
            &setup,
            self.conductivity.as_ref(),
            self.recharge.as_ref(),
            &self.top,
            streams,
            wells,
            &mut matrix,
            &mut rhs,
        )?;

        let control = if self.control.max_iterations == 0 {
            SolverControl::new(setup.n_dofs(), self.control.tolerance)
        } else {
            self.control.clone()
        };
        let mut solution = DistributedVector::new(setup.partition.clone());
        let status = solve_cg(&self.comm, &control, &matrix, &rhs, &mut solution)?;

        // Constrained DOFs read free ghosts; everyone then re-syncs so the
        // published field is consistent for output and estimation.
        solution.ghost_update(&self.comm, TAG_SOLUTION_SYNC)?;
        setup.constraints.distribute(&mut solution)?;
        solution.ghost_update(&self.comm, TAG_SOLUTION_SYNC + 2)?;

        self.sink.write_snapshot(
            mesh,
            &setup,
            &solution,
            self.conductivity.as_ref(),
            iteration,
        )?;

        Ok(SimulationOutcome {
            setup,
            solution,
            status,
        })
    }

    /// [`GwFlow::simulate`] followed by error estimation and a fixed-number
    /// refine/coarsen transaction. The returned outcome refers to the mesh
    /// *before* adaptation; all DOF and system state must be rebuilt after.
    pub fn simulate_and_refine(
        &self,
        mesh: &mut Mesh,
        iteration: usize,
        wells: &dyn WellSource,
        streams: Option<&StreamRechargeEngine>,
        top_fraction: f64,
        bottom_fraction: f64,
    ) -> Result<SimulationOutcome, GwError> {
        let outcome = self.simulate(mesh, iteration, wells, streams)?;
        let errors = estimate(
            &self.comm,
            mesh,
            &outcome.setup,
            self.conductivity.as_ref(),
            &outcome.solution,
        )?;
        refine_and_coarsen_fixed_number(mesh, &errors, top_fraction, bottom_fraction)?;
        mesh.execute_coarsening_and_refinement()?;
        Ok(outcome)
    }
}
