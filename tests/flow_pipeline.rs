//! End-to-end driver runs: 3-D aquifer with stream recharge, snapshot
//! output, and solver configuration plumbing.

use gwflow_sieve::assembly::{PointWells, UniformRecharge, Well};
use gwflow_sieve::dofs::DirichletSpec;
use gwflow_sieve::io::VtkSnapshotWriter;
use gwflow_sieve::linalg::solver::SolverControl;
use gwflow_sieve::mesh::{Dim, Mesh, TopBoundary};
use gwflow_sieve::prelude::{GwFlow, NoComm, NoWells};
use gwflow_sieve::streams::{StreamCatalog, StreamRechargeEngine};

fn aquifer() -> Mesh {
    Mesh::rectangle(
        Dim::Three,
        [5, 4, 2],
        [0.0, -2.0, 0.0],
        [10.0, 2.0, 1.0],
    )
    .unwrap()
}

#[test]
fn stream_fed_aquifer_builds_a_head_mound() {
    let mut catalog = StreamCatalog::default();
    catalog.push_segment([0.0, 0.0], [10.0, 0.0], 5.0, 1.0);
    let engine = StreamRechargeEngine::new(catalog, Dim::Three);

    let mut mesh = aquifer();
    let mut flow = GwFlow::new(NoComm, TopBoundary::box_mesh_default(Dim::Three));
    // Held head on the two x walls, recharge from the stream only.
    flow.dirichlet = DirichletSpec::new()
        .with_constant(0, 0.0)
        .with_constant(1, 0.0);
    let outcome = flow
        .simulate(&mut mesh, 0, &NoWells, Some(&engine))
        .unwrap();
    assert!(outcome.status.converged);

    // Recharge mounds the head above the held walls, highest mid-domain.
    let mut best = (0usize, f64::MIN);
    for d in 0..outcome.setup.n_dofs() {
        let h = outcome.solution.get(d).unwrap();
        if h > best.1 {
            best = (d, h);
        }
    }
    assert!(best.1 > 0.0);
    let p = mesh.vertex(outcome.setup.vertex_of_dof[best.0]);
    assert!(p[0] > 2.0 && p[0] < 8.0, "mound at x = {}", p[0]);
}

#[test]
fn extraction_well_depresses_the_head() {
    let mut mesh = aquifer();
    let mut flow = GwFlow::new(NoComm, TopBoundary::box_mesh_default(Dim::Three));
    flow.dirichlet = DirichletSpec::new()
        .with_constant(0, 0.0)
        .with_constant(1, 0.0);
    let wells = PointWells {
        wells: vec![Well {
            location: [5.0, 0.0, 0.5],
            rate: -10.0,
        }],
    };
    let outcome = flow.simulate(&mut mesh, 0, &wells, None).unwrap();
    assert!(outcome.status.converged);
    let min = outcome
        .solution
        .owned_values()
        .iter()
        .cloned()
        .fold(f64::MAX, f64::min);
    assert!(min < -1e-6, "expected a drawdown cone, min head {min}");
}

#[test]
fn snapshots_land_in_shard_and_manifest_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut mesh = aquifer();
    let mut flow = GwFlow::new(NoComm, TopBoundary::box_mesh_default(Dim::Three));
    flow.dirichlet = DirichletSpec::new().with_constant(0, 0.0);
    flow.recharge = Box::new(UniformRecharge(0.5));
    flow.sink = Box::new(VtkSnapshotWriter::new(dir.path(), "head_"));
    flow.simulate(&mut mesh, 3, &NoWells, None).unwrap();

    let shard = dir.path().join("head_003.0000.vtk");
    let manifest = dir.path().join("head_003.manifest");
    assert!(shard.is_file());
    let body = std::fs::read_to_string(shard).unwrap();
    assert!(body.starts_with("# vtk DataFile Version 3.0"));
    assert!(body.contains("CELL_TYPES 40"));
    assert_eq!(
        std::fs::read_to_string(manifest).unwrap().trim(),
        "head_003.0000.vtk"
    );
}

#[test]
fn solver_control_round_trips_through_json() {
    let control = SolverControl::new(500, 1e-9);
    let json = serde_json::to_string(&control).unwrap();
    let back: SolverControl = serde_json::from_str(&json).unwrap();
    assert_eq!(back.max_iterations, 500);
    assert_eq!(back.tolerance, 1e-9);
}

#[test]
fn adaptive_cycle_concentrates_cells_near_the_stream() {
    let mut catalog = StreamCatalog::default();
    catalog.push_segment([0.0, 0.0], [10.0, 0.0], 5.0, 1.0);
    let engine = StreamRechargeEngine::new(catalog, Dim::Three);

    let mut mesh = aquifer();
    // Pre-refine around the stream before the first solve.
    let top = TopBoundary::box_mesh_default(Dim::Three);
    let flagged = engine.flag_cells_for_refinement(&mut mesh, &top);
    assert!(flagged > 0);
    mesh.execute_coarsening_and_refinement().unwrap();
    let pre = mesh.n_active_cells();

    let mut flow = GwFlow::new(NoComm, top);
    flow.dirichlet = DirichletSpec::new()
        .with_constant(0, 0.0)
        .with_constant(1, 0.0);
    flow.simulate_and_refine(&mut mesh, 0, &NoWells, Some(&engine), 0.2, 0.0)
        .unwrap();
    assert!(mesh.n_active_cells() > pre);
}
