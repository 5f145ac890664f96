//! Mesh adaptation and hanging-node behavior through the public API.

use gwflow_sieve::dofs::{DirichletSpec, DofField};
use gwflow_sieve::mesh::{Dim, Mesh, RefineFlag, TopBoundary};
use gwflow_sieve::prelude::{GwFlow, NoComm, NoWells};

fn unit_square(divisions: usize) -> Mesh {
    Mesh::rectangle(
        Dim::Two,
        [divisions, divisions, 1],
        [0.0, 0.0, 0.0],
        [1.0, 1.0, 1.0],
    )
    .unwrap()
}

#[test]
fn uniform_refinement_quadruples_the_active_count() {
    let mut mesh = unit_square(2);
    for c in mesh.active_cells().collect::<Vec<_>>() {
        mesh.flag_for_refinement(c);
    }
    mesh.execute_coarsening_and_refinement().unwrap();
    assert_eq!(mesh.n_active_cells(), 16);
}

#[test]
fn refinement_then_coarsening_restores_the_cell_count() {
    let mut mesh = unit_square(2);
    for c in mesh.active_cells().collect::<Vec<_>>() {
        mesh.flag_for_refinement(c);
    }
    mesh.execute_coarsening_and_refinement().unwrap();

    for c in mesh.active_cells().collect::<Vec<_>>() {
        mesh.flag_for_coarsening(c);
    }
    mesh.execute_coarsening_and_refinement().unwrap();
    assert_eq!(mesh.n_active_cells(), 4);
    assert!(mesh.hanging_vertices().is_empty());
}

#[test]
fn single_cell_refinement_creates_hanging_vertices() {
    let mut mesh = unit_square(2);
    let first = mesh.active_cells().next().unwrap();
    mesh.flag_for_refinement(first);
    mesh.execute_coarsening_and_refinement().unwrap();
    assert_eq!(mesh.n_active_cells(), 7);
    let hanging = mesh.hanging_vertices();
    assert!(!hanging.is_empty());
    for (_, parents) in hanging {
        assert_eq!(parents.len(), 2);
    }
}

#[test]
fn two_to_one_balance_spreads_deep_refinement() {
    let mut mesh = unit_square(2);
    // Refine one corner cell twice; balance must drag neighbors along.
    let corner = mesh
        .active_cells()
        .find(|&c| {
            let p = mesh.cell_center(c);
            p[0] < 0.5 && p[1] < 0.5
        })
        .unwrap();
    mesh.flag_for_refinement(corner);
    mesh.execute_coarsening_and_refinement().unwrap();

    let deep = mesh
        .active_cells()
        .find(|&c| {
            let p = mesh.cell_center(c);
            mesh.cell(c).level == 1 && p[0] < 0.25 && p[1] < 0.25
        })
        .unwrap();
    mesh.flag_for_refinement(deep);
    mesh.execute_coarsening_and_refinement().unwrap();

    // No active cell pair sharing a vertex may differ by more than a level.
    let incidence = mesh.active_vertex_cells();
    for cells in incidence.values() {
        for &a in cells {
            for &b in cells {
                let la = i32::from(mesh.cell(a).level);
                let lb = i32::from(mesh.cell(b).level);
                assert!((la - lb).abs() <= 1, "levels {la} and {lb} share a vertex");
            }
        }
    }
}

#[test]
fn coarsening_never_merges_a_refine_flagged_sibling() {
    let mut mesh = unit_square(1);
    let root = mesh.active_cells().next().unwrap();
    mesh.flag_for_refinement(root);
    mesh.execute_coarsening_and_refinement().unwrap();

    let children: Vec<_> = mesh.active_cells().collect();
    assert_eq!(children.len(), 4);
    mesh.flag_for_refinement(children[0]);
    for &c in &children[1..] {
        mesh.flag_for_coarsening(c);
    }
    mesh.execute_coarsening_and_refinement().unwrap();
    // The refine won: the sibling group may not have merged back.
    assert_eq!(mesh.n_active_cells(), 7);
}

#[test]
fn refine_flag_is_ignored_on_inactive_cells() {
    let mut mesh = unit_square(1);
    let root = mesh.active_cells().next().unwrap();
    mesh.flag_for_refinement(root);
    mesh.execute_coarsening_and_refinement().unwrap();
    mesh.flag_for_refinement(root);
    assert_eq!(mesh.cell(root).flag, RefineFlag::Keep);
}

#[test]
fn hanging_constraints_preserve_a_linear_solution() {
    // head = x is harmonic and exactly representable by bilinear elements,
    // so it must survive a locally refined mesh with hanging nodes intact.
    let mut mesh = unit_square(2);
    let first = mesh.active_cells().next().unwrap();
    mesh.flag_for_refinement(first);
    mesh.execute_coarsening_and_refinement().unwrap();
    assert!(!mesh.hanging_vertices().is_empty());

    let mut flow = GwFlow::new(NoComm, TopBoundary(vec![]));
    flow.dirichlet = DirichletSpec::new()
        .with_constant(0, 0.0)
        .with_constant(1, 1.0);
    let outcome = flow.simulate(&mut mesh, 0, &NoWells, None).unwrap();
    assert!(outcome.status.converged);

    let setup = DofField::setup(&mesh, &DirichletSpec::new(), 0).unwrap();
    assert_eq!(setup.n_dofs(), outcome.setup.n_dofs());
    for (d, &v) in outcome.setup.vertex_of_dof.iter().enumerate() {
        let p = mesh.vertex(v);
        let head = outcome.solution.get(d).unwrap();
        assert!(
            (head - p[0]).abs() < 1e-7,
            "head {head} at ({}, {})",
            p[0],
            p[1]
        );
    }
}
