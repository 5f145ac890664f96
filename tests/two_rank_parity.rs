//! Multi-rank runs over the in-process communicator must reproduce the
//! serial solution bit-for-bit in structure (same DOFs, same heads up to
//! solver tolerance), and rank-replicated decisions must come out the
//! same on every rank.

use std::collections::BTreeMap;
use std::thread;

use serial_test::serial;

use gwflow_sieve::comm::ThreadComm;
use gwflow_sieve::dofs::DirichletSpec;
use gwflow_sieve::mesh::{Dim, Mesh, TopBoundary};
use gwflow_sieve::prelude::{
    DistributedVector, DofField, GwFlow, NoComm, NoWells, PointWells, UniformRecharge, Well,
    WellSource,
};

fn problem_mesh() -> Mesh {
    Mesh::rectangle(
        Dim::Two,
        [4, 4, 1],
        [0.0, 0.0, 0.0],
        [1.0, 1.0, 1.0],
    )
    .unwrap()
}

fn configure<C: gwflow_sieve::comm::Communicator>(flow: &mut GwFlow<C>) {
    flow.dirichlet = DirichletSpec::new().with_constant(2, 0.0);
    flow.recharge = Box::new(UniformRecharge(2.0));
    flow.control.tolerance = 1e-12;
}

/// Owned `(dof, head)` pairs of one rank's run.
fn run_rank(rank: usize, size: usize) -> BTreeMap<usize, f64> {
    let mut mesh = problem_mesh();
    let mut flow = GwFlow::new(ThreadComm::new(rank, size), TopBoundary::box_mesh_default(Dim::Two));
    configure(&mut flow);
    let outcome = flow.simulate(&mut mesh, 0, &NoWells, None).unwrap();
    assert!(outcome.status.converged);
    outcome
        .setup
        .partition
        .owned
        .iter()
        .zip(outcome.solution.owned_values())
        .map(|(&d, &v)| (d, v))
        .collect()
}

#[test]
#[serial]
fn two_ranks_reproduce_the_serial_head_field() {
    ThreadComm::reset_mailbox();

    let mut serial_mesh = problem_mesh();
    let mut serial_flow = GwFlow::new(NoComm, TopBoundary::box_mesh_default(Dim::Two));
    configure(&mut serial_flow);
    let serial_outcome = serial_flow
        .simulate(&mut serial_mesh, 0, &NoWells, None)
        .unwrap();
    assert!(serial_outcome.status.converged);

    let workers: Vec<_> = (0..2)
        .map(|rank| thread::spawn(move || run_rank(rank, 2)))
        .collect();
    let mut distributed: BTreeMap<usize, f64> = BTreeMap::new();
    for worker in workers {
        let part = worker.join().expect("rank thread panicked");
        for (dof, head) in part {
            assert!(
                distributed.insert(dof, head).is_none(),
                "dof {dof} owned twice"
            );
        }
    }

    assert_eq!(distributed.len(), serial_outcome.setup.n_dofs());
    for (dof, head) in &distributed {
        let expected = serial_outcome.solution.get(*dof).unwrap();
        assert!(
            (head - expected).abs() < 1e-8,
            "dof {dof}: {head} vs {expected}"
        );
    }
}

#[test]
#[serial]
fn two_rank_reductions_agree_with_local_sums() {
    ThreadComm::reset_mailbox();
    let workers: Vec<_> = (0..2)
        .map(|rank| {
            thread::spawn(move || {
                let comm = ThreadComm::new(rank, 2);
                gwflow_sieve::comm::all_reduce_sum(&comm, 7, (rank + 1) as f64).unwrap()
            })
        })
        .collect();
    for worker in workers {
        assert_eq!(worker.join().unwrap(), 3.0);
    }
}

/// Floating-point addition does not commute across magnitudes, so with
/// three or more ranks the reduction must fold contributions in rank
/// order everywhere or the ranks can disagree on a convergence test.
#[test]
#[serial]
fn three_rank_reductions_agree_bitwise() {
    ThreadComm::reset_mailbox();
    let values = [1e16, 1.0, -1e16];
    let workers: Vec<_> = (0..3)
        .map(|rank| {
            thread::spawn(move || {
                let comm = ThreadComm::new(rank, 3);
                gwflow_sieve::comm::all_reduce_sum(&comm, 7, values[rank]).unwrap()
            })
        })
        .collect();
    let results: Vec<f64> = workers
        .into_iter()
        .map(|w| w.join().expect("rank thread panicked"))
        .collect();
    let expected = (values[0] + values[1]) + values[2];
    for (rank, r) in results.iter().enumerate() {
        assert_eq!(
            r.to_bits(),
            expected.to_bits(),
            "rank {rank} reduced to {r}, expected {expected}"
        );
    }
}

/// A well sitting exactly on a face shared by cells owned by different
/// ranks must inject its rate into the system exactly once.
#[test]
#[serial]
fn shared_face_well_is_deposited_once() {
    ThreadComm::reset_mailbox();
    let workers: Vec<_> = (0..2)
        .map(|rank| {
            thread::spawn(move || {
                let comm = ThreadComm::new(rank, 2);
                let mut mesh = problem_mesh();
                mesh.partition(2);
                let setup = DofField::setup(&mesh, &DirichletSpec::new(), rank).unwrap();
                let mut rhs = DistributedVector::new(setup.partition.clone());
                let wells = PointWells {
                    wells: vec![Well {
                        // On the y = 0.5 face between the two owned halves.
                        location: [0.125, 0.5, 0.0],
                        rate: -50.0,
                    }],
                };
                wells.add_contributions(&mesh, &setup, &mut rhs).unwrap();
                rhs.compress(&comm, 9).unwrap();
                rhs.owned_values().iter().sum::<f64>()
            })
        })
        .collect();
    let total: f64 = workers
        .into_iter()
        .map(|w| w.join().expect("rank thread panicked"))
        .sum();
    assert!(
        (total - -50.0).abs() < 1e-9,
        "deposited {total}, expected -50"
    );
}
