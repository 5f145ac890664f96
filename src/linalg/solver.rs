//! Preconditioned conjugate gradients over the distributed system.
//!
//! The preconditioner is an AMG V-cycle built per rank on the locally-owned
//! diagonal block, so the global preconditioner is block-Jacobi with AMG
//! blocks. Inner products are summed across ranks; the matrix application
//! refreshes ghost values first.

use serde::{Deserialize, Serialize};

use crate::comm::{Communicator, all_reduce_sum};
use crate::error::GwError;
use crate::linalg::amg::AmgPreconditioner;
use crate::linalg::{DistributedMatrix, DistributedVector};

/// Iteration budget and absolute residual tolerance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolverControl {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl SolverControl {
    pub fn new(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_iterations,
            tolerance,
        }
    }
}

/// Outcome of a solve. Non-convergence is reported, not raised.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolveStatus {
    pub iterations: usize,
    pub residual: f64,
    pub converged: bool,
}

const TAG_MATVEC: u16 = 40;
const TAG_DOT: u16 = 44;

/// Solve `A x = b` by preconditioned CG, overwriting `x` (used as the
/// initial guess). `a` and `b` must be compressed.
pub fn solve_cg<C: Communicator>(
    comm: &C,
    control: &SolverControl,
    a: &DistributedMatrix,
    b: &DistributedVector,
    x: &mut DistributedVector,
) -> Result<SolveStatus, GwError> {
    let precond = AmgPreconditioner::build(a.local_block());
    let n_local = a.n_owned_rows();

    let b_norm = global_norm(comm, b)?;
    if b_norm == 0.0 {
        x.fill_zero();
        return Ok(SolveStatus {
            iterations: 0,
            residual: 0.0,
            converged: true,
        });
    }

    // r = b - A x
    let mut r = b.clone();
    x.ghost_update(comm, TAG_MATVEC)?;
    let mut ax = b.clone();
    a.matvec(x, &mut ax)?;
    for (ri, &axi) in r.owned_values_mut().iter_mut().zip(ax.owned_values()) {
        *ri -= axi;
    }

    let mut residual = global_norm(comm, &r)?;
    if residual <= control.tolerance {
        return Ok(SolveStatus {
            iterations: 0,
            residual,
            converged: true,
        });
    }

    let mut z_local = precond.apply(r.owned_values());
    let mut p = r.clone();
    p.owned_values_mut().copy_from_slice(&z_local);
    let mut rz = global_dot_slices(comm, r.owned_values(), &z_local)?;

    let mut iterations = 0;
    while iterations < control.max_iterations {
        iterations += 1;

        p.ghost_update(comm, TAG_MATVEC)?;
        a.matvec(&p, &mut ax)?;
        let p_ap = global_dot(comm, &p, &ax)?;
        if p_ap <= 0.0 {
            log::warn!("cg: direction with non-positive curvature ({p_ap:.3e}), aborting");
            break;
        }
        let alpha = rz / p_ap;
        for i in 0..n_local {
            x.owned_values_mut()[i] += alpha * p.owned_values()[i];
            r.owned_values_mut()[i] -= alpha * ax.owned_values()[i];
        }

        residual = global_norm(comm, &r)?;
        if residual <= control.tolerance {
            log::debug!("cg converged in {iterations} iterations, residual {residual:.3e}");
            return Ok(SolveStatus {
                iterations,
                residual,
                converged: true,
            });
        }

        z_local = precond.apply(r.owned_values());
        let rz_next = global_dot_slices(comm, r.owned_values(), &z_local)?;
        let beta = rz_next / rz;
        rz = rz_next;
        for i in 0..n_local {
            let v = z_local[i] + beta * p.owned_values()[i];
            p.owned_values_mut()[i] = v;
        }
    }

    log::warn!(
        "cg did not converge within {} iterations, residual {residual:.3e} (tolerance {:.3e})",
        control.max_iterations,
        control.tolerance
    );
    Ok(SolveStatus {
        iterations,
        residual,
        converged: false,
    })
}

fn global_dot<C: Communicator>(
    comm: &C,
    a: &DistributedVector,
    b: &DistributedVector,
) -> Result<f64, GwError> {
    all_reduce_sum(comm, TAG_DOT, a.local_dot(b))
}

fn global_dot_slices<C: Communicator>(comm: &C, a: &[f64], b: &[f64]) -> Result<f64, GwError> {
    let local: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    all_reduce_sum(comm, TAG_DOT, local)
}

fn global_norm<C: Communicator>(comm: &C, v: &DistributedVector) -> Result<f64, GwError> {
    Ok(all_reduce_sum(comm, TAG_DOT, v.local_dot(v))?.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoComm;
    use crate::linalg::{DofPartition, SparsityPattern};
    use std::sync::Arc;

    fn laplacian_system(n: usize) -> (DistributedMatrix, DistributedVector) {
        let partition = Arc::new(DofPartition::serial(n));
        let rows: Vec<Vec<usize>> = (0..n)
            .map(|i| {
                let mut cols = vec![i];
                if i > 0 {
                    cols.push(i - 1);
                }
                if i + 1 < n {
                    cols.push(i + 1);
                }
                cols.sort_unstable();
                cols
            })
            .collect();
        let mut a = DistributedMatrix::from_pattern(partition.clone(), &SparsityPattern { rows });
        for i in 0..n {
            a.add(i, i, 2.0).unwrap();
            if i > 0 {
                a.add(i, i - 1, -1.0).unwrap();
            }
            if i + 1 < n {
                a.add(i, i + 1, -1.0).unwrap();
            }
        }
        (a, DistributedVector::new(partition))
    }

    #[test]
    fn zero_rhs_short_circuits() {
        let (a, b) = laplacian_system(10);
        let mut x = b.clone();
        x.owned_values_mut()[3] = 7.0;
        let status = solve_cg(
            &NoComm,
            &SolverControl::new(100, 1e-10),
            &a,
            &b,
            &mut x,
        )
        .unwrap();
        assert!(status.converged);
        assert_eq!(status.iterations, 0);
        assert!(x.owned_values().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn solves_a_laplacian_to_tolerance() {
        let n = 64;
        let (a, mut b) = laplacian_system(n);
        for i in 0..n {
            b.set(i, 1.0).unwrap();
        }
        let mut x = DistributedVector::new(b.partition().clone());
        let status = solve_cg(&NoComm, &SolverControl::new(n, 1e-10), &a, &b, &mut x).unwrap();
        assert!(status.converged, "residual {}", status.residual);

        let mut ax = b.clone();
        x.ghost_update(&NoComm, 99).unwrap();
        a.matvec(&x, &mut ax).unwrap();
        for (l, r) in ax.owned_values().iter().zip(b.owned_values()) {
            assert!((l - r).abs() < 1e-8);
        }
    }

    #[test]
    fn reports_non_convergence_without_error() {
        let n = 64;
        let (a, mut b) = laplacian_system(n);
        for i in 0..n {
            b.set(i, 1.0).unwrap();
        }
        let mut x = DistributedVector::new(b.partition().clone());
        let status = solve_cg(&NoComm, &SolverControl::new(1, 1e-14), &a, &b, &mut x).unwrap();
        assert!(!status.converged);
        assert_eq!(status.iterations, 1);
    }
}
