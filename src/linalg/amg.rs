//! Algebraic multigrid preconditioner (smoothed aggregation).
//!
//! Built once per assembled matrix on the locally-owned diagonal block, so
//! across ranks the preconditioner acts as block-Jacobi-AMG while the outer
//! CG iteration stays global. One V-cycle per application: weighted-Jacobi
//! smoothing, piecewise-constant aggregates smoothed by a damped Jacobi
//! step, Galerkin coarse operators, dense LU on the coarsest level.

use hashbrown::HashMap;

/// Minimal local CSR matrix (square, local indices).
#[derive(Clone, Debug, Default)]
pub struct LocalCsr {
    /// Dimension.
    pub n: usize,
    /// Row offsets, length `n + 1`.
    pub row_ptr: Vec<usize>,
    /// Column indices.
    pub cols: Vec<usize>,
    /// Values.
    pub vals: Vec<f64>,
}

impl LocalCsr {
    /// `y = A x`.
    pub fn matvec(&self, x: &[f64], y: &mut [f64]) {
        for r in 0..self.n {
            let mut sum = 0.0;
            for k in self.row_ptr[r]..self.row_ptr[r + 1] {
                sum += self.vals[k] * x[self.cols[k]];
            }
            y[r] = sum;
        }
    }

    /// Diagonal entries (zero where absent).
    pub fn diagonal(&self) -> Vec<f64> {
        let mut d = vec![0.0; self.n];
        for r in 0..self.n {
            for k in self.row_ptr[r]..self.row_ptr[r + 1] {
                if self.cols[k] == r {
                    d[r] = self.vals[k];
                }
            }
        }
        d
    }

    fn from_rows(rows: Vec<Vec<(usize, f64)>>) -> Self {
        let n = rows.len();
        let mut row_ptr = Vec::with_capacity(n + 1);
        row_ptr.push(0);
        let mut cols = Vec::new();
        let mut vals = Vec::new();
        for mut row in rows {
            row.sort_unstable_by_key(|(c, _)| *c);
            for (c, v) in row {
                cols.push(c);
                vals.push(v);
            }
            row_ptr.push(cols.len());
        }
        Self {
            n,
            row_ptr,
            cols,
            vals,
        }
    }
}

const JACOBI_OMEGA: f64 = 2.0 / 3.0;
const STRENGTH_THETA: f64 = 0.08;
const COARSEST_SIZE: usize = 48;
const MAX_LEVELS: usize = 12;
const SMOOTH_SWEEPS: usize = 2;

struct Level {
    a: LocalCsr,
    diag_inv: Vec<f64>,
    /// Prolongation from the next-coarser level (rows = this level).
    p: Vec<Vec<(usize, f64)>>,
    n_coarse: usize,
}

/// Smoothed-aggregation AMG hierarchy over a local SPD block.
pub struct AmgPreconditioner {
    levels: Vec<Level>,
    coarse: DenseLu,
}

impl AmgPreconditioner {
    /// Build the hierarchy for `a`.
    pub fn build(mut a: LocalCsr) -> Self {
        let mut levels = Vec::new();
        while a.n > COARSEST_SIZE && levels.len() < MAX_LEVELS {
            let diag = a.diagonal();
            let aggregates = aggregate(&a, &diag);
            let n_coarse = aggregates.iter().copied().max().map_or(0, |m| m + 1);
            if n_coarse == 0 || n_coarse >= a.n {
                break; // aggregation stalled; stop coarsening
            }
            let p = smoothed_prolongation(&a, &diag, &aggregates);
            let coarse = galerkin_product(&a, &p, n_coarse);
            let diag_inv = diag
                .iter()
                .map(|&d| if d.abs() > 0.0 { 1.0 / d } else { 0.0 })
                .collect();
            levels.push(Level {
                a,
                diag_inv,
                p,
                n_coarse,
            });
            a = coarse;
        }
        let coarse = DenseLu::factor(&a);
        Self { levels, coarse }
    }

    /// Apply one V-cycle to `r`, returning `z ~ A^{-1} r`.
    pub fn apply(&self, r: &[f64]) -> Vec<f64> {
        self.vcycle(0, r)
    }

    fn vcycle(&self, level: usize, r: &[f64]) -> Vec<f64> {
        if level == self.levels.len() {
            return self.coarse.solve(r);
        }
        let lvl = &self.levels[level];
        let n = lvl.a.n;
        let mut x = vec![0.0; n];
        let mut scratch = vec![0.0; n];
        jacobi_sweeps(&lvl.a, &lvl.diag_inv, r, &mut x, &mut scratch, SMOOTH_SWEEPS);

        // Residual and restriction (P^T r).
        lvl.a.matvec(&x, &mut scratch);
        let mut coarse_r = vec![0.0; lvl.n_coarse];
        for i in 0..n {
            let res = r[i] - scratch[i];
            for &(c, w) in &lvl.p[i] {
                coarse_r[c] += w * res;
            }
        }
        let coarse_x = self.vcycle(level + 1, &coarse_r);
        for i in 0..n {
            for &(c, w) in &lvl.p[i] {
                x[i] += w * coarse_x[c];
            }
        }
        jacobi_sweeps(&lvl.a, &lvl.diag_inv, r, &mut x, &mut scratch, SMOOTH_SWEEPS);
        x
    }
}

fn jacobi_sweeps(
    a: &LocalCsr,
    diag_inv: &[f64],
    b: &[f64],
    x: &mut [f64],
    scratch: &mut [f64],
    sweeps: usize,
) {
    for _ in 0..sweeps {
        a.matvec(x, scratch);
        for i in 0..a.n {
            x[i] += JACOBI_OMEGA * diag_inv[i] * (b[i] - scratch[i]);
        }
    }
}

/// Greedy strength-based aggregation; returns the aggregate id per node.
fn aggregate(a: &LocalCsr, diag: &[f64]) -> Vec<usize> {
    let n = a.n;
    let strong = |r: usize, k: usize| -> bool {
        let c = a.cols[k];
        if c == r {
            return false;
        }
        let scale = (diag[r].abs() * diag[c].abs()).sqrt();
        scale > 0.0 && a.vals[k].abs() >= STRENGTH_THETA * scale
    };
    const UNSET: usize = usize::MAX;
    let mut agg = vec![UNSET; n];
    let mut next = 0;
    // Pass 1: roots with fully unaggregated strong neighborhoods.
    for r in 0..n {
        if agg[r] != UNSET {
            continue;
        }
        let range = a.row_ptr[r]..a.row_ptr[r + 1];
        let free = range.clone().all(|k| !strong(r, k) || agg[a.cols[k]] == UNSET);
        if !free {
            continue;
        }
        agg[r] = next;
        for k in range {
            if strong(r, k) {
                agg[a.cols[k]] = next;
            }
        }
        next += 1;
    }
    // Pass 2: attach leftovers to a strongly connected aggregate.
    for r in 0..n {
        if agg[r] != UNSET {
            continue;
        }
        for k in a.row_ptr[r]..a.row_ptr[r + 1] {
            if strong(r, k) && agg[a.cols[k]] != UNSET {
                agg[r] = agg[a.cols[k]];
                break;
            }
        }
    }
    // Pass 3: stragglers become singletons.
    for entry in agg.iter_mut() {
        if *entry == UNSET {
            *entry = next;
            next += 1;
        }
    }
    agg
}

/// `P = (I - omega D^-1 A) T` with piecewise-constant tentative `T`.
fn smoothed_prolongation(
    a: &LocalCsr,
    diag: &[f64],
    aggregates: &[usize],
) -> Vec<Vec<(usize, f64)>> {
    let mut p = Vec::with_capacity(a.n);
    for r in 0..a.n {
        let mut row: HashMap<usize, f64> = HashMap::new();
        row.insert(aggregates[r], 1.0);
        if diag[r].abs() > 0.0 {
            let scale = JACOBI_OMEGA / diag[r];
            for k in a.row_ptr[r]..a.row_ptr[r + 1] {
                *row.entry(aggregates[a.cols[k]]).or_insert(0.0) -= scale * a.vals[k];
            }
        }
        let mut row: Vec<(usize, f64)> = row
            .into_iter()
            .filter(|(_, w)| w.abs() > 1e-14)
            .collect();
        row.sort_unstable_by_key(|(c, _)| *c);
        p.push(row);
    }
    p
}

/// Galerkin triple product `P^T A P`.
fn galerkin_product(a: &LocalCsr, p: &[Vec<(usize, f64)>], n_coarse: usize) -> LocalCsr {
    let mut rows: Vec<HashMap<usize, f64>> = vec![HashMap::new(); n_coarse];
    for i in 0..a.n {
        // partial = (A P) row i
        let mut partial: HashMap<usize, f64> = HashMap::new();
        for k in a.row_ptr[i]..a.row_ptr[i + 1] {
            let j = a.cols[k];
            for &(c, w) in &p[j] {
                *partial.entry(c).or_insert(0.0) += a.vals[k] * w;
            }
        }
        for &(cr, wr) in &p[i] {
            for (&c, &v) in &partial {
                *rows[cr].entry(c).or_insert(0.0) += wr * v;
            }
        }
    }
    LocalCsr::from_rows(
        rows.into_iter()
            .map(|row| row.into_iter().collect())
            .collect(),
    )
}

/// Dense LU with partial pivoting for the coarsest level.
struct DenseLu {
    n: usize,
    lu: Vec<f64>,
    pivots: Vec<usize>,
}

impl DenseLu {
    fn factor(a: &LocalCsr) -> Self {
        let n = a.n;
        let mut lu = vec![0.0; n * n];
        for r in 0..n {
            for k in a.row_ptr[r]..a.row_ptr[r + 1] {
                lu[r * n + a.cols[k]] = a.vals[k];
            }
        }
        let mut pivots: Vec<usize> = (0..n).collect();
        for col in 0..n {
            // Partial pivot.
            let mut best = col;
            for r in (col + 1)..n {
                if lu[r * n + col].abs() > lu[best * n + col].abs() {
                    best = r;
                }
            }
            if best != col {
                pivots.swap(col, best);
                for c in 0..n {
                    lu.swap(col * n + c, best * n + c);
                }
            }
            let pivot = lu[col * n + col];
            if pivot.abs() < 1e-300 {
                continue; // singular column; leave as-is
            }
            for r in (col + 1)..n {
                let factor = lu[r * n + col] / pivot;
                lu[r * n + col] = factor;
                for c in (col + 1)..n {
                    lu[r * n + c] -= factor * lu[col * n + c];
                }
            }
        }
        Self { n, lu, pivots }
    }

    fn solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.n;
        let mut x: Vec<f64> = self.pivots.iter().map(|&p| b[p]).collect();
        for r in 1..n {
            for c in 0..r {
                x[r] -= self.lu[r * n + c] * x[c];
            }
        }
        for r in (0..n).rev() {
            for c in (r + 1)..n {
                x[r] -= self.lu[r * n + c] * x[c];
            }
            let d = self.lu[r * n + r];
            if d.abs() > 1e-300 {
                x[r] /= d;
            }
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 1-D Laplacian tridiagonal matrix of size n.
    fn laplacian(n: usize) -> LocalCsr {
        let mut rows = Vec::with_capacity(n);
        for i in 0..n {
            let mut row = vec![(i, 2.0)];
            if i > 0 {
                row.push((i - 1, -1.0));
            }
            if i + 1 < n {
                row.push((i + 1, -1.0));
            }
            rows.push(row);
        }
        LocalCsr::from_rows(rows)
    }

    #[test]
    fn dense_lu_solves_small_system() {
        let a = laplacian(5);
        let lu = DenseLu::factor(&a);
        let b = vec![1.0; 5];
        let x = lu.solve(&b);
        let mut ax = vec![0.0; 5];
        a.matvec(&x, &mut ax);
        for (l, r) in ax.iter().zip(b.iter()) {
            assert!((l - r).abs() < 1e-10);
        }
    }

    #[test]
    fn vcycle_reduces_the_residual() {
        let n = 200;
        let a = laplacian(n);
        let amg = AmgPreconditioner::build(a.clone());
        let b = vec![1.0; n];
        // One preconditioned Richardson step must shrink the residual.
        let x = amg.apply(&b);
        let mut ax = vec![0.0; n];
        a.matvec(&x, &mut ax);
        let r0: f64 = b.iter().map(|v| v * v).sum::<f64>().sqrt();
        let r1: f64 = b
            .iter()
            .zip(ax.iter())
            .map(|(bi, ai)| (bi - ai) * (bi - ai))
            .sum::<f64>()
            .sqrt();
        assert!(r1 < r0);
    }

    #[test]
    fn hierarchy_coarsens_below_the_direct_threshold() {
        let amg = AmgPreconditioner::build(laplacian(500));
        assert!(!amg.levels.is_empty());
        assert!(amg.coarse.n <= 500);
    }
}
