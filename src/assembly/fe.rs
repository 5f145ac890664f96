//! Multilinear finite-element kernel: Gauss quadrature, shape functions on
//! the `[-1, 1]^d` reference cell (binary corner ordering) and the
//! isoparametric cell mapping with its Newton inverse.

use crate::error::GwError;

/// 1-D Gauss-Legendre rule on `[-1, 1]`.
pub fn gauss_1d(order: usize) -> (Vec<f64>, Vec<f64>) {
    match order {
        1 => (vec![0.0], vec![2.0]),
        2 => {
            let a = 1.0 / 3.0f64.sqrt();
            (vec![-a, a], vec![1.0, 1.0])
        }
        _ => {
            // 3-point rule; orders above three are not needed here.
            let a = (3.0 / 5.0f64).sqrt();
            (vec![-a, 0.0, a], vec![5.0 / 9.0, 8.0 / 9.0, 5.0 / 9.0])
        }
    }
}

/// Tensor-product quadrature over `[-1, 1]^d`.
pub struct TensorRule {
    /// Quadrature points, `d` coordinates each.
    pub points: Vec<Vec<f64>>,
    /// Matching weights.
    pub weights: Vec<f64>,
}

impl TensorRule {
    pub fn new(d: usize, order: usize) -> Self {
        let (p1, w1) = gauss_1d(order);
        let n = p1.len();
        let total = n.pow(d as u32);
        let mut points = Vec::with_capacity(total);
        let mut weights = Vec::with_capacity(total);
        for flat in 0..total {
            let mut point = Vec::with_capacity(d);
            let mut weight = 1.0;
            let mut rest = flat;
            for _ in 0..d {
                let k = rest % n;
                rest /= n;
                point.push(p1[k]);
                weight *= w1[k];
            }
            points.push(point);
            weights.push(weight);
        }
        Self { points, weights }
    }
}

fn corner_sign(corner: usize, axis: usize) -> f64 {
    if (corner >> axis) & 1 == 1 { 1.0 } else { -1.0 }
}

/// Value of shape function `i` at reference point `xi`.
pub fn shape_value(d: usize, i: usize, xi: &[f64]) -> f64 {
    (0..d)
        .map(|a| 0.5 * (1.0 + corner_sign(i, a) * xi[a]))
        .product()
}

/// Reference-space gradient of shape function `i` at `xi`.
pub fn shape_grad(d: usize, i: usize, xi: &[f64]) -> Vec<f64> {
    (0..d)
        .map(|g| {
            (0..d)
                .map(|a| {
                    if a == g {
                        0.5 * corner_sign(i, a)
                    } else {
                        0.5 * (1.0 + corner_sign(i, a) * xi[a])
                    }
                })
                .product()
        })
        .collect()
}

/// Isoparametric mapping of a `d`-cube element embedded in up to three
/// spatial dimensions. Corners in binary ordering.
pub struct CellMapping {
    /// Reference dimension (2 for quads, 3 for hexes, 1 for edges).
    pub d: usize,
    /// Spatial dimension of the corner coordinates.
    pub spatial: usize,
    corners: Vec<[f64; 3]>,
}

impl CellMapping {
    pub fn new(d: usize, spatial: usize, corners: Vec<[f64; 3]>) -> Self {
        debug_assert_eq!(corners.len(), 1 << d);
        Self {
            d,
            spatial,
            corners,
        }
    }

    /// Physical location of reference point `xi`.
    pub fn map(&self, xi: &[f64]) -> [f64; 3] {
        let mut x = [0.0; 3];
        for (i, c) in self.corners.iter().enumerate() {
            let n = shape_value(self.d, i, xi);
            for s in 0..self.spatial {
                x[s] += n * c[s];
            }
        }
        x
    }

    /// Jacobian `dx/dxi` as a `spatial x d` matrix (row-major in a 3x3).
    pub fn jacobian(&self, xi: &[f64]) -> [[f64; 3]; 3] {
        let mut j = [[0.0; 3]; 3];
        for (i, c) in self.corners.iter().enumerate() {
            let grad = shape_grad(self.d, i, xi);
            for s in 0..self.spatial {
                for (g, dg) in grad.iter().enumerate() {
                    j[s][g] += dg * c[s];
                }
            }
        }
        j
    }

    /// Volume (or area) element at `xi`. For `d == spatial` this is
    /// `|det J|`; for a face embedded one dimension up it is the Gram
    /// measure `sqrt(det(J^T J))`.
    pub fn measure(&self, xi: &[f64]) -> f64 {
        let j = self.jacobian(xi);
        if self.d == self.spatial {
            det(self.d, &j).abs()
        } else {
            let mut g = [[0.0; 3]; 3];
            for a in 0..self.d {
                for b in 0..self.d {
                    g[a][b] = (0..self.spatial).map(|s| j[s][a] * j[s][b]).sum();
                }
            }
            det(self.d, &g).max(0.0).sqrt()
        }
    }

    /// Physical-space shape gradients at `xi` (only for `d == spatial`).
    pub fn physical_gradients(&self, xi: &[f64]) -> Result<Vec<[f64; 3]>, GwError> {
        let j = self.jacobian(xi);
        let j_inv = invert(self.d, &j).ok_or_else(|| {
            GwError::InvalidGeometry("degenerate cell jacobian".to_string())
        })?;
        let mut grads = Vec::with_capacity(self.corners.len());
        for i in 0..self.corners.len() {
            let ref_grad = shape_grad(self.d, i, xi);
            let mut g = [0.0; 3];
            // grad_x N = J^{-T} grad_xi N
            for s in 0..self.d {
                for (a, rg) in ref_grad.iter().enumerate() {
                    g[s] += j_inv[a][s] * rg;
                }
            }
            grads.push(g);
        }
        Ok(grads)
    }

    /// Newton inversion of the mapping; `None` if the iteration leaves the
    /// reference cell by a wide margin or stalls.
    pub fn inverse_map(&self, x: &[f64; 3]) -> Option<Vec<f64>> {
        let mut xi = vec![0.0; self.d];
        for _ in 0..30 {
            let fx = self.map(&xi);
            let mut res = [0.0; 3];
            let mut norm: f64 = 0.0;
            for s in 0..self.d.min(self.spatial) {
                res[s] = x[s] - fx[s];
                norm = norm.max(res[s].abs());
            }
            if norm < 1e-12 {
                return if xi.iter().all(|v| v.abs() <= 1.0 + 1e-8) {
                    Some(xi)
                } else {
                    None
                };
            }
            let j = self.jacobian(&xi);
            let j_inv = invert(self.d, &j)?;
            for a in 0..self.d {
                let mut step = 0.0;
                for s in 0..self.d {
                    step += j_inv[a][s] * res[s];
                }
                xi[a] += step;
                if xi[a].abs() > 10.0 {
                    return None;
                }
            }
        }
        None
    }
}

/// Determinant of the leading `d x d` block.
pub fn det(d: usize, m: &[[f64; 3]; 3]) -> f64 {
    match d {
        1 => m[0][0],
        2 => m[0][0] * m[1][1] - m[0][1] * m[1][0],
        _ => {
            m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
                - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
                + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
        }
    }
}

/// Inverse of the leading `d x d` block, if nonsingular.
pub fn invert(d: usize, m: &[[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let determinant = det(d, m);
    if determinant.abs() < 1e-300 {
        return None;
    }
    let mut inv = [[0.0; 3]; 3];
    match d {
        1 => inv[0][0] = 1.0 / determinant,
        2 => {
            inv[0][0] = m[1][1] / determinant;
            inv[0][1] = -m[0][1] / determinant;
            inv[1][0] = -m[1][0] / determinant;
            inv[1][1] = m[0][0] / determinant;
        }
        _ => {
            for r in 0..3 {
                for c in 0..3 {
                    let r1 = (r + 1) % 3;
                    let r2 = (r + 2) % 3;
                    let c1 = (c + 1) % 3;
                    let c2 = (c + 2) % 3;
                    // Transposed cofactor.
                    inv[c][r] = (m[r1][c1] * m[r2][c2] - m[r1][c2] * m[r2][c1]) / determinant;
                }
            }
        }
    }
    Some(inv)
}
