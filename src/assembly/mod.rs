//! Stiffness-matrix and right-hand-side assembly.
//!
//! Element integrals use a 2-point Gauss tensor rule with multilinear shape
//! functions. Surface recharge enters on the configured top-boundary faces,
//! scaled by the projected-to-true area ratio so rates given per horizontal
//! area stay volumetrically correct on sloped surfaces. Stream and well
//! sources accumulate into the RHS before the collective compress; every
//! local contribution is scattered through the constraint set.

pub mod fe;

use crate::comm::Communicator;
use crate::dofs::DofSetup;
use crate::error::GwError;
use crate::geometry::polygon_area;
use crate::linalg::{DistributedMatrix, DistributedVector};
use crate::mesh::{Dim, Mesh, TopBoundary};
use crate::streams::StreamRechargeEngine;

use fe::{CellMapping, TensorRule, shape_value};

const TAG_MATRIX_COMPRESS: u16 = 30;
const TAG_RHS_COMPRESS: u16 = 32;

/// Principal (diagonal) hydraulic conductivity sampled pointwise.
pub trait ConductivityField: Send + Sync {
    fn conductivity(&self, p: &[f64; 3]) -> [f64; 3];
}

/// Homogeneous isotropic conductivity.
pub struct IsotropicConductivity(pub f64);

impl ConductivityField for IsotropicConductivity {
    fn conductivity(&self, _p: &[f64; 3]) -> [f64; 3] {
        [self.0; 3]
    }
}

/// Diffuse surface recharge rate per unit horizontal area.
pub trait RechargeField: Send + Sync {
    fn rate(&self, p: &[f64; 3]) -> f64;
}

/// Spatially uniform recharge.
pub struct UniformRecharge(pub f64);

impl RechargeField for UniformRecharge {
    fn rate(&self, _p: &[f64; 3]) -> f64 {
        self.0
    }
}

/// Point-source collaborator. Implementations scatter their pumping or
/// injection rates into the RHS; the orchestrator calls this once per
/// assembly, before compress.
pub trait WellSource {
    fn add_contributions(
        &self,
        mesh: &Mesh,
        setup: &DofSetup,
        rhs: &mut DistributedVector,
    ) -> Result<(), GwError>;
}

/// No wells.
pub struct NoWells;

impl WellSource for NoWells {
    fn add_contributions(
        &self,
        _mesh: &Mesh,
        _setup: &DofSetup,
        _rhs: &mut DistributedVector,
    ) -> Result<(), GwError> {
        Ok(())
    }
}

/// A pumping (negative rate) or injection (positive rate) well.
#[derive(Clone, Copy, Debug)]
pub struct Well {
    pub location: [f64; 3],
    pub rate: f64,
}

/// Point wells located by Newton-inverting the cell mapping; the rate is
/// distributed over the containing cell's DOFs by shape-function weights.
pub struct PointWells {
    pub wells: Vec<Well>,
}

impl WellSource for PointWells {
    fn add_contributions(
        &self,
        mesh: &Mesh,
        setup: &DofSetup,
        rhs: &mut DistributedVector,
    ) -> Result<(), GwError> {
        let d = mesh.dim().spatial();
        for well in &self.wells {
            // The topology is replicated, so scanning all active cells in id
            // order lands a well that sits exactly on a shared face in the
            // same cell on every rank. Only that cell's owner injects the
            // rate, so it enters the system exactly once.
            let mut placed = false;
            for c in mesh.active_cells() {
                let corners = mesh.cell_corner_coords(c);
                let mapping = CellMapping::new(d, d, corners);
                let Some(xi) = mapping.inverse_map(&well.location) else {
                    continue;
                };
                placed = true;
                if mesh.cell(c).owner == setup.partition.rank {
                    let dofs: Vec<usize> = mesh
                        .cell(c)
                        .vertices
                        .iter()
                        .map(|v| setup.dof_of_vertex[v])
                        .collect();
                    let local: Vec<f64> = (0..dofs.len())
                        .map(|i| well.rate * shape_value(d, i, &xi))
                        .collect();
                    setup.constraints.distribute_local_rhs(&local, &dofs, rhs)?;
                }
                break;
            }
            if !placed {
                log::debug!(
                    "well at ({:.3}, {:.3}, {:.3}) not inside any active cell",
                    well.location[0],
                    well.location[1],
                    well.location[2]
                );
            }
        }
        Ok(())
    }
}

/// Projected-to-true area ratio of a ring-ordered boundary face.
///
/// 1.0 for horizontal faces, approaching 0 as the face turns vertical.
pub fn recharge_weight(face: &[[f64; 3]]) -> f64 {
    match face.len() {
        2 => {
            let dx = face[1][0] - face[0][0];
            let len = ((face[1][0] - face[0][0]).powi(2) + (face[1][1] - face[0][1]).powi(2))
                .sqrt();
            if len > 0.0 { dx.abs() / len } else { 0.0 }
        }
        _ => {
            let footprint: Vec<[f64; 2]> = face.iter().map(|p| [p[0], p[1]]).collect();
            let projected = polygon_area(&footprint);
            let mut true_area = 0.0;
            // Fan triangulation of the (near-planar) ring.
            for i in 1..face.len() - 1 {
                let u = sub(&face[i], &face[0]);
                let v = sub(&face[i + 1], &face[0]);
                let cx = u[1] * v[2] - u[2] * v[1];
                let cy = u[2] * v[0] - u[0] * v[2];
                let cz = u[0] * v[1] - u[1] * v[0];
                true_area += 0.5 * (cx * cx + cy * cy + cz * cz).sqrt();
            }
            if true_area > 0.0 {
                projected / true_area
            } else {
                0.0
            }
        }
    }
}

fn sub(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

/// Local corner indices of a face in binary (shape-function) ordering.
fn binary_face_locals(dim: Dim, face: usize) -> Vec<usize> {
    let ring = Mesh::face_corner_locals(dim, face);
    match ring.len() {
        4 => vec![ring[0], ring[1], ring[3], ring[2]],
        _ => ring,
    }
}

/// Assemble the stiffness matrix and RHS over the locally-owned cells and
/// run the collective compress. `matrix` and `rhs` must be freshly built
/// from the setup's pattern.
#[allow(clippy::too_many_arguments)]
pub fn assemble<C: Communicator>(
    comm: &C,
    mesh: &Mesh,
    setup: &DofSetup,
    conductivity: &dyn ConductivityField,
    recharge: &dyn RechargeField,
    top: &TopBoundary,
    streams: Option<&StreamRechargeEngine>,
    wells: &dyn WellSource,
    matrix: &mut DistributedMatrix,
    rhs: &mut DistributedVector,
) -> Result<(), GwError> {
    let d = mesh.dim().spatial();
    let rule = TensorRule::new(d, 2);
    let face_rule = TensorRule::new(d - 1, 2);

    for c in mesh.owned_cells(setup.partition.rank) {
        let corners = mesh.cell_corner_coords(c);
        let n = corners.len();
        let mapping = CellMapping::new(d, d, corners.clone());
        let dofs: Vec<usize> = mesh
            .cell(c)
            .vertices
            .iter()
            .map(|v| setup.dof_of_vertex[v])
            .collect();

        let mut local = vec![0.0; n * n];
        let mut local_rhs = vec![0.0; n];

        for (xi, &w) in rule.points.iter().zip(rule.weights.iter()) {
            let x = mapping.map(xi);
            let grads = mapping.physical_gradients(xi)?;
            let k = conductivity.conductivity(&x);
            let jxw = w * mapping.measure(xi);
            for i in 0..n {
                for j in 0..n {
                    let mut flux = 0.0;
                    for a in 0..d {
                        flux += k[a] * grads[i][a] * grads[j][a];
                    }
                    local[i * n + j] += flux * jxw;
                }
            }
        }

        for face in 0..mesh.dim().faces_per_cell() {
            if !mesh.boundary_tag(c, face).is_some_and(|t| top.contains(t)) {
                continue;
            }
            let locals = binary_face_locals(mesh.dim(), face);
            let face_corners: Vec<[f64; 3]> = locals.iter().map(|&l| corners[l]).collect();
            let face_map = CellMapping::new(d - 1, d, face_corners.clone());
            let weight = recharge_weight(&mesh.face_coords(c, face));

            if weight > 0.0 {
                for (xi, &w) in face_rule.points.iter().zip(face_rule.weights.iter()) {
                    let x = face_map.map(xi);
                    let rate = recharge.rate(&x);
                    if rate == 0.0 {
                        continue;
                    }
                    let jxw = w * face_map.measure(xi) * weight;
                    for (i, &l) in locals.iter().enumerate() {
                        local_rhs[l] += rate * shape_value(d - 1, i, xi) * jxw;
                    }
                }
            }

            if let Some(engine) = streams {
                let horizontal: Vec<[f64; 3]> = face_corners
                    .iter()
                    .map(|p| [p[0], p[1], 0.0])
                    .collect();
                let horizontal_map = CellMapping::new(d - 1, 2, horizontal);
                for contribution in engine.recharge(&mesh.face_footprint(c, face)) {
                    let target = [contribution.centroid[0], contribution.centroid[1], 0.0];
                    match horizontal_map.inverse_map(&target) {
                        Some(xi) => {
                            for (i, &l) in locals.iter().enumerate() {
                                local_rhs[l] +=
                                    contribution.weighted_rate * shape_value(d - 1, i, &xi);
                            }
                        }
                        None => log::warn!(
                            "stream centroid ({:.3}, {:.3}) fell outside its face, skipped",
                            contribution.centroid[0],
                            contribution.centroid[1]
                        ),
                    }
                }
            }
        }

        setup
            .constraints
            .distribute_local_to_global(&local, &local_rhs, &dofs, matrix, rhs)?;
    }

    wells.add_contributions(mesh, setup, rhs)?;
    matrix.compress(comm, TAG_MATRIX_COMPRESS)?;
    rhs.compress(comm, TAG_RHS_COMPRESS)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoComm;
    use crate::dofs::{DirichletSpec, DofField};

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
    fn recharge_weight_is_one_for_horizontal_faces() {
        let face = [
            [0.0, 0.0, 5.0],
            [1.0, 0.0, 5.0],
            [1.0, 1.0, 5.0],
            [0.0, 1.0, 5.0],
        ];
        assert!((recharge_weight(&face) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn recharge_weight_shrinks_on_sloped_faces() {
        // 45-degree slope: projection is area / sqrt(2).
        let face = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 1.0],
            [1.0, 1.0, 1.0],
            [0.0, 1.0, 0.0],
        ];
        let w = recharge_weight(&face);
        assert!((w - 1.0 / 2.0f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn recharge_weight_vanishes_on_vertical_edges() {
        let face = [[0.0, 0.0, 0.0], [0.0, 3.0, 0.0]];
        assert!(recharge_weight(&face).abs() < 1e-12);
    }

    #[test]
    fn assembled_laplacian_matches_hand_computed_stencil() {
        // One unit cell, unit conductivity: the element matrix of the
        // bilinear Laplacian has 2/3 on the diagonal.
        let mesh = unit_square(1);
        let setup = DofField::setup(&mesh, &DirichletSpec::new(), 0).unwrap();
        let mut matrix =
            DistributedMatrix::from_pattern(setup.partition.clone(), &setup.pattern);
        let mut rhs = DistributedVector::new(setup.partition.clone());
        assemble(
            &NoComm,
            &mesh,
            &setup,
            &IsotropicConductivity(1.0),
            &UniformRecharge(0.0),
            &TopBoundary(vec![]),
            None,
            &NoWells,
            &mut matrix,
            &mut rhs,
        )
        .unwrap();
        let diag = matrix.owned_diagonal();
        for v in diag {
            assert!((v - 2.0 / 3.0).abs() < 1e-12);
        }
    }

    #[test]
    fn uniform_recharge_integrates_to_surface_area_times_rate() {
        let mesh = unit_square(2);
        let setup = DofField::setup(&mesh, &DirichletSpec::new(), 0).unwrap();
        let mut matrix =
            DistributedMatrix::from_pattern(setup.partition.clone(), &setup.pattern);
        let mut rhs = DistributedVector::new(setup.partition.clone());
        let top = TopBoundary::box_mesh_default(Dim::Two);
        assemble(
            &NoComm,
            &mesh,
            &setup,
            &IsotropicConductivity(1.0),
            &UniformRecharge(4.0),
            &top,
            None,
            &NoWells,
            &mut matrix,
            &mut rhs,
        )
        .unwrap();
        // Top boundary is the unit-length y = 1 edge; total inflow 4.0.
        let total: f64 = rhs.owned_values().iter().sum();
        assert!((total - 4.0).abs() < 1e-12, "total inflow {total}");
    }

    #[test]
    fn point_well_deposits_its_full_rate() {
        let mesh = unit_square(2);
        let setup = DofField::setup(&mesh, &DirichletSpec::new(), 0).unwrap();
        let mut rhs = DistributedVector::new(setup.partition.clone());
        let wells = PointWells {
            wells: vec![Well {
                location: [0.3, 0.7, 0.0],
                rate: -50.0,
            }],
        };
        wells.add_contributions(&mesh, &setup, &mut rhs).unwrap();
        let total: f64 = rhs.owned_values().iter().sum();
        assert!((total + 50.0).abs() < 1e-9);
    }
}
