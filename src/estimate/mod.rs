//! Face-jump error estimation and fixed-fraction marking.
//!
//! The indicator is the classic flux-jump estimator: for each active cell,
//! the squared jump of the normal conductivity flux across its faces,
//! integrated with a face quadrature one order higher than the solve and
//! scaled by `h / 24`. Neighbors are found by point location of a nudged
//! face centroid, which handles level differences without explicit face
//! adjacency. Owned-cell indicators are exchanged so every rank marks from
//! the same global picture.

use hashbrown::HashMap;

use crate::assembly::ConductivityField;
use crate::assembly::fe::{CellMapping, TensorRule};
use crate::comm::{Communicator, exchange_records};
use crate::dofs::DofSetup;
use crate::error::GwError;
use crate::linalg::DistributedVector;
use crate::mesh::{CellId, Mesh, VertexId};

const TAG_ERROR_SYNC: u16 = 50;

/// Wire record for indicator synchronization.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct ErrorRecord {
    cell: u64,
    error: f64,
}

/// Per-active-cell error indicators, in `Mesh::active_cells` order and
/// identical on every rank after the collective exchange.
pub fn estimate<C: Communicator>(
    comm: &C,
    mesh: &Mesh,
    setup: &DofSetup,
    conductivity: &dyn ConductivityField,
    solution: &DistributedVector,
) -> Result<Vec<f64>, GwError> {
    let active: Vec<CellId> = mesh.active_cells().collect();
    let slot: HashMap<CellId, usize> = active.iter().enumerate().map(|(i, &c)| (c, i)).collect();
    let incidence = mesh.active_vertex_cells();
    let rank = setup.partition.rank;

    let mut errors = vec![0.0; active.len()];
    for &c in &active {
        if mesh.cell(c).owner != rank {
            continue;
        }
        errors[slot[&c]] = cell_indicator(mesh, setup, conductivity, solution, &incidence, c)?;
    }

    // Ship owned indicators everywhere so marking is deterministic.
    if comm.size() > 1 {
        let mine: Vec<ErrorRecord> = active
            .iter()
            .filter(|&&c| mesh.cell(c).owner == rank)
            .map(|&c| ErrorRecord {
                cell: c as u64,
                error: errors[slot[&c]],
            })
            .collect();
        let mut outgoing: HashMap<usize, Vec<ErrorRecord>> = HashMap::new();
        for peer in 0..comm.size() {
            if peer != rank {
                outgoing.insert(peer, mine.clone());
            }
        }
        for (_, records) in exchange_records(comm, TAG_ERROR_SYNC, &outgoing)? {
            for r in records {
                if let Some(&i) = slot.get(&(r.cell as CellId)) {
                    errors[i] = r.error;
                }
            }
        }
    }
    Ok(errors)
}

fn cell_indicator(
    mesh: &Mesh,
    setup: &DofSetup,
    conductivity: &dyn ConductivityField,
    solution: &DistributedVector,
    incidence: &HashMap<VertexId, Vec<CellId>>,
    c: CellId,
) -> Result<f64, GwError> {
    let d = mesh.dim().spatial();
    // One order above the 2-point assembly rule.
    let face_rule = TensorRule::new(d - 1, 3);
    let mut indicator = 0.0;

    for face in 0..mesh.dim().faces_per_cell() {
        if mesh.boundary_tag(c, face).is_some() {
            continue;
        }
        let ring = mesh.face_coords(c, face);
        let locals = binary_ring(ring.len());
        let face_corners: Vec<[f64; 3]> = locals.iter().map(|&i| ring[i]).collect();
        let face_map = CellMapping::new(d - 1, d, face_corners);
        let normal = outward_normal(mesh, c, face, d);
        let h = face_diameter(&ring);

        // Nudge the centroid outward and locate the active cell there.
        let centroid = face_map.map(&vec![0.0; d - 1]);
        let eps = 1e-6 * mesh.cell_diameter(c).max(1e-12);
        let probe = [
            centroid[0] + eps * normal[0],
            centroid[1] + eps * normal[1],
            centroid[2] + eps * normal[2],
        ];
        let Some(neighbor) = locate_neighbor(mesh, incidence, c, face, &probe) else {
            continue;
        };

        let mut face_sum = 0.0;
        for (xi, &w) in face_rule.points.iter().zip(face_rule.weights.iter()) {
            let x = face_map.map(xi);
            let own = normal_flux(mesh, setup, conductivity, solution, c, &x, &normal)?;
            let other = normal_flux(mesh, setup, conductivity, solution, neighbor, &x, &normal)?;
            let (Some(own), Some(other)) = (own, other) else {
                continue;
            };
            let jump = own - other;
            face_sum += w * face_map.measure(xi) * jump * jump;
        }
        indicator += h / 24.0 * face_sum;
    }
    Ok(indicator.sqrt())
}

/// Conductivity-weighted normal derivative of the head field at `x`,
/// evaluated from `cell`'s interior. `None` when `x` maps outside the cell
/// (quadrature point beyond a half-size neighbor face).
fn normal_flux(
    mesh: &Mesh,
    setup: &DofSetup,
    conductivity: &dyn ConductivityField,
    solution: &DistributedVector,
    cell: CellId,
    x: &[f64; 3],
    normal: &[f64; 3],
) -> Result<Option<f64>, GwError> {
    let d = mesh.dim().spatial();
    let mapping = CellMapping::new(d, d, mesh.cell_corner_coords(cell));
    let Some(xi) = mapping.inverse_map(x) else {
        return Ok(None);
    };
    let grads = mapping.physical_gradients(&xi)?;
    let k = conductivity.conductivity(x);
    let mut flux = 0.0;
    for (i, v) in mesh.cell(cell).vertices.iter().enumerate() {
        let u = solution.get(setup.dof_of_vertex[v])?;
        for a in 0..d {
            flux += u * k[a] * grads[i][a] * normal[a];
        }
    }
    Ok(Some(flux))
}

fn binary_ring(len: usize) -> Vec<usize> {
    match len {
        4 => vec![0, 1, 3, 2],
        n => (0..n).collect(),
    }
}

/// Outward unit normal of an axis face, oriented away from the cell center.
fn outward_normal(mesh: &Mesh, c: CellId, face: usize, d: usize) -> [f64; 3] {
    let ring = mesh.face_coords(c, face);
    let mut n = if d == 2 {
        let t = [ring[1][0] - ring[0][0], ring[1][1] - ring[0][1]];
        [t[1], -t[0], 0.0]
    } else {
        let u = [
            ring[1][0] - ring[0][0],
            ring[1][1] - ring[0][1],
            ring[1][2] - ring[0][2],
        ];
        let v = [
            ring[3][0] - ring[0][0],
            ring[3][1] - ring[0][1],
            ring[3][2] - ring[0][2],
        ];
        [
            u[1] * v[2] - u[2] * v[1],
            u[2] * v[0] - u[0] * v[2],
            u[0] * v[1] - u[1] * v[0],
        ]
    };
    let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
    if len > 0.0 {
        for a in &mut n {
            *a /= len;
        }
    }
    // Flip toward the face if it points back into the cell.
    let center = mesh.cell_center(c);
    let to_face: Vec<f64> = (0..3).map(|a| ring[0][a] - center[a]).collect();
    if n[0] * to_face[0] + n[1] * to_face[1] + n[2] * to_face[2] < 0.0 {
        for a in &mut n {
            *a = -*a;
        }
    }
    n
}

fn face_diameter(ring: &[[f64; 3]]) -> f64 {
    let mut best: f64 = 0.0;
    for i in 0..ring.len() {
        for j in (i + 1)..ring.len() {
            let d2: f64 = (0..3).map(|a| (ring[i][a] - ring[j][a]).powi(2)).sum();
            best = best.max(d2.sqrt());
        }
    }
    best
}

/// The active cell on the far side of `face`, found among cells incident to
/// the face corners. `None` for domain-boundary faces.
fn locate_neighbor(
    mesh: &Mesh,
    incidence: &HashMap<VertexId, Vec<CellId>>,
    c: CellId,
    face: usize,
    probe: &[f64; 3],
) -> Option<CellId> {
    let d = mesh.dim().spatial();
    for v in mesh.face_vertices(c, face) {
        let candidates = incidence.get(&v)?;
        for &other in candidates {
            if other == c {
                continue;
            }
            let mapping = CellMapping::new(d, d, mesh.cell_corner_coords(other));
            if mapping.inverse_map(probe).is_some() {
                return Some(other);
            }
        }
    }
    None
}

/// Flag the `top_fraction` highest-error active cells for refinement and the
/// `bottom_fraction` lowest for coarsening. Marking only; the caller runs
/// the mesh transaction.
pub fn refine_and_coarsen_fixed_number(
    mesh: &mut Mesh,
    errors: &[f64],
    top_fraction: f64,
    bottom_fraction: f64,
) -> Result<(), GwError> {
    let active: Vec<CellId> = mesh.active_cells().collect();
    if errors.len() != active.len() {
        return Err(GwError::Adaptation(format!(
            "{} indicators for {} active cells",
            errors.len(),
            active.len()
        )));
    }
    let mut order: Vec<usize> = (0..active.len()).collect();
    order.sort_by(|&a, &b| {
        errors[b]
            .partial_cmp(&errors[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let n_refine = (active.len() as f64 * top_fraction).round() as usize;
    let n_coarsen = (active.len() as f64 * bottom_fraction).round() as usize;
    for &i in order.iter().take(n_refine) {
        mesh.flag_for_refinement(active[i]);
    }
    // A refine flag always wins over a coarsen flag.
    for &i in order.iter().rev().take(n_coarsen.min(active.len() - n_refine)) {
        mesh.flag_for_coarsening(active[i]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::IsotropicConductivity;
    use crate::comm::NoComm;
    use crate::dofs::{DirichletSpec, DofField};
    use crate::mesh::Dim;

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
    fn linear_field_has_zero_indicators() {
        let mesh = unit_square(3);
        let setup = DofField::setup(&mesh, &DirichletSpec::new(), 0).unwrap();
        let mut solution = DistributedVector::new(setup.partition.clone());
        for (d, &v) in setup.vertex_of_dof.iter().enumerate() {
            let p = mesh.vertex(v);
            solution.set(d, 2.0 * p[0] - p[1]).unwrap();
        }
        let errors = estimate(
            &NoComm,
            &mesh,
            &setup,
            &IsotropicConductivity(1.0),
            &solution,
        )
        .unwrap();
        for e in errors {
            assert!(e.abs() < 1e-9);
        }
    }

    #[test]
    fn kinked_field_flags_the_kink() {
        let mesh = unit_square(4);
        let setup = DofField::setup(&mesh, &DirichletSpec::new(), 0).unwrap();
        let mut solution = DistributedVector::new(setup.partition.clone());
        // Gradient jump along x = 0.5.
        for (d, &v) in setup.vertex_of_dof.iter().enumerate() {
            let p = mesh.vertex(v);
            let u = if p[0] <= 0.5 { p[0] } else { 0.5 + 3.0 * (p[0] - 0.5) };
            solution.set(d, u).unwrap();
        }
        let errors = estimate(
            &NoComm,
            &mesh,
            &setup,
            &IsotropicConductivity(1.0),
            &solution,
        )
        .unwrap();
        let active: Vec<CellId> = mesh.active_cells().collect();
        let max = errors.iter().cloned().fold(0.0, f64::max);
        assert!(max > 0.0);
        for (i, &c) in active.iter().enumerate() {
            let touches_kink = (mesh.cell_center(c)[0] - 0.5).abs() < 0.2;
            if errors[i] > 0.5 * max {
                assert!(touches_kink);
            }
        }
    }

    #[test]
    fn fixed_number_marks_the_requested_fractions() {
        let mut mesh = unit_square(4);
        let n = mesh.n_active_cells();
        let errors: Vec<f64> = (0..n).map(|i| i as f64).collect();
        refine_and_coarsen_fixed_number(&mut mesh, &errors, 0.25, 0.25).unwrap();
        let active: Vec<CellId> = mesh.active_cells().collect();
        let refined = active
            .iter()
            .filter(|&&c| matches!(mesh.cell(c).flag, crate::mesh::RefineFlag::Refine))
            .count();
        let coarsened = active
            .iter()
            .filter(|&&c| matches!(mesh.cell(c).flag, crate::mesh::RefineFlag::Coarsen))
            .count();
        assert_eq!(refined, 4);
        assert_eq!(coarsened, 4);
    }

    #[test]
    fn indicator_length_mismatch_is_an_error() {
        let mut mesh = unit_square(2);
        let errors = vec![0.0; 3];
        assert!(refine_and_coarsen_fixed_number(&mut mesh, &errors, 0.3, 0.0).is_err());
    }
}
