//! Affine DOF constraints: hanging nodes and Dirichlet values.
//!
//! A constraint line expresses one DOF as `x_i = sum_j w_ij x_j + b_i`.
//! Hanging nodes carry equal-weight terms over their parents and zero
//! inhomogeneity; Dirichlet DOFs carry no terms and the boundary value as
//! inhomogeneity. The set must be [`Constraints::close`]d before use:
//! closing substitutes chained constraints (a term referencing another
//! constrained DOF) until every term points at a free DOF, and fails on
//! cycles.
//!
//! During assembly, [`Constraints::distribute_local_to_global`] eliminates
//! constrained rows/columns while redistributing their contributions into
//! the rows they depend on; after the solve, [`Constraints::distribute`]
//! reconstructs the eliminated DOFs by back-substitution.

use crate::error::GwError;
use crate::linalg::{DistributedMatrix, DistributedVector};
use std::collections::BTreeMap;

/// One resolved constraint line.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConstraintLine {
    /// `(free DOF, weight)` terms.
    pub entries: Vec<(usize, f64)>,
    /// Constant offset (Dirichlet value for boundary constraints).
    pub inhomogeneity: f64,
}

/// Set of affine constraints over global DOF indices.
#[derive(Clone, Debug, Default)]
pub struct Constraints {
    lines: BTreeMap<usize, ConstraintLine>,
    closed: bool,
}

impl Constraints {
    /// Empty, open constraint set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Constrain `dof` to a weighted combination of other DOFs.
    pub fn add_line(&mut self, dof: usize, entries: Vec<(usize, f64)>, inhomogeneity: f64) {
        debug_assert!(!self.closed, "constraint set already closed");
        self.lines.insert(
            dof,
            ConstraintLine {
                entries,
                inhomogeneity,
            },
        );
        self.closed = false;
    }

    /// Constrain `dof` to a fixed boundary value.
    pub fn add_dirichlet(&mut self, dof: usize, value: f64) {
        self.add_line(dof, Vec::new(), value);
    }

    /// Whether `dof` is constrained.
    pub fn is_constrained(&self, dof: usize) -> bool {
        self.lines.contains_key(&dof)
    }

    /// Number of constraint lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// True when no DOF is constrained.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Borrow the line constraining `dof`, if any.
    pub fn line(&self, dof: usize) -> Option<&ConstraintLine> {
        self.lines.get(&dof)
    }

    /// Resolve chained constraints; errors on a constraint cycle.
    ///
    /// After closing, no term of any line references a constrained DOF.
    pub fn close(&mut self) -> Result<(), GwError> {
        let dofs: Vec<usize> = self.lines.keys().copied().collect();
        let max_depth = self.lines.len() + 1;
        for dof in dofs {
            let mut line = self.lines[&dof].clone();
            let mut depth = 0;
            while line.entries.iter().any(|(j, _)| self.lines.contains_key(j)) {
                depth += 1;
                if depth > max_depth {
                    return Err(GwError::ConstraintCycle(dof));
                }
                let mut resolved: BTreeMap<usize, f64> = BTreeMap::new();
                let mut inhomogeneity = line.inhomogeneity;
                for (j, w) in &line.entries {
                    if *j == dof {
                        return Err(GwError::ConstraintCycle(dof));
                    }
                    match self.lines.get(j) {
                        Some(inner) => {
                            inhomogeneity += w * inner.inhomogeneity;
                            for (k, wk) in &inner.entries {
                                *resolved.entry(*k).or_insert(0.0) += w * wk;
                            }
                        }
                        None => {
                            *resolved.entry(*j).or_insert(0.0) += w;
                        }
                    }
                }
                line = ConstraintLine {
                    entries: resolved.into_iter().collect(),
                    inhomogeneity,
                };
            }
            if line.entries.iter().any(|(j, _)| *j == dof) {
                return Err(GwError::ConstraintCycle(dof));
            }
            self.lines.insert(dof, line);
        }
        self.closed = true;
        Ok(())
    }

    /// Expand a local DOF into its `(global, weight)` targets.
    fn targets(&self, dof: usize) -> Vec<(usize, f64)> {
        match self.lines.get(&dof) {
            Some(line) => line.entries.clone(),
            None => vec![(dof, 1.0)],
        }
    }

    /// Scatter a local element matrix and RHS vector into the global system,
    /// eliminating constrained rows and columns.
    ///
    /// `local_matrix` is row-major `n x n` over `dofs`. Constrained diagonal
    /// positions receive a unit placeholder so the global matrix stays
    /// definite; those solution entries are overwritten by
    /// [`Constraints::distribute`] afterwards.
    pub fn distribute_local_to_global(
        &self,
        local_matrix: &[f64],
        local_rhs: &[f64],
        dofs: &[usize],
        matrix: &mut DistributedMatrix,
        rhs: &mut DistributedVector,
    ) -> Result<(), GwError> {
        if !self.closed {
            return Err(GwError::ConstraintsNotReady("not closed"));
        }
        let n = dofs.len();
        debug_assert_eq!(local_matrix.len(), n * n);
        debug_assert_eq!(local_rhs.len(), n);
        for (i, &gi) in dofs.iter().enumerate() {
            let row_targets = self.targets(gi);
            for (gt, wt) in &row_targets {
                rhs.add(*gt, wt * local_rhs[i])?;
            }
            for (j, &gj) in dofs.iter().enumerate() {
                let a_ij = local_matrix[i * n + j];
                if a_ij == 0.0 {
                    continue;
                }
                // Inhomogeneous column constraints move to the RHS.
                if let Some(line) = self.lines.get(&gj) {
                    if line.inhomogeneity != 0.0 {
                        for (gt, wt) in &row_targets {
                            rhs.add(*gt, -wt * a_ij * line.inhomogeneity)?;
                        }
                    }
                }
                for (gt, wt) in &row_targets {
                    for (gs, ws) in self.targets(gj) {
                        matrix.add(*gt, gs, wt * ws * a_ij)?;
                    }
                }
            }
            if self.is_constrained(gi) {
                matrix.add(gi, gi, 1.0)?;
            }
        }
        Ok(())
    }

    /// Scatter a local RHS-only contribution (well/stream sources).
    pub fn distribute_local_rhs(
        &self,
        local_rhs: &[f64],
        dofs: &[usize],
        rhs: &mut DistributedVector,
    ) -> Result<(), GwError> {
        if !self.closed {
            return Err(GwError::ConstraintsNotReady("not closed"));
        }
        for (i, &gi) in dofs.iter().enumerate() {
            for (gt, wt) in self.targets(gi) {
                rhs.add(gt, wt * local_rhs[i])?;
            }
        }
        Ok(())
    }

    /// Back-substitute constrained DOFs from the solved free DOFs.
    ///
    /// Requires ghost values of the free DOFs to be available; callers run a
    /// ghost update on `solution` first. Only locally-owned constrained DOFs
    /// are written.
    pub fn distribute(&self, solution: &mut DistributedVector) -> Result<(), GwError> {
        if !self.closed {
            return Err(GwError::ConstraintsNotReady("not closed"));
        }
        let mut updates: Vec<(usize, f64)> = Vec::new();
        for (dof, line) in &self.lines {
            if !solution.is_owned(*dof) {
                continue;
            }
            let mut value = line.inhomogeneity;
            for (j, w) in &line.entries {
                value += w * solution.get(*j)?;
            }
            updates.push((*dof, value));
        }
        for (dof, value) in updates {
            solution.set(dof, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_resolves_chains() {
        let mut c = Constraints::new();
        // 2 -> 1, 1 -> 0 with offsets.
        c.add_line(2, vec![(1, 0.5)], 1.0);
        c.add_line(1, vec![(0, 2.0)], 3.0);
        c.close().unwrap();
        let line = c.line(2).unwrap();
        assert_eq!(line.entries, vec![(0, 1.0)]);
        assert!((line.inhomogeneity - 2.5).abs() < 1e-14);
    }

    #[test]
    fn close_detects_cycles() {
        let mut c = Constraints::new();
        c.add_line(0, vec![(1, 1.0)], 0.0);
        c.add_line(1, vec![(0, 1.0)], 0.0);
        assert!(matches!(c.close(), Err(GwError::ConstraintCycle(_))));
    }

    #[test]
    fn dirichlet_lines_have_no_terms() {
        let mut c = Constraints::new();
        c.add_dirichlet(7, 4.25);
        c.close().unwrap();
        assert!(c.is_constrained(7));
        let line = c.line(7).unwrap();
        assert!(line.entries.is_empty());
        assert_eq!(line.inhomogeneity, 4.25);
    }
}
