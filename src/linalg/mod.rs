//! Distributed sparse matrix and vector with accumulate-then-compress
//! semantics.
//!
//! Rows (and vector entries) live on the rank that owns the corresponding
//! DOF. During assembly both containers are accumulate-only: any rank may
//! `add` into any addressable entry, off-owner contributions land in a
//! buffer, and the collective `compress` ships them to their owners. After
//! compress the containers are read-only for the solver. Ghost *reads*
//! (matrix-vector products, constraint back-substitution) go through an
//! explicit `ghost_update`, mirroring how the solution vector is
//! ghost-synchronized before output or error estimation.

pub mod amg;
pub mod solver;

use crate::comm::{Communicator, exchange_records};
use crate::error::GwError;
use hashbrown::HashMap;
use std::sync::Arc;

/// Ownership partition of the global DOF index space, replicated per rank.
#[derive(Clone, Debug)]
pub struct DofPartition {
    /// This rank.
    pub rank: usize,
    /// Global DOF count.
    pub global_size: usize,
    /// Owning rank of every global DOF.
    pub owner: Vec<usize>,
    /// Sorted global ids owned by this rank.
    pub owned: Vec<usize>,
    /// Sorted global ids relevant to this rank (owned + ghost).
    pub relevant: Vec<usize>,
    /// For each owned DOF, the other ranks that hold it as a ghost.
    pub consumers: HashMap<usize, Vec<usize>>,
}

impl DofPartition {
    /// Trivial single-rank partition owning everything (used in tests and
    /// serial runs).
    pub fn serial(global_size: usize) -> Self {
        let owned: Vec<usize> = (0..global_size).collect();
        Self {
            rank: 0,
            global_size,
            owner: vec![0; global_size],
            relevant: owned.clone(),
            owned,
            consumers: HashMap::new(),
        }
    }

    /// Whether `dof` is owned by this rank.
    pub fn is_owned(&self, dof: usize) -> bool {
        dof < self.global_size && self.owner[dof] == self.rank
    }

    /// Number of locally-owned DOFs.
    pub fn n_owned(&self) -> usize {
        self.owned.len()
    }
}

/// Sparsity pattern for the locally-owned rows, columns in global indices.
#[derive(Clone, Debug, Default)]
pub struct SparsityPattern {
    /// Sorted, deduplicated column sets, aligned with `DofPartition::owned`.
    pub rows: Vec<Vec<usize>>,
}

/// Wire record for vector compress/ghost-update exchanges.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct DofValue {
    dof: u64,
    value: f64,
}

/// Wire record for matrix compress exchanges.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct MatrixTriplet {
    row: u64,
    col: u64,
    value: f64,
}

/// Distributed vector over the DOF partition.
#[derive(Clone, Debug)]
pub struct DistributedVector {
    partition: Arc<DofPartition>,
    local_of_global: HashMap<usize, usize>,
    local: Vec<f64>,
    /// Off-owner accumulations awaiting compress.
    ghost_acc: HashMap<usize, f64>,
    /// Read cache for relevant ghost values after a ghost update.
    ghost_val: HashMap<usize, f64>,
}

impl DistributedVector {
    /// Zero-initialized vector over `partition`.
    pub fn new(partition: Arc<DofPartition>) -> Self {
        let local_of_global = partition
            .owned
            .iter()
            .enumerate()
            .map(|(i, &g)| (g, i))
            .collect();
        let local = vec![0.0; partition.owned.len()];
        Self {
            partition,
            local_of_global,
            local,
            ghost_acc: HashMap::new(),
            ghost_val: HashMap::new(),
        }
    }

    /// The underlying partition.
    pub fn partition(&self) -> &Arc<DofPartition> {
        &self.partition
    }

    /// Global vector length.
    pub fn global_size(&self) -> usize {
        self.partition.global_size
    }

    /// Whether `dof` is owned here.
    pub fn is_owned(&self, dof: usize) -> bool {
        self.partition.is_owned(dof)
    }

    /// Accumulate `value` into `dof` (owned or not).
    pub fn add(&mut self, dof: usize, value: f64) -> Result<(), GwError> {
        if dof >= self.partition.global_size {
            return Err(GwError::DofOutOfRange {
                index: dof,
                size: self.partition.global_size,
            });
        }
        match self.local_of_global.get(&dof) {
            Some(&i) => self.local[i] += value,
            None => *self.ghost_acc.entry(dof).or_insert(0.0) += value,
        }
        Ok(())
    }

    /// Overwrite an entry. Owned entries hit storage; others update the
    /// local ghost cache only.
    pub fn set(&mut self, dof: usize, value: f64) -> Result<(), GwError> {
        if dof >= self.partition.global_size {
            return Err(GwError::DofOutOfRange {
                index: dof,
                size: self.partition.global_size,
            });
        }
        match self.local_of_global.get(&dof) {
            Some(&i) => self.local[i] = value,
            None => {
                self.ghost_val.insert(dof, value);
            }
        }
        Ok(())
    }

    /// Read an owned or ghost-cached entry.
    pub fn get(&self, dof: usize) -> Result<f64, GwError> {
        match self.local_of_global.get(&dof) {
            Some(&i) => Ok(self.local[i]),
            None => self
                .ghost_val
                .get(&dof)
                .copied()
                .ok_or(GwError::DofOutOfRange {
                    index: dof,
                    size: self.partition.global_size,
                }),
        }
    }

    /// Owned values in `partition.owned` order.
    pub fn owned_values(&self) -> &[f64] {
        &self.local
    }

    /// Mutable owned values.
    pub fn owned_values_mut(&mut self) -> &mut [f64] {
        &mut self.local
    }

    /// Reset owned values, accumulations, and the ghost cache to zero.
    pub fn fill_zero(&mut self) {
        self.local.fill(0.0);
        self.ghost_acc.clear();
        self.ghost_val.clear();
    }

    /// Collective: ship off-owner accumulations to their owners.
    pub fn compress<C: Communicator>(&mut self, comm: &C, tag: u16) -> Result<(), GwError> {
        let mut outgoing: HashMap<usize, Vec<DofValue>> = HashMap::new();
        for (&dof, &value) in &self.ghost_acc {
            outgoing
                .entry(self.partition.owner[dof])
                .or_default()
                .push(DofValue {
                    dof: dof as u64,
                    value,
                });
        }
        self.ghost_acc.clear();
        for (_, records) in exchange_records(comm, tag, &outgoing)? {
            for r in records {
                let dof = r.dof as usize;
                let i = *self
                    .local_of_global
                    .get(&dof)
                    .ok_or_else(|| GwError::Comm(format!("received DOF {dof} not owned here")))?;
                self.local[i] += r.value;
            }
        }
        Ok(())
    }

    /// Collective: refresh ghost values of relevant DOFs from their owners.
    pub fn ghost_update<C: Communicator>(&mut self, comm: &C, tag: u16) -> Result<(), GwError> {
        let mut outgoing: HashMap<usize, Vec<DofValue>> = HashMap::new();
        for (&dof, peers) in &self.partition.consumers {
            let i = self.local_of_global[&dof];
            for &peer in peers {
                outgoing.entry(peer).or_default().push(DofValue {
                    dof: dof as u64,
                    value: self.local[i],
                });
            }
        }
        for (_, records) in exchange_records(comm, tag, &outgoing)? {
            for r in records {
                self.ghost_val.insert(r.dof as usize, r.value);
            }
        }
        Ok(())
    }

    /// Local part of the global dot product.
    pub fn local_dot(&self, other: &DistributedVector) -> f64 {
        self.local
            .iter()
            .zip(other.local.iter())
            .map(|(a, b)| a * b)
            .sum()
    }
}

/// Distributed CSR matrix over the DOF partition.
#[derive(Clone, Debug)]
pub struct DistributedMatrix {
    partition: Arc<DofPartition>,
    row_of_global: HashMap<usize, usize>,
    row_ptr: Vec<usize>,
    cols: Vec<usize>,
    vals: Vec<f64>,
    /// Contributions to rows owned elsewhere, awaiting compress.
    foreign: HashMap<(usize, usize), f64>,
}

impl DistributedMatrix {
    /// Zero matrix with the given pattern over the owned rows.
    pub fn from_pattern(partition: Arc<DofPartition>, pattern: &SparsityPattern) -> Self {
        debug_assert_eq!(pattern.rows.len(), partition.owned.len());
        let row_of_global = partition
            .owned
            .iter()
            .enumerate()
            .map(|(i, &g)| (g, i))
            .collect();
        let mut row_ptr = Vec::with_capacity(pattern.rows.len() + 1);
        row_ptr.push(0);
        let mut cols = Vec::new();
        for row in &pattern.rows {
            cols.extend_from_slice(row);
            row_ptr.push(cols.len());
        }
        let vals = vec![0.0; cols.len()];
        Self {
            partition,
            row_of_global,
            row_ptr,
            cols,
            vals,
            foreign: HashMap::new(),
        }
    }

    /// Number of locally-owned rows.
    pub fn n_owned_rows(&self) -> usize {
        self.row_ptr.len() - 1
    }

    /// Accumulate into entry `(row, col)` (global indices).
    pub fn add(&mut self, row: usize, col: usize, value: f64) -> Result<(), GwError> {
        if row >= self.partition.global_size || col >= self.partition.global_size {
            return Err(GwError::DofOutOfRange {
                index: row.max(col),
                size: self.partition.global_size,
            });
        }
        match self.row_of_global.get(&row) {
            Some(&r) => self.add_local(r, row, col, value),
            None => {
                *self.foreign.entry((row, col)).or_insert(0.0) += value;
                Ok(())
            }
        }
    }

    fn add_local(&mut self, r: usize, row: usize, col: usize, value: f64) -> Result<(), GwError> {
        let slice = &self.cols[self.row_ptr[r]..self.row_ptr[r + 1]];
        match slice.binary_search(&col) {
            Ok(k) => {
                self.vals[self.row_ptr[r] + k] += value;
                Ok(())
            }
            Err(_) => Err(GwError::EntryNotInPattern { row, col }),
        }
    }

    /// Collective: ship foreign contributions to their owning ranks.
    pub fn compress<C: Communicator>(&mut self, comm: &C, tag: u16) -> Result<(), GwError> {
        let mut outgoing: HashMap<usize, Vec<MatrixTriplet>> = HashMap::new();
        for (&(row, col), &value) in &self.foreign {
            outgoing
                .entry(self.partition.owner[row])
                .or_default()
                .push(MatrixTriplet {
                    row: row as u64,
                    col: col as u64,
                    value,
                });
        }
        self.foreign.clear();
        for (_, records) in exchange_records(comm, tag, &outgoing)? {
            for t in records {
                let row = t.row as usize;
                let r = *self
                    .row_of_global
                    .get(&row)
                    .ok_or_else(|| GwError::Comm(format!("received row {row} not owned here")))?;
                self.add_local(r, row, t.col as usize, t.value)?;
            }
        }
        Ok(())
    }

    /// `y = A x` over the owned rows. `x` must be ghost-updated.
    pub fn matvec(&self, x: &DistributedVector, y: &mut DistributedVector) -> Result<(), GwError> {
        debug_assert_eq!(self.n_owned_rows(), y.owned_values().len());
        for r in 0..self.n_owned_rows() {
            let mut sum = 0.0;
            for k in self.row_ptr[r]..self.row_ptr[r + 1] {
                sum += self.vals[k] * x.get(self.cols[k])?;
            }
            y.owned_values_mut()[r] = sum;
        }
        Ok(())
    }

    /// Diagonal of the owned rows (zero where the pattern lacks it).
    pub fn owned_diagonal(&self) -> Vec<f64> {
        let mut diag = vec![0.0; self.n_owned_rows()];
        for (r, d) in diag.iter_mut().enumerate() {
            let row = self.partition.owned[r];
            let slice = &self.cols[self.row_ptr[r]..self.row_ptr[r + 1]];
            if let Ok(k) = slice.binary_search(&row) {
                *d = self.vals[self.row_ptr[r] + k];
            }
        }
        diag
    }

    /// Extract the owned diagonal block as a local CSR matrix
    /// (columns restricted to owned DOFs, local indices).
    pub fn local_block(&self) -> amg::LocalCsr {
        let mut row_ptr = Vec::with_capacity(self.n_owned_rows() + 1);
        row_ptr.push(0);
        let mut cols = Vec::new();
        let mut vals = Vec::new();
        for r in 0..self.n_owned_rows() {
            for k in self.row_ptr[r]..self.row_ptr[r + 1] {
                if let Some(&local_col) = self.row_of_global.get(&self.cols[k]) {
                    cols.push(local_col);
                    vals.push(self.vals[k]);
                }
            }
            row_ptr.push(cols.len());
        }
        amg::LocalCsr {
            n: self.n_owned_rows(),
            row_ptr,
            cols,
            vals,
        }
    }
}
