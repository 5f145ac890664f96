//! Thin façade over serial, intra-process, or MPI message passing.
//!
//! Messages are *contiguous byte slices*. All handles are **waitable**;
//! callers invoke `.wait()` before trusting that data has arrived. The
//! distributed matrix/vector compress phases and the solver reductions are
//! written against [`Communicator`] only, so the whole flow core runs
//! unchanged under the serial [`NoComm`], the in-process [`ThreadComm`]
//! used in multi-rank tests, or the MPI backend (`mpi-support` feature).
//!
//! Collective helpers ([`all_reduce_sum`], [`all_reduce_min`],
//! [`all_reduce_max`], [`exchange_records`]) are free functions layered on
//! the point-to-point primitives; every rank must call them in the same
//! order (all phases of the flow core are collective).

use crate::error::GwError;
use bytes::Bytes;
use dashmap::DashMap;
use hashbrown::HashMap;
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Rank of this process in `0..size()`.
    fn rank(&self) -> usize;
    /// Number of cooperating processes.
    fn size(&self) -> usize;
    /// Post a send of `buf` to `peer` with matching `tag`.
    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive of exactly `len` bytes from `peer` with matching `tag`.
    fn irecv(&self, peer: usize, tag: u16, len: usize) -> Self::RecvHandle;
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Compile-time no-op comm for single-rank runs and serial unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _len: usize) {}
}

// --- ThreadComm: intra-process, one rank per thread ---

type Key = (usize, usize, u16); // (src, dst, tag)

static MAILBOX: Lazy<DashMap<Key, Bytes>> = Lazy::new(DashMap::new);

/// Handle for an in-flight `ThreadComm` receive.
pub struct LocalHandle {
    buf: Arc<Mutex<Option<Vec<u8>>>>,
    handle: Option<JoinHandle<()>>,
}

impl Wait for LocalHandle {
    fn wait(mut self) -> Option<Vec<u8>> {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let mut guard = self.buf.lock().expect("mailbox handle poisoned");
        guard.take()
    }
}

/// In-process communicator backed by a process-global mailbox.
///
/// Each cooperating rank lives on its own thread. Tests that use it must be
/// serialized (`#[serial]`) because the mailbox is process-global.
#[derive(Clone, Debug)]
pub struct ThreadComm {
    rank: usize,
    size: usize,
}

impl ThreadComm {
    /// Create the communicator endpoint for `rank` out of `size` ranks.
    pub fn new(rank: usize, size: usize) -> Self {
        Self { rank, size }
    }

    /// Drop any stale messages from a previous test run.
    pub fn reset_mailbox() {
        MAILBOX.clear();
    }
}

impl Communicator for ThreadComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
        let key = (self.rank, peer, tag);
        let payload = Bytes::from(buf.to_vec());
        // Back-to-back collectives may reuse a tag before the receiver has
        // drained the previous message; wait for the slot to clear instead
        // of overwriting it.
        loop {
            {
                let entry = MAILBOX.entry(key);
                if let dashmap::mapref::entry::Entry::Vacant(slot) = entry {
                    slot.insert(payload.clone());
                    return;
                }
            }
            std::thread::yield_now();
        }
    }

    fn irecv(&self, peer: usize, tag: u16, len: usize) -> LocalHandle {
        let key = (peer, self.rank, tag);
        let slot = Arc::new(Mutex::new(None));
        let slot_clone = slot.clone();
        let handle = std::thread::spawn(move || {
            loop {
                if let Some((_, bytes)) = MAILBOX.remove(&key) {
                    let mut guard = slot_clone.lock().expect("mailbox handle poisoned");
                    *guard = Some(bytes[..len].to_vec());
                    break;
                }
                std::thread::yield_now();
            }
        });
        LocalHandle {
            buf: slot,
            handle: Some(handle),
        }
    }
}

// --- MPI backend (feature = "mpi-support") ---

#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// MPI-backed communicator over `MPI_COMM_WORLD`.
    pub struct MpiComm {
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    impl MpiComm {
        /// Wrap an initialized MPI world communicator.
        pub fn new(world: SimpleCommunicator) -> Self {
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self { world, rank, size }
        }
    }

    /// Completed-on-creation handle; the backend sends/receives eagerly.
    pub struct MpiHandle(pub Option<Vec<u8>>);

    impl Wait for MpiHandle {
        fn wait(self) -> Option<Vec<u8>> {
            self.0
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiHandle;
        type RecvHandle = MpiHandle;

        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiHandle {
            self.world
                .process_at_rank(peer as i32)
                .send_with_tag(buf, tag as i32);
            MpiHandle(None)
        }

        fn irecv(&self, peer: usize, tag: u16, _len: usize) -> MpiHandle {
            let (data, _status) = self
                .world
                .process_at_rank(peer as i32)
                .receive_vec_with_tag::<u8>(tag as i32);
            MpiHandle(Some(data))
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::{MpiComm, MpiHandle};

// --- Collectives ---

/// Sum a scalar across all ranks. Collective; every rank gets the total.
pub fn all_reduce_sum<C: Communicator>(comm: &C, tag: u16, value: f64) -> Result<f64, GwError> {
    reduce_with(comm, tag, value, |a, b| a + b)
}

/// Max of a scalar across all ranks. Collective.
pub fn all_reduce_max<C: Communicator>(comm: &C, tag: u16, value: f64) -> Result<f64, GwError> {
    reduce_with(comm, tag, value, f64::max)
}

/// Min of a scalar across all ranks. Collective.
pub fn all_reduce_min<C: Communicator>(comm: &C, tag: u16, value: f64) -> Result<f64, GwError> {
    reduce_with(comm, tag, value, f64::min)
}

fn reduce_with<C: Communicator>(
    comm: &C,
    tag: u16,
    value: f64,
    combine: impl Fn(f64, f64) -> f64,
) -> Result<f64, GwError> {
    let me = comm.rank();
    let n = comm.size();
    if n == 1 {
        return Ok(value);
    }
    let payload = value.to_le_bytes();
    let mut sends = Vec::with_capacity(n - 1);
    let mut recvs = Vec::with_capacity(n - 1);
    for peer in 0..n {
        if peer == me {
            continue;
        }
        sends.push(comm.isend(peer, tag, &payload));
        recvs.push((peer, comm.irecv(peer, tag, 8)));
    }
    // Fold strictly in rank order: floating-point combination is not
    // associative, and every rank must agree bitwise on the result or a
    // convergence test at a tolerance boundary can desynchronize the
    // collective sequence.
    let mut contributions = vec![0.0; n];
    contributions[me] = value;
    for (peer, handle) in recvs {
        let bytes = handle
            .wait()
            .ok_or_else(|| GwError::Comm(format!("reduction receive from rank {peer} failed")))?;
        let arr: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| GwError::Comm("short reduction payload".into()))?;
        contributions[peer] = f64::from_le_bytes(arr);
    }
    for s in sends {
        let _ = s.wait();
    }
    let mut acc = contributions[0];
    for &v in &contributions[1..] {
        acc = combine(acc, v);
    }
    Ok(acc)
}

/// Exchange typed plain-data records between ranks (collective).
///
/// `outgoing` maps peer rank to the records destined for it; ranks with no
/// entry receive an empty batch. The exchange runs in two rounds — counts
/// first, payloads second — so receivers can size their buffers: the same
/// pattern the assembly compress and ghost-update phases rely on. Returns
/// `(peer, records)` for every other rank.
pub fn exchange_records<C, T>(
    comm: &C,
    tag: u16,
    outgoing: &HashMap<usize, Vec<T>>,
) -> Result<Vec<(usize, Vec<T>)>, GwError>
where
    C: Communicator,
    T: bytemuck::Pod,
{
    let me = comm.rank();
    let n = comm.size();
    let mut incoming = Vec::new();
    if n == 1 {
        return Ok(incoming);
    }
    let empty: Vec<T> = Vec::new();
    // Round 1: counts.
    let mut count_sends = Vec::with_capacity(n - 1);
    let mut count_recvs = Vec::with_capacity(n - 1);
    for peer in 0..n {
        if peer == me {
            continue;
        }
        let records = outgoing.get(&peer).unwrap_or(&empty);
        let count = (records.len() as u64).to_le_bytes();
        count_sends.push(comm.isend(peer, tag, &count));
        count_recvs.push((peer, comm.irecv(peer, tag, 8)));
    }
    let mut expected: Vec<(usize, usize)> = Vec::with_capacity(n - 1);
    for (peer, handle) in count_recvs {
        let bytes = handle
            .wait()
            .ok_or_else(|| GwError::Comm(format!("count receive from rank {peer} failed")))?;
        let arr: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| GwError::Comm("short count payload".into()))?;
        expected.push((peer, u64::from_le_bytes(arr) as usize));
    }
    for s in count_sends {
        let _ = s.wait();
    }
    // Round 2: payloads (skipped where the count is zero).
    let payload_tag = tag.wrapping_add(1);
    let mut data_sends = Vec::new();
    let mut data_recvs = Vec::new();
    for peer in 0..n {
        if peer == me {
            continue;
        }
        let records = outgoing.get(&peer).unwrap_or(&empty);
        if !records.is_empty() {
            data_sends.push(comm.isend(peer, payload_tag, bytemuck::cast_slice(records)));
        }
    }
    for (peer, count) in &expected {
        if *count > 0 {
            let len = count * std::mem::size_of::<T>();
            data_recvs.push((*peer, comm.irecv(*peer, payload_tag, len)));
        } else {
            incoming.push((*peer, Vec::new()));
        }
    }
    for (peer, handle) in data_recvs {
        let bytes = handle
            .wait()
            .ok_or_else(|| GwError::Comm(format!("payload receive from rank {peer} failed")))?;
        let records: &[T] = bytemuck::try_cast_slice(&bytes)
            .map_err(|e| GwError::Comm(format!("payload cast from rank {peer} failed: {e}")))?;
        incoming.push((peer, records.to_vec()));
    }
    for s in data_sends {
        let _ = s.wait();
    }
    incoming.sort_by_key(|(peer, _)| *peer);
    Ok(incoming)
}
