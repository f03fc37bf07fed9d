//! Process group and control-channel abstraction.
//!
//! A [`ProcessGroup`] is the single process-wide context every benchmark
//! component borrows: rank identity, the private control channel, the device
//! runtime and (once installed) the collective library. It is created once per
//! process and is read-only afterwards.
//!
//! The control channel carries setup and handshake traffic only. Its
//! collectives are built from point-to-point `send`/`recv` in rank order unless
//! the implementation overrides them with native ones; they are O(P) and meant
//! for bookkeeping, not for the measured data path.
//!
//! Implementations: [`LocalWorld`] (ranks as threads in one process) and
//! `MpiChannel` (via the mpi crate, `distributed` feature).

pub mod local;
#[cfg(feature = "distributed")]
pub mod mpi_channel;

pub use local::{LocalChannel, LocalWorld};
#[cfg(feature = "distributed")]
pub use mpi_channel::MpiChannel;

use std::cell::OnceCell;
use std::rc::Rc;

use bytemuck::Pod;

use crate::device::{DevicePtr, DeviceRuntime};
use crate::error::{BenchError, Result};
use crate::transport::collective::{CollectiveLibrary, LoopbackCollective};

/// Integer identity of a process in the group, `0..size`.
pub type Rank = usize;

/// Message tag used to keep independent traffic classes from matching each other.
pub type Tag = i32;

/// Setup traffic: handle exchange, collectives, bookkeeping reports.
pub const TAG_CONTROL: Tag = 0;
/// Completion handshakes of the direct-access transports.
pub const TAG_ACK: Tag = 1;
/// Benchmarked two-sided transfers.
pub const TAG_DATA: Tag = 2;
/// Transfers issued by the loopback collective library.
pub const TAG_COLLECTIVE: Tag = 3;

/// An issued non-blocking operation that has not been completed yet.
pub trait Completion {
    /// Block until the operation has finished.
    fn wait(self: Box<Self>) -> Result<()>;
}

pub type PendingOp = Box<dyn Completion>;

/// Capability contract of the message-passing runtime.
pub trait ControlChannel {
    /// This process's rank.
    fn rank(&self) -> Rank;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Blocking send of a byte payload to `dest`.
    fn send(&self, dest: Rank, tag: Tag, payload: &[u8]) -> Result<()>;

    /// Blocking receive from `src` into `payload`.
    ///
    /// Messages between a pair of ranks with the same tag are matched in the
    /// order they were sent.
    fn recv(&self, src: Rank, tag: Tag, payload: &mut [u8]) -> Result<()>;

    /// Block until every rank has entered the barrier.
    fn barrier(&self) -> Result<()>;

    /// Broadcast `buf` from `root` to every rank.
    fn broadcast_bytes(&self, root: Rank, buf: &mut [u8]) -> Result<()> {
        let me = self.rank();
        for peer in 0..self.size() {
            if peer == root {
                continue;
            }
            if me == root {
                self.send(peer, TAG_CONTROL, buf)?;
            } else if me == peer {
                self.recv(root, TAG_CONTROL, buf)?;
            }
        }
        Ok(())
    }

    /// Gather `local` from every rank into `out`, ordered by rank.
    ///
    /// `out.len()` must be `local.len() * size()`.
    fn all_gather_bytes(&self, local: &[u8], out: &mut [u8]) -> Result<()> {
        let width = local.len();
        if out.len() != width * self.size() {
            return Err(BenchError::Usage(format!(
                "all-gather output holds {} bytes, expected {}",
                out.len(),
                width * self.size()
            )));
        }
        for root in 0..self.size() {
            let chunk = &mut out[root * width..(root + 1) * width];
            if root == self.rank() {
                chunk.copy_from_slice(local);
            }
            self.broadcast_bytes(root, chunk)?;
        }
        Ok(())
    }

    /// Start a non-blocking send of `bytes` bytes located at `src`.
    ///
    /// # Safety
    /// `src..src+bytes` must stay valid and unmodified until the returned
    /// operation has been waited on.
    unsafe fn isend(&self, dest: Rank, tag: Tag, src: DevicePtr, bytes: usize)
        -> Result<PendingOp>;

    /// Start a non-blocking receive of `bytes` bytes into `dst`.
    ///
    /// # Safety
    /// `dst..dst+bytes` must stay valid and must not be accessed until the
    /// returned operation has been waited on.
    unsafe fn irecv(&self, src: Rank, tag: Tag, dst: DevicePtr, bytes: usize)
        -> Result<PendingOp>;

    /// Complete every operation in `ops`.
    fn wait_all(&self, ops: Vec<PendingOp>) -> Result<()> {
        for op in ops {
            op.wait()?;
        }
        Ok(())
    }

    /// Release the runtime. Calling it twice, or after the host tore the
    /// runtime down, is a no-op.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Process-wide benchmark context.
pub struct ProcessGroup {
    channel: Rc<dyn ControlChannel>,
    device: Rc<dyn DeviceRuntime>,
    collective: OnceCell<Rc<dyn CollectiveLibrary>>,
    print_rank: Rank,
}

impl ProcessGroup {
    /// Wrap an initialized control channel and device runtime.
    pub fn new(channel: Box<dyn ControlChannel>, device: Rc<dyn DeviceRuntime>) -> Self {
        let channel: Rc<dyn ControlChannel> = Rc::from(channel);
        if channel.rank() == 0 {
            tracing::info!(
                ranks = channel.size(),
                device = device.name(),
                "process group created"
            );
        }
        Self {
            channel,
            device,
            collective: OnceCell::new(),
            print_rank: 0,
        }
    }

    pub fn rank(&self) -> Rank {
        self.channel.rank()
    }

    pub fn size(&self) -> usize {
        self.channel.size()
    }

    /// Rank that produces user-visible output.
    pub fn print_rank(&self) -> Rank {
        self.print_rank
    }

    pub fn is_print_rank(&self) -> bool {
        self.rank() == self.print_rank
    }

    pub fn channel(&self) -> &dyn ControlChannel {
        self.channel.as_ref()
    }

    pub fn device(&self) -> &Rc<dyn DeviceRuntime> {
        &self.device
    }

    /// Install the collective library used by `Library::Xccl` patterns.
    ///
    /// Can be done once, before the first collective pattern is built.
    pub fn install_collective(&self, library: Rc<dyn CollectiveLibrary>) -> Result<()> {
        self.collective
            .set(library)
            .map_err(|_| BenchError::Usage("collective library already installed".into()))
    }

    /// The installed collective library, or the loopback one over the
    /// control channel if none was installed.
    pub fn collective(&self) -> Rc<dyn CollectiveLibrary> {
        self.collective
            .get_or_init(|| Rc::new(LoopbackCollective::new(Rc::clone(&self.channel))))
            .clone()
    }

    pub fn barrier(&self) -> Result<()> {
        self.channel.barrier()
    }

    pub fn send_value<T: Pod>(&self, dest: Rank, tag: Tag, value: &T) -> Result<()> {
        self.channel.send(dest, tag, bytemuck::bytes_of(value))
    }

    pub fn recv_value<T: Pod>(&self, src: Rank, tag: Tag) -> Result<T> {
        let mut value = T::zeroed();
        self.channel.recv(src, tag, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    /// Send a variable-length blob: its length first, then the bytes.
    pub fn send_blob(&self, dest: Rank, tag: Tag, blob: &[u8]) -> Result<()> {
        self.send_value(dest, tag, &(blob.len() as u64))?;
        self.channel.send(dest, tag, blob)
    }

    pub fn recv_blob(&self, src: Rank, tag: Tag) -> Result<Vec<u8>> {
        let len: u64 = self.recv_value(src, tag)?;
        let mut blob = vec![0u8; len as usize];
        self.channel.recv(src, tag, &mut blob)?;
        Ok(blob)
    }

    /// Broadcast `value` from `root`; every rank ends up with root's value.
    pub fn broadcast<T: Pod>(&self, value: &mut T, root: Rank) -> Result<()> {
        self.channel.broadcast_bytes(root, bytemuck::bytes_of_mut(value))
    }

    /// Gather one value per rank, ordered by rank.
    pub fn all_gather<T: Pod>(&self, value: &T) -> Result<Vec<T>> {
        self.all_gather_slice(std::slice::from_ref(value))
    }

    /// Gather an equally sized slice from every rank, concatenated in rank order.
    pub fn all_gather_slice<T: Pod>(&self, local: &[T]) -> Result<Vec<T>> {
        let mut out = vec![T::zeroed(); local.len() * self.size()];
        self.channel
            .all_gather_bytes(bytemuck::cast_slice(local), bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    pub fn all_reduce_sum<T>(&self, value: T) -> Result<T>
    where
        T: Pod + std::ops::Add<Output = T>,
    {
        let all = self.all_gather(&value)?;
        Ok(all.into_iter().fold(T::zeroed(), |acc, v| acc + v))
    }

    pub fn all_reduce_max<T>(&self, value: T) -> Result<T>
    where
        T: Pod + PartialOrd,
    {
        let all = self.all_gather(&value)?;
        Ok(all
            .into_iter()
            .fold(value, |acc, v| if v > acc { v } else { acc }))
    }

    /// Logical AND of a flag across all ranks.
    pub fn all_reduce_and(&self, flag: bool) -> Result<bool> {
        let all = self.all_gather(&u8::from(flag))?;
        Ok(all.iter().all(|&f| f != 0))
    }

    /// Release the control channel. Idempotent.
    pub fn finalize(&mut self) -> Result<()> {
        self.collective.take();
        match Rc::get_mut(&mut self.channel) {
            Some(channel) => channel.finalize(),
            None => Err(BenchError::Usage(
                "control channel is still borrowed by a live pattern".into(),
            )),
        }
    }
}
