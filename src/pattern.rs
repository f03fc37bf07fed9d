//! Communication patterns.
//!
//! A [`Comm`] is the set of directed transfers registered for one benchmark,
//! against one [`Library`]. Every rank makes the same sequence of `add` calls;
//! each rank keeps state only for the edges it sends or receives, indexed in
//! registration order.

use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::marker::PhantomData;

use bytemuck::Pod;

use crate::device::{BufferRef, DevicePtr};
use crate::error::{BenchError, Result};
use crate::group::{ProcessGroup, Rank};
use crate::registry::{BufferRegistry, LedgerEntry};
use crate::report;
use crate::transport::{Edge, Library, Transport};

thread_local! {
    static NEXT_BENCH_ID: Cell<usize> = const { Cell::new(0) };
}

/// Per-pattern knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommOptions {
    /// Rank that logs and writes reports for this pattern.
    pub print_rank: Rank,
    /// All-gather a hash of every edge's shape at `add` and reject divergence.
    pub verify_shape: bool,
    /// Keep edges whose handle exchange failed instead of failing `add`.
    /// Such a pattern refuses to start.
    pub tolerate_setup_failures: bool,
}

impl Default for CommOptions {
    fn default() -> Self {
        Self {
            print_rank: 0,
            verify_shape: false,
            tolerate_setup_failures: false,
        }
    }
}

/// Local record of one registered edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeRecord {
    /// The other participant.
    pub peer: Rank,
    pub count: usize,
}

/// Aggregate elements moved per (sender, receiver) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommMatrix {
    size: usize,
    counts: Vec<usize>,
}

impl CommMatrix {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, sender: Rank, receiver: Rank) -> usize {
        self.counts[sender * self.size + receiver]
    }

    /// Pairs with at least one element.
    pub fn pairs(&self) -> usize {
        self.counts.iter().filter(|&&c| c > 0).count()
    }
}

/// Elements sent and received, summed over all ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footprint {
    pub send: usize,
    pub recv: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Issued,
}

pub struct Comm<'a, T: Pod> {
    group: &'a ProcessGroup,
    library: Library,
    options: CommOptions,
    bench_id: usize,
    // Dropped before `registry`: transfers reference its buffers.
    transport: Box<dyn Transport>,
    registry: BufferRegistry<T>,
    sends: Vec<EdgeRecord>,
    recvs: Vec<EdgeRecord>,
    edge_counter: usize,
    phase: Phase,
    _buffers: PhantomData<BufferRef<'a, T>>,
}

impl<'a, T: Pod> Comm<'a, T> {
    pub fn new(group: &'a ProcessGroup, library: Library) -> Result<Self> {
        Self::with_options(group, library, CommOptions::default())
    }

    pub fn with_options(group: &'a ProcessGroup, library: Library, options: CommOptions) -> Result<Self> {
        if options.print_rank >= group.size() {
            return Err(BenchError::Usage(format!(
                "print rank {} outside a group of {}",
                options.print_rank,
                group.size()
            )));
        }
        let bench_id = NEXT_BENCH_ID.with(|next| next.replace(next.get() + 1));
        if group.rank() == options.print_rank {
            tracing::info!(
                bench = bench_id,
                ranks = group.size(),
                device = group.device().name(),
                library = %library,
                "created pattern"
            );
        }
        Ok(Self {
            group,
            library,
            options,
            bench_id,
            transport: library.transport(group, options.tolerate_setup_failures),
            registry: BufferRegistry::new(options.print_rank),
            sends: Vec::new(),
            recvs: Vec::new(),
            edge_counter: 0,
            phase: Phase::Idle,
            _buffers: PhantomData,
        })
    }

    pub fn group(&self) -> &'a ProcessGroup {
        self.group
    }

    pub fn library(&self) -> Library {
        self.library
    }

    pub fn options(&self) -> &CommOptions {
        &self.options
    }

    pub fn bench_id(&self) -> usize {
        self.bench_id
    }

    /// Edges this rank sends.
    pub fn send_count(&self) -> usize {
        self.sends.len()
    }

    /// Edges this rank receives.
    pub fn recv_count(&self) -> usize {
        self.recvs.len()
    }

    pub fn sends(&self) -> &[EdgeRecord] {
        &self.sends
    }

    pub fn recvs(&self) -> &[EdgeRecord] {
        &self.recvs
    }

    /// Non-empty edges registered so far, on any ranks.
    pub fn edge_counter(&self) -> usize {
        self.edge_counter
    }

    /// Remote handles this rank opened while registering edges.
    pub fn handle_exchanges(&self) -> usize {
        self.transport.handle_exchanges()
    }

    pub fn registry(&self) -> &BufferRegistry<T> {
        &self.registry
    }

    /// Bytes of this rank's outgoing edges.
    pub fn send_bytes(&self) -> usize {
        self.sends.iter().map(|e| e.count).sum::<usize>() * std::mem::size_of::<T>()
    }

    fn is_print_rank(&self) -> bool {
        self.group.rank() == self.options.print_rank
    }

    /// Register the transfer of `count` elements from `send[send_offset..]`
    /// on `sender` to `recv[recv_offset..]` on `receiver`.
    ///
    /// Collective: every rank calls it with the same shape, in the same order.
    /// Ranks that do not own a side pass [`BufferRef::absent`] for it.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        send: BufferRef<'a, T>,
        send_offset: usize,
        recv: BufferRef<'a, T>,
        recv_offset: usize,
        count: usize,
        sender: Rank,
        receiver: Rank,
    ) -> Result<()> {
        self.register(
            (send.ptr(), send.len()),
            send_offset,
            (recv.ptr(), recv.len()),
            recv_offset,
            count,
            sender,
            receiver,
        )
    }

    /// Allocate a `count`-element send buffer on `sender` and receive buffer
    /// on `receiver`, owned by the pattern, and register the edge between them.
    pub fn add_lazy(&mut self, count: usize, sender: Rank, receiver: Rank) -> Result<()> {
        self.check_ranks(sender, receiver)?;
        let send = self.registry.allocate(self.group, count, sender)?;
        let recv = self.registry.allocate(self.group, count, receiver)?;
        let me = self.group.rank();
        let extent = |owner: Rank| if me == owner { count } else { 0 };
        self.register((send, extent(sender)), 0, (recv, extent(receiver)), 0, count, sender, receiver)
    }

    fn check_ranks(&self, sender: Rank, receiver: Rank) -> Result<()> {
        let size = self.group.size();
        if sender >= size || receiver >= size {
            return Err(BenchError::Usage(format!(
                "edge {sender}->{receiver} outside a group of {size}"
            )));
        }
        Ok(())
    }

    fn shape_hash(&self, count: usize, sender: Rank, receiver: Rank) -> u64 {
        let mut hasher = DefaultHasher::new();
        (count, sender, receiver, std::mem::size_of::<T>()).hash(&mut hasher);
        hasher.finish()
    }

    /// Check the locally owned side of an edge against its buffer extent.
    fn check_extent(side: &str, (base, len): (DevicePtr, usize), offset: usize, count: usize) -> Result<()> {
        if base.is_null() {
            return Err(BenchError::Usage(format!("{side} buffer is absent on its owning rank")));
        }
        match offset.checked_add(count) {
            Some(end) if end <= len => Ok(()),
            _ => Err(BenchError::Usage(format!(
                "{side} elements {offset}+{count} outside a buffer of {len}"
            ))),
        }
    }

    /// Byte offsets and length of an edge; `Usage` if any overflows.
    fn byte_layout(send_offset: usize, recv_offset: usize, count: usize) -> Result<(usize, usize, usize)> {
        let elem = std::mem::size_of::<T>();
        match (
            send_offset.checked_mul(elem),
            recv_offset.checked_mul(elem),
            count.checked_mul(elem),
        ) {
            (Some(send), Some(recv), Some(bytes)) => Ok((send, recv, bytes)),
            _ => Err(BenchError::Usage(format!(
                "edge of {count} elements at offsets {send_offset}/{recv_offset} overflows a byte address"
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn register(
        &mut self,
        send: (DevicePtr, usize),
        send_offset: usize,
        recv: (DevicePtr, usize),
        recv_offset: usize,
        count: usize,
        sender: Rank,
        receiver: Rank,
    ) -> Result<()> {
        self.check_ranks(sender, receiver)?;
        if count == 0 {
            if self.is_print_rank() {
                tracing::info!(
                    bench = self.bench_id,
                    sender,
                    receiver,
                    "communication count = 0 (skipped)"
                );
            }
            return Ok(());
        }
        self.group.barrier()?;

        let me = self.group.rank();
        let mut local = Self::byte_layout(send_offset, recv_offset, count);
        if me == sender {
            local = local.and_then(|layout| {
                Self::check_extent("send", send, send_offset, count).map(|()| layout)
            });
        }
        if me == receiver {
            local = local.and_then(|layout| {
                Self::check_extent("recv", recv, recv_offset, count).map(|()| layout)
            });
        }

        // Every rank learns whether any rank rejected the edge, so that
        // no participant is left blocked in the handle exchange.
        let shape = if self.options.verify_shape {
            self.shape_hash(count, sender, receiver)
        } else {
            0
        };
        let gathered = self
            .group
            .all_gather_slice(&[shape, u64::from(local.is_ok())])?;
        let (send_offset_bytes, recv_offset_bytes, bytes) = local?;
        let mut rows = gathered.chunks_exact(2);
        if let Some(bad) = rows.clone().position(|row| row[1] == 0) {
            return Err(BenchError::Usage(format!(
                "rank {bad} rejected edge {sender}->{receiver}"
            )));
        }
        if rows.any(|row| row[0] != shape) {
            return Err(BenchError::Usage(format!(
                "ranks registered diverging edges at index {} of bench {}",
                self.edge_counter, self.bench_id
            )));
        }

        if self.is_print_rank() {
            tracing::debug!(
                bench = self.bench_id,
                comm = self.edge_counter,
                sender,
                receiver,
                send_offset,
                recv_offset,
                count,
                size = %report::format_size(bytes),
                library = %self.library,
                "registered edge"
            );
        }
        self.edge_counter += 1;

        let edge = Edge {
            sender,
            receiver,
            send_base: send.0,
            send_offset: send_offset_bytes,
            recv_base: recv.0,
            recv_offset: recv_offset_bytes,
            bytes,
        };
        if me == sender {
            self.transport.setup_send(self.group, &edge)?;
            self.sends.push(EdgeRecord {
                peer: receiver,
                count,
            });
        }
        if me == receiver {
            self.transport.setup_recv(self.group, &edge)?;
            self.recvs.push(EdgeRecord {
                peer: sender,
                count,
            });
        }
        Ok(())
    }

    /// Issue every local transfer.
    pub fn start(&mut self) -> Result<()> {
        if self.phase == Phase::Issued {
            return Err(BenchError::Usage(format!(
                "bench {} started twice without wait",
                self.bench_id
            )));
        }
        self.transport.start(self.group)?;
        self.phase = Phase::Issued;
        Ok(())
    }

    /// Block until every transfer issued by `start` has completed.
    pub fn wait(&mut self) -> Result<()> {
        if self.phase == Phase::Idle {
            return Err(BenchError::Usage(format!(
                "bench {} waited without start",
                self.bench_id
            )));
        }
        self.phase = Phase::Idle;
        self.transport.wait(self.group)
    }

    /// Elements moved per (sender, receiver) pair, gathered from every rank.
    pub fn matrix(&self) -> Result<CommMatrix> {
        let size = self.group.size();
        let mut row = vec![0u64; size];
        for edge in &self.sends {
            row[edge.peer] += edge.count as u64;
        }
        let counts = self
            .group
            .all_gather_slice(&row)?
            .into_iter()
            .map(|c| c as usize)
            .collect();
        Ok(CommMatrix { size, counts })
    }

    /// Elements sent and received across all ranks.
    pub fn footprint(&self) -> Result<Footprint> {
        let send: u64 = self.sends.iter().map(|e| e.count as u64).sum();
        let recv: u64 = self.recvs.iter().map(|e| e.count as u64).sum();
        Ok(Footprint {
            send: self.group.all_reduce_sum(send)? as usize,
            recv: self.group.all_reduce_sum(recv)? as usize,
        })
    }

    /// Buffers the pattern allocated, per rank.
    pub fn ledger(&self) -> Result<Vec<LedgerEntry>> {
        self.registry.ledger(self.group)
    }

    /// Write the communication matrix, the buffer ledger and the footprint.
    ///
    /// Collective; only the print rank writes.
    pub fn report<W: Write>(&self, out: &mut W) -> Result<()> {
        let matrix = self.matrix()?;
        let ledger = self.ledger()?;
        let footprint = self.footprint()?;
        if !self.is_print_rank() {
            return Ok(());
        }
        let elem = std::mem::size_of::<T>();
        writeln!(out)?;
        writeln!(
            out,
            "Bench {}: {} communication matrix (receiver x sender): {}",
            self.bench_id, self.library, self.edge_counter
        )?;
        report::write_matrix(out, &matrix)?;
        report::write_ledger(out, &ledger, elem)?;
        report::write_footprint(out, &footprint, elem)?;
        Ok(())
    }
}

impl<T: Pod> Drop for Comm<'_, T> {
    fn drop(&mut self) {
        if self.phase == Phase::Issued {
            tracing::warn!(bench = self.bench_id, "pattern dropped with transfers in flight");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceBuffer;
    use crate::group::LocalWorld;

    #[test]
    fn bench_ids_increase_per_rank() {
        let results = LocalWorld::run(2, |group| {
            let a = Comm::<u8>::new(&group, Library::Null).unwrap();
            let b = Comm::<u8>::new(&group, Library::Null).unwrap();
            (a.bench_id(), b.bench_id())
        })
        .unwrap();
        for (a, b) in results {
            assert_eq!(b, a + 1);
        }
    }

    #[test]
    fn out_of_range_offset_is_rejected_everywhere() {
        let results = LocalWorld::run(2, |group| {
            let buffer = DeviceBuffer::<u32>::new(group.device(), 4).unwrap();
            let mut comm = Comm::new(&group, Library::Mpi).unwrap();
            let err = comm
                .add(buffer.view(), 2, buffer.view(), 0, 4, 0, 1)
                .unwrap_err();
            (matches!(err, BenchError::Usage(_)), comm.send_count(), comm.recv_count())
        })
        .unwrap();
        assert_eq!(results, vec![(true, 0, 0), (true, 0, 0)]);
    }

    #[test]
    fn overflowing_offsets_are_usage_errors() {
        let results = LocalWorld::run(1, |group| {
            let buffer = DeviceBuffer::<u32>::new(group.device(), 4).unwrap();
            let mut comm = Comm::new(&group, Library::Mpi).unwrap();
            let wrapped_sum = comm.add(buffer.view(), usize::MAX, buffer.view(), 0, 1, 0, 0);
            let wrapped_bytes = comm.add(buffer.view(), 0, buffer.view(), usize::MAX / 2, 1, 0, 0);
            let huge_count = comm.add(buffer.view(), 0, buffer.view(), 0, usize::MAX, 0, 0);
            (
                [wrapped_sum, wrapped_bytes, huge_count]
                    .iter()
                    .all(|r| matches!(r, Err(BenchError::Usage(_)))),
                comm.edge_counter(),
                comm.send_count(),
            )
        })
        .unwrap();
        assert_eq!(results, vec![(true, 0, 0)]);

        LocalWorld::run(1, |group| {
            let bytes = DeviceBuffer::<u8>::new(group.device(), 4).unwrap();
            let mut comm = Comm::new(&group, Library::Mpi).unwrap();
            let err = comm
                .add(bytes.view(), usize::MAX, bytes.view(), 0, 1, 0, 0)
                .unwrap_err();
            assert!(matches!(err, BenchError::Usage(_)));
            assert_eq!(comm.send_count(), 0);
        })
        .unwrap();
    }

    #[test]
    fn diverging_shapes_are_detected() {
        let results = LocalWorld::run(2, |group| {
            let options = CommOptions {
                verify_shape: true,
                ..CommOptions::default()
            };
            let buffer = DeviceBuffer::<u8>::new(group.device(), 8).unwrap();
            let mut comm = Comm::<u8>::with_options(&group, Library::Null, options).unwrap();
            let count = if group.rank() == 0 { 3 } else { 5 };
            comm.add(buffer.view(), 0, buffer.view(), 0, count, 0, 1)
        })
        .unwrap();
        assert!(results.iter().all(|r| matches!(r, Err(BenchError::Usage(_)))));
    }

    #[test]
    fn wait_without_start_is_usage_error() {
        LocalWorld::run(1, |group| {
            let mut comm = Comm::<f32>::new(&group, Library::Null).unwrap();
            assert!(matches!(comm.wait(), Err(BenchError::Usage(_))));
            comm.start().unwrap();
            assert!(matches!(comm.start(), Err(BenchError::Usage(_))));
            comm.wait().unwrap();
        })
        .unwrap();
    }

    #[test]
    fn print_rank_must_exist() {
        LocalWorld::run(2, |group| {
            let options = CommOptions {
                print_rank: 2,
                ..CommOptions::default()
            };
            assert!(Comm::<u8>::with_options(&group, Library::Null, options).is_err());
        })
        .unwrap();
    }
}
