//! Collective-library backend.
//!
//! Every edge of a pattern is issued inside one `group_start`/`group_end`
//! envelope so the library can fuse and schedule the transfers together.

use std::cell::RefCell;
use std::rc::Rc;

use super::{Edge, Transport};
use crate::device::DevicePtr;
use crate::error::Result;
use crate::group::{ControlChannel, PendingOp, ProcessGroup, Rank, TAG_COLLECTIVE};

/// Point-to-point subset of a collective communication library.
pub trait CollectiveLibrary {
    fn name(&self) -> &'static str;

    /// Open a group envelope. Envelopes nest.
    fn group_start(&self) -> Result<()>;

    /// Queue a send of `bytes` bytes at `src` to `peer`.
    ///
    /// # Safety
    /// `src..src+bytes` must stay valid until the next `synchronize`.
    unsafe fn send(&self, src: DevicePtr, bytes: usize, peer: Rank) -> Result<()>;

    /// Queue a receive of `bytes` bytes from `peer` into `dst`.
    ///
    /// # Safety
    /// `dst..dst+bytes` must stay valid and untouched until the next
    /// `synchronize`.
    unsafe fn recv(&self, dst: DevicePtr, bytes: usize, peer: Rank) -> Result<()>;

    /// Close the envelope; the outermost close submits the queued transfers.
    fn group_end(&self) -> Result<()>;

    /// Block until every submitted transfer has completed.
    fn synchronize(&self) -> Result<()>;
}

#[derive(Clone, Copy)]
enum QueuedOp {
    Send { src: DevicePtr, bytes: usize, peer: Rank },
    Recv { dst: DevicePtr, bytes: usize, peer: Rank },
}

#[derive(Default)]
struct LoopbackState {
    depth: usize,
    queued: Vec<QueuedOp>,
    inflight: Vec<PendingOp>,
}

/// Collective library realised over the control channel's data path.
///
/// Transfers queued inside an envelope are submitted at the outermost
/// `group_end`, sends before receives.
pub struct LoopbackCollective {
    channel: Rc<dyn ControlChannel>,
    state: RefCell<LoopbackState>,
}

impl LoopbackCollective {
    pub fn new(channel: Rc<dyn ControlChannel>) -> Self {
        Self {
            channel,
            state: RefCell::new(LoopbackState::default()),
        }
    }

    /// # Safety
    /// See [`CollectiveLibrary::send`] and [`CollectiveLibrary::recv`].
    unsafe fn submit(&self, op: QueuedOp) -> Result<PendingOp> {
        match op {
            QueuedOp::Send { src, bytes, peer } => {
                self.channel.isend(peer, TAG_COLLECTIVE, src, bytes)
            }
            QueuedOp::Recv { dst, bytes, peer } => {
                self.channel.irecv(peer, TAG_COLLECTIVE, dst, bytes)
            }
        }
    }

    unsafe fn enqueue(&self, op: QueuedOp) -> Result<()> {
        if self.state.borrow().depth > 0 {
            self.state.borrow_mut().queued.push(op);
            return Ok(());
        }
        let pending = self.submit(op)?;
        self.state.borrow_mut().inflight.push(pending);
        Ok(())
    }
}

impl CollectiveLibrary for LoopbackCollective {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn group_start(&self) -> Result<()> {
        self.state.borrow_mut().depth += 1;
        Ok(())
    }

    unsafe fn send(&self, src: DevicePtr, bytes: usize, peer: Rank) -> Result<()> {
        self.enqueue(QueuedOp::Send { src, bytes, peer })
    }

    unsafe fn recv(&self, dst: DevicePtr, bytes: usize, peer: Rank) -> Result<()> {
        self.enqueue(QueuedOp::Recv { dst, bytes, peer })
    }

    fn group_end(&self) -> Result<()> {
        let queued = {
            let mut state = self.state.borrow_mut();
            state.depth = state.depth.saturating_sub(1);
            if state.depth > 0 {
                return Ok(());
            }
            std::mem::take(&mut state.queued)
        };
        let (sends, recvs): (Vec<_>, Vec<_>) = queued
            .into_iter()
            .partition(|op| matches!(op, QueuedOp::Send { .. }));
        for op in sends.into_iter().chain(recvs) {
            // SAFETY: validity was promised by whoever queued the op.
            let pending = unsafe { self.submit(op)? };
            self.state.borrow_mut().inflight.push(pending);
        }
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        let inflight = std::mem::take(&mut self.state.borrow_mut().inflight);
        self.channel.wait_all(inflight)
    }
}

struct CollectiveEdge {
    peer: Rank,
    ptr: DevicePtr,
    bytes: usize,
}

/// Grouped send/recv through the group's collective library.
pub struct CollectiveTransport {
    library: Rc<dyn CollectiveLibrary>,
    sends: Vec<CollectiveEdge>,
    recvs: Vec<CollectiveEdge>,
}

impl CollectiveTransport {
    pub fn new(library: Rc<dyn CollectiveLibrary>) -> Self {
        Self {
            library,
            sends: Vec::new(),
            recvs: Vec::new(),
        }
    }
}

impl Transport for CollectiveTransport {
    fn setup_send(&mut self, _group: &ProcessGroup, edge: &Edge) -> Result<()> {
        self.sends.push(CollectiveEdge {
            peer: edge.receiver,
            ptr: edge.send_ptr(),
            bytes: edge.bytes,
        });
        Ok(())
    }

    fn setup_recv(&mut self, _group: &ProcessGroup, edge: &Edge) -> Result<()> {
        self.recvs.push(CollectiveEdge {
            peer: edge.sender,
            ptr: edge.recv_ptr(),
            bytes: edge.bytes,
        });
        Ok(())
    }

    fn start(&mut self, _group: &ProcessGroup) -> Result<()> {
        self.library.group_start()?;
        for edge in &self.sends {
            // SAFETY: the pattern borrows the buffers for its whole lifetime.
            unsafe { self.library.send(edge.ptr, edge.bytes, edge.peer)? };
        }
        for edge in &self.recvs {
            // SAFETY: as above.
            unsafe { self.library.recv(edge.ptr, edge.bytes, edge.peer)? };
        }
        self.library.group_end()
    }

    fn wait(&mut self, _group: &ProcessGroup) -> Result<()> {
        self.library.synchronize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceBuffer, DeviceRuntime};
    use crate::group::LocalWorld;

    #[test]
    fn envelope_exchanges_in_both_directions() {
        let results = LocalWorld::run(2, |group| {
            let rt: &Rc<dyn DeviceRuntime> = group.device();
            let peer = 1 - group.rank();
            let mine = DeviceBuffer::from_slice(rt, &[group.rank() as u32 + 1; 4]).unwrap();
            let theirs = DeviceBuffer::<u32>::new(rt, 4).unwrap();

            let library = group.collective();
            library.group_start().unwrap();
            unsafe {
                library.send(mine.ptr(), mine.size_bytes(), peer).unwrap();
                library.recv(theirs.ptr(), theirs.size_bytes(), peer).unwrap();
            }
            library.group_end().unwrap();
            library.synchronize().unwrap();
            theirs.to_vec().unwrap()
        })
        .unwrap();
        assert_eq!(results[0], vec![2; 4]);
        assert_eq!(results[1], vec![1; 4]);
    }

    #[test]
    fn nested_envelope_submits_at_outermost_end() {
        LocalWorld::run(1, |group| {
            let rt = group.device();
            let src = DeviceBuffer::from_slice(rt, &[9u8; 3]).unwrap();
            let dst = DeviceBuffer::<u8>::new(rt, 3).unwrap();
            let library = LoopbackCollective::new(Rc::new(crate::group::LocalChannel::solo()));

            library.group_start().unwrap();
            library.group_start().unwrap();
            unsafe { library.send(src.ptr(), 3, 0).unwrap() };
            library.group_end().unwrap();
            assert_eq!(library.state.borrow().queued.len(), 1);
            unsafe { library.recv(dst.ptr(), 3, 0).unwrap() };
            library.group_end().unwrap();
            assert!(library.state.borrow().queued.is_empty());
            library.synchronize().unwrap();
            assert_eq!(dst.to_vec().unwrap(), vec![9; 3]);
        })
        .unwrap();
    }
}
