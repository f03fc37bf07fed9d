//! Direct device-memory access backends (IPC and RMA, push and pull).
//!
//! Push: the sender copies into the receiver's memory. At `wait` the sender
//! synchronizes its queue and acknowledges, and the receiver blocks on that
//! acknowledgment before it may read the destination.
//!
//! Pull: at `start` the sender signals that its buffer is ready and the
//! receiver issues the copy out of it. At `wait` the receiver synchronizes and
//! acknowledges back, so the sender does not reuse its buffer while a pull is
//! still reading it.
//!
//! Self-edges skip the handle exchange and the acknowledgments; the copy runs
//! on a local queue.

use std::rc::Rc;

use super::exchange::{self, RemoteRegion};
use super::rma::RmaLayer;
use super::{Edge, Transport};
use crate::device::{DevicePtr, DeviceRuntime, MemHandle, StreamId};
use crate::error::{BenchError, Result};
use crate::group::{ProcessGroup, Rank, TAG_ACK};

/// Memory-handle and asynchronous-copy primitives of a direct-access backend.
pub trait DirectAccess {
    fn export(&self, base: DevicePtr) -> Result<MemHandle>;

    fn open(&self, handle: &MemHandle) -> Result<DevicePtr>;

    fn close(&self, base: DevicePtr) -> Result<()>;

    /// Create a queue for one edge's asynchronous copies.
    fn create_queue(&self) -> Result<StreamId>;

    fn destroy_queue(&self, queue: StreamId) -> Result<()>;

    /// Write `bytes` bytes from local `src` to remote `dst`.
    fn push(&self, queue: StreamId, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Result<()>;

    /// Read `bytes` bytes from remote `src` into local `dst`.
    fn pull(&self, queue: StreamId, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Result<()>;

    /// Block until every copy issued on `queue` has landed.
    fn synchronize(&self, queue: StreamId) -> Result<()>;
}

/// Device runtime IPC handles and streams.
pub struct IpcAccess {
    device: Rc<dyn DeviceRuntime>,
}

impl IpcAccess {
    pub fn new(device: Rc<dyn DeviceRuntime>) -> Self {
        Self { device }
    }
}

impl DirectAccess for IpcAccess {
    fn export(&self, base: DevicePtr) -> Result<MemHandle> {
        self.device.export_handle(base)
    }

    fn open(&self, handle: &MemHandle) -> Result<DevicePtr> {
        self.device.open_handle(handle)
    }

    fn close(&self, base: DevicePtr) -> Result<()> {
        self.device.close_handle(base)
    }

    fn create_queue(&self) -> Result<StreamId> {
        self.device.create_stream()
    }

    fn destroy_queue(&self, queue: StreamId) -> Result<()> {
        self.device.destroy_stream(queue)
    }

    fn push(&self, queue: StreamId, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Result<()> {
        self.device.copy_async(queue, dst, src, bytes)
    }

    fn pull(&self, queue: StreamId, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Result<()> {
        self.device.copy_async(queue, dst, src, bytes)
    }

    fn synchronize(&self, queue: StreamId) -> Result<()> {
        self.device.synchronize(queue)
    }
}

/// Registered segments and one-sided put/get of an RMA layer.
pub struct RmaAccess {
    layer: Rc<dyn RmaLayer>,
}

impl RmaAccess {
    pub fn new(layer: Rc<dyn RmaLayer>) -> Self {
        Self { layer }
    }
}

impl DirectAccess for RmaAccess {
    fn export(&self, base: DevicePtr) -> Result<MemHandle> {
        self.layer.register_segment(base)
    }

    fn open(&self, handle: &MemHandle) -> Result<DevicePtr> {
        self.layer.attach_segment(handle)
    }

    fn close(&self, base: DevicePtr) -> Result<()> {
        self.layer.detach_segment(base)
    }

    fn create_queue(&self) -> Result<StreamId> {
        self.layer.create_endpoint()
    }

    fn destroy_queue(&self, queue: StreamId) -> Result<()> {
        self.layer.destroy_endpoint(queue)
    }

    fn push(&self, queue: StreamId, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Result<()> {
        self.layer.put_nbi(queue, dst, src, bytes)
    }

    fn pull(&self, queue: StreamId, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Result<()> {
        self.layer.get_nbi(queue, dst, src, bytes)
    }

    fn synchronize(&self, queue: StreamId) -> Result<()> {
        self.layer.quiet(queue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Push,
    Pull,
}

/// State of an edge on the rank that issues its copies.
struct Initiator {
    peer: Rank,
    local: DevicePtr,
    remote: DevicePtr,
    mapping: Option<RemoteRegion>,
    queue: StreamId,
    bytes: usize,
    handshake: bool,
}

/// State of an edge on the rank whose memory is accessed.
struct Target {
    peer: Rank,
    mapped: bool,
}

/// Push or pull over a [`DirectAccess`] backend.
pub struct DirectTransport {
    access: Rc<dyn DirectAccess>,
    mode: Mode,
    tolerate_setup_failures: bool,
    initiators: Vec<Initiator>,
    targets: Vec<Target>,
    exchanges: usize,
}

const ACK: u8 = 1;

impl DirectTransport {
    pub fn push(access: Rc<dyn DirectAccess>, tolerate_setup_failures: bool) -> Self {
        Self::new(access, Mode::Push, tolerate_setup_failures)
    }

    pub fn pull(access: Rc<dyn DirectAccess>, tolerate_setup_failures: bool) -> Self {
        Self::new(access, Mode::Pull, tolerate_setup_failures)
    }

    fn new(access: Rc<dyn DirectAccess>, mode: Mode, tolerate_setup_failures: bool) -> Self {
        Self {
            access,
            mode,
            tolerate_setup_failures,
            initiators: Vec::new(),
            targets: Vec::new(),
            exchanges: 0,
        }
    }

    /// Register the initiating side of `edge`: map the peer's memory unless
    /// the edge is local, and create the edge's queue.
    fn setup_initiator(
        &mut self,
        group: &ProcessGroup,
        peer: Rank,
        local: DevicePtr,
        local_remote: DevicePtr,
        edge: &Edge,
    ) -> Result<()> {
        let (remote, mapping) = if edge.is_self() {
            (local_remote, None)
        } else {
            match exchange::accept(group, self.access.as_ref(), peer) {
                Ok(region) => {
                    self.exchanges += 1;
                    (region.addr, Some(region))
                }
                Err(e) if self.tolerate_setup_failures => {
                    tracing::error!(peer, error = %e, "handle exchange failed, keeping edge");
                    (DevicePtr::NULL, None)
                }
                Err(e) => return Err(e),
            }
        };
        let queue = match self.access.create_queue() {
            Ok(queue) => queue,
            Err(e) => {
                if let Some(region) = mapping {
                    if let Err(close) = self.access.close(region.base) {
                        tracing::warn!(error = %close, "failed to close remote handle");
                    }
                }
                return Err(e);
            }
        };
        self.initiators.push(Initiator {
            peer,
            local,
            remote,
            mapping,
            queue,
            bytes: edge.bytes,
            handshake: !edge.is_self(),
        });
        Ok(())
    }

    /// Register the target side of `edge`: offer a handle to the peer unless
    /// the edge is local.
    fn setup_target(
        &mut self,
        group: &ProcessGroup,
        peer: Rank,
        base: DevicePtr,
        offset: usize,
        edge: &Edge,
    ) -> Result<()> {
        if edge.is_self() {
            return Ok(());
        }
        let mapped = match exchange::offer(group, self.access.as_ref(), peer, base, offset) {
            Ok(()) => true,
            Err(e) if self.tolerate_setup_failures => {
                tracing::error!(peer, error = %e, "handle exchange failed, keeping edge");
                false
            }
            Err(e) => return Err(e),
        };
        self.targets.push(Target { peer, mapped });
        Ok(())
    }

    /// Both sides of an edge whose exchange failed refuse to start, so
    /// neither waits on the other.
    fn check_mapped(&self) -> Result<()> {
        let unmapped = self
            .initiators
            .iter()
            .find(|e| e.remote.is_null())
            .map(|e| e.peer)
            .or_else(|| self.targets.iter().find(|t| !t.mapped).map(|t| t.peer));
        if let Some(peer) = unmapped {
            return Err(BenchError::Usage(format!(
                "edge with rank {peer} has no mapped remote memory"
            )));
        }
        Ok(())
    }

    fn send_ack(group: &ProcessGroup, peer: Rank) -> Result<()> {
        group.send_value(peer, TAG_ACK, &ACK)
    }

    fn recv_ack(group: &ProcessGroup, peer: Rank) -> Result<()> {
        let _: u8 = group.recv_value(peer, TAG_ACK)?;
        Ok(())
    }
}

impl Transport for DirectTransport {
    fn setup_send(&mut self, group: &ProcessGroup, edge: &Edge) -> Result<()> {
        match self.mode {
            Mode::Push => {
                self.setup_initiator(group, edge.receiver, edge.send_ptr(), edge.recv_ptr(), edge)
            }
            Mode::Pull => {
                self.setup_target(group, edge.receiver, edge.send_base, edge.send_offset, edge)
            }
        }
    }

    fn setup_recv(&mut self, group: &ProcessGroup, edge: &Edge) -> Result<()> {
        match self.mode {
            Mode::Push => {
                self.setup_target(group, edge.sender, edge.recv_base, edge.recv_offset, edge)
            }
            Mode::Pull => {
                self.setup_initiator(group, edge.sender, edge.recv_ptr(), edge.send_ptr(), edge)
            }
        }
    }

    fn start(&mut self, group: &ProcessGroup) -> Result<()> {
        self.check_mapped()?;
        match self.mode {
            Mode::Push => {
                for edge in &self.initiators {
                    self.access
                        .push(edge.queue, edge.remote, edge.local, edge.bytes)?;
                }
            }
            Mode::Pull => {
                for target in &self.targets {
                    Self::send_ack(group, target.peer)?;
                }
                for edge in &self.initiators {
                    if edge.handshake {
                        Self::recv_ack(group, edge.peer)?;
                    }
                    self.access
                        .pull(edge.queue, edge.local, edge.remote, edge.bytes)?;
                }
            }
        }
        Ok(())
    }

    // Same handshake in both modes: the initiator owns the queue.
    fn wait(&mut self, group: &ProcessGroup) -> Result<()> {
        for edge in &self.initiators {
            self.access.synchronize(edge.queue)?;
            if edge.handshake {
                Self::send_ack(group, edge.peer)?;
            }
        }
        for target in &self.targets {
            Self::recv_ack(group, target.peer)?;
        }
        Ok(())
    }

    fn handle_exchanges(&self) -> usize {
        self.exchanges
    }
}

impl Drop for DirectTransport {
    fn drop(&mut self) {
        for edge in self.initiators.drain(..) {
            if let Err(e) = self.access.destroy_queue(edge.queue) {
                tracing::warn!(peer = edge.peer, error = %e, "failed to destroy edge queue");
            }
            if let Some(region) = edge.mapping {
                if let Err(e) = self.access.close(region.base) {
                    tracing::warn!(peer = edge.peer, error = %e, "failed to close remote handle");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceBuffer, HostRuntime};

    fn edge(rank: usize, bytes: usize) -> Edge {
        Edge {
            sender: rank,
            receiver: rank,
            send_base: DevicePtr::NULL,
            send_offset: 0,
            recv_base: DevicePtr::NULL,
            recv_offset: 0,
            bytes,
        }
    }

    #[test]
    fn self_push_copies_locally_without_exchange() {
        crate::group::LocalWorld::run(1, |group| {
            let rt = group.device();
            let src = DeviceBuffer::from_slice(rt, &[5u16; 6]).unwrap();
            let dst = DeviceBuffer::<u16>::new(rt, 6).unwrap();
            let access: Rc<dyn DirectAccess> = Rc::new(IpcAccess::new(Rc::clone(rt)));
            let mut transport = DirectTransport::push(access, false);

            let e = Edge {
                send_base: src.ptr(),
                recv_base: dst.ptr(),
                send_offset: 2,
                recv_offset: 4,
                ..edge(0, 4)
            };
            transport.setup_send(&group, &e).unwrap();
            transport.setup_recv(&group, &e).unwrap();
            transport.start(&group).unwrap();
            transport.wait(&group).unwrap();

            assert_eq!(transport.handle_exchanges(), 0);
            assert_eq!(dst.to_vec().unwrap(), vec![0, 0, 5, 5, 0, 0]);
        })
        .unwrap();
    }

    #[test]
    fn drop_releases_queues() {
        let rt = Rc::new(HostRuntime::new());
        let group = crate::group::ProcessGroup::new(
            Box::new(crate::group::LocalChannel::solo()),
            rt.clone(),
        );
        let src = DeviceBuffer::from_slice(group.device(), &[1u8; 8]).unwrap();
        let dst = DeviceBuffer::<u8>::new(group.device(), 8).unwrap();
        let e = Edge {
            send_base: src.ptr(),
            recv_base: dst.ptr(),
            ..edge(0, 8)
        };
        let access: Rc<dyn DirectAccess> = Rc::new(IpcAccess::new(Rc::clone(group.device())));
        let mut transport = DirectTransport::pull(access, false);
        transport.setup_send(&group, &e).unwrap();
        transport.setup_recv(&group, &e).unwrap();
        assert_eq!(rt.live_streams(), 1);
        drop(transport);
        assert_eq!(rt.live_streams(), 0);
    }
}
