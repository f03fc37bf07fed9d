//! Two-sided message-passing backend.

use super::{Edge, Transport};
use crate::device::DevicePtr;
use crate::error::{BenchError, Result};
use crate::group::{PendingOp, ProcessGroup, Rank, TAG_DATA};

struct Endpoint {
    peer: Rank,
    ptr: DevicePtr,
    bytes: usize,
}

/// Non-blocking send/recv per edge, completed with wait-all.
#[derive(Default)]
pub struct MessageTransport {
    sends: Vec<Endpoint>,
    recvs: Vec<Endpoint>,
    pending: Vec<PendingOp>,
}

impl MessageTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn issue(&mut self, group: &ProcessGroup) -> Result<()> {
        let channel = group.channel();
        for send in &self.sends {
            // SAFETY: the pattern borrows the buffers for its whole lifetime and
            // waits before they can be touched again.
            let op = unsafe { channel.isend(send.peer, TAG_DATA, send.ptr, send.bytes)? };
            self.pending.push(op);
        }
        for recv in &self.recvs {
            // SAFETY: as above.
            let op = unsafe { channel.irecv(recv.peer, TAG_DATA, recv.ptr, recv.bytes)? };
            self.pending.push(op);
        }
        Ok(())
    }
}

impl Transport for MessageTransport {
    fn setup_send(&mut self, _group: &ProcessGroup, edge: &Edge) -> Result<()> {
        self.sends.push(Endpoint {
            peer: edge.receiver,
            ptr: edge.send_ptr(),
            bytes: edge.bytes,
        });
        Ok(())
    }

    fn setup_recv(&mut self, _group: &ProcessGroup, edge: &Edge) -> Result<()> {
        self.recvs.push(Endpoint {
            peer: edge.sender,
            ptr: edge.recv_ptr(),
            bytes: edge.bytes,
        });
        Ok(())
    }

    fn start(&mut self, group: &ProcessGroup) -> Result<()> {
        if !self.pending.is_empty() {
            return Err(BenchError::Usage("start called twice without wait".into()));
        }
        let issued = self.issue(group);
        if issued.is_err() {
            // Operations already in flight still own the buffers.
            let partial = std::mem::take(&mut self.pending);
            if let Err(e) = group.channel().wait_all(partial) {
                tracing::warn!(error = %e, "failed to complete partially issued transfers");
            }
        }
        issued
    }

    fn wait(&mut self, group: &ProcessGroup) -> Result<()> {
        group.channel().wait_all(std::mem::take(&mut self.pending))
    }
}

impl Drop for MessageTransport {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            tracing::warn!(
                pending = self.pending.len(),
                "message transport dropped with transfers in flight"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceBuffer, HostRuntime};
    use crate::group::{ControlChannel, LocalChannel, PendingOp, Tag};
    use std::cell::Cell;
    use std::rc::Rc;

    /// Loopback channel whose second non-blocking send is refused.
    struct FlakySend {
        inner: LocalChannel,
        sends: Cell<usize>,
    }

    impl ControlChannel for FlakySend {
        fn rank(&self) -> Rank {
            self.inner.rank()
        }

        fn size(&self) -> usize {
            self.inner.size()
        }

        fn send(&self, dest: Rank, tag: Tag, payload: &[u8]) -> Result<()> {
            self.inner.send(dest, tag, payload)
        }

        fn recv(&self, src: Rank, tag: Tag, payload: &mut [u8]) -> Result<()> {
            self.inner.recv(src, tag, payload)
        }

        fn barrier(&self) -> Result<()> {
            self.inner.barrier()
        }

        unsafe fn isend(
            &self,
            dest: Rank,
            tag: Tag,
            src: DevicePtr,
            bytes: usize,
        ) -> Result<PendingOp> {
            let n = self.sends.get() + 1;
            self.sends.set(n);
            if n == 2 {
                return Err(BenchError::Transport("send queue full".into()));
            }
            self.inner.isend(dest, tag, src, bytes)
        }

        unsafe fn irecv(
            &self,
            src: Rank,
            tag: Tag,
            dst: DevicePtr,
            bytes: usize,
        ) -> Result<PendingOp> {
            self.inner.irecv(src, tag, dst, bytes)
        }
    }

    #[test]
    fn failed_start_leaves_nothing_pending() {
        let channel = FlakySend {
            inner: LocalChannel::solo(),
            sends: Cell::new(0),
        };
        let group = ProcessGroup::new(Box::new(channel), Rc::new(HostRuntime::new()));
        let src = DeviceBuffer::from_slice(group.device(), &[7u8; 8]).unwrap();
        let dst = DeviceBuffer::<u8>::new(group.device(), 16).unwrap();
        let mut transport = MessageTransport::new();
        for half in 0..2 {
            let edge = Edge {
                sender: 0,
                receiver: 0,
                send_base: src.ptr(),
                send_offset: 0,
                recv_base: dst.ptr(),
                recv_offset: half * 8,
                bytes: 8,
            };
            transport.setup_send(&group, &edge).unwrap();
            transport.setup_recv(&group, &edge).unwrap();
        }

        assert!(matches!(
            transport.start(&group),
            Err(BenchError::Transport(_))
        ));
        assert!(transport.pending.is_empty());

        transport.start(&group).unwrap();
        transport.wait(&group).unwrap();
        assert_eq!(dst.to_vec().unwrap(), vec![7u8; 16]);
    }
}
