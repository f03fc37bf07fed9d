//! Transport backends.
//!
//! A [`Transport`] owns the per-edge state of one pattern for one library.
//! The pattern calls `setup_send` on the sending rank and `setup_recv` on the
//! receiving rank of every edge, in registration order, then drives repeated
//! `start`/`wait` cycles. Resources created during setup are released when the
//! transport is dropped.

pub mod collective;
pub mod direct;
pub mod exchange;
pub mod message;
#[cfg(feature = "cuda")]
pub mod nccl;
pub mod null;
pub mod rma;

pub use collective::{CollectiveLibrary, CollectiveTransport, LoopbackCollective};
pub use direct::{DirectAccess, DirectTransport, IpcAccess, RmaAccess};
pub use message::MessageTransport;
#[cfg(feature = "cuda")]
pub use nccl::NcclLibrary;
pub use null::NullTransport;
pub use rma::{MappedRma, RmaLayer};

use std::fmt;
use std::rc::Rc;

use clap::ValueEnum;

use crate::device::DevicePtr;
use crate::error::Result;
use crate::group::{ProcessGroup, Rank};

/// Transfer mechanism a pattern is built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Library {
    /// No transfer at all; measures harness overhead.
    Null,
    /// Two-sided non-blocking message passing.
    Mpi,
    /// Grouped point-to-point calls of a collective library.
    Xccl,
    /// Sender copies into the receiver's memory through an IPC handle.
    IpcPut,
    /// Receiver copies out of the sender's memory through an IPC handle.
    IpcGet,
    /// Sender puts into the receiver's registered segment.
    RmaPut,
    /// Receiver gets from the sender's registered segment.
    RmaGet,
}

impl Library {
    pub const ALL: [Library; 7] = [
        Library::Null,
        Library::Mpi,
        Library::Xccl,
        Library::IpcPut,
        Library::IpcGet,
        Library::RmaPut,
        Library::RmaGet,
    ];

    /// Whether edges of this library run the handle exchange at setup.
    pub fn exchanges_handles(self) -> bool {
        matches!(
            self,
            Library::IpcPut | Library::IpcGet | Library::RmaPut | Library::RmaGet
        )
    }

    /// Build the transport for a new pattern on `group`.
    pub fn transport(self, group: &ProcessGroup, tolerate_setup_failures: bool) -> Box<dyn Transport> {
        let ipc = || Rc::new(IpcAccess::new(Rc::clone(group.device()))) as Rc<dyn DirectAccess>;
        let rma = || {
            let layer = Rc::new(MappedRma::new(Rc::clone(group.device())));
            Rc::new(RmaAccess::new(layer)) as Rc<dyn DirectAccess>
        };
        match self {
            Library::Null => Box::new(NullTransport),
            Library::Mpi => Box::new(MessageTransport::new()),
            Library::Xccl => Box::new(CollectiveTransport::new(group.collective())),
            Library::IpcPut => Box::new(DirectTransport::push(ipc(), tolerate_setup_failures)),
            Library::IpcGet => Box::new(DirectTransport::pull(ipc(), tolerate_setup_failures)),
            Library::RmaPut => Box::new(DirectTransport::push(rma(), tolerate_setup_failures)),
            Library::RmaGet => Box::new(DirectTransport::pull(rma(), tolerate_setup_failures)),
        }
    }
}

impl fmt::Display for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Library::Null => "null",
            Library::Mpi => "MPI",
            Library::Xccl => "XCCL",
            Library::IpcPut => "IPC (PUT)",
            Library::IpcGet => "IPC (GET)",
            Library::RmaPut => "RMA (PUT)",
            Library::RmaGet => "RMA (GET)",
        };
        f.write_str(name)
    }
}

/// Byte-level description of one registered edge as seen by a participant.
///
/// Buffer bases are null on ranks that do not own the buffer. Offsets are in
/// bytes from the base.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub sender: Rank,
    pub receiver: Rank,
    pub send_base: DevicePtr,
    pub send_offset: usize,
    pub recv_base: DevicePtr,
    pub recv_offset: usize,
    pub bytes: usize,
}

impl Edge {
    pub fn send_ptr(&self) -> DevicePtr {
        self.send_base.byte_add(self.send_offset)
    }

    pub fn recv_ptr(&self) -> DevicePtr {
        self.recv_base.byte_add(self.recv_offset)
    }

    pub fn is_self(&self) -> bool {
        self.sender == self.receiver
    }
}

/// Setup-time and run-time behaviour of one backend variant.
pub trait Transport {
    /// Create send-side state for `edge` on its sending rank.
    fn setup_send(&mut self, group: &ProcessGroup, edge: &Edge) -> Result<()>;

    /// Create receive-side state for `edge` on its receiving rank.
    fn setup_recv(&mut self, group: &ProcessGroup, edge: &Edge) -> Result<()>;

    /// Issue every local transfer.
    fn start(&mut self, group: &ProcessGroup) -> Result<()>;

    /// Block until every transfer issued by `start` has completed.
    fn wait(&mut self, group: &ProcessGroup) -> Result<()>;

    /// Remote handles this rank opened during setup.
    fn handle_exchanges(&self) -> usize {
        0
    }
}
