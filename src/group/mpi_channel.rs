//! MPI control channel.
//!
//! Requires the `distributed` feature flag and an MPI installation. If the
//! host application already initialized MPI, that runtime is reused and the
//! host stays responsible for finalizing it; otherwise this channel
//! initializes MPI and finalizes it in [`ControlChannel::finalize`].
//!
//! All traffic goes through a private duplicate of the world communicator so
//! it cannot match messages of the host application.
//!
//! ```ignore
//! let channel = MpiChannel::init()?;
//! let group = ProcessGroup::new(Box::new(channel), Rc::new(HostRuntime::new()));
//! ```

use std::ffi::{c_int, c_void};

use mpi::environment::Universe;
use mpi::ffi;
use mpi::raw::AsRaw;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use super::{Completion, ControlChannel, PendingOp, Rank, Tag};
use crate::device::DevicePtr;
use crate::error::{BenchError, Result};

/// MPI-based control channel over a duplicated world communicator.
pub struct MpiChannel {
    comm: Option<SimpleCommunicator>,
    universe: Option<Universe>,
    rank: Rank,
    size: usize,
}

impl MpiChannel {
    /// Initialize MPI if needed and duplicate the world communicator.
    pub fn init() -> Result<Self> {
        let universe = if mpi::environment::is_initialized() {
            None
        } else {
            Some(
                mpi::initialize()
                    .ok_or_else(|| BenchError::Transport("MPI initialization failed".into()))?,
            )
        };
        let comm = SimpleCommunicator::world().duplicate();
        let rank = comm.rank() as Rank;
        let size = comm.size() as usize;
        if rank == 0 {
            if universe.is_some() {
                tracing::info!("MPI initialized; finalized by the benchmark");
            } else {
                tracing::info!("reusing host MPI runtime; host is responsible for finalizing");
            }
            tracing::info!(ranks = size, "private MPI communicator created");
        }
        Ok(Self {
            comm: Some(comm),
            universe,
            rank,
            size,
        })
    }

    fn comm(&self) -> Result<&SimpleCommunicator> {
        self.comm
            .as_ref()
            .ok_or_else(|| BenchError::Transport("MPI channel already finalized".into()))
    }
}

fn check(code: c_int, what: &str) -> Result<()> {
    if code == ffi::MPI_SUCCESS as c_int {
        Ok(())
    } else {
        Err(BenchError::Transport(format!("{what} failed with code {code}")))
    }
}

fn byte_count(bytes: usize) -> Result<c_int> {
    c_int::try_from(bytes).map_err(|_| {
        BenchError::Usage(format!("{bytes} bytes exceed a single MPI message"))
    })
}

impl ControlChannel for MpiChannel {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, dest: Rank, tag: Tag, payload: &[u8]) -> Result<()> {
        self.comm()?
            .process_at_rank(dest as i32)
            .send_with_tag(payload, tag);
        Ok(())
    }

    fn recv(&self, src: Rank, tag: Tag, payload: &mut [u8]) -> Result<()> {
        self.comm()?
            .process_at_rank(src as i32)
            .receive_into_with_tag(payload, tag);
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        self.comm()?.barrier();
        Ok(())
    }

    fn broadcast_bytes(&self, root: Rank, buf: &mut [u8]) -> Result<()> {
        self.comm()?.process_at_rank(root as i32).broadcast_into(buf);
        Ok(())
    }

    fn all_gather_bytes(&self, local: &[u8], out: &mut [u8]) -> Result<()> {
        if out.len() != local.len() * self.size {
            return Err(BenchError::Usage(format!(
                "all-gather output holds {} bytes, expected {}",
                out.len(),
                local.len() * self.size
            )));
        }
        self.comm()?.all_gather_into(local, out);
        Ok(())
    }

    unsafe fn isend(&self, dest: Rank, tag: Tag, src: DevicePtr, bytes: usize) -> Result<PendingOp> {
        let count = byte_count(bytes)?;
        let mut request = ffi::RSMPI_REQUEST_NULL;
        let code = ffi::MPI_Isend(
            src.as_ptr() as *const c_void,
            count,
            ffi::RSMPI_UINT8_T,
            dest as c_int,
            tag,
            self.comm()?.as_raw(),
            &mut request,
        );
        check(code, "MPI_Isend")?;
        Ok(Box::new(MpiRequest(request)))
    }

    unsafe fn irecv(&self, src: Rank, tag: Tag, dst: DevicePtr, bytes: usize) -> Result<PendingOp> {
        let count = byte_count(bytes)?;
        let mut request = ffi::RSMPI_REQUEST_NULL;
        let code = ffi::MPI_Irecv(
            dst.as_mut_ptr() as *mut c_void,
            count,
            ffi::RSMPI_UINT8_T,
            src as c_int,
            tag,
            self.comm()?.as_raw(),
            &mut request,
        );
        check(code, "MPI_Irecv")?;
        Ok(Box::new(MpiRequest(request)))
    }

    fn finalize(&mut self) -> Result<()> {
        if mpi::environment::is_finalized() {
            // The host tore MPI down underneath us; freeing handles now is invalid.
            if let Some(comm) = self.comm.take() {
                std::mem::forget(comm);
            }
            if let Some(universe) = self.universe.take() {
                std::mem::forget(universe);
            }
            return Ok(());
        }
        self.comm.take();
        if self.universe.take().is_some() && self.rank == 0 {
            tracing::info!("MPI finalized");
        }
        Ok(())
    }
}

impl Drop for MpiChannel {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            tracing::warn!(?e, "failed to finalize MPI channel");
        }
    }
}

struct MpiRequest(ffi::MPI_Request);

impl Completion for MpiRequest {
    fn wait(mut self: Box<Self>) -> Result<()> {
        // SAFETY: the request was produced by MPI_Isend/MPI_Irecv and is waited once.
        let code = unsafe { ffi::MPI_Wait(&mut self.0, ffi::RSMPI_STATUS_IGNORE) };
        check(code, "MPI_Wait")
    }
}
