//! NCCL point-to-point as a [`CollectiveLibrary`].

use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaStream};
use cudarc::nccl::sys::{
    ncclCommDestroy, ncclCommInitRank, ncclComm_t, ncclDataType_t, ncclGetUniqueId, ncclGroupEnd,
    ncclGroupStart, ncclRecv, ncclResult_t, ncclSend, ncclUniqueId,
};

use super::CollectiveLibrary;
use crate::device::DevicePtr;
use crate::error::{BenchError, Result};
use crate::group::{ProcessGroup, Rank};

const UNIQUE_ID_BYTES: usize = 128;

fn check_nccl(result: ncclResult_t, what: &str) -> Result<()> {
    if result == ncclResult_t::ncclSuccess {
        Ok(())
    } else {
        Err(BenchError::Transport(format!("{what}: {result:?}")))
    }
}

/// NCCL communicator spanning the group, with a dedicated stream.
pub struct NcclLibrary {
    comm: ncclComm_t,
    stream: Arc<CudaStream>,
}

impl NcclLibrary {
    /// Collective over the group: rank 0 creates the unique id and broadcasts
    /// it through the control channel, then every rank joins.
    pub fn new(group: &ProcessGroup, ctx: &Arc<CudaContext>) -> Result<Self> {
        let mut id = [0u8; UNIQUE_ID_BYTES];
        if group.rank() == 0 {
            let mut raw = MaybeUninit::<ncclUniqueId>::uninit();
            // SAFETY: ncclGetUniqueId initializes the struct on success.
            check_nccl(unsafe { ncclGetUniqueId(raw.as_mut_ptr()) }, "ncclGetUniqueId")?;
            // SAFETY: initialized above.
            let raw = unsafe { raw.assume_init() };
            for (dst, &src) in id.iter_mut().zip(raw.internal.iter()) {
                *dst = src as u8;
            }
        }
        group.channel().broadcast_bytes(0, &mut id)?;

        let mut unique = ncclUniqueId {
            internal: [0; UNIQUE_ID_BYTES],
        };
        for (dst, &src) in unique.internal.iter_mut().zip(id.iter()) {
            *dst = src as _;
        }

        let stream = ctx
            .new_stream()
            .map_err(|e| BenchError::Setup(format!("failed to create NCCL stream: {e:?}")))?;
        let mut comm = MaybeUninit::<ncclComm_t>::uninit();
        // SAFETY: every rank calls this with the same id.
        check_nccl(
            unsafe {
                ncclCommInitRank(
                    comm.as_mut_ptr(),
                    group.size() as i32,
                    unique,
                    group.rank() as i32,
                )
            },
            "ncclCommInitRank",
        )?;
        // SAFETY: initialized by the successful call above.
        let comm = unsafe { comm.assume_init() };
        if group.is_print_rank() {
            tracing::info!(ranks = group.size(), "NCCL communicator initialized");
        }
        Ok(Self { comm, stream })
    }
}

impl CollectiveLibrary for NcclLibrary {
    fn name(&self) -> &'static str {
        "nccl"
    }

    fn group_start(&self) -> Result<()> {
        // SAFETY: plain NCCL call.
        check_nccl(unsafe { ncclGroupStart() }, "ncclGroupStart")
    }

    unsafe fn send(&self, src: DevicePtr, bytes: usize, peer: Rank) -> Result<()> {
        check_nccl(
            ncclSend(
                src.addr() as usize as *const c_void,
                bytes,
                ncclDataType_t::ncclInt8,
                peer as i32,
                self.comm,
                self.stream.cu_stream().cast(),
            ),
            "ncclSend",
        )
    }

    unsafe fn recv(&self, dst: DevicePtr, bytes: usize, peer: Rank) -> Result<()> {
        check_nccl(
            ncclRecv(
                dst.addr() as usize as *mut c_void,
                bytes,
                ncclDataType_t::ncclInt8,
                peer as i32,
                self.comm,
                self.stream.cu_stream().cast(),
            ),
            "ncclRecv",
        )
    }

    fn group_end(&self) -> Result<()> {
        // SAFETY: plain NCCL call.
        check_nccl(unsafe { ncclGroupEnd() }, "ncclGroupEnd")
    }

    fn synchronize(&self) -> Result<()> {
        self.stream
            .synchronize()
            .map_err(|e| BenchError::Transport(format!("NCCL stream synchronize failed: {e:?}")))
    }
}

impl Drop for NcclLibrary {
    fn drop(&mut self) {
        // SAFETY: the communicator is owned and destroyed once.
        let result = unsafe { ncclCommDestroy(self.comm) };
        if let Err(e) = check_nccl(result, "ncclCommDestroy") {
            tracing::warn!(error = %e, "failed to destroy NCCL communicator");
        }
    }
}
