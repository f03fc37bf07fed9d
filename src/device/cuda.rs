//! CUDA device runtime over the cudarc driver API.

use std::cell::RefCell;
use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::sync::Arc;

use cudarc::driver::{result, sys, CudaContext, CudaStream, DriverError};

use super::{DevicePtr, DeviceRuntime, MemHandle, StreamId};
use crate::error::{BenchError, Result};

const IPC_HANDLE_BYTES: usize = std::mem::size_of::<sys::CUipcMemHandle>();

fn driver_err(what: &'static str) -> impl FnOnce(DriverError) -> BenchError {
    move |e| BenchError::Setup(format!("{what}: {e:?}"))
}

fn transport_err(what: &'static str) -> impl FnOnce(DriverError) -> BenchError {
    move |e| BenchError::Transport(format!("{what}: {e:?}"))
}

/// One CUDA context per rank, plus the streams created through it.
pub struct CudaRuntime {
    ctx: Arc<CudaContext>,
    streams: RefCell<Vec<Option<Arc<CudaStream>>>>,
    allocations: RefCell<HashMap<u64, usize>>,
}

impl CudaRuntime {
    pub fn new(ordinal: usize) -> Result<Self> {
        let ctx = CudaContext::new(ordinal).map_err(driver_err("failed to create CUDA context"))?;
        tracing::debug!(ordinal, "CUDA context created");
        Ok(Self {
            ctx,
            streams: RefCell::new(Vec::new()),
            allocations: RefCell::new(HashMap::new()),
        })
    }

    /// Pick the device round-robin from the rank, one GPU per local rank.
    pub fn for_rank(rank: usize) -> Result<Self> {
        let count =
            CudaContext::device_count().map_err(driver_err("failed to count CUDA devices"))?;
        if count <= 0 {
            return Err(BenchError::Setup("no CUDA device visible".into()));
        }
        Self::new(rank % count as usize)
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }

    /// The cudarc stream behind `stream`, for libraries that issue work on it.
    pub fn stream(&self, stream: StreamId) -> Result<Arc<CudaStream>> {
        self.streams
            .borrow()
            .get(stream.0)
            .and_then(Option::clone)
            .ok_or_else(|| BenchError::Usage(format!("{stream:?} is not a live stream")))
    }

    fn bind(&self) -> Result<()> {
        self.ctx
            .bind_to_thread()
            .map_err(driver_err("failed to bind CUDA context"))
    }
}

impl DeviceRuntime for CudaRuntime {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn alloc(&self, bytes: usize) -> Result<DevicePtr> {
        if bytes == 0 {
            return Err(BenchError::Usage("zero-byte allocation".into()));
        }
        self.bind()?;
        // SAFETY: context is current on this thread.
        let ptr = unsafe { result::malloc_sync(bytes) }.map_err(driver_err("cuMemAlloc failed"))?;
        self.allocations.borrow_mut().insert(ptr, bytes);
        Ok(DevicePtr::from_addr(ptr))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        self.bind()?;
        if self.allocations.borrow_mut().remove(&ptr.addr()).is_none() {
            return Err(BenchError::Usage(format!("free of unknown pointer {ptr:?}")));
        }
        // SAFETY: ptr came from malloc_sync and is freed once.
        unsafe { result::free_sync(ptr.addr()) }.map_err(driver_err("cuMemFree failed"))
    }

    fn copy_from_host(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        self.bind()?;
        // SAFETY: caller keeps dst..dst+len inside a live allocation.
        unsafe { result::memcpy_htod_sync(dst.addr(), src) }
            .map_err(transport_err("host-to-device copy failed"))
    }

    fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        self.bind()?;
        // SAFETY: caller keeps src..src+len inside a live allocation.
        unsafe { result::memcpy_dtoh_sync(dst, src.addr()) }
            .map_err(transport_err("device-to-host copy failed"))
    }

    fn copy(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Result<()> {
        self.bind()?;
        // SAFETY: caller keeps both ranges inside live allocations.
        unsafe { result::memcpy_dtod_sync(dst.addr(), src.addr(), bytes) }
            .map_err(transport_err("device-to-device copy failed"))
    }

    fn export_handle(&self, base: DevicePtr) -> Result<MemHandle> {
        self.bind()?;
        let mut handle = MaybeUninit::<sys::CUipcMemHandle>::uninit();
        // SAFETY: cuIpcGetMemHandle fills the handle for a base allocation.
        unsafe { sys::cuIpcGetMemHandle(handle.as_mut_ptr(), base.addr()) }
            .result()
            .map_err(driver_err("cuIpcGetMemHandle failed"))?;
        // SAFETY: initialized by the successful call above.
        let handle = unsafe { handle.assume_init() };
        let bytes = handle.reserved.iter().map(|&b| b as u8).collect();
        Ok(MemHandle::from_bytes(bytes))
    }

    fn open_handle(&self, handle: &MemHandle) -> Result<DevicePtr> {
        let payload = handle.as_bytes();
        if payload.len() != IPC_HANDLE_BYTES {
            return Err(BenchError::Setup(format!(
                "CUDA IPC handle of {} bytes, expected {IPC_HANDLE_BYTES}",
                payload.len()
            )));
        }
        let mut raw = sys::CUipcMemHandle {
            reserved: [0; IPC_HANDLE_BYTES],
        };
        for (dst, &src) in raw.reserved.iter_mut().zip(payload) {
            *dst = src as _;
        }

        self.bind()?;
        let mut ptr: sys::CUdeviceptr = 0;
        // SAFETY: raw is a handle exported by a peer process.
        unsafe {
            sys::cuIpcOpenMemHandle_v2(
                &mut ptr,
                raw,
                sys::CUipcMem_flags::CU_IPC_MEM_LAZY_ENABLE_PEER_ACCESS as u32,
            )
        }
        .result()
        .map_err(driver_err("cuIpcOpenMemHandle failed"))?;
        Ok(DevicePtr::from_addr(ptr))
    }

    fn close_handle(&self, base: DevicePtr) -> Result<()> {
        self.bind()?;
        // SAFETY: base was returned by cuIpcOpenMemHandle.
        unsafe { sys::cuIpcCloseMemHandle(base.addr()) }
            .result()
            .map_err(driver_err("cuIpcCloseMemHandle failed"))
    }

    fn create_stream(&self) -> Result<StreamId> {
        let stream = self
            .ctx
            .new_stream()
            .map_err(driver_err("failed to create CUDA stream"))?;
        let mut streams = self.streams.borrow_mut();
        streams.push(Some(stream));
        Ok(StreamId(streams.len() - 1))
    }

    fn destroy_stream(&self, stream: StreamId) -> Result<()> {
        let mut streams = self.streams.borrow_mut();
        match streams.get_mut(stream.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(BenchError::Usage(format!("{stream:?} is not a live stream"))),
        }
    }

    fn copy_async(&self, stream: StreamId, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Result<()> {
        let stream = self.stream(stream)?;
        self.bind()?;
        // SAFETY: both ranges lie in live local or opened peer allocations.
        unsafe { result::memcpy_dtod_async(dst.addr(), src.addr(), bytes, stream.cu_stream()) }
            .map_err(transport_err("cuMemcpyDtoDAsync failed"))
    }

    fn synchronize(&self, stream: StreamId) -> Result<()> {
        self.stream(stream)?
            .synchronize()
            .map_err(transport_err("stream synchronize failed"))
    }

    fn allocated_bytes(&self) -> usize {
        self.allocations.borrow().values().sum()
    }
}
