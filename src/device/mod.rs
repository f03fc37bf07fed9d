//! Device runtime abstraction.
//!
//! The benchmark only needs a small capability contract from the device
//! runtime: allocation, synchronous copies for setup, exportable memory
//! handles, and asynchronous device-to-device copies on explicit streams.
//!
//! Implementations: [`HostRuntime`] (host memory standing in for device
//! memory) and `CudaRuntime` (via cudarc, `cuda` feature).

#[cfg(feature = "cuda")]
pub mod cuda;
pub mod host;

#[cfg(feature = "cuda")]
pub use cuda::CudaRuntime;
pub use host::HostRuntime;

use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use bytemuck::Pod;

use crate::error::{BenchError, Result};

/// An address in the device runtime's address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub const fn from_addr(addr: u64) -> Self {
        DevicePtr(addr)
    }

    pub const fn addr(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset by `bytes` bytes.
    pub const fn byte_add(self, bytes: usize) -> Self {
        DevicePtr(self.0 + bytes as u64)
    }

    pub fn as_ptr(self) -> *const u8 {
        self.0 as usize as *const u8
    }

    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0 as usize as *mut u8
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr({:#x})", self.0)
    }
}

impl fmt::Pointer for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque exported memory handle. Size and content are runtime-defined.
#[derive(Clone, PartialEq, Eq)]
pub struct MemHandle(Vec<u8>);

impl MemHandle {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        MemHandle(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemHandle({} bytes)", self.0.len())
    }
}

/// Index of a stream created by a [`DeviceRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub usize);

/// Capability contract of a device runtime.
pub trait DeviceRuntime {
    fn name(&self) -> &'static str;

    fn alloc(&self, bytes: usize) -> Result<DevicePtr>;

    fn free(&self, ptr: DevicePtr) -> Result<()>;

    fn copy_from_host(&self, dst: DevicePtr, src: &[u8]) -> Result<()>;

    fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<()>;

    /// Synchronous device-to-device copy.
    fn copy(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Result<()>;

    /// Export a handle for the allocation starting at `base`.
    fn export_handle(&self, base: DevicePtr) -> Result<MemHandle>;

    /// Map a peer's exported allocation; returns its base in this process.
    fn open_handle(&self, handle: &MemHandle) -> Result<DevicePtr>;

    fn close_handle(&self, base: DevicePtr) -> Result<()>;

    fn create_stream(&self) -> Result<StreamId>;

    fn destroy_stream(&self, stream: StreamId) -> Result<()>;

    /// Enqueue an asynchronous device-to-device copy on `stream`.
    fn copy_async(&self, stream: StreamId, dst: DevicePtr, src: DevicePtr, bytes: usize)
        -> Result<()>;

    /// Block until every copy issued on `stream` has landed.
    fn synchronize(&self, stream: StreamId) -> Result<()>;

    /// Bytes currently allocated through this runtime.
    fn allocated_bytes(&self) -> usize;
}

/// Typed device allocation, freed on drop.
pub struct DeviceBuffer<T> {
    ptr: DevicePtr,
    len: usize,
    runtime: Rc<dyn DeviceRuntime>,
    _marker: PhantomData<T>,
}

impl<T: Pod> DeviceBuffer<T> {
    /// Allocate `len` elements. Contents are unspecified.
    pub fn new(runtime: &Rc<dyn DeviceRuntime>, len: usize) -> Result<Self> {
        let bytes = len.checked_mul(std::mem::size_of::<T>()).ok_or_else(|| {
            BenchError::Usage(format!("{len} elements overflow a byte size"))
        })?;
        let ptr = if bytes == 0 {
            DevicePtr::NULL
        } else {
            runtime.alloc(bytes)?
        };
        Ok(Self {
            ptr,
            len,
            runtime: Rc::clone(runtime),
            _marker: PhantomData,
        })
    }

    pub fn from_slice(runtime: &Rc<dyn DeviceRuntime>, data: &[T]) -> Result<Self> {
        let buffer = Self::new(runtime, data.len())?;
        buffer.write(0, data)?;
        Ok(buffer)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    /// Copy `data` from the host into elements `offset..offset+data.len()`.
    pub fn write(&self, offset: usize, data: &[T]) -> Result<()> {
        self.check_range(offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        self.runtime
            .copy_from_host(self.element(offset), bytemuck::cast_slice(data))
    }

    /// Copy elements `offset..offset+len` to the host.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<T>> {
        self.check_range(offset, len)?;
        let mut out = vec![T::zeroed(); len];
        if len > 0 {
            self.runtime
                .copy_to_host(bytemuck::cast_slice_mut(&mut out), self.element(offset))?;
        }
        Ok(out)
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.read(0, self.len)
    }

    pub fn view(&self) -> BufferRef<'_, T> {
        BufferRef {
            ptr: self.ptr,
            len: self.len,
            _marker: PhantomData,
        }
    }

    fn element(&self, index: usize) -> DevicePtr {
        self.ptr.byte_add(index * std::mem::size_of::<T>())
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(BenchError::Usage(format!(
                "elements {offset}+{len} outside a buffer of {}",
                self.len
            ))),
        }
    }
}

impl<T> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        if let Err(e) = self.runtime.free(self.ptr) {
            tracing::warn!(?e, ptr = ?self.ptr, "failed to free device buffer");
        }
    }
}

impl<T> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Non-owning view of a buffer registered into a pattern.
///
/// Ranks that do not own a buffer taking part in an edge pass
/// [`BufferRef::absent`].
pub struct BufferRef<'a, T> {
    ptr: DevicePtr,
    len: usize,
    _marker: PhantomData<&'a T>,
}

impl<'a, T> BufferRef<'a, T> {
    pub fn absent() -> Self {
        BufferRef {
            ptr: DevicePtr::NULL,
            len: 0,
            _marker: PhantomData,
        }
    }

    /// View memory not owned by a [`DeviceBuffer`].
    ///
    /// # Safety
    /// `ptr` must address `len` elements of `T` in the group's device runtime
    /// that stay valid for `'a`.
    pub unsafe fn from_raw(ptr: DevicePtr, len: usize) -> Self {
        BufferRef {
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_absent(&self) -> bool {
        self.ptr.is_null()
    }
}

impl<T> Clone for BufferRef<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for BufferRef<'_, T> {}

impl<T> fmt::Debug for BufferRef<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRef")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl<'a, T: Pod> From<&'a DeviceBuffer<T>> for BufferRef<'a, T> {
    fn from(buffer: &'a DeviceBuffer<T>) -> Self {
        buffer.view()
    }
}
