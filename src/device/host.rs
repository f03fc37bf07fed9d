//! Host memory standing in for device memory.
//!
//! Exported handles carry (process id, base, length) and can only be opened
//! inside the exporting process, which is what ranks of a
//! [`LocalWorld`](crate::group::LocalWorld) are. Streams queue their copies and
//! run them at `synchronize`, so an issued copy has not landed until the
//! issuing rank synchronizes.

use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::collections::BTreeMap;

use super::{DevicePtr, DeviceRuntime, MemHandle, StreamId};
use crate::error::{BenchError, Result};

const ALIGN: usize = 256;
const HANDLE_BYTES: usize = 4 + 8 + 8;

#[derive(Debug, Clone, Copy)]
struct PendingCopy {
    dst: DevicePtr,
    src: DevicePtr,
    bytes: usize,
}

struct Mapping {
    bytes: usize,
    opens: usize,
}

#[derive(Default)]
pub struct HostRuntime {
    allocations: RefCell<BTreeMap<u64, usize>>,
    mappings: RefCell<BTreeMap<u64, Mapping>>,
    streams: RefCell<Vec<Option<Vec<PendingCopy>>>>,
}

impl HostRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Streams created and not yet destroyed.
    pub fn live_streams(&self) -> usize {
        self.streams.borrow().iter().filter(|s| s.is_some()).count()
    }

    /// Peer allocations currently mapped through `open_handle`.
    pub fn open_handles(&self) -> usize {
        self.mappings.borrow().values().map(|m| m.opens).sum()
    }

    /// Whether `ptr..ptr+bytes` lies inside one local allocation or mapping.
    fn accessible(&self, ptr: DevicePtr, bytes: usize) -> bool {
        let addr = ptr.addr();
        let end = addr + bytes as u64;
        let within = |base: u64, len: usize| addr >= base && end <= base + len as u64;

        let allocations = self.allocations.borrow();
        if let Some((&base, &len)) = allocations.range(..=addr).next_back() {
            if within(base, len) {
                return true;
            }
        }
        let mappings = self.mappings.borrow();
        if let Some((&base, mapping)) = mappings.range(..=addr).next_back() {
            if within(base, mapping.bytes) {
                return true;
            }
        }
        false
    }

    fn check(&self, ptr: DevicePtr, bytes: usize) -> Result<()> {
        if bytes == 0 || self.accessible(ptr, bytes) {
            Ok(())
        } else {
            Err(BenchError::Usage(format!(
                "{bytes} bytes at {ptr:?} are not inside a known allocation"
            )))
        }
    }

    fn layout(bytes: usize) -> Result<Layout> {
        Layout::from_size_align(bytes, ALIGN)
            .map_err(|e| BenchError::Setup(format!("invalid allocation of {bytes} bytes: {e}")))
    }
}

impl DeviceRuntime for HostRuntime {
    fn name(&self) -> &'static str {
        "host"
    }

    fn alloc(&self, bytes: usize) -> Result<DevicePtr> {
        if bytes == 0 {
            return Err(BenchError::Usage("zero-byte allocation".into()));
        }
        let layout = Self::layout(bytes)?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        if raw.is_null() {
            return Err(BenchError::Setup(format!("out of memory allocating {bytes} bytes")));
        }
        let ptr = DevicePtr::from_addr(raw as usize as u64);
        self.allocations.borrow_mut().insert(ptr.addr(), bytes);
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        let bytes = self
            .allocations
            .borrow_mut()
            .remove(&ptr.addr())
            .ok_or_else(|| BenchError::Usage(format!("free of unknown pointer {ptr:?}")))?;
        // SAFETY: ptr was returned by alloc with this exact layout.
        unsafe { alloc::dealloc(ptr.as_mut_ptr(), Self::layout(bytes)?) };
        Ok(())
    }

    fn copy_from_host(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        self.check(dst, src.len())?;
        // SAFETY: dst range checked against a live allocation or mapping.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr(), src.len()) };
        Ok(())
    }

    fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        self.check(src, dst.len())?;
        // SAFETY: src range checked against a live allocation or mapping.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn copy(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Result<()> {
        self.check(dst, bytes)?;
        self.check(src, bytes)?;
        // SAFETY: both ranges checked; `copy` tolerates overlap.
        unsafe { std::ptr::copy(src.as_ptr(), dst.as_mut_ptr(), bytes) };
        Ok(())
    }

    fn export_handle(&self, base: DevicePtr) -> Result<MemHandle> {
        let bytes = *self.allocations.borrow().get(&base.addr()).ok_or_else(|| {
            BenchError::Setup(format!("{base:?} is not the base of a host allocation"))
        })?;
        let mut payload = Vec::with_capacity(HANDLE_BYTES);
        payload.extend_from_slice(&std::process::id().to_le_bytes());
        payload.extend_from_slice(&base.addr().to_le_bytes());
        payload.extend_from_slice(&(bytes as u64).to_le_bytes());
        Ok(MemHandle::from_bytes(payload))
    }

    fn open_handle(&self, handle: &MemHandle) -> Result<DevicePtr> {
        let payload = handle.as_bytes();
        if payload.len() != HANDLE_BYTES {
            return Err(BenchError::Setup(format!(
                "host handle of {} bytes, expected {HANDLE_BYTES}",
                payload.len()
            )));
        }
        let pid = u32::from_le(bytemuck::pod_read_unaligned(&payload[0..4]));
        let base = u64::from_le(bytemuck::pod_read_unaligned(&payload[4..12]));
        let bytes = u64::from_le(bytemuck::pod_read_unaligned(&payload[12..20]));
        if pid != std::process::id() {
            return Err(BenchError::Setup(format!(
                "host handle exported by process {pid} cannot be opened in process {}",
                std::process::id()
            )));
        }
        self.mappings
            .borrow_mut()
            .entry(base)
            .or_insert(Mapping {
                bytes: bytes as usize,
                opens: 0,
            })
            .opens += 1;
        Ok(DevicePtr::from_addr(base))
    }

    fn close_handle(&self, base: DevicePtr) -> Result<()> {
        let mut mappings = self.mappings.borrow_mut();
        let mapping = mappings
            .get_mut(&base.addr())
            .ok_or_else(|| BenchError::Setup(format!("{base:?} is not an open handle")))?;
        mapping.opens -= 1;
        if mapping.opens == 0 {
            mappings.remove(&base.addr());
        }
        Ok(())
    }

    fn create_stream(&self) -> Result<StreamId> {
        let mut streams = self.streams.borrow_mut();
        streams.push(Some(Vec::new()));
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
        self.check(dst, bytes)?;
        self.check(src, bytes)?;
        let mut streams = self.streams.borrow_mut();
        let queue = streams
            .get_mut(stream.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| BenchError::Usage(format!("{stream:?} is not a live stream")))?;
        queue.push(PendingCopy { dst, src, bytes });
        Ok(())
    }

    fn synchronize(&self, stream: StreamId) -> Result<()> {
        let pending = {
            let mut streams = self.streams.borrow_mut();
            let queue = streams
                .get_mut(stream.0)
                .and_then(Option::as_mut)
                .ok_or_else(|| BenchError::Usage(format!("{stream:?} is not a live stream")))?;
            std::mem::take(queue)
        };
        for copy in pending {
            // SAFETY: both ranges were checked when the copy was enqueued.
            unsafe { std::ptr::copy(copy.src.as_ptr(), copy.dst.as_mut_ptr(), copy.bytes) };
        }
        Ok(())
    }

    fn allocated_bytes(&self) -> usize {
        self.allocations.borrow().values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn async_copy_lands_at_synchronize() {
        let rt = HostRuntime::new();
        let src = rt.alloc(16).unwrap();
        let dst = rt.alloc(16).unwrap();
        rt.copy_from_host(src, &[7u8; 16]).unwrap();

        let stream = rt.create_stream().unwrap();
        rt.copy_async(stream, dst, src, 16).unwrap();

        let mut out = [0u8; 16];
        rt.copy_to_host(&mut out, dst).unwrap();
        assert_eq!(out, [0u8; 16]);

        rt.synchronize(stream).unwrap();
        rt.copy_to_host(&mut out, dst).unwrap();
        assert_eq!(out, [7u8; 16]);

        rt.destroy_stream(stream).unwrap();
        assert_eq!(rt.live_streams(), 0);
        rt.free(src).unwrap();
        rt.free(dst).unwrap();
    }

    #[test]
    fn handle_opens_in_same_process() {
        let exporter = HostRuntime::new();
        let importer = HostRuntime::new();
        let base = exporter.alloc(64).unwrap();
        exporter.copy_from_host(base, &[3u8; 64]).unwrap();

        let handle = exporter.export_handle(base).unwrap();
        let mapped = importer.open_handle(&handle).unwrap();
        assert_eq!(mapped, base);
        assert_eq!(importer.open_handles(), 1);

        let mut out = [0u8; 8];
        importer.copy_to_host(&mut out, mapped.byte_add(8)).unwrap();
        assert_eq!(out, [3u8; 8]);

        importer.close_handle(mapped).unwrap();
        assert_eq!(importer.open_handles(), 0);
        exporter.free(base).unwrap();
    }

    #[test]
    fn foreign_process_handle_is_setup_error() {
        let rt = HostRuntime::new();
        let mut payload = Vec::new();
        payload.extend_from_slice(&(std::process::id().wrapping_add(1)).to_le_bytes());
        payload.extend_from_slice(&0x1000u64.to_le_bytes());
        payload.extend_from_slice(&64u64.to_le_bytes());
        let handle = MemHandle::from_bytes(payload);
        assert!(matches!(rt.open_handle(&handle), Err(BenchError::Setup(_))));
    }

    #[test]
    fn export_requires_allocation_base() {
        let rt = HostRuntime::new();
        let base = rt.alloc(32).unwrap();
        assert!(matches!(
            rt.export_handle(base.byte_add(4)),
            Err(BenchError::Setup(_))
        ));
        rt.free(base).unwrap();
    }

    #[test]
    fn unknown_ranges_are_rejected() {
        let rt = HostRuntime::new();
        let base = rt.alloc(32).unwrap();
        assert!(rt.copy(base, base.byte_add(16), 32).is_err());
        assert!(rt.free(base.byte_add(1)).is_err());
        rt.free(base).unwrap();
        assert_eq!(rt.allocated_bytes(), 0);
    }
}
