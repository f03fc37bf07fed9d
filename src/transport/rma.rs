//! Remote memory access layer contract.
//!
//! Shaped after one-sided communication libraries: memory is exposed by
//! registering a segment, peers attach to it with the returned key, and
//! non-blocking put/get on an endpoint complete at `quiet`.

use std::rc::Rc;

use crate::device::{DevicePtr, DeviceRuntime, MemHandle, StreamId};
use crate::error::Result;

pub trait RmaLayer {
    /// Expose the allocation at `base`; the key is what peers attach with.
    fn register_segment(&self, base: DevicePtr) -> Result<MemHandle>;

    /// Attach to a peer's segment, returning its base in local addressing.
    fn attach_segment(&self, key: &MemHandle) -> Result<DevicePtr>;

    fn detach_segment(&self, base: DevicePtr) -> Result<()>;

    fn create_endpoint(&self) -> Result<StreamId>;

    fn destroy_endpoint(&self, endpoint: StreamId) -> Result<()>;

    fn put_nbi(&self, endpoint: StreamId, remote_dst: DevicePtr, local_src: DevicePtr, bytes: usize)
        -> Result<()>;

    fn get_nbi(&self, endpoint: StreamId, local_dst: DevicePtr, remote_src: DevicePtr, bytes: usize)
        -> Result<()>;

    /// Complete every put/get issued on `endpoint`.
    fn quiet(&self, endpoint: StreamId) -> Result<()>;
}

/// RMA layer realised with device IPC mappings: segments are exported
/// handles and endpoints are device streams.
pub struct MappedRma {
    device: Rc<dyn DeviceRuntime>,
}

impl MappedRma {
    pub fn new(device: Rc<dyn DeviceRuntime>) -> Self {
        Self { device }
    }
}

impl RmaLayer for MappedRma {
    fn register_segment(&self, base: DevicePtr) -> Result<MemHandle> {
        self.device.export_handle(base)
    }

    fn attach_segment(&self, key: &MemHandle) -> Result<DevicePtr> {
        self.device.open_handle(key)
    }

    fn detach_segment(&self, base: DevicePtr) -> Result<()> {
        self.device.close_handle(base)
    }

    fn create_endpoint(&self) -> Result<StreamId> {
        self.device.create_stream()
    }

    fn destroy_endpoint(&self, endpoint: StreamId) -> Result<()> {
        self.device.destroy_stream(endpoint)
    }

    fn put_nbi(&self, endpoint: StreamId, remote_dst: DevicePtr, local_src: DevicePtr, bytes: usize)
        -> Result<()> {
        self.device.copy_async(endpoint, remote_dst, local_src, bytes)
    }

    fn get_nbi(&self, endpoint: StreamId, local_dst: DevicePtr, remote_src: DevicePtr, bytes: usize)
        -> Result<()> {
        self.device.copy_async(endpoint, local_dst, remote_src, bytes)
    }

    fn quiet(&self, endpoint: StreamId) -> Result<()> {
        self.device.synchronize(endpoint)
    }
}
