//! Out-of-band exchange of device memory handles.
//!
//! Runs once per edge between its two participants, over the control channel.
//! The rank whose memory is the target of the direct access *offers* a handle
//! and a byte offset; the other rank *accepts* it and maps the peer's memory.
//! The accepting rank replies with whether the mapping succeeded, so a
//! failure on either side is seen by both. An export failure still sends an
//! empty handle so the accepting rank does not block.

use super::DirectAccess;
use crate::device::{DevicePtr, MemHandle};
use crate::error::{BenchError, Result};
use crate::group::{ProcessGroup, Rank, TAG_CONTROL};

/// A peer allocation mapped into this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteRegion {
    /// Base of the mapping, what gets closed on release.
    pub base: DevicePtr,
    /// `base` plus the offset the peer sent.
    pub addr: DevicePtr,
}

/// Export `base` and send the handle with `offset` to `peer`.
pub fn offer(
    group: &ProcessGroup,
    access: &dyn DirectAccess,
    peer: Rank,
    base: DevicePtr,
    offset: usize,
) -> Result<()> {
    let exported = access.export(base);
    let blob = match &exported {
        Ok(handle) => handle.as_bytes(),
        Err(_) => &[],
    };
    group.send_blob(peer, TAG_CONTROL, blob)?;
    group.send_value(peer, TAG_CONTROL, &(offset as u64))?;
    tracing::debug!(peer, offset, handle_bytes = blob.len(), "offered memory handle");
    let opened: u8 = group.recv_value(peer, TAG_CONTROL)?;
    exported?;
    if opened == 0 {
        return Err(BenchError::Setup(format!(
            "rank {peer} could not open the offered memory handle"
        )));
    }
    Ok(())
}

/// Receive a handle and offset from `peer` and map the memory it names.
pub fn accept(group: &ProcessGroup, access: &dyn DirectAccess, peer: Rank) -> Result<RemoteRegion> {
    let blob = group.recv_blob(peer, TAG_CONTROL)?;
    let offset: u64 = group.recv_value(peer, TAG_CONTROL)?;
    let opened = if blob.is_empty() {
        Err(BenchError::Setup(format!(
            "rank {peer} could not export a memory handle"
        )))
    } else {
        access.open(&MemHandle::from_bytes(blob))
    };
    group.send_value(peer, TAG_CONTROL, &u8::from(opened.is_ok()))?;
    let base = opened?;
    let addr = base.byte_add(offset as usize);
    tracing::debug!(peer, ?addr, "opened remote memory handle");
    Ok(RemoteRegion { base, addr })
}
