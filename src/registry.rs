//! Buffers allocated on behalf of a pattern, with an allocation ledger.

use bytemuck::Pod;

use crate::device::{DeviceBuffer, DevicePtr};
use crate::error::Result;
use crate::group::{ProcessGroup, Rank, TAG_CONTROL};
use crate::report;

/// Buffers held by one rank of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerEntry {
    pub pieces: usize,
    pub count: usize,
}

/// Owns device buffers allocated collectively for a chosen rank.
pub struct BufferRegistry<T> {
    print_rank: Rank,
    buffers: Vec<DeviceBuffer<T>>,
}

impl<T: Pod> BufferRegistry<T> {
    pub fn new(print_rank: Rank) -> Self {
        Self {
            print_rank,
            buffers: Vec::new(),
        }
    }

    /// Allocate `count` elements on `owner`. Called by every rank; returns a
    /// null pointer everywhere but on `owner`, and for zero counts.
    ///
    /// The owner reports the allocation to the print rank, which logs it.
    pub fn allocate(&mut self, group: &ProcessGroup, count: usize, owner: Rank) -> Result<DevicePtr> {
        let me = group.rank();
        let mut ptr = DevicePtr::NULL;
        if me == owner && count > 0 {
            let buffer = DeviceBuffer::new(group.device(), count)?;
            ptr = buffer.ptr();
            self.buffers.push(buffer);
        }

        let reported = if owner == self.print_rank {
            (me == owner).then_some(ptr)
        } else {
            if me == owner {
                group.send_value(self.print_rank, TAG_CONTROL, &ptr.addr())?;
            }
            if me == self.print_rank {
                let addr: u64 = group.recv_value(owner, TAG_CONTROL)?;
                Some(DevicePtr::from_addr(addr))
            } else {
                None
            }
        };
        if let Some(addr) = reported {
            if count > 0 {
                tracing::info!(
                    rank = owner,
                    ptr = ?addr,
                    count,
                    size = %report::format_size(count.saturating_mul(std::mem::size_of::<T>())),
                    "allocated buffer"
                );
            }
        }
        Ok(ptr)
    }

    /// Allocate `count` elements on every rank.
    pub fn allocate_all(&mut self, group: &ProcessGroup, count: usize) -> Result<DevicePtr> {
        let mut mine = DevicePtr::NULL;
        for owner in 0..group.size() {
            let ptr = self.allocate(group, count, owner)?;
            if owner == group.rank() {
                mine = ptr;
            }
        }
        Ok(mine)
    }

    /// Local buffer `index`, in allocation order.
    pub fn buffer(&self, index: usize) -> Option<&DeviceBuffer<T>> {
        self.buffers.get(index)
    }

    pub fn pieces(&self) -> usize {
        self.buffers.len()
    }

    /// Elements held locally.
    pub fn count(&self) -> usize {
        self.buffers.iter().map(DeviceBuffer::len).sum()
    }

    pub fn local_entry(&self) -> LedgerEntry {
        LedgerEntry {
            pieces: self.pieces(),
            count: self.count(),
        }
    }

    /// Every rank's ledger entry, in rank order.
    pub fn ledger(&self, group: &ProcessGroup) -> Result<Vec<LedgerEntry>> {
        let local = self.local_entry();
        let all = group.all_gather_slice(&[local.pieces as u64, local.count as u64])?;
        Ok(all
            .chunks_exact(2)
            .map(|c| LedgerEntry {
                pieces: c[0] as usize,
                count: c[1] as usize,
            })
            .collect())
    }

    /// Free every buffer.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

/// Bytes allocated through each rank's device runtime, in rank order.
pub fn memory_report(group: &ProcessGroup) -> Result<Vec<usize>> {
    let local = group.device().allocated_bytes() as u64;
    Ok(group
        .all_gather(&local)?
        .into_iter()
        .map(|b| b as usize)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::LocalWorld;

    #[test]
    fn ledger_tracks_pieces_per_rank() {
        let results = LocalWorld::run(3, |group| {
            let mut registry = BufferRegistry::<f32>::new(0);
            let on_two = registry.allocate(&group, 10, 2).unwrap();
            assert_eq!(on_two.is_null(), group.rank() != 2);
            registry.allocate_all(&group, 4).unwrap();
            registry.allocate(&group, 0, 1).unwrap();
            registry.ledger(&group).unwrap()
        })
        .unwrap();
        let expected = vec![
            LedgerEntry { pieces: 1, count: 4 },
            LedgerEntry { pieces: 1, count: 4 },
            LedgerEntry { pieces: 2, count: 14 },
        ];
        for ledger in results {
            assert_eq!(ledger, expected);
        }
    }

    #[test]
    fn memory_report_counts_live_allocations() {
        let results = LocalWorld::run(2, |group| {
            let mut registry = BufferRegistry::<u64>::new(0);
            registry.allocate(&group, 8, 1).unwrap();
            let before = memory_report(&group).unwrap();
            registry.clear();
            let after = memory_report(&group).unwrap();
            (before, after)
        })
        .unwrap();
        for (before, after) in results {
            assert_eq!(before, vec![0, 64]);
            assert_eq!(after, vec![0, 0]);
        }
    }
}
