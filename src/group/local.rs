//! In-process world: every rank is a thread of the same process.
//!
//! Ranks exchange messages through a shared hub of per-rank mailboxes. A
//! message is matched on (source, tag) and queues are FIFO, so traffic between
//! a pair of ranks is non-overtaking. Sends are eager and never block.
//!
//! Data-path operations read and write raw addresses directly, so buffers must
//! be host-addressable (see [`HostRuntime`](crate::device::HostRuntime)).

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use super::{Completion, ControlChannel, PendingOp, ProcessGroup, Rank, Tag};
use crate::device::{DevicePtr, HostRuntime};
use crate::error::{BenchError, Result};

type Queues = HashMap<(Rank, Tag), VecDeque<Vec<u8>>>;

struct Mailbox {
    queues: Mutex<Queues>,
    arrived: Condvar,
}

struct BarrierState {
    waiting: usize,
    generation: u64,
}

struct Hub {
    size: usize,
    mailboxes: Vec<Mailbox>,
    barrier: Mutex<BarrierState>,
    released: Condvar,
    aborted: AtomicBool,
}

impl Hub {
    fn new(size: usize) -> Self {
        Self {
            size,
            mailboxes: (0..size)
                .map(|_| Mailbox {
                    queues: Mutex::new(HashMap::new()),
                    arrived: Condvar::new(),
                })
                .collect(),
            barrier: Mutex::new(BarrierState {
                waiting: 0,
                generation: 0,
            }),
            released: Condvar::new(),
            aborted: AtomicBool::new(false),
        }
    }

    fn check_alive(&self) -> Result<()> {
        if self.aborted.load(Ordering::Acquire) {
            Err(BenchError::Transport("a peer rank aborted".into()))
        } else {
            Ok(())
        }
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> Result<MutexGuard<'a, T>> {
        mutex
            .lock()
            .map_err(|_| BenchError::Transport("local hub lock poisoned".into()))
    }

    fn post(&self, src: Rank, dest: Rank, tag: Tag, payload: Vec<u8>) -> Result<()> {
        self.check_alive()?;
        let mailbox = self.mailbox(dest)?;
        self.lock(&mailbox.queues)?
            .entry((src, tag))
            .or_default()
            .push_back(payload);
        mailbox.arrived.notify_all();
        Ok(())
    }

    fn take(&self, dest: Rank, src: Rank, tag: Tag) -> Result<Vec<u8>> {
        let mailbox = self.mailbox(dest)?;
        let mut queues = self.lock(&mailbox.queues)?;
        loop {
            if let Some(message) = queues.get_mut(&(src, tag)).and_then(VecDeque::pop_front) {
                return Ok(message);
            }
            self.check_alive()?;
            queues = mailbox
                .arrived
                .wait(queues)
                .map_err(|_| BenchError::Transport("local hub lock poisoned".into()))?;
        }
    }

    fn wait_barrier(&self) -> Result<()> {
        let mut state = self.lock(&self.barrier)?;
        let generation = state.generation;
        state.waiting += 1;
        if state.waiting == self.size {
            state.waiting = 0;
            state.generation += 1;
            self.released.notify_all();
            return Ok(());
        }
        while state.generation == generation {
            self.check_alive()?;
            state = self
                .released
                .wait(state)
                .map_err(|_| BenchError::Transport("local hub lock poisoned".into()))?;
        }
        Ok(())
    }

    fn mailbox(&self, rank: Rank) -> Result<&Mailbox> {
        self.mailboxes.get(rank).ok_or_else(|| {
            BenchError::Usage(format!("rank {rank} outside a world of {}", self.size))
        })
    }

    /// Wake every blocked rank so it can observe the abort.
    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        for mailbox in &self.mailboxes {
            let _guard = mailbox.queues.lock();
            mailbox.arrived.notify_all();
        }
        let _guard = self.barrier.lock();
        self.released.notify_all();
    }
}

/// Marks the hub aborted if a rank thread unwinds, so its peers stop waiting.
struct AbortOnPanic(Arc<Hub>);

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort();
        }
    }
}

/// Control channel endpoint of one rank of a [`LocalWorld`].
pub struct LocalChannel {
    hub: Arc<Hub>,
    rank: Rank,
}

impl LocalChannel {
    /// A world of one rank, without spawning anything.
    pub fn solo() -> Self {
        Self {
            hub: Arc::new(Hub::new(1)),
            rank: 0,
        }
    }
}

impl ControlChannel for LocalChannel {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.hub.size
    }

    fn send(&self, dest: Rank, tag: Tag, payload: &[u8]) -> Result<()> {
        self.hub.post(self.rank, dest, tag, payload.to_vec())
    }

    fn recv(&self, src: Rank, tag: Tag, payload: &mut [u8]) -> Result<()> {
        let message = self.hub.take(self.rank, src, tag)?;
        copy_message(&message, payload)
    }

    fn barrier(&self) -> Result<()> {
        self.hub.wait_barrier()
    }

    unsafe fn isend(&self, dest: Rank, tag: Tag, src: DevicePtr, bytes: usize) -> Result<PendingOp> {
        let payload = if bytes == 0 {
            Vec::new()
        } else {
            // SAFETY: the caller guarantees `src..src+bytes` is valid host memory.
            std::slice::from_raw_parts(src.as_ptr(), bytes).to_vec()
        };
        self.hub.post(self.rank, dest, tag, payload)?;
        Ok(Box::new(Done))
    }

    unsafe fn irecv(&self, src: Rank, tag: Tag, dst: DevicePtr, bytes: usize) -> Result<PendingOp> {
        Ok(Box::new(PendingRecv {
            hub: Arc::clone(&self.hub),
            rank: self.rank,
            src,
            tag,
            dst,
            bytes,
        }))
    }
}

fn copy_message(message: &[u8], payload: &mut [u8]) -> Result<()> {
    if message.len() > payload.len() {
        return Err(BenchError::Transport(format!(
            "message of {} bytes truncated by a {}-byte receive",
            message.len(),
            payload.len()
        )));
    }
    payload[..message.len()].copy_from_slice(message);
    Ok(())
}

struct Done;

impl Completion for Done {
    fn wait(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct PendingRecv {
    hub: Arc<Hub>,
    rank: Rank,
    src: Rank,
    tag: Tag,
    dst: DevicePtr,
    bytes: usize,
}

impl Completion for PendingRecv {
    fn wait(self: Box<Self>) -> Result<()> {
        let message = self.hub.take(self.rank, self.src, self.tag)?;
        if message.len() > self.bytes {
            return Err(BenchError::Transport(format!(
                "message of {} bytes truncated by a {}-byte receive",
                message.len(),
                self.bytes
            )));
        }
        // SAFETY: irecv's caller guarantees `dst..dst+bytes` stays valid and
        // untouched until this wait.
        unsafe {
            std::ptr::copy_nonoverlapping(message.as_ptr(), self.dst.as_mut_ptr(), message.len());
        }
        Ok(())
    }
}

/// A group of ranks living in one process, one thread each.
pub struct LocalWorld;

impl LocalWorld {
    /// Run `f` on `size` ranks concurrently and collect the results in rank
    /// order. Each rank gets its own [`ProcessGroup`] backed by a
    /// [`HostRuntime`].
    ///
    /// A panic on any rank aborts the world and is resumed on the caller.
    pub fn run<F, R>(size: usize, f: F) -> Result<Vec<R>>
    where
        F: Fn(ProcessGroup) -> R + Sync,
        R: Send,
    {
        if size == 0 {
            return Err(BenchError::Usage("a world needs at least one rank".into()));
        }
        let hub = Arc::new(Hub::new(size));
        let f = &f;

        thread::scope(|scope| {
            let handles: Vec<_> = (0..size)
                .map(|rank| {
                    let hub = Arc::clone(&hub);
                    thread::Builder::new()
                        .name(format!("rank-{rank}"))
                        .spawn_scoped(scope, move || {
                            let _guard = AbortOnPanic(Arc::clone(&hub));
                            let channel = LocalChannel { hub, rank };
                            let group =
                                ProcessGroup::new(Box::new(channel), Rc::new(HostRuntime::new()));
                            f(group)
                        })
                        .map_err(BenchError::Io)
                })
                .collect::<Result<_>>()?;

            let mut results = Vec::with_capacity(size);
            for handle in handles {
                match handle.join() {
                    Ok(result) => results.push(result),
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
            Ok(results)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{TAG_CONTROL, TAG_DATA};

    #[test]
    fn messages_match_on_source_and_tag() {
        let results = LocalWorld::run(3, |group| {
            let channel = group.channel();
            match group.rank() {
                0 => {
                    channel.send(2, TAG_DATA, &[1]).unwrap();
                    channel.send(2, TAG_CONTROL, &[2]).unwrap();
                    Vec::new()
                }
                1 => {
                    channel.send(2, TAG_CONTROL, &[3]).unwrap();
                    Vec::new()
                }
                _ => {
                    let mut order = Vec::new();
                    let mut byte = [0u8];
                    channel.recv(1, TAG_CONTROL, &mut byte).unwrap();
                    order.push(byte[0]);
                    channel.recv(0, TAG_CONTROL, &mut byte).unwrap();
                    order.push(byte[0]);
                    channel.recv(0, TAG_DATA, &mut byte).unwrap();
                    order.push(byte[0]);
                    order
                }
            }
        })
        .unwrap();
        assert_eq!(results[2], vec![3, 2, 1]);
    }

    #[test]
    fn fifo_between_a_pair() {
        let results = LocalWorld::run(2, |group| {
            let channel = group.channel();
            if group.rank() == 0 {
                for i in 0..5u8 {
                    channel.send(1, TAG_CONTROL, &[i]).unwrap();
                }
                Vec::new()
            } else {
                (0..5)
                    .map(|_| {
                        let mut byte = [0u8];
                        channel.recv(0, TAG_CONTROL, &mut byte).unwrap();
                        byte[0]
                    })
                    .collect()
            }
        })
        .unwrap();
        assert_eq!(results[1], vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn truncated_receive_is_a_transport_error() {
        let results = LocalWorld::run(2, |group| {
            let channel = group.channel();
            if group.rank() == 0 {
                channel.send(1, TAG_CONTROL, &[0; 8]).unwrap();
                true
            } else {
                let mut small = [0u8; 4];
                matches!(
                    channel.recv(0, TAG_CONTROL, &mut small),
                    Err(BenchError::Transport(_))
                )
            }
        })
        .unwrap();
        assert!(results[1]);
    }

    #[test]
    fn barrier_is_reusable() {
        LocalWorld::run(4, |group| {
            for _ in 0..10 {
                group.barrier().unwrap();
            }
        })
        .unwrap();
    }

    #[test]
    fn empty_world_is_rejected() {
        assert!(matches!(
            LocalWorld::run(0, |_group| ()),
            Err(BenchError::Usage(_))
        ));
    }
}
