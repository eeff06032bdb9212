//! Fixed-size pool of reusable frame buffers
//!
//! Every buffer carries a state tag guarded by its own lock. Handoffs between
//! the pool, the transport, the dispatcher and consumers are compare-and-set
//! transitions on that tag, so no two contexts ever see the same buffer as
//! theirs. A buffer's epoch increments each time it returns to `Free`; a lease
//! whose epoch no longer matches has been reclaimed and can touch nothing.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use flume::{Receiver, Selector, Sender, TryRecvError};
use tracing::{debug, warn};

use crate::capture::frame::FrameMetadata;
use crate::error::{CameraError, Result};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Ownership state of a pooled buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Owned by the pool
    Free,
    /// Owned by the transport, awaiting fill
    Queued,
    /// Filled, owned by the dispatcher
    Ready,
    /// Owned by a consumer
    InUse,
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-state buffer counts at one observation point
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolCensus {
    pub free: usize,
    pub queued: usize,
    pub ready: usize,
    pub in_use: usize,
}

impl PoolCensus {
    pub fn total(&self) -> usize {
        self.free + self.queued + self.ready + self.in_use
    }

    fn count(&mut self, state: BufferState) {
        match state {
            BufferState::Free => self.free += 1,
            BufferState::Queued => self.queued += 1,
            BufferState::Ready => self.ready += 1,
            BufferState::InUse => self.in_use += 1,
        }
    }
}

struct Tag {
    state: BufferState,
    epoch: u64,
    meta: FrameMetadata,
}

struct Slot {
    tag: Mutex<Tag>,
    data: RwLock<Vec<u8>>,
}

impl Slot {
    fn tag(&self) -> MutexGuard<'_, Tag> {
        self.tag.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct PoolInner {
    id: u64,
    slots: Box<[Slot]>,
    buffer_size: usize,
    free_tx: Sender<usize>,
    free_rx: Receiver<usize>,
    closed: AtomicBool,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl PoolInner {
    fn slot(&self, id: usize) -> Result<&Slot> {
        self.slots
            .get(id)
            .ok_or_else(|| CameraError::InvalidOwnership(format!("buffer {id} is not in this pool")))
    }

    fn stale(&self, id: usize) -> CameraError {
        if self.closed.load(Ordering::Acquire) {
            CameraError::SessionClosed
        } else {
            CameraError::InvalidOwnership(format!("buffer {id} was reclaimed by the pool"))
        }
    }

    /// Hand a slot popped from the free list to a new owner
    fn lease(self: &Arc<Self>, id: usize, target: BufferState) -> Result<BufferLease> {
        let slot = self.slot(id)?;
        let mut tag = slot.tag();
        if tag.state != BufferState::Free {
            return Err(CameraError::InvalidOwnership(format!(
                "buffer {id} on the free list is {}",
                tag.state
            )));
        }
        tag.state = target;
        tag.meta = FrameMetadata::default();
        Ok(BufferLease {
            pool: Arc::clone(self),
            slot: id,
            epoch: tag.epoch,
            armed: true,
        })
    }

    /// Return a slot to `Free` if `epoch` still owns it
    fn free_slot(&self, id: usize, epoch: u64, allowed: Option<&[BufferState]>) -> Result<()> {
        let slot = self.slot(id)?;
        let mut tag = slot.tag();
        if tag.epoch != epoch {
            return Err(self.stale(id));
        }
        let previous = tag.state;
        tag.state = BufferState::Free;
        tag.epoch += 1;
        drop(tag);
        let _ = self.free_tx.send(id);

        match allowed {
            Some(allowed) if !allowed.contains(&previous) => Err(CameraError::InvalidOwnership(
                format!("buffer {id} released while {previous}"),
            )),
            _ => Ok(()),
        }
    }

    fn reclaim(&self, states: &[BufferState]) -> usize {
        let mut reclaimed = 0;
        for (id, slot) in self.slots.iter().enumerate() {
            let mut tag = slot.tag();
            if tag.state != BufferState::Free && states.contains(&tag.state) {
                tag.state = BufferState::Free;
                tag.epoch += 1;
                drop(tag);
                let _ = self.free_tx.send(id);
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

/// Fixed set of preallocated frame buffers
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Reserve `count` buffers of `size` bytes each
    pub fn preallocate(count: usize, size: usize) -> Result<Self> {
        if count == 0 {
            return Err(CameraError::ResourceExhausted(
                "buffer pool needs at least one buffer".to_string(),
            ));
        }

        let mut slots = Vec::new();
        slots.try_reserve_exact(count).map_err(|e| {
            CameraError::ResourceExhausted(format!("cannot reserve {count} buffer slots: {e}"))
        })?;

        for _ in 0..count {
            let mut data = Vec::new();
            data.try_reserve_exact(size).map_err(|e| {
                CameraError::ResourceExhausted(format!("cannot reserve {size} byte buffer: {e}"))
            })?;
            data.resize(size, 0);
            slots.push(Slot {
                tag: Mutex::new(Tag {
                    state: BufferState::Free,
                    epoch: 0,
                    meta: FrameMetadata::default(),
                }),
                data: RwLock::new(data),
            });
        }

        let (free_tx, free_rx) = flume::unbounded();
        for id in 0..count {
            let _ = free_tx.send(id);
        }
        let (shutdown_tx, shutdown_rx) = flume::bounded(0);

        debug!(count, size, "Buffer pool preallocated");

        Ok(Self {
            inner: Arc::new(PoolInner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                slots: slots.into_boxed_slice(),
                buffer_size: size,
                free_tx,
                free_rx,
                closed: AtomicBool::new(false),
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                shutdown_rx,
            }),
        })
    }

    /// Number of buffers, fixed for the pool's lifetime
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Buffers currently waiting on the free list
    pub fn available(&self) -> usize {
        self.inner.free_rx.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Take a free buffer without blocking
    pub fn acquire(&self) -> Result<BufferLease> {
        self.checkout(BufferState::InUse, None)
    }

    /// Take a free buffer, waiting up to `timeout`
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<BufferLease> {
        self.checkout(BufferState::InUse, Some(timeout))
    }

    /// Return a buffer taken with `acquire` or handed out as a frame
    pub fn release(&self, lease: BufferLease) -> Result<()> {
        if !Arc::ptr_eq(&lease.pool, &self.inner) {
            return Err(CameraError::InvalidOwnership(format!(
                "buffer {} belongs to pool {}, not pool {}",
                lease.slot, lease.pool.id, self.inner.id
            )));
        }
        lease.release()
    }

    pub fn census(&self) -> PoolCensus {
        let mut census = PoolCensus::default();
        for slot in self.inner.slots.iter() {
            census.count(slot.tag().state);
        }
        census
    }

    /// Take a free buffer for registration with the transport
    pub(crate) fn checkout_for_fill(&self) -> Result<BufferLease> {
        self.checkout(BufferState::Queued, None)
    }

    /// Free-list notifications, for the dispatcher's replenish arm
    pub(crate) fn free_ids(&self) -> &Receiver<usize> {
        &self.inner.free_rx
    }

    pub(crate) fn lease_for_fill(&self, id: usize) -> Result<BufferLease> {
        self.inner.lease(id, BufferState::Queued)
    }

    /// Force buffers in `states` back to `Free`, invalidating their leases
    pub(crate) fn reclaim(&self, states: &[BufferState]) -> usize {
        self.inner.reclaim(states)
    }

    /// Reclaim every buffer and wake all waiters with `SessionClosed`
    pub fn close(&self) -> usize {
        self.inner.closed.store(true, Ordering::Release);
        self.inner
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let reclaimed = self.inner.reclaim(&[
            BufferState::Queued,
            BufferState::Ready,
            BufferState::InUse,
        ]);
        if reclaimed > 0 {
            warn!(reclaimed, "Forced reclamation of outstanding buffers");
        }
        reclaimed
    }

    fn checkout(&self, target: BufferState, timeout: Option<Duration>) -> Result<BufferLease> {
        if self.is_closed() {
            return Err(CameraError::SessionClosed);
        }

        let id = match timeout {
            None => match self.inner.free_rx.try_recv() {
                Ok(id) => id,
                Err(TryRecvError::Empty) => return Err(CameraError::PoolEmpty),
                Err(TryRecvError::Disconnected) => return Err(CameraError::SessionClosed),
            },
            Some(timeout) => Selector::new()
                .recv(&self.inner.free_rx, |id| id.map_err(|_| CameraError::SessionClosed))
                .recv(&self.inner.shutdown_rx, |_| Err(CameraError::SessionClosed))
                .wait_timeout(timeout)
                .map_err(|_| CameraError::Timeout)??,
        };

        let lease = self.inner.lease(id, target)?;
        if self.is_closed() {
            return Err(CameraError::SessionClosed);
        }
        Ok(lease)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.inner.id)
            .field("capacity", &self.capacity())
            .field("buffer_size", &self.inner.buffer_size)
            .field("census", &self.census())
            .finish()
    }
}

/// Exclusive claim on one pooled buffer
///
/// Dropping a lease hands the buffer back to the pool unless the pool has
/// already reclaimed it.
pub struct BufferLease {
    pool: Arc<PoolInner>,
    slot: usize,
    epoch: u64,
    armed: bool,
}

impl BufferLease {
    pub fn id(&self) -> usize {
        self.slot
    }

    pub fn capacity(&self) -> usize {
        self.pool.buffer_size
    }

    /// Current state, or `None` once the buffer has been reclaimed
    pub fn state(&self) -> Option<BufferState> {
        let tag = self.pool.slots.get(self.slot)?.tag();
        (tag.epoch == self.epoch).then_some(tag.state)
    }

    /// Fill the buffer; only valid while it is queued with the transport
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let slot = self.pool.slot(self.slot)?;
        let tag = slot.tag();
        self.check(&tag, &[BufferState::Queued])?;
        let mut data = slot.data.write().unwrap_or_else(PoisonError::into_inner);
        drop(tag);
        Ok(f(&mut data))
    }

    /// Queued -> Ready, recording what the transport wrote
    pub fn mark_ready(&self, meta: FrameMetadata) -> Result<()> {
        let slot = self.pool.slot(self.slot)?;
        let mut tag = slot.tag();
        self.check(&tag, &[BufferState::Queued])?;
        tag.state = BufferState::Ready;
        tag.meta = meta;
        Ok(())
    }

    /// Ready -> InUse on handoff to a consumer; already InUse is fine
    pub(crate) fn mark_in_use(&self) -> Result<()> {
        let slot = self.pool.slot(self.slot)?;
        let mut tag = slot.tag();
        self.check(&tag, &[BufferState::Ready, BufferState::InUse])?;
        tag.state = BufferState::InUse;
        Ok(())
    }

    pub fn metadata(&self) -> Result<FrameMetadata> {
        let slot = self.pool.slot(self.slot)?;
        let tag = slot.tag();
        if tag.epoch != self.epoch {
            return Err(self.pool.stale(self.slot));
        }
        Ok(tag.meta.clone())
    }

    /// Read the filled bytes (`bytes_used` of them, or the whole buffer)
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let slot = self.pool.slot(self.slot)?;
        let tag = slot.tag();
        self.check(&tag, &[BufferState::Ready, BufferState::InUse])?;
        let used = match tag.meta.bytes_used {
            0 => self.pool.buffer_size,
            n => n.min(self.pool.buffer_size),
        };
        let data = slot.data.read().unwrap_or_else(PoisonError::into_inner);
        drop(tag);
        Ok(f(&data[..used]))
    }

    /// Hand the buffer back; only a Ready or InUse buffer may be released
    pub fn release(mut self) -> Result<()> {
        self.armed = false;
        self.pool.free_slot(
            self.slot,
            self.epoch,
            Some(&[BufferState::Ready, BufferState::InUse]),
        )
    }

    fn check(&self, tag: &Tag, allowed: &[BufferState]) -> Result<()> {
        if tag.epoch != self.epoch {
            return Err(self.pool.stale(self.slot));
        }
        if !allowed.contains(&tag.state) {
            return Err(CameraError::InvalidOwnership(format!(
                "buffer {} is {}, expected one of {:?}",
                self.slot, tag.state, allowed
            )));
        }
        Ok(())
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.pool.free_slot(self.slot, self.epoch, None);
        }
    }
}

impl fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferLease")
            .field("pool", &self.pool.id)
            .field("slot", &self.slot)
            .field("epoch", &self.epoch)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn filled(pool: &BufferPool, sequence: u64) -> BufferLease {
        let lease = pool.checkout_for_fill().expect("free buffer");
        lease.write(|buf| buf.fill(sequence as u8)).expect("write");
        lease
            .mark_ready(FrameMetadata {
                sequence,
                bytes_used: 4,
                valid: true,
                ..Default::default()
            })
            .expect("mark ready");
        lease
    }

    #[test]
    fn test_preallocate_rejects_zero_and_huge() {
        assert!(matches!(
            BufferPool::preallocate(0, 16),
            Err(CameraError::ResourceExhausted(_))
        ));
        assert!(matches!(
            BufferPool::preallocate(2, usize::MAX),
            Err(CameraError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_acquire_until_empty() {
        let pool = BufferPool::preallocate(2, 8).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(CameraError::PoolEmpty)));
        assert_eq!(pool.census().in_use, 2);

        pool.release(a).unwrap();
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.census().free, 2);
    }

    #[test]
    fn test_acquire_timeout() {
        let pool = BufferPool::preallocate(1, 8).unwrap();
        let _held = pool.acquire().unwrap();
        assert!(matches!(
            pool.acquire_timeout(Duration::from_millis(20)),
            Err(CameraError::Timeout)
        ));
    }

    #[test]
    fn test_blocking_acquire_wakes_on_release() {
        let pool = BufferPool::preallocate(1, 8).unwrap();
        let held = pool.acquire().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire_timeout(Duration::from_secs(5)).map(|l| l.id()))
        };
        thread::sleep(Duration::from_millis(20));
        pool.release(held).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_close_wakes_waiters() {
        let pool = BufferPool::preallocate(1, 8).unwrap();
        let _held = pool.acquire().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire_timeout(Duration::from_secs(5)).map(|l| l.id()))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(pool.close(), 1);
        assert!(matches!(waiter.join().unwrap(), Err(CameraError::SessionClosed)));
    }

    #[test]
    fn test_release_requires_ready_or_in_use() {
        let pool = BufferPool::preallocate(1, 8).unwrap();
        let queued = pool.checkout_for_fill().unwrap();
        assert!(matches!(
            pool.release(queued),
            Err(CameraError::InvalidOwnership(_))
        ));
        // The buffer is never lost, even on a bad release
        assert_eq!(pool.census().free, 1);
    }

    #[test]
    fn test_release_into_foreign_pool() {
        let a = BufferPool::preallocate(1, 8).unwrap();
        let b = BufferPool::preallocate(1, 8).unwrap();
        let lease = a.acquire().unwrap();
        assert!(matches!(b.release(lease), Err(CameraError::InvalidOwnership(_))));
        assert_eq!(a.census().free, 1);
        assert_eq!(b.census().free, 1);
    }

    #[test]
    fn test_reclaimed_lease_is_inert() {
        let pool = BufferPool::preallocate(2, 8).unwrap();
        let ready = filled(&pool, 7);
        assert_eq!(pool.reclaim(&[BufferState::Ready]), 1);

        assert_eq!(ready.state(), None);
        assert!(matches!(ready.read(|_| ()), Err(CameraError::InvalidOwnership(_))));
        assert!(matches!(ready.release(), Err(CameraError::InvalidOwnership(_))));
        assert_eq!(pool.census().free, 2);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_fill_and_read_round() {
        let pool = BufferPool::preallocate(1, 8).unwrap();
        let lease = filled(&pool, 3);
        assert!(lease.write(|_| ()).is_err());
        lease.mark_in_use().unwrap();
        let bytes = lease.read(|b| b.to_vec()).unwrap();
        assert_eq!(bytes, vec![3, 3, 3, 3]);
        assert_eq!(lease.metadata().unwrap().sequence, 3);
        lease.release().unwrap();
    }

    #[test]
    fn test_census_constant_under_concurrency() {
        const BUFFERS: usize = 4;
        let pool = BufferPool::preallocate(BUFFERS, 64).unwrap();
        let workers: Vec<_> = (0..6)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        if let Ok(lease) = pool.acquire_timeout(Duration::from_millis(50)) {
                            assert_eq!(lease.state(), Some(BufferState::InUse));
                            assert_eq!(pool.census().total(), BUFFERS);
                            pool.release(lease).unwrap();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(pool.census().free, BUFFERS);
        assert_eq!(pool.available(), BUFFERS);
    }
}
