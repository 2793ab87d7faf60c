use crate::common::types::DataPoint;
use crate::error::{TsdbError, TsdbResult};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// High-water marks are kept for this many GC rounds; the free list is
/// trimmed to the max observed across the window.
const GC_WINDOW: usize = 8;

/// An object that can be returned to a [`RecyclePool`] after use.
pub trait Recyclable: Default + Send {
    /// Reset to a reusable state. Capacity is kept, contents dropped.
    fn recycle(&mut self);
}

impl Recyclable for Vec<DataPoint> {
    fn recycle(&mut self) {
        self.clear();
    }
}

impl Recyclable for Vec<u8> {
    fn recycle(&mut self) {
        self.clear();
    }
}

struct PoolState<T> {
    free: Vec<T>,
    in_use: usize,
    peak_in_use: usize,
    window: VecDeque<usize>,
}

/// Free-list allocator for short-lived objects on the hot path. One pool per
/// type, guarded by its own mutex. Exhaustion past the soft cap surfaces
/// `OutOfMemory` instead of allocating further.
pub struct RecyclePool<T: Recyclable> {
    state: Mutex<PoolState<T>>,
    cap: usize,
}

impl<T: Recyclable> RecyclePool<T> {
    pub fn new(cap: usize) -> Self {
        RecyclePool {
            state: Mutex::new(PoolState {
                free: Vec::new(),
                in_use: 0,
                peak_in_use: 0,
                window: VecDeque::with_capacity(GC_WINDOW),
            }),
            cap,
        }
    }

    pub fn acquire(self: &Arc<Self>) -> TsdbResult<Pooled<T>> {
        let mut state = self.state.lock().unwrap();
        if state.in_use >= self.cap {
            return Err(TsdbError::OutOfMemory);
        }
        let item = state.free.pop().unwrap_or_default();
        state.in_use += 1;
        state.peak_in_use = state.peak_in_use.max(state.in_use);
        Ok(Pooled {
            pool: Arc::clone(self),
            item: Some(item),
        })
    }

    fn release(&self, mut item: T) {
        item.recycle();
        let mut state = self.state.lock().unwrap();
        state.in_use = state.in_use.saturating_sub(1);
        state.free.push(item);
    }

    /// One GC round: record the high-water mark since the last round and trim
    /// the free list down to the max observed over the window.
    pub fn gc(&self) {
        let mut state = self.state.lock().unwrap();
        let peak = state.peak_in_use;
        if state.window.len() == GC_WINDOW {
            state.window.pop_front();
        }
        state.window.push_back(peak);
        let watermark = state.window.iter().copied().max().unwrap_or(0);
        let keep = watermark.saturating_sub(state.in_use);
        state.free.truncate(keep);
        state.peak_in_use = state.in_use;
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.state.lock().unwrap().in_use
    }
}

/// Scoped pool acquisition; returns the object on drop.
pub struct Pooled<T: Recyclable> {
    pool: Arc<RecyclePool<T>>,
    item: Option<T>,
}

impl<T: Recyclable> Deref for Pooled<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.item.as_ref().unwrap()
    }
}

impl<T: Recyclable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap()
    }
}

impl<T: Recyclable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}

/// The process-wide pools used by the write and query hot paths. Ordinary
/// allocation remains available on cold paths (bucket creation, compaction).
pub struct EnginePools {
    pub data_points: Arc<RecyclePool<Vec<DataPoint>>>,
    pub net_buffers: Arc<RecyclePool<Vec<u8>>>,
    net_buffer_size: usize,
    shutdown_requested: AtomicBool,
}

impl EnginePools {
    pub fn new(cap: usize, net_buffer_size: usize) -> Self {
        EnginePools {
            data_points: Arc::new(RecyclePool::new(cap)),
            net_buffers: Arc::new(RecyclePool::new(cap)),
            net_buffer_size,
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn acquire_data_points(&self, capacity: usize) -> TsdbResult<Pooled<Vec<DataPoint>>> {
        match self.data_points.acquire() {
            Ok(mut v) => {
                v.reserve(capacity);
                Ok(v)
            }
            Err(e) => {
                self.note_exhaustion();
                Err(e)
            }
        }
    }

    /// Fixed-size buffers for listener payloads; the only pool entries sized
    /// by page size.
    pub fn acquire_net_buffer(&self) -> TsdbResult<Pooled<Vec<u8>>> {
        match self.net_buffers.acquire() {
            Ok(mut v) => {
                v.reserve(self.net_buffer_size);
                Ok(v)
            }
            Err(e) => {
                self.note_exhaustion();
                Err(e)
            }
        }
    }

    fn note_exhaustion(&self) {
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!("recycle pool exhausted, requesting shutdown");
        }
    }

    /// Set when a pool ran dry; the lifecycle scheduler checks this and asks
    /// the admin surface to shut down cleanly.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn gc(&self) {
        self.data_points.gc();
        self.net_buffers.gc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_reuses_capacity() {
        let pool: Arc<RecyclePool<Vec<DataPoint>>> = Arc::new(RecyclePool::new(4));
        {
            let mut v = pool.acquire().unwrap();
            v.push(DataPoint::new(1, 1.0));
            v.reserve(100);
        }
        assert_eq!(pool.free_count(), 1);
        let v = pool.acquire().unwrap();
        assert!(v.is_empty());
        assert!(v.capacity() >= 100);
    }

    #[test]
    fn cap_exhaustion_is_out_of_memory() {
        let pool: Arc<RecyclePool<Vec<u8>>> = Arc::new(RecyclePool::new(2));
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(TsdbError::OutOfMemory)));
    }

    #[test]
    fn gc_trims_to_windowed_high_water() {
        let pool: Arc<RecyclePool<Vec<u8>>> = Arc::new(RecyclePool::new(64));
        {
            let _guards: Vec<_> = (0..8).map(|_| pool.acquire().unwrap()).collect();
        }
        assert_eq!(pool.free_count(), 8);
        pool.gc();
        assert_eq!(pool.free_count(), 8);

        // the burst ages out of the window and the free list shrinks with it
        for _ in 0..GC_WINDOW {
            pool.gc();
        }
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn engine_pools_flag_shutdown_on_exhaustion() {
        let pools = EnginePools::new(1, 512);
        let _held = pools.acquire_net_buffer().unwrap();
        assert!(!pools.shutdown_requested());
        assert!(pools.acquire_net_buffer().is_err());
        assert!(pools.shutdown_requested());
    }
}
