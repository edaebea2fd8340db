//! Growable byte buffers for per-connection scratch and response assembly.
//!
//! Buffers grow with a doubled-plus-25%-over policy and are cleared rather
//! than freed between requests, so steady-state service stays off the
//! allocator.  Growth events feed a pair of process-wide stats counters.

use std::sync::atomic::{AtomicUsize, Ordering};

static ALLOC_COUNT: AtomicUsize = AtomicUsize::new(0);
static ALLOC_BYTES: AtomicUsize = AtomicUsize::new(0);

/// A byte buffer that only ever grows while in use and is cleared (capacity
/// retained) between requests.
#[derive(Debug, Default)]
pub struct GrowBuf {
    data: Vec<u8>,
}

impl GrowBuf {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(n: usize) -> Self {
        let mut buf = Self::new();
        buf.reserve_for(n);
        buf
    }

    /// Ensure room for `extra` more bytes using the historical policy:
    /// fresh buffers get `max(200, need + 100)`, grown buffers get
    /// `max(2 * capacity, need * 5 / 4)`.
    pub fn reserve_for(&mut self, extra: usize) {
        let need = self.data.len() + extra;
        let cap = self.data.capacity();
        if cap >= need && cap != 0 {
            return;
        }

        let new_cap = if cap == 0 {
            std::cmp::max(200, need + 100)
        } else {
            std::cmp::max(cap * 2, need * 5 / 4)
        };
        self.data.reserve_exact(new_cap - self.data.len());

        ALLOC_COUNT.fetch_add(1, Ordering::Relaxed);
        ALLOC_BYTES.fetch_add(new_cap - cap, Ordering::Relaxed);
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.reserve_for(bytes.len());
        self.data.extend_from_slice(bytes);
    }

    pub fn push_str(&mut self, s: &str) {
        self.push(s.as_bytes());
    }

    /// Expose `len..len+extra` as writable spare room.  The caller reports
    /// how much it actually filled via [`GrowBuf::advance`].
    pub fn spare(&mut self, extra: usize) -> &mut [u8] {
        self.reserve_for(extra);
        let len = self.data.len();
        self.data.resize(len + extra, 0);
        &mut self.data[len..]
    }

    pub fn advance(&mut self, filled: usize, requested: usize) {
        debug_assert!(filled <= requested);
        let len = self.data.len();
        self.data.truncate(len - (requested - filled));
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }
}

impl std::ops::Index<std::ops::Range<usize>> for GrowBuf {
    type Output = [u8];

    fn index(&self, r: std::ops::Range<usize>) -> &[u8] {
        &self.data[r]
    }
}

/// Allocation statistics for a periodic stats log line.
pub fn alloc_stats() -> (usize, usize) {
    (
        ALLOC_COUNT.load(Ordering::Relaxed),
        ALLOC_BYTES.load(Ordering::Relaxed),
    )
}
