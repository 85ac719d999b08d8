use std::sync::atomic::{AtomicU64, Ordering};

/// A feature weight that supports lock-free reads and updates.
///
/// The value is an `f64` stored in an [`AtomicU64`] through its bit pattern.
/// Concurrent training workers update weights through
/// [`atomic_add_clamped`](Self::atomic_add_clamped) without any other
/// synchronization; readers may observe any interleaving of updates.
#[derive(Debug, Default)]
pub struct LockFreeWeight {
    bits: AtomicU64,
}

impl LockFreeWeight {
    /// Creates a weight holding the given value.
    #[inline(always)]
    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    /// Returns the current value.
    #[inline(always)]
    pub fn value(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// Stores a new value.
    #[inline(always)]
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Adds `delta` with a plain load/store pair. Only safe to call while no
    /// other thread updates this weight.
    #[inline(always)]
    pub fn add(&self, delta: f64) {
        self.set(self.value() + delta);
    }

    /// Atomically adds `delta` and clamps the result into `[lo, hi]`,
    /// retrying until the compare-and-swap succeeds.
    #[inline(always)]
    pub fn atomic_add_clamped(&self, delta: f64, lo: f64, hi: f64) {
        let mut expected = self.bits.load(Ordering::Relaxed);
        loop {
            let desired = (f64::from_bits(expected) + delta).clamp(lo, hi);
            match self.bits.compare_exchange_weak(
                expected,
                desired.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                // On failure the latest value is retried.
                Err(actual) => expected = actual,
            }
        }
    }
}

impl Clone for LockFreeWeight {
    fn clone(&self) -> Self {
        Self::new(self.value())
    }
}
