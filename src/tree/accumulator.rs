//! Lock-free f32 accumulation for gradient scatter
//!
//! Backward passes run one task per query or ray, and many tasks may hit the
//! same cell. Each element is an `AtomicU32` holding f32 bits and is updated
//! with a compare-and-swap loop, so concurrent adds are never lost. The final
//! sum is independent of scheduling up to floating-point rounding order.

use std::sync::atomic::{AtomicU32, Ordering};

/// Buffer of f32 supporting concurrent `add` through a shared reference
#[derive(Debug, Default)]
pub struct AtomicAccumulator {
    values: Vec<AtomicU32>,
}

impl AtomicAccumulator {
    /// Zero-initialized accumulator of `len` elements
    pub fn zeros(len: usize) -> Self {
        let zero = 0.0f32.to_bits();
        Self {
            values: (0..len).map(|_| AtomicU32::new(zero)).collect(),
        }
    }

    /// Continue accumulating into an existing buffer
    pub fn from_vec(values: Vec<f32>) -> Self {
        Self {
            values: values.into_iter().map(|v| AtomicU32::new(v.to_bits())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Atomically add `value` to element `index`
    #[inline]
    pub fn add(&self, index: usize, value: f32) {
        if value == 0.0 {
            return;
        }
        let slot = &self.values[index];
        let mut current = slot.load(Ordering::Relaxed);
        loop {
            let next = (f32::from_bits(current) + value).to_bits();
            match slot.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Add `values[i] * scale` to elements `start + i`
    #[inline]
    pub fn add_scaled(&self, start: usize, values: &[f32], scale: f32) {
        if scale == 0.0 {
            return;
        }
        for (i, &v) in values.iter().enumerate() {
            self.add(start + i, v * scale);
        }
    }

    /// Current value of one element
    pub fn get(&self, index: usize) -> f32 {
        f32::from_bits(self.values[index].load(Ordering::Relaxed))
    }

    /// Consume the accumulator, returning the plain buffer
    pub fn into_vec(self) -> Vec<f32> {
        self.values
            .into_iter()
            .map(|v| f32::from_bits(v.into_inner()))
            .collect()
    }
}
