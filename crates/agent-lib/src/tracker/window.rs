//! Rolling window means
//!
//! Keeps one bounded suffix of valid predicted rates, long enough for the
//! largest window. Every window is a read-side view over that suffix.

use crate::models::WindowMean;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct RollingWindows {
    sizes: Vec<usize>,
    rates: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindows {
    /// Create windows of the given sizes; callers validate that sizes are non-zero
    pub fn new(sizes: &[usize]) -> Self {
        let capacity = sizes.iter().copied().max().unwrap_or(0);
        Self {
            sizes: sizes.to_vec(),
            rates: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add one valid rate, evicting the oldest beyond the largest window
    pub fn push(&mut self, rate: f64) {
        if self.capacity == 0 {
            return;
        }
        if self.rates.len() == self.capacity {
            self.rates.pop_front();
        }
        self.rates.push_back(rate);
    }

    /// Mean of the last min(k, N) valid rates; `None` before the first one
    pub fn mean(&self, k: usize) -> Option<f64> {
        let samples = k.min(self.rates.len());
        if samples == 0 {
            return None;
        }
        let sum: f64 = self.rates.iter().rev().take(samples).sum();
        Some(sum / samples as f64)
    }

    /// Current mean of every configured window, in configuration order
    pub fn means(&self) -> Vec<WindowMean> {
        self.sizes
            .iter()
            .map(|&size| WindowMean {
                size,
                samples: size.min(self.rates.len()),
                mean: self.mean(size),
            })
            .collect()
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Number of rates currently retained
    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    pub fn clear(&mut self) {
        self.rates.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_windows() {
        let windows = RollingWindows::new(&[2, 4]);
        assert!(windows.is_empty());
        assert_eq!(windows.mean(2), None);
        assert!(windows.means().iter().all(|w| w.mean.is_none() && w.samples == 0));
    }

    #[test]
    fn test_mean_over_available_samples() {
        let mut windows = RollingWindows::new(&[2, 4, 8]);
        for rate in [10.0, 20.0, 30.0] {
            windows.push(rate);
        }

        let means = windows.means();
        assert_eq!(means[0].mean, Some(25.0));
        assert_eq!(means[0].samples, 2);
        assert_eq!(means[1].mean, Some(20.0));
        assert_eq!(means[1].samples, 3);
        assert_eq!(means[2].mean, Some(20.0));
    }

    #[test]
    fn test_bounded_by_largest_window() {
        let mut windows = RollingWindows::new(&[3, 2]);
        for rate in 1..=10 {
            windows.push(rate as f64);
        }
        assert_eq!(windows.len(), 3);
        assert_eq!(windows.mean(3), Some(9.0));
        assert_eq!(windows.mean(2), Some(9.5));
    }
}
