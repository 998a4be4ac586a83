use std::sync::atomic::{AtomicU32, Ordering};

/// Cumulative progress for one pipeline run, shared between the worker and
/// observer snapshots. Weighted increments keep the value in 0-99; only
/// `complete` reaches 100, so the bar never flashes full early.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    value: AtomicU32,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> u8 {
        self.value.load(Ordering::Relaxed).min(100) as u8
    }

    /// Adds `round(delta * weight / 100)` where `delta` is a job's internal
    /// 0-100 sub-progress share. Pins at 99 when the total would reach 100.
    /// Only the run's single worker writes.
    pub fn advance(&self, delta: u32, weight: u32) -> u8 {
        let step = (delta * weight + 50) / 100;
        let current = self.value.load(Ordering::Relaxed);
        let next = if current + step < 100 { current + step } else { 99 };
        self.value.store(next, Ordering::Relaxed);
        next as u8
    }

    /// The explicit full-completion signal; the only path to 100.
    pub fn complete(&self) -> u8 {
        self.value.store(100, Ordering::Relaxed);
        100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_scales_by_job_weight() {
        let progress = ProgressCounter::new();
        assert_eq!(progress.advance(80, 30), 24);
        assert_eq!(progress.advance(10, 30), 27);
        assert_eq!(progress.advance(10, 30), 30);
        assert_eq!(progress.value(), 30);
    }

    #[test]
    fn advance_is_monotonic_and_pins_at_99() {
        let progress = ProgressCounter::new();
        let mut last = 0;
        for _ in 0..30 {
            let value = progress.advance(100, 10);
            assert!(value >= last);
            last = value;
        }
        assert_eq!(progress.value(), 99);

        // Further advances never move past the pin.
        assert_eq!(progress.advance(100, 100), 99);
    }

    #[test]
    fn only_complete_reaches_100() {
        let progress = ProgressCounter::new();
        for _ in 0..100 {
            assert!(progress.advance(100, 50) < 100);
        }
        assert_eq!(progress.complete(), 100);
        assert_eq!(progress.value(), 100);
    }

    #[test]
    fn zero_weight_never_moves_the_counter() {
        let progress = ProgressCounter::new();
        assert_eq!(progress.advance(100, 0), 0);
        assert_eq!(progress.value(), 0);
    }
}
