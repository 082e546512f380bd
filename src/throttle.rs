use std::time::Instant;

use tracing::trace;

/// Traffic categories with independent bandwidth budgets. The set is fixed;
///  every template names the category its messages spend from, and
///  retransmissions always spend from `Resend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleCategory {
    Resend,
    Land,
    Wind,
    Cloud,
    Task,
    Texture,
    Asset,
}

impl ThrottleCategory {
    pub const ALL: [ThrottleCategory; 7] = [
        ThrottleCategory::Resend,
        ThrottleCategory::Land,
        ThrottleCategory::Wind,
        ThrottleCategory::Cloud,
        ThrottleCategory::Task,
        ThrottleCategory::Texture,
        ThrottleCategory::Asset,
    ];

    fn index(self) -> usize {
        match self {
            ThrottleCategory::Resend => 0,
            ThrottleCategory::Land => 1,
            ThrottleCategory::Wind => 2,
            ThrottleCategory::Cloud => 3,
            ThrottleCategory::Task => 4,
            ThrottleCategory::Texture => 5,
            ThrottleCategory::Asset => 6,
        }
    }
}

/// Default per-category rates in bytes per second.
pub const DEFAULT_RATES: [f32; 7] = [
    12_500.0, // resend
    17_500.0, // land
    1_750.0,  // wind
    1_750.0,  // cloud
    31_500.0, // task
    47_500.0, // texture
    27_500.0, // asset
];

/// A bucket holds up to one second's worth of its allocation. The allocation
///  drifts from the nominal rate under dynamic adjustment but stays within
///  [0.2x, 2x] nominal, and the sum over all buckets is preserved.
#[derive(Debug)]
struct Bucket {
    nominal_rate: f32,
    allocation: f32,
    level: f32,
    overflowed: bool,
}

const ALLOCATION_FLOOR: f32 = 0.2;
const ALLOCATION_CEILING: f32 = 2.0;
/// Share of a surplus bucket's allocation offered per rebalance.
const DONATION_SHARE: f32 = 0.1;

/// One token bucket per category; owned by a circuit.
#[derive(Debug)]
pub struct ThrottleGroup {
    buckets: [Bucket; 7],
    last_update: Instant,
}

impl ThrottleGroup {
    pub fn new(rates: [f32; 7], now: Instant) -> ThrottleGroup {
        ThrottleGroup {
            buckets: rates.map(|rate| Bucket {
                nominal_rate: rate,
                allocation: rate,
                level: rate,
                overflowed: false,
            }),
            last_update: now,
        }
    }

    pub fn with_default_rates(now: Instant) -> ThrottleGroup {
        ThrottleGroup::new(DEFAULT_RATES, now)
    }

    /// Returns true when admitting `size_bytes` would exceed the bucket;
    ///  otherwise debits the bucket and returns false.
    pub fn check_overflow(&mut self, category: ThrottleCategory, size_bytes: usize) -> bool {
        let bucket = &mut self.buckets[category.index()];
        let size = size_bytes as f32;

        if size > bucket.level {
            trace!(
                ?category,
                size_bytes,
                level = bucket.level,
                "throttle overflow"
            );
            bucket.overflowed = true;
            return true;
        }

        bucket.level -= size;
        false
    }

    /// Refills every bucket proportional to the time since the last update,
    ///  clamped to one second's worth of the current allocation.
    pub fn update_average(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f32();
        self.last_update = now;

        for bucket in &mut self.buckets {
            bucket.level = (bucket.level + bucket.allocation * elapsed).min(bucket.allocation);
        }
    }

    /// Slowly shifts bandwidth from buckets that kept up to buckets that
    ///  overflowed since the last adjustment. Donors give up a fixed share of
    ///  their allocation down to the floor; what the starved buckets cannot
    ///  absorb below their ceiling is handed back, keeping the total
    ///  allocation constant.
    pub fn dynamic_adjust(&mut self) {
        let starved: Vec<usize> = (0..self.buckets.len())
            .filter(|&i| self.buckets[i].overflowed)
            .collect();
        if starved.is_empty() || starved.len() == self.buckets.len() {
            for bucket in &mut self.buckets {
                bucket.overflowed = false;
            }
            return;
        }

        let mut donations = [0.0f32; 7];
        let mut pool = 0.0f32;
        for (i, bucket) in self.buckets.iter().enumerate() {
            if bucket.overflowed {
                continue;
            }
            let floor = bucket.nominal_rate * ALLOCATION_FLOOR;
            let headroom = (bucket.allocation - floor).max(0.0);
            donations[i] = (bucket.allocation * DONATION_SHARE).min(headroom);
            pool += donations[i];
        }

        let mut granted = 0.0f32;
        let share = pool / starved.len() as f32;
        for &i in &starved {
            let bucket = &mut self.buckets[i];
            let ceiling = bucket.nominal_rate * ALLOCATION_CEILING;
            let grant = share.min(ceiling - bucket.allocation).max(0.0);
            bucket.allocation += grant;
            granted += grant;
        }

        // hand undistributed surplus back so the sum stays constant
        let refund_factor = if pool > 0.0 { granted / pool } else { 0.0 };
        for (i, bucket) in self.buckets.iter_mut().enumerate() {
            bucket.allocation -= donations[i] * refund_factor;
            bucket.overflowed = false;
        }
    }

    /// Restores every allocation to its nominal rate.
    pub fn reset_dynamic_adjust(&mut self) {
        for bucket in &mut self.buckets {
            bucket.allocation = bucket.nominal_rate;
            bucket.level = bucket.level.min(bucket.allocation);
            bucket.overflowed = false;
        }
    }

    #[cfg(test)]
    fn total_allocation(&self) -> f32 {
        self.buckets.iter().map(|b| b.allocation).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    fn group(now: Instant) -> ThrottleGroup {
        ThrottleGroup::new([1000.0; 7], now)
    }

    #[test]
    fn test_admits_until_empty() {
        let now = Instant::now();
        let mut throttles = group(now);

        assert!(!throttles.check_overflow(ThrottleCategory::Task, 600));
        assert!(!throttles.check_overflow(ThrottleCategory::Task, 400));
        assert!(throttles.check_overflow(ThrottleCategory::Task, 1));
    }

    #[test]
    fn test_categories_are_independent() {
        let now = Instant::now();
        let mut throttles = group(now);

        assert!(!throttles.check_overflow(ThrottleCategory::Task, 1000));
        assert!(throttles.check_overflow(ThrottleCategory::Task, 1));
        assert!(!throttles.check_overflow(ThrottleCategory::Texture, 1000));
    }

    #[rstest]
    #[case::partial(Duration::from_millis(500), 500.0)]
    #[case::full(Duration::from_secs(1), 1000.0)]
    #[case::clamped(Duration::from_secs(10), 1000.0)]
    fn test_refill(#[case] elapsed: Duration, #[case] expected_budget: f32) {
        let now = Instant::now();
        let mut throttles = group(now);

        // drain the bucket completely
        assert!(!throttles.check_overflow(ThrottleCategory::Wind, 1000));

        throttles.update_average(now + elapsed);
        assert!(!throttles.check_overflow(ThrottleCategory::Wind, expected_budget as usize));
        assert!(throttles.check_overflow(ThrottleCategory::Wind, 1));
    }

    #[test]
    fn test_dynamic_adjust_preserves_total_and_bounds() {
        let now = Instant::now();
        let mut throttles = ThrottleGroup::with_default_rates(now);
        let total_before = throttles.total_allocation();

        // starve the texture bucket repeatedly
        for _ in 0..50 {
            let _ = throttles.check_overflow(ThrottleCategory::Texture, usize::MAX / 2);
            throttles.dynamic_adjust();
        }

        let total_after = throttles.total_allocation();
        assert!((total_before - total_after).abs() < 1.0);

        for (bucket, nominal) in throttles.buckets.iter().zip(DEFAULT_RATES) {
            assert!(bucket.allocation >= nominal * ALLOCATION_FLOOR - 1.0);
            assert!(bucket.allocation <= nominal * ALLOCATION_CEILING + 1.0);
        }

        let texture = &throttles.buckets[ThrottleCategory::Texture.index()];
        assert!(texture.allocation > texture.nominal_rate);
    }

    #[test]
    fn test_reset_dynamic_adjust_restores_nominal() {
        let now = Instant::now();
        let mut throttles = ThrottleGroup::with_default_rates(now);

        let _ = throttles.check_overflow(ThrottleCategory::Cloud, usize::MAX / 2);
        throttles.dynamic_adjust();
        throttles.reset_dynamic_adjust();

        for bucket in &throttles.buckets {
            assert_eq!(bucket.allocation, bucket.nominal_rate);
        }
    }
}
