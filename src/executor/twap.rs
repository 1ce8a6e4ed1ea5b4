// =============================================================================
// TWAP slicing: clip planning and pacing for large intents
// =============================================================================
//
// A TWAP intent divides its target notional into clips of bounded size with
// randomized inter-clip delays. Each clip is a mini two-leg atomic action
// sliced proportionally on both legs, so partial progress preserves delta
// neutrality. A clip slipping beyond the abort threshold cancels the
// remaining clips; filled clips are never reversed.
// =============================================================================

use std::time::Duration;

use rand::Rng;

/// One slice of a TWAP execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TwapClip {
    pub index: usize,
    pub notional: f64,
}

/// The full clip schedule for one intent.
#[derive(Debug, Clone)]
pub struct TwapPlan {
    pub clips: Vec<TwapClip>,
}

impl TwapPlan {
    /// Divide `target_notional` into clips of at most `clip_max`, the last
    /// clip carrying the remainder.
    pub fn new(target_notional: f64, clip_max: f64) -> Self {
        let mut clips = Vec::new();
        if target_notional <= 0.0 || clip_max <= 0.0 {
            return Self { clips };
        }

        let mut remaining = target_notional;
        let mut index = 0;
        while remaining > 1e-9 {
            let notional = remaining.min(clip_max);
            clips.push(TwapClip { index, notional });
            remaining -= notional;
            index += 1;
        }
        Self { clips }
    }

    pub fn total_notional(&self) -> f64 {
        self.clips.iter().map(|c| c.notional).sum()
    }
}

/// Randomized inter-clip delay drawn uniformly from `[min_s, max_s]`.
pub fn jitter_delay(min_s: u64, max_s: u64) -> Duration {
    let (lo, hi) = (min_s.min(max_s), min_s.max(max_s));
    if lo == hi {
        return Duration::from_secs(lo);
    }
    let secs = rand::thread_rng().gen_range(lo..=hi);
    Duration::from_secs(secs)
}

/// Adverse slippage of an achieved price versus the reference, in basis
/// points. Positive means worse than reference for the given buy/sell sign.
pub fn slippage_bps(reference: f64, achieved: f64, side_sign: f64) -> f64 {
    if reference <= 0.0 {
        return 0.0;
    }
    side_sign * (achieved - reference) / reference * 10_000.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_divides_evenly() {
        let plan = TwapPlan::new(20_000.0, 500.0);
        assert_eq!(plan.clips.len(), 40);
        assert!(plan.clips.iter().all(|c| (c.notional - 500.0).abs() < 1e-9));
        assert!((plan.total_notional() - 20_000.0).abs() < 1e-9);
    }

    #[test]
    fn plan_keeps_remainder_in_last_clip() {
        let plan = TwapPlan::new(1_234.0, 500.0);
        assert_eq!(plan.clips.len(), 3);
        assert!((plan.clips[2].notional - 234.0).abs() < 1e-9);
        assert_eq!(plan.clips[2].index, 2);
    }

    #[test]
    fn plan_is_empty_for_degenerate_inputs() {
        assert!(TwapPlan::new(0.0, 500.0).clips.is_empty());
        assert!(TwapPlan::new(-5.0, 500.0).clips.is_empty());
        assert!(TwapPlan::new(100.0, 0.0).clips.is_empty());
    }

    #[test]
    fn jitter_stays_in_bounds() {
        for _ in 0..200 {
            let d = jitter_delay(30, 90);
            assert!(d >= Duration::from_secs(30));
            assert!(d <= Duration::from_secs(90));
        }
        assert_eq!(jitter_delay(45, 45), Duration::from_secs(45));
    }

    #[test]
    fn slippage_sign_is_adverse_aware() {
        // Buying higher than reference is adverse.
        assert!(slippage_bps(100.0, 100.25, 1.0) > 0.0);
        // Selling higher than reference is favourable.
        assert!(slippage_bps(100.0, 100.25, -1.0) < 0.0);
        let bps = slippage_bps(100.0, 100.25, 1.0);
        assert!((bps - 25.0).abs() < 1e-9);
    }
}
