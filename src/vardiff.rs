//! Per-worker adaptive difficulty.
//!
//! Each worker keeps a ring of recent share timestamps. On a retarget tick
//! the observed inter-share interval is compared to the configured target;
//! outside the variance band, difficulty is scaled by `target / observed`,
//! step-limited and clamped. The new value does not take effect until the
//! next job notification (the session holds it as pending until then).

use std::collections::VecDeque;
use std::time::Instant;

use serde::Deserialize;

/// Upper bound on retained share timestamps per worker.
const RING_CAPACITY: usize = 90;

/// Largest single-retarget multiplier, both directions.
const MAX_STEP_FACTOR: f64 = 4.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VardiffConfig {
    /// Desired average seconds between accepted shares.
    pub target_time_secs: f64,
    /// How often to retarget.
    pub retarget_time_secs: f64,
    /// Tolerated deviation from the target interval, percent.
    pub variance_percent: f64,
    /// Retarget early once this many shares arrived since the last one.
    pub min_samples: usize,
    pub min_difficulty: f64,
    pub max_difficulty: f64,
}

impl Default for VardiffConfig {
    fn default() -> Self {
        Self {
            target_time_secs: 15.0,
            retarget_time_secs: 90.0,
            variance_percent: 30.0,
            min_samples: 10,
            min_difficulty: 0.01,
            max_difficulty: 1e12,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VardiffState {
    cfg: VardiffConfig,
    timestamps: VecDeque<Instant>,
    last_retarget: Instant,
    difficulty: f64,
}

impl VardiffState {
    pub fn new(cfg: VardiffConfig, now: Instant, initial_difficulty: f64) -> Self {
        let difficulty = initial_difficulty.clamp(cfg.min_difficulty, cfg.max_difficulty);
        Self {
            cfg,
            timestamps: VecDeque::with_capacity(RING_CAPACITY),
            last_retarget: now,
            difficulty,
        }
    }

    pub fn difficulty(&self) -> f64 {
        self.difficulty
    }

    /// Record an accepted share and retarget if the window is due.
    ///
    /// Returns `Some(new_difficulty)` when difficulty changed; the caller
    /// holds it pending until the next job notification.
    pub fn on_share(&mut self, now: Instant) -> Option<f64> {
        if self.timestamps.len() == RING_CAPACITY {
            self.timestamps.pop_front();
        }
        self.timestamps.push_back(now);
        self.maybe_retarget(now)
    }

    fn maybe_retarget(&mut self, now: Instant) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.last_retarget).as_secs_f64();
        let due = elapsed >= self.cfg.retarget_time_secs
            || self.timestamps.len() >= self.cfg.min_samples.max(2);
        if !due {
            return None;
        }

        let observed = self.observed_interval(elapsed);
        self.last_retarget = now;
        self.timestamps.clear();

        let target = self.cfg.target_time_secs.max(0.001);
        let deviation = (observed - target).abs() / target;
        if deviation * 100.0 <= self.cfg.variance_percent {
            return None;
        }

        let factor = (target / observed.max(0.001)).clamp(1.0 / MAX_STEP_FACTOR, MAX_STEP_FACTOR);
        let next =
            (self.difficulty * factor).clamp(self.cfg.min_difficulty, self.cfg.max_difficulty);
        if (next - self.difficulty).abs() / self.difficulty < 1e-9 {
            return None;
        }
        self.difficulty = next;
        Some(next)
    }

    fn observed_interval(&self, elapsed: f64) -> f64 {
        if self.timestamps.len() >= 2 {
            let span = self
                .timestamps
                .back()
                .unwrap()
                .saturating_duration_since(*self.timestamps.front().unwrap())
                .as_secs_f64();
            span / (self.timestamps.len() - 1) as f64
        } else {
            // No usable samples in the window: treat the whole window as
            // one interval so an idle worker drifts down.
            elapsed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::time::Duration;

    fn config() -> VardiffConfig {
        VardiffConfig {
            target_time_secs: 10.0,
            retarget_time_secs: 60.0,
            variance_percent: 20.0,
            min_samples: 6,
            min_difficulty: 0.5,
            max_difficulty: 1e9,
        }
    }

    #[test]
    fn fast_shares_raise_difficulty() {
        let clock = ManualClock::new();
        let mut state = VardiffState::new(config(), clock.now(), 100.0);

        // One share per second against a 10s target.
        let mut changed = None;
        for _ in 0..10 {
            clock.advance(Duration::from_secs(1));
            changed = state.on_share(clock.now()).or(changed);
        }
        let next = changed.expect("retarget expected");
        assert!(next > 100.0);
        assert!(next <= 400.0, "step limit exceeded: {}", next);
    }

    #[test]
    fn slow_shares_lower_difficulty() {
        let clock = ManualClock::new();
        let mut state = VardiffState::new(config(), clock.now(), 100.0);

        clock.advance(Duration::from_secs(70));
        let next = state.on_share(clock.now()).expect("retarget expected");
        assert!(next < 100.0);
    }

    #[test]
    fn steady_rate_within_band_is_untouched() {
        let clock = ManualClock::new();
        let mut state = VardiffState::new(config(), clock.now(), 100.0);

        for _ in 0..12 {
            clock.advance(Duration::from_secs(10));
            assert_eq!(state.on_share(clock.now()), None);
        }
        assert!((state.difficulty() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn converges_from_any_start_and_stops() {
        // A miner whose share interval is difficulty / hashrate; the ideal
        // difficulty for a 10s target at hashrate 10 is 100.
        let hashrate = 10.0;
        for start in [0.5f64, 3.0, 100.0, 50_000.0] {
            let clock = ManualClock::new();
            let mut state = VardiffState::new(config(), clock.now(), start);
            let mut retargets = 0;

            for _ in 0..12 {
                let interval = (state.difficulty() / hashrate).max(0.05);
                let mut changed = None;
                // Feed shares until a retarget fires or the window passes.
                for _ in 0..200 {
                    clock.advance(Duration::from_secs_f64(interval));
                    changed = state.on_share(clock.now());
                    if changed.is_some() {
                        break;
                    }
                }
                if changed.is_some() {
                    retargets += 1;
                }
            }

            let ideal = 100.0;
            assert!(
                (state.difficulty() - ideal).abs() / ideal <= 0.25,
                "start {} ended at {}",
                start,
                state.difficulty()
            );
            assert!(retargets <= 8, "start {} took {} retargets", start, retargets);
        }
    }

    #[test]
    fn clamps_to_configured_bounds() {
        let clock = ManualClock::new();
        let mut cfg = config();
        cfg.max_difficulty = 150.0;
        let mut state = VardiffState::new(cfg, clock.now(), 100.0);

        for _ in 0..10 {
            clock.advance(Duration::from_millis(200));
            if let Some(next) = state.on_share(clock.now()) {
                assert!(next <= 150.0);
            }
        }
    }
}
