use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};

use crate::models::CapWindow;

pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[cfg(test)]
pub struct NoSleep;

#[cfg(test)]
impl Sleeper for NoSleep {
    fn sleep(&self, _duration: Duration) {}
}

/// Inclusive `[min, max]` bounds in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min: f64,
    pub max: f64,
}

impl DelayRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min >= 0.0 && self.min <= self.max && self.max.is_finite()
    }

    fn sample_secs(&self, rng: &mut StdRng) -> f64 {
        if self.max <= self.min {
            return self.min.max(0.0);
        }
        rng.gen_range(self.min..=self.max)
    }
}

/// Randomised sleeping shared by every component that touches the network.
pub struct RandomDelay {
    rng: StdRng,
    sleeper: Box<dyn Sleeper>,
}

impl RandomDelay {
    pub fn new(sleeper: Box<dyn Sleeper>) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            sleeper,
        }
    }

    #[cfg(test)]
    pub fn with_seed(sleeper: Box<dyn Sleeper>, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            sleeper,
        }
    }

    /// Sleeps for a duration drawn from `range` and returns it.
    pub fn pause(&mut self, range: DelayRange) -> Duration {
        let delay = Duration::from_secs_f64(range.sample_secs(&mut self.rng));
        self.sleep(delay);
        delay
    }

    /// Draws from `range`, scales by a factor in `[1 - jitter, 1 + jitter]`
    /// and clamps the result back into `range`.
    pub fn jittered(&mut self, range: DelayRange, jitter: f64) -> Duration {
        let base = range.sample_secs(&mut self.rng);
        let jitter = jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            self.rng.gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        let secs = (base * factor).clamp(range.min.max(0.0), range.max.max(range.min).max(0.0));
        let delay = Duration::from_secs_f64(secs);
        self.sleep(delay);
        delay
    }

    pub fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            self.sleeper.sleep(duration);
        }
    }

    /// Bernoulli draw, used by the simulated applicant.
    pub fn chance(&mut self, probability: f64) -> bool {
        self.rng.gen_bool(probability.clamp(0.0, 1.0))
    }
}

/// Inter-posting pacing: a jittered delay after every posting and a longer
/// pause after every `pause_after` postings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PaceSettings {
    pub delay: DelayRange,
    pub jitter: f64,
    pub pause_after: usize,
    pub pause_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PaceStep {
    pub delay: Duration,
    pub pause: Option<Duration>,
}

pub struct Pacer {
    settings: PaceSettings,
    delay: RandomDelay,
    processed: usize,
}

impl Pacer {
    pub fn new(settings: PaceSettings, delay: RandomDelay) -> Self {
        Self {
            settings,
            delay,
            processed: 0,
        }
    }

    /// Called once a posting has been fully processed.
    pub fn after_posting(&mut self) -> PaceStep {
        self.processed += 1;
        let delay = self.delay.jittered(self.settings.delay, self.settings.jitter);
        debug!(delay_ms = delay.as_millis() as u64, processed = self.processed, "paced");

        let pause = if self.settings.pause_after > 0
            && self.processed % self.settings.pause_after == 0
            && self.settings.pause_secs > 0
        {
            let pause = Duration::from_secs(self.settings.pause_secs);
            info!(
                processed = self.processed,
                pause_secs = self.settings.pause_secs,
                "taking a longer pause"
            );
            self.delay.sleep(pause);
            Some(pause)
        } else {
            None
        };

        PaceStep { delay, pause }
    }
}

/// Rolling hourly/daily caps on transitions into `applied`/`test`.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    per_hour: Option<usize>,
    per_day: Option<usize>,
    history: VecDeque<DateTime<Utc>>,
}

impl RateLimiter {
    pub fn new(per_hour: Option<usize>, per_day: Option<usize>) -> Self {
        Self {
            per_hour,
            per_day,
            history: VecDeque::new(),
        }
    }

    /// Preloads earlier applications, e.g. from the store.
    pub fn with_history(mut self, mut dates: Vec<DateTime<Utc>>) -> Self {
        dates.sort();
        self.history.extend(dates);
        self
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let day_ago = now - chrono::Duration::days(1);
        while self.history.front().is_some_and(|ts| *ts < day_ago) {
            self.history.pop_front();
        }
    }

    /// `Err(window)` when one more application would exceed a cap.
    pub fn check(&mut self, now: DateTime<Utc>) -> Result<(), CapWindow> {
        self.prune(now);

        if let Some(cap) = self.per_day {
            if self.history.len() >= cap {
                return Err(CapWindow::Daily);
            }
        }

        if let Some(cap) = self.per_hour {
            let hour_ago = now - chrono::Duration::hours(1);
            let last_hour = self.history.iter().filter(|ts| **ts >= hour_ago).count();
            if last_hour >= cap {
                return Err(CapWindow::Hourly);
            }
        }

        Ok(())
    }

    pub fn record(&mut self, at: DateTime<Utc>) {
        self.history.push_back(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn pacer(settings: PaceSettings, seed: u64) -> Pacer {
        Pacer::new(settings, RandomDelay::with_seed(Box::new(NoSleep), seed))
    }

    #[test]
    fn test_total_posting_delay_is_bounded() {
        let settings = PaceSettings {
            delay: DelayRange::new(30.0, 120.0),
            jitter: 0.2,
            pause_after: 0,
            pause_secs: 0,
        };

        for seed in 0..20 {
            let mut pacer = pacer(settings, seed);
            let n = 7;
            let total: Duration = (0..n).map(|_| pacer.after_posting().delay).sum();
            assert!(total >= Duration::from_secs_f64(settings.delay.min) * n, "seed {}", seed);
            assert!(total <= Duration::from_secs_f64(settings.delay.max) * n, "seed {}", seed);
        }
    }

    #[test]
    fn test_pause_every_k_postings() {
        let settings = PaceSettings {
            delay: DelayRange::new(1.0, 2.0),
            jitter: 0.0,
            pause_after: 3,
            pause_secs: 300,
        };
        let mut pacer = pacer(settings, 7);

        let pauses: Vec<bool> = (0..7).map(|_| pacer.after_posting().pause.is_some()).collect();
        assert_eq!(pauses, vec![false, false, true, false, false, true, false]);
    }

    #[test]
    fn test_degenerate_range_returns_min() {
        let mut delay = RandomDelay::with_seed(Box::new(NoSleep), 1);
        assert_eq!(delay.pause(DelayRange::new(2.0, 2.0)), Duration::from_secs(2));
        assert_eq!(delay.jittered(DelayRange::new(0.0, 0.0), 0.5), Duration::ZERO);
    }

    #[test]
    fn test_delay_range_validation() {
        assert!(DelayRange::new(2.0, 5.0).is_valid());
        assert!(DelayRange::new(0.0, 0.0).is_valid());
        assert!(!DelayRange::new(5.0, 2.0).is_valid());
        assert!(!DelayRange::new(-1.0, 2.0).is_valid());
    }

    #[test]
    fn test_rate_limiter_hourly_cap() {
        let now = Utc::now();
        let mut limiter = RateLimiter::new(Some(2), Some(10));

        assert!(limiter.check(now).is_ok());
        limiter.record(now);
        assert!(limiter.check(now).is_ok());
        limiter.record(now);
        assert_eq!(limiter.check(now), Err(CapWindow::Hourly));

        // An hour later the hourly window has rolled over.
        assert!(limiter.check(now + ChronoDuration::minutes(61)).is_ok());
    }

    #[test]
    fn test_rate_limiter_daily_cap_from_history() {
        let now = Utc::now();
        let history = vec![
            now - ChronoDuration::hours(30),
            now - ChronoDuration::hours(20),
            now - ChronoDuration::hours(10),
        ];
        let mut limiter = RateLimiter::new(None, Some(2)).with_history(history);

        assert_eq!(limiter.check(now), Err(CapWindow::Daily));
        assert!(limiter.check(now + ChronoDuration::hours(5)).is_ok());
    }

    #[test]
    fn test_rate_limiter_without_caps_never_blocks() {
        let now = Utc::now();
        let mut limiter = RateLimiter::new(None, None);
        for _ in 0..100 {
            limiter.record(now);
        }
        assert!(limiter.check(now).is_ok());
    }
}
