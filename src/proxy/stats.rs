use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// EMA smoothing factor for `avg_response_time_ms`.
const RESPONSE_TIME_ALPHA: f64 = 0.3;
/// Response time at which the speed component of the score reaches zero.
const SLOW_RESPONSE_MS: f64 = 10_000.0;
/// Weight of lifetime success rate in the health score.
const SUCCESS_WEIGHT: f64 = 0.8;
/// Weight of responsiveness in the health score.
const SPEED_WEIGHT: f64 = 0.2;
/// Score penalty per consecutive failure.
const CONSECUTIVE_PENALTY: f64 = 0.1;

/// Rolling statistics for one proxy.
///
/// Invariant: `total_requests == success + failures`. Only
/// [`record_success`](Self::record_success) and
/// [`record_failure`](Self::record_failure) mutate the counters, and both
/// bump `total_requests` in the same step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyStats {
    pub total_requests: u64,
    pub success: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    /// Exponential moving average over successful attempts.
    pub avg_response_time_ms: f64,
    /// Derived reliability estimate in `[0.0, 1.0]`.
    pub health_score: f64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl Default for ProxyStats {
    fn default() -> Self {
        let mut stats = Self {
            total_requests: 0,
            success: 0,
            failures: 0,
            consecutive_failures: 0,
            avg_response_time_ms: 0.0,
            health_score: 0.0,
            last_used_at: None,
            last_success_at: None,
            last_failure_at: None,
        };
        stats.health_score = stats.compute_health_score();
        stats
    }
}

impl ProxyStats {
    /// Lifetime success ratio. An untried proxy is assumed reliable.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.success as f64 / self.total_requests as f64
        }
    }

    pub fn record_success(&mut self, elapsed_ms: f64, now: DateTime<Utc>) {
        let elapsed_ms = elapsed_ms.max(0.0);
        self.avg_response_time_ms = if self.success == 0 {
            elapsed_ms
        } else {
            RESPONSE_TIME_ALPHA * elapsed_ms + (1.0 - RESPONSE_TIME_ALPHA) * self.avg_response_time_ms
        };

        self.success = self.success.saturating_add(1);
        self.total_requests = self.total_requests.saturating_add(1);
        self.consecutive_failures = 0;
        self.last_used_at = Some(now);
        self.last_success_at = Some(now);
        self.health_score = self.compute_health_score();
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.failures = self.failures.saturating_add(1);
        self.total_requests = self.total_requests.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_used_at = Some(now);
        self.last_failure_at = Some(now);
        self.health_score = self.compute_health_score();
    }

    /// `clamp(success_rate*0.8 + speed*0.2 - consecutive_failures*0.1, 0, 1)`
    ///
    /// `speed` is 1.0 for an instant proxy (or one with no timing yet) and
    /// falls linearly to 0.0 at ten seconds. The consecutive-failure term
    /// demotes a proxy after a burst of failures faster than its lifetime
    /// history can hold it up, while a single failure costs only 0.1.
    pub fn compute_health_score(&self) -> f64 {
        let speed = if self.success == 0 {
            1.0
        } else {
            1.0 - (self.avg_response_time_ms / SLOW_RESPONSE_MS).min(1.0)
        };
        let raw = self.success_rate() * SUCCESS_WEIGHT + speed * SPEED_WEIGHT
            - f64::from(self.consecutive_failures) * CONSECUTIVE_PENALTY;
        raw.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_untried_proxy_is_fully_healthy() {
        let stats = ProxyStats::default();
        assert_eq!(stats.health_score, 1.0);
        assert_eq!(stats.total_requests, 0);
    }

    #[test]
    fn test_first_success_seeds_average() {
        let mut stats = ProxyStats::default();
        stats.record_success(400.0, Utc::now());
        assert_eq!(stats.avg_response_time_ms, 400.0);

        stats.record_success(1400.0, Utc::now());
        // 0.3 * 1400 + 0.7 * 400
        assert!((stats.avg_response_time_ms - 700.0).abs() < 1e-9);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let mut stats = ProxyStats::default();
        stats.record_failure(Utc::now());
        stats.record_failure(Utc::now());
        assert_eq!(stats.consecutive_failures, 2);

        stats.record_success(100.0, Utc::now());
        assert_eq!(stats.consecutive_failures, 0);
        assert!(stats.last_success_at.is_some());
        assert!(stats.last_failure_at.is_some());
    }

    #[test]
    fn test_failure_burst_demotes_reliable_proxy() {
        let mut stats = ProxyStats::default();
        for _ in 0..50 {
            stats.record_success(200.0, Utc::now());
        }
        let before = stats.health_score;
        for _ in 0..3 {
            stats.record_failure(Utc::now());
        }
        assert!(before - stats.health_score > 0.3);
    }

    #[test]
    fn test_stats_roundtrip_json_tolerates_missing_fields() {
        let stats: ProxyStats = serde_json::from_str(r#"{"success": 3, "total_requests": 3}"#).unwrap();
        assert_eq!(stats.success, 3);
        assert_eq!(stats.failures, 0);
    }

    proptest! {
        #[test]
        fn prop_total_equals_success_plus_failures(outcomes in proptest::collection::vec(any::<Option<u16>>(), 0..200)) {
            let mut stats = ProxyStats::default();
            for outcome in outcomes {
                match outcome {
                    Some(ms) => stats.record_success(f64::from(ms), Utc::now()),
                    None => stats.record_failure(Utc::now()),
                }
                prop_assert_eq!(stats.total_requests, stats.success + stats.failures);
                prop_assert!((0.0..=1.0).contains(&stats.health_score));
            }
        }

        #[test]
        fn prop_score_decreases_with_consecutive_failures(
            success in 0u64..1000,
            failures in 0u64..1000,
            avg in 0.0f64..20_000.0,
            streak in 0u32..20,
        ) {
            let base = ProxyStats {
                total_requests: success + failures,
                success,
                failures,
                avg_response_time_ms: avg,
                consecutive_failures: streak,
                ..ProxyStats::default()
            };
            let worse = ProxyStats { consecutive_failures: streak + 1, ..base.clone() };
            prop_assert!(worse.compute_health_score() <= base.compute_health_score());
        }
    }
}
