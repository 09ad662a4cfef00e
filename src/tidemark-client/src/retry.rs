use rand::Rng;
use std::time::Duration;

use tidemark_core::ClientConfig;

/// Bounds for the retry loop wrapped around every request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempt-count floor: keep trying at least this many times even when
    /// the wall-clock budget has already elapsed.
    pub min_retries: u32,
    /// Wall-clock ceiling: keep trying past the attempt floor while total
    /// elapsed time stays under this.
    pub max_delay: Duration,
    /// Statuses worth re-attempting.
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_retries: 8,
            max_delay: Duration::from_millis(120_000),
            retryable_statuses: vec![502, 503, 504],
        }
    }
}

const BACKOFF_FLOOR_MS: u64 = 125;
const BACKOFF_STEP_MS: u64 = 250;
const BACKOFF_CAP_TIER: u32 = 5;

/// What the controller does after observing one attempt's status.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum NextStep {
    /// Hand the response back for status interpretation.
    Done,
    /// Sleep, then re-attempt.
    Sleep(Duration),
    /// Retry needed but the payload cannot be resent.
    Veto,
    /// Budget exhausted with the last status still retryable.
    GiveUp,
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            min_retries: config.min_retries,
            max_delay: Duration::from_millis(config.max_delay_ms),
            ..Self::default()
        }
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    /// Loop condition: attempt floor OR time ceiling still open.
    pub fn should_continue(&self, attempts: u32, elapsed: Duration) -> bool {
        attempts < self.min_retries || elapsed < self.max_delay
    }

    /// Jittered exponential delay before re-attempt number `attempt`
    /// (0-based). Flat floor at 0, `floor + 2^i * step` through the cap tier,
    /// then flat at the ceiling; plus a random offset bounded by half the
    /// base. Deterministic under a seeded rng.
    pub fn backoff_delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let base_ms = match attempt {
            0 => BACKOFF_FLOOR_MS,
            i => {
                let tier = i.min(BACKOFF_CAP_TIER);
                BACKOFF_FLOOR_MS + (1u64 << tier) * BACKOFF_STEP_MS
            }
        };
        let jitter = rng.gen_range(0..=base_ms / 2);
        Duration::from_millis(base_ms + jitter)
    }

    /// Pure decision function for one observed response, kept free of I/O so
    /// the loop logic is testable without a network.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn next_step(
        &self,
        attempts: u32,
        elapsed: Duration,
        status: u16,
        retry_after: Option<Duration>,
        permit_retry: bool,
        resendable: bool,
        rng: &mut impl Rng,
    ) -> NextStep {
        if !self.is_retryable_status(status) {
            return NextStep::Done;
        }
        // Inside a transaction the server may already hold a non-idempotent
        // side effect; the failure goes straight back to the caller.
        if !permit_retry {
            return NextStep::Done;
        }
        if !resendable {
            return NextStep::Veto;
        }
        if !self.should_continue(attempts, elapsed) {
            return NextStep::GiveUp;
        }
        let computed = self.backoff_delay(attempts - 1, rng);
        NextStep::Sleep(retry_after.map_or(computed, |ra| ra.max(computed)))
    }
}

/// `Retry-After` header, either form: delta seconds or an HTTP date. A date
/// already in the past yields a zero delay rather than being dropped.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.signed_duration_since(chrono::Utc::now());
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_backoff_schedule_shape() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);

        let mut bases = Vec::new();
        for attempt in 0..8 {
            // Strip jitter by comparing against the per-tier bounds.
            let delay = policy.backoff_delay(attempt, &mut rng).as_millis() as u64;
            let base = match attempt {
                0 => 125,
                i => 125 + (1u64 << i.min(5)) * 250,
            };
            assert!(delay >= base, "attempt {attempt}: {delay} < {base}");
            assert!(delay <= base + base / 2, "attempt {attempt}: {delay} jitter over bound");
            bases.push(base);
        }
        // Monotonically increasing floor until the cap tier, then flat.
        assert!(bases.windows(2).take(5).all(|w| w[0] < w[1]));
        assert_eq!(bases[6], bases[5]);
        assert_eq!(bases[7], bases[5]);
    }

    #[test]
    fn test_backoff_deterministic_under_seed() {
        let policy = RetryPolicy::default();
        let schedule_a: Vec<_> = {
            let mut rng = StdRng::seed_from_u64(42);
            (0..6).map(|i| policy.backoff_delay(i, &mut rng)).collect()
        };
        let schedule_b: Vec<_> = {
            let mut rng = StdRng::seed_from_u64(42);
            (0..6).map(|i| policy.backoff_delay(i, &mut rng)).collect()
        };
        assert_eq!(schedule_a, schedule_b);
    }

    #[test]
    fn test_terminal_status_is_done() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(0);
        let step = policy.next_step(1, Duration::ZERO, 200, None, true, true, &mut rng);
        assert_eq!(step, NextStep::Done);
        let step = policy.next_step(1, Duration::ZERO, 404, None, true, true, &mut rng);
        assert_eq!(step, NextStep::Done);
    }

    #[test]
    fn test_transaction_scoped_never_retries() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(0);
        for status in [502, 503, 504] {
            let step = policy.next_step(1, Duration::ZERO, status, None, false, true, &mut rng);
            assert_eq!(step, NextStep::Done, "status {status}");
        }
    }

    #[test]
    fn test_nonresendable_vetoed_before_resend() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(0);
        let step = policy.next_step(1, Duration::ZERO, 503, None, true, false, &mut rng);
        assert_eq!(step, NextStep::Veto);
    }

    #[test]
    fn test_budget_exhaustion() {
        let policy = RetryPolicy {
            min_retries: 2,
            max_delay: Duration::from_millis(50),
            ..RetryPolicy::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        // Attempt floor not reached: keep going even past the time ceiling.
        let step = policy.next_step(1, Duration::from_secs(1), 503, None, true, true, &mut rng);
        assert!(matches!(step, NextStep::Sleep(_)));
        // Both budgets spent.
        let step = policy.next_step(2, Duration::from_secs(1), 503, None, true, true, &mut rng);
        assert_eq!(step, NextStep::GiveUp);
    }

    #[test]
    fn test_retry_after_overrides_shorter_backoff() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(0);
        let step = policy.next_step(
            1,
            Duration::ZERO,
            503,
            Some(Duration::from_secs(30)),
            true,
            true,
            &mut rng,
        );
        match step {
            NextStep::Sleep(d) => assert_eq!(d, Duration::from_secs(30)),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn test_retry_after_both_forms() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "17".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(17)));

        let soon = chrono::Utc::now() + chrono::Duration::seconds(30);
        headers.insert(
            reqwest::header::RETRY_AFTER,
            soon.to_rfc2822().parse().unwrap(),
        );
        let delay = parse_retry_after(&headers).expect("date form parses");
        assert!(delay <= Duration::from_secs(30));
        assert!(delay >= Duration::from_secs(28), "delay {delay:?} too short");

        let past = chrono::Utc::now() - chrono::Duration::seconds(30);
        headers.insert(
            reqwest::header::RETRY_AFTER,
            past.to_rfc2822().parse().unwrap(),
        );
        assert_eq!(parse_retry_after(&headers), Some(Duration::ZERO));

        headers.insert(reqwest::header::RETRY_AFTER, "soonish".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_total_sleep_matches_seeded_schedule() {
        // k retryable responses then success: the slept total is exactly the
        // schedule the same seed yields.
        let policy = RetryPolicy::default();
        let k = 4u32;

        let expected: Duration = {
            let mut rng = StdRng::seed_from_u64(99);
            (0..k).map(|i| policy.backoff_delay(i, &mut rng)).sum()
        };

        let mut rng = StdRng::seed_from_u64(99);
        let mut slept = Duration::ZERO;
        for attempts in 1..=k {
            match policy.next_step(attempts, Duration::ZERO, 503, None, true, true, &mut rng) {
                NextStep::Sleep(d) => slept += d,
                other => panic!("unexpected step: {other:?}"),
            }
        }
        assert_eq!(slept, expected);
        assert_eq!(
            policy.next_step(k + 1, Duration::ZERO, 200, None, true, true, &mut rng),
            NextStep::Done
        );
    }
}
