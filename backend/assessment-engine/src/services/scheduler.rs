//! Single-flight scheduler that gates calls to the generation service on the
//! token budget reported by the provider.

use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SchedulerSettings;
use crate::metrics::{SCHEDULED_TASKS_TOTAL, SCHEDULER_BUDGET_WAITS_TOTAL, SCHEDULER_WAIT_SECONDS};

const HEADER_PREFIX: &str = "x-ratelimit-";

/// Last quota reported by a provider. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    pub remaining: i64,
    /// Epoch milliseconds.
    pub reset_at_ms: i64,
}

/// Runs one task at a time across every provider, in submission order.
///
/// Budgets are only ever replaced from response metadata through
/// [`RateLimitScheduler::sync_headers`]; nothing is decremented locally.
pub struct RateLimitScheduler {
    settings: SchedulerSettings,
    budgets: Mutex<HashMap<String, TokenBudget>>,
    // tokio's mutex queues waiters fairly, which gives FIFO admission
    admission: tokio::sync::Mutex<()>,
}

impl RateLimitScheduler {
    pub fn new(settings: SchedulerSettings) -> Self {
        Self {
            settings,
            budgets: Mutex::new(HashMap::new()),
            admission: tokio::sync::Mutex::new(()),
        }
    }

    /// Waits for the admission slot and, if `provider` is out of budget, for
    /// its reset time; then runs `task` and hands back whatever it returned.
    pub async fn schedule<F, Fut, T>(&self, provider: &str, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _slot = self.admission.lock().await;
        SCHEDULED_TASKS_TOTAL.with_label_values(&[provider]).inc();

        if let Some(wait) = self.pending_wait(provider) {
            warn!(
                provider,
                wait_ms = wait.as_millis() as u64,
                "Token budget exhausted, waiting for reset"
            );
            SCHEDULER_BUDGET_WAITS_TOTAL.with_label_values(&[provider]).inc();
            SCHEDULER_WAIT_SECONDS.observe(wait.as_secs_f64());
            tokio::time::sleep(wait).await;
            debug!(provider, "Token budget wait finished");
        }

        task().await
    }

    /// Updates the budget for `provider` from header-like metadata.
    ///
    /// Keys are matched case-insensitively with or without the
    /// `x-ratelimit-` prefix. A missing or non-numeric remaining value, or a
    /// non-numeric reset value, leaves the stored budget untouched.
    pub fn sync_headers<I, K, V>(&self, metadata: I, provider: &str)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut remaining_raw: Option<(u8, String)> = None;
        let mut reset_raw: Option<(u8, String)> = None;

        for (key, value) in metadata {
            let key = key.as_ref().trim().to_ascii_lowercase();
            let name = key.strip_prefix(HEADER_PREFIX).unwrap_or(&key);
            let value = value.as_ref().trim().to_string();

            // Lower rank wins when several variants are present.
            match name {
                "remaining" => keep_best(&mut remaining_raw, 0, value),
                "remaining-tokens" => keep_best(&mut remaining_raw, 1, value),
                "remaining-tokens-minute" => keep_best(&mut remaining_raw, 2, value),
                "reset" => keep_best(&mut reset_raw, 0, value),
                "reset-tokens" => keep_best(&mut reset_raw, 1, value),
                "reset-tokens-minute" => keep_best(&mut reset_raw, 2, value),
                _ => {}
            }
        }

        let Some((_, remaining_raw)) = remaining_raw else {
            return;
        };
        let Some(remaining) = parse_integer(&remaining_raw) else {
            debug!(provider, value = %remaining_raw, "Ignoring non-numeric remaining header");
            return;
        };

        let reset = match reset_raw {
            Some((_, raw)) => match parse_reset(&raw) {
                Some(value) => value,
                None => {
                    debug!(provider, value = %raw, "Ignoring non-numeric reset header");
                    return;
                }
            },
            None => self.settings.default_reset_secs as f64,
        };

        let now = now_ms();
        let reset_at_ms = if reset < self.settings.reset_threshold as f64 {
            now + (reset * 1000.0).round() as i64
        } else {
            reset.round() as i64
        };

        let budget = TokenBudget {
            remaining,
            reset_at_ms,
        };

        if let Ok(mut budgets) = self.budgets.lock() {
            budgets.insert(provider.to_string(), budget);
        }

        info!(
            provider,
            remaining,
            reset_in_ms = reset_at_ms - now,
            "Synced token budget"
        );
    }

    /// Snapshot of the stored budget for `provider`.
    pub fn budget(&self, provider: &str) -> Option<TokenBudget> {
        self.budgets
            .lock()
            .ok()
            .and_then(|budgets| budgets.get(provider).copied())
    }

    fn pending_wait(&self, provider: &str) -> Option<Duration> {
        let budget = self.budget(provider)?;
        if budget.remaining > 0 {
            return None;
        }

        let wait_ms = budget.reset_at_ms - now_ms();
        (wait_ms > 0).then(|| Duration::from_millis(wait_ms as u64))
    }
}

fn keep_best(slot: &mut Option<(u8, String)>, rank: u8, value: String) {
    match slot {
        Some((existing, _)) if *existing <= rank => {}
        _ => *slot = Some((rank, value)),
    }
}

fn parse_integer(raw: &str) -> Option<i64> {
    raw.parse::<i64>().ok().or_else(|| {
        raw.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(|v| v.trunc() as i64)
    })
}

fn parse_reset(raw: &str) -> Option<f64> {
    let trimmed = raw.strip_suffix('s').unwrap_or(raw);
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> RateLimitScheduler {
        RateLimitScheduler::new(SchedulerSettings::default())
    }

    #[test]
    fn relative_reset_is_seconds_from_now() {
        let scheduler = scheduler();
        scheduler.sync_headers(
            [("x-ratelimit-remaining", "100"), ("x-ratelimit-reset", "60")],
            "cerebras",
        );

        let budget = scheduler.budget("cerebras").unwrap();
        assert_eq!(budget.remaining, 100);
        assert!((budget.reset_at_ms - (now_ms() + 60_000)).abs() < 1_000);
    }

    #[test]
    fn large_reset_is_absolute_timestamp() {
        let scheduler = scheduler();
        let future = now_ms() + 3_600_000;
        let reset = future.to_string();
        scheduler.sync_headers(
            [("X-RateLimit-Remaining", "50"), ("X-RateLimit-Reset", reset.as_str())],
            "cerebras",
        );

        let budget = scheduler.budget("cerebras").unwrap();
        assert_eq!(budget.remaining, 50);
        assert_eq!(budget.reset_at_ms, future);
    }

    #[test]
    fn missing_reset_defaults_to_sixty_seconds() {
        let scheduler = scheduler();
        scheduler.sync_headers([("remaining", "75")], "mimo");

        let budget = scheduler.budget("mimo").unwrap();
        assert_eq!(budget.remaining, 75);
        assert!((budget.reset_at_ms - (now_ms() + 60_000)).abs() < 1_000);
    }

    #[test]
    fn malformed_values_are_ignored() {
        let scheduler = scheduler();
        scheduler.sync_headers(
            [("x-ratelimit-remaining", "abc"), ("x-ratelimit-reset", "60")],
            "cerebras",
        );
        assert!(scheduler.budget("cerebras").is_none());

        scheduler.sync_headers(
            [("x-ratelimit-remaining", "100"), ("x-ratelimit-reset", "invalid")],
            "cerebras",
        );
        assert!(scheduler.budget("cerebras").is_none());

        scheduler.sync_headers([("content-type", "application/json")], "cerebras");
        assert!(scheduler.budget("cerebras").is_none());
    }

    #[test]
    fn token_variant_headers_are_recognised() {
        let scheduler = scheduler();
        scheduler.sync_headers(
            [
                ("x-ratelimit-remaining-tokens", "200"),
                ("x-ratelimit-reset-tokens", "120"),
            ],
            "cerebras",
        );

        let budget = scheduler.budget("cerebras").unwrap();
        assert_eq!(budget.remaining, 200);
        assert!((budget.reset_at_ms - (now_ms() + 120_000)).abs() < 1_000);
    }

    #[test]
    fn plain_variant_wins_over_minute_variant() {
        let scheduler = scheduler();
        scheduler.sync_headers(
            [
                ("x-ratelimit-remaining-tokens-minute", "9"),
                ("x-ratelimit-remaining", "3"),
            ],
            "cerebras",
        );
        assert_eq!(scheduler.budget("cerebras").unwrap().remaining, 3);
    }

    #[tokio::test]
    async fn unknown_provider_runs_immediately() {
        let scheduler = scheduler();
        let value = scheduler.schedule("nobody", || async { 41 + 1 }).await;
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn task_errors_pass_through_untouched() {
        let scheduler = scheduler();
        let result: Result<(), String> = scheduler
            .schedule("cerebras", || async { Err("boom".to_string()) })
            .await;
        assert_eq!(result, Err("boom".to_string()));
    }
}
