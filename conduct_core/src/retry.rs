//! Backoff computation and retryable-error classification.
//!
//! The [`RetryManager`] turns a [`RetryPolicy`] plus the outcome of the
//! latest attempt into a delay before the next one. Delays grow
//! exponentially from `base_delay`, receive up to 10% random jitter and are
//! clamped to `max_delay`.
//!
//! Error classification uses the policy's glob patterns. A pattern is
//! matched case-insensitively anywhere in the error message, with `*`
//! matching any run of characters and `?` matching a single character.

use crate::task::RetryPolicy;
use crate::types::TaskType;
use rand::Rng;
use regex::RegexSet;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Maximum fraction of the computed delay added as jitter.
pub const JITTER_FACTOR: f64 = 0.1;

/// Error patterns shared by the built-in per-type policies.
pub const TRANSIENT_ERROR_PATTERNS: &[&str] = &[
    "*timeout*",
    "*timed out*",
    "*rate limit*",
    "*ECONNRESET*",
    "*ETIMEDOUT*",
    "*503*",
    "*502*",
    "*network*",
    "*temporarily unavailable*",
];

/// Outcome of asking whether a failed attempt should be retried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait the given delay, then try again
    Retry(Duration),
    /// Give up; the string explains why
    Stop(String),
}

impl RetryDecision {
    /// Returns true if another attempt should be made.
    pub fn should_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry(_))
    }
}

/// Computes retry delays and classifies errors.
///
/// Holds optional per-task-type policy overrides; anything without an
/// override falls back to [`default_policy_for`].
#[derive(Clone, Debug)]
pub struct RetryManager {
    jitter: bool,
    overrides: HashMap<String, RetryPolicy>,
    /// Compiled pattern sets keyed by the policy's pattern list
    compiled: Arc<RwLock<HashMap<Vec<String>, Arc<ErrorPatterns>>>>,
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryManager {
    /// Creates a manager with jitter enabled.
    pub fn new() -> Self {
        Self {
            jitter: true,
            overrides: HashMap::new(),
            compiled: Arc::default(),
        }
    }

    /// Creates a manager that returns exact, jitter-free delays.
    pub fn without_jitter() -> Self {
        Self {
            jitter: false,
            overrides: HashMap::new(),
            compiled: Arc::default(),
        }
    }

    /// Overrides the default policy for one task type.
    pub fn with_policy(mut self, task_type: &TaskType, policy: RetryPolicy) -> Self {
        self.overrides.insert(task_type.name().to_string(), policy);
        self
    }

    /// Returns the policy used for tasks of the given type.
    pub fn policy_for(&self, task_type: &TaskType) -> RetryPolicy {
        self.overrides
            .get(task_type.name())
            .cloned()
            .unwrap_or_else(|| default_policy_for(task_type))
    }

    /// Computes the delay to await before attempt `attempt + 1`.
    ///
    /// # Arguments
    ///
    /// * `attempt` - 1-based number of the attempt that just failed
    /// * `policy` - Policy governing the task
    /// * `last_error` - Error message of the failed attempt, if any
    ///
    /// # Returns
    ///
    /// The jittered backoff delay, never above `policy.max_delay`. When the
    /// policy lists retryable patterns and `last_error` matches none of
    /// them, `policy.max_delay` is returned as a stop signal; prefer
    /// [`next_retry`](Self::next_retry), which makes that explicit.
    pub fn calculate_delay(&self, attempt: u32, policy: &RetryPolicy, last_error: Option<&str>) -> Duration {
        if let Some(error) = last_error {
            if !self.patterns_for(policy).matches(error) {
                return policy.max_delay;
            }
        }
        self.backoff(attempt, policy)
    }

    fn backoff(&self, attempt: u32, policy: &RetryPolicy) -> Duration {
        let delay = backoff_delay(attempt, policy);
        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let jitter = delay.mul_f64(rand::thread_rng().gen::<f64>() * JITTER_FACTOR);
        delay
            .checked_add(jitter)
            .map_or(policy.max_delay, |d| d.min(policy.max_delay))
    }

    /// Decides whether attempt `attempt + 1` should happen.
    ///
    /// Stops when the attempt budget is spent or the error does not match
    /// the policy's retryable patterns.
    pub fn next_retry(&self, attempt: u32, policy: &RetryPolicy, error: &str) -> RetryDecision {
        if attempt >= policy.max_attempts {
            return RetryDecision::Stop(format!(
                "retry budget exhausted after {} attempt(s)",
                attempt
            ));
        }
        if !self.patterns_for(policy).matches(error) {
            return RetryDecision::Stop(format!("error is not retryable: {}", error));
        }
        RetryDecision::Retry(self.backoff(attempt, policy))
    }

    /// Compiled patterns for `policy`, built on first use.
    pub fn patterns_for(&self, policy: &RetryPolicy) -> Arc<ErrorPatterns> {
        if let Some(patterns) = self
            .compiled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&policy.retryable_errors)
        {
            return patterns.clone();
        }
        self.compiled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(policy.retryable_errors.clone())
            .or_insert_with(|| Arc::new(ErrorPatterns::compile(&policy.retryable_errors)))
            .clone()
    }

    /// Number of distinct pattern lists compiled so far.
    pub fn compiled_pattern_sets(&self) -> usize {
        self.compiled.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// A policy's retryable error globs compiled into one [`RegexSet`].
#[derive(Clone, Debug)]
pub struct ErrorPatterns {
    /// `None` accepts every error
    set: Option<RegexSet>,
}

impl ErrorPatterns {
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Self {
        if patterns.is_empty() {
            return Self { set: None };
        }
        let set = RegexSet::new(patterns.iter().map(|p| glob_to_regex(p.as_ref())))
            .unwrap_or_else(|_| RegexSet::empty());
        Self { set: Some(set) }
    }

    pub fn matches(&self, error: &str) -> bool {
        self.set.as_ref().map_or(true, |set| set.is_match(error))
    }
}

/// Un-jittered exponential delay for the given failed attempt.
///
/// `base_delay * backoff_multiplier^(attempt-1)`, clamped to `max_delay`.
/// Attempt numbers below 1 are treated as 1.
pub fn backoff_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let max = policy.max_delay.as_secs_f64();
    let mut secs = policy.base_delay.as_secs_f64();
    if policy.backoff_multiplier > 1.0 {
        for _ in 1..attempt.max(1) {
            if secs == 0.0 || secs >= max {
                break;
            }
            secs *= policy.backoff_multiplier;
        }
    }
    if !secs.is_finite() || secs >= max {
        policy.max_delay
    } else {
        Duration::from_secs_f64(secs)
    }
}

/// Returns true if `error` may be retried under `policy`.
///
/// An empty pattern list accepts every error.
///
/// Compiles the patterns on every call; [`RetryManager`] caches them.
pub fn is_retryable_error(policy: &RetryPolicy, error: &str) -> bool {
    ErrorPatterns::compile(&policy.retryable_errors).matches(error)
}

/// Matches a glob pattern anywhere in `text`, ignoring case.
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    ErrorPatterns::compile(&[pattern]).matches(text)
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("(?i)");
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    out
}

/// Built-in policy for a task type, tuned to its expected latency and cost.
pub fn default_policy_for(task_type: &TaskType) -> RetryPolicy {
    let (attempts, base, max) = match task_type {
        TaskType::IssueAnalysis => (3, 1, 10),
        TaskType::CodeResolution => (2, 5, 30),
        TaskType::CodeReview => (3, 2, 15),
        TaskType::ArtifactGeneration => (3, 1, 10),
        TaskType::PrCreation => (5, 1, 30),
        TaskType::Custom(_) => (3, 1, 10),
    };
    RetryPolicy::new(attempts, Duration::from_secs(base), Duration::from_secs(max), 2.0)
        .with_retryable_errors(TRANSIENT_ERROR_PATTERNS.iter().copied())
}
