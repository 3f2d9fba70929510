//! # Fallback decision engine.
//!
//! Pure functions that turn a failed attempt into the next
//! (player client, format strategy) combination to try:
//! - [`classify`] maps raw tool diagnostics to an [`ErrorClassification`];
//! - [`next_state`] advances a [`FallbackState`] or reports exhaustion;
//! - [`RetryPolicy::delay`] spaces out retries after rate limiting.
//!
//! Nothing in here knows about jobs, processes or the queue.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::downloader::catalog::{self, FormatStrategy};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    AuthRequired,
    ClientBlocked,
    FormatUnavailable,
    RateLimited,
    ProcessUnavailable,
    Unknown,
}

impl ErrorClassification {
    pub fn as_tag(&self) -> &'static str {
        match self {
            ErrorClassification::AuthRequired => "auth_required",
            ErrorClassification::ClientBlocked => "client_blocked",
            ErrorClassification::FormatUnavailable => "format_unavailable",
            ErrorClassification::RateLimited => "rate_limited",
            ErrorClassification::ProcessUnavailable => "process_unavailable",
            ErrorClassification::Unknown => "unknown",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_lowercase().replace('-', "_").as_str() {
            "auth_required" | "login_required" => Some(ErrorClassification::AuthRequired),
            "client_blocked" => Some(ErrorClassification::ClientBlocked),
            "format_unavailable" => Some(ErrorClassification::FormatUnavailable),
            "rate_limited" => Some(ErrorClassification::RateLimited),
            "process_unavailable" | "binary_not_found" => {
                Some(ErrorClassification::ProcessUnavailable)
            }
            "unknown" => Some(ErrorClassification::Unknown),
            _ => None,
        }
    }

    /// Retrying cannot help: the user or the environment has to change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ErrorClassification::AuthRequired | ErrorClassification::ProcessUnavailable
        )
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Position of a job in the (client, strategy) search space.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FallbackState {
    pub player_client_index: usize,
    pub format_strategy_index: usize,
    pub fallback_attempts: u32,
    pub max_fallback_attempts: u32,
}

impl Default for FallbackState {
    fn default() -> Self {
        Self {
            player_client_index: 0,
            format_strategy_index: 0,
            fallback_attempts: 0,
            max_fallback_attempts: catalog::default_max_attempts(),
        }
    }
}

impl FallbackState {
    /// Builds a state with indices clamped into the catalog and attempts
    /// clamped into the budget.
    pub fn new(client: usize, format: usize, attempts: u32, max: u32) -> Self {
        Self {
            player_client_index: client.min(catalog::player_client_count() - 1),
            format_strategy_index: format.min(catalog::format_strategy_count() - 1),
            fallback_attempts: attempts.min(max),
            max_fallback_attempts: max,
        }
    }

    pub fn player_client(&self) -> &'static str {
        catalog::player_client(self.player_client_index)
    }

    pub fn format_strategy(&self) -> FormatStrategy {
        catalog::format_strategy(self.format_strategy_index)
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_fallback_attempts
            .saturating_sub(self.fallback_attempts)
    }
}

impl fmt::Display for FallbackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "client={} ({}), strategy={} ({}), attempts={}/{}",
            self.player_client_index,
            self.player_client(),
            self.format_strategy_index,
            self.format_strategy().name(),
            self.fallback_attempts,
            self.max_fallback_attempts
        )
    }
}

const PROCESS_UNAVAILABLE_PATTERNS: &[&str] = &[
    "binary is not available",
    "binary not found",
    "failed to spawn",
    "failed to start",
    "command not found",
    "executable not found",
];

const AUTH_PATTERNS: &[&str] = &[
    "sign in",
    "sign-in",
    "signin",
    "login",
    "log in",
    "age-restricted",
    "age restricted",
    "age-restriction",
    "age restriction",
    "confirm your age",
];

const CLIENT_BLOCKED_PATTERNS: &[&str] = &[
    "signature",
    "n challenge",
    "nsig",
    "sabr",
    "http error 403",
    "403: forbidden",
    "403 forbidden",
];

const FORMAT_PATTERNS: &[&str] = &[
    "format not available",
    "format is not available",
    "requested format",
    "no video formats",
    "no formats found",
    "merge formats",
    "ffmpeg is not installed",
    "only images are available",
];

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "http error 429",
    "status 429",
    "too many requests",
    "rate limit",
    "rate-limit",
];

fn contains_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|pattern| haystack.contains(pattern))
}

/// Classifies a failure from its diagnostic text and optional tag.
///
/// Rules are evaluated in order and the first match wins; matching is
/// case-insensitive. A process-unavailable signal is checked before
/// everything else.
pub fn classify(message: &str, error_type: Option<&str>) -> ErrorClassification {
    let text = message.to_lowercase();
    let tag = error_type.and_then(ErrorClassification::from_tag);

    if tag == Some(ErrorClassification::ProcessUnavailable)
        || contains_any(&text, PROCESS_UNAVAILABLE_PATTERNS)
    {
        return ErrorClassification::ProcessUnavailable;
    }

    if tag == Some(ErrorClassification::AuthRequired) || contains_any(&text, AUTH_PATTERNS) {
        return ErrorClassification::AuthRequired;
    }

    if contains_any(&text, CLIENT_BLOCKED_PATTERNS) {
        return ErrorClassification::ClientBlocked;
    }

    if contains_any(&text, FORMAT_PATTERNS) {
        return ErrorClassification::FormatUnavailable;
    }

    if tag == Some(ErrorClassification::RateLimited) || contains_any(&text, RATE_LIMIT_PATTERNS) {
        return ErrorClassification::RateLimited;
    }

    if text.contains("http error") {
        return ErrorClassification::ClientBlocked;
    }

    match tag {
        Some(ErrorClassification::ClientBlocked) => ErrorClassification::ClientBlocked,
        Some(ErrorClassification::FormatUnavailable) => ErrorClassification::FormatUnavailable,
        _ => ErrorClassification::Unknown,
    }
}

pub fn should_auto_fallback(message: &str, error_type: Option<&str>) -> bool {
    !classify(message, error_type).is_terminal()
}

/// Computes the next combination to try, or `None` when the search is
/// exhausted or cannot help.
pub fn next_state(
    current: &FallbackState,
    classification: ErrorClassification,
) -> Option<FallbackState> {
    if classification.is_terminal() {
        return None;
    }

    let attempts = current.fallback_attempts.saturating_add(1);
    if attempts >= current.max_fallback_attempts {
        return None;
    }

    let clients = catalog::player_client_count();
    let formats = catalog::format_strategy_count();
    let mut client = current.player_client_index.min(clients - 1);
    let mut format = current.format_strategy_index.min(formats - 1);

    match classification {
        ErrorClassification::RateLimited => {}
        ErrorClassification::ClientBlocked => {
            let current_format = format;
            client += 1;
            format = 0;
            if client >= clients {
                client = 0;
                format = current_format + 1;
                if format >= formats {
                    return None;
                }
            }
        }
        ErrorClassification::FormatUnavailable | ErrorClassification::Unknown => {
            format += 1;
            if format >= formats {
                format = 0;
                client += 1;
                if client >= clients {
                    return None;
                }
            }
        }
        ErrorClassification::AuthRequired | ErrorClassification::ProcessUnavailable => {
            return None
        }
    }

    Some(FallbackState {
        player_client_index: client,
        format_strategy_index: format,
        fallback_attempts: attempts,
        max_fallback_attempts: current.max_fallback_attempts,
    })
}

/// Delay policy applied before respawning after a rate-limited attempt.
///
/// The delay for attempt `n` is `base × factor^(n-1)`, clamped to `cap`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    /// Base 2s, doubling, capped at 60s.
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(60),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Always strictly positive and non-decreasing in `attempts`.
    pub fn delay(&self, attempts: u32) -> Duration {
        let floor = Duration::from_millis(1);
        let base = self.base.max(floor);
        let cap = self.cap.max(base);
        let factor = if self.factor.is_finite() { self.factor.max(1.0) } else { 1.0 };

        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = base.as_secs_f64() * factor.powi(exponent);
        if !secs.is_finite() || secs > cap.as_secs_f64() {
            cap
        } else {
            Duration::from_secs_f64(secs).max(base)
        }
    }
}

/// Delay before respawning after `attempts` rate-limited attempts, using
/// the default policy.
pub fn retry_delay(attempts: u32) -> Duration {
    RetryPolicy::default().delay(attempts)
}

/// Everything the queue needs to act on a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackDecision {
    pub classification: ErrorClassification,
    pub next: Option<FallbackState>,
    /// Set only when the next attempt must wait (rate limiting).
    pub delay: Option<Duration>,
}

impl FallbackDecision {
    /// A manual retry might still succeed.
    pub fn retryable(&self) -> bool {
        !self.classification.is_terminal()
    }
}

pub fn decide(
    current: &FallbackState,
    message: &str,
    error_type: Option<&str>,
    policy: &RetryPolicy,
) -> FallbackDecision {
    let classification = classify(message, error_type);
    let next = next_state(current, classification);
    let delay = match (&next, classification) {
        (Some(state), ErrorClassification::RateLimited) => {
            Some(policy.delay(state.fallback_attempts))
        }
        _ => None,
    };

    FallbackDecision {
        classification,
        next,
        delay,
    }
}
