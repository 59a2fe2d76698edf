//! Slow-request threshold configuration.
//!
//! The threshold is resolved once, when the process-wide tracker is first
//! used. Malformed values degrade to the default with a warning; observability
//! configuration must never prevent the process from serving requests.

use thiserror::Error;

/// Environment variable holding the slow-request threshold in milliseconds.
pub const SLOW_REQUEST_THRESHOLD_ENV: &str = "PACER_SLOW_REQUEST_MS";

/// Default slow-request threshold: 1000ms.
pub const DEFAULT_SLOW_REQUEST_THRESHOLD_NANOS: u64 = 1_000 * NANOS_PER_MILLI;

pub(crate) const NANOS_PER_MILLI: u64 = 1_000_000;

/// Failure to interpret a configured threshold value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ThresholdError {
    #[error("threshold is not an integer: {0:?}")]
    NotANumber(String),
    #[error("threshold must not be negative: {0}")]
    Negative(i64),
    #[error("threshold overflows the nanosecond range: {0}ms")]
    TooLarge(i64),
}

/// Parses a configured threshold (milliseconds) into nanoseconds.
///
/// # Errors
///
/// Returns [`ThresholdError`] when the value is not an integer, is
/// negative, or does not fit the nanosecond range as a `u64`. Callers
/// substitute the default in that case.
pub fn parse_threshold_millis(raw: &str) -> Result<u64, ThresholdError> {
    let millis: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ThresholdError::NotANumber(raw.to_owned()))?;
    if millis < 0 {
        return Err(ThresholdError::Negative(millis));
    }
    #[allow(clippy::cast_sign_loss)]
    (millis as u64)
        .checked_mul(NANOS_PER_MILLI)
        .ok_or(ThresholdError::TooLarge(millis))
}

/// Resolves the slow-request threshold from the environment.
///
/// Unset means the default; a present-but-invalid value is logged at warn
/// level and replaced by the default, never an error.
#[must_use]
pub fn resolve_slow_request_threshold() -> u64 {
    match std::env::var(SLOW_REQUEST_THRESHOLD_ENV) {
        Ok(raw) => match parse_threshold_millis(&raw) {
            Ok(nanos) => nanos,
            Err(err) => {
                tracing::warn!(
                    env = SLOW_REQUEST_THRESHOLD_ENV,
                    value = %raw,
                    error = %err,
                    "invalid slow-request threshold, using default"
                );
                DEFAULT_SLOW_REQUEST_THRESHOLD_NANOS
            }
        },
        Err(_) => DEFAULT_SLOW_REQUEST_THRESHOLD_NANOS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_millis_to_nanos() {
        assert_eq!(parse_threshold_millis("250"), Ok(250 * NANOS_PER_MILLI));
        assert_eq!(parse_threshold_millis(" 1000 "), Ok(1_000 * NANOS_PER_MILLI));
        assert_eq!(parse_threshold_millis("0"), Ok(0));
    }

    #[test]
    fn rejects_non_numeric() {
        assert_eq!(
            parse_threshold_millis("fast"),
            Err(ThresholdError::NotANumber("fast".to_owned()))
        );
        assert_eq!(
            parse_threshold_millis(""),
            Err(ThresholdError::NotANumber(String::new()))
        );
    }

    #[test]
    fn rejects_negative() {
        assert_eq!(
            parse_threshold_millis("-5"),
            Err(ThresholdError::Negative(-5))
        );
    }

    #[test]
    fn rejects_millis_that_overflow_nanoseconds() {
        // u64::MAX nanoseconds is ~18.4e12 ms; anything above must become
        // a parse error (and so the default), not a wrap or a panic.
        assert_eq!(
            parse_threshold_millis("100000000000000"),
            Err(ThresholdError::TooLarge(100_000_000_000_000))
        );
        assert_eq!(
            parse_threshold_millis(&i64::MAX.to_string()),
            Err(ThresholdError::TooLarge(i64::MAX))
        );
        // The largest representable threshold still parses cleanly.
        let max_millis = u64::MAX / NANOS_PER_MILLI;
        assert_eq!(
            parse_threshold_millis(&max_millis.to_string()),
            Ok(max_millis * NANOS_PER_MILLI)
        );
    }

    #[test]
    fn default_is_one_second() {
        assert_eq!(DEFAULT_SLOW_REQUEST_THRESHOLD_NANOS, 1_000_000_000);
    }
}
