// Validation of client-requested session parameters.
//
// Each check returns `Ok(None)` when the client asked to keep the current value (`0`),
// `Ok(Some(v))` with the new effective value, or a validation error naming the field.
use std::time::Duration;

use crate::{ClientError, Result};

fn in_range_ms(value: i64, min: i64, max: Duration) -> bool {
    value >= min && (value as u128) <= max.as_millis()
}

fn invalid(field: &'static str, value: impl ToString) -> ClientError {
    ClientError::Validation {
        field,
        value: value.to_string(),
    }
}

/// `-1` disables heartbeats, otherwise `[1000ms, max]`.
///
/// ```
/// use courier_broker::session::heartbeat_interval;
/// use std::time::Duration;
///
/// let max = Duration::from_secs(60);
/// assert_eq!(heartbeat_interval(0, max).unwrap(), None);
/// assert_eq!(heartbeat_interval(-1, max).unwrap(), Some(Duration::ZERO));
/// assert!(heartbeat_interval(999, max).is_err());
/// ```
pub fn heartbeat_interval(value: i64, max: Duration) -> Result<Option<Duration>> {
    match value {
        -1 => Ok(Some(Duration::ZERO)),
        0 => Ok(None),
        ms if in_range_ms(ms, 1000, max) => Ok(Some(Duration::from_millis(ms as u64))),
        _ => Err(invalid("heartbeat_interval", value)),
    }
}

/// `-1` selects a one byte buffer so every write goes straight through.
pub fn output_buffer_size(value: i64, max: usize) -> Result<Option<usize>> {
    match value {
        -1 => Ok(Some(1)),
        0 => Ok(None),
        size if size >= 64 && (size as u64) <= max as u64 => Ok(Some(size as usize)),
        _ => Err(invalid("output_buffer_size", value)),
    }
}

/// `-1` disables the periodic flush timer.
pub fn output_buffer_timeout(value: i64, max: Duration) -> Result<Option<Duration>> {
    match value {
        -1 => Ok(Some(Duration::ZERO)),
        0 => Ok(None),
        ms if in_range_ms(ms, 1, max) => Ok(Some(Duration::from_millis(ms as u64))),
        _ => Err(invalid("output_buffer_timeout", value)),
    }
}

pub fn msg_timeout(value: i64, max: Duration) -> Result<Option<Duration>> {
    match value {
        0 => Ok(None),
        ms if in_range_ms(ms, 1000, max) => Ok(Some(Duration::from_millis(ms as u64))),
        _ => Err(invalid("msg_timeout", value)),
    }
}

pub fn sample_rate(value: i32) -> Result<i32> {
    if (0..=99).contains(&value) {
        Ok(value)
    } else {
        Err(invalid("sample_rate", value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_HEARTBEAT: Duration = Duration::from_secs(60);

    #[test]
    fn heartbeat_boundaries() {
        let max_ms = MAX_HEARTBEAT.as_millis() as i64;
        assert!(heartbeat_interval(999, MAX_HEARTBEAT).is_err());
        assert!(heartbeat_interval(max_ms + 1, MAX_HEARTBEAT).is_err());
        assert_eq!(
            heartbeat_interval(1000, MAX_HEARTBEAT).unwrap(),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            heartbeat_interval(max_ms, MAX_HEARTBEAT).unwrap(),
            Some(MAX_HEARTBEAT)
        );
        assert_eq!(heartbeat_interval(0, MAX_HEARTBEAT).unwrap(), None);
        assert_eq!(
            heartbeat_interval(-1, MAX_HEARTBEAT).unwrap(),
            Some(Duration::ZERO)
        );
        assert!(heartbeat_interval(-2, MAX_HEARTBEAT).is_err());
    }

    #[test]
    fn output_buffer_size_boundaries() {
        let max = 64 * 1024;
        assert_eq!(output_buffer_size(-1, max).unwrap(), Some(1));
        assert_eq!(output_buffer_size(0, max).unwrap(), None);
        assert!(output_buffer_size(63, max).is_err());
        assert_eq!(output_buffer_size(64, max).unwrap(), Some(64));
        assert_eq!(output_buffer_size(max as i64, max).unwrap(), Some(max));
        let err = output_buffer_size(max as i64 + 1, max).expect_err("too large");
        assert!(matches!(
            err,
            ClientError::Validation { field: "output_buffer_size", ref value } if value == "65537"
        ));
    }

    #[test]
    fn output_buffer_timeout_boundaries() {
        let max = Duration::from_secs(1);
        assert_eq!(
            output_buffer_timeout(-1, max).unwrap(),
            Some(Duration::ZERO)
        );
        assert_eq!(output_buffer_timeout(0, max).unwrap(), None);
        assert_eq!(
            output_buffer_timeout(1, max).unwrap(),
            Some(Duration::from_millis(1))
        );
        assert_eq!(output_buffer_timeout(1000, max).unwrap(), Some(max));
        assert!(output_buffer_timeout(1001, max).is_err());
    }

    #[test]
    fn msg_timeout_has_no_disable_sentinel() {
        let max = Duration::from_secs(15 * 60);
        assert!(msg_timeout(-1, max).is_err());
        assert!(msg_timeout(999, max).is_err());
        assert_eq!(msg_timeout(0, max).unwrap(), None);
        assert_eq!(
            msg_timeout(1000, max).unwrap(),
            Some(Duration::from_secs(1))
        );
        assert!(msg_timeout(max.as_millis() as i64 + 1, max).is_err());
    }

    #[test]
    fn sample_rate_is_a_percentage_below_100() {
        assert!(sample_rate(-1).is_err());
        assert!(sample_rate(100).is_err());
        assert_eq!(sample_rate(0).unwrap(), 0);
        assert_eq!(sample_rate(99).unwrap(), 99);
    }
}
