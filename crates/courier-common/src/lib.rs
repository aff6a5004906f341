// Shared data types and broker-wide limits used across crates.
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),
}

pub mod ids {
    // Numeric connection identifiers handed out by the accept loop.
    use std::fmt;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
    pub struct ClientId(u64);

    impl ClientId {
        pub fn new(raw: u64) -> Self {
            Self(raw)
        }

        pub fn get(&self) -> u64 {
            self.0
        }
    }

    impl fmt::Display for ClientId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    /// Monotonic id source shared by an accept loop.
    ///
    /// ```
    /// use courier_common::ids::ClientIdSequence;
    ///
    /// let ids = ClientIdSequence::default();
    /// assert_eq!(ids.next_id().get(), 1);
    /// assert_eq!(ids.next_id().get(), 2);
    /// ```
    #[derive(Debug, Default)]
    pub struct ClientIdSequence {
        last: AtomicU64,
    }

    impl ClientIdSequence {
        pub fn next_id(&self) -> ClientId {
            ClientId(self.last.fetch_add(1, Ordering::Relaxed) + 1)
        }
    }
}

/// Broker-wide bounds and defaults applied to every client session.
///
/// ```
/// use courier_common::SessionLimits;
///
/// let limits = SessionLimits::default();
/// assert_eq!(limits.default_heartbeat_interval(), limits.client_timeout / 2);
/// ```
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_heartbeat_interval: Duration,
    pub max_output_buffer_size: usize,
    pub max_output_buffer_timeout: Duration,
    pub max_msg_timeout: Duration,
    pub client_timeout: Duration,
    pub msg_timeout: Duration,
    pub max_rdy_count: i64,
    pub max_deflate_level: u32,
    // Starting output buffering for a new connection, before identify.
    pub output_buffer_size: usize,
    pub output_buffer_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_heartbeat_interval: Duration::from_secs(60),
            max_output_buffer_size: 64 * 1024,
            max_output_buffer_timeout: Duration::from_secs(1),
            max_msg_timeout: Duration::from_secs(15 * 60),
            client_timeout: Duration::from_secs(60),
            msg_timeout: Duration::from_secs(60),
            max_rdy_count: 2500,
            max_deflate_level: 6,
            output_buffer_size: 16 * 1024,
            output_buffer_timeout: Duration::from_millis(250),
        }
    }
}

impl SessionLimits {
    // Heartbeats are client configurable but start at half the client timeout.
    pub fn default_heartbeat_interval(&self) -> Duration {
        self.client_timeout / 2
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_output_buffer_size < 64 {
            return Err(Error::Config(format!(
                "max_output_buffer_size ({}) must be at least 64",
                self.max_output_buffer_size
            )));
        }
        if self.output_buffer_size == 0 || self.output_buffer_size > self.max_output_buffer_size {
            return Err(Error::Config(format!(
                "output_buffer_size ({}) must be within 1..={}",
                self.output_buffer_size, self.max_output_buffer_size
            )));
        }
        if self.max_heartbeat_interval < Duration::from_secs(1) {
            return Err(Error::Config(
                "max_heartbeat_interval must be at least 1s".into(),
            ));
        }
        if self.max_msg_timeout < Duration::from_secs(1) {
            return Err(Error::Config("max_msg_timeout must be at least 1s".into()));
        }
        if !(1..=9).contains(&self.max_deflate_level) {
            return Err(Error::Config(format!(
                "max_deflate_level ({}) must be within 1..=9",
                self.max_deflate_level
            )));
        }
        if self.max_rdy_count <= 0 {
            return Err(Error::Config("max_rdy_count must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, SessionLimits, ids::ClientId, ids::ClientIdSequence};
    use std::time::Duration;

    #[test]
    fn client_ids_are_sequential_and_display_as_decimal() {
        let ids = ClientIdSequence::default();
        let first = ids.next_id();
        let second = ids.next_id();
        assert_eq!(first, ClientId::new(1));
        assert!(second > first);
        assert_eq!(second.to_string(), "2");
    }

    #[test]
    fn default_limits_are_valid() {
        let limits = SessionLimits::default();
        limits.validate().expect("valid");
        assert_eq!(limits.default_heartbeat_interval(), Duration::from_secs(30));
    }

    #[test]
    fn limits_reject_tiny_output_buffer() {
        let limits = SessionLimits {
            max_output_buffer_size: 32,
            ..SessionLimits::default()
        };
        let err = limits.validate().expect_err("invalid");
        assert!(matches!(err, Error::Config(msg) if msg.contains("max_output_buffer_size")));
    }

    #[test]
    fn limits_reject_out_of_range_deflate_level() {
        let limits = SessionLimits {
            max_deflate_level: 12,
            ..SessionLimits::default()
        };
        assert!(limits.validate().is_err());
    }
}
