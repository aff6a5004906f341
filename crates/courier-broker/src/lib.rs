// Per-connection protocol and flow-control engine for consumer connections.
// A `Client` is driven by two tasks: the command reader (identify, upgrades, RDY) and the
// delivery pump (readiness checks, heartbeats, flushes). Hot counters are atomics; the
// identity, buffering settings and the writer itself sit behind one async lock.
use std::fmt;
use std::io;
use std::time::Duration;

use courier_transport::UpgradeError;

pub mod channel;
pub mod client;
pub mod counters;
pub mod events;
pub mod identify;
pub mod readiness;
pub mod session;

pub use channel::{Channel, ChannelHandle};
pub use client::{Client, ClientContext, ClientParts, FLUSH_TIMEOUT, PumpEvents};
pub use counters::{FlowCounters, Readiness};
pub use events::{EventReceiver, EventRelay};
pub use identify::{IdentifyEvent, Negotiation, negotiate_features};
pub use readiness::{NoReadinessLog, ReadinessLog, TracingReadinessLog};

pub type Result<T> = std::result::Result<T, ClientError>;

/// Connection lifecycle. `Closing` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ClientState {
    Init = 0,
    Waiting = 1,
    Subscribed = 2,
    Closing = 3,
}

impl ClientState {
    pub(crate) fn from_i32(raw: i32) -> Self {
        match raw {
            0 => Self::Init,
            1 => Self::Waiting,
            2 => Self::Subscribed,
            _ => Self::Closing,
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::Waiting => "waiting",
            Self::Subscribed => "subscribed",
            Self::Closing => "closing",
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("{field} ({value}) is invalid")]
    Validation { field: &'static str, value: String },
    #[error("cannot {operation} in state {state}")]
    InvalidState {
        operation: &'static str,
        state: ClientState,
    },
    #[error("tls is not configured")]
    TlsNotConfigured,
    #[error(transparent)]
    Upgrade(#[from] UpgradeError),
    #[error("flush timed out after {0:?}")]
    FlushTimeout(Duration),
    #[error(transparent)]
    Protocol(#[from] courier_wire::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Whether the connection must be closed rather than answered with an error frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Upgrade(_) | Self::TlsNotConfigured | Self::Io(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::FlushTimeout(_))
    }
}
