//! Byte-stream layering for consumer connections.
//!
//! A connection starts as a raw socket split into a buffered [`LayeredReader`] and
//! [`LayeredWriter`]. Upgrades only add layers outward: TLS first, then at most one
//! compression codec (deflate or snappy). [`TransportLayers`] names the valid stacks.
//!
//! ```
//! use courier_transport::{Layer, TransportLayers};
//!
//! assert_eq!(TransportLayers::Raw.with(Layer::Deflate).unwrap().to_string(), "deflate");
//! ```
pub mod codec;
pub mod layers;
pub mod stream;
pub mod tls;

use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

pub use codec::{InboundCodec, OutboundCodec};
pub use layers::{AtomicLayers, Layer, TransportLayers};
pub use stream::{LayeredReader, LayeredWriter, layered, upgrade_codec, upgrade_tls};
pub use tls::{TlsConfigError, acceptor_from_files, acceptor_from_pem, server_config_from_pem};
pub use tokio_rustls::TlsAcceptor;

pub const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum UpgradeError {
    #[error("{0} already negotiated")]
    AlreadyNegotiated(Layer),
    #[error("cannot add {requested} on top of {current}")]
    OutOfOrder {
        current: TransportLayers,
        requested: Layer,
    },
    #[error("compression already wraps the stream")]
    CompressionActive,
    #[error("tls handshake failed: {0}")]
    Handshake(#[source] io::Error),
    #[error("{0} plaintext bytes buffered ahead of tls handshake")]
    BufferedPlaintext(usize),
    #[error("transport detached")]
    Detached,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Socket types a connection can be layered over.
pub trait RawIo: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {}

impl<T> RawIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    pub read_buffer_size: usize,
    // Chunk checksums are skipped on read unless set.
    pub snappy_verify_checksum: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            snappy_verify_checksum: false,
        }
    }
}
