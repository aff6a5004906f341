// Which encoding layers wrap the raw socket, as one value.
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::UpgradeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Tls,
    Deflate,
    Snappy,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tls => "tls",
            Self::Deflate => "deflate",
            Self::Snappy => "snappy",
        })
    }
}

/// Valid layer stacks, innermost first: raw socket, optional TLS, optional single compression.
///
/// Layers are only ever added outward, so a stack can be extended but never reordered:
///
/// ```
/// use courier_transport::{Layer, TransportLayers};
///
/// let stack = TransportLayers::Raw.with(Layer::Tls).unwrap().with(Layer::Snappy).unwrap();
/// assert_eq!(stack, TransportLayers::TlsSnappy);
/// assert!(stack.with(Layer::Deflate).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TransportLayers {
    #[default]
    Raw = 0,
    Tls = 1,
    Deflate = 2,
    Snappy = 3,
    TlsDeflate = 4,
    TlsSnappy = 5,
}

impl TransportLayers {
    pub fn tls(self) -> bool {
        matches!(self, Self::Tls | Self::TlsDeflate | Self::TlsSnappy)
    }

    pub fn deflate(self) -> bool {
        matches!(self, Self::Deflate | Self::TlsDeflate)
    }

    pub fn snappy(self) -> bool {
        matches!(self, Self::Snappy | Self::TlsSnappy)
    }

    pub fn compression(self) -> Option<Layer> {
        if self.deflate() {
            Some(Layer::Deflate)
        } else if self.snappy() {
            Some(Layer::Snappy)
        } else {
            None
        }
    }

    pub fn contains(self, layer: Layer) -> bool {
        match layer {
            Layer::Tls => self.tls(),
            Layer::Deflate => self.deflate(),
            Layer::Snappy => self.snappy(),
        }
    }

    /// The stack after adding `layer` on the outside.
    pub fn with(self, layer: Layer) -> Result<Self, UpgradeError> {
        match (self, layer) {
            (Self::Raw, Layer::Tls) => Ok(Self::Tls),
            (Self::Raw, Layer::Deflate) => Ok(Self::Deflate),
            (Self::Raw, Layer::Snappy) => Ok(Self::Snappy),
            (Self::Tls, Layer::Deflate) => Ok(Self::TlsDeflate),
            (Self::Tls, Layer::Snappy) => Ok(Self::TlsSnappy),
            (current, layer) if current.contains(layer) => {
                Err(UpgradeError::AlreadyNegotiated(layer))
            }
            (current, requested) => Err(UpgradeError::OutOfOrder { current, requested }),
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Tls,
            2 => Self::Deflate,
            3 => Self::Snappy,
            4 => Self::TlsDeflate,
            5 => Self::TlsSnappy,
            _ => Self::Raw,
        }
    }
}

impl fmt::Display for TransportLayers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Raw => "raw",
            Self::Tls => "tls",
            Self::Deflate => "deflate",
            Self::Snappy => "snappy",
            Self::TlsDeflate => "tls+deflate",
            Self::TlsSnappy => "tls+snappy",
        })
    }
}

/// Lock-free cell for reading the current stack from monitoring paths.
#[derive(Debug, Default)]
pub struct AtomicLayers(AtomicU8);

impl AtomicLayers {
    pub fn load(&self) -> TransportLayers {
        TransportLayers::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, layers: TransportLayers) {
        self.0.store(layers as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_may_follow_tls_but_not_precede_it() {
        let stack = TransportLayers::Raw.with(Layer::Deflate).expect("deflate");
        let err = stack.with(Layer::Tls).expect_err("tls after deflate");
        assert!(matches!(
            err,
            UpgradeError::OutOfOrder {
                current: TransportLayers::Deflate,
                requested: Layer::Tls
            }
        ));
    }

    #[test]
    fn only_one_compression_layer() {
        let stack = TransportLayers::Tls.with(Layer::Snappy).expect("snappy");
        assert!(matches!(
            stack.with(Layer::Deflate),
            Err(UpgradeError::OutOfOrder { .. })
        ));
        assert_eq!(stack.compression(), Some(Layer::Snappy));
    }

    #[test]
    fn repeating_a_layer_reports_already_negotiated() {
        assert!(matches!(
            TransportLayers::TlsDeflate.with(Layer::Tls),
            Err(UpgradeError::AlreadyNegotiated(Layer::Tls))
        ));
        assert!(matches!(
            TransportLayers::Snappy.with(Layer::Snappy),
            Err(UpgradeError::AlreadyNegotiated(Layer::Snappy))
        ));
    }

    #[test]
    fn atomic_cell_round_trips_every_stack() {
        let cell = AtomicLayers::default();
        assert_eq!(cell.load(), TransportLayers::Raw);
        for stack in [
            TransportLayers::Tls,
            TransportLayers::Deflate,
            TransportLayers::Snappy,
            TransportLayers::TlsDeflate,
            TransportLayers::TlsSnappy,
        ] {
            cell.store(stack);
            assert_eq!(cell.load(), stack);
        }
        assert!(cell.load().tls() && cell.load().snappy() && !cell.load().deflate());
    }
}
