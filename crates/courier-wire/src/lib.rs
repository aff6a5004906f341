// Line-oriented command and size-prefixed frame protocol spoken with consumers.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Magic sent by a client as the first four bytes of a connection.
pub const MAGIC_V2: &[u8; 4] = b"  V2";
pub const PROTOCOL_VERSION: &str = "V2";
// Well-known response payloads.
pub const OK: &[u8] = b"OK";
pub const HEARTBEAT: &[u8] = b"_heartbeat_";
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid protocol magic")]
    InvalidMagic,
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("unknown frame type {0}")]
    UnknownFrameType(u32),
    #[error("invalid command {0}")]
    InvalidCommand(String),
    #[error("{0}")]
    InvalidParams(String),
    #[error("invalid body size {size} (max {max})")]
    InvalidBodySize { size: u32, max: usize },
    #[error("failed to serialize message")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize message: {0}")]
    Deserialize(serde_json::Error),
}

pub fn check_magic(magic: &[u8; 4]) -> Result<()> {
    if magic == MAGIC_V2 {
        Ok(())
    } else {
        Err(Error::InvalidMagic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameType {
    Response = 0,
    Error = 1,
    Message = 2,
}

impl TryFrom<u32> for FrameType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Response),
            1 => Ok(Self::Error),
            2 => Ok(Self::Message),
            other => Err(Error::UnknownFrameType(other)),
        }
    }
}

/// Header preceding every broker-to-client frame: size then frame type, both big endian.
/// `size` counts the frame type plus the payload.
pub fn frame_header(frame_type: FrameType, payload_len: usize) -> Result<[u8; Frame::HEADER_LEN]> {
    let size = payload_len
        .checked_add(4)
        .and_then(|size| u32::try_from(size).ok())
        .ok_or(Error::FrameTooLarge)?;
    let mut header = [0u8; Frame::HEADER_LEN];
    header[..4].copy_from_slice(&size.to_be_bytes());
    header[4..].copy_from_slice(&(frame_type as u32).to_be_bytes());
    Ok(header)
}

/// Frame containing a type and payload.
///
/// ```
/// use bytes::Bytes;
/// use courier_wire::{Frame, FrameType};
///
/// let frame = Frame::new(FrameType::Response, Bytes::from_static(b"OK")).expect("frame");
/// let decoded = Frame::decode(frame.encode()).expect("decode");
/// assert_eq!(decoded.payload(), &Bytes::from_static(b"OK"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    frame_type: FrameType,
    payload: Bytes,
}

impl Frame {
    pub const HEADER_LEN: usize = 8;

    pub fn new(frame_type: FrameType, payload: Bytes) -> Result<Self> {
        // Reject payloads whose size would not fit the u32 prefix.
        frame_header(frame_type, payload.len())?;
        Ok(Self {
            frame_type,
            payload,
        })
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    // Construction goes through `new` or `decode`, so the size always fits the prefix.
    pub fn encode(&self) -> Bytes {
        let size = (self.payload.len() + 4) as u32;
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + self.payload.len());
        buf.put_u32(size);
        buf.put_u32(self.frame_type as u32);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        if input.remaining() < Self::HEADER_LEN {
            return Err(Error::Incomplete);
        }
        let size = input.get_u32() as usize;
        if size < 4 {
            return Err(Error::Incomplete);
        }
        let frame_type = FrameType::try_from(input.get_u32())?;
        let length = size - 4;
        if input.remaining() < length {
            return Err(Error::Incomplete);
        }
        let payload = input.split_to(length);
        Ok(Self {
            frame_type,
            payload,
        })
    }
}

/// Commands read from the client, one per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    // Followed by a size-prefixed JSON body.
    Identify,
    Subscribe { topic: String, channel: String },
    Ready(i64),
    Nop,
    Close,
}

impl Command {
    /// Parse a command line (trailing `\n` / `\r\n` allowed).
    ///
    /// ```
    /// use courier_wire::Command;
    ///
    /// assert_eq!(Command::parse(b"RDY 10\n").expect("rdy"), Command::Ready(10));
    /// assert_eq!(Command::parse(b"NOP\r\n").expect("nop"), Command::Nop);
    /// ```
    pub fn parse(line: &[u8]) -> Result<Self> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let mut parts = line.split(|byte| *byte == b' ');
        let name = parts.next().unwrap_or_default();
        let params: Vec<&[u8]> = parts.collect();
        match name {
            b"IDENTIFY" => Ok(Self::Identify),
            b"NOP" => Ok(Self::Nop),
            b"CLS" => Ok(Self::Close),
            b"SUB" => {
                let [topic, channel] = params.as_slice() else {
                    return Err(Error::InvalidParams(
                        "SUB expects <topic> <channel>".into(),
                    ));
                };
                Ok(Self::Subscribe {
                    topic: String::from_utf8_lossy(topic).into_owned(),
                    channel: String::from_utf8_lossy(channel).into_owned(),
                })
            }
            b"RDY" => {
                // A bare RDY means one message.
                let Some(raw) = params.first() else {
                    return Ok(Self::Ready(1));
                };
                let raw = String::from_utf8_lossy(raw);
                let count = raw
                    .parse::<i64>()
                    .map_err(|_| Error::InvalidParams(format!("could not parse RDY count {raw}")))?;
                Ok(Self::Ready(count))
            }
            other => Err(Error::InvalidCommand(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Identify => "IDENTIFY",
            Self::Subscribe { .. } => "SUB",
            Self::Ready(_) => "RDY",
            Self::Nop => "NOP",
            Self::Close => "CLS",
        }
    }
}

/// Decode the 4-byte big-endian length preceding a command body.
pub fn body_len(prefix: [u8; 4], max_body_bytes: usize) -> Result<usize> {
    let size = u32::from_be_bytes(prefix);
    if size == 0 || size as usize > max_body_bytes {
        return Err(Error::InvalidBodySize {
            size,
            max: max_body_bytes,
        });
    }
    Ok(size as usize)
}

/// Session and feature request sent once with IDENTIFY.
///
/// Numeric fields use `0` for "keep the broker default" and `-1` for "disable" where supported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifyRequest {
    pub short_id: String,
    pub long_id: String,
    pub heartbeat_interval: i64,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: i64,
    pub feature_negotiation: bool,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: i32,
    pub snappy: bool,
    pub sample_rate: i32,
    pub user_agent: String,
    pub msg_timeout: i64,
}

impl IdentifyRequest {
    pub fn from_json(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(Error::Deserialize)
    }
}

/// Feature-negotiation reply describing the effective session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub max_rdy_count: i64,
    pub version: String,
    pub max_msg_timeout: u64,
    pub msg_timeout: u64,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: u32,
    pub max_deflate_level: u32,
    pub snappy: bool,
    pub sample_rate: i32,
    pub output_buffer_size: usize,
    pub output_buffer_timeout: u64,
}

impl IdentifyResponse {
    pub fn to_json(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(Error::Serialize)
    }
}

/// Point-in-time client snapshot for monitoring output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStats {
    pub version: String,
    pub remote_address: String,
    pub name: String,
    pub user_agent: String,
    pub state: i32,
    pub ready_count: i64,
    pub in_flight_count: i64,
    pub message_count: u64,
    pub finish_count: u64,
    pub requeue_count: u64,
    pub connect_ts: i64,
    pub sample_rate: i32,
    pub tls: bool,
    pub deflate: bool,
    pub snappy: bool,
}
