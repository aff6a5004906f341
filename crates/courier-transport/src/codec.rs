// Stream compression codecs layered over the connection byte stream.
//
// Both codecs plug into `tokio_util::codec`: inbound codecs turn compressed wire bytes
// into plain chunks, outbound codecs turn plain chunks into compressed wire bytes.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

const INFLATE_CHUNK: usize = 16 * 1024;
const DEFLATE_SLACK: usize = 64;

// Snappy framing format constants.
const SNAPPY_MAX_BLOCK: usize = 64 * 1024;
const SNAPPY_CHUNK_HEADER: usize = 4;
const SNAPPY_CHECKSUM_LEN: usize = 4;
const CHUNK_COMPRESSED: u8 = 0x00;
const CHUNK_UNCOMPRESSED: u8 = 0x01;
const CHUNK_PADDING: u8 = 0xfe;
const CHUNK_STREAM_IDENTIFIER: u8 = 0xff;
const STREAM_IDENTIFIER_BODY: &[u8] = b"sNaPpY";
const STREAM_IDENTIFIER: [u8; 10] = [0xff, 0x06, 0x00, 0x00, b's', b'N', b'a', b'P', b'p', b'Y'];

fn invalid_data<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Raw deflate (no zlib header) decompressor for inbound bytes.
pub struct DeflateDecoder {
    inflate: Decompress,
    finished: bool,
}

impl DeflateDecoder {
    pub fn new() -> Self {
        Self {
            inflate: Decompress::new(false),
            finished: false,
        }
    }
}

impl Default for DeflateDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for DeflateDecoder {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        if src.is_empty() {
            return Ok(None);
        }
        if self.finished {
            return Err(invalid_data("data after end of deflate stream"));
        }
        let mut out = Vec::with_capacity(src.len().saturating_mul(2).max(INFLATE_CHUNK));
        loop {
            let in_before = self.inflate.total_in();
            let out_before = out.len();
            let status = self
                .inflate
                .decompress_vec(&src[..], &mut out, FlushDecompress::None)
                .map_err(invalid_data)?;
            let consumed = (self.inflate.total_in() - in_before) as usize;
            src.advance(consumed);
            let produced = out.len() - out_before;
            if status == Status::StreamEnd {
                self.finished = true;
                break;
            }
            if out.len() == out.capacity() {
                out.reserve(INFLATE_CHUNK);
                continue;
            }
            if src.is_empty() || (consumed == 0 && produced == 0) {
                break;
            }
        }
        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Bytes::from(out)))
        }
    }
}

/// Raw deflate compressor for outbound bytes.
///
/// Every chunk is finished with a sync flush so the peer can decode everything written so far.
pub struct DeflateEncoder {
    deflate: Compress,
}

impl DeflateEncoder {
    pub fn new(level: u32) -> Self {
        Self {
            deflate: Compress::new(Compression::new(level.min(9)), false),
        }
    }
}

impl Encoder<Bytes> for DeflateEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        let mut out = Vec::with_capacity(item.len() + DEFLATE_SLACK);
        let mut consumed = 0usize;
        loop {
            let before = self.deflate.total_in();
            self.deflate
                .compress_vec(&item[consumed..], &mut out, FlushCompress::Sync)
                .map_err(invalid_data)?;
            consumed += (self.deflate.total_in() - before) as usize;
            // The sync flush is complete once all input is in and output was not cut short.
            if consumed == item.len() && out.len() < out.capacity() {
                break;
            }
            out.reserve(out.capacity().max(DEFLATE_SLACK));
        }
        dst.extend_from_slice(&out);
        Ok(())
    }
}

fn masked_crc32c(data: &[u8]) -> u32 {
    let crc = crc32c::crc32c(data);
    (crc.rotate_right(15)).wrapping_add(0xa282_ead8)
}

/// Snappy framing-format reader.
///
/// Checksums are verified only when `verify_checksum` is set; skippable chunks are ignored.
pub struct SnappyDecoder {
    raw: snap::raw::Decoder,
    verify_checksum: bool,
    seen_identifier: bool,
}

impl SnappyDecoder {
    pub fn new(verify_checksum: bool) -> Self {
        Self {
            raw: snap::raw::Decoder::new(),
            verify_checksum,
            seen_identifier: false,
        }
    }

    fn check(&self, expected: u32, data: &[u8]) -> io::Result<()> {
        if self.verify_checksum && masked_crc32c(data) != expected {
            return Err(invalid_data("snappy chunk checksum mismatch"));
        }
        Ok(())
    }
}

impl Decoder for SnappyDecoder {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        loop {
            if src.len() < SNAPPY_CHUNK_HEADER {
                return Ok(None);
            }
            let chunk_type = src[0];
            let len = usize::from(src[1]) | usize::from(src[2]) << 8 | usize::from(src[3]) << 16;
            if src.len() < SNAPPY_CHUNK_HEADER + len {
                src.reserve(SNAPPY_CHUNK_HEADER + len - src.len());
                return Ok(None);
            }
            if chunk_type != CHUNK_STREAM_IDENTIFIER && !self.seen_identifier {
                return Err(invalid_data("snappy stream missing identifier chunk"));
            }
            src.advance(SNAPPY_CHUNK_HEADER);
            let body = src.split_to(len);
            match chunk_type {
                CHUNK_STREAM_IDENTIFIER => {
                    if body.as_ref() != STREAM_IDENTIFIER_BODY {
                        return Err(invalid_data("invalid snappy stream identifier"));
                    }
                    self.seen_identifier = true;
                }
                CHUNK_COMPRESSED | CHUNK_UNCOMPRESSED => {
                    if body.len() < SNAPPY_CHECKSUM_LEN {
                        return Err(invalid_data("snappy chunk shorter than checksum"));
                    }
                    let expected = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                    let payload = &body[SNAPPY_CHECKSUM_LEN..];
                    let data = if chunk_type == CHUNK_COMPRESSED {
                        let decoded_len =
                            snap::raw::decompress_len(payload).map_err(invalid_data)?;
                        if decoded_len > SNAPPY_MAX_BLOCK {
                            return Err(invalid_data("snappy block exceeds 64KiB"));
                        }
                        Bytes::from(self.raw.decompress_vec(payload).map_err(invalid_data)?)
                    } else {
                        if payload.len() > SNAPPY_MAX_BLOCK {
                            return Err(invalid_data("snappy block exceeds 64KiB"));
                        }
                        Bytes::copy_from_slice(payload)
                    };
                    self.check(expected, &data)?;
                    if !data.is_empty() {
                        return Ok(Some(data));
                    }
                }
                CHUNK_PADDING | 0x80..=0xfd => {}
                reserved => {
                    return Err(invalid_data(format!(
                        "unskippable snappy chunk type {reserved:#04x}"
                    )));
                }
            }
        }
    }
}

/// Snappy framing-format writer; emits the stream identifier before the first chunk.
pub struct SnappyEncoder {
    raw: snap::raw::Encoder,
    wrote_identifier: bool,
}

impl SnappyEncoder {
    pub fn new() -> Self {
        Self {
            raw: snap::raw::Encoder::new(),
            wrote_identifier: false,
        }
    }
}

impl Default for SnappyEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Bytes> for SnappyEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        if !self.wrote_identifier {
            dst.extend_from_slice(&STREAM_IDENTIFIER);
            self.wrote_identifier = true;
        }
        for block in item.chunks(SNAPPY_MAX_BLOCK) {
            let checksum = masked_crc32c(block);
            let compressed = self.raw.compress_vec(block).map_err(invalid_data)?;
            let (chunk_type, body) = if compressed.len() < block.len() {
                (CHUNK_COMPRESSED, compressed.as_slice())
            } else {
                (CHUNK_UNCOMPRESSED, block)
            };
            let len = SNAPPY_CHECKSUM_LEN + body.len();
            dst.reserve(SNAPPY_CHUNK_HEADER + len);
            dst.put_u8(chunk_type);
            dst.put_uint_le(len as u64, 3);
            dst.put_u32_le(checksum);
            dst.extend_from_slice(body);
        }
        Ok(())
    }
}

/// Decoder selected for the inbound half of a compressed connection.
pub enum InboundCodec {
    Deflate(DeflateDecoder),
    Snappy(SnappyDecoder),
}

impl InboundCodec {
    pub fn deflate() -> Self {
        Self::Deflate(DeflateDecoder::new())
    }

    pub fn snappy(verify_checksum: bool) -> Self {
        Self::Snappy(SnappyDecoder::new(verify_checksum))
    }
}

impl Decoder for InboundCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        match self {
            Self::Deflate(codec) => codec.decode(src),
            Self::Snappy(codec) => codec.decode(src),
        }
    }
}

/// Encoder selected for the outbound half of a compressed connection.
pub enum OutboundCodec {
    Deflate(DeflateEncoder),
    Snappy(SnappyEncoder),
}

impl OutboundCodec {
    pub fn deflate(level: u32) -> Self {
        Self::Deflate(DeflateEncoder::new(level))
    }

    pub fn snappy() -> Self {
        Self::Snappy(SnappyEncoder::new())
    }
}

impl Encoder<Bytes> for OutboundCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        match self {
            Self::Deflate(codec) => codec.encode(item, dst),
            Self::Snappy(codec) => codec.encode(item, dst),
        }
    }
}
