// Buffered reader/writer pair over a socket that can be wrapped in TLS and compression.
//
// The socket is split once into read and write halves. A TLS upgrade re-joins the halves,
// runs the handshake, and splits the secured stream again; a compression upgrade wraps each
// half in a codec. The reader belongs to the command-reading task, the writer to whoever
// holds the connection's configuration lock.
use bytes::Bytes;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{
    AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
    Chain, ReadBuf, ReadHalf, WriteHalf,
};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::io::{CopyToBytes, SinkWriter, StreamReader};

use crate::codec::{InboundCodec, OutboundCodec};
use crate::{Layer, RawIo, UpgradeError};

/// The socket, optionally secured by TLS.
pub enum BaseStream<S> {
    Raw(S),
    Tls(Box<TlsStream<S>>),
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for BaseStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Raw(io) => Pin::new(io).poll_read(cx, buf),
            Self::Tls(io) => Pin::new(io.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for BaseStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Raw(io) => Pin::new(io).poll_write(cx, buf),
            Self::Tls(io) => Pin::new(io.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Raw(io) => Pin::new(io).poll_flush(cx),
            Self::Tls(io) => Pin::new(io.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Raw(io) => Pin::new(io).poll_shutdown(cx),
            Self::Tls(io) => Pin::new(io.as_mut()).poll_shutdown(cx),
        }
    }
}

type BaseRead<S> = ReadHalf<BaseStream<S>>;
type BaseWrite<S> = WriteHalf<BaseStream<S>>;
// Bytes already buffered in plaintext are replayed into the decoder first.
type DecodedRead<S> =
    StreamReader<FramedRead<Chain<Cursor<Vec<u8>>, BaseRead<S>>, InboundCodec>, Bytes>;
type EncodedWrite<S> = SinkWriter<CopyToBytes<FramedWrite<BaseWrite<S>, OutboundCodec>>>;

enum ReadStack<S> {
    Direct(BufReader<BaseRead<S>>),
    Decoded(BufReader<DecodedRead<S>>),
}

enum WriteStack<S> {
    Direct(BufWriter<BaseWrite<S>>),
    Encoded(BufWriter<EncodedWrite<S>>),
}

fn detached() -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        "transport detached by a failed upgrade",
    )
}

/// Inbound half; implements `AsyncBufRead` so callers can read lines and sized bodies.
pub struct LayeredReader<S> {
    stack: Option<ReadStack<S>>,
    capacity: usize,
}

/// Outbound half with a resizable output buffer.
pub struct LayeredWriter<S> {
    stack: Option<WriteStack<S>>,
    capacity: usize,
}

/// Split `io` into a buffered reader and writer with no layers applied.
pub fn layered<S: RawIo>(
    io: S,
    read_capacity: usize,
    write_capacity: usize,
) -> (LayeredReader<S>, LayeredWriter<S>) {
    let (read, write) = tokio::io::split(BaseStream::Raw(io));
    let reader = LayeredReader {
        stack: Some(ReadStack::Direct(BufReader::with_capacity(read_capacity, read))),
        capacity: read_capacity,
    };
    let writer = LayeredWriter {
        stack: Some(WriteStack::Direct(BufWriter::with_capacity(
            write_capacity,
            write,
        ))),
        capacity: write_capacity,
    };
    (reader, writer)
}

impl<S: RawIo> LayeredReader<S> {
    /// Bytes read from the socket but not yet consumed.
    pub fn buffered_len(&self) -> usize {
        match &self.stack {
            Some(ReadStack::Direct(reader)) => reader.buffer().len(),
            Some(ReadStack::Decoded(reader)) => reader.buffer().len(),
            None => 0,
        }
    }
}

impl<S: RawIo> AsyncRead for LayeredReader<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stack.as_mut() {
            Some(ReadStack::Direct(reader)) => Pin::new(reader).poll_read(cx, buf),
            Some(ReadStack::Decoded(reader)) => Pin::new(reader).poll_read(cx, buf),
            None => Poll::Ready(Err(detached())),
        }
    }
}

impl<S: RawIo> AsyncBufRead for LayeredReader<S> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        match self.get_mut().stack.as_mut() {
            Some(ReadStack::Direct(reader)) => Pin::new(reader).poll_fill_buf(cx),
            Some(ReadStack::Decoded(reader)) => Pin::new(reader).poll_fill_buf(cx),
            None => Poll::Ready(Err(detached())),
        }
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        match self.get_mut().stack.as_mut() {
            Some(ReadStack::Direct(reader)) => Pin::new(reader).consume(amt),
            Some(ReadStack::Decoded(reader)) => Pin::new(reader).consume(amt),
            None => {}
        }
    }
}

impl<S: RawIo> LayeredWriter<S> {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Flush buffered bytes, then continue with a buffer of `capacity` bytes.
    pub async fn resize(&mut self, capacity: usize) -> io::Result<()> {
        self.flush().await?;
        let stack = self.stack.take().ok_or_else(detached)?;
        self.stack = Some(match stack {
            WriteStack::Direct(writer) => {
                WriteStack::Direct(BufWriter::with_capacity(capacity, writer.into_inner()))
            }
            WriteStack::Encoded(writer) => {
                WriteStack::Encoded(BufWriter::with_capacity(capacity, writer.into_inner()))
            }
        });
        self.capacity = capacity;
        Ok(())
    }
}

impl<S: RawIo> AsyncWrite for LayeredWriter<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stack.as_mut() {
            Some(WriteStack::Direct(writer)) => Pin::new(writer).poll_write(cx, buf),
            Some(WriteStack::Encoded(writer)) => Pin::new(writer).poll_write(cx, buf),
            None => Poll::Ready(Err(detached())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stack.as_mut() {
            Some(WriteStack::Direct(writer)) => Pin::new(writer).poll_flush(cx),
            Some(WriteStack::Encoded(writer)) => Pin::new(writer).poll_flush(cx),
            None => Poll::Ready(Err(detached())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stack.as_mut() {
            Some(WriteStack::Direct(writer)) => Pin::new(writer).poll_shutdown(cx),
            Some(WriteStack::Encoded(writer)) => Pin::new(writer).poll_shutdown(cx),
            None => Poll::Ready(Err(detached())),
        }
    }
}

// Take both unwrapped halves, leaving the pair untouched unless both are unwrapped.
fn take_direct<S: RawIo>(
    reader: &mut LayeredReader<S>,
    writer: &mut LayeredWriter<S>,
) -> Result<(BufReader<BaseRead<S>>, BufWriter<BaseWrite<S>>), UpgradeError> {
    match (&reader.stack, &writer.stack) {
        (Some(ReadStack::Direct(_)), Some(WriteStack::Direct(_))) => {}
        (None, _) | (_, None) => return Err(UpgradeError::Detached),
        _ => return Err(UpgradeError::CompressionActive),
    }
    match (reader.stack.take(), writer.stack.take()) {
        (Some(ReadStack::Direct(read)), Some(WriteStack::Direct(write))) => Ok((read, write)),
        _ => Err(UpgradeError::Detached),
    }
}

fn attach<S: RawIo>(
    reader: &mut LayeredReader<S>,
    writer: &mut LayeredWriter<S>,
    base: BaseStream<S>,
) {
    let (read, write) = tokio::io::split(base);
    reader.stack = Some(ReadStack::Direct(BufReader::with_capacity(
        reader.capacity,
        read,
    )));
    writer.stack = Some(WriteStack::Direct(BufWriter::with_capacity(
        writer.capacity,
        write,
    )));
}

/// Run a server-side TLS handshake on the raw socket and continue over the secured stream.
///
/// On handshake failure the raw socket is reattached, but its state is indeterminate and the
/// connection must be closed.
pub async fn upgrade_tls<S: RawIo>(
    reader: &mut LayeredReader<S>,
    writer: &mut LayeredWriter<S>,
    acceptor: &TlsAcceptor,
) -> Result<(), UpgradeError> {
    writer.flush().await?;
    let buffered = reader.buffered_len();
    if buffered > 0 {
        return Err(UpgradeError::BufferedPlaintext(buffered));
    }
    let (read, write) = take_direct(reader, writer)?;
    let base = read.into_inner().unsplit(write.into_inner());
    let io = match base {
        BaseStream::Raw(io) => io,
        secured @ BaseStream::Tls(_) => {
            attach(reader, writer, secured);
            return Err(UpgradeError::AlreadyNegotiated(Layer::Tls));
        }
    };
    match acceptor.accept(io).into_fallible().await {
        Ok(stream) => {
            attach(reader, writer, BaseStream::Tls(Box::new(stream)));
            Ok(())
        }
        Err((err, io)) => {
            attach(reader, writer, BaseStream::Raw(io));
            Err(UpgradeError::Handshake(err))
        }
    }
}

/// Wrap both halves of the (possibly TLS) stream in a compression codec.
pub async fn upgrade_codec<S: RawIo>(
    reader: &mut LayeredReader<S>,
    writer: &mut LayeredWriter<S>,
    inbound: InboundCodec,
    outbound: OutboundCodec,
) -> Result<(), UpgradeError> {
    // Anything written so far must leave uncompressed.
    writer.flush().await?;
    let (read, write) = take_direct(reader, writer)?;
    let leftover = read.buffer().to_vec();
    let source = Cursor::new(leftover).chain(read.into_inner());
    let decoded = StreamReader::new(FramedRead::new(source, inbound));
    reader.stack = Some(ReadStack::Decoded(BufReader::with_capacity(
        reader.capacity,
        decoded,
    )));
    let encoded = SinkWriter::new(CopyToBytes::new(FramedWrite::new(
        write.into_inner(),
        outbound,
    )));
    writer.stack = Some(WriteStack::Encoded(BufWriter::with_capacity(
        writer.capacity,
        encoded,
    )));
    Ok(())
}
