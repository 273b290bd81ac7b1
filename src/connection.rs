//! A module for handling the connection to a stream, usually a remote peer via a `TcpStream`.
use crate::http::{chunked, HttpRequest, HttpResponse};
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, error};

const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Hard cap on the inbound buffer of a single connection.
pub const DEFAULT_INBOUND_CAP: usize = 4 * 1024 * 1024;

/// Outbound watermarks: past the high mark the connection flushes
/// before reading again; it is considered drained below the low mark.
pub const OUTBOUND_HIGH_WATERMARK: usize = 256 * 1024;
pub const OUTBOUND_LOW_WATERMARK: usize = 64 * 1024;

/// Send and receive HTTP messages over a stream.
///
/// To read, the `Connection` fills an internal buffer until the codec
/// can cut a complete message out of it; whatever trails the message
/// stays buffered for the next read. Writes are staged through a
/// buffered writer and flushed per message, or early when the staged
/// bytes pass the high watermark.
#[derive(Debug)]
pub struct Connection<S> {
    /// Stream wrapped with a `BufWriter` for buffering writes.
    stream: BufWriter<S>,
    /// Buffer used for decoding inbound messages.
    buffer: BytesMut,
    /// Hard cap on `buffer` growth; overflow is a protocol error.
    inbound_cap: usize,
    /// Bytes staged on the writer since the last flush.
    staged: usize,
    /// The peer closed its half of the stream.
    eof: bool,
}

/// A trait for types that can be used as a connection stream.
pub trait ConnectionStream: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types that implement `AsyncRead + AsyncWrite + Unpin + Send`.
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ConnectionStream for T {}

impl<S: ConnectionStream> Connection<S> {
    /// Create a new `Connection` backed by `socket`.
    ///
    /// The connection is internally buffered, with a default read
    /// buffer of 16KB and a default inbound cap of 4MB.
    pub fn new(socket: S) -> Self {
        Connection::with_inbound_cap(socket, DEFAULT_INBOUND_CAP)
    }

    /// Create a connection with a transport-specific inbound cap.
    pub fn with_inbound_cap(socket: S, inbound_cap: usize) -> Self {
        Self {
            stream: BufWriter::new(socket),
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            inbound_cap,
            staged: 0,
            eof: false,
        }
    }

    /// Read a single request from the connection (server side).
    ///
    /// Waits until enough data arrived to decode a complete request.
    /// Returns `None` on a clean close between messages; a close in the
    /// middle of a message is an error.
    #[tracing::instrument(skip_all)]
    pub async fn read_request(&mut self) -> Result<Option<HttpRequest>> {
        loop {
            match self.try_decode(HttpRequest::parse)? {
                Some(request) => {
                    debug!(method = %request.method, path = %request.uri.path(), "request received");
                    return Ok(Some(request));
                }
                None => {
                    if self.fill().await? {
                        continue;
                    }
                    if self.buffer.is_empty() {
                        debug!("no more requests to read from the buffer");
                        return Ok(None);
                    }
                    error!("connection was closed mid message");
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "connection was closed mid message",
                    )));
                }
            }
        }
    }

    /// Read a single response from the connection (client side).
    ///
    /// Until-close bodies complete when the peer closes; a clean close
    /// before any byte of the response yields `None`.
    #[tracing::instrument(skip_all)]
    pub async fn read_response(&mut self) -> Result<Option<HttpResponse>> {
        loop {
            let eof = self.eof;
            match self.try_decode(|src| HttpResponse::parse(src, eof))? {
                Some(response) => {
                    debug!(status = response.status.as_u16(), "response received");
                    return Ok(Some(response));
                }
                None => {
                    if self.fill().await? {
                        continue;
                    }
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    // Closed mid-message: one more decode attempt now
                    // that `eof` is set, for until-close bodies.
                    if let Some(response) = self.try_decode(|src| HttpResponse::parse(src, true))? {
                        return Ok(Some(response));
                    }
                    error!("connection was closed mid message");
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "connection was closed mid message",
                    )));
                }
            }
        }
    }

    /// Try to cut one message out of the buffered data.
    ///
    /// `Error::IncompleteMessage` means not enough bytes yet and maps
    /// to `Ok(None)`; everything else is returned as is.
    fn try_decode<T>(
        &mut self,
        parse: impl FnOnce(&mut Cursor<&[u8]>) -> Result<T>,
    ) -> Result<Option<T>> {
        let mut cursor = Cursor::new(&self.buffer[..]);
        match parse(&mut cursor) {
            Ok(message) => {
                let len = cursor.position() as usize;
                self.buffer.advance(len);
                Ok(Some(message))
            }
            Err(Error::IncompleteMessage) => {
                if self.buffer.len() >= self.inbound_cap {
                    Err(Error::TooLarge(format!(
                        "inbound buffer exceeds {} bytes",
                        self.inbound_cap
                    )))
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Read more bytes off the socket into the decode buffer.
    ///
    /// Returns `false` once the peer has closed its half.
    async fn fill(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        if 0 == self.stream.read_buf(&mut self.buffer).await? {
            self.eof = true;
            return Ok(false);
        }
        Ok(true)
    }

    /// Write a response and flush it (server side).
    pub async fn write_response(&mut self, response: &HttpResponse, keep_alive: bool) -> Result<()> {
        let wire = response.encode(keep_alive);
        self.write_all(&wire).await?;
        self.flush().await
    }

    /// Write a request and flush it (client side).
    pub async fn write_request(&mut self, request: &HttpRequest) -> Result<()> {
        let wire = request.encode();
        self.write_all(&wire).await?;
        self.flush().await
    }

    /// Begin a chunked streaming response; follow with `write_chunk`
    /// calls and a final `finish_chunked`.
    pub async fn write_chunked_head(
        &mut self,
        response: &HttpResponse,
        keep_alive: bool,
    ) -> Result<()> {
        let head = response.encode_chunked_head(keep_alive);
        self.write_all(&head).await
    }

    /// Stream one body chunk. Empty input is a no-op (an empty chunk
    /// would terminate the coding).
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut wire = BytesMut::with_capacity(data.len() + 16);
        chunked::encode_chunk(data, &mut wire);
        self.write_all(&wire).await
    }

    /// Terminate a chunked response and flush.
    pub async fn finish_chunked(&mut self) -> Result<()> {
        let mut wire = BytesMut::with_capacity(8);
        chunked::encode_chunk(&[], &mut wire);
        self.write_all(&wire).await?;
        self.flush().await
    }

    /// Stage bytes on the writer, flushing early past the high
    /// watermark so a slow reader cannot pile up unbounded output.
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.staged += data.len();
        if self.staged > OUTBOUND_HIGH_WATERMARK {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.stream.flush().await?;
        self.staged = 0;
        Ok(())
    }

    /// Drained below the low watermark.
    pub fn is_drained(&self) -> bool {
        self.staged < OUTBOUND_LOW_WATERMARK
    }
}
