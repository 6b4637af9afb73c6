//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Line-framed client connections
//!
//! A [`LineConnection`] is the unit the acceptor hands to the relay: an
//! inbound byte stream and an outbound byte sink, type-erased so TCP sockets
//! and in-memory duplex pipes travel the same path. The relay frames the
//! inbound half with [`LossyLinesCodec`] and the outbound half with
//! [`LinesCodec`] when the session is opened.

use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{
    AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead, FramedWrite, LinesCodec,
    LinesCodecError,
};
use tracing::debug;

/// Type-erased inbound half of a connection
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Type-erased outbound half of a connection
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Stream of decoded inbound lines
pub type LineStream = FramedRead<BoxedReader, LossyLinesCodec>;

/// Sink accepting outbound lines; each line is written with a trailing `\n`
pub type LineSink = FramedWrite<BoxedWriter, LinesCodec>;

/// An accepted client link, not yet framed or registered
pub struct LineConnection {
    reader: BoxedReader,
    writer: BoxedWriter,
    peer_addr: Option<SocketAddr>,
}

impl LineConnection {
    /// Build a connection from separate read and write halves
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer_addr: None,
        }
    }

    /// Build a connection from a single bidirectional stream
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }

    /// Wrap an accepted TCP socket
    ///
    /// `peer_addr` is the address reported by `accept`, so a peer that is
    /// already gone cannot fail the wrap.
    pub fn wrap(socket: TcpStream, peer_addr: SocketAddr) -> Self {
        let (reader, writer) = socket.into_split();
        debug!(peer_addr = %peer_addr, "Wrapped TCP connection");
        Self::new(reader, writer).with_peer_addr(peer_addr)
    }

    /// Attach the remote address
    pub fn with_peer_addr(mut self, peer_addr: SocketAddr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }

    /// Get the peer address, if the transport has one
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Frame both halves for line I/O
    ///
    /// Inbound lines longer than `max_line_length` bytes fail the stream.
    pub fn framed(self, max_line_length: usize) -> (LineStream, LineSink) {
        let reader = FramedRead::new(
            self.reader,
            LossyLinesCodec::new_with_max_length(max_line_length),
        );
        let writer = FramedWrite::new(self.writer, LinesCodec::new());
        (reader, writer)
    }
}

impl std::fmt::Debug for LineConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineConnection")
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Newline-delimited decoder that never rejects a line for its encoding
///
/// Bytes that are not valid UTF-8 become U+FFFD. A trailing `\r` is
/// stripped. Lines longer than the maximum fail with `InvalidData`.
#[derive(Debug, Clone)]
pub struct LossyLinesCodec {
    inner: AnyDelimiterCodec,
}

impl LossyLinesCodec {
    /// Create a decoder that accepts lines of at most `max_length` bytes
    pub fn new_with_max_length(max_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), max_length),
        }
    }
}

impl Decoder for LossyLinesCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<String>> {
        self.inner
            .decode(src)
            .map(|chunk| chunk.map(into_line))
            .map_err(chunk_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<String>> {
        self.inner
            .decode_eof(src)
            .map(|chunk| chunk.map(into_line))
            .map_err(chunk_error)
    }
}

fn into_line(chunk: Bytes) -> String {
    let bytes = chunk.strip_suffix(b"\r").unwrap_or(&chunk[..]);
    String::from_utf8_lossy(bytes).into_owned()
}

fn chunk_error(error: AnyDelimiterCodecError) -> io::Error {
    match error {
        AnyDelimiterCodecError::MaxChunkLengthExceeded => line_too_long(),
        AnyDelimiterCodecError::Io(e) => e,
    }
}

fn line_too_long() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "line exceeds maximum length")
}

/// Flatten a codec error into the I/O error taxonomy used by the relay
pub(crate) fn into_io_error(error: LinesCodecError) -> io::Error {
    match error {
        LinesCodecError::MaxLineLengthExceeded => line_too_long(),
        LinesCodecError::Io(e) => e,
    }
}
