//! Byte-stream transport wrapper.
//!
//! [`LinkStream`] wraps one established connection-oriented link (TCP
//! standing in for the radio's RFCOMM-style stream) and splits into a
//! framed reader and a writer. Closing either half is the cancellation
//! primitive: a blocked read observes the close as an error and the
//! owning worker tears itself down.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::warn;

use crate::core::constants::{FRAME_MARKER_SIZE, FRAME_SIZE_FIELD};
use crate::core::SessionError;
use crate::wire::{Frame, scan_marker};

/// One established byte-stream link to a remote device.
#[derive(Debug)]
pub struct LinkStream {
    stream: TcpStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl LinkStream {
    /// Wrap an established TCP stream.
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        Ok(Self {
            stream,
            peer_addr,
            local_addr,
        })
    }

    /// Connect to a remote endpoint.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::from_tcp(stream)
    }

    /// Remote endpoint address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Local endpoint address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Split into the two session loop halves.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (read, write) = self.stream.into_split();
        (FrameReader::new(read), FrameWriter { half: write })
    }
}

/// Reads frames off a byte stream, resynchronizing on the marker.
#[derive(Debug)]
pub struct FrameReader {
    half: OwnedReadHalf,
    buf: Vec<u8>,
}

impl FrameReader {
    fn new(half: OwnedReadHalf) -> Self {
        Self {
            half,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Read the next well-formed frame.
    ///
    /// Malformed spans are skipped with a warning; only transport
    /// closure ends the stream, surfaced as
    /// [`SessionError::TransportClosed`].
    pub async fn next_frame(&mut self) -> Result<Frame, SessionError> {
        loop {
            // Drop garbage ahead of the next marker, keeping a partial
            // marker tail alive for the next read.
            match scan_marker(&self.buf) {
                Some(0) => {}
                Some(offset) => {
                    warn!(skipped = offset, "resynchronized to frame marker");
                    self.buf.drain(..offset);
                }
                None => {
                    let keep = self.buf.len().min(FRAME_MARKER_SIZE - 1);
                    let start = self.buf.len() - keep;
                    self.buf.drain(..start);
                    self.fill().await?;
                    continue;
                }
            }

            let prefix = FRAME_MARKER_SIZE + FRAME_SIZE_FIELD;
            if self.buf.len() < prefix {
                self.fill().await?;
                continue;
            }
            let declared = u16::from_be_bytes([
                self.buf[FRAME_MARKER_SIZE],
                self.buf[FRAME_MARKER_SIZE + 1],
            ]) as usize;
            if self.buf.len() < prefix + declared {
                self.fill().await?;
                continue;
            }

            match Frame::decode(&self.buf[..prefix + declared]) {
                Ok((frame, consumed)) => {
                    self.buf.drain(..consumed);
                    return Ok(frame);
                }
                Err(err) => {
                    warn!(%err, "dropping malformed frame");
                    self.buf.drain(..prefix + declared);
                }
            }
        }
    }

    async fn fill(&mut self) -> Result<(), SessionError> {
        let mut chunk = [0u8; 2048];
        let n = self.half.read(&mut chunk).await?;
        if n == 0 {
            return Err(SessionError::TransportClosed);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}

/// Writes encoded frames onto the stream.
#[derive(Debug)]
pub struct FrameWriter {
    half: OwnedWriteHalf,
}

impl FrameWriter {
    /// Write one already-encoded frame.
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.half.write_all(bytes).await
    }

    /// Flush and close the write side.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.half.shutdown().await
    }
}
