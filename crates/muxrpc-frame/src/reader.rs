use std::io::{ErrorKind, Read};

use bytes::{Bytes, BytesMut};
use muxrpc_transport::WireStream;
use tracing::warn;

use crate::codec::{decode_frame, strip_terminator, FrameConfig, Message, WireCodec, TERMINATOR};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete line frames from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete frames.
/// Bytes that arrived before a read timeout stay buffered for the next call.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    /// Bytes of `buf` already searched for a terminator.
    scanned: usize,
    /// Dropping the tail of an oversized line up to its terminator.
    discarding: bool,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            scanned: 0,
            discarding: false,
            config,
        }
    }

    /// Read the next complete frame (blocking), without its terminator.
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached. A
    /// read timeout surfaces as `FrameError::Io` (see [`FrameError::is_timeout`]).
    pub fn read_frame(&mut self) -> Result<Bytes> {
        loop {
            if let Some(frame) = self.split_frame()? {
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Read and decode the next frame with `codec`.
    pub fn read_message(&mut self, codec: &dyn WireCodec) -> Result<Message> {
        let frame = self.read_frame()?;
        decode_frame(codec, &frame)
    }

    fn split_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            let max = self.config.max_frame_size;
            let found = self.buf[self.scanned..]
                .iter()
                .position(|b| *b == TERMINATOR)
                .map(|pos| self.scanned + pos);

            let Some(pos) = found else {
                if self.discarding {
                    self.buf.clear();
                    self.scanned = 0;
                    return Ok(None);
                }
                self.scanned = self.buf.len();
                if self.buf.len() > max {
                    let size = self.buf.len();
                    warn!(size, max, "dropping oversized frame");
                    self.buf.clear();
                    self.scanned = 0;
                    self.discarding = true;
                    return Err(FrameError::FrameTooLarge { size, max });
                }
                return Ok(None);
            };

            let line = self.buf.split_to(pos + 1).freeze();
            self.scanned = 0;
            if self.discarding {
                self.discarding = false;
                continue;
            }

            let body_len = strip_terminator(&line).len();
            if body_len > max {
                warn!(size = body_len, max, "dropping oversized frame");
                return Err(FrameError::FrameTooLarge {
                    size: body_len,
                    max,
                });
            }
            return Ok(Some(line.slice(..body_len)));
        }
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<WireStream> {
    /// Create a frame reader for `WireStream` and apply read timeout from config.
    pub fn with_config_wire(inner: WireStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }

    /// Change the read timeout of the underlying stream.
    pub fn set_read_timeout(&mut self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.inner
            .set_read_timeout(timeout)
            .map_err(transport_to_frame_error)?;
        self.config.read_timeout = timeout;
        Ok(())
    }
}

pub(crate) fn transport_to_frame_error(err: muxrpc_transport::TransportError) -> FrameError {
    match err {
        muxrpc_transport::TransportError::Io(io)
        | muxrpc_transport::TransportError::Accept(io) => FrameError::Io(io),
        muxrpc_transport::TransportError::Bind { source, .. }
        | muxrpc_transport::TransportError::Connect { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}
