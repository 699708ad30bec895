use std::io::{ErrorKind, Write};

use bytes::{BufMut, BytesMut};
use muxrpc_transport::WireStream;

use crate::codec::{encode_frame, FrameConfig, Message, WireCodec, TERMINATOR};
use crate::error::{FrameError, Result};
use crate::reader::transport_to_frame_error;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete line frames to any `Write` stream.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Encode `message` with `codec` and write it as one frame (blocking).
    pub fn write_message(&mut self, codec: &dyn WireCodec, message: &Message) -> Result<()> {
        self.buf.clear();
        encode_frame(codec, message, &mut self.buf)?;
        self.check_size(self.buf.len() - 1)?;
        self.write_buffered()
    }

    /// Write a raw line. `line` must not contain a line break.
    ///
    /// Used for the session preamble, which precedes any record.
    pub fn write_line(&mut self, line: &[u8]) -> Result<()> {
        if line.iter().any(|b| *b == b'\n' || *b == b'\r') {
            return Err(FrameError::Malformed(
                "line contains a line break".to_string(),
            ));
        }
        self.check_size(line.len())?;

        self.buf.clear();
        self.buf.reserve(line.len() + 1);
        self.buf.put_slice(line);
        self.buf.put_u8(TERMINATOR);
        self.write_buffered()
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.config.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size,
                max: self.config.max_frame_size,
            });
        }
        Ok(())
    }

    fn write_buffered(&mut self) -> Result<()> {
        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl FrameWriter<WireStream> {
    /// Create a frame writer for `WireStream` and apply write timeout from config.
    pub fn with_config_wire(inner: WireStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::codec::{ArrayCodec, Call, Reply, Response};
    use crate::keyed::KeyedCodec;
    use crate::reader::FrameReader;

    fn written(writer: FrameWriter<Cursor<Vec<u8>>>) -> Vec<u8> {
        writer.into_inner().into_inner()
    }

    #[test]
    fn write_single_call() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));

        writer
            .write_message(
                &ArrayCodec,
                &Call::new(0, "echo", vec![json!("hi")]).into(),
            )
            .unwrap();

        assert_eq!(written(writer), b"[0,\"echo\",[\"hi\"]]\n");
    }

    #[test]
    fn write_keepalive() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        writer
            .write_message(&ArrayCodec, &Call::keepalive().into())
            .unwrap();
        assert_eq!(written(writer), b"[-1,\"keeplive\",[]]\n");
    }

    #[test]
    fn write_multiple_frames_reads_back_in_order() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        let sent: Vec<Message> = vec![
            Response::new(1, Reply::Partial(json!("a"))).into(),
            Response::new(1, Reply::Partial(json!("b\nc"))).into(),
            Response::new(1, Reply::Final(json!(null))).into(),
        ];
        for message in &sent {
            writer.write_message(&ArrayCodec, message).unwrap();
        }

        let mut reader = FrameReader::new(Cursor::new(written(writer)));
        for expected in &sent {
            assert_eq!(&reader.read_message(&ArrayCodec).unwrap(), expected);
        }
    }

    #[test]
    fn keyed_codec_frames() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        let call: Message = Call::new(3, "sum", vec![json!(1), json!(2)]).into();
        writer.write_message(&KeyedCodec, &call).unwrap();

        let mut reader = FrameReader::new(Cursor::new(written(writer)));
        assert_eq!(reader.read_message(&KeyedCodec).unwrap(), call);
    }

    #[test]
    fn frame_too_large_rejected() {
        let cfg = FrameConfig {
            max_frame_size: 8,
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::<u8>::new()), cfg);

        let err = writer
            .write_message(&ArrayCodec, &Call::new(1, "oversized", Vec::new()).into())
            .unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
        assert!(written(writer).is_empty());
    }

    #[test]
    fn write_line_appends_terminator() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.write_line(b"vimrpc").unwrap();
        assert_eq!(written(writer), b"vimrpc\n");
    }

    #[test]
    fn write_line_rejects_embedded_break() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        let err = writer.write_line(b"two\nlines").unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn flush_propagates() {
        let sink = FlushTrackingWriter::default();
        let flag = Arc::clone(&sink.flushed);
        let mut writer = FrameWriter::new(sink);

        writer.write_line(b"x").unwrap();

        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn zero_length_write_is_connection_closed() {
        let mut writer = FrameWriter::new(ZeroWriter);
        let err = writer.write_line(b"x").unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn handles_interrupted_write_and_flush() {
        let writer_impl = InterruptedWriteThenFlush {
            wrote_once: false,
            flush_interrupted: false,
            data: Vec::new(),
        };

        let mut writer = FrameWriter::new(writer_impl);
        writer.write_line(b"retry").unwrap();

        let inner = writer.into_inner();
        assert_eq!(inner.data, b"retry\n");
    }

    #[test]
    fn write_timeout_surfaces_as_io() {
        let mut writer = FrameWriter::new(TimedOutWriter);
        let err = writer.write_line(b"stuck").unwrap_err();
        assert!(err.is_timeout());
    }

    #[derive(Default)]
    struct FlushTrackingWriter {
        data: Vec<u8>,
        flushed: Arc<AtomicBool>,
    }

    impl Write for FlushTrackingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct TimedOutWriter;

    impl Write for TimedOutWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::WouldBlock))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct InterruptedWriteThenFlush {
        wrote_once: bool,
        flush_interrupted: bool,
        data: Vec<u8>,
    }

    impl Write for InterruptedWriteThenFlush {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if !self.wrote_once {
                self.wrote_once = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            if !self.flush_interrupted {
                self.flush_interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            Ok(())
        }
    }
}
