use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use muxrpc_frame::{FrameConfig, FrameError, FrameReader, FrameWriter, Message, WireCodec};
use muxrpc_transport::supervisor::{self, WorkerCommand, WorkerProcess};
use muxrpc_transport::{TcpEndpoint, TransportError, WireStream, DEFAULT_HOST};
use tracing::{debug, info, warn};

use crate::error::{ChannelError, Result};

/// Connection state as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Open,
    /// An I/O error or a dead worker made the connection unusable.
    Failed,
    /// Closed locally or by the peer.
    Closed,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Status::Open,
            1 => Status::Failed,
            _ => Status::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Status::Open => 0,
            Status::Failed => 1,
            Status::Closed => 2,
        }
    }
}

/// Result of a single bounded read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One complete frame, terminator stripped.
    Frame(Bytes),
    /// Nothing arrived within the timeout; the connection is still usable.
    Timeout,
    /// The connection is closed or failed.
    Closed,
}

/// How to reach (or start) a worker.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Host used both for local workers and for free-port selection.
    pub host: String,
    /// Fixed port for a local worker. `None` picks a free one.
    pub port: Option<u16>,
    /// Command that starts a local worker when no target is given.
    pub worker: Option<WorkerCommand>,
    /// Directory for worker log files. Default: the system temp dir.
    pub log_dir: Option<PathBuf>,
    /// Upper bound for the connection to become usable.
    pub open_timeout: Duration,
    /// Pause between connect attempts while a local worker starts up.
    pub retry_interval: Duration,
    /// Write timeout on the socket. `None` blocks indefinitely.
    pub write_timeout: Option<Duration>,
    /// Largest frame accepted in either direction.
    pub max_frame_size: usize,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: None,
            worker: None,
            log_dir: None,
            open_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(25),
            write_timeout: Some(Duration::from_secs(10)),
            max_frame_size: muxrpc_frame::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// One physical duplex connection to a worker.
///
/// Reads and writes are guarded separately: one reader at a time, and every
/// frame is written whole under the writer lock.
pub struct Connection {
    reader: Mutex<FrameReader<WireStream>>,
    writer: Mutex<FrameWriter<WireStream>>,
    control: WireStream,
    status: AtomicU8,
    worker: Mutex<Option<WorkerProcess>>,
    peer: String,
}

impl Connection {
    /// Open a connection.
    ///
    /// With a `target` (`host:port`) this connects directly. Without one, a
    /// local worker is spawned from `config.worker` and polled until it
    /// accepts, bounded by `config.open_timeout`.
    pub fn open(target: Option<&str>, config: &ConnectConfig) -> Result<Self> {
        match target {
            Some(target) => Self::open_remote(target, config),
            None => Self::open_local(config),
        }
    }

    fn open_remote(target: &str, config: &ConnectConfig) -> Result<Self> {
        let stream = TcpEndpoint::connect_timeout(target, config.open_timeout)
            .map_err(|err| connect_error(target, err))?;
        info!(peer = target, "connected to remote worker");
        Self::from_stream(stream, target.to_string(), None, config)
    }

    fn open_local(config: &ConnectConfig) -> Result<Self> {
        let command = config.worker.as_ref().ok_or_else(|| {
            ChannelError::Connection("no target given and no worker command configured".to_string())
        })?;

        let host = config.host.as_str();
        let port = match config.port {
            Some(port) => {
                supervisor::ensure_port_available(host, port)?;
                port
            }
            None => supervisor::find_free_port(host)?,
        };
        let log_path = supervisor::default_log_path(config.log_dir.as_deref(), port);
        let mut worker = supervisor::spawn(command, host, port, &log_path)?;
        let addr = worker.addr();

        let deadline = Instant::now() + config.open_timeout;
        let stream = loop {
            if let Some(status) = worker.try_exit()? {
                return Err(worker.exited_error(status).into());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt = remaining.min(config.retry_interval.max(Duration::from_millis(1)));
            match TcpEndpoint::connect_timeout(&addr, attempt) {
                Ok(stream) => break stream,
                Err(err) => {
                    if Instant::now() >= deadline {
                        worker.terminate();
                        return Err(ChannelError::Connection(format!(
                            "worker at {addr} not reachable within {:?}: {err} (log: {})",
                            config.open_timeout,
                            log_path.display()
                        )));
                    }
                    debug!(%addr, error = %err, "worker not accepting yet");
                    std::thread::sleep(
                        config
                            .retry_interval
                            .min(deadline.saturating_duration_since(Instant::now())),
                    );
                }
            }
        };

        info!(pid = worker.pid(), %addr, "connected to local worker");
        Self::from_stream(stream, addr, Some(worker), config)
    }

    fn from_stream(
        stream: WireStream,
        peer: String,
        worker: Option<WorkerProcess>,
        config: &ConnectConfig,
    ) -> Result<Self> {
        let frame_config = FrameConfig {
            max_frame_size: config.max_frame_size,
            read_timeout: None,
            write_timeout: config.write_timeout,
        };
        let control = stream.try_clone()?;
        let reader_stream = stream.try_clone()?;
        let reader = FrameReader::with_config_wire(reader_stream, frame_config.clone())?;
        let writer = FrameWriter::with_config_wire(stream, frame_config)?;

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            control,
            status: AtomicU8::new(Status::Open.as_u8()),
            worker: Mutex::new(worker),
            peer,
        })
    }

    /// Current connection status.
    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.status() == Status::Open
    }

    /// `host:port` of the worker.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write one message as a single frame.
    pub fn write_message(&self, codec: &dyn WireCodec, message: &Message) -> Result<()> {
        self.ensure_open()?;
        let mut writer = lock(&self.writer);
        let written = writer.write_message(codec, message);
        self.check_write(written)
    }

    /// Write a raw line (session preamble).
    pub fn write_line(&self, line: &str) -> Result<()> {
        self.ensure_open()?;
        let mut writer = lock(&self.writer);
        let written = writer.write_line(line.as_bytes());
        self.check_write(written)
    }

    fn check_write(&self, written: muxrpc_frame::Result<()>) -> Result<()> {
        match written {
            Ok(()) => Ok(()),
            Err(
                err @ (FrameError::Malformed(_)
                | FrameError::FrameTooLarge { .. }
                | FrameError::Json(_)),
            ) => Err(err.into()),
            Err(err) => {
                self.transition(Status::Failed);
                Err(ChannelError::Connection(format!(
                    "write to {} failed: {err}",
                    self.peer
                )))
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.status() {
            Status::Open => Ok(()),
            Status::Failed => Err(ChannelError::Connection(format!(
                "connection to {} failed",
                self.peer
            ))),
            Status::Closed => Err(ChannelError::Connection(format!(
                "connection to {} is closed",
                self.peer
            ))),
        }
    }

    /// Block until the read side is free.
    pub fn lock_reader(&self) -> ReaderGuard<'_> {
        ReaderGuard {
            conn: self,
            reader: lock(&self.reader),
        }
    }

    /// Take the read side if nobody else holds it.
    pub fn try_lock_reader(&self) -> Option<ReaderGuard<'_>> {
        let reader = match self.reader.try_lock() {
            Ok(reader) => reader,
            Err(std::sync::TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(std::sync::TryLockError::WouldBlock) => return None,
        };
        Some(ReaderGuard { conn: self, reader })
    }

    /// Read one frame, waiting up to `timeout`.
    pub fn read_one(&self, timeout: Duration) -> Result<ReadOutcome> {
        self.lock_reader().read_one(timeout)
    }

    /// Check the local worker, marking the connection failed if it has died.
    ///
    /// Always true for remote workers.
    pub fn check_worker(&self) -> bool {
        let mut worker = lock(&self.worker);
        let Some(process) = worker.as_mut() else {
            return true;
        };
        if process.is_alive() {
            return true;
        }
        warn!(pid = process.pid(), log = %process.log_path().display(), "worker process is gone");
        self.transition(Status::Failed);
        false
    }

    /// Pid of the local worker, if this connection spawned one.
    pub fn worker_pid(&self) -> Option<u32> {
        lock(&self.worker).as_ref().map(WorkerProcess::pid)
    }

    /// Log file of the local worker, if this connection spawned one.
    pub fn worker_log(&self) -> Option<PathBuf> {
        lock(&self.worker)
            .as_ref()
            .map(|process| process.log_path().to_path_buf())
    }

    /// Shut the socket down and kill any local worker's process group.
    ///
    /// Idempotent.
    pub fn close(&self) {
        let previous = Status::from_u8(self.status.swap(Status::Closed.as_u8(), Ordering::AcqRel));
        if let Err(err) = self.control.shutdown() {
            debug!(peer = %self.peer, error = %err, "socket shutdown failed");
        }
        if let Some(mut worker) = lock(&self.worker).take() {
            worker.terminate();
        }
        if previous != Status::Closed {
            debug!(peer = %self.peer, "connection closed");
        }
    }

    /// Move out of `Open`; later transitions are ignored.
    fn transition(&self, to: Status) {
        let _ = self.status.compare_exchange(
            Status::Open.as_u8(),
            to.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("status", &self.status())
            .finish()
    }
}

/// Exclusive access to the read side of a [`Connection`].
pub struct ReaderGuard<'a> {
    conn: &'a Connection,
    reader: MutexGuard<'a, FrameReader<WireStream>>,
}

impl ReaderGuard<'_> {
    /// Read one frame, waiting up to `timeout`.
    ///
    /// Oversized frames are reported as errors but leave the connection
    /// usable; every other read failure closes it.
    pub fn read_one(&mut self, timeout: Duration) -> Result<ReadOutcome> {
        if !self.conn.is_open() {
            return Ok(ReadOutcome::Closed);
        }

        if self.reader.config().read_timeout != Some(timeout) {
            if let Err(err) = self.reader.set_read_timeout(Some(timeout)) {
                warn!(peer = %self.conn.peer, error = %err, "failed to set read timeout");
                self.conn.transition(Status::Failed);
                return Ok(ReadOutcome::Closed);
            }
        }

        match self.reader.read_frame() {
            Ok(frame) => Ok(ReadOutcome::Frame(frame)),
            Err(err) if err.is_timeout() => Ok(ReadOutcome::Timeout),
            Err(FrameError::ConnectionClosed) => {
                debug!(peer = %self.conn.peer, "peer closed the connection");
                self.conn.transition(Status::Closed);
                Ok(ReadOutcome::Closed)
            }
            Err(err @ FrameError::FrameTooLarge { .. }) => Err(err.into()),
            Err(err) => {
                warn!(peer = %self.conn.peer, error = %err, "read failed");
                self.conn.transition(Status::Failed);
                Ok(ReadOutcome::Closed)
            }
        }
    }

    /// Status of the connection this guard reads from.
    pub fn status(&self) -> Status {
        self.conn.status()
    }
}

fn connect_error(target: &str, err: TransportError) -> ChannelError {
    match err {
        TransportError::InvalidAddress(_) => ChannelError::Transport(err),
        other => ChannelError::Connection(format!("cannot reach {target}: {other}")),
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::thread;

    use muxrpc_frame::{ArrayCodec, Call};

    use super::*;

    fn listener() -> (TcpEndpoint, String) {
        let endpoint = TcpEndpoint::bind("127.0.0.1", 0).expect("endpoint should bind");
        let addr = endpoint.local_addr().to_string();
        (endpoint, addr)
    }

    fn test_config() -> ConnectConfig {
        ConnectConfig {
            open_timeout: Duration::from_secs(2),
            ..ConnectConfig::default()
        }
    }

    #[test]
    fn remote_write_and_read_one() {
        let (endpoint, addr) = listener();
        let peer = thread::spawn(move || {
            let stream = endpoint.accept().expect("accept should succeed");
            let mut lines = BufReader::new(stream.try_clone().expect("clone should succeed"));
            let mut line = String::new();
            lines.read_line(&mut line).expect("peer should read call");
            assert_eq!(line, "[0,\"echo\",[\"hi\"]]\n");
            let mut stream = stream;
            stream
                .write_all(b"[0,true,\"hi\"]\n")
                .expect("peer should reply");
            thread::sleep(Duration::from_millis(200));
        });

        let conn = Connection::open(Some(&addr), &test_config()).expect("open should succeed");
        assert_eq!(conn.status(), Status::Open);
        assert_eq!(conn.worker_pid(), None);
        assert_eq!(conn.worker_log(), None);

        conn.write_message(
            &ArrayCodec,
            &Call::new(0, "echo", vec![serde_json::json!("hi")]).into(),
        )
        .expect("write should succeed");

        let outcome = conn
            .read_one(Duration::from_secs(2))
            .expect("read should succeed");
        assert_eq!(outcome, ReadOutcome::Frame(Bytes::from_static(b"[0,true,\"hi\"]")));

        peer.join().expect("peer thread should finish");
    }

    #[test]
    fn read_one_times_out_while_open() {
        let (endpoint, addr) = listener();
        let peer = thread::spawn(move || {
            let _stream = endpoint.accept().expect("accept should succeed");
            thread::sleep(Duration::from_millis(300));
        });

        let conn = Connection::open(Some(&addr), &test_config()).expect("open should succeed");
        let outcome = conn
            .read_one(Duration::from_millis(30))
            .expect("read should succeed");
        assert_eq!(outcome, ReadOutcome::Timeout);
        assert!(conn.is_open());

        peer.join().expect("peer thread should finish");
    }

    #[test]
    fn peer_hangup_reports_closed() {
        let (endpoint, addr) = listener();
        let peer = thread::spawn(move || {
            let stream = endpoint.accept().expect("accept should succeed");
            drop(stream);
        });

        let conn = Connection::open(Some(&addr), &test_config()).expect("open should succeed");
        peer.join().expect("peer thread should finish");

        let outcome = conn
            .read_one(Duration::from_secs(2))
            .expect("read should succeed");
        assert_eq!(outcome, ReadOutcome::Closed);
        assert_eq!(conn.status(), Status::Closed);

        let err = conn
            .write_message(&ArrayCodec, &Call::keepalive().into())
            .unwrap_err();
        assert!(err.is_connection_lost());
    }

    #[test]
    fn close_is_idempotent_and_unblocks_reads() {
        let (endpoint, addr) = listener();
        let peer = thread::spawn(move || {
            let _stream = endpoint.accept().expect("accept should succeed");
            thread::sleep(Duration::from_millis(300));
        });

        let conn = Connection::open(Some(&addr), &test_config()).expect("open should succeed");
        conn.close();
        conn.close();
        assert_eq!(conn.status(), Status::Closed);
        assert_eq!(
            conn.read_one(Duration::from_millis(50))
                .expect("read should succeed"),
            ReadOutcome::Closed
        );

        peer.join().expect("peer thread should finish");
    }

    #[test]
    fn preamble_line_is_written_raw() {
        let (endpoint, addr) = listener();
        let peer = thread::spawn(move || {
            let stream = endpoint.accept().expect("accept should succeed");
            let mut lines = BufReader::new(stream);
            let mut line = String::new();
            lines.read_line(&mut line).expect("peer should read preamble");
            line
        });

        let conn = Connection::open(Some(&addr), &test_config()).expect("open should succeed");
        conn.write_line("vimrpc").expect("write should succeed");
        assert_eq!(peer.join().expect("peer thread should finish"), "vimrpc\n");
    }

    #[test]
    fn refused_target_is_connection_error() {
        let (endpoint, addr) = listener();
        drop(endpoint);

        let err = Connection::open(Some(&addr), &test_config()).unwrap_err();
        assert!(matches!(err, ChannelError::Connection(_)), "got {err:?}");
    }

    #[test]
    fn no_target_and_no_worker_is_connection_error() {
        let err = Connection::open(None, &test_config()).unwrap_err();
        assert!(matches!(err, ChannelError::Connection(_)), "got {err:?}");
    }

    #[cfg(unix)]
    #[test]
    fn occupied_port_fails_fast() {
        let (_endpoint, addr) = listener();
        let port = addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .expect("address should carry a port");

        let config = ConnectConfig {
            port: Some(port),
            worker: Some(WorkerCommand::new("sleep").arg("30")),
            ..test_config()
        };

        let started = Instant::now();
        let err = Connection::open(None, &config).unwrap_err();
        assert!(
            matches!(
                err,
                ChannelError::WorkerSpawn(muxrpc_transport::SpawnError::PortUnavailable { .. })
            ),
            "got {err:?}"
        );
        assert!(started.elapsed() < config.open_timeout);
    }

    #[cfg(unix)]
    #[test]
    fn worker_exiting_early_reports_log_tail() {
        let log_dir = temp_dir("early-exit");
        let config = ConnectConfig {
            worker: Some(WorkerCommand::new("sh").args(["-c", "echo boom-{port}; exit 3"])),
            log_dir: Some(log_dir.clone()),
            ..test_config()
        };

        let err = Connection::open(None, &config).unwrap_err();
        match err {
            ChannelError::WorkerSpawn(muxrpc_transport::SpawnError::Exited { log_tail, .. }) => {
                assert!(log_tail.contains("boom-"), "log tail was {log_tail:?}");
            }
            other => panic!("expected early exit, got {other:?}"),
        }

        let _ = std::fs::remove_dir_all(&log_dir);
    }

    #[cfg(unix)]
    #[test]
    fn unreachable_worker_times_out_with_connection_error() {
        let log_dir = temp_dir("unreachable");
        let config = ConnectConfig {
            worker: Some(WorkerCommand::new("sleep").arg("30")),
            log_dir: Some(log_dir.clone()),
            open_timeout: Duration::from_millis(300),
            ..ConnectConfig::default()
        };

        let started = Instant::now();
        let err = Connection::open(None, &config).unwrap_err();
        assert!(matches!(err, ChannelError::Connection(_)), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));

        let _ = std::fs::remove_dir_all(&log_dir);
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "muxrpc-conn-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir
    }
}
