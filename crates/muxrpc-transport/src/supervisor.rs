//! Local worker process supervision.
//!
//! A worker is launched in its own process group with stdout/stderr sent to
//! a per-port log file. Termination signals the whole group so that any
//! sub-workers the worker started are reaped along with it. Dropping a
//! [`WorkerProcess`] terminates its group.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use tracing::{debug, info, warn};

use crate::error::SpawnError;

/// Placeholder replaced by the worker host in arguments and environment values.
pub const HOST_PLACEHOLDER: &str = "{host}";
/// Placeholder replaced by the worker port in arguments and environment values.
pub const PORT_PLACEHOLDER: &str = "{port}";

const LOG_TAIL_BYTES: u64 = 2048;

/// How to launch a worker program.
///
/// Arguments and environment values may contain [`HOST_PLACEHOLDER`] and
/// [`PORT_PLACEHOLDER`]; they are substituted at spawn time. This covers
/// workers that take `--host/--port` flags as well as workers that read
/// `HOST`/`PORT` from their environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Human-readable command line with placeholders substituted.
    pub fn display(&self, host: &str, port: u16) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&substitute(arg, host, port));
        }
        line
    }

    fn build(&self, host: &str, port: u16) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().map(|arg| substitute(arg, host, port)));
        for (key, value) in &self.env {
            cmd.env(key, substitute(value, host, port));
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

fn substitute(template: &str, host: &str, port: u16) -> String {
    template
        .replace(HOST_PLACEHOLDER, host)
        .replace(PORT_PLACEHOLDER, &port.to_string())
}

/// A running local worker and the resources tied to it.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    host: String,
    port: u16,
    log_path: PathBuf,
    terminated: bool,
}

/// Launch `command` detached in its own process group.
///
/// stdin is closed; stdout and stderr are both redirected to `log_path`,
/// which is truncated first.
pub fn spawn(
    command: &WorkerCommand,
    host: &str,
    port: u16,
    log_path: &Path,
) -> Result<WorkerProcess, SpawnError> {
    let log = File::create(log_path).map_err(|e| SpawnError::LogFile {
        path: log_path.to_path_buf(),
        source: e,
    })?;
    let log_err = log.try_clone().map_err(|e| SpawnError::LogFile {
        path: log_path.to_path_buf(),
        source: e,
    })?;

    let mut cmd = command.build(host, port);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = cmd.spawn().map_err(|e| SpawnError::Launch {
        program: command.program.display().to_string(),
        source: e,
    })?;

    info!(
        pid = child.id(),
        port,
        log = %log_path.display(),
        command = %command.display(host, port),
        "spawned worker"
    );

    Ok(WorkerProcess {
        child,
        host: host.to_string(),
        port,
        log_path: log_path.to_path_buf(),
        terminated: false,
    })
}

impl WorkerProcess {
    /// OS process id of the group leader (also the process group id on Unix).
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` the worker was told to listen on.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Non-blocking exit check. `Ok(None)` while the worker is running.
    pub fn try_exit(&mut self) -> Result<Option<ExitStatus>, SpawnError> {
        Ok(self.child.try_wait()?)
    }

    /// Liveness probe used by keepalive.
    pub fn is_alive(&mut self) -> bool {
        !self.terminated && matches!(self.child.try_wait(), Ok(None))
    }

    /// Build the error reported when the worker exits before it is usable.
    pub fn exited_error(&self, status: ExitStatus) -> SpawnError {
        let tail = read_log_tail(&self.log_path);
        SpawnError::Exited {
            status: status.to_string(),
            log_path: self.log_path.clone(),
            log_tail: if tail.is_empty() {
                String::new()
            } else {
                format!("\n{tail}")
            },
        }
    }

    /// Kill the entire process group and reap the leader.
    ///
    /// Idempotent: terminating an already terminated or exited group is a no-op.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        #[cfg(unix)]
        if let Err(err) = kill_group(self.child.id()) {
            warn!(pid = self.child.id(), error = %err, "failed to signal worker process group");
        }

        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }

        match self.child.wait() {
            Ok(status) => debug!(pid = self.child.id(), %status, "worker reaped"),
            Err(err) => debug!(pid = self.child.id(), error = %err, "worker reap failed"),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;

    // SAFETY: killpg only takes integer arguments; an invalid or stale group id
    // is reported through errno, never through memory unsafety.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Group already gone.
        return Ok(());
    }
    Err(err)
}

/// Ask the OS for a currently free port on `host`.
///
/// The port is released before returning, so another process may still take
/// it before the worker binds.
pub fn find_free_port(host: &str) -> Result<u16, SpawnError> {
    let addr = format!("{host}:0");
    let listener = TcpListener::bind(&addr).map_err(|e| SpawnError::PortUnavailable {
        addr: addr.clone(),
        source: e,
    })?;
    let port = listener.local_addr()?.port();
    Ok(port)
}

/// Fail fast if `host:port` is already bound by someone else.
pub fn ensure_port_available(host: &str, port: u16) -> Result<(), SpawnError> {
    let addr = format!("{host}:{port}");
    TcpListener::bind(&addr)
        .map(drop)
        .map_err(|e| SpawnError::PortUnavailable { addr, source: e })
}

/// Default per-port log location: `<dir>/muxrpc-worker.<port>.log`.
pub fn default_log_path(dir: Option<&Path>, port: u16) -> PathBuf {
    let dir = dir
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);
    dir.join(format!("muxrpc-worker.{port}.log"))
}

fn read_log_tail(path: &Path) -> String {
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if len > LOG_TAIL_BYTES && file.seek(SeekFrom::Start(len - LOG_TAIL_BYTES)).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}
