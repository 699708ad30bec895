use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use muxrpc_frame::{ArrayCodec, KeyedCodec, WireCodec};

use crate::exit::{CliError, CliResult, INTERNAL, USAGE};
use crate::logging::LogLevel;
use crate::output::OutputFormat;

pub mod call;
pub mod version;
pub mod worker;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the built-in demo methods on a TCP port.
    Worker(WorkerArgs),
    /// Call one method, starting a local worker unless --target is given.
    Call(CallArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat, log_level: LogLevel) -> CliResult<i32> {
    match command {
        Command::Worker(args) => worker::run(args),
        Command::Call(args) => call::run(args, format, log_level),
        Command::Version(args) => version::run(args),
    }
}

/// Record layout on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum CodecArg {
    /// `[id, method, args]` / `[id, isFinal, payload]`.
    #[default]
    Array,
    /// Objects with named fields.
    Keyed,
}

impl CodecArg {
    pub fn codec(self) -> Arc<dyn WireCodec> {
        match self {
            CodecArg::Array => Arc::new(ArrayCodec),
            CodecArg::Keyed => Arc::new(KeyedCodec),
        }
    }

    pub fn as_arg(self) -> &'static str {
        match self {
            CodecArg::Array => "array",
            CodecArg::Keyed => "keyed",
        }
    }
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Host to bind.
    #[arg(long, default_value = muxrpc_transport::DEFAULT_HOST)]
    pub host: String,
    /// Port to bind (0 picks a free one).
    #[arg(long, default_value_t = 0)]
    pub port: u16,
    /// Record layout on the wire.
    #[arg(long, value_enum, default_value_t = CodecArg::Array)]
    pub codec: CodecArg,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Method to call.
    pub method: String,
    /// Arguments, each parsed as JSON (falls back to a plain string).
    pub args: Vec<String>,
    /// Connect to a running worker at host:port instead of starting one.
    #[arg(long, env = "MUXRPC_TARGET")]
    pub target: Option<String>,
    /// Print partial replies as they arrive.
    #[arg(long)]
    pub stream: bool,
    /// Record layout on the wire.
    #[arg(long, value_enum, default_value_t = CodecArg::Array)]
    pub codec: CodecArg,
    /// Line sent right after connecting.
    #[arg(long)]
    pub preamble: Option<String>,
    /// Port for the local worker (default: a free one).
    #[arg(long)]
    pub port: Option<u16>,
    /// Maximum time to wait for the final reply (e.g. 30s, 500ms).
    #[arg(long, default_value = "30s")]
    pub timeout: String,
    /// Maximum time for the connection to become usable.
    #[arg(long, default_value = "5s")]
    pub open_timeout: String,
    /// Keepalive interval; 0 disables it.
    #[arg(long, default_value = "30s")]
    pub keepalive: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        _ => Err(CliError::new(
            USAGE,
            format!("unsupported duration unit: {unit}"),
        )),
    }
}

/// Like [`parse_duration`], but `0` means "off".
pub(crate) fn parse_optional_duration(input: &str) -> CliResult<Option<Duration>> {
    if matches!(input.trim(), "0" | "0s" | "0ms") {
        return Ok(None);
    }
    parse_duration(input).map(Some)
}

pub(crate) fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert_eq!(parse_duration("").unwrap_err().code, USAGE);
    }

    #[test]
    fn zero_keepalive_disables_it() {
        assert_eq!(parse_optional_duration("0").unwrap(), None);
        assert_eq!(
            parse_optional_duration("250ms").unwrap(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn codec_arg_round_trips_through_flag_value() {
        for codec in CodecArg::value_variants() {
            assert_eq!(CodecArg::from_str(codec.as_arg(), false).unwrap(), *codec);
        }
    }
}
