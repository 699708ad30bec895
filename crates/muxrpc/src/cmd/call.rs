use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use muxrpc_channel::{ChannelConfig, ChannelError, ConnectConfig, RpcServer};
use muxrpc_transport::{WorkerCommand, HOST_PLACEHOLDER, PORT_PLACEHOLDER};
use serde_json::Value;
use tracing::debug;

use crate::cmd::{install_ctrlc_handler, parse_duration, parse_optional_duration, CallArgs};
use crate::exit::{
    channel_error, io_error, CliError, CliResult, FAILURE, INTERNAL, INTERRUPTED, SUCCESS,
    TRANSPORT_ERROR,
};
use crate::logging::LogLevel;
use crate::output::{print_reply, OutputFormat};

/// How often the foreground checks for Ctrl-C while a call is in flight.
const INTERRUPT_POLL: Duration = Duration::from_millis(50);

pub fn run(args: CallArgs, format: OutputFormat, log_level: LogLevel) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let config = channel_config(&args, log_level)?;
    let call_args = args.args.iter().map(|arg| parse_arg(arg)).collect::<Vec<_>>();

    let rpc = RpcServer::open(args.target.as_deref(), config)
        .map_err(|err| channel_error("connect failed", err))?;
    let worker_log = rpc.channel().connection().worker_log();
    if let (Some(pid), Some(log)) = (rpc.channel().connection().worker_pid(), &worker_log) {
        debug!(pid, log = %log.display(), "using local worker");
    }

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(Arc::clone(&running))?;

    let result = if args.stream {
        call_streaming(&rpc, &args.method, call_args, timeout, &running, format)
    } else {
        call_blocking(&rpc, &args.method, call_args, timeout, &running)
    };
    rpc.close();

    let payload = result.map_err(|err| with_worker_log(err, worker_log.as_deref()))?;
    if let Some(message) = error_message(&payload) {
        return Err(CliError::new(FAILURE, format!("{} failed: {message}", args.method)));
    }
    if !args.stream {
        print_reply(&args.method, true, &payload, format);
    }
    Ok(SUCCESS)
}

fn channel_config(args: &CallArgs, log_level: LogLevel) -> CliResult<ChannelConfig> {
    let worker = if args.target.is_none() {
        Some(local_worker(args, log_level)?)
    } else {
        None
    };

    Ok(ChannelConfig {
        connect: ConnectConfig {
            port: args.port,
            worker,
            open_timeout: parse_duration(&args.open_timeout)?,
            ..ConnectConfig::default()
        },
        codec: args.codec.codec(),
        keepalive_interval: parse_optional_duration(&args.keepalive)?,
        preamble: args.preamble.clone(),
        ..ChannelConfig::default()
    })
}

/// This binary, re-run as `muxrpc worker` on the chosen host and port.
fn local_worker(args: &CallArgs, log_level: LogLevel) -> CliResult<WorkerCommand> {
    let exe = std::env::current_exe()
        .map_err(|err| io_error("cannot locate the muxrpc executable", err))?;
    Ok(WorkerCommand::new(exe).args([
        "--log-level",
        log_level.as_arg(),
        "worker",
        "--host",
        HOST_PLACEHOLDER,
        "--port",
        PORT_PLACEHOLDER,
        "--codec",
        args.codec.as_arg(),
    ]))
}

/// The blocking wait runs on a helper thread so Ctrl-C can close the
/// channel, which fails the wait and reaps the worker.
fn call_blocking(
    rpc: &RpcServer,
    method: &str,
    args: Vec<Value>,
    timeout: Duration,
    running: &AtomicBool,
) -> CliResult<Value> {
    let waiter = rpc.clone();
    let method_name = method.to_string();
    let handle = thread::Builder::new()
        .name("muxrpc-call".to_string())
        .spawn(move || waiter.call_sync_timeout(&method_name, args, timeout))
        .map_err(|err| io_error("cannot start call thread", err))?;

    while !handle.is_finished() {
        if !running.load(Ordering::SeqCst) {
            rpc.close();
            let _ = handle.join();
            return Err(CliError::new(INTERRUPTED, "interrupted"));
        }
        thread::sleep(INTERRUPT_POLL);
    }

    handle
        .join()
        .map_err(|_| CliError::new(INTERNAL, "call thread panicked"))?
        .map_err(|err| channel_error("call failed", err))
}

/// Print every partial as it arrives; return the final payload.
fn call_streaming(
    rpc: &RpcServer,
    method: &str,
    args: Vec<Value>,
    timeout: Duration,
    running: &AtomicBool,
    format: OutputFormat,
) -> CliResult<Value> {
    let (tx, rx) = mpsc::channel::<(bool, Value)>();
    let partial_tx = tx.clone();
    let stream = rpc
        .call_stream(
            method,
            args,
            move |payload| {
                let _ = partial_tx.send((false, payload));
            },
            move |payload| {
                let _ = tx.send((true, payload));
            },
        )
        .map_err(|err| channel_error("call failed", err))?;

    let mut final_payload = None;
    let done = rpc
        .run_until(
            || {
                for (is_final, payload) in rx.try_iter() {
                    if is_final {
                        final_payload = Some(payload);
                    } else {
                        print_reply(method, false, &payload, format);
                    }
                }
                final_payload.is_some() || !running.load(Ordering::SeqCst)
            },
            timeout,
        )
        .map_err(|err| channel_error("call failed", err))?;

    match final_payload {
        Some(payload) => {
            print_reply(method, true, &payload, format);
            Ok(payload)
        }
        None => {
            stream.delete();
            if done {
                Err(CliError::new(INTERRUPTED, "interrupted"))
            } else {
                Err(channel_error("call failed", ChannelError::Timeout(timeout)))
            }
        }
    }
}

/// Point at the local worker's log when the connection to it was lost.
fn with_worker_log(err: CliError, log: Option<&Path>) -> CliError {
    match log {
        Some(log) if err.code == TRANSPORT_ERROR => CliError::new(
            err.code,
            format!("{}; worker log: {}", err.message, log.display()),
        ),
        _ => err,
    }
}

/// Arguments are JSON when they parse as JSON, plain strings otherwise.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Worker-side failures come back as `{"error": message}`.
fn error_message(payload: &Value) -> Option<&str> {
    let object = payload.as_object()?;
    if object.len() != 1 {
        return None;
    }
    object.get("error")?.as_str()
}
