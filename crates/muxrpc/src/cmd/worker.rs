use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use muxrpc_channel::{HandlerResult, ReplySink, RouteTable, Router, WorkerServer};
use serde_json::{json, Value};
use tracing::info;

use crate::cmd::{install_ctrlc_handler, WorkerArgs};
use crate::exit::{channel_error, CliResult, SUCCESS};

/// Longest delay `sleep` honours.
const MAX_SLEEP_MS: u64 = 60_000;

pub fn run(args: WorkerArgs) -> CliResult<i32> {
    let routes = builtin_routes().map_err(|err| channel_error("route setup failed", err))?;
    let server = WorkerServer::bind(&args.host, args.port, routes)
        .map_err(|err| channel_error("bind failed", err))?
        .with_codec(args.codec.codec());

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(Arc::clone(&running))?;

    // Parents that started us with port 0 read the address from here.
    let mut out = std::io::stdout();
    let _ = writeln!(out, "listening on {}", server.local_addr());
    let _ = out.flush();

    server
        .serve(running)
        .map_err(|err| channel_error("worker failed", err))?;
    info!("worker exiting");
    Ok(SUCCESS)
}

/// Demo methods served by `muxrpc worker`.
pub fn builtin_routes() -> muxrpc_channel::Result<RouteTable> {
    Router::new()
        .unary("echo", echo)
        .unary("sum", sum)
        .unary("sleep", sleep)
        .streaming("count", count)
        .build()
}

fn echo(args: Vec<Value>) -> HandlerResult {
    Ok(match args.len() {
        0 => Value::Null,
        1 => args.into_iter().next().unwrap_or(Value::Null),
        _ => Value::Array(args),
    })
}

fn sum(args: Vec<Value>) -> HandlerResult {
    let mut total = 0f64;
    for arg in &args {
        total += arg
            .as_f64()
            .ok_or_else(|| format!("sum expects numbers, got {arg}"))?;
    }
    if total.fract() == 0.0 && total.abs() < i64::MAX as f64 {
        return Ok(json!(total as i64));
    }
    Ok(json!(total))
}

fn sleep(args: Vec<Value>) -> HandlerResult {
    let ms = args
        .first()
        .and_then(Value::as_u64)
        .ok_or("sleep expects a millisecond count")?;
    let ms = ms.min(MAX_SLEEP_MS);
    thread::sleep(Duration::from_millis(ms));
    Ok(json!(ms))
}

/// Emits `1..=n` as partial replies, then `n` as the final one.
fn count(args: Vec<Value>, sink: &ReplySink) -> HandlerResult {
    let n = args
        .first()
        .and_then(Value::as_u64)
        .ok_or("count expects a non-negative integer")?;
    let delay = args.get(1).and_then(Value::as_u64).unwrap_or(0);
    for i in 1..=n {
        sink.partial(json!(i))?;
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay.min(MAX_SLEEP_MS)));
        }
    }
    Ok(json!(n))
}
