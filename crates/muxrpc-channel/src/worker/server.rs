use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use muxrpc_frame::{
    decode_frame, is_keepalive, ArrayCodec, Call, FrameConfig, FrameError, FrameReader,
    FrameWriter, Message, Response, WireCodec, KEEPALIVE_METHOD,
};
use muxrpc_transport::{TcpEndpoint, WireStream};
use tracing::{debug, info, trace, warn};

use super::router::{ReplySink, RouteTable, SharedWriter};
use crate::connector::lock;
use crate::error::Result;

/// How often idle loops re-check the running flag.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Serves a [`RouteTable`] on a TCP endpoint.
///
/// Each connection gets its own reader thread; each call runs on its own
/// thread and all replies on a connection share one writer.
pub struct WorkerServer {
    endpoint: TcpEndpoint,
    routes: Arc<RouteTable>,
    codec: Arc<dyn WireCodec>,
    frame_config: FrameConfig,
}

impl WorkerServer {
    /// Bind `host:port` (port `0` picks a free one).
    pub fn bind(host: &str, port: u16, routes: RouteTable) -> Result<Self> {
        let endpoint = TcpEndpoint::bind(host, port)?;
        Ok(Self {
            endpoint,
            routes: Arc::new(routes),
            codec: Arc::new(ArrayCodec),
            frame_config: FrameConfig {
                read_timeout: Some(IDLE_POLL),
                write_timeout: Some(Duration::from_secs(10)),
                ..FrameConfig::default()
            },
        })
    }

    /// Override the record codec.
    pub fn with_codec(mut self, codec: Arc<dyn WireCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Override frame limits and the write timeout. The read timeout is
    /// always the idle poll interval.
    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.frame_config = FrameConfig {
            read_timeout: Some(IDLE_POLL),
            ..config
        };
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Accept and serve connections until `running` is cleared.
    pub fn serve(&self, running: Arc<AtomicBool>) -> Result<()> {
        info!(addr = %self.local_addr(), methods = ?self.routes.methods(), "worker serving");

        while running.load(Ordering::SeqCst) {
            let Some(stream) = self.endpoint.try_accept()? else {
                thread::sleep(IDLE_POLL.min(Duration::from_millis(20)));
                continue;
            };

            let session = Session {
                routes: Arc::clone(&self.routes),
                codec: Arc::clone(&self.codec),
                frame_config: self.frame_config.clone(),
                running: Arc::clone(&running),
            };
            let peer = stream.peer_addr();
            thread::Builder::new()
                .name("muxrpc-session".to_string())
                .spawn(move || {
                    if let Err(err) = session.run(stream) {
                        warn!(?peer, error = %err, "session ended with error");
                    }
                })?;
        }

        info!("worker stopped");
        Ok(())
    }
}

struct Session {
    routes: Arc<RouteTable>,
    codec: Arc<dyn WireCodec>,
    frame_config: FrameConfig,
    running: Arc<AtomicBool>,
}

impl Session {
    fn run(self, stream: WireStream) -> Result<()> {
        let writer_stream = stream.try_clone()?;
        writer_stream.set_write_timeout(self.frame_config.write_timeout)?;
        let writer: SharedWriter = Arc::new(Mutex::new(FrameWriter::with_config(
            Box::new(writer_stream) as Box<dyn Write + Send>,
            self.frame_config.clone(),
        )));
        let mut reader = FrameReader::with_config_wire(stream, self.frame_config.clone())?;

        let mut first = true;
        while self.running.load(Ordering::SeqCst) {
            let frame = match reader.read_frame() {
                Ok(frame) => frame,
                Err(err) if err.is_timeout() => continue,
                Err(FrameError::ConnectionClosed) => {
                    debug!("client disconnected");
                    return Ok(());
                }
                Err(err @ FrameError::FrameTooLarge { .. }) => {
                    warn!(error = %err, "skipping oversized frame");
                    first = false;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let message = match decode_frame(self.codec.as_ref(), &frame) {
                Ok(message) => message,
                Err(err) => {
                    if first {
                        debug!(preamble = %String::from_utf8_lossy(&frame), "session preamble");
                    } else {
                        warn!(error = %err, "skipping malformed frame");
                    }
                    first = false;
                    continue;
                }
            };
            first = false;

            match message {
                Message::Call(call) if is_keepalive(call.id) || call.method == KEEPALIVE_METHOD => {
                    trace!("keepalive");
                    lock(&writer).write_message(
                        self.codec.as_ref(),
                        &Message::Response(Response::keepalive_ack()),
                    )?;
                }
                Message::Call(call) => self.spawn_call(call, &writer)?,
                Message::Response(response) => {
                    debug!(id = response.id, "ignoring response frame from client");
                }
            }
        }

        // Calls still running hold writer clones; make the client see EOF now.
        let _ = reader.get_ref().shutdown();
        Ok(())
    }

    fn spawn_call(&self, call: Call, writer: &SharedWriter) -> Result<()> {
        let routes = Arc::clone(&self.routes);
        let sink = ReplySink::new(call.id, Arc::clone(writer), Arc::clone(&self.codec));
        trace!(id = call.id, method = %call.method, "call received");

        thread::Builder::new()
            .name(format!("muxrpc-call-{}", call.id))
            .spawn(move || {
                let payload = routes.invoke(&call.method, call.args, &sink);
                if let Err(err) = sink.finish(payload) {
                    debug!(id = call.id, error = %err, "could not deliver final reply");
                }
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader};
    use std::sync::mpsc;

    use serde_json::{json, Value};

    use super::*;
    use crate::channel::ChannelConfig;
    use crate::server::RpcServer;
    use crate::testing::test_config;
    use crate::worker::Router;
    use crate::ChannelError;

    fn routes() -> RouteTable {
        Router::new()
            .unary("echo", |args| Ok(args.into_iter().next().unwrap_or(Value::Null)))
            .streaming("count", |args, sink| {
                let n = args.first().and_then(Value::as_i64).unwrap_or(0);
                for i in 1..=n {
                    sink.partial(json!(i))?;
                }
                Ok(json!("done"))
            })
            .unary("sleep", |args| {
                let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
                thread::sleep(Duration::from_millis(ms));
                Ok(json!(ms))
            })
            .build()
            .unwrap()
    }

    fn start_worker() -> (String, Arc<AtomicBool>, thread::JoinHandle<Result<()>>) {
        let server = WorkerServer::bind("127.0.0.1", 0, routes()).unwrap();
        let addr = server.local_addr().to_string();
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::spawn(move || server.serve(flag));
        (addr, running, handle)
    }

    fn stop_worker(running: Arc<AtomicBool>, handle: thread::JoinHandle<Result<()>>) {
        running.store(false, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn echo_and_stream_end_to_end() {
        let (addr, running, handle) = start_worker();
        let rpc = RpcServer::open(Some(&addr), test_config()).unwrap();

        assert_eq!(rpc.call_sync("echo", vec![json!("hi")]).unwrap(), json!("hi"));

        let (tx, rx) = mpsc::channel();
        let partial_tx = tx.clone();
        rpc.call_stream(
            "count",
            vec![json!(3)],
            move |payload| partial_tx.send(payload).unwrap(),
            move |payload| tx.send(payload).unwrap(),
        )
        .unwrap();

        let mut received = Vec::new();
        assert!(rpc
            .run_until(
                || {
                    received.extend(rx.try_iter());
                    received.len() == 4
                },
                Duration::from_secs(5),
            )
            .unwrap());
        assert_eq!(received, vec![json!(1), json!(2), json!(3), json!("done")]);

        rpc.close();
        stop_worker(running, handle);
    }

    #[test]
    fn slow_call_does_not_block_other_calls() {
        let (addr, running, handle) = start_worker();
        let rpc = RpcServer::open(Some(&addr), test_config()).unwrap();

        let (tx, rx) = mpsc::channel();
        rpc.call("sleep", vec![json!(300)], move |result| {
            tx.send(result.unwrap()).unwrap();
        })
        .unwrap();

        assert_eq!(rpc.call_sync("echo", vec![json!(1)]).unwrap(), json!(1));
        assert!(rx.try_recv().is_err());

        let mut slow = None;
        assert!(rpc
            .run_until(
                || {
                    if slow.is_none() {
                        slow = rx.try_recv().ok();
                    }
                    slow.is_some()
                },
                Duration::from_secs(5),
            )
            .unwrap());
        assert_eq!(slow, Some(json!(300)));

        rpc.close();
        stop_worker(running, handle);
    }

    #[test]
    fn unknown_method_gets_error_payload() {
        let (addr, running, handle) = start_worker();
        let rpc = RpcServer::open(Some(&addr), test_config()).unwrap();

        let payload = rpc.call_sync("missing", Vec::new()).unwrap();
        assert_eq!(payload, json!({ "error": "unknown method 'missing'" }));

        rpc.close();
        stop_worker(running, handle);
    }

    #[test]
    fn preamble_and_keepalive_are_handled() {
        let (addr, running, handle) = start_worker();

        let mut stream = TcpEndpoint::connect(&addr).unwrap();
        let mut lines = BufReader::new(stream.try_clone().unwrap());
        stream
            .write_all(b"vimrpc\n[-1,\"keeplive\",[]]\n")
            .unwrap();
        let mut line = String::new();
        lines.read_line(&mut line).unwrap();
        assert_eq!(line, "[-1,true,\"ok\"]\n");
        drop(stream);
        drop(lines);

        let config = ChannelConfig {
            preamble: Some("vimrpc".to_string()),
            keepalive_interval: Some(Duration::from_millis(20)),
            ..test_config()
        };
        let rpc = RpcServer::open(Some(&addr), config).unwrap();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(rpc.call_sync("echo", vec![json!("after")]).unwrap(), json!("after"));

        rpc.close();
        stop_worker(running, handle);
    }

    #[test]
    fn stopping_the_worker_fails_pending_waits() {
        let (addr, running, handle) = start_worker();
        let rpc = RpcServer::open(Some(&addr), test_config()).unwrap();
        assert_eq!(rpc.call_sync("echo", vec![json!(0)]).unwrap(), json!(0));

        stop_worker(running, handle);
        thread::sleep(IDLE_POLL * 3);

        let err = rpc.call_sync("sleep", vec![json!(5000)]).unwrap_err();
        assert!(
            matches!(err, ChannelError::Connection(_)),
            "expected connection error, got {err:?}"
        );
    }
}
