use std::time::{Duration, Instant};

use muxrpc_frame::Reply;
use serde_json::Value;

use crate::channel::{Channel, ChannelConfig, PollOutcome};
use crate::error::{ChannelError, Result};
use crate::stream::Stream;

/// Longest single read inside [`RpcServer::run_until`].
const RUN_SLICE: Duration = Duration::from_millis(50);

/// Call surface used by client code: callback, blocking and streaming calls
/// over one injected [`Channel`].
#[derive(Debug, Clone)]
pub struct RpcServer {
    channel: Channel,
}

impl RpcServer {
    /// Open a channel and wrap it.
    pub fn open(target: Option<&str>, config: ChannelConfig) -> Result<Self> {
        Ok(Self::new(Channel::open(target, config)?))
    }

    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Send `method(args)`; `on_return` receives the final payload.
    ///
    /// A non-final reply is a protocol violation for this discipline:
    /// `on_return` gets `Err(Protocol)` and the stream is deleted. Replies are
    /// delivered by [`RpcServer::poll`] or by any blocking wait.
    pub fn call<F>(&self, method: &str, args: Vec<Value>, on_return: F) -> Result<Stream>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let stream = self.channel.new_stream();
        let closer = stream.closer();
        let mut on_return = Some(on_return);
        stream.register(move |id, reply| {
            let Some(on_return) = on_return.take() else {
                return;
            };
            closer.close();
            match reply {
                Reply::Final(payload) => on_return(Ok(payload)),
                Reply::Partial(_) => on_return(Err(ChannelError::Protocol(format!(
                    "call {id} received a partial reply"
                )))),
            }
        })?;

        if let Err(err) = stream.send(method, args) {
            stream.delete();
            return Err(err);
        }
        Ok(stream)
    }

    /// Send `method(args)` and block until the final payload arrives.
    ///
    /// Replies to other pending calls that arrive first are dispatched to
    /// their continuations before this returns.
    pub fn call_sync(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call_sync_inner(method, args, None)
    }

    /// Like [`RpcServer::call_sync`], failing with `Timeout` after `deadline`.
    pub fn call_sync_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        deadline: Duration,
    ) -> Result<Value> {
        self.call_sync_inner(method, args, Some(deadline))
    }

    fn call_sync_inner(
        &self,
        method: &str,
        args: Vec<Value>,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        let stream = self.channel.new_stream();
        stream.register(|_, _| {})?;
        stream
            .send_and_wait(method, args, deadline)
            .inspect_err(|_| stream.delete())
    }

    /// Send `method(args)`; `on_partial` runs for every partial reply in
    /// arrival order, `on_final` once for the final one, then the stream is
    /// deleted.
    pub fn call_stream<P, F>(
        &self,
        method: &str,
        args: Vec<Value>,
        mut on_partial: P,
        on_final: F,
    ) -> Result<Stream>
    where
        P: FnMut(Value) + Send + 'static,
        F: FnOnce(Value) + Send + 'static,
    {
        let stream = self.channel.new_stream();
        let closer = stream.closer();
        let mut on_final = Some(on_final);
        stream.register(move |_, reply| match reply {
            Reply::Partial(payload) => on_partial(payload),
            Reply::Final(payload) => {
                closer.close();
                if let Some(on_final) = on_final.take() {
                    on_final(payload);
                }
            }
        })?;

        if let Err(err) = stream.send(method, args) {
            stream.delete();
            return Err(err);
        }
        Ok(stream)
    }

    /// Read and dispatch at most one frame.
    pub fn poll(&self, timeout: Duration) -> Result<PollOutcome> {
        self.channel.poll(timeout)
    }

    /// Poll until `done` returns true or `timeout` elapses.
    ///
    /// Returns whether `done` was satisfied.
    pub fn run_until<P>(&self, mut done: P, timeout: Duration) -> Result<bool>
    where
        P: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        while !done() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            self.channel.poll(remaining.min(RUN_SLICE))?;
        }
        Ok(true)
    }

    /// Close the channel and terminate any local worker.
    pub fn close(&self) {
        self.channel.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::testing::{open_channel, spawn_peer};

    fn server(addr: &str) -> RpcServer {
        RpcServer::new(open_channel(addr))
    }

    #[test]
    fn call_sync_echo() {
        let (addr, peer) = spawn_peer(|mut p| {
            let (id, method, args) = p.read_call();
            assert_eq!(method, "echo");
            p.reply(id, true, args[0].clone());
            p.drain();
        });
        let rpc = server(&addr);

        assert_eq!(rpc.call_sync("echo", vec![json!("hi")]).unwrap(), json!("hi"));
        assert_eq!(rpc.channel().pending(), 0);

        rpc.close();
        peer.join().unwrap();
    }

    #[test]
    fn pending_async_reply_fires_before_sync_returns() {
        let (addr, peer) = spawn_peer(|mut p| {
            let (async_id, _, _) = p.read_call();
            let (sync_id, _, _) = p.read_call();
            assert!(sync_id > async_id);
            p.reply(async_id, true, json!("async"));
            p.reply(sync_id, true, json!("sync"));
            p.drain();
        });
        let rpc = server(&addr);
        let events = Arc::new(Mutex::new(Vec::<String>::new()));

        let recorded = Arc::clone(&events);
        let pending = rpc
            .call("slow", Vec::new(), move |result| {
                let payload = result.unwrap();
                recorded.lock().unwrap().push(format!("callback:{payload}"));
            })
            .unwrap();

        let payload = rpc.call_sync("fast", Vec::new()).unwrap();
        events.lock().unwrap().push(format!("sync:{payload}"));

        assert_eq!(
            *events.lock().unwrap(),
            vec!["callback:\"async\"".to_string(), "sync:\"sync\"".to_string()]
        );
        assert!(pending.is_closed());
        assert_eq!(rpc.channel().pending(), 0);

        rpc.close();
        peer.join().unwrap();
    }

    #[test]
    fn call_stream_delivers_partials_in_order_then_final_once() {
        let (addr, peer) = spawn_peer(|mut p| {
            let (id, method, _) = p.read_call();
            assert_eq!(method, "count");
            for n in 1..=3 {
                p.reply(id, false, json!(n));
            }
            p.reply(id, true, json!("end"));
            p.reply(id, true, json!("late"));
            p.drain();
        });
        let rpc = server(&addr);
        let partials = Arc::new(Mutex::new(Vec::new()));
        let finals = Arc::new(Mutex::new(Vec::new()));

        let partial_sink = Arc::clone(&partials);
        let final_sink = Arc::clone(&finals);
        let stream = rpc
            .call_stream(
                "count",
                vec![json!(3)],
                move |payload| partial_sink.lock().unwrap().push(payload),
                move |payload| final_sink.lock().unwrap().push(payload),
            )
            .unwrap();

        let done = Arc::clone(&finals);
        assert!(rpc
            .run_until(|| !done.lock().unwrap().is_empty(), Duration::from_secs(5))
            .unwrap());
        // The stray second final is discarded.
        let _ = rpc.poll(Duration::from_millis(100)).unwrap();

        assert_eq!(*partials.lock().unwrap(), vec![json!(1), json!(2), json!(3)]);
        assert_eq!(*finals.lock().unwrap(), vec![json!("end")]);
        assert!(stream.is_closed());
        assert!(!rpc.channel().is_registered(stream.id()));

        rpc.close();
        peer.join().unwrap();
    }

    #[test]
    fn call_sync_inside_stream_partial_preserves_final() {
        let (addr, peer) = spawn_peer(|mut p| {
            let (stream_id, method, _) = p.read_call();
            assert_eq!(method, "count");
            p.reply(stream_id, false, json!(1));
            let (lookup_id, method, _) = p.read_call();
            assert_eq!(method, "lookup");
            p.reply(stream_id, true, json!("end"));
            p.reply(lookup_id, true, json!("lookup"));
            p.drain();
        });
        let rpc = server(&addr);
        let lookups = Arc::new(Mutex::new(Vec::new()));
        let finals = Arc::new(Mutex::new(Vec::new()));

        let nested = rpc.clone();
        let lookup_sink = Arc::clone(&lookups);
        let final_sink = Arc::clone(&finals);
        let stream = rpc
            .call_stream(
                "count",
                vec![json!(1)],
                move |_| {
                    let payload = nested.call_sync("lookup", Vec::new()).unwrap();
                    lookup_sink.lock().unwrap().push(payload);
                },
                move |payload| final_sink.lock().unwrap().push(payload),
            )
            .unwrap();

        let done = Arc::clone(&finals);
        assert!(rpc
            .run_until(|| !done.lock().unwrap().is_empty(), Duration::from_secs(5))
            .unwrap());

        assert_eq!(*lookups.lock().unwrap(), vec![json!("lookup")]);
        assert_eq!(*finals.lock().unwrap(), vec![json!("end")]);
        assert!(stream.is_closed());
        assert!(!rpc.channel().is_registered(stream.id()));

        rpc.close();
        peer.join().unwrap();
    }

    #[test]
    fn partial_reply_to_plain_call_is_protocol_error() {
        let (addr, peer) = spawn_peer(|mut p| {
            let (id, _, _) = p.read_call();
            p.reply(id, false, json!(1));
            p.reply(id, true, json!(2));
            p.drain();
        });
        let rpc = server(&addr);
        let results = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&results);
        let stream = rpc
            .call("echo", Vec::new(), move |result| sink.lock().unwrap().push(result))
            .unwrap();

        let seen = Arc::clone(&results);
        assert!(rpc
            .run_until(|| !seen.lock().unwrap().is_empty(), Duration::from_secs(5))
            .unwrap());
        let _ = rpc.poll(Duration::from_millis(100)).unwrap();

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(ChannelError::Protocol(_))));
        assert!(stream.is_closed());
        assert_eq!(rpc.channel().status(), crate::Status::Open);

        drop(results);
        rpc.close();
        peer.join().unwrap();
    }

    #[test]
    fn deleted_stream_discards_later_frames() {
        let (addr, peer) = spawn_peer(|mut p| {
            let (id, _, _) = p.read_call();
            let (sync_id, _, _) = p.read_call();
            p.reply(id, true, json!("too late"));
            p.reply(sync_id, true, json!("ok"));
            p.drain();
        });
        let rpc = server(&addr);
        let fired = Arc::new(Mutex::new(false));

        let flag = Arc::clone(&fired);
        let stream = rpc
            .call("slow", Vec::new(), move |_| *flag.lock().unwrap() = true)
            .unwrap();
        stream.delete();
        assert!(!rpc.channel().is_registered(stream.id()));

        assert_eq!(rpc.call_sync("fast", Vec::new()).unwrap(), json!("ok"));
        assert!(!*fired.lock().unwrap());

        let err = stream.send("again", Vec::new()).unwrap_err();
        assert!(matches!(err, ChannelError::StreamClosed(id) if id == stream.id()));

        rpc.close();
        peer.join().unwrap();
    }

    #[test]
    fn call_sync_timeout_deletes_stream() {
        let (addr, peer) = spawn_peer(|mut p| {
            let _ = p.read_call();
            p.drain();
        });
        let rpc = server(&addr);

        let err = rpc
            .call_sync_timeout("sleep", vec![json!(5)], Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
        assert_eq!(rpc.channel().pending(), 0);

        rpc.close();
        peer.join().unwrap();
    }

    #[test]
    fn call_on_closed_channel_fails_and_cleans_up() {
        let (addr, peer) = spawn_peer(|p| p.drain());
        let rpc = server(&addr);
        rpc.close();
        peer.join().unwrap();

        let err = rpc.call("echo", Vec::new(), |_| {}).unwrap_err();
        assert!(err.is_connection_lost());
        assert_eq!(rpc.channel().pending(), 0);

        let err = rpc.call_sync("echo", Vec::new()).unwrap_err();
        assert!(err.is_connection_lost());
    }
}
