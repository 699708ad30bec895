//! Scripted loopback peers for channel tests.

use std::io::{BufRead, BufReader, Write};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use muxrpc_transport::{TcpEndpoint, WireStream};
use serde_json::Value;

use crate::channel::{Channel, ChannelConfig};
use crate::connector::ConnectConfig;

pub(crate) struct ScriptedPeer {
    lines: BufReader<WireStream>,
    out: WireStream,
}

impl ScriptedPeer {
    /// Next line without its terminator; `None` at EOF.
    pub(crate) fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = self.lines.read_line(&mut line).expect("peer read should succeed");
        if n == 0 {
            return None;
        }
        Some(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Next non-keepalive call as `(id, method, args)`.
    pub(crate) fn read_call(&mut self) -> (i64, String, Vec<Value>) {
        loop {
            let line = self.read_line().expect("peer expected a call");
            let record: Value = serde_json::from_str(&line).expect("call should be json");
            let id = record[0].as_i64().expect("call id should be an integer");
            if id == -1 {
                continue;
            }
            let method = record[1].as_str().expect("method should be a string");
            let args = record[2].as_array().cloned().unwrap_or_default();
            return (id, method.to_string(), args);
        }
    }

    pub(crate) fn reply(&mut self, id: i64, is_final: bool, payload: Value) {
        let line = serde_json::to_string(&(id, is_final, payload)).expect("reply should encode");
        self.send_raw(&line);
    }

    pub(crate) fn send_raw(&mut self, line: &str) {
        self.out
            .write_all(format!("{line}\n").as_bytes())
            .expect("peer write should succeed");
    }

    /// Read until the client hangs up.
    pub(crate) fn drain(mut self) {
        while self.read_line().is_some() {}
    }
}

/// Accept one connection on a loopback port and run `script` against it.
pub(crate) fn spawn_peer<F, R>(script: F) -> (String, JoinHandle<R>)
where
    F: FnOnce(ScriptedPeer) -> R + Send + 'static,
    R: Send + 'static,
{
    let endpoint = TcpEndpoint::bind("127.0.0.1", 0).expect("endpoint should bind");
    let addr = endpoint.local_addr().to_string();
    let handle = thread::spawn(move || {
        let stream = endpoint.accept().expect("peer should accept");
        let lines = BufReader::new(stream.try_clone().expect("stream should clone"));
        script(ScriptedPeer { lines, out: stream })
    });
    (addr, handle)
}

pub(crate) fn test_config() -> ChannelConfig {
    ChannelConfig {
        connect: ConnectConfig {
            open_timeout: Duration::from_secs(2),
            ..ConnectConfig::default()
        },
        read_timeout: Duration::from_millis(50),
        keepalive_interval: None,
        ..ChannelConfig::default()
    }
}

pub(crate) fn open_channel(addr: &str) -> Channel {
    Channel::open(Some(addr), test_config()).expect("channel should open")
}
