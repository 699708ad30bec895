use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use muxrpc_frame::{FrameWriter, Message, Reply, Response, WireCodec, KEEPALIVE_METHOD};
use serde_json::{json, Value};

use crate::connector::lock;
use crate::error::{ChannelError, Result};

/// What a handler returns: the final payload, or an error reported to the
/// caller as `{"error": "..."}`.
pub type HandlerResult = std::result::Result<Value, Box<dyn std::error::Error + Send + Sync>>;

type UnaryFn = dyn Fn(Vec<Value>) -> HandlerResult + Send + Sync;
type StreamingFn = dyn Fn(Vec<Value>, &ReplySink) -> HandlerResult + Send + Sync;

pub(crate) type SharedWriter = Arc<Mutex<FrameWriter<Box<dyn Write + Send>>>>;

#[derive(Clone)]
enum Handler {
    Unary(Arc<UnaryFn>),
    Streaming(Arc<StreamingFn>),
}

/// Registration table builder.
///
/// ```
/// use muxrpc_channel::Router;
/// use serde_json::json;
///
/// let routes = Router::new()
///     .unary("echo", |args| Ok(args.into_iter().next().unwrap_or(json!(null))))
///     .build()
///     .unwrap();
/// assert!(routes.contains("echo"));
/// ```
#[derive(Default)]
pub struct Router {
    entries: Vec<(String, Handler)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler that answers with a single final reply.
    pub fn unary<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> HandlerResult + Send + Sync + 'static,
    {
        self.entries
            .push((name.into(), Handler::Unary(Arc::new(handler))));
        self
    }

    /// Register a handler that may emit partial replies through its
    /// [`ReplySink`] before returning the final payload.
    pub fn streaming<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>, &ReplySink) -> HandlerResult + Send + Sync + 'static,
    {
        self.entries
            .push((name.into(), Handler::Streaming(Arc::new(handler))));
        self
    }

    /// Validate registrations: names must be non-empty, unique, and must not
    /// shadow the keepalive method.
    pub fn build(self) -> Result<RouteTable> {
        let mut handlers = HashMap::with_capacity(self.entries.len());
        for (name, handler) in self.entries {
            if name.trim().is_empty() {
                return Err(ChannelError::InvalidRoute(
                    "method name must not be empty".to_string(),
                ));
            }
            if name == KEEPALIVE_METHOD {
                return Err(ChannelError::InvalidRoute(format!(
                    "'{name}' is reserved for keepalive"
                )));
            }
            if handlers.insert(name.clone(), handler).is_some() {
                return Err(ChannelError::InvalidRoute(format!(
                    "method '{name}' registered twice"
                )));
            }
        }
        Ok(RouteTable { handlers })
    }
}

/// Validated method table.
pub struct RouteTable {
    handlers: HashMap<String, Handler>,
}

impl RouteTable {
    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the handler for `method` and return the final payload.
    ///
    /// Unknown methods and handler failures become `{"error": "..."}`.
    pub fn invoke(&self, method: &str, args: Vec<Value>, sink: &ReplySink) -> Value {
        let result = match self.handlers.get(method) {
            Some(Handler::Unary(handler)) => handler(args),
            Some(Handler::Streaming(handler)) => handler(args, sink),
            None => Err(format!("unknown method '{method}'").into()),
        };
        match result {
            Ok(payload) => payload,
            Err(err) => json!({ "error": err.to_string() }),
        }
    }
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("methods", &self.methods())
            .finish()
    }
}

/// Reply channel for one call on the worker side.
#[derive(Clone)]
pub struct ReplySink {
    id: i64,
    writer: SharedWriter,
    codec: Arc<dyn WireCodec>,
}

impl ReplySink {
    pub(crate) fn new(id: i64, writer: SharedWriter, codec: Arc<dyn WireCodec>) -> Self {
        Self { id, writer, codec }
    }

    /// Correlation id of the call being answered.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Send a partial reply.
    pub fn partial(&self, payload: Value) -> Result<()> {
        self.send(Reply::Partial(payload))
    }

    pub(crate) fn finish(&self, payload: Value) -> Result<()> {
        self.send(Reply::Final(payload))
    }

    fn send(&self, reply: Reply) -> Result<()> {
        let message = Message::Response(Response::new(self.id, reply));
        lock(&self.writer).write_message(self.codec.as_ref(), &message)?;
        Ok(())
    }
}

impl std::fmt::Debug for ReplySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplySink").field("id", &self.id).finish()
    }
}
