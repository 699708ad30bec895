use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use muxrpc_frame::{Call, Reply};
use serde_json::Value;
use tracing::trace;

use crate::channel::{Channel, WeakChannel};
use crate::error::{ChannelError, Result};

/// One logical call: a correlation id bound to its channel.
///
/// Clones share the closed flag. A stream closes when it is deleted or when
/// the final reply for its id has been dispatched; its id is never handed out
/// again.
#[derive(Clone)]
pub struct Stream {
    id: i64,
    channel: Channel,
    closed: Arc<AtomicBool>,
}

impl Stream {
    pub(crate) fn new(channel: Channel, id: i64) -> Self {
        Self {
            id,
            channel,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Send `method(args)` under this stream's id without waiting.
    pub fn send(&self, method: &str, args: Vec<Value>) -> Result<()> {
        self.ensure_open()?;
        self.channel.send(Call::new(self.id, method, args))
    }

    /// Send `method(args)` and block until the final reply arrives.
    pub fn send_and_wait(
        &self,
        method: &str,
        args: Vec<Value>,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        self.ensure_open()?;
        let payload = self
            .channel
            .send_and_wait(Call::new(self.id, method, args), deadline)?;
        self.closed.store(true, Ordering::Release);
        Ok(payload)
    }

    /// Route replies for this id to `continuation`.
    ///
    /// The stream is marked closed before the continuation sees the final
    /// reply.
    pub fn register<F>(&self, mut continuation: F) -> Result<()>
    where
        F: FnMut(i64, Reply) + Send + 'static,
    {
        self.ensure_open()?;
        let closed = Arc::clone(&self.closed);
        self.channel.register(
            self.id,
            Box::new(move |id, reply| {
                if reply.is_final() {
                    closed.store(true, Ordering::Release);
                }
                continuation(id, reply);
            }),
        );
        Ok(())
    }

    /// Close the stream and drop its continuation. Frames that still arrive
    /// for this id are discarded; the worker is not told.
    pub fn delete(&self) {
        self.closer().close();
    }

    pub(crate) fn closer(&self) -> StreamCloser {
        StreamCloser {
            id: self.id,
            channel: self.channel.downgrade(),
            closed: Arc::clone(&self.closed),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ChannelError::StreamClosed(self.id));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Closes a stream from inside its own continuation without keeping the
/// channel alive.
pub(crate) struct StreamCloser {
    id: i64,
    channel: WeakChannel,
    closed: Arc<AtomicBool>,
}

impl StreamCloser {
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(channel) = self.channel.upgrade() {
            if channel.deregister(self.id) {
                trace!(id = self.id, "stream deleted");
            }
        }
    }
}
