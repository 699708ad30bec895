use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, TryLockError, Weak};
use std::time::{Duration, Instant};

use muxrpc_frame::{decode_frame, is_keepalive, ArrayCodec, Call, Message, Reply, WireCodec};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::connector::{lock, ConnectConfig, Connection, ReadOutcome, Status};
use crate::error::{ChannelError, Result};
use crate::keepalive::{Keepalive, DEFAULT_KEEPALIVE_INTERVAL};
use crate::stream::Stream;

/// Callback invoked with `(id, reply)` for every frame routed to an id.
pub type Continuation = Box<dyn FnMut(i64, Reply) + Send>;

/// Default per-read timeout inside blocking waits.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll backoff while another caller owns the read side.
const BUSY_BACKOFF: Duration = Duration::from_millis(20);

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// How to reach or start the worker.
    pub connect: ConnectConfig,
    /// Record format on the wire. Default: positional arrays.
    pub codec: Arc<dyn WireCodec>,
    /// Per-read timeout used by blocking waits.
    pub read_timeout: Duration,
    /// Keepalive period. `None` disables the keepalive thread.
    pub keepalive_interval: Option<Duration>,
    /// Raw line sent right after connecting, announcing the session type.
    pub preamble: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect: ConnectConfig::default(),
            codec: Arc::new(ArrayCodec),
            read_timeout: DEFAULT_READ_TIMEOUT,
            keepalive_interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            preamble: None,
        }
    }
}

/// What `dispatch` did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// A registered continuation took the reply, either at once or queued
    /// behind its own still-running invocation.
    Delivered,
    /// Keepalive, stray call, or no continuation for the id.
    Discarded,
}

/// What one `poll` step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Delivered,
    Discarded,
    /// Nothing arrived within the timeout.
    Idle,
    /// A blocking wait owns the read side and dispatches on its own.
    Busy,
}

impl From<Dispatched> for PollOutcome {
    fn from(value: Dispatched) -> Self {
        match value {
            Dispatched::Delivered => PollOutcome::Delivered,
            Dispatched::Discarded => PollOutcome::Discarded,
        }
    }
}

/// Multiplexes logical calls over one [`Connection`].
///
/// Cheap to clone; all clones share the connection, the id counter and the
/// continuation registry.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

struct Inner {
    connection: Connection,
    codec: Arc<dyn WireCodec>,
    read_timeout: Duration,
    next_id: AtomicI64,
    callbacks: Mutex<HashMap<i64, Arc<Slot>>>,
    active_wait: Mutex<Option<ActiveWait>>,
    waiting: AtomicBool,
    keepalive: Mutex<Option<Keepalive>>,
}

struct ActiveWait {
    id: i64,
    result: Option<Value>,
}

/// A registered continuation and the replies waiting for it.
///
/// Replies are queued in arrival order; whoever holds the continuation lock
/// drains the queue, so a reply that arrives while the continuation is
/// running (re-entrantly or from another reader) is delivered right after.
struct Slot {
    continuation: Mutex<Continuation>,
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    queue: VecDeque<Reply>,
    final_queued: bool,
    closed: bool,
}

impl Slot {
    fn new(continuation: Continuation) -> Self {
        Self {
            continuation: Mutex::new(continuation),
            state: Mutex::new(SlotState::default()),
        }
    }

    /// Queue `reply` unless the slot is closed or already holds its final.
    fn push(&self, reply: Reply) -> bool {
        let mut state = lock(&self.state);
        if state.closed || state.final_queued {
            return false;
        }
        state.final_queued = reply.is_final();
        state.queue.push_back(reply);
        true
    }

    fn pop(&self) -> Option<Reply> {
        let mut state = lock(&self.state);
        if state.closed {
            state.queue.clear();
            return None;
        }
        state.queue.pop_front()
    }

    fn has_queued(&self) -> bool {
        let state = lock(&self.state);
        !state.closed && !state.queue.is_empty()
    }

    /// Drop queued replies; nothing more is delivered.
    fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.queue.clear();
    }
}

/// Outcome of the routing step, before any continuation runs.
enum Routed {
    Discarded,
    Reply {
        id: i64,
        slot: Option<Arc<Slot>>,
        waited: Option<Value>,
    },
}

impl Channel {
    /// Open the connection, send the preamble and start the keepalive.
    pub fn open(target: Option<&str>, config: ChannelConfig) -> Result<Self> {
        let connection = Connection::open(target, &config.connect)?;
        if let Some(preamble) = &config.preamble {
            connection.write_line(preamble)?;
            debug!(preamble = %preamble, "session preamble sent");
        }

        let channel = Self::from_connection(connection, config.codec, config.read_timeout);
        if let Some(interval) = config.keepalive_interval {
            channel.start_keepalive(interval)?;
        }
        Ok(channel)
    }

    /// Wrap an already open connection. No keepalive is started.
    pub fn from_connection(
        connection: Connection,
        codec: Arc<dyn WireCodec>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connection,
                codec,
                read_timeout,
                next_id: AtomicI64::new(0),
                callbacks: Mutex::new(HashMap::new()),
                active_wait: Mutex::new(None),
                waiting: AtomicBool::new(false),
                keepalive: Mutex::new(None),
            }),
        }
    }

    /// Start (or restart) the keepalive thread.
    ///
    /// Each tick writes `[-1, "keeplive", []]` and checks that a local worker
    /// is still alive; a failed tick marks the connection failed and ends the
    /// thread.
    pub fn start_keepalive(&self, interval: Duration) -> Result<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let keepalive = Keepalive::start(interval, move || match weak.upgrade() {
            Some(inner) => inner.keepalive_tick(),
            None => false,
        })?;

        if let Some(mut previous) = lock(&self.inner.keepalive).replace(keepalive) {
            previous.stop();
        }
        Ok(())
    }

    /// Allocate the next correlation id and wrap it in a [`Stream`].
    pub fn new_stream(&self) -> Stream {
        Stream::new(self.clone(), self.next_id())
    }

    fn next_id(&self) -> i64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Route frames for `id` to `continuation`, replacing any previous one.
    pub fn register(&self, id: i64, continuation: Continuation) {
        let previous = lock(&self.inner.callbacks).insert(id, Arc::new(Slot::new(continuation)));
        if let Some(previous) = previous {
            previous.close();
            debug!(id, "replaced continuation");
        }
    }

    /// Remove the continuation for `id`, dropping replies still queued for
    /// it. Returns whether one was registered.
    pub fn deregister(&self, id: i64) -> bool {
        match lock(&self.inner.callbacks).remove(&id) {
            Some(slot) => {
                slot.close();
                true
            }
            None => false,
        }
    }

    /// Whether a continuation is registered for `id`.
    pub fn is_registered(&self, id: i64) -> bool {
        lock(&self.inner.callbacks).contains_key(&id)
    }

    /// Number of registered continuations.
    pub fn pending(&self) -> usize {
        lock(&self.inner.callbacks).len()
    }

    /// Decode one frame and route it.
    pub fn dispatch(&self, frame: &[u8]) -> Result<Dispatched> {
        let routed = self.route_frame(frame)?;
        Ok(self.deliver(routed))
    }

    /// Route an already decoded message.
    ///
    /// Replies for one id reach its continuation in arrival order, and a
    /// continuation sees at most one final reply; the registry entry is
    /// removed just before that final runs. A reply arriving while the
    /// continuation is already running is queued and delivered once the
    /// running invocation returns. Continuations run with no registry lock
    /// held and may issue new calls, including blocking ones.
    pub fn dispatch_message(&self, message: Message) -> Dispatched {
        let routed = self.route(message);
        self.deliver(routed)
    }

    fn route_frame(&self, frame: &[u8]) -> Result<Routed> {
        let message = decode_frame(self.inner.codec.as_ref(), frame)?;
        Ok(self.route(message))
    }

    /// Queue the reply on its slot. Cheap enough to run under the reader
    /// lock, which keeps arrival order across concurrent readers.
    fn route(&self, message: Message) -> Routed {
        let response = match message {
            Message::Response(response) => response,
            Message::Call(call) => {
                if is_keepalive(call.id) {
                    trace!("keepalive call from worker ignored");
                } else {
                    debug!(id = call.id, method = %call.method, "discarding call frame from worker");
                }
                return Routed::Discarded;
            }
        };

        let id = response.id;
        if is_keepalive(id) {
            trace!("keepalive acknowledged");
            return Routed::Discarded;
        }

        let is_final = response.reply.is_final();
        let waited = if is_final && self.is_waiting_for(id) {
            Some(response.reply.payload().clone())
        } else {
            None
        };

        let slot = lock(&self.inner.callbacks).get(&id).cloned();
        let Some(slot) = slot else {
            trace!(id, is_final, "no continuation registered; discarding");
            return Routed::Reply {
                id,
                slot: None,
                waited,
            };
        };
        if !slot.push(response.reply) {
            trace!(id, is_final, "reply after final; discarding");
            return Routed::Discarded;
        }

        Routed::Reply {
            id,
            slot: Some(slot),
            waited,
        }
    }

    fn deliver(&self, routed: Routed) -> Dispatched {
        let Routed::Reply { id, slot, waited } = routed else {
            return Dispatched::Discarded;
        };

        let dispatched = match slot {
            Some(slot) => {
                self.drain(id, &slot);
                Dispatched::Delivered
            }
            None => Dispatched::Discarded,
        };

        if let Some(payload) = waited {
            if let Some(wait) = lock(&self.inner.active_wait).as_mut() {
                if wait.id == id {
                    wait.result = Some(payload);
                }
            }
        }

        dispatched
    }

    /// Run queued replies through the continuation, unless it is already
    /// running; its current owner then drains them on return.
    fn drain(&self, id: i64, slot: &Arc<Slot>) {
        loop {
            let mut continuation = match slot.continuation.try_lock() {
                Ok(continuation) => continuation,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    trace!(id, "continuation busy; reply queued");
                    return;
                }
            };

            while let Some(reply) = slot.pop() {
                let is_final = reply.is_final();
                if is_final {
                    self.remove_slot(id, slot);
                }
                trace!(id, is_final, "delivering reply");
                (*continuation)(id, reply);
            }
            drop(continuation);

            // A reply queued after the last pop but before the unlock found
            // the continuation busy and left it to us.
            if !slot.has_queued() {
                return;
            }
        }
    }

    fn remove_slot(&self, id: i64, slot: &Arc<Slot>) {
        let mut callbacks = lock(&self.inner.callbacks);
        if callbacks.get(&id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            callbacks.remove(&id);
        }
    }

    fn is_waiting_for(&self, id: i64) -> bool {
        lock(&self.inner.active_wait)
            .as_ref()
            .is_some_and(|wait| wait.id == id)
    }

    /// Write a call frame. Replies are delivered later by [`Channel::poll`]
    /// or by any blocking wait on this channel.
    pub fn send(&self, call: Call) -> Result<()> {
        trace!(id = call.id, method = %call.method, "sending call");
        self.inner
            .connection
            .write_message(self.inner.codec.as_ref(), &Message::Call(call))
    }

    /// Write a call frame and block until its final reply has been dispatched.
    ///
    /// Every frame read meanwhile is dispatched, so replies to other pending
    /// calls still reach their continuations. Malformed frames are logged and
    /// skipped. Fails with `Connection` if the connection closes or fails,
    /// with `Timeout` once `deadline` (if any) has elapsed, and with
    /// `WaitInProgress` if another blocking wait is running on this channel.
    pub fn send_and_wait(&self, call: Call, deadline: Option<Duration>) -> Result<Value> {
        let _guard = WaitGuard::acquire(&self.inner)?;
        let id = call.id;
        *lock(&self.inner.active_wait) = Some(ActiveWait { id, result: None });

        self.send(call)?;

        let started = Instant::now();
        let mut reader = self.inner.connection.lock_reader();
        loop {
            if let Some(payload) = self.take_wait_result() {
                return Ok(payload);
            }

            let read_timeout = match deadline {
                Some(limit) => {
                    let elapsed = started.elapsed();
                    if elapsed >= limit {
                        return Err(ChannelError::Timeout(limit));
                    }
                    (limit - elapsed).min(self.inner.read_timeout)
                }
                None => self.inner.read_timeout,
            };

            match reader.read_one(read_timeout) {
                Ok(ReadOutcome::Frame(frame)) => {
                    if let Err(err) = self.dispatch(&frame) {
                        warn!(error = %err, "skipping malformed frame");
                    }
                }
                Ok(ReadOutcome::Timeout) => {
                    if reader.status() != Status::Open {
                        return Err(self.lost_connection(id));
                    }
                }
                Ok(ReadOutcome::Closed) => return Err(self.lost_connection(id)),
                Err(ChannelError::Frame(err)) => {
                    warn!(error = %err, "skipping unreadable frame");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn take_wait_result(&self) -> Option<Value> {
        lock(&self.inner.active_wait)
            .as_mut()
            .and_then(|wait| wait.result.take())
    }

    fn lost_connection(&self, id: i64) -> ChannelError {
        ChannelError::Connection(format!(
            "connection to {} {} while waiting for call {id}",
            self.inner.connection.peer(),
            match self.status() {
                Status::Failed => "failed",
                _ => "closed",
            }
        ))
    }

    /// Read and dispatch at most one frame, waiting up to `timeout`.
    ///
    /// Returns `Busy` without reading when a blocking wait owns the read
    /// side. Malformed frames are logged and reported as `Discarded`.
    pub fn poll(&self, timeout: Duration) -> Result<PollOutcome> {
        if self.inner.waiting.load(Ordering::Acquire) {
            std::thread::sleep(timeout.min(BUSY_BACKOFF));
            return Ok(PollOutcome::Busy);
        }

        // Route under the reader lock so replies are queued in arrival
        // order; run continuations after releasing it.
        let routed = {
            let Some(mut reader) = self.inner.connection.try_lock_reader() else {
                std::thread::sleep(timeout.min(BUSY_BACKOFF));
                return Ok(PollOutcome::Busy);
            };
            match reader.read_one(timeout) {
                Ok(ReadOutcome::Frame(frame)) => self.route_frame(&frame),
                Ok(ReadOutcome::Timeout) if self.status() == Status::Open => {
                    return Ok(PollOutcome::Idle);
                }
                Ok(ReadOutcome::Timeout) | Ok(ReadOutcome::Closed) => {
                    return Err(ChannelError::Connection(format!(
                        "connection to {} is not open",
                        self.inner.connection.peer()
                    )));
                }
                Err(ChannelError::Frame(err)) => {
                    warn!(error = %err, "skipping unreadable frame");
                    return Ok(PollOutcome::Discarded);
                }
                Err(err) => return Err(err),
            }
        };

        match routed {
            Ok(routed) => Ok(self.deliver(routed).into()),
            Err(err) => {
                warn!(error = %err, "skipping malformed frame");
                Ok(PollOutcome::Discarded)
            }
        }
    }

    /// Connection status.
    pub fn status(&self) -> Status {
        self.inner.connection.status()
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Codec used for every frame on this channel.
    pub fn codec(&self) -> &dyn WireCodec {
        self.inner.codec.as_ref()
    }

    /// Stop the keepalive and close the connection, terminating any local
    /// worker. Pending continuations are dropped without being called.
    pub fn close(&self) {
        if let Some(mut keepalive) = lock(&self.inner.keepalive).take() {
            keepalive.stop();
        }
        self.inner.connection.close();
        for (_, slot) in lock(&self.inner.callbacks).drain() {
            slot.close();
        }
    }

    pub(crate) fn downgrade(&self) -> WeakChannel {
        WeakChannel(Arc::downgrade(&self.inner))
    }
}

/// Non-owning handle for continuations that need to reach their channel.
#[derive(Clone)]
pub(crate) struct WeakChannel(Weak<Inner>);

impl WeakChannel {
    pub(crate) fn upgrade(&self) -> Option<Channel> {
        self.0.upgrade().map(|inner| Channel { inner })
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("connection", &self.inner.connection)
            .field("codec", &self.inner.codec.name())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Inner {
    fn keepalive_tick(&self) -> bool {
        if !self.connection.is_open() {
            return false;
        }
        if !self.connection.check_worker() {
            warn!(peer = %self.connection.peer(), "worker died; channel marked failed");
            return false;
        }
        match self
            .connection
            .write_message(self.codec.as_ref(), &Message::Call(Call::keepalive()))
        {
            Ok(()) => {
                trace!("keepalive sent");
                true
            }
            Err(err) => {
                warn!(error = %err, "keepalive failed");
                false
            }
        }
    }
}

/// Rejects a second concurrent blocking wait; clears the wait slot on exit.
struct WaitGuard<'a> {
    inner: &'a Inner,
}

impl<'a> WaitGuard<'a> {
    fn acquire(inner: &'a Inner) -> Result<Self> {
        inner
            .waiting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ChannelError::WaitInProgress)?;
        Ok(Self { inner })
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.inner.active_wait) = None;
        self.inner.waiting.store(false, Ordering::Release);
    }
}
