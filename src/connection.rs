//! Connection manager.
//!
//! A [`Connection`] owns one session at a time: socket, read loop and writer
//! task. It runs the handshake (greeting, optional auth, schema fetch),
//! routes replies through the [`Multiplexer`], broadcasts push frames and
//! reconnects with a fixed delay when the transport is lost.
//!
//! # Example
//!
//! ```ignore
//! use iproto_client::{Connection, SelectOptions};
//!
//! let conn = Connection::builder().port(3301).connect().await?;
//! conn.insert("tester", (1, "one")).await?;
//! let reply = conn.select("tester", (1,), SelectOptions::new()).await?;
//! for row in reply.rows() {
//!     println!("{:?}", row.field("name"));
//! }
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rmpv::Value;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::codec::{decode_reply, IteratorType, Operation, PushNotification, Response, SelectOptions};
use crate::config::{Config, ConnectionBuilder};
use crate::error::{Error, Result};
use crate::multiplexer::{Multiplexer, Request, Routed};
use crate::protocol::{codes, encode_auth_body, request_type, Frame, Greeting, Header};
use crate::push::{PushChannel, PushIterator};
use crate::schema::{Schema, SchemaCache, SpaceMeta, SpaceRef, VINDEX_ID, VSPACE_ID};
use crate::stream::Stream;
use crate::transport::{FrameReader, Transport};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Attempts to get `_vspace` and `_vindex` at the same schema version.
const SCHEMA_FETCH_ATTEMPTS: usize = 3;

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Socket connect, greeting or auth in progress.
    Connecting,
    /// Transport and auth are up; schema not loaded yet.
    Connected,
    /// Ready, with the schema loaded (or schema fetching disabled).
    FullyConnected,
    /// Waiting to retry after the transport was lost.
    Reconnecting,
}

/// Per-request options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Overrides the connection's request timeout.
    pub timeout: Option<Duration>,
    /// Overrides the connection's `retry_on_schema_change`.
    pub retry_on_schema_change: Option<bool>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_on_schema_change(mut self, enabled: bool) -> Self {
        self.retry_on_schema_change = Some(enabled);
        self
    }
}

/// One established transport.
struct Session {
    epoch: u64,
    writer: WriterHandle,
    greeting: Greeting,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Shared {
    config: Config,
    mux: Arc<Multiplexer>,
    schema: SchemaCache,
    push: PushChannel,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    /// Bumped for every new session and on close; loss reports from older
    /// sessions are ignored.
    epoch: AtomicU64,
    closing: AtomicBool,
    /// Serializes connect attempts.
    connect_lock: tokio::sync::Mutex<()>,
    /// Highest schema version seen in a reply during this session.
    seen_schema_version: AtomicU64,
    next_stream_id: AtomicU64,
    watched: Mutex<BTreeSet<String>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("Connection state {:?} -> {:?}", previous, state);
        }
    }

    fn writer(&self) -> Result<WriterHandle> {
        if let Some(session) = self.session.lock().as_ref() {
            return Ok(session.writer.clone());
        }
        if self.closing.load(Ordering::Acquire) {
            Err(Error::ConnectionClosed)
        } else {
            Err(Error::Connectivity(format!(
                "Not connected (state {:?})",
                self.state()
            )))
        }
    }

    /// Open a session unless one is already up.
    async fn establish(self: &Arc<Self>) -> Result<()> {
        let _serial = self.connect_lock.lock().await;
        if self.session.lock().is_some() {
            return Ok(());
        }
        if self.closing.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        self.set_state(ConnectionState::Connecting);

        let config = &self.config;
        let endpoint = config.endpoint();
        let Transport {
            greeting,
            reader,
            writer,
        } = Transport::connect(
            &endpoint,
            config.connect_timeout,
            config.initial_read_buffer_size,
            config.max_payload_size,
        )
        .await?;

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let (writer, writer_task) = spawn_writer_task(writer, config.writer.clone());
        let weak = Arc::downgrade(self);
        let session = Session {
            epoch,
            writer,
            greeting,
            tasks: vec![
                tokio::spawn(read_loop(
                    weak.clone(),
                    epoch,
                    reader,
                    Arc::clone(&self.mux),
                )),
                tokio::spawn(watch_writer(weak, epoch, writer_task)),
            ],
        };

        if let Some(user) = &config.username {
            self.authenticate(&session, user).await?;
            tracing::debug!("Authenticated as '{}'", user);
        }

        {
            let mut slot = self.session.lock();
            if self.closing.load(Ordering::Acquire) {
                return Err(Error::ConnectionClosed);
            }
            *slot = Some(session);
        }
        self.seen_schema_version.store(0, Ordering::Release);
        self.set_state(ConnectionState::Connected);

        if config.fetch_schema {
            if let Err(e) = self.refetch_schema(None).await {
                self.teardown(epoch, &e.to_string());
                return Err(e);
            }
        }

        let keys: Vec<String> = self.watched.lock().iter().cloned().collect();
        if !keys.is_empty() {
            let writer = self.writer()?;
            for key in &keys {
                send_watch(&writer, request_type::WATCH, key).await?;
            }
            tracing::debug!("Re-registered {} watchers", keys.len());
        }

        self.set_state(ConnectionState::FullyConnected);
        tracing::info!("Connected to {}", endpoint);
        Ok(())
    }

    async fn authenticate(&self, session: &Session, user: &str) -> Result<()> {
        let body = encode_auth_body(user, &session.greeting.salt, &self.config.password)?;
        let request = Request::new(request_type::AUTH, Bytes::from(body));
        let handle = self
            .mux
            .submit(&session.writer, request, Some(self.config.connect_timeout))
            .await?;
        let frame = handle.await?;

        match decode_reply(&frame, None) {
            Ok(_) => Ok(()),
            Err(Error::Remote { code, message }) if code != codes::ER_LOADING => {
                Err(Error::Auth(format!("{} (code {})", message, code)))
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the session of `epoch` and fail everything in flight.
    fn teardown(&self, epoch: u64, reason: &str) -> Option<Session> {
        let session = {
            let mut slot = self.session.lock();
            match slot.as_ref() {
                Some(session) if session.epoch == epoch => slot.take(),
                _ => None,
            }
        };
        let failed = self
            .mux
            .fail_all(|| Error::Connectivity(reason.to_string()));
        if failed > 0 {
            tracing::warn!("{} pending requests failed: {}", failed, reason);
        }
        session
    }

    fn on_transport_lost(self: &Arc<Self>, epoch: u64, reason: &str) {
        if self.epoch.load(Ordering::Acquire) != epoch {
            return;
        }
        let Some(session) = self.teardown(epoch, reason) else {
            return;
        };
        drop(session);
        tracing::warn!("Connection to {} lost: {}", self.config.endpoint(), reason);

        if self.closing.load(Ordering::Acquire) {
            return;
        }
        if self.config.auto_reconnect {
            self.set_state(ConnectionState::Reconnecting);
            tokio::spawn(reconnect_loop(Arc::downgrade(self)));
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn on_push(&self, frame: Frame) {
        let notification = match PushNotification::from_frame(&frame) {
            Ok(notification) => notification,
            Err(e) => {
                tracing::warn!("Dropping undecodable push frame (sync {}): {}", frame.sync(), e);
                return;
            }
        };

        // The server sends the next event for a key only after it is acked
        // with another WATCH.
        if let Some(key) = notification.key.as_ref().filter(|_| frame.is_event()) {
            if self.watched.lock().contains(key) {
                if let Ok(writer) = self.writer() {
                    let key = key.clone();
                    tokio::spawn(async move {
                        if let Err(e) = send_watch(&writer, request_type::WATCH, &key).await {
                            tracing::debug!("Failed to ack event for '{}': {}", key, e);
                        }
                    });
                }
            }
        }

        let delivered = self.push.publish(notification);
        tracing::trace!("Push frame (sync {}) delivered to {} subscribers", frame.sync(), delivered);
    }

    fn observe_schema_version(&self, version: u64) {
        if version == 0 {
            return;
        }
        let previous = self.seen_schema_version.fetch_max(version, Ordering::AcqRel);
        if version < previous {
            tracing::debug!("Reply schema version {} is older than {}", version, previous);
        }
    }

    async fn round_trip(&self, request: Request, timeout: Option<Duration>) -> Result<Frame> {
        let writer = self.writer()?;
        let handle = self.mux.submit(&writer, request, timeout).await?;
        drop(writer);
        handle.await
    }

    /// Single-flight schema refetch over the current session.
    async fn refetch_schema(&self, min_version: Option<u64>) -> Result<Arc<Schema>> {
        let this = self;
        let timeout = self.config.request_timeout.unwrap_or(self.config.connect_timeout);
        let fetch = move || async move {
            let writer = this.writer()?;
            fetch_schema(&this.mux, &writer, Some(timeout)).await
        };

        match min_version {
            Some(version) => self.schema.refetch_if_older(version, fetch).await,
            None => self.schema.refetch(fetch).await,
        }
    }

    async fn execute(
        &self,
        op: &Operation,
        options: RequestOptions,
        stream_id: u64,
    ) -> Result<Response> {
        let config = &self.config;
        let timeout = options.timeout.or(config.request_timeout);
        let retry = options
            .retry_on_schema_change
            .unwrap_or(config.retry_on_schema_change);

        let mut schema = self.schema.current();
        let mut encoded = match op.encode(&schema) {
            Err(Error::Schema(reason)) if config.fetch_schema => {
                tracing::debug!("{}, refetching schema", reason);
                schema = self.refetch_schema(None).await?;
                op.encode(&schema)?
            }
            other => other?,
        };
        let mut retried = false;

        loop {
            let mut request = Request::new(encoded.code, encoded.body.clone()).with_stream_id(stream_id);
            if encoded.schema_bound {
                request = request.with_schema_version(schema.version());
            }

            let frame = self.round_trip(request, timeout).await?;
            let reply_version = frame.schema_version();
            self.observe_schema_version(reply_version);

            if config.fetch_schema && config.auto_refetch_schema && reply_version > schema.version() {
                match self.refetch_schema(Some(reply_version)).await {
                    Ok(fresh) => schema = fresh,
                    Err(e) => tracing::warn!(
                        "Schema refetch for version {} failed: {}",
                        reply_version,
                        e
                    ),
                }
            }

            if frame.is_error() && frame.header.error_code() == codes::ER_WRONG_SCHEMA_VERSION {
                if retry && !retried && config.fetch_schema {
                    retried = true;
                    if schema.version() < reply_version {
                        schema = self.refetch_schema(Some(reply_version)).await?;
                    }
                    encoded = op.encode(&schema)?;
                    tracing::debug!("Resending request at schema version {}", schema.version());
                    continue;
                }
                return Err(match decode_reply(&frame, None) {
                    Err(Error::Remote { message, .. }) => Error::Schema(message),
                    Err(e) => e,
                    Ok(_) => Error::Schema(format!("Wrong schema version {}", reply_version)),
                });
            }

            let space = op
                .space()
                .and_then(|space| schema.space(space).cloned())
                .or(encoded.space);
            return decode_reply(&frame, space);
        }
    }
}

/// Fetch `_vspace` and `_vindex`, retrying until both report one version.
async fn fetch_schema(
    mux: &Arc<Multiplexer>,
    writer: &WriterHandle,
    timeout: Option<Duration>,
) -> Result<Schema> {
    let empty = Schema::empty();
    let system_select = |space_id: u32| -> Result<Request> {
        let op = Operation::Select {
            space: SpaceRef::Id(space_id),
            key: Value::Nil,
            options: SelectOptions::new().iterator(IteratorType::All),
        };
        let encoded = op.encode(&empty)?;
        Ok(Request::new(encoded.code, encoded.body))
    };

    for attempt in 1..=SCHEMA_FETCH_ATTEMPTS {
        let spaces = mux.submit(writer, system_select(VSPACE_ID)?, timeout).await?;
        let indexes = mux.submit(writer, system_select(VINDEX_ID)?, timeout).await?;
        let (spaces, indexes) = tokio::try_join!(spaces, indexes)?;
        let spaces = decode_reply(&spaces, None)?;
        let indexes = decode_reply(&indexes, None)?;

        if spaces.schema_version != indexes.schema_version {
            tracing::debug!(
                "Schema changed during fetch ({} != {}), attempt {}",
                spaces.schema_version,
                indexes.schema_version,
                attempt
            );
            continue;
        }
        return Schema::from_system_rows(spaces.schema_version, &spaces.data, &indexes.data);
    }

    Err(Error::Schema(format!(
        "Schema kept changing over {} fetch attempts",
        SCHEMA_FETCH_ATTEMPTS
    )))
}

async fn send_watch(writer: &WriterHandle, code: u32, key: &str) -> Result<()> {
    let op = match code {
        request_type::UNWATCH => Operation::Unwatch { key: key.to_string() },
        _ => Operation::Watch { key: key.to_string() },
    };
    let encoded = op.encode(&Schema::empty())?;
    // No reply is sent for WATCH/UNWATCH, so no sync is allocated.
    let frame = OutboundFrame::new(&Header::new(encoded.code, 0), encoded.body)?;
    writer.send(frame).await
}

/// Read frames until the transport fails and hand them to the multiplexer.
async fn read_loop(
    shared: Weak<Shared>,
    epoch: u64,
    mut reader: FrameReader,
    mux: Arc<Multiplexer>,
) {
    let reason = loop {
        match reader.next_frame().await {
            Ok(Some(frame)) => {
                if let Routed::Push(frame) = mux.dispatch(frame) {
                    match shared.upgrade() {
                        Some(shared) => shared.on_push(frame),
                        None => return,
                    }
                }
            }
            Ok(None) => break "Connection closed by server".to_string(),
            Err(e) => {
                tracing::error!("Read loop error: {}", e);
                break e.to_string();
            }
        }
    };

    if let Some(shared) = shared.upgrade() {
        shared.on_transport_lost(epoch, &reason);
    }
}

/// Report a writer task that died with an I/O error.
async fn watch_writer(shared: Weak<Shared>, epoch: u64, task: JoinHandle<Result<()>>) {
    let reason = match task.await {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(e) if e.is_cancelled() => return,
        Err(e) => format!("Writer task panicked: {}", e),
    };

    if let Some(shared) = shared.upgrade() {
        shared.on_transport_lost(epoch, &reason);
    }
}

async fn reconnect_loop(shared: Weak<Shared>) {
    let mut attempt = 0u32;
    loop {
        let delay = match shared.upgrade() {
            Some(shared) => shared.config.reconnect_timeout,
            None => return,
        };
        tokio::time::sleep(delay).await;

        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.closing.load(Ordering::Acquire) {
            return;
        }

        attempt += 1;
        match shared.establish().await {
            Ok(()) => {
                tracing::info!("Reconnected after {} attempts", attempt);
                return;
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                shared.set_state(ConnectionState::Reconnecting);
            }
            Err(e) => {
                tracing::error!("Giving up reconnecting: {}", e);
                shared.set_state(ConnectionState::Disconnected);
                return;
            }
        }
    }
}

/// Handle to a multiplexed connection.
///
/// Cheap to clone; clones share the session. The session is torn down when
/// the last clone is dropped or on [`close`](Self::close).
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Create a disconnected connection; call [`open`](Self::open) to connect.
    pub fn new(config: Config) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Shared {
            mux: Arc::new(Multiplexer::new(config.discard_retention)),
            schema: SchemaCache::new(),
            push: PushChannel::new(),
            state,
            session: Mutex::new(None),
            epoch: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            connect_lock: tokio::sync::Mutex::new(()),
            seen_schema_version: AtomicU64::new(0),
            next_stream_id: AtomicU64::new(1),
            watched: Mutex::new(BTreeSet::new()),
            config,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Connect and complete the handshake.
    pub async fn connect(config: Config) -> Result<Self> {
        let conn = Self::new(config);
        conn.open().await?;
        Ok(conn)
    }

    /// Connect, retrying retryable failures within the connect timeout when
    /// auto-reconnect is on.
    ///
    /// Also reopens a connection after [`close`](Self::close).
    pub async fn open(&self) -> Result<()> {
        let shared = &self.shared;
        let config = &shared.config;
        shared.closing.store(false, Ordering::Release);
        shared.push.reopen();

        let deadline = Instant::now() + config.connect_timeout;
        loop {
            match shared.establish().await {
                Ok(()) => return Ok(()),
                Err(e)
                    if config.auto_reconnect
                        && e.is_retryable()
                        && !shared.closing.load(Ordering::Acquire)
                        && Instant::now() + config.reconnect_timeout < deadline =>
                {
                    tracing::warn!(
                        "Connect to {} failed, retrying in {:?}: {}",
                        config.endpoint(),
                        config.reconnect_timeout,
                        e
                    );
                    tokio::time::sleep(config.reconnect_timeout).await;
                }
                Err(e) => {
                    shared.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            }
        }
    }

    /// Tear down the session, fail pending requests with
    /// [`Error::ConnectionClosed`] and end push iterators.
    pub fn close(&self) {
        let shared = &self.shared;
        shared.closing.store(true, Ordering::Release);
        shared.epoch.fetch_add(1, Ordering::AcqRel);

        let session = shared.session.lock().take();
        let failed = shared.mux.fail_all(|| Error::ConnectionClosed);
        shared.push.close();
        shared.schema.clear();
        drop(session);

        shared.set_state(ConnectionState::Disconnected);
        tracing::debug!("Connection closed, {} pending requests failed", failed);
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Receiver notified on every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::FullyConnected
        )
    }

    pub fn is_fully_connected(&self) -> bool {
        self.state() == ConnectionState::FullyConnected
    }

    /// Version of the loaded schema, `None` before the first fetch.
    pub fn schema_id(&self) -> Option<u64> {
        match self.shared.schema.version() {
            0 => None,
            version => Some(version),
        }
    }

    /// Current schema snapshot.
    pub fn schema(&self) -> Arc<Schema> {
        self.shared.schema.current()
    }

    /// Reload the schema now.
    pub async fn refetch_schema(&self) -> Result<Arc<Schema>> {
        self.shared.refetch_schema(None).await
    }

    /// Space descriptor by name, refetching the schema once if it is unknown.
    pub async fn space(&self, name: &str) -> Result<Arc<SpaceMeta>> {
        let schema = self.shared.schema.current();
        if let Some(space) = schema.space_by_name(name) {
            return Ok(Arc::clone(space));
        }

        let schema = self.shared.refetch_schema(None).await?;
        schema
            .space_by_name(name)
            .cloned()
            .ok_or_else(|| Error::Schema(format!("Space '{}' not found", name)))
    }

    /// Server version from the greeting of the current session.
    pub fn server_version(&self) -> Option<String> {
        self.greeting().map(|greeting| greeting.version)
    }

    pub fn greeting(&self) -> Option<Greeting> {
        self.shared
            .session
            .lock()
            .as_ref()
            .map(|session| session.greeting.clone())
    }

    /// Number of requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared.mux.pending_count()
    }

    /// Subscribe to push notifications received from now on.
    pub fn subscribe(&self) -> PushIterator {
        self.shared.push.subscribe()
    }

    /// New interactive transaction stream with a fresh id.
    pub fn stream(&self) -> Stream {
        let id = self.shared.next_stream_id.fetch_add(1, Ordering::Relaxed);
        Stream::new(self.clone(), id)
    }

    pub async fn ping(&self) -> Result<()> {
        self.execute(Operation::Ping).await.map(drop)
    }

    pub async fn select<K: Serialize>(
        &self,
        space: impl Into<SpaceRef>,
        key: K,
        options: SelectOptions,
    ) -> Result<Response> {
        self.execute(Operation::select(space, key, options)?).await
    }

    pub async fn insert<T: Serialize>(&self, space: impl Into<SpaceRef>, tuple: T) -> Result<Response> {
        self.execute(Operation::insert(space, tuple)?).await
    }

    pub async fn replace<T: Serialize>(&self, space: impl Into<SpaceRef>, tuple: T) -> Result<Response> {
        self.execute(Operation::replace(space, tuple)?).await
    }

    /// Update by primary key. `ops` is a list like `[("=", 1, "new")]`.
    pub async fn update<K: Serialize, O: Serialize>(
        &self,
        space: impl Into<SpaceRef>,
        key: K,
        ops: O,
    ) -> Result<Response> {
        self.execute(Operation::update(space, key, ops)?).await
    }

    pub async fn upsert<T: Serialize, O: Serialize>(
        &self,
        space: impl Into<SpaceRef>,
        tuple: T,
        ops: O,
    ) -> Result<Response> {
        self.execute(Operation::upsert(space, tuple, ops)?).await
    }

    pub async fn delete<K: Serialize>(&self, space: impl Into<SpaceRef>, key: K) -> Result<Response> {
        self.execute(Operation::delete(space, key)?).await
    }

    /// Call a stored function.
    pub async fn call<A: Serialize>(&self, function: impl Into<String>, args: A) -> Result<Response> {
        self.execute(Operation::call(function, args)?).await
    }

    /// Evaluate a Lua expression.
    pub async fn eval<A: Serialize>(&self, expression: impl Into<String>, args: A) -> Result<Response> {
        self.execute(Operation::eval(expression, args)?).await
    }

    pub async fn execute(&self, op: Operation) -> Result<Response> {
        self.execute_with(op, RequestOptions::default()).await
    }

    /// Run an operation with per-request options.
    pub async fn execute_with(&self, op: Operation, options: RequestOptions) -> Result<Response> {
        self.shared.execute(&op, options, 0).await
    }

    pub(crate) async fn execute_in_stream(
        &self,
        op: &Operation,
        options: RequestOptions,
        stream_id: u64,
    ) -> Result<Response> {
        self.shared.execute(op, options, stream_id).await
    }

    /// Subscribe to changes of `key`; events arrive through
    /// [`subscribe`](Self::subscribe) with `key` set.
    ///
    /// The key stays registered across reconnects. When not connected it is
    /// sent with the next handshake.
    pub async fn watch(&self, key: impl Into<String>) -> Result<()> {
        let key = key.into();
        let added = self.shared.watched.lock().insert(key.clone());
        if !added {
            return Ok(());
        }
        match self.shared.writer() {
            Ok(writer) => send_watch(&writer, request_type::WATCH, &key).await,
            Err(Error::Connectivity(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn unwatch(&self, key: &str) -> Result<()> {
        if !self.shared.watched.lock().remove(key) {
            return Ok(());
        }
        match self.shared.writer() {
            Ok(writer) => send_watch(&writer, request_type::UNWATCH, key).await,
            Err(Error::Connectivity(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Keys currently watched.
    pub fn watched_keys(&self) -> Vec<String> {
        self.shared.watched.lock().iter().cloned().collect()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.shared.config.endpoint())
            .field("state", &self.state())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requests_fail_fast_when_disconnected() {
        let conn = Connection::new(Config::default());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_connected());
        assert!(conn.schema_id().is_none());
        assert!(conn.server_version().is_none());

        let err = conn.ping().await.unwrap_err();
        assert!(matches!(err, Error::Connectivity(_)), "got {:?}", err);
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_requests_after_close() {
        let conn = Connection::new(Config::default());
        conn.close();

        let err = conn.call("box.info", ()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed), "got {:?}", err);

        let mut push = conn.subscribe();
        assert!(push.next().await.is_none());
    }

    #[tokio::test]
    async fn test_watch_registers_while_disconnected() {
        let conn = Connection::new(Config::default());
        conn.watch("config").await.unwrap();
        conn.watch("config").await.unwrap();
        conn.watch("leader").await.unwrap();
        assert_eq!(conn.watched_keys(), vec!["config", "leader"]);

        conn.unwatch("config").await.unwrap();
        assert_eq!(conn.watched_keys(), vec!["leader"]);
    }

    #[tokio::test]
    async fn test_failed_connect_reports_address() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = Connection::builder()
            .port(port)
            .auto_reconnect(false)
            .connect()
            .await
            .unwrap_err();
        match err {
            Error::Connect { addr, .. } => assert_eq!(addr, format!("127.0.0.1:{}", port)),
            other => panic!("expected connect error, got {:?}", other),
        }
    }

    #[test]
    fn test_stream_ids_are_unique() {
        let conn = Connection::new(Config::default());
        let a = conn.stream();
        let b = conn.stream();
        assert_ne!(a.id(), b.id());
        assert!(a.id() > 0);
    }

    #[test]
    fn test_request_options() {
        let options = RequestOptions::new()
            .timeout(Duration::from_millis(20))
            .retry_on_schema_change(true);
        assert_eq!(options.timeout, Some(Duration::from_millis(20)));
        assert_eq!(options.retry_on_schema_change, Some(true));
    }
}
