//! Request multiplexer.
//!
//! Assigns correlation ids (`sync`), keeps the table of pending requests and
//! routes every inbound frame to exactly one place:
//!
//! ```text
//!                  ┌─► pending[sync]      → Reply  (waiter completed)
//! inbound frame ───┼─► discarded[sync]    → Stale  (late reply, dropped)
//!                  └─► otherwise / CHUNK  → Push   (push channel)
//! ```
//!
//! Every pending request completes exactly once: with its reply, with
//! [`Error::Timeout`], or with the error passed to [`Multiplexer::fail_all`].

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::{Error, Result};
use crate::protocol::{Frame, Header};
use crate::writer::{OutboundFrame, WriterHandle};

/// Default time a timed-out id stays in the discard set.
pub const DEFAULT_DISCARD_RETENTION: Duration = Duration::from_secs(60);

/// Maximum number of ids kept in the discard set.
pub const MAX_DISCARDED: usize = 65_536;

/// A request ready for submission, without its sync.
#[derive(Debug, Clone)]
pub struct Request {
    pub code: u32,
    pub body: Bytes,
    /// 0 when the request does not depend on the schema.
    pub schema_version: u64,
    /// 0 outside of a stream.
    pub stream_id: u64,
}

impl Request {
    pub fn new(code: u32, body: Bytes) -> Self {
        Self {
            code,
            body,
            schema_version: 0,
            stream_id: 0,
        }
    }

    pub fn with_schema_version(mut self, schema_version: u64) -> Self {
        self.schema_version = schema_version;
        self
    }

    pub fn with_stream_id(mut self, stream_id: u64) -> Self {
        self.stream_id = stream_id;
        self
    }
}

/// Where an inbound frame went.
#[derive(Debug)]
pub enum Routed {
    /// Completed a pending request.
    Reply,
    /// Not a reply to anything pending; forward to the push channel.
    Push(Frame),
    /// Late reply to a timed-out request; dropped.
    Stale,
}

struct Pending {
    code: u32,
    submitted: Instant,
    tx: oneshot::Sender<Result<Frame>>,
    timer: Option<AbortHandle>,
}

impl Pending {
    fn complete(self, result: Result<Frame>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The waiter may have been dropped; the exchange still counts as done.
        let _ = self.tx.send(result);
    }
}

#[derive(Default)]
struct Inflight {
    next_sync: u64,
    pending: HashMap<u64, Pending>,
    discarded: HashMap<u64, Instant>,
    discard_order: VecDeque<(u64, Instant)>,
}

impl Inflight {
    fn allocate_sync(&mut self) -> u64 {
        loop {
            self.next_sync = self.next_sync.wrapping_add(1);
            let sync = self.next_sync;
            if sync != 0 && !self.pending.contains_key(&sync) && !self.discarded.contains_key(&sync)
            {
                return sync;
            }
        }
    }

    fn prune_discarded(&mut self, retention: Duration, now: Instant) {
        while let Some(&(sync, at)) = self.discard_order.front() {
            let expired = now.duration_since(at) >= retention;
            if !expired && self.discard_order.len() <= MAX_DISCARDED {
                break;
            }
            self.discard_order.pop_front();
            if self.discarded.get(&sync) == Some(&at) {
                self.discarded.remove(&sync);
            }
        }
    }
}

/// Correlates requests and replies for one connection.
pub struct Multiplexer {
    inner: Mutex<Inflight>,
    discard_retention: Duration,
}

impl Multiplexer {
    pub fn new(discard_retention: Duration) -> Self {
        Self {
            inner: Mutex::new(Inflight::default()),
            discard_retention,
        }
    }

    /// Register a request, arm its timer and hand the frame to the writer.
    ///
    /// If the write is abandoned (error or cancellation) the registration is
    /// rolled back. Once this returns, the multiplexer owns the exchange
    /// until reply, timeout or failure; dropping the handle does not cancel it.
    pub async fn submit(
        self: &Arc<Self>,
        writer: &WriterHandle,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<ResponseHandle> {
        let (tx, rx) = oneshot::channel();
        let sync = {
            let mut inner = self.inner.lock();
            let sync = inner.allocate_sync();
            inner.pending.insert(
                sync,
                Pending {
                    code: request.code,
                    submitted: Instant::now(),
                    tx,
                    timer: None,
                },
            );
            sync
        };
        let registration = Registration {
            mux: &**self,
            sync,
            armed: true,
        };

        if let Some(timeout) = timeout {
            self.arm_timer(sync, timeout);
        }

        let header = Header::new(request.code, sync)
            .with_schema_version(request.schema_version)
            .with_stream_id(request.stream_id);
        let frame = OutboundFrame::new(&header, request.body)?;
        writer.send(frame).await?;

        registration.disarm();
        Ok(ResponseHandle { sync, rx })
    }

    fn arm_timer(self: &Arc<Self>, sync: u64, timeout: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(mux) = weak.upgrade() {
                mux.expire(sync);
            }
        });

        let mut inner = self.inner.lock();
        match inner.pending.get_mut(&sync) {
            Some(pending) => pending.timer = Some(timer.abort_handle()),
            None => timer.abort(),
        }
    }

    /// Time out a pending request and remember its id so a late reply is
    /// dropped.
    pub fn expire(&self, sync: u64) -> bool {
        let now = Instant::now();
        let pending = {
            let mut inner = self.inner.lock();
            let Some(pending) = inner.pending.remove(&sync) else {
                return false;
            };
            inner.discarded.insert(sync, now);
            inner.discard_order.push_back((sync, now));
            inner.prune_discarded(self.discard_retention, now);
            pending
        };

        let elapsed = now.duration_since(pending.submitted);
        tracing::warn!(
            "Request {} (code {}) timed out after {:?}",
            sync,
            pending.code,
            elapsed
        );
        // The timer is the caller here; nothing to abort.
        let _ = pending.tx.send(Err(Error::Timeout { sync, elapsed }));
        true
    }

    /// Route an inbound frame.
    pub fn dispatch(&self, frame: Frame) -> Routed {
        let sync = frame.sync();

        if frame.is_chunk() || frame.is_event() {
            if frame.is_chunk() && self.inner.lock().discarded.contains_key(&sync) {
                tracing::debug!("Dropping push chunk for timed-out request {}", sync);
                return Routed::Stale;
            }
            return Routed::Push(frame);
        }

        let pending = {
            let mut inner = self.inner.lock();
            match inner.pending.remove(&sync) {
                Some(pending) => Some(pending),
                None => {
                    if inner.discarded.remove(&sync).is_some() {
                        tracing::debug!("Dropping late reply for timed-out request {}", sync);
                        return Routed::Stale;
                    }
                    None
                }
            }
        };

        match pending {
            Some(pending) => {
                pending.complete(Ok(frame));
                Routed::Reply
            }
            None => {
                tracing::debug!("Unsolicited frame with sync {} (code {:#x})", sync, frame.code());
                Routed::Push(frame)
            }
        }
    }

    /// Complete every pending request with an error produced by `make_err`.
    ///
    /// The discard set is cleared too: ids from a dead session can never see
    /// a late reply. Returns the number of requests failed.
    pub fn fail_all<F>(&self, make_err: F) -> usize
    where
        F: Fn() -> Error,
    {
        let drained: Vec<Pending> = {
            let mut inner = self.inner.lock();
            inner.discarded.clear();
            inner.discard_order.clear();
            inner.pending.drain().map(|(_, p)| p).collect()
        };

        let count = drained.len();
        for pending in drained {
            pending.complete(Err(make_err()));
        }
        count
    }

    /// Number of requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Whether `sync` is remembered as timed out.
    pub fn is_discarded(&self, sync: u64) -> bool {
        let mut inner = self.inner.lock();
        inner.prune_discarded(self.discard_retention, Instant::now());
        inner.discarded.contains_key(&sync)
    }

    fn rollback(&self, sync: u64) {
        let pending = self.inner.lock().pending.remove(&sync);
        if let Some(pending) = pending {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
        }
    }
}

/// Removes a registration whose frame never reached the writer.
struct Registration<'a> {
    mux: &'a Multiplexer,
    sync: u64,
    armed: bool,
}

impl Registration<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.mux.rollback(self.sync);
        }
    }
}

/// Future resolving to the reply frame of one request.
#[derive(Debug)]
pub struct ResponseHandle {
    sync: u64,
    rx: oneshot::Receiver<Result<Frame>>,
}

impl ResponseHandle {
    /// Correlation id assigned to the request.
    pub fn sync(&self) -> u64 {
        self.sync
    }
}

impl Future for ResponseHandle {
    type Output = Result<Frame>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{codes, request_type, FrameBuffer};
    use crate::writer::{spawn_writer_task, WriterConfig};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn setup() -> (Arc<Multiplexer>, WriterHandle, DuplexStream) {
        let (client, server) = duplex(64 * 1024);
        let (writer, _task) = spawn_writer_task(client, WriterConfig::default());
        (
            Arc::new(Multiplexer::new(DEFAULT_DISCARD_RETENTION)),
            writer,
            server,
        )
    }

    fn ping() -> Request {
        Request::new(request_type::PING, Bytes::new())
    }

    fn reply(code: u32, sync: u64) -> Frame {
        Frame::new(Header::new(code, sync), Bytes::new())
    }

    #[tokio::test]
    async fn test_out_of_order_replies_pair_by_sync() {
        let (mux, writer, _server) = setup();

        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(mux.submit(&writer, ping(), None).await.unwrap());
        }
        let syncs: Vec<u64> = handles.iter().map(ResponseHandle::sync).collect();
        assert_eq!(mux.pending_count(), 5);

        for &sync in syncs.iter().rev() {
            assert!(matches!(mux.dispatch(reply(codes::OK, sync)), Routed::Reply));
        }

        for (handle, sync) in handles.into_iter().zip(syncs) {
            let frame = handle.await.unwrap();
            assert_eq!(frame.sync(), sync);
        }
        assert_eq!(mux.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_writes_frame_with_sync() {
        let (mux, writer, mut server) = setup();
        let request = Request::new(request_type::SELECT, Bytes::from_static(b"\x80"))
            .with_schema_version(4)
            .with_stream_id(2);
        let handle = mux.submit(&writer, request, None).await.unwrap();

        let mut buffer = FrameBuffer::new();
        let mut buf = vec![0u8; 256];
        let frames = loop {
            let n = server.read(&mut buf).await.unwrap();
            let frames = buffer.push(&buf[..n]).unwrap();
            if !frames.is_empty() {
                break frames;
            }
        };
        let header = frames[0].header;
        assert_eq!(header.sync, handle.sync());
        assert_eq!(header.code, request_type::SELECT);
        assert_eq!(header.schema_version, 4);
        assert_eq!(header.stream_id, 2);
    }

    #[tokio::test]
    async fn test_timeout_then_late_reply_is_stale() {
        let (mux, writer, _server) = setup();

        let handle = mux
            .submit(&writer, ping(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        let sync = handle.sync();

        match handle.await {
            Err(Error::Timeout { sync: s, elapsed }) => {
                assert_eq!(s, sync);
                assert!(elapsed >= Duration::from_millis(20));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(mux.is_discarded(sync));
        assert_eq!(mux.pending_count(), 0);

        assert!(matches!(mux.dispatch(reply(codes::OK, sync)), Routed::Stale));
        // Only the first late reply is swallowed.
        assert!(!mux.is_discarded(sync));
        assert!(matches!(mux.dispatch(reply(codes::OK, sync)), Routed::Push(_)));
    }

    #[tokio::test]
    async fn test_reply_before_timeout_cancels_timer() {
        let (mux, writer, _server) = setup();

        let handle = mux
            .submit(&writer, ping(), Some(Duration::from_millis(30)))
            .await
            .unwrap();
        let sync = handle.sync();
        mux.dispatch(reply(codes::OK, sync));

        assert!(handle.await.is_ok());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!mux.is_discarded(sync));
    }

    #[tokio::test]
    async fn test_unknown_sync_is_push() {
        let (mux, _writer, _server) = setup();
        assert!(matches!(mux.dispatch(reply(codes::OK, 999)), Routed::Push(_)));
    }

    #[tokio::test]
    async fn test_chunk_never_completes_request() {
        let (mux, writer, _server) = setup();
        let handle = mux.submit(&writer, ping(), None).await.unwrap();
        let sync = handle.sync();

        assert!(matches!(mux.dispatch(reply(codes::CHUNK, sync)), Routed::Push(_)));
        assert_eq!(mux.pending_count(), 1);

        assert!(matches!(mux.dispatch(reply(codes::OK, sync)), Routed::Reply));
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_all_completes_each_once() {
        let (mux, writer, _server) = setup();

        let mut handles = Vec::new();
        for _ in 0..3 {
            handles.push(mux.submit(&writer, ping(), None).await.unwrap());
        }

        assert_eq!(mux.fail_all(|| Error::ConnectionClosed), 3);
        assert_eq!(mux.fail_all(|| Error::ConnectionClosed), 0);

        for handle in handles {
            assert!(matches!(handle.await, Err(Error::ConnectionClosed)));
        }
    }

    #[tokio::test]
    async fn test_dropped_handle_keeps_exchange() {
        let (mux, writer, _server) = setup();
        let handle = mux.submit(&writer, ping(), None).await.unwrap();
        let sync = handle.sync();
        drop(handle);

        assert_eq!(mux.pending_count(), 1);
        assert!(matches!(mux.dispatch(reply(codes::OK, sync)), Routed::Reply));
        assert_eq!(mux.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back() {
        let (client, server) = duplex(64);
        drop(server);
        let (writer, task) = spawn_writer_task(client, WriterConfig::default());
        let mux = Arc::new(Multiplexer::new(DEFAULT_DISCARD_RETENTION));

        // Kill the writer task first so the channel is closed.
        let _ = writer
            .send(OutboundFrame::new(&Header::new(request_type::PING, 1), Bytes::new()).unwrap())
            .await;
        let _ = task.await;

        let result = mux.submit(&writer, ping(), Some(Duration::from_secs(1))).await;
        assert!(matches!(result, Err(Error::Connectivity(_))));
        assert_eq!(mux.pending_count(), 0);
    }

    #[test]
    fn test_sync_skips_zero_and_live_ids() {
        let mut inflight = Inflight {
            next_sync: u64::MAX - 1,
            ..Inflight::default()
        };
        assert_eq!(inflight.allocate_sync(), u64::MAX);
        // wraps past 0
        assert_eq!(inflight.allocate_sync(), 1);

        let now = Instant::now();
        inflight.discarded.insert(3, now);
        let (tx, _rx) = oneshot::channel();
        inflight.pending.insert(
            2,
            Pending {
                code: 0,
                submitted: now,
                tx,
                timer: None,
            },
        );
        assert_eq!(inflight.allocate_sync(), 4);
    }

    #[test]
    fn test_discard_set_expires_by_age() {
        let mux = Multiplexer::new(Duration::from_millis(0));
        {
            let mut inner = mux.inner.lock();
            let now = Instant::now();
            inner.discarded.insert(7, now);
            inner.discard_order.push_back((7, now));
        }
        assert!(!mux.is_discarded(7));
    }

    #[test]
    fn test_discard_set_bounded_by_size() {
        let mut inflight = Inflight::default();
        let now = Instant::now();
        for sync in 1..=(MAX_DISCARDED as u64 + 10) {
            inflight.discarded.insert(sync, now);
            inflight.discard_order.push_back((sync, now));
        }
        inflight.prune_discarded(Duration::from_secs(60), now);
        assert_eq!(inflight.discarded.len(), MAX_DISCARDED);
        assert!(!inflight.discarded.contains_key(&1));
    }
}
