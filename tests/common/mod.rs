//! In-process IProto server for connection tests.
//!
//! Speaks enough of the protocol for the client: greeting, chap-sha1 auth,
//! ping, `_vspace`/`_vindex` selects, a small in-memory `tester` space,
//! transactions, watchers and a pluggable handler for everything else.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

use iproto_client::codec::MsgPackCodec;
use iproto_client::protocol::{
    build_frame, codes, encode_greeting, keys, request_type, verify_scramble, FrameBuffer, Header,
};
use iproto_client::ConnectionBuilder;

pub const SERVER_VERSION: &str = "2.11.1-0-g96877bd";
pub const SERVER_UUID: &str = "3a9b4c2e-8f1d-4e6a-b7c5-0d2f1e9a8b7c";
pub const TESTER_ID: u32 = 512;

const SALT: [u8; 32] = *b"0123456789abcdefghijklmnopqrstuv";

/// A decoded client request.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub header: Header,
    pub body: Vec<(Value, Value)>,
}

impl Incoming {
    pub fn code(&self) -> u32 {
        self.header.code
    }

    pub fn get(&self, key: u8) -> Option<&Value> {
        self.body
            .iter()
            .find(|(k, _)| k.as_u64() == Some(u64::from(key)))
            .map(|(_, v)| v)
    }

    pub fn space_id(&self) -> Option<u32> {
        self.get(keys::SPACE_ID)
            .and_then(Value::as_u64)
            .map(|id| id as u32)
    }

    pub fn function(&self) -> Option<&str> {
        self.get(keys::FUNCTION_NAME).and_then(Value::as_str)
    }

    /// Call/eval arguments or the tuple of a write.
    pub fn tuple(&self) -> &[Value] {
        self.get(keys::TUPLE)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn key(&self) -> &[Value] {
        self.get(keys::KEY)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// What the server sends back for one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(Vec<Value>),
    Error(u32, String),
    /// Push chunks for the same sync, then the final reply.
    Chunks(Vec<Value>, Vec<Value>),
    Delayed(Duration, Box<Reply>),
    /// Swallow the request.
    Silent,
}

type Handler = Arc<dyn Fn(&Incoming) -> Option<Reply> + Send + Sync>;

struct Peer {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Key -> event version last sent to this peer.
    sent: Mutex<HashMap<String, u64>>,
    /// Keys acked and waiting for the next change.
    waiting: Mutex<HashSet<String>>,
}

struct Space {
    name: String,
    fields: Vec<(&'static str, &'static str)>,
}

struct State {
    handler: Option<Handler>,
    users: Mutex<HashMap<String, String>>,
    schema_version: AtomicU64,
    spaces: Mutex<BTreeMap<u32, Space>>,
    /// Space definition applied while serving the next `tester` select.
    alter_on_select: Mutex<Option<(u32, Space)>>,
    rows: Mutex<BTreeMap<u64, Value>>,
    events: Mutex<HashMap<String, (u64, Value)>>,
    loading_replies: AtomicU32,
    accepted: AtomicUsize,
    schema_fetches: AtomicUsize,
    requests: Mutex<Vec<Incoming>>,
    peers: Mutex<Vec<Arc<Peer>>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

pub struct MockServer {
    port: u16,
    state: Arc<State>,
    accept: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_with(None).await
    }

    /// Start with a handler consulted before the built-in behavior.
    /// Returning `None` falls through to the built-ins.
    pub async fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&Incoming) -> Option<Reply> + Send + Sync + 'static,
    {
        Self::start_with(Some(Arc::new(handler))).await
    }

    async fn start_with(handler: Option<Handler>) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = new_state(handler);

        let accept_state = Arc::clone(&state);
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                stream.set_nodelay(true).unwrap();
                spawn_peer(Arc::clone(&accept_state), stream);
            }
        });

        Self {
            port,
            state,
            accept,
        }
    }

    #[cfg(unix)]
    pub async fn start_unix(path: &std::path::Path) -> Self {
        let listener = tokio::net::UnixListener::bind(path).unwrap();
        let state = new_state(None);

        let accept_state = Arc::clone(&state);
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                spawn_peer(Arc::clone(&accept_state), stream);
            }
        });

        Self {
            port: 0,
            state,
            accept,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Client builder pointed at this server with a short reconnect delay.
    pub fn client(&self) -> ConnectionBuilder {
        ConnectionBuilder::new()
            .host("127.0.0.1")
            .port(self.port)
            .connect_timeout(Duration::from_secs(5))
            .reconnect_timeout(Duration::from_millis(20))
    }

    pub fn add_user(&self, user: &str, password: &str) {
        self.state
            .users
            .lock()
            .insert(user.to_string(), password.to_string());
    }

    pub fn schema_version(&self) -> u64 {
        self.state.schema_version.load(Ordering::SeqCst)
    }

    pub fn set_schema_version(&self, version: u64) {
        self.state.schema_version.store(version, Ordering::SeqCst);
    }

    /// Create a space and bump the schema version.
    pub fn create_space(&self, id: u32, name: &str, fields: Vec<(&'static str, &'static str)>) {
        self.state.spaces.lock().insert(
            id,
            Space {
                name: name.to_string(),
                fields,
            },
        );
        self.state.schema_version.fetch_add(1, Ordering::SeqCst);
    }

    /// Redefine a space while the next `tester` select is served, so the
    /// request is admitted at the old version and the reply carries the new
    /// one.
    pub fn alter_space_on_next_select(
        &self,
        id: u32,
        name: &str,
        fields: Vec<(&'static str, &'static str)>,
    ) {
        *self.state.alter_on_select.lock() = Some((
            id,
            Space {
                name: name.to_string(),
                fields,
            },
        ));
    }

    /// Answer the next `n` auth requests with ER_LOADING.
    pub fn answer_loading(&self, n: u32) {
        self.state.loading_replies.store(n, Ordering::SeqCst);
    }

    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Number of `_vspace` selects served.
    pub fn schema_fetches(&self) -> usize {
        self.state.schema_fetches.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Incoming> {
        self.state.requests.lock().clone()
    }

    pub fn requests_of(&self, code: u32) -> Vec<Incoming> {
        self.requests()
            .into_iter()
            .filter(|r| r.code() == code)
            .collect()
    }

    /// Drop every client socket.
    pub fn kill_connections(&self) {
        for task in self.state.tasks.lock().drain(..) {
            task.abort();
        }
        self.state.peers.lock().clear();
    }

    /// Send a raw frame to every connected client.
    pub fn broadcast(&self, header: Header, body: Vec<(Value, Value)>) {
        let frame = encode_frame(header, body);
        for peer in self.state.peers.lock().iter() {
            let _ = peer.tx.send(frame.clone());
        }
    }

    /// Change a watched key and notify peers waiting on it.
    pub fn set_event(&self, key: &str, value: Value) {
        let version = {
            let mut events = self.state.events.lock();
            let entry = events.entry(key.to_string()).or_insert((0, Value::Nil));
            entry.0 += 1;
            entry.1 = value;
            entry.0
        };

        for peer in self.state.peers.lock().iter() {
            if peer.waiting.lock().remove(key) {
                send_event(&self.state, peer, key, version);
            }
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept.abort();
        self.kill_connections();
    }
}

fn new_state(handler: Option<Handler>) -> Arc<State> {
    let mut spaces = BTreeMap::new();
    spaces.insert(
        TESTER_ID,
        Space {
            name: "tester".to_string(),
            fields: vec![("id", "unsigned"), ("name", "string")],
        },
    );

    Arc::new(State {
        handler,
        users: Mutex::new(HashMap::new()),
        schema_version: AtomicU64::new(1),
        spaces: Mutex::new(spaces),
        alter_on_select: Mutex::new(None),
        rows: Mutex::new(BTreeMap::new()),
        events: Mutex::new(HashMap::new()),
        loading_replies: AtomicU32::new(0),
        accepted: AtomicUsize::new(0),
        schema_fetches: AtomicUsize::new(0),
        requests: Mutex::new(Vec::new()),
        peers: Mutex::new(Vec::new()),
        tasks: Mutex::new(Vec::new()),
    })
}

fn spawn_peer<S>(state: Arc<State>, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    state.accepted.fetch_add(1, Ordering::SeqCst);
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let _ = tx.send(encode_greeting(SERVER_VERSION, SERVER_UUID, &SALT).to_vec());

    let peer = Arc::new(Peer {
        tx,
        sent: Mutex::new(HashMap::new()),
        waiting: Mutex::new(HashSet::new()),
    });
    state.peers.lock().push(Arc::clone(&peer));

    let write_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let read_state = Arc::clone(&state);
    let read_task = tokio::spawn(async move {
        let mut frames = FrameBuffer::new();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for frame in frames.push(&buf[..n]).unwrap() {
                let body = match MsgPackCodec::read_value(&mut &frame.body[..]) {
                    Ok(Value::Map(entries)) => entries,
                    _ => Vec::new(),
                };
                let incoming = Incoming {
                    header: frame.header,
                    body,
                };
                read_state.requests.lock().push(incoming.clone());
                handle(&read_state, &peer, incoming);
            }
        }
    });

    let mut tasks = state.tasks.lock();
    tasks.push(write_task.abort_handle());
    tasks.push(read_task.abort_handle());
}

fn handle(state: &Arc<State>, peer: &Arc<Peer>, request: Incoming) {
    let sync = request.header.sync;

    match request.code() {
        request_type::WATCH => {
            if let Some(key) = request.get(keys::EVENT_KEY).and_then(Value::as_str) {
                let version = state.events.lock().get(key).map_or(0, |(v, _)| *v);
                let last = peer.sent.lock().get(key).copied();
                if last == Some(version) {
                    peer.waiting.lock().insert(key.to_string());
                } else {
                    send_event(state, peer, key, version);
                }
            }
            return;
        }
        request_type::UNWATCH => {
            if let Some(key) = request.get(keys::EVENT_KEY).and_then(Value::as_str) {
                peer.waiting.lock().remove(key);
                peer.sent.lock().remove(key);
            }
            return;
        }
        _ => {}
    }

    let requested = request.header.schema_version;
    let current = state.schema_version.load(Ordering::SeqCst);
    let reply = if requested != 0 && requested != current {
        Reply::Error(
            codes::ER_WRONG_SCHEMA_VERSION,
            format!("Wrong schema version, current: {}, in request: {}", current, requested),
        )
    } else {
        let custom = state.handler.as_ref().and_then(|h| h(&request));
        custom.unwrap_or_else(|| builtin(state, &request))
    };

    send_reply(state, peer.tx.clone(), sync, reply);
}

fn builtin(state: &State, request: &Incoming) -> Reply {
    match request.code() {
        request_type::PING
        | request_type::BEGIN
        | request_type::COMMIT
        | request_type::ROLLBACK => Reply::Ok(Vec::new()),
        request_type::AUTH => authenticate(state, request),
        request_type::SELECT => match request.space_id() {
            Some(281) => {
                state.schema_fetches.fetch_add(1, Ordering::SeqCst);
                Reply::Ok(space_rows(state))
            }
            Some(289) => Reply::Ok(index_rows(state)),
            Some(TESTER_ID) => {
                if let Some((id, space)) = state.alter_on_select.lock().take() {
                    state.spaces.lock().insert(id, space);
                    state.schema_version.fetch_add(1, Ordering::SeqCst);
                }
                let rows = state.rows.lock();
                let found = match request.key().first().and_then(Value::as_u64) {
                    Some(id) => rows.get(&id).cloned().into_iter().collect(),
                    None => rows.values().cloned().collect(),
                };
                Reply::Ok(found)
            }
            Some(other) if state.spaces.lock().contains_key(&other) => Reply::Ok(Vec::new()),
            Some(other) => no_such_space(other),
            None => Reply::Error(1, "Missing space id".to_string()),
        },
        request_type::INSERT | request_type::REPLACE => {
            if request.space_id() != Some(TESTER_ID) {
                return no_such_space(request.space_id().unwrap_or(0));
            }
            let tuple = request.tuple().to_vec();
            let Some(id) = tuple.first().and_then(Value::as_u64) else {
                return Reply::Error(20, "Tuple field 1 type mismatch".to_string());
            };
            let mut rows = state.rows.lock();
            if request.code() == request_type::INSERT && rows.contains_key(&id) {
                return Reply::Error(3, "Duplicate key exists in unique index 'primary'".to_string());
            }
            let row = Value::Array(tuple);
            rows.insert(id, row.clone());
            Reply::Ok(vec![row])
        }
        request_type::DELETE => {
            let id = request.key().first().and_then(Value::as_u64).unwrap_or(0);
            Reply::Ok(state.rows.lock().remove(&id).into_iter().collect())
        }
        request_type::CALL | request_type::EVAL => Reply::Ok(request.tuple().to_vec()),
        other => Reply::Error(48, format!("Unknown request type {}", other)),
    }
}

fn no_such_space(id: u32) -> Reply {
    Reply::Error(codes::ER_NO_SUCH_SPACE, format!("Space '{}' does not exist", id))
}

fn authenticate(state: &State, request: &Incoming) -> Reply {
    if state
        .loading_replies
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return Reply::Error(codes::ER_LOADING, "Instance bootstrap hasn't finished yet".to_string());
    }

    let user = request
        .get(keys::USER_NAME)
        .and_then(Value::as_str)
        .unwrap_or_default();
    let scramble = match request.tuple() {
        [method, Value::Binary(bytes)] if method.as_str() == Some("chap-sha1") => bytes.clone(),
        _ => return Reply::Error(codes::ER_PASSWORD_MISMATCH, "Malformed auth".to_string()),
    };

    match state.users.lock().get(user) {
        Some(password) if verify_scramble(&SALT, password, &scramble) => Reply::Ok(Vec::new()),
        Some(_) => Reply::Error(
            codes::ER_PASSWORD_MISMATCH,
            format!("Incorrect password supplied for user '{}'", user),
        ),
        None => Reply::Error(codes::ER_NO_SUCH_USER, format!("User '{}' is not found", user)),
    }
}

fn space_rows(state: &State) -> Vec<Value> {
    state
        .spaces
        .lock()
        .iter()
        .map(|(id, space)| {
            let format = space
                .fields
                .iter()
                .map(|(name, ty)| {
                    Value::Map(vec![
                        (Value::from("name"), Value::from(*name)),
                        (Value::from("type"), Value::from(*ty)),
                    ])
                })
                .collect();
            Value::Array(vec![
                Value::from(*id),
                Value::from(1),
                Value::from(space.name.as_str()),
                Value::from("memtx"),
                Value::from(0),
                Value::Map(Vec::new()),
                Value::Array(format),
            ])
        })
        .collect()
}

fn index_rows(state: &State) -> Vec<Value> {
    let mut rows = Vec::new();
    for (id, space) in state.spaces.lock().iter() {
        rows.push(index_row(*id, 0, "primary", 0, space.fields[0].1));
        if space.fields.len() > 1 {
            rows.push(index_row(*id, 1, "by_name", 1, space.fields[1].1));
        }
    }
    rows
}

fn index_row(space_id: u32, index_id: u32, name: &str, field_no: u32, ty: &str) -> Value {
    Value::Array(vec![
        Value::from(space_id),
        Value::from(index_id),
        Value::from(name),
        Value::from("tree"),
        Value::Map(vec![(Value::from("unique"), Value::from(index_id == 0))]),
        Value::Array(vec![Value::Array(vec![Value::from(field_no), Value::from(ty)])]),
    ])
}

fn send_event(state: &State, peer: &Peer, key: &str, version: u64) {
    let data = state
        .events
        .lock()
        .get(key)
        .map_or(Value::Nil, |(_, v)| v.clone());
    peer.sent.lock().insert(key.to_string(), version);

    let frame = encode_frame(
        Header::new(codes::EVENT, 0),
        vec![
            (Value::from(keys::EVENT_KEY), Value::from(key)),
            (Value::from(keys::EVENT_DATA), data),
        ],
    );
    let _ = peer.tx.send(frame);
}

fn send_reply(state: &Arc<State>, tx: mpsc::UnboundedSender<Vec<u8>>, sync: u64, reply: Reply) {
    let version = state.schema_version.load(Ordering::SeqCst);
    match reply {
        Reply::Ok(rows) => {
            let header = Header::new(codes::OK, sync).with_schema_version(version);
            let _ = tx.send(encode_frame(header, data_body(rows)));
        }
        Reply::Error(code, message) => {
            let header =
                Header::new(codes::ERROR_FLAG | code, sync).with_schema_version(version);
            let body = vec![(Value::from(keys::ERROR_24), Value::from(message))];
            let _ = tx.send(encode_frame(header, body));
        }
        Reply::Chunks(chunks, rows) => {
            for chunk in chunks {
                let header = Header::new(codes::CHUNK, sync).with_schema_version(version);
                let _ = tx.send(encode_frame(header, data_body(vec![chunk])));
            }
            send_reply(state, tx, sync, Reply::Ok(rows));
        }
        Reply::Delayed(delay, reply) => {
            let later = Arc::clone(state);
            let task = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                send_reply(&later, tx, sync, *reply);
            });
            state.tasks.lock().push(task.abort_handle());
        }
        Reply::Silent => {}
    }
}

fn data_body(rows: Vec<Value>) -> Vec<(Value, Value)> {
    vec![(Value::from(keys::DATA), Value::Array(rows))]
}

fn encode_frame(header: Header, body: Vec<(Value, Value)>) -> Vec<u8> {
    let body = MsgPackCodec::encode(&Value::Map(body)).unwrap();
    build_frame(&header, &body).unwrap()
}

/// Poll until `check` holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
