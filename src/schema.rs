//! Remote schema snapshots and the schema cache.
//!
//! A [`Schema`] is an immutable snapshot of the server's spaces and indexes
//! at one schema version. The [`SchemaCache`] publishes snapshots by swapping
//! an `Arc`, so readers always see a complete snapshot, and collapses
//! concurrent refetch requests into a single fetch.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rmpv::Value;

use crate::error::{Error, Result};

/// System view listing spaces visible to the current user.
pub const VSPACE_ID: u32 = 281;
/// System view listing indexes visible to the current user.
pub const VINDEX_ID: u32 = 289;

/// Reference to a space by name or numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SpaceRef {
    Name(String),
    Id(u32),
}

impl From<&str> for SpaceRef {
    fn from(name: &str) -> Self {
        SpaceRef::Name(name.to_string())
    }
}

impl From<String> for SpaceRef {
    fn from(name: String) -> Self {
        SpaceRef::Name(name)
    }
}

impl From<u32> for SpaceRef {
    fn from(id: u32) -> Self {
        SpaceRef::Id(id)
    }
}

impl fmt::Display for SpaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceRef::Name(name) => write!(f, "'{}'", name),
            SpaceRef::Id(id) => write!(f, "#{}", id),
        }
    }
}

/// Reference to an index by name or numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexRef {
    Name(String),
    Id(u32),
}

impl Default for IndexRef {
    fn default() -> Self {
        IndexRef::Id(0)
    }
}

impl From<&str> for IndexRef {
    fn from(name: &str) -> Self {
        IndexRef::Name(name.to_string())
    }
}

impl From<String> for IndexRef {
    fn from(name: String) -> Self {
        IndexRef::Name(name)
    }
}

impl From<u32> for IndexRef {
    fn from(id: u32) -> Self {
        IndexRef::Id(id)
    }
}

impl fmt::Display for IndexRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexRef::Name(name) => write!(f, "'{}'", name),
            IndexRef::Id(id) => write!(f, "#{}", id),
        }
    }
}

/// One entry of a space format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub field_type: String,
    pub is_nullable: bool,
}

/// One key part of an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPart {
    /// Zero-based field number.
    pub field_no: u32,
    pub field_type: String,
}

/// Index descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMeta {
    pub space_id: u32,
    pub id: u32,
    pub name: String,
    /// Index type, e.g. `TREE` or `HASH`.
    pub index_type: String,
    pub unique: bool,
    pub parts: Vec<IndexPart>,
}

/// Space descriptor with its format and indexes.
#[derive(Debug, Clone, Default)]
pub struct SpaceMeta {
    pub id: u32,
    pub name: String,
    pub engine: String,
    pub field_count: u32,
    pub fields: Vec<Field>,
    field_numbers: HashMap<String, usize>,
    indexes_by_name: HashMap<String, Arc<IndexMeta>>,
    indexes_by_id: HashMap<u32, Arc<IndexMeta>>,
}

impl SpaceMeta {
    /// Create a space descriptor from its format.
    pub fn new(id: u32, name: impl Into<String>, engine: impl Into<String>, fields: Vec<Field>) -> Self {
        let field_numbers = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Self {
            id,
            name: name.into(),
            engine: engine.into(),
            field_count: 0,
            fields,
            field_numbers,
            indexes_by_name: HashMap::new(),
            indexes_by_id: HashMap::new(),
        }
    }

    /// Attach an index to this space.
    pub fn add_index(&mut self, index: IndexMeta) {
        let index = Arc::new(index);
        self.indexes_by_name
            .insert(index.name.clone(), Arc::clone(&index));
        self.indexes_by_id.insert(index.id, index);
    }

    /// Zero-based position of a field in the space format.
    pub fn field_no(&self, name: &str) -> Option<usize> {
        self.field_numbers.get(name).copied()
    }

    /// Field names in format order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Resolve an index reference.
    pub fn index(&self, index: &IndexRef) -> Option<&Arc<IndexMeta>> {
        match index {
            IndexRef::Name(name) => self.indexes_by_name.get(name),
            IndexRef::Id(id) => self.indexes_by_id.get(id),
        }
    }

    /// Number of indexes on this space.
    pub fn index_count(&self) -> usize {
        self.indexes_by_id.len()
    }
}

/// Immutable snapshot of the remote schema.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    version: u64,
    by_name: HashMap<String, Arc<SpaceMeta>>,
    by_id: HashMap<u32, Arc<SpaceMeta>>,
}

impl Schema {
    /// Empty snapshot (version 0, no spaces).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from a list of spaces.
    pub fn new(version: u64, spaces: impl IntoIterator<Item = SpaceMeta>) -> Self {
        let mut schema = Self {
            version,
            ..Self::default()
        };
        for space in spaces {
            let space = Arc::new(space);
            schema
                .by_name
                .insert(space.name.clone(), Arc::clone(&space));
            schema.by_id.insert(space.id, space);
        }
        schema
    }

    /// Build a snapshot from `_vspace` and `_vindex` rows.
    ///
    /// Indexes whose space is not present are ignored.
    pub fn from_system_rows(version: u64, spaces: &[Value], indexes: &[Value]) -> Result<Self> {
        let mut by_id: HashMap<u32, SpaceMeta> = HashMap::with_capacity(spaces.len());
        for row in spaces {
            let space = parse_space_row(row)?;
            by_id.insert(space.id, space);
        }

        for row in indexes {
            let index = parse_index_row(row)?;
            if let Some(space) = by_id.get_mut(&index.space_id) {
                space.add_index(index);
            }
        }

        Ok(Self::new(version, by_id.into_values()))
    }

    /// Schema version this snapshot was fetched at.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of spaces.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the snapshot holds no spaces.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Resolve a space reference.
    pub fn space(&self, space: &SpaceRef) -> Option<&Arc<SpaceMeta>> {
        match space {
            SpaceRef::Name(name) => self.by_name.get(name),
            SpaceRef::Id(id) => self.by_id.get(id),
        }
    }

    /// Look up a space by name.
    pub fn space_by_name(&self, name: &str) -> Option<&Arc<SpaceMeta>> {
        self.by_name.get(name)
    }

    /// Look up a space by id.
    pub fn space_by_id(&self, id: u32) -> Option<&Arc<SpaceMeta>> {
        self.by_id.get(&id)
    }

    /// Resolve a space reference to its numeric id.
    ///
    /// Numeric ids resolve without consulting the snapshot.
    pub fn resolve_space(&self, space: &SpaceRef) -> Result<u32> {
        match space {
            SpaceRef::Id(id) => Ok(*id),
            SpaceRef::Name(_) => self
                .space(space)
                .map(|s| s.id)
                .ok_or_else(|| Error::Schema(format!("Space {} not found", space))),
        }
    }

    /// Resolve an index reference within a space to its numeric id.
    pub fn resolve_index(&self, space: &SpaceRef, index: &IndexRef) -> Result<u32> {
        match index {
            IndexRef::Id(id) => Ok(*id),
            IndexRef::Name(_) => {
                let meta = self
                    .space(space)
                    .ok_or_else(|| Error::Schema(format!("Space {} not found", space)))?;
                meta.index(index).map(|i| i.id).ok_or_else(|| {
                    Error::Schema(format!("Index {} not found in space {}", index, space))
                })
            }
        }
    }
}

fn decode_err(what: &str, row: &Value) -> Error {
    Error::Decode(format!("Malformed {} row: {}", what, row))
}

fn as_u32(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|v| u32::try_from(v).ok())
}

/// `[id, owner, name, engine, field_count, flags, format]`
fn parse_space_row(row: &Value) -> Result<SpaceMeta> {
    let cols = row.as_array().ok_or_else(|| decode_err("_vspace", row))?;
    if cols.len() < 4 {
        return Err(decode_err("_vspace", row));
    }

    let id = as_u32(&cols[0]).ok_or_else(|| decode_err("_vspace", row))?;
    let name = cols[2].as_str().ok_or_else(|| decode_err("_vspace", row))?;
    let engine = cols[3].as_str().unwrap_or("memtx");
    let field_count = cols.get(4).and_then(as_u32).unwrap_or(0);

    let fields = match cols.get(6).and_then(Value::as_array) {
        Some(format) => format.iter().filter_map(parse_format_entry).collect(),
        None => Vec::new(),
    };

    let mut space = SpaceMeta::new(id, name, engine, fields);
    space.field_count = field_count;
    Ok(space)
}

/// `{name = "id", type = "unsigned", is_nullable = false}`
fn parse_format_entry(entry: &Value) -> Option<Field> {
    let map = entry.as_map()?;
    let mut field = Field {
        name: String::new(),
        field_type: "any".to_string(),
        is_nullable: false,
    };
    for (k, v) in map {
        match k.as_str() {
            Some("name") => field.name = v.as_str()?.to_string(),
            Some("type") => {
                if let Some(t) = v.as_str() {
                    field.field_type = t.to_string();
                }
            }
            Some("is_nullable") => field.is_nullable = v.as_bool().unwrap_or(false),
            _ => {}
        }
    }
    (!field.name.is_empty()).then_some(field)
}

/// `[space_id, index_id, name, type, opts, parts]`
fn parse_index_row(row: &Value) -> Result<IndexMeta> {
    let cols = row.as_array().ok_or_else(|| decode_err("_vindex", row))?;
    if cols.len() < 4 {
        return Err(decode_err("_vindex", row));
    }

    let space_id = as_u32(&cols[0]).ok_or_else(|| decode_err("_vindex", row))?;
    let id = as_u32(&cols[1]).ok_or_else(|| decode_err("_vindex", row))?;
    let name = cols[2]
        .as_str()
        .ok_or_else(|| decode_err("_vindex", row))?
        .to_string();
    let index_type = cols[3].as_str().unwrap_or("TREE").to_string();

    let unique = cols
        .get(4)
        .and_then(Value::as_map)
        .and_then(|opts| {
            opts.iter()
                .find(|(k, _)| k.as_str() == Some("unique"))
                .and_then(|(_, v)| v.as_bool())
        })
        .unwrap_or(false);

    let parts = match cols.get(5).and_then(Value::as_array) {
        Some(parts) => parts.iter().filter_map(parse_index_part).collect(),
        None => Vec::new(),
    };

    Ok(IndexMeta {
        space_id,
        id,
        name,
        index_type,
        unique,
        parts,
    })
}

/// Either the legacy `[field_no, type]` pair or `{field = n, type = t}`.
fn parse_index_part(part: &Value) -> Option<IndexPart> {
    match part {
        Value::Array(pair) => Some(IndexPart {
            field_no: as_u32(pair.first()?)?,
            field_type: pair.get(1).and_then(Value::as_str).unwrap_or("any").to_string(),
        }),
        Value::Map(entries) => {
            let mut field_no = None;
            let mut field_type = "any".to_string();
            for (k, v) in entries {
                match k.as_str() {
                    Some("field") => field_no = as_u32(v),
                    Some("type") => {
                        if let Some(t) = v.as_str() {
                            field_type = t.to_string();
                        }
                    }
                    _ => {}
                }
            }
            Some(IndexPart {
                field_no: field_no?,
                field_type,
            })
        }
        _ => None,
    }
}

/// Outcome of the most recent fetch, shared with callers that waited on it.
#[derive(Debug, Default)]
struct FetchState {
    last_error: Option<Error>,
}

/// Schema cache with atomic snapshot swap and single-flight refetch.
#[derive(Debug)]
pub struct SchemaCache {
    current: RwLock<Arc<Schema>>,
    /// Number of completed fetches (successful or not).
    fetches: AtomicU64,
    fetch: tokio::sync::Mutex<FetchState>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Schema::empty())),
            fetches: AtomicU64::new(0),
            fetch: tokio::sync::Mutex::new(FetchState::default()),
        }
    }

    /// Current snapshot.
    pub fn current(&self) -> Arc<Schema> {
        Arc::clone(&self.current.read())
    }

    /// Version of the current snapshot (0 when nothing was fetched).
    pub fn version(&self) -> u64 {
        self.current.read().version()
    }

    /// Number of fetches run so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Acquire)
    }

    /// Replace the current snapshot.
    pub fn publish(&self, schema: Arc<Schema>) {
        let mut current = self.current.write();
        if schema.version() < current.version() {
            tracing::warn!(
                "Schema version went backwards: {} -> {}",
                current.version(),
                schema.version()
            );
        } else {
            tracing::debug!(
                "Schema updated: version {} -> {} ({} spaces)",
                current.version(),
                schema.version(),
                schema.len()
            );
        }
        *current = schema;
    }

    /// Drop the current snapshot.
    pub fn clear(&self) {
        *self.current.write() = Arc::new(Schema::empty());
    }

    /// Fetch a new snapshot, collapsing concurrent calls.
    ///
    /// Callers that arrive while a fetch is running wait for it and get its
    /// outcome instead of starting another one.
    pub async fn refetch<F, Fut>(&self, fetch: F) -> Result<Arc<Schema>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Schema>>,
    {
        self.refetch_inner(None, fetch).await
    }

    /// Like [`refetch`](Self::refetch), but returns the current snapshot
    /// without fetching when it is already at `version` or newer.
    pub async fn refetch_if_older<F, Fut>(&self, version: u64, fetch: F) -> Result<Arc<Schema>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Schema>>,
    {
        self.refetch_inner(Some(version), fetch).await
    }

    async fn refetch_inner<F, Fut>(&self, min_version: Option<u64>, fetch: F) -> Result<Arc<Schema>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Schema>>,
    {
        let seen = self.fetches.load(Ordering::Acquire);
        let mut state = self.fetch.lock().await;

        if self.fetches.load(Ordering::Acquire) != seen {
            return match &state.last_error {
                None => Ok(self.current()),
                Some(err) => Err(err.replicate()),
            };
        }

        if let Some(version) = min_version {
            let current = self.current();
            if current.version() >= version {
                return Ok(current);
            }
        }

        let outcome = fetch().await;
        let result = match outcome {
            Ok(schema) => {
                let schema = Arc::new(schema);
                self.publish(Arc::clone(&schema));
                state.last_error = None;
                Ok(schema)
            }
            Err(e) => {
                tracing::warn!("Schema fetch failed: {}", e);
                state.last_error = Some(e.replicate());
                Err(e)
            }
        };
        self.fetches.fetch_add(1, Ordering::AcqRel);
        result
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}
