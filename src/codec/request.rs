//! Request encoding.
//!
//! An [`Operation`] is a request with its arguments as dynamic MsgPack
//! values. Encoding resolves space and index names against a [`Schema`]
//! snapshot and produces the request body map.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rmpv::Value;
use serde::Serialize;

use super::MsgPackCodec;
use crate::error::{Error, Result};
use crate::protocol::{keys, request_type};
use crate::schema::{IndexRef, Schema, SpaceMeta, SpaceRef};

/// Index iterator type for `select`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum IteratorType {
    #[default]
    Eq = 0,
    Req = 1,
    All = 2,
    Lt = 3,
    Le = 4,
    Ge = 5,
    Gt = 6,
    BitsAllSet = 7,
    BitsAnySet = 8,
    BitsAllNotSet = 9,
    Overlaps = 10,
    Neighbor = 11,
}

/// Transaction isolation level for `begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Isolation {
    #[default]
    Default = 0,
    ReadCommitted = 1,
    ReadConfirmed = 2,
    BestEffort = 3,
}

/// Options for `select`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectOptions {
    pub index: IndexRef,
    pub offset: u32,
    pub limit: u32,
    pub iterator: IteratorType,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            index: IndexRef::Id(0),
            offset: 0,
            limit: u32::MAX,
            iterator: IteratorType::Eq,
        }
    }
}

impl SelectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(mut self, index: impl Into<IndexRef>) -> Self {
        self.index = index.into();
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn iterator(mut self, iterator: IteratorType) -> Self {
        self.iterator = iterator;
        self
    }
}

/// A request with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Ping,
    Select {
        space: SpaceRef,
        key: Value,
        options: SelectOptions,
    },
    Insert {
        space: SpaceRef,
        tuple: Value,
    },
    Replace {
        space: SpaceRef,
        tuple: Value,
    },
    Update {
        space: SpaceRef,
        index: IndexRef,
        key: Value,
        ops: Value,
    },
    Upsert {
        space: SpaceRef,
        tuple: Value,
        ops: Value,
    },
    Delete {
        space: SpaceRef,
        index: IndexRef,
        key: Value,
    },
    Call {
        function: String,
        args: Value,
    },
    Eval {
        expression: String,
        args: Value,
    },
    Begin {
        timeout: Option<Duration>,
        isolation: Isolation,
    },
    Commit,
    Rollback,
    Watch {
        key: String,
    },
    Unwatch {
        key: String,
    },
}

/// Encoded request ready for submission.
#[derive(Debug, Clone)]
pub struct EncodedRequest {
    /// Request type code.
    pub code: u32,
    /// Body map (empty for body-less requests).
    pub body: Bytes,
    /// Space the request targets, when it was known to the snapshot.
    pub space: Option<Arc<SpaceMeta>>,
    /// Whether the body depends on the schema snapshot.
    pub schema_bound: bool,
}

impl Operation {
    /// `select` with a serde key (`()` for all, a scalar or a tuple).
    pub fn select<K: Serialize>(
        space: impl Into<SpaceRef>,
        key: K,
        options: SelectOptions,
    ) -> Result<Self> {
        Ok(Operation::Select {
            space: space.into(),
            key: MsgPackCodec::to_value(key)?,
            options,
        })
    }

    pub fn insert<T: Serialize>(space: impl Into<SpaceRef>, tuple: T) -> Result<Self> {
        Ok(Operation::Insert {
            space: space.into(),
            tuple: MsgPackCodec::to_value(tuple)?,
        })
    }

    pub fn replace<T: Serialize>(space: impl Into<SpaceRef>, tuple: T) -> Result<Self> {
        Ok(Operation::Replace {
            space: space.into(),
            tuple: MsgPackCodec::to_value(tuple)?,
        })
    }

    /// `update` through the primary index.
    pub fn update<K: Serialize, O: Serialize>(
        space: impl Into<SpaceRef>,
        key: K,
        ops: O,
    ) -> Result<Self> {
        Ok(Operation::Update {
            space: space.into(),
            index: IndexRef::Id(0),
            key: MsgPackCodec::to_value(key)?,
            ops: MsgPackCodec::to_value(ops)?,
        })
    }

    pub fn upsert<T: Serialize, O: Serialize>(
        space: impl Into<SpaceRef>,
        tuple: T,
        ops: O,
    ) -> Result<Self> {
        Ok(Operation::Upsert {
            space: space.into(),
            tuple: MsgPackCodec::to_value(tuple)?,
            ops: MsgPackCodec::to_value(ops)?,
        })
    }

    /// `delete` through the primary index.
    pub fn delete<K: Serialize>(space: impl Into<SpaceRef>, key: K) -> Result<Self> {
        Ok(Operation::Delete {
            space: space.into(),
            index: IndexRef::Id(0),
            key: MsgPackCodec::to_value(key)?,
        })
    }

    pub fn call<A: Serialize>(function: impl Into<String>, args: A) -> Result<Self> {
        Ok(Operation::Call {
            function: function.into(),
            args: MsgPackCodec::to_value(args)?,
        })
    }

    pub fn eval<A: Serialize>(expression: impl Into<String>, args: A) -> Result<Self> {
        Ok(Operation::Eval {
            expression: expression.into(),
            args: MsgPackCodec::to_value(args)?,
        })
    }

    /// Request type code.
    pub fn code(&self) -> u32 {
        match self {
            Operation::Ping => request_type::PING,
            Operation::Select { .. } => request_type::SELECT,
            Operation::Insert { .. } => request_type::INSERT,
            Operation::Replace { .. } => request_type::REPLACE,
            Operation::Update { .. } => request_type::UPDATE,
            Operation::Upsert { .. } => request_type::UPSERT,
            Operation::Delete { .. } => request_type::DELETE,
            Operation::Call { .. } => request_type::CALL,
            Operation::Eval { .. } => request_type::EVAL,
            Operation::Begin { .. } => request_type::BEGIN,
            Operation::Commit => request_type::COMMIT,
            Operation::Rollback => request_type::ROLLBACK,
            Operation::Watch { .. } => request_type::WATCH,
            Operation::Unwatch { .. } => request_type::UNWATCH,
        }
    }

    /// Space referenced by this operation, if any.
    pub fn space(&self) -> Option<&SpaceRef> {
        match self {
            Operation::Select { space, .. }
            | Operation::Insert { space, .. }
            | Operation::Replace { space, .. }
            | Operation::Update { space, .. }
            | Operation::Upsert { space, .. }
            | Operation::Delete { space, .. } => Some(space),
            _ => None,
        }
    }

    /// Encode the request body against a schema snapshot.
    ///
    /// Fails with [`Error::Schema`] when a space or index name is not in the
    /// snapshot.
    pub fn encode(&self, schema: &Schema) -> Result<EncodedRequest> {
        let space_meta = self.space().and_then(|s| schema.space(s)).cloned();
        let mut buf = Vec::with_capacity(64);

        match self {
            Operation::Ping | Operation::Commit | Operation::Rollback => {}

            Operation::Select {
                space,
                key,
                options,
            } => {
                let space_id = schema.resolve_space(space)?;
                let index_id = schema.resolve_index(space, &options.index)?;
                rmp::encode::write_map_len(&mut buf, 6)?;
                write_uint_entry(&mut buf, keys::SPACE_ID, u64::from(space_id))?;
                write_uint_entry(&mut buf, keys::INDEX_ID, u64::from(index_id))?;
                write_uint_entry(&mut buf, keys::LIMIT, u64::from(options.limit))?;
                write_uint_entry(&mut buf, keys::OFFSET, u64::from(options.offset))?;
                write_uint_entry(&mut buf, keys::ITERATOR, options.iterator as u64)?;
                write_value_entry(&mut buf, keys::KEY, &normalize_key(key))?;
            }

            Operation::Insert { space, tuple } | Operation::Replace { space, tuple } => {
                let space_id = schema.resolve_space(space)?;
                let tuple = tuple_from_value(tuple, space_meta.as_deref())?;
                rmp::encode::write_map_len(&mut buf, 2)?;
                write_uint_entry(&mut buf, keys::SPACE_ID, u64::from(space_id))?;
                write_value_entry(&mut buf, keys::TUPLE, &tuple)?;
            }

            Operation::Update {
                space,
                index,
                key,
                ops,
            } => {
                let space_id = schema.resolve_space(space)?;
                let index_id = schema.resolve_index(space, index)?;
                rmp::encode::write_map_len(&mut buf, 4)?;
                write_uint_entry(&mut buf, keys::SPACE_ID, u64::from(space_id))?;
                write_uint_entry(&mut buf, keys::INDEX_ID, u64::from(index_id))?;
                write_value_entry(&mut buf, keys::KEY, &normalize_key(key))?;
                write_value_entry(&mut buf, keys::TUPLE, ops)?;
            }

            Operation::Upsert { space, tuple, ops } => {
                let space_id = schema.resolve_space(space)?;
                let tuple = tuple_from_value(tuple, space_meta.as_deref())?;
                rmp::encode::write_map_len(&mut buf, 3)?;
                write_uint_entry(&mut buf, keys::SPACE_ID, u64::from(space_id))?;
                write_value_entry(&mut buf, keys::TUPLE, &tuple)?;
                write_value_entry(&mut buf, keys::OPS, ops)?;
            }

            Operation::Delete { space, index, key } => {
                let space_id = schema.resolve_space(space)?;
                let index_id = schema.resolve_index(space, index)?;
                rmp::encode::write_map_len(&mut buf, 3)?;
                write_uint_entry(&mut buf, keys::SPACE_ID, u64::from(space_id))?;
                write_uint_entry(&mut buf, keys::INDEX_ID, u64::from(index_id))?;
                write_value_entry(&mut buf, keys::KEY, &normalize_key(key))?;
            }

            Operation::Call { function, args } => {
                rmp::encode::write_map_len(&mut buf, 2)?;
                rmp::encode::write_pfix(&mut buf, keys::FUNCTION_NAME)?;
                rmp::encode::write_str(&mut buf, function)?;
                write_value_entry(&mut buf, keys::TUPLE, &normalize_key(args))?;
            }

            Operation::Eval { expression, args } => {
                rmp::encode::write_map_len(&mut buf, 2)?;
                rmp::encode::write_pfix(&mut buf, keys::EXPR)?;
                rmp::encode::write_str(&mut buf, expression)?;
                write_value_entry(&mut buf, keys::TUPLE, &normalize_key(args))?;
            }

            Operation::Begin { timeout, isolation } => {
                let len = u32::from(timeout.is_some()) + u32::from(*isolation != Isolation::Default);
                rmp::encode::write_map_len(&mut buf, len)?;
                if let Some(timeout) = timeout {
                    rmp::encode::write_pfix(&mut buf, keys::TIMEOUT)?;
                    rmp::encode::write_f64(&mut buf, timeout.as_secs_f64())?;
                }
                if *isolation != Isolation::Default {
                    write_uint_entry(&mut buf, keys::TXN_ISOLATION, *isolation as u64)?;
                }
            }

            Operation::Watch { key } | Operation::Unwatch { key } => {
                rmp::encode::write_map_len(&mut buf, 1)?;
                rmp::encode::write_pfix(&mut buf, keys::EVENT_KEY)?;
                rmp::encode::write_str(&mut buf, key)?;
            }
        }

        Ok(EncodedRequest {
            code: self.code(),
            body: Bytes::from(buf),
            space: space_meta,
            schema_bound: self.space().is_some(),
        })
    }
}

fn write_uint_entry(buf: &mut Vec<u8>, key: u8, value: u64) -> Result<()> {
    rmp::encode::write_pfix(buf, key)?;
    rmp::encode::write_uint(buf, value)?;
    Ok(())
}

fn write_value_entry(buf: &mut Vec<u8>, key: u8, value: &Value) -> Result<()> {
    rmp::encode::write_pfix(buf, key)?;
    MsgPackCodec::write_value(buf, value)
}

/// Keys and argument lists are always arrays: nil becomes `[]`, a scalar
/// becomes a one-element array.
fn normalize_key(key: &Value) -> Value {
    match key {
        Value::Nil => Value::Array(Vec::new()),
        Value::Array(_) => key.clone(),
        other => Value::Array(vec![other.clone()]),
    }
}

/// Turn a tuple given as a map of field names into a positional array using
/// the space format. Arrays pass through unchanged.
fn tuple_from_value(tuple: &Value, space: Option<&SpaceMeta>) -> Result<Value> {
    let Value::Map(entries) = tuple else {
        return Ok(tuple.clone());
    };

    let space = space.ok_or_else(|| {
        Error::Schema("Tuple given as a map but the space format is unknown".to_string())
    })?;
    if space.fields.is_empty() {
        return Err(Error::Schema(format!(
            "Space '{}' has no format to map field names",
            space.name
        )));
    }

    let mut fields = vec![Value::Nil; space.fields.len()];
    for (name, value) in entries {
        let name = name
            .as_str()
            .ok_or_else(|| Error::Decode(format!("Field name must be a string, got {}", name)))?;
        let position = space.field_no(name).ok_or_else(|| {
            Error::Schema(format!("Field '{}' not found in space '{}'", name, space.name))
        })?;
        fields[position] = value.clone();
    }

    // Trailing nils are left out so nullable tail fields stay absent.
    while matches!(fields.last(), Some(Value::Nil)) {
        fields.pop();
    }
    Ok(Value::Array(fields))
}
