//! Response decoding.

use std::sync::Arc;

use rmpv::Value;
use serde::de::DeserializeOwned;

use super::MsgPackCodec;
use crate::error::{Error, Result};
use crate::protocol::{keys, Frame};
use crate::schema::SpaceMeta;

/// Decoded reply to a request.
#[derive(Debug, Clone)]
pub struct Response {
    pub sync: u64,
    pub code: u32,
    pub schema_version: u64,
    /// Rows for CRUD requests, return values for `call`/`eval`.
    pub data: Vec<Value>,
    space: Option<Arc<SpaceMeta>>,
}

impl Response {
    /// Space descriptor used for field-name access, if known.
    pub fn space(&self) -> Option<&Arc<SpaceMeta>> {
        self.space.as_ref()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Row views over the data.
    pub fn rows(&self) -> impl Iterator<Item = Tuple<'_>> {
        let space = self.space.as_deref();
        self.data.iter().map(move |value| Tuple { value, space })
    }

    /// Row at `index`.
    pub fn row(&self, index: usize) -> Option<Tuple<'_>> {
        self.data.get(index).map(|value| Tuple {
            value,
            space: self.space.as_deref(),
        })
    }

    /// Decode the whole data array into `T`, e.g. `Vec<(u32, String)>`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::from_value(Value::Array(self.data.clone()))
    }

    /// Take ownership of the raw data values.
    pub fn into_data(self) -> Vec<Value> {
        self.data
    }
}

/// Borrowed view of one row, with positional and by-name field access.
#[derive(Debug, Clone, Copy)]
pub struct Tuple<'a> {
    value: &'a Value,
    space: Option<&'a SpaceMeta>,
}

impl<'a> Tuple<'a> {
    /// Underlying value.
    pub fn value(&self) -> &'a Value {
        self.value
    }

    /// Number of fields (0 for a non-array row).
    pub fn len(&self) -> usize {
        self.value.as_array().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Field by position.
    pub fn get(&self, index: usize) -> Option<&'a Value> {
        self.value.as_array().and_then(|fields| fields.get(index))
    }

    /// Field by name, using the space format.
    pub fn field(&self, name: &str) -> Option<&'a Value> {
        let position = self.space?.field_no(name)?;
        self.get(position)
    }

    /// `(name, value)` pairs for the fields covered by the space format.
    pub fn named_fields(&self) -> Vec<(&'a str, &'a Value)> {
        let Some(space) = self.space else {
            return Vec::new();
        };
        space
            .fields
            .iter()
            .zip(self.value.as_array().into_iter().flatten())
            .map(|(field, value)| (field.name.as_str(), value))
            .collect()
    }

    /// Decode this row into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::from_value(self.value.clone())
    }
}

/// Server-initiated notification: an in-band push chunk or a watcher event.
#[derive(Debug, Clone, PartialEq)]
pub struct PushNotification {
    /// Sync of the request that produced the chunk, 0 for events.
    pub sync: u64,
    pub code: u32,
    /// Watched key, for events.
    pub key: Option<String>,
    pub data: Value,
}

impl PushNotification {
    /// Build a notification from a push or event frame.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let mut body = body_entries(frame.body())?;
        let (key, data) = if frame.is_event() {
            let key = take(&mut body, keys::EVENT_KEY)
                .and_then(|k| k.as_str().map(str::to_string));
            (key, take(&mut body, keys::EVENT_DATA).unwrap_or(Value::Nil))
        } else {
            (None, take(&mut body, keys::DATA).unwrap_or(Value::Nil))
        };

        Ok(Self {
            sync: frame.sync(),
            code: frame.code(),
            key,
            data,
        })
    }

    /// Decode the payload into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::from_value(self.data.clone())
    }
}

/// Decode a reply frame.
///
/// Error frames become [`Error::Remote`] carrying the server message.
pub fn decode_reply(frame: &Frame, space: Option<Arc<SpaceMeta>>) -> Result<Response> {
    let mut body = body_entries(frame.body())?;

    if frame.is_error() {
        let message = take(&mut body, keys::ERROR_24)
            .and_then(|m| m.as_str().map(str::to_string))
            .unwrap_or_default();
        return Err(Error::Remote {
            code: frame.header.error_code(),
            message,
        });
    }

    let data = match take(&mut body, keys::DATA) {
        Some(Value::Array(rows)) => rows,
        Some(other) => vec![other],
        None => Vec::new(),
    };

    Ok(Response {
        sync: frame.sync(),
        code: frame.code(),
        schema_version: frame.schema_version(),
        data,
        space,
    })
}

fn body_entries(body: &[u8]) -> Result<Vec<(Value, Value)>> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let mut cursor = body;
    match MsgPackCodec::read_value(&mut cursor)? {
        Value::Map(entries) => Ok(entries),
        other => Err(Error::Decode(format!("Body is not a map: {}", other))),
    }
}

fn take(entries: &mut Vec<(Value, Value)>, key: u8) -> Option<Value> {
    let position = entries
        .iter()
        .position(|(k, _)| k.as_u64() == Some(u64::from(key)))?;
    Some(entries.swap_remove(position).1)
}
