//! Document wire-form helpers.
//!
//! Documents round-trip through a JSON value form on their way to the
//! store. The one transformation applied here is identity mapping: the
//! document's declared key field is carried as the store's native `_id`
//! field on the wire, and restored on the way back.

use serde_json::Value;

use dockache_core::document::Document;
use dockache_core::error::StorageError;

/// The store's native primary-key field.
pub const ID_FIELD: &str = "_id";

fn codec(message: impl Into<String>) -> StorageError {
    StorageError::Codec {
        message: message.into(),
    }
}

/// Serialize a document into wire form, moving the key field to `_id`.
pub fn to_wire<D: Document>(doc: &D) -> Result<Value, StorageError> {
    let mut value = serde_json::to_value(doc).map_err(|e| codec(e.to_string()))?;
    let obj = value
        .as_object_mut()
        .ok_or_else(|| codec("document did not serialize to an object"))?;
    let key = obj
        .remove(D::KEY_FIELD)
        .ok_or_else(|| codec(format!("missing key field '{}'", D::KEY_FIELD)))?;
    obj.insert(ID_FIELD.to_string(), key);
    Ok(value)
}

/// Deserialize a document from wire form, restoring the declared key field.
pub fn from_wire<D: Document>(mut value: Value) -> Result<D, StorageError> {
    let obj = value
        .as_object_mut()
        .ok_or_else(|| codec("wire document is not an object"))?;
    let id = obj
        .remove(ID_FIELD)
        .ok_or_else(|| codec(format!("wire document missing '{ID_FIELD}'")))?;
    obj.insert(D::KEY_FIELD.to_string(), id);
    serde_json::from_value(value).map_err(|e| codec(e.to_string()))
}

/// Read the version counter off a wire document.
pub fn wire_version<D: Document>(value: &Value) -> Option<i64> {
    value.get(D::VERSION_FIELD).and_then(Value::as_i64)
}
