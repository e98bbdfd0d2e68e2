//! Document helpers shared by backends: id extraction and update changes.

use serde_json::{Map, Value};

use crate::error::{ClientError, ClientResult};

/// Field holding a document's primary key.
pub const ID_FIELD: &str = "_id";

/// Extract the string key of a document. Numeric ids are stringified.
pub fn document_id(doc: &Value) -> ClientResult<String> {
    match doc.get(ID_FIELD) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(ClientError::Document(format!(
            "{ID_FIELD} must be a string or number, got {other}"
        ))),
        None => Err(ClientError::Document(format!("missing {ID_FIELD}"))),
    }
}

/// Options for `Collection::update`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Create the document if it does not exist.
    pub upsert: bool,
}

impl UpdateOptions {
    pub fn upsert() -> Self {
        Self { upsert: true }
    }
}

/// A modification applied to a single document.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    /// Overwrite the given top-level fields.
    Set(Map<String, Value>),
    /// Add `by` to an integer field (missing counts as 0).
    Inc { field: String, by: i64 },
}

impl Change {
    /// Build a `Set` change from a JSON object.
    pub fn set(fields: Value) -> ClientResult<Self> {
        match fields {
            Value::Object(map) => Ok(Change::Set(map)),
            other => Err(ClientError::Document(format!(
                "set requires an object, got {other}"
            ))),
        }
    }

    pub fn inc(field: &str, by: i64) -> Self {
        Change::Inc {
            field: field.to_string(),
            by,
        }
    }

    /// Apply this change to `doc` in place. `_id` is never rewritten.
    pub fn apply(&self, doc: &mut Value) -> ClientResult<()> {
        let obj = doc
            .as_object_mut()
            .ok_or_else(|| ClientError::Document("document is not an object".to_string()))?;

        match self {
            Change::Set(fields) => {
                for (key, value) in fields {
                    if key == ID_FIELD {
                        continue;
                    }
                    obj.insert(key.clone(), value.clone());
                }
            }
            Change::Inc { field, by } => {
                let current = match obj.get(field) {
                    None | Some(Value::Null) => 0,
                    Some(Value::Number(n)) => n.as_i64().ok_or_else(|| {
                        ClientError::Document(format!("{field} is not an integer"))
                    })?,
                    Some(other) => {
                        return Err(ClientError::Document(format!(
                            "cannot increment non-numeric {field}: {other}"
                        )));
                    }
                };
                obj.insert(field.clone(), Value::from(current + by));
            }
        }
        Ok(())
    }
}
