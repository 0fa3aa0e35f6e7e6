//! Conversion between the public shape of an item and its stored document.
//!
//! Items are serialized with serde into a JSON object. On the way in, field
//! names are lower-cased and the identity field `id` becomes `_id`; on the
//! way out `_id` becomes `id` again and top-level keys are matched against
//! the target struct's field names case-insensitively, so renamed fields
//! (`camelCase`, `PascalCase`) survive the round trip.

use crate::driver::{Document, IndexModel, IndexOptions};
use crate::error::{PersistenceError, Result};
use serde::de::{DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, forward_to_deserialize_any};
use serde_json::Value;

pub const PUBLIC_ID_FIELD: &str = "id";
pub const INTERNAL_ID_FIELD: &str = "_id";

/// Lower-case the keys of a public document and move `id` to `_id`.
pub fn to_internal_document(public: Document) -> Document {
    let mut internal = Document::new();
    for (key, value) in public {
        let key = key.to_lowercase();
        if key == PUBLIC_ID_FIELD {
            // identity first, the way it is stored
            let mut reordered = Document::new();
            reordered.insert(INTERNAL_ID_FIELD.to_string(), value);
            reordered.extend(internal);
            internal = reordered;
        } else {
            internal.insert(key, value);
        }
    }
    internal
}

/// Move `_id` back to `id`, keeping field order.
pub fn to_public_document(internal: Document) -> Document {
    internal
        .into_iter()
        .map(|(key, value)| {
            if key == INTERNAL_ID_FIELD {
                (PUBLIC_ID_FIELD.to_string(), value)
            } else {
                (key, value)
            }
        })
        .collect()
}

/// `doc` with `_id` set to `id` unless it already has one.
pub fn with_identity(doc: Document, id: Value) -> Document {
    if doc.contains_key(INTERNAL_ID_FIELD) {
        return doc;
    }
    let mut stored = Document::new();
    stored.insert(INTERNAL_ID_FIELD.to_string(), id);
    stored.extend(doc);
    stored
}

pub fn serialize_item<T: Serialize>(item: &T) -> Result<Document> {
    match serde_json::to_value(item)? {
        Value::Object(map) => Ok(map),
        other => Err(PersistenceError::Conversion(format!(
            "item must serialize to a document, got {}",
            json_type(&other)
        ))),
    }
}

pub fn from_public<T: Serialize>(item: &T) -> Result<Document> {
    serialize_item(item).map(to_internal_document)
}

pub fn to_public<T: DeserializeOwned>(doc: Document) -> Result<T> {
    Ok(T::deserialize(FieldNames(Value::Object(to_public_document(doc))))?)
}

/// Gives lower-cased keys back the casing of the struct fields they
/// deserialize into. Only the top level is rewritten.
struct FieldNames(Value);

impl<'de> Deserializer<'de> for FieldNames {
    type Error = serde_json::Error;

    fn deserialize_any<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        self.0.deserialize_any(visitor)
    }

    fn deserialize_option<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        self.0.deserialize_option(visitor)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        self.0.deserialize_enum(name, variants, visitor)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        let value = match self.0 {
            Value::Object(doc) => Value::Object(restore_field_names(doc, fields)),
            other => other,
        };
        value.deserialize_struct(name, fields, visitor)
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct seq tuple tuple_struct map identifier
        ignored_any
    }
}

fn restore_field_names(doc: Document, fields: &[&str]) -> Document {
    doc.into_iter()
        .map(|(key, value)| {
            if fields.contains(&key.as_str()) {
                return (key, value);
            }
            match fields.iter().find(|field| field.to_lowercase() == key.to_lowercase()) {
                Some(field) => (field.to_string(), value),
                None => (key, value),
            }
        })
        .collect()
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Collects the indexes an entity type declares.
#[derive(Debug, Clone, Default)]
pub struct SchemaBuilder {
    indexes: Vec<IndexModel>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an index. Empty key documents are ignored.
    pub fn ensure_index(&mut self, keys: Document, options: IndexOptions) -> &mut Self {
        if !keys.is_empty() {
            self.indexes.push(IndexModel::new(keys, options));
        }
        self
    }

    pub fn indexes(&self) -> &[IndexModel] {
        &self.indexes
    }

    pub fn into_indexes(self) -> Vec<IndexModel> {
        self.indexes
    }
}

/// Per-entity customization of schema and conversion.
///
/// Every method has a default, so an entity adapter only overrides what it
/// needs. The engine calls `define_schema` on each open and the conversion
/// methods around every driver call.
pub trait PersistenceOverrides<T>: Send + Sync
where
    T: Serialize + DeserializeOwned,
{
    fn define_schema(&self, _schema: &mut SchemaBuilder) {}

    fn convert_from_public(&self, item: &T) -> Result<Document> {
        from_public(item)
    }

    /// Body of a partial update.
    fn convert_from_public_partial(&self, item: &T) -> Result<Document> {
        self.convert_from_public(item)
    }

    fn convert_to_public(&self, doc: Document) -> Result<T> {
        to_public(doc)
    }
}

/// Plain serde conversion, no indexes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultOverrides;

impl<T> PersistenceOverrides<T> for DefaultOverrides where T: Serialize + DeserializeOwned {}
