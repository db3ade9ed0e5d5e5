//! Document addressing and field-level updates.

use crate::{error::Result, DocumentId, Error};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Field holding a document's identifier.
pub const ID_FIELD: &str = "_id";

/// A `(database, collection)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Parse the dotted `db.collection` form. The collection part may itself
    /// contain dots.
    pub fn parse(value: &str) -> Result<Self> {
        match value.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(Error::InvalidNamespace(value.to_string())),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Fully qualified identity of a synchronized document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentKey {
    pub namespace: Namespace,
    pub id: DocumentId,
}

impl DocumentKey {
    pub fn new(namespace: Namespace, id: impl Into<DocumentId>) -> Self {
        Self {
            namespace,
            id: id.into(),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// Extract the identifier of a document.
///
/// String ids are used as-is; numeric ids use their JSON text.
pub fn document_id(document: &Value) -> Option<DocumentId> {
    match document.get(ID_FIELD)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Return `document` with its `_id` set to `id`.
///
/// Fails if the document is not an object or already carries a different id.
pub fn with_id(document: Value, id: &str) -> Result<Value> {
    let existing = document_id(&document);
    let Value::Object(mut fields) = document else {
        return Err(Error::InvalidDocument("document must be a JSON object".into()));
    };
    if !fields.contains_key(ID_FIELD) {
        fields.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    } else if existing.as_deref() != Some(id) {
        return Err(Error::ImmutableField(ID_FIELD.into()));
    }
    Ok(Value::Object(fields))
}

/// Top-level field changes between two versions of a document.
///
/// Serves both as the update a host submits and as the description carried by
/// `UPDATE` change events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
    /// Fields set to a new value
    #[serde(default)]
    pub updated_fields: Map<String, Value>,
    /// Fields removed from the document
    #[serde(default)]
    pub removed_fields: Vec<String>,
}

impl UpdateDescription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `field` to `value`.
    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        let field = field.into();
        self.removed_fields.retain(|f| *f != field);
        self.updated_fields.insert(field, value);
        self
    }

    /// Remove `field`.
    pub fn unset(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.updated_fields.remove(&field);
        if !self.removed_fields.contains(&field) {
            self.removed_fields.push(field);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.updated_fields.is_empty() && self.removed_fields.is_empty()
    }

    /// Fold a later description into this one. Later changes win per field.
    pub fn merge(&mut self, later: &UpdateDescription) {
        for (field, value) in &later.updated_fields {
            self.removed_fields.retain(|f| f != field);
            self.updated_fields.insert(field.clone(), value.clone());
        }
        for field in &later.removed_fields {
            self.updated_fields.remove(field);
            if !self.removed_fields.contains(field) {
                self.removed_fields.push(field.clone());
            }
        }
    }

    /// Apply the changes to `document`, returning the updated copy.
    pub fn apply_to(&self, document: &Value) -> Result<Value> {
        let Value::Object(fields) = document else {
            return Err(Error::InvalidDocument("document must be a JSON object".into()));
        };
        if self.removed_fields.iter().any(|f| f == ID_FIELD) {
            return Err(Error::ImmutableField(ID_FIELD.into()));
        }
        if let Some(new_id) = self.updated_fields.get(ID_FIELD) {
            if fields.get(ID_FIELD) != Some(new_id) {
                return Err(Error::ImmutableField(ID_FIELD.into()));
            }
        }

        let mut fields = fields.clone();
        for (field, value) in &self.updated_fields {
            fields.insert(field.clone(), value.clone());
        }
        for field in &self.removed_fields {
            fields.remove(field);
        }
        Ok(Value::Object(fields))
    }

    /// Describe how `after` differs from `before` at the top level.
    pub fn diff(before: &Value, after: &Value) -> Self {
        let empty = Map::new();
        let before = before.as_object().unwrap_or(&empty);
        let after = after.as_object().unwrap_or(&empty);

        let mut description = Self::new();
        for (field, value) in after {
            if field != ID_FIELD && before.get(field) != Some(value) {
                description
                    .updated_fields
                    .insert(field.clone(), value.clone());
            }
        }
        for field in before.keys() {
            if field != ID_FIELD && !after.contains_key(field) {
                description.removed_fields.push(field.clone());
            }
        }
        description
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn namespace_display_and_parse() {
        let ns = Namespace::new("app", "todos");
        assert_eq!(ns.to_string(), "app.todos");
        assert_eq!(Namespace::parse("app.todos").unwrap(), ns);
        assert_eq!(
            Namespace::parse("app.todo.items").unwrap(),
            Namespace::new("app", "todo.items")
        );
        assert!(Namespace::parse("nodots").is_err());
        assert!(Namespace::parse(".todos").is_err());
    }

    #[test]
    fn document_id_accepts_strings_and_numbers() {
        assert_eq!(document_id(&json!({"_id": "a"})), Some("a".into()));
        assert_eq!(document_id(&json!({"_id": 42})), Some("42".into()));
        assert_eq!(document_id(&json!({"_id": [1]})), None);
        assert_eq!(document_id(&json!({"name": "x"})), None);
    }

    #[test]
    fn with_id_fills_missing_id() {
        let doc = with_id(json!({"title": "milk"}), "t1").unwrap();
        assert_eq!(doc, json!({"_id": "t1", "title": "milk"}));
    }

    #[test]
    fn with_id_rejects_conflicting_id() {
        let err = with_id(json!({"_id": "other"}), "t1").unwrap_err();
        assert_eq!(err, Error::ImmutableField("_id".into()));
        assert!(with_id(json!({"_id": "t1"}), "t1").is_ok());
        assert!(with_id(json!([1, 2]), "t1").is_err());
    }

    #[test]
    fn apply_sets_and_unsets() {
        let doc = json!({"_id": "1", "a": 1, "b": 2});
        let update = UpdateDescription::new().set("a", json!(10)).unset("b");
        assert_eq!(update.apply_to(&doc).unwrap(), json!({"_id": "1", "a": 10}));
    }

    #[test]
    fn apply_rejects_id_changes() {
        let doc = json!({"_id": "1"});
        let update = UpdateDescription::new().set("_id", json!("2"));
        assert!(matches!(update.apply_to(&doc), Err(Error::ImmutableField(_))));

        let update = UpdateDescription::new().unset("_id");
        assert!(matches!(update.apply_to(&doc), Err(Error::ImmutableField(_))));
    }

    #[test]
    fn merge_later_changes_win() {
        let mut first = UpdateDescription::new().set("a", json!(1)).unset("b");
        let second = UpdateDescription::new().unset("a").set("b", json!(2));
        first.merge(&second);

        assert_eq!(first.updated_fields.get("b"), Some(&json!(2)));
        assert!(!first.updated_fields.contains_key("a"));
        assert_eq!(first.removed_fields, vec!["a".to_string()]);
    }

    #[test]
    fn diff_ignores_id_and_unchanged_fields() {
        let before = json!({"_id": "1", "a": 1, "b": 2, "c": 3});
        let after = json!({"_id": "1", "a": 1, "b": 20, "d": 4});
        let diff = UpdateDescription::diff(&before, &after);

        assert_eq!(diff.updated_fields.len(), 2);
        assert_eq!(diff.updated_fields.get("b"), Some(&json!(20)));
        assert_eq!(diff.updated_fields.get("d"), Some(&json!(4)));
        assert_eq!(diff.removed_fields, vec!["c".to_string()]);
        assert_eq!(diff.apply_to(&before).unwrap(), after);
    }

    #[test]
    fn serialization_format() {
        let update = UpdateDescription::new().set("a", json!(1)).unset("b");
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("updatedFields"));
        assert!(json.contains("removedFields"));
    }
}
