//! Event schema documents.
//!
//! The closed set of event types is declared by JSON documents, one per
//! event, of the shape `{"event": {"type", "data"?, "meta"?}, "definitions"?}`.
//! `data` and `meta` follow JSON Schema Draft-04. `definitions` are shared
//! sub-schemas resolved across all documents; a duplicate definition key or a
//! duplicate event type across documents is a fatal configuration error.
use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::Error;

/// Determines whether a string is a valid event-type name.
///
/// Names are lower-case colon-separated segments, e.g. `user:created` or
/// `user:name:given-set`.
pub fn is_valid_event_type(s: &str) -> bool {
    lazy_static! {
        static ref RE: Regex = Regex::new("^[a-z0-9-]+(:[a-z0-9-]+)*$").unwrap();
    }
    RE.is_match(s)
}

#[derive(Debug, Deserialize)]
struct SchemaDocument {
    event: EventDecl,
    #[serde(default)]
    definitions: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct EventDecl {
    #[serde(rename = "type")]
    event_type: String,
    data: Option<Value>,
    meta: Option<Value>,
}

/// The declared `data` and `meta` schemas of one event type, with the shared
/// definitions folded in so `#/definitions/...` references resolve.
#[derive(Debug, Clone)]
pub struct EventSchemas {
    pub data: Value,
    pub meta: Value,
}

/// The parsed, merged declaration of the store's closed event set.
#[derive(Debug, Clone, Default)]
pub struct SchemaSet {
    events: BTreeMap<String, (Option<Value>, Option<Value>)>,
    definitions: Map<String, Value>,
}

impl SchemaSet {
    /// Parses and merges a collection of schema documents.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on a malformed document, an invalid or
    /// duplicate event-type name, or a definition key declared by more than
    /// one document.
    pub fn load(documents: impl IntoIterator<Item = Value>) -> Result<Self, Error> {
        let mut set = SchemaSet::default();
        for document in documents {
            let document: SchemaDocument = serde_json::from_value(document)
                .map_err(|e| Error::Config(format!("malformed schema document: {e}")))?;
            let event_type = document.event.event_type;
            if !is_valid_event_type(&event_type) {
                return Err(Error::Config(format!(
                    "invalid event type name `{event_type}`"
                )));
            }
            if set.events.contains_key(&event_type) {
                return Err(Error::Config(format!(
                    "event type `{event_type}` declared more than once"
                )));
            }
            for (key, value) in document.definitions {
                if set.definitions.contains_key(&key) {
                    return Err(Error::Config(format!(
                        "definition `{key}` declared more than once"
                    )));
                }
                set.definitions.insert(key, value);
            }
            set.events
                .insert(event_type, (document.event.data, document.event.meta));
        }
        Ok(set)
    }

    /// The declared event types, sorted.
    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }

    /// Returns true if the event type is declared.
    pub fn contains(&self, event_type: &str) -> bool {
        self.events.contains_key(event_type)
    }

    /// The effective `data`/`meta` schemas for every declared event type.
    ///
    /// An omitted schema becomes the permissive empty schema. The merged
    /// definitions are injected into each schema document; a schema carrying
    /// a local definition under a shared key is a configuration error.
    pub(crate) fn resolved(&self) -> Result<BTreeMap<String, EventSchemas>, Error> {
        self.events
            .iter()
            .map(|(event_type, (data, meta))| {
                Ok((
                    event_type.clone(),
                    EventSchemas {
                        data: self.resolve(event_type, data.clone())?,
                        meta: self.resolve(event_type, meta.clone())?,
                    },
                ))
            })
            .collect()
    }

    fn resolve(&self, event_type: &str, schema: Option<Value>) -> Result<Value, Error> {
        let mut schema = match schema {
            Some(schema) => schema,
            None => return Ok(Value::Object(Map::new())),
        };
        if self.definitions.is_empty() {
            return Ok(schema);
        }
        let object = schema.as_object_mut().ok_or_else(|| {
            Error::Config(format!("schema for `{event_type}` is not an object"))
        })?;
        let local = object
            .entry("definitions")
            .or_insert_with(|| Value::Object(Map::new()));
        let local = local.as_object_mut().ok_or_else(|| {
            Error::Config(format!("definitions of `{event_type}` is not an object"))
        })?;
        for (key, value) in &self.definitions {
            if local.contains_key(key) {
                return Err(Error::Config(format!(
                    "definition `{key}` declared more than once"
                )));
            }
            local.insert(key.clone(), value.clone());
        }
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::let_assert;
    use serde_json::json;

    fn user_created() -> Value {
        json!({
            "event": {
                "type": "user:created",
                "data": {
                    "type": "object",
                    "properties": {
                        "name": {"$ref": "#/definitions/name"},
                        "email": {"type": "string"}
                    },
                    "required": ["name", "email"]
                }
            },
            "definitions": {
                "name": {
                    "type": "object",
                    "properties": {
                        "given": {"type": "string"},
                        "family": {"type": "string"}
                    }
                }
            }
        })
    }

    #[test]
    fn it_validates_event_type_names() {
        assert!(is_valid_event_type("user:created"));
        assert!(is_valid_event_type("user:name:given-set"));
        assert!(is_valid_event_type("tenant:assigned"));
        assert!(!is_valid_event_type("User:Created"));
        assert!(!is_valid_event_type("user:"));
        assert!(!is_valid_event_type(":created"));
        assert!(!is_valid_event_type("user created"));
        assert!(!is_valid_event_type(""));
    }

    #[test]
    fn it_loads_documents_and_merges_definitions() {
        let set = SchemaSet::load([
            user_created(),
            json!({"event": {"type": "user:email-set"}}),
        ])
        .unwrap();
        assert_eq!(
            set.event_types().collect::<Vec<_>>(),
            ["user:created", "user:email-set"]
        );
        let resolved = set.resolved().unwrap();
        let data = &resolved["user:created"].data;
        assert!(data["definitions"]["name"].is_object());
        // An omitted schema accepts anything.
        assert_eq!(resolved["user:email-set"].data, json!({}));
    }

    #[test]
    fn it_rejects_duplicate_event_types() {
        let result = SchemaSet::load([user_created(), user_created()]);
        let_assert!(Err(Error::Config(message)) = result);
        assert!(message.contains("user:created"));
    }

    #[test]
    fn it_rejects_duplicate_definitions() {
        let result = SchemaSet::load([
            user_created(),
            json!({
                "event": {"type": "user:removed"},
                "definitions": {"name": {"type": "string"}}
            }),
        ]);
        let_assert!(Err(Error::Config(message)) = result);
        assert!(message.contains("name"));
    }

    #[test]
    fn it_rejects_invalid_event_type_names() {
        let result = SchemaSet::load([json!({"event": {"type": "User Created"}})]);
        let_assert!(Err(Error::Config(_)) = result);
    }
}
