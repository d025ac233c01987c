//! Per-event-type payload validation.
//!
//! The registry holds one compiled Draft-04 validator per declared event
//! type and payload kind (`data` and `meta`). It is built once at store
//! construction; a declared type can therefore never be missing a validator
//! at runtime.
use std::collections::BTreeMap;

use jsonschema::{Draft, Validator};
use serde_json::Value;

use crate::error::Error;
use crate::record::EventRecord;
use crate::schema::SchemaSet;

/// The compiled validators of one event type.
pub struct EventValidator {
    data: Validator,
    meta: Validator,
}

impl EventValidator {
    /// Checks a `data` payload against the data schema.
    pub fn validate_data(&self, data: &Value) -> Result<(), Error> {
        check(&self.data, data)
    }

    /// Checks a `meta` payload against the meta schema.
    pub fn validate_meta(&self, meta: &Value) -> Result<(), Error> {
        check(&self.meta, meta)
    }
}

fn check(validator: &Validator, instance: &Value) -> Result<(), Error> {
    match validator.iter_errors(instance).next() {
        None => Ok(()),
        Some(error) => Err(Error::Validation {
            path: error.instance_path.to_string(),
            message: error.to_string(),
        }),
    }
}

/// Holds the compiled validators of the store's closed event set.
pub struct ValidatorRegistry {
    validators: BTreeMap<String, EventValidator>,
}

impl ValidatorRegistry {
    /// Compiles one validator pair per declared event type.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when a schema does not compile.
    pub fn new(schemas: &SchemaSet) -> Result<Self, Error> {
        let mut validators = BTreeMap::new();
        for (event_type, event_schemas) in schemas.resolved()? {
            let data = compile(&event_type, "data", &event_schemas.data)?;
            let meta = compile(&event_type, "meta", &event_schemas.meta)?;
            validators.insert(event_type, EventValidator { data, meta });
        }
        Ok(Self { validators })
    }

    /// Returns true if the event type is declared.
    pub fn has_event(&self, event_type: &str) -> bool {
        self.validators.contains_key(event_type)
    }

    /// Returns the validator pair of the given event type.
    pub fn get(&self, event_type: &str) -> Option<&EventValidator> {
        self.validators.get(event_type)
    }

    /// Checks a record's type, data and meta.
    ///
    /// # Errors
    ///
    /// `Error::UnknownEvent` for an undeclared type, `Error::Validation` for
    /// the first schema violation found.
    pub fn validate(&self, record: &EventRecord) -> Result<(), Error> {
        let validator = self
            .validators
            .get(&record.event_type)
            .ok_or_else(|| Error::UnknownEvent(record.event_type.clone()))?;
        validator.validate_data(&record.data)?;
        validator.validate_meta(&record.meta)
    }
}

fn compile(event_type: &str, payload: &str, schema: &Value) -> Result<Validator, Error> {
    jsonschema::options()
        .with_draft(Draft::Draft4)
        .build(schema)
        .map_err(|e| Error::Config(format!("{payload} schema of `{event_type}`: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EventDraft, EventFactory};
    use assert2::let_assert;
    use serde_json::json;

    fn registry() -> ValidatorRegistry {
        let set = SchemaSet::load([
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
                    },
                    "meta": {
                        "type": "object",
                        "properties": {"actor": {"type": "string"}}
                    }
                },
                "definitions": {
                    "name": {
                        "type": "object",
                        "properties": {
                            "given": {"type": "string"},
                            "family": {"type": "string"}
                        },
                        "required": ["given"]
                    }
                }
            }),
            json!({"event": {"type": "user:removed"}}),
        ])
        .unwrap();
        ValidatorRegistry::new(&set).unwrap()
    }

    fn record(event_type: &str, data: Value) -> EventRecord {
        EventFactory::new().make(EventDraft::new(event_type).stream("s1").data(data))
    }

    #[test]
    fn it_accepts_conforming_records() {
        let registry = registry();
        let record = record(
            "user:created",
            json!({"name": {"given": "Jane", "family": "Doe"}, "email": "j@x"}),
        );
        registry.validate(&record).unwrap();
    }

    #[test]
    fn it_rejects_unknown_event_types() {
        let registry = registry();
        let record = record("user:renamed", json!({}));
        let_assert!(Err(Error::UnknownEvent(event_type)) = registry.validate(&record));
        assert_eq!(event_type, "user:renamed");
    }

    #[test]
    fn it_reports_the_offending_path() {
        let registry = registry();
        let record = record(
            "user:created",
            json!({"name": {"family": "Doe"}, "email": "j@x"}),
        );
        let_assert!(Err(Error::Validation { path, .. }) = registry.validate(&record));
        assert_eq!(path, "/name");
    }

    #[test]
    fn it_validates_meta_as_well() {
        let registry = registry();
        let mut record = record(
            "user:created",
            json!({"name": {"given": "Jane"}, "email": "j@x"}),
        );
        record.meta = json!({"actor": 42});
        let_assert!(Err(Error::Validation { path, .. }) = registry.validate(&record));
        assert_eq!(path, "/actor");
    }

    #[test]
    fn it_accepts_anything_for_undeclared_schemas() {
        let registry = registry();
        let record = record("user:removed", json!({"arbitrary": [1, 2, 3]}));
        registry.validate(&record).unwrap();
    }

    #[test]
    fn it_refuses_schemas_that_do_not_compile() {
        let set = SchemaSet::load([json!({
            "event": {"type": "user:created", "data": {"type": 42}}
        })])
        .unwrap();
        let_assert!(Err(Error::Config(_)) = ValidatorRegistry::new(&set));
    }
}
