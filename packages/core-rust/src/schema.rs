use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pattern::{is_control_key, json_type_name, Pattern};

/// Validation schema attached to a registration. Checked against the
/// request payload before the handler runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadSchema {
    /// Field definitions that comprise this schema.
    pub fields: Vec<FieldDef>,
    /// Whether payload keys without a field definition are accepted.
    #[serde(default = "default_true")]
    pub allow_unknown: bool,
}

fn default_true() -> bool {
    true
}

/// Single field definition within a schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Name of the field.
    pub name: String,
    /// Whether the field must be present in every payload.
    pub required: bool,
    /// Expected JSON type of the field.
    #[serde(default)]
    pub kind: FieldKind,
}

/// JSON type constraint of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Any,
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl FieldKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

impl Default for PayloadSchema {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of validating a payload against a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// The payload conforms to the schema.
    Valid,
    /// The payload violates one or more schema constraints.
    Invalid {
        /// Human-readable descriptions of each validation failure.
        errors: Vec<String>,
    },
}

impl PayloadSchema {
    #[must_use]
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            allow_unknown: true,
        }
    }

    /// Adds a required field.
    #[must_use]
    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            required: true,
            kind,
        });
        self
    }

    /// Adds an optional field.
    #[must_use]
    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            required: false,
            kind,
        });
        self
    }

    /// Rejects payload keys that have no field definition.
    #[must_use]
    pub fn deny_unknown(mut self) -> Self {
        self.allow_unknown = false;
        self
    }

    /// Validates the business entries of `payload`; control keys and `topic`
    /// are never checked.
    #[must_use]
    pub fn validate(&self, payload: &Pattern) -> ValidationResult {
        let mut errors = Vec::new();

        for field in &self.fields {
            match payload.get(&field.name) {
                None if field.required => errors.push(format!("`{}` is required", field.name)),
                None => {}
                Some(value) if !field.kind.accepts(value) => errors.push(format!(
                    "`{}` must be of type {:?}, got {}",
                    field.name,
                    field.kind,
                    json_type_name(value)
                )),
                Some(_) => {}
            }
        }

        if !self.allow_unknown {
            for (key, _) in payload.iter() {
                if is_control_key(key) || key == crate::pattern::TOPIC {
                    continue;
                }
                if !self.fields.iter().any(|f| &f.name == key) {
                    errors.push(format!("`{key}` is not allowed"));
                }
            }
        }

        if errors.is_empty() {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid { errors }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload(value: Value) -> Pattern {
        Pattern::from_value(value).unwrap()
    }

    #[test]
    fn valid_payload_passes() {
        let schema = PayloadSchema::new()
            .required("a", FieldKind::Integer)
            .required("b", FieldKind::Integer);
        let result = schema.validate(&payload(json!({ "topic": "math", "cmd": "add", "a": 1, "b": 2 })));
        assert_eq!(result, ValidationResult::Valid);
    }

    #[test]
    fn reports_missing_and_mistyped_fields() {
        let schema = PayloadSchema::new()
            .required("a", FieldKind::Integer)
            .required("b", FieldKind::Integer)
            .optional("label", FieldKind::String);
        let result = schema.validate(&payload(json!({ "topic": "math", "a": "one", "label": 5 })));

        let ValidationResult::Invalid { errors } = result else {
            panic!("expected invalid payload");
        };
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("`b` is required")));
        assert!(errors.iter().any(|e| e.contains("`a` must be of type Integer")));
    }

    #[test]
    fn deny_unknown_ignores_topic_and_control_keys() {
        let schema = PayloadSchema::new().required("a", FieldKind::Number).deny_unknown();
        assert_eq!(
            schema.validate(&payload(json!({ "topic": "t", "a": 1.5, "meta$": {} }))),
            ValidationResult::Valid
        );
        assert!(matches!(
            schema.validate(&payload(json!({ "topic": "t", "a": 1, "extra": true }))),
            ValidationResult::Invalid { .. }
        ));
    }
}
