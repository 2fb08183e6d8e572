//! Cross-hop error serialization and the per-process error class registry.
//!
//! An error leaving a process is flattened to a JSON object holding its name,
//! message, public properties and (optionally) its cause chain and stack. The
//! receiving process rebuilds it through its own [`ErrorRegistry`]: when a
//! class with the same name was registered locally, the reconstructed error is
//! an instance of *that* class. Two processes that each register
//! `Unauthorized` therefore agree on identity without sharing code.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorKind, HemeraError, Hop};
use crate::pattern::Pattern;

const RESERVED_KEYS: [&str; 7] = ["name", "message", "cause", "stack", "hops", "pattern", "parent"];

/// Serialization options for errors crossing a hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrioConfig {
    /// Serialize the cause chain.
    pub recursive: bool,
    /// Carry the parent kind of user classes so unknown names keep their kind.
    pub inherited: bool,
    /// Serialize the stack.
    pub stack: bool,
    /// Serialize private properties (prefixed or suffixed with `_`).
    pub private: bool,
    /// Keys never serialized.
    pub exclude: Vec<String>,
    /// Keys always serialized, overriding `private`, `stack` and `exclude`.
    pub include: Vec<String>,
}

impl Default for ErrioConfig {
    fn default() -> Self {
        Self {
            recursive: true,
            inherited: true,
            stack: false,
            private: false,
            exclude: Vec::new(),
            include: Vec::new(),
        }
    }
}

impl ErrioConfig {
    fn forced(&self, key: &str) -> bool {
        self.include.iter().any(|k| k == key)
    }

    fn allows(&self, key: &str) -> bool {
        if self.forced(key) {
            return true;
        }
        let private = key.starts_with('_') || key.ends_with('_');
        !(private && !self.private) && !self.exclude.iter().any(|k| k == key)
    }
}

// ---------------------------------------------------------------------------
// ErrorClass
// ---------------------------------------------------------------------------

struct ClassInner {
    name: String,
    parent: ErrorKind,
}

/// A user error class registered in one process.
///
/// Equality is identity: two classes are equal only when they come from the
/// same registration.
#[derive(Clone)]
pub struct ErrorClass(Arc<ClassInner>);

impl ErrorClass {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[must_use]
    pub fn parent(&self) -> ErrorKind {
        self.0.parent
    }

    /// Creates a new error of this class.
    #[track_caller]
    pub fn error(&self, message: impl Into<String>) -> HemeraError {
        let location = std::panic::Location::caller();
        self.instantiate(message)
            .with_stack(Some(format!("at {}:{}:{}", location.file(), location.line(), location.column())))
    }

    fn instantiate(&self, message: impl Into<String>) -> HemeraError {
        HemeraError::named(self.0.parent, self.0.name.clone(), message).with_class(self.clone())
    }
}

impl PartialEq for ErrorClass {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ErrorClass {}

impl fmt::Debug for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorClass")
            .field("name", &self.0.name)
            .field("parent", &self.0.parent)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ErrorRegistry
// ---------------------------------------------------------------------------

/// Name → class registry plus the serialization options of one process.
pub struct ErrorRegistry {
    config: ErrioConfig,
    classes: RwLock<HashMap<String, ErrorClass>>,
}

impl ErrorRegistry {
    #[must_use]
    pub fn new(config: ErrioConfig) -> Self {
        Self {
            config,
            classes: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ErrioConfig {
        &self.config
    }

    /// Registers an error class under `name`, derived from `parent`.
    ///
    /// Registering an existing name returns the class already registered.
    ///
    /// # Errors
    ///
    /// Fails with a root-kind error when `name` is empty or shadows a built-in
    /// kind name.
    pub fn register(&self, name: &str, parent: ErrorKind) -> Result<ErrorClass, HemeraError> {
        if name.is_empty() {
            return Err(HemeraError::hemera("error class name must not be empty"));
        }
        if ErrorKind::from_name(name).is_some() {
            return Err(HemeraError::hemera(format!(
                "error class `{name}` shadows a built-in error kind"
            )));
        }

        let mut classes = self.classes.write();
        let class = classes
            .entry(name.to_string())
            .or_insert_with(|| {
                ErrorClass(Arc::new(ClassInner {
                    name: name.to_string(),
                    parent,
                }))
            })
            .clone();
        Ok(class)
    }

    #[must_use]
    pub fn class(&self, name: &str) -> Option<ErrorClass> {
        self.classes.read().get(name).cloned()
    }

    /// Flattens an error for the wire.
    #[must_use]
    pub fn to_wire(&self, err: &HemeraError) -> Value {
        let cfg = &self.config;
        let mut obj = Map::new();
        obj.insert("name".into(), Value::String(err.name().to_string()));
        obj.insert("message".into(), Value::String(err.message().to_string()));

        if cfg.inherited {
            if let Some(class) = err.class() {
                obj.insert("parent".into(), Value::String(class.parent().name().to_string()));
            }
        }

        for (key, value) in err.properties() {
            if RESERVED_KEYS.contains(&key.as_str()) || !cfg.allows(key) {
                continue;
            }
            obj.insert(key.clone(), value.clone());
        }

        if let Some(pattern) = err.pattern() {
            if cfg.allows("pattern") {
                obj.insert("pattern".into(), pattern.clone().into_value());
            }
        }

        if !err.hops().is_empty() && cfg.allows("hops") {
            if let Ok(hops) = serde_json::to_value(err.hops()) {
                obj.insert("hops".into(), hops);
            }
        }

        if cfg.stack || cfg.forced("stack") {
            if let Some(stack) = err.stack() {
                obj.insert("stack".into(), Value::String(stack.to_string()));
            }
        }

        if cfg.recursive {
            if let Some(cause) = err.cause() {
                obj.insert("cause".into(), self.to_wire(cause));
            }
        }

        Value::Object(obj)
    }

    /// Rebuilds an error received from another hop.
    ///
    /// Names registered locally become instances of the local class; built-in
    /// names map to their kind; anything else keeps its name over the carried
    /// parent kind (or the root kind).
    #[must_use]
    pub fn from_wire(&self, value: &Value) -> HemeraError {
        let obj = match value {
            Value::Object(obj) => obj,
            Value::String(message) => return HemeraError::named(ErrorKind::Hemera, ErrorKind::Hemera.name(), message.clone()),
            other => {
                return HemeraError::named(ErrorKind::Parse, ErrorKind::Parse.name(), format!("malformed error payload: {other}"));
            }
        };

        let name = obj.get("name").and_then(Value::as_str).unwrap_or(ErrorKind::Hemera.name());
        let message = obj.get("message").and_then(Value::as_str).unwrap_or_default();

        let mut err = if let Some(class) = self.class(name) {
            class.instantiate(message)
        } else if let Some(kind) = ErrorKind::from_name(name) {
            HemeraError::named(kind, name, message)
        } else {
            let parent = obj
                .get("parent")
                .and_then(Value::as_str)
                .and_then(ErrorKind::from_name)
                .unwrap_or(ErrorKind::Hemera);
            HemeraError::named(parent, name, message)
        };

        for (key, value) in obj {
            if !RESERVED_KEYS.contains(&key.as_str()) {
                err.set_property(key.clone(), value.clone());
            }
        }

        err.set_pattern(obj.get("pattern").cloned().and_then(|p| Pattern::from_value(p).ok()));
        if let Some(hops) = obj.get("hops").cloned().and_then(|h| serde_json::from_value::<Vec<Hop>>(h).ok()) {
            err.set_hops(hops);
        }
        err.set_cause(obj.get("cause").map(|cause| self.from_wire(cause)));

        err.with_stack(obj.get("stack").and_then(Value::as_str).map(str::to_string))
    }
}

impl Default for ErrorRegistry {
    fn default() -> Self {
        Self::new(ErrioConfig::default())
    }
}
