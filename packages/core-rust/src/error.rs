//! Error taxonomy shared by every hop.
//!
//! [`HemeraError`] is the single error type a caller ever observes. Its
//! [`ErrorKind`] is one of a closed set of built-in kinds; user-defined error
//! classes (see [`crate::errio::ErrorRegistry`]) carry their own name on top of
//! a parent kind. Errors chain through an explicit `cause` link.

use std::fmt;
use std::panic::Location;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errio::ErrorClass;
use crate::pattern::{Pattern, PatternError};
use crate::subject::SubjectError;

/// Built-in error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Root kind; also used for API misuse and unclassified failures.
    Hemera,
    Parse,
    Timeout,
    Implementation,
    Business,
    Fatal,
    PatternNotFound,
    PayloadValidation,
    ProcessLoad,
    PatternConflict,
    MaxRecursion,
    CircuitBreaker,
}

impl ErrorKind {
    pub const ALL: [Self; 12] = [
        Self::Hemera,
        Self::Parse,
        Self::Timeout,
        Self::Implementation,
        Self::Business,
        Self::Fatal,
        Self::PatternNotFound,
        Self::PayloadValidation,
        Self::ProcessLoad,
        Self::PatternConflict,
        Self::MaxRecursion,
        Self::CircuitBreaker,
    ];

    /// The wire name of this kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Hemera => "HemeraError",
            Self::Parse => "ParseError",
            Self::Timeout => "TimeoutError",
            Self::Implementation => "ImplementationError",
            Self::Business => "BusinessError",
            Self::Fatal => "FatalError",
            Self::PatternNotFound => "PatternNotFound",
            Self::PayloadValidation => "PayloadValidationError",
            Self::ProcessLoad => "ProcessLoadError",
            Self::PatternConflict => "PatternConflict",
            Self::MaxRecursion => "MaxRecursionError",
            Self::CircuitBreaker => "CircuitBreakerError",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One server traversal an error went through on its way back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hop {
    /// Topic of the pattern handled at this hop.
    pub service: String,
    /// Pattern signature handled at this hop.
    pub method: String,
    /// Name of the instance that produced or forwarded the error.
    pub app: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// A named, chainable error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{name}: {message}")]
pub struct HemeraError {
    kind: ErrorKind,
    name: String,
    message: String,
    class: Option<ErrorClass>,
    properties: Map<String, Value>,
    pattern: Option<Pattern>,
    hops: Vec<Hop>,
    stack: Option<String>,
    #[source]
    cause: Option<Box<HemeraError>>,
}

impl HemeraError {
    /// Creates an error of a built-in kind. The caller location is kept as
    /// the error's stack.
    #[track_caller]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::named(kind, kind.name(), message).with_stack(Some(caller_location()))
    }

    /// Creates an error carrying a name other than its kind's, without a stack.
    pub(crate) fn named(kind: ErrorKind, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            message: message.into(),
            class: None,
            properties: Map::new(),
            pattern: None,
            hops: Vec::new(),
            stack: None,
            cause: None,
        }
    }

    pub(crate) fn with_class(mut self, class: ErrorClass) -> Self {
        self.class = Some(class);
        self
    }

    pub(crate) fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack;
        self
    }

    #[track_caller]
    pub fn hemera(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Hemera, message)
    }

    #[track_caller]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message)
    }

    #[track_caller]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    #[track_caller]
    pub fn implementation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Implementation, message)
    }

    #[track_caller]
    pub fn business(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Business, message)
    }

    #[track_caller]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    #[track_caller]
    pub fn pattern_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PatternNotFound, message)
    }

    #[track_caller]
    pub fn payload_validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PayloadValidation, message)
    }

    #[track_caller]
    pub fn process_load(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProcessLoad, message)
    }

    #[track_caller]
    pub fn pattern_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PatternConflict, message)
    }

    #[track_caller]
    pub fn max_recursion(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MaxRecursion, message)
    }

    #[track_caller]
    pub fn circuit_breaker(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitBreaker, message)
    }

    // -- builders ------------------------------------------------------------

    /// Records `inner` as the cause of this error.
    #[must_use]
    pub fn caused_by(mut self, inner: HemeraError) -> Self {
        self.cause = Some(Box::new(inner));
        self
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_pattern(mut self, pattern: Pattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    pub(crate) fn set_pattern(&mut self, pattern: Option<Pattern>) {
        self.pattern = pattern;
    }

    pub(crate) fn set_cause(&mut self, cause: Option<HemeraError>) {
        self.cause = cause.map(Box::new);
    }

    pub(crate) fn set_hops(&mut self, hops: Vec<Hop>) {
        self.hops = hops;
    }

    pub fn push_hop(&mut self, hop: Hop) {
        self.hops.push(hop);
    }

    // -- accessors -----------------------------------------------------------

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn class(&self) -> Option<&ErrorClass> {
        self.class.as_ref()
    }

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    #[must_use]
    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    #[must_use]
    pub fn pattern(&self) -> Option<&Pattern> {
        self.pattern.as_ref()
    }

    #[must_use]
    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    #[must_use]
    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    #[must_use]
    pub fn cause(&self) -> Option<&HemeraError> {
        self.cause.as_deref()
    }

    /// Walks the cause chain to its innermost error; `self` when unchained.
    #[must_use]
    pub fn root_cause(&self) -> &HemeraError {
        let mut current = self;
        while let Some(next) = current.cause.as_deref() {
            current = next;
        }
        current
    }

    /// Returns `true` when this error was created from, or reconstructed as,
    /// the given locally registered class.
    #[must_use]
    pub fn is_instance_of(&self, class: &ErrorClass) -> bool {
        self.class.as_ref().is_some_and(|own| own == class)
    }
}

impl From<PatternError> for HemeraError {
    #[track_caller]
    fn from(err: PatternError) -> Self {
        Self::hemera(err.to_string())
    }
}

impl From<SubjectError> for HemeraError {
    #[track_caller]
    fn from(err: SubjectError) -> Self {
        Self::hemera(err.to_string())
    }
}

#[track_caller]
fn caller_location() -> String {
    let location = Location::caller();
    format!("at {}:{}:{}", location.file(), location.line(), location.column())
}
