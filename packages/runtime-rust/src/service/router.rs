//! Pattern routing: resolves an inbound pattern to its registration.
//!
//! A registration matches an inbound pattern when its topic subject matches
//! the inbound topic and every other key it carries is present in the inbound
//! pattern with an equal value. Inbound keys the registration does not name
//! are ignored, so broader registrations match more requests. Control keys
//! never take part in matching.

use hemera_core::pattern::TOPIC;
use hemera_core::{HemeraError, Pattern, Subject};
use parking_lot::RwLock;

use crate::config::{BloomrunConfig, Indexing};

// ---------------------------------------------------------------------------
// RouteEntry
// ---------------------------------------------------------------------------

struct RouteEntry<T> {
    pattern: Pattern,
    subject: Subject,
    specificity: usize,
    value: T,
}

impl<T> RouteEntry<T> {
    fn matches(&self, topic: &str, incoming: &Pattern) -> bool {
        self.subject.matches(topic)
            && self
                .pattern
                .business_entries()
                .filter(|(key, _)| key.as_str() != TOPIC)
                .all(|(key, value)| incoming.get(key) == Some(value))
    }

    fn same_pattern(&self, other: &Pattern) -> bool {
        self.pattern.len() == other.len() && self.pattern.contains(other)
    }
}

// ---------------------------------------------------------------------------
// PatternRouter
// ---------------------------------------------------------------------------

/// Ordered pattern table.
///
/// With [`Indexing::Insertion`] the first matching registration in
/// registration order wins. With [`Indexing::Depth`] registrations naming
/// more keys are tried first; registrations of equal depth keep their
/// registration order.
pub struct PatternRouter<T> {
    indexing: Indexing,
    lookup_before_add: bool,
    entries: RwLock<Vec<RouteEntry<T>>>,
}

impl<T: Clone> PatternRouter<T> {
    #[must_use]
    pub fn new(config: &BloomrunConfig) -> Self {
        Self {
            indexing: config.indexing,
            lookup_before_add: config.lookup_before_add,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Registers `value` under the business entries of `pattern`.
    ///
    /// # Errors
    ///
    /// - a root-kind error when the topic is missing or is not a valid subject
    /// - `PatternConflict` when duplicate checking is on and an identical
    ///   pattern is already registered
    pub fn add(&self, pattern: &Pattern, value: T) -> Result<(), HemeraError> {
        let cleaned = pattern.payload();
        let topic = cleaned
            .topic()
            .ok_or_else(|| HemeraError::hemera("pattern has no topic"))?;
        let subject = Subject::parse(topic)?;

        let mut entries = self.entries.write();
        if self.lookup_before_add && entries.iter().any(|e| e.same_pattern(&cleaned)) {
            return Err(HemeraError::pattern_conflict(format!(
                "pattern `{}` is already registered",
                cleaned.signature()
            ))
            .with_pattern(cleaned));
        }

        let entry = RouteEntry {
            specificity: cleaned.specificity(),
            pattern: cleaned,
            subject,
            value,
        };
        match self.indexing {
            Indexing::Insertion => entries.push(entry),
            Indexing::Depth => {
                let at = entries
                    .iter()
                    .position(|e| e.specificity < entry.specificity)
                    .unwrap_or(entries.len());
                entries.insert(at, entry);
            }
        }
        Ok(())
    }

    /// The first registration matching `pattern`, if any.
    #[must_use]
    pub fn lookup(&self, pattern: &Pattern) -> Option<T> {
        let topic = pattern.topic()?;
        self.entries
            .read()
            .iter()
            .find(|e| e.matches(topic, pattern))
            .map(|e| e.value.clone())
    }

    /// Registrations whose pattern contains every business entry of
    /// `partial`, in match order. `None` lists everything.
    #[must_use]
    pub fn list(&self, partial: Option<&Pattern>) -> Vec<T> {
        self.entries
            .read()
            .iter()
            .filter(|e| partial.is_none_or(|p| e.pattern.contains(p)))
            .map(|e| e.value.clone())
            .collect()
    }

    /// Removes every registration selected by `predicate` and returns them.
    pub fn remove_where(&self, mut predicate: impl FnMut(&Pattern, &T) -> bool) -> Vec<T> {
        let mut removed = Vec::new();
        self.entries.write().retain(|e| {
            if predicate(&e.pattern, &e.value) {
                removed.push(e.value.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
