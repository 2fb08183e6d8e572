//! Plugin scopes.
//!
//! Every plugin registers its hooks and decorations in its own [`Scope`]. A
//! scope reads through to its ancestors: hook chains of a child start with the
//! root's hooks, then each ancestor's, then its own. Ancestors never see what
//! a child registers. Parents own their children; a child links back weakly.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use hemera_core::{HemeraError, Pattern};
use parking_lot::RwLock;
use serde_json::Value;

use super::{ExtensionPoint, Exchange, Hook};

#[derive(Default)]
struct HookTable {
    exchange: HashMap<ExtensionPoint, Vec<Hook<Exchange>>>,
    add: Vec<Hook<Pattern>>,
    close: Vec<Hook<()>>,
}

/// Hooks and decorations owned by one plugin.
pub struct Scope {
    name: String,
    parent: Option<Weak<Scope>>,
    hooks: RwLock<HookTable>,
    decorations: RwLock<HashMap<String, Value>>,
    children: RwLock<Vec<Arc<Scope>>>,
}

impl Scope {
    /// The root scope of an instance.
    #[must_use]
    pub fn root(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::with_parent(name.into(), None))
    }

    fn with_parent(name: String, parent: Option<Weak<Scope>>) -> Self {
        Self {
            name,
            parent,
            hooks: RwLock::new(HookTable::default()),
            decorations: RwLock::new(HashMap::new()),
            children: RwLock::new(Vec::new()),
        }
    }

    /// Creates a child scope.
    #[must_use]
    pub fn child(self: &Arc<Self>, name: impl Into<String>) -> Arc<Self> {
        let child = Arc::new(Self::with_parent(name.into(), Some(Arc::downgrade(self))));
        self.children.write().push(Arc::clone(&child));
        child
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn parent(&self) -> Option<Arc<Scope>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Ancestors first, `self` last.
    fn lineage(self: &Arc<Self>) -> Vec<Arc<Scope>> {
        let mut chain = vec![Arc::clone(self)];
        let mut current = self.parent();
        while let Some(scope) = current {
            current = scope.parent();
            chain.push(scope);
        }
        chain.reverse();
        chain
    }

    // -- hooks ---------------------------------------------------------------

    /// Appends a hook to an exchange-carrying point.
    ///
    /// # Errors
    ///
    /// `onAdd` and `onClose` take [`Scope::on_add`] and [`Scope::on_close`]
    /// hooks; passing them here fails.
    pub fn add_hook(&self, point: ExtensionPoint, hook: Hook<Exchange>) -> Result<(), HemeraError> {
        if !point.carries_exchange() {
            return Err(HemeraError::hemera(format!(
                "extension point `{point}` does not take exchange hooks"
            )));
        }
        self.hooks.write().exchange.entry(point).or_default().push(hook);
        Ok(())
    }

    pub fn on_add(&self, hook: Hook<Pattern>) {
        self.hooks.write().add.push(hook);
    }

    pub fn on_close(&self, hook: Hook<()>) {
        self.hooks.write().close.push(hook);
    }

    /// The chain for `point` as seen from this scope.
    #[must_use]
    pub fn hooks(self: &Arc<Self>, point: ExtensionPoint) -> Vec<Hook<Exchange>> {
        let mut chain = Vec::new();
        for scope in self.lineage() {
            if let Some(own) = scope.hooks.read().exchange.get(&point) {
                chain.extend(own.iter().cloned());
            }
        }
        chain
    }

    #[must_use]
    pub fn add_hooks(self: &Arc<Self>) -> Vec<Hook<Pattern>> {
        let mut chain = Vec::new();
        for scope in self.lineage() {
            chain.extend(scope.hooks.read().add.iter().cloned());
        }
        chain
    }

    /// `onClose` hooks of this scope and all its descendants, this scope
    /// first.
    #[must_use]
    pub fn close_hooks(&self) -> Vec<Hook<()>> {
        let mut hooks = self.hooks.read().close.clone();
        for child in self.children.read().iter() {
            hooks.extend(child.close_hooks());
        }
        hooks
    }

    // -- decorations ---------------------------------------------------------

    /// Attaches a named value to this scope.
    ///
    /// # Errors
    ///
    /// Fails when the name is already visible from this scope.
    pub fn decorate(&self, key: impl Into<String>, value: Value) -> Result<(), HemeraError> {
        let key = key.into();
        if self.decoration(&key).is_some() {
            return Err(HemeraError::hemera(format!("decoration `{key}` already exists")));
        }
        self.decorations.write().insert(key, value);
        Ok(())
    }

    /// Looks a decoration up here, then in each ancestor.
    #[must_use]
    pub fn decoration(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.decorations.read().get(key) {
            return Some(value.clone());
        }
        self.parent().and_then(|parent| parent.decoration(key))
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.name)
            .field("parent", &self.parent().map(|p| p.name.clone()))
            .finish_non_exhaustive()
    }
}
