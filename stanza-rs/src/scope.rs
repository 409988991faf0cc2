//! Layered variable scopes and the process-wide static model.
//!
//! A [`Scope`] is an ordered name → [`Value`] map with an optional parent.
//! Lookups fall through to the parent chain; writes never do. A write lands
//! on the scope the caller addressed (or, for bare-name assignment, the scope
//! that already owns the name; see [`crate::interp`]).
//!
//! Scopes are cheap handles (`Arc`) so closures, maps stored inside values
//! and the execution stack can all share one backing map.

use std::fmt;
use std::sync::{Arc, LazyLock};

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::script::value::Value;

/// Prefix of the key under which a steps sequence is stored for a method name.
pub const STEPS_PREFIX: &str = "$$";

struct ScopeInner {
    vars: RwLock<IndexMap<String, Value>>,
    parent: Option<Scope>,
}

/// A shared, parent-linked variable map.
#[derive(Clone)]
pub struct Scope(Arc<ScopeInner>);

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// A fresh root scope with no parent.
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    pub fn with_parent(parent: Option<Scope>) -> Self {
        Scope(Arc::new(ScopeInner {
            vars: RwLock::new(IndexMap::new()),
            parent,
        }))
    }

    /// A new empty scope whose parent is `self`.
    pub fn child(&self) -> Scope {
        Self::with_parent(Some(self.clone()))
    }

    pub fn parent(&self) -> Option<&Scope> {
        self.0.parent.as_ref()
    }

    /// Look `name` up here, then along the parent chain.
    pub fn get(&self, name: &str) -> Option<Value> {
        let mut cur = Some(self);
        while let Some(scope) = cur {
            if let Some(v) = scope.0.vars.read().get(name) {
                return Some(v.clone());
            }
            cur = scope.parent();
        }
        None
    }

    /// Look `name` up in this scope's own entries only.
    pub fn get_own(&self, name: &str) -> Option<Value> {
        self.0.vars.read().get(name).cloned()
    }

    pub fn contains_own(&self, name: &str) -> bool {
        self.0.vars.read().contains_key(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.owner(name).is_some()
    }

    /// The scope in the chain (self first) that holds `name`.
    pub fn owner(&self, name: &str) -> Option<Scope> {
        let mut cur = Some(self);
        while let Some(scope) = cur {
            if scope.contains_own(name) {
                return Some(scope.clone());
            }
            cur = scope.parent();
        }
        None
    }

    /// Bind `name` in this scope.  Returns the previous own value.
    pub fn set(&self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.0.vars.write().insert(name.into(), value)
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.0.vars.write().shift_remove(name)
    }

    /// Register a steps sequence callable as `name(...)` on this scope.
    pub fn define_steps(&self, name: &str, source: impl Into<String>) {
        self.set(format!("{STEPS_PREFIX}{name}"), Value::Str(source.into()));
    }

    /// Own keys in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.0.vars.read().keys().cloned().collect()
    }

    /// Snapshot of own entries in insertion order.
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.0
            .vars
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Every binding visible from here; nearer scopes shadow farther ones.
    pub fn flatten(&self) -> IndexMap<String, Value> {
        let mut chain = Vec::new();
        let mut cur = Some(self);
        while let Some(scope) = cur {
            chain.push(scope);
            cur = scope.parent();
        }
        let mut out = IndexMap::new();
        for scope in chain.into_iter().rev() {
            for (k, v) in scope.0.vars.read().iter() {
                out.insert(k.clone(), v.clone());
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.0.vars.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.vars.read().is_empty()
    }

    pub fn clear(&self) {
        self.0.vars.write().clear();
    }

    pub fn ptr_eq(&self, other: &Scope) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Number of parents above this scope.
    pub fn depth(&self) -> usize {
        let mut n = 0;
        let mut cur = self.parent();
        while let Some(p) = cur {
            n += 1;
            cur = p.parent();
        }
        n
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Scope {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let scope = Scope::new();
        for (k, v) in iter {
            scope.set(k, v);
        }
        scope
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("keys", &self.keys())
            .field("depth", &self.depth())
            .finish()
    }
}

// ── Static model ──────────────────────────────────────────────────────────────

static STATIC_MODEL: LazyLock<Scope> = LazyLock::new(Scope::new);

/// The process-wide map visible as `$static` and as the last-resort lookup.
pub fn static_model() -> &'static Scope {
    &STATIC_MODEL
}

// ── Tests ─────────────────────────────────────────────────────────────────────
