//! Namespace registry.
//!
//! The registry maps canonical names to namespaces and keeps them in creation
//! order. It only ever grows: a namespace is created on first reference and
//! lives as long as the registry.
//!
//! # Invariants
//!
//! - Every key starts with `/`; lookups canonicalize first.
//! - `/` exists from construction on.
//! - Creation and adapter re-initialization both run under the write lock,
//!   so a namespace is either created with the new adapter or re-initialized
//!   against it, never neither.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use switchboard_proto::{DEFAULT_NAMESPACE, Encoder};
use tracing::info;

use crate::{adapter::AdapterFactory, namespace::Namespace};

struct Inner {
    /// Namespaces in creation order
    ordered: Vec<Arc<Namespace>>,
    /// Name → index into `ordered`
    index: HashMap<String, usize>,
    /// Adapter kind every namespace is bound to
    factory: Arc<dyn AdapterFactory>,
}

/// Insertion-ordered name → namespace map.
pub struct NamespaceRegistry {
    inner: RwLock<Inner>,
    encoder: Arc<dyn Encoder>,
    default: Arc<Namespace>,
}

impl NamespaceRegistry {
    /// Create a registry holding only the default namespace.
    pub fn new(encoder: Arc<dyn Encoder>, factory: Arc<dyn AdapterFactory>) -> Self {
        let default = Namespace::new(DEFAULT_NAMESPACE, Arc::clone(&encoder), factory.as_ref());
        let inner = Inner {
            ordered: vec![Arc::clone(&default)],
            index: HashMap::from([(DEFAULT_NAMESPACE.to_string(), 0)]),
            factory,
        };

        Self { inner: RwLock::new(inner), encoder, default }
    }

    /// Prefix `name` with `/` unless it already starts with one.
    pub fn canonicalize(name: &str) -> String {
        if name.starts_with('/') { name.to_string() } else { format!("/{name}") }
    }

    /// The default namespace `/`.
    pub fn default_namespace(&self) -> &Arc<Namespace> {
        &self.default
    }

    /// Look up a namespace without creating it.
    pub fn get(&self, name: &str) -> Option<Arc<Namespace>> {
        let name = Self::canonicalize(name);
        let inner = self.inner.read();
        inner.index.get(&name).map(|&i| Arc::clone(&inner.ordered[i]))
    }

    /// Look up a namespace, creating it with the current adapter if absent.
    ///
    /// Returns the namespace and whether it was created by this call.
    pub fn get_or_create(&self, name: &str) -> (Arc<Namespace>, bool) {
        if let Some(nsp) = self.get(name) {
            return (nsp, false);
        }

        let name = Self::canonicalize(name);
        let mut inner = self.inner.write();

        // Lost a race with another creator
        if let Some(&i) = inner.index.get(&name) {
            return (Arc::clone(&inner.ordered[i]), false);
        }

        let nsp = Namespace::new(name.clone(), Arc::clone(&self.encoder), inner.factory.as_ref());
        let position = inner.ordered.len();
        inner.ordered.push(Arc::clone(&nsp));
        inner.index.insert(name, position);

        (nsp, true)
    }

    /// Bind every namespace to a new adapter kind.
    ///
    /// Each registered namespace re-initializes its adapter exactly once, in
    /// creation order, before this returns. Returns how many were
    /// re-initialized.
    pub fn reinit_adapters(&self, factory: Arc<dyn AdapterFactory>) -> usize {
        let mut inner = self.inner.write();

        for nsp in &inner.ordered {
            nsp.init_adapter(factory.as_ref());
        }
        inner.factory = factory;

        info!(adapter = %inner.factory.name(), namespaces = inner.ordered.len(), "adapter changed");
        inner.ordered.len()
    }

    /// Current adapter factory.
    pub fn adapter(&self) -> Arc<dyn AdapterFactory> {
        Arc::clone(&self.inner.read().factory)
    }

    /// Name of the current adapter kind.
    pub fn adapter_name(&self) -> String {
        self.inner.read().factory.name().to_string()
    }

    /// Encoder shared by every namespace.
    pub fn encoder(&self) -> &Arc<dyn Encoder> {
        &self.encoder
    }

    /// Snapshot of all namespaces in creation order.
    pub fn namespaces(&self) -> Vec<Arc<Namespace>> {
        self.inner.read().ordered.clone()
    }

    /// Names in creation order.
    pub fn names(&self) -> Vec<String> {
        self.inner.read().ordered.iter().map(|n| n.name().to_string()).collect()
    }

    /// Number of namespaces, including `/`.
    pub fn len(&self) -> usize {
        self.inner.read().ordered.len()
    }

    /// Always false: `/` is present from construction on.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for NamespaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceRegistry")
            .field("names", &self.names())
            .field("adapter", &self.adapter_name())
            .finish_non_exhaustive()
    }
}
