//! Property-based tests for NamespaceRegistry
//!
//! The registry is the only shared state every connection touches, so these
//! pin down lookup stability and the adapter binding across arbitrary
//! sequences of names.

use std::{collections::BTreeSet, sync::Arc};

use proptest::prelude::*;
use switchboard_core::{
    Adapter, AdapterFactory, MemoryAdapter, MemoryAdapterFactory, NamespaceRegistry,
};
use switchboard_proto::TextCodec;

struct Named(&'static str);

impl AdapterFactory for Named {
    fn name(&self) -> &str {
        self.0
    }

    fn create(&self, _nsp: &str) -> Box<dyn Adapter> {
        Box::new(MemoryAdapter::new())
    }
}

fn registry() -> NamespaceRegistry {
    NamespaceRegistry::new(Arc::new(TextCodec), Arc::new(MemoryAdapterFactory))
}

/// Strategy for names with or without the leading slash
fn arbitrary_name() -> impl Strategy<Value = String> {
    ("/?", "[a-z0-9_-]{1,10}").prop_map(|(slash, body)| format!("{slash}{body}"))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: repeated lookups return the same instance
    #[test]
    fn prop_get_or_create_is_reference_stable(name in arbitrary_name()) {
        let registry = registry();
        let (first, _) = registry.get_or_create(&name);
        let (second, created) = registry.get_or_create(&name);

        prop_assert!(!created);
        prop_assert!(Arc::ptr_eq(&first, &second));
    }

    /// Property: a bare name and its slash-prefixed form are the same namespace
    #[test]
    fn prop_bare_name_canonicalizes(body in "[a-z0-9_-]{1,10}") {
        let registry = registry();
        let (bare, _) = registry.get_or_create(&body);
        let (slashed, _) = registry.get_or_create(&format!("/{body}"));

        prop_assert!(Arc::ptr_eq(&bare, &slashed));
        prop_assert_eq!(bare.name(), format!("/{body}"));
    }

    /// Property: the registry holds exactly the distinct canonical names, in
    /// first-reference order, plus `/`
    #[test]
    fn prop_registry_only_grows_in_order(names in prop::collection::vec(arbitrary_name(), 0..20)) {
        let registry = registry();
        let mut expected = vec!["/".to_string()];
        let mut seen: BTreeSet<String> = expected.iter().cloned().collect();

        for name in &names {
            registry.get_or_create(name);
            let canonical = NamespaceRegistry::canonicalize(name);
            if seen.insert(canonical.clone()) {
                expected.push(canonical);
            }
        }

        prop_assert_eq!(registry.names(), expected);
    }

    /// Property: after an adapter change every namespace re-initialized once
    #[test]
    fn prop_reinit_reaches_every_namespace_once(
        names in prop::collection::vec(arbitrary_name(), 0..10),
        changes in 1usize..4,
    ) {
        let registry = registry();
        for name in &names {
            registry.get_or_create(name);
        }

        for _ in 0..changes {
            let count = registry.reinit_adapters(Arc::new(Named("custom")));
            prop_assert_eq!(count, registry.len());
        }

        for nsp in registry.namespaces() {
            prop_assert_eq!(nsp.adapter_inits(), 1 + changes as u64);
            prop_assert_eq!(nsp.adapter_name(), "custom");
        }
    }
}
