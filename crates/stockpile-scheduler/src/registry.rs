//! Collector registry — maps a collection type to a collector builder.
//!
//! Purely a lookup: adding a collection type means registering a builder
//! here, never branching inside the engine. Each resolution constructs a
//! fresh collector bound to one task's parameters, so no instance is ever
//! reused across tasks.

use std::collections::HashMap;

use crate::collector::Collector;
use crate::task::CollectionType;

type BuildFn = Box<dyn Fn(serde_json::Value) -> Box<dyn Collector> + Send + Sync>;

/// Static mapping from collection type to collector builder.
#[derive(Default)]
pub struct CollectorRegistry {
    builders: HashMap<CollectionType, BuildFn>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builder for a collection type. Last registration wins.
    pub fn register<F>(&mut self, collection_type: CollectionType, build: F)
    where
        F: Fn(serde_json::Value) -> Box<dyn Collector> + Send + Sync + 'static,
    {
        self.builders.insert(collection_type, Box::new(build));
    }

    /// Build a fresh collector for one execution. `None` means the type has
    /// no registered collector, a configuration error for the caller.
    pub fn resolve(
        &self,
        collection_type: CollectionType,
        parameters: serde_json::Value,
    ) -> Option<Box<dyn Collector>> {
        self.builders
            .get(&collection_type)
            .map(|build| build(parameters))
    }

    /// Registered collection types, for startup logging.
    pub fn registered_types(&self) -> Vec<CollectionType> {
        let mut types: Vec<_> = self.builders.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CollectError, Payload, StoredOutput};
    use async_trait::async_trait;

    struct EchoCollector {
        params: serde_json::Value,
    }

    #[async_trait]
    impl Collector for EchoCollector {
        fn collection_type(&self) -> CollectionType {
            CollectionType::News
        }

        async fn collect(&self) -> Result<Payload, CollectError> {
            Ok(vec![self.params.clone()])
        }

        async fn store(&self, _payload: Payload) -> Result<StoredOutput, CollectError> {
            Ok(StoredOutput::empty())
        }
    }

    #[tokio::test]
    async fn test_resolve_builds_fresh_collector_with_params() {
        let mut registry = CollectorRegistry::new();
        registry.register(CollectionType::News, |params| {
            Box::new(EchoCollector { params })
        });

        let c = registry
            .resolve(CollectionType::News, serde_json::json!({"q": "earnings"}))
            .unwrap();
        let payload = c.collect().await.unwrap();
        assert_eq!(payload[0]["q"], "earnings");

        // Unregistered type is a lookup miss, not a panic.
        assert!(registry
            .resolve(CollectionType::StockPrice, serde_json::Value::Null)
            .is_none());
    }

    #[test]
    fn test_registered_types_sorted() {
        let mut registry = CollectorRegistry::new();
        registry.register(CollectionType::News, |params| {
            Box::new(EchoCollector { params })
        });
        registry.register(CollectionType::Disclosure, |params| {
            Box::new(EchoCollector { params })
        });
        let types = registry.registered_types();
        assert_eq!(
            types,
            vec![CollectionType::Disclosure, CollectionType::News]
        );
    }
}
