//! Registry resolving saga definitions by name.
//!
//! Persisted instances reference their definition by name, so recovery
//! needs the definition registered before `load`/`resume`.

use super::SagaDefinition;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct SagaRegistry {
    definitions: DashMap<String, Arc<SagaDefinition>>,
}

impl SagaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the definition's name, replacing any previous entry.
    pub fn register(&self, definition: SagaDefinition) -> Arc<SagaDefinition> {
        self.register_arc(Arc::new(definition))
    }

    pub fn register_arc(&self, definition: Arc<SagaDefinition>) -> Arc<SagaDefinition> {
        let name = definition.name().to_string();
        if self
            .definitions
            .insert(name.clone(), definition.clone())
            .is_some()
        {
            tracing::warn!(saga = %name, "Replacing registered saga definition");
        }
        definition
    }

    pub fn get(&self, name: &str) -> Option<Arc<SagaDefinition>> {
        self.definitions.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
