use crate::error::{FabricError, ResourceType};
use crate::model::spec::{ModelSpec, SegregationDescriptor};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Model specs known to an adapter, keyed by model name.
///
/// Populated once per model at definition time and consulted by direct
/// lookup afterwards.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<ModelSpec>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `spec`; a second registration under the same name returns
    /// the first one unchanged.
    pub fn register(&self, spec: ModelSpec) -> Result<Arc<ModelSpec>, FabricError> {
        if let Some(existing) = self.models.read().get(&spec.name) {
            return Ok(Arc::clone(existing));
        }
        spec.validate()?;
        let mut models = self.models.write();
        let entry = models.entry(spec.name.clone()).or_insert_with(|| {
            debug!(model = %spec.name, table = %spec.table, "registered model");
            Arc::new(spec)
        });
        Ok(Arc::clone(entry))
    }

    pub fn get(&self, name: &str) -> Result<Arc<ModelSpec>, FabricError> {
        self.models
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| FabricError::not_found(ResourceType::Model, name))
    }

    pub fn by_table(&self, table: &str) -> Option<Arc<ModelSpec>> {
        self.models
            .read()
            .values()
            .find(|spec| spec.table == table)
            .cloned()
    }

    /// Segregation markers of `(model, field)`.
    pub fn segregation(
        &self,
        model: &str,
        field: &str,
    ) -> Result<Vec<SegregationDescriptor>, FabricError> {
        Ok(self.get(model)?.segregation_of(field).to_vec())
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent() {
        let registry = ModelRegistry::new();
        let first = registry
            .register(ModelSpec::new("Order").private_field("secret", "c1"))
            .expect("register");
        let second = registry
            .register(ModelSpec::new("Order"))
            .expect("register again");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.segregation("Order", "secret").expect("lookup").len(),
            1
        );
        assert!(registry.by_table("order").is_some());
    }

    #[test]
    fn unknown_model_is_not_found() {
        let registry = ModelRegistry::new();
        assert!(registry.get("Nope").expect_err("absent").is_not_found());
    }

    #[test]
    fn invalid_specs_are_not_registered() {
        let registry = ModelRegistry::new();
        let bad = ModelSpec::new("Bad").owned_by("owner");
        assert!(registry.register(bad).is_err());
        assert!(registry.is_empty());
    }
}
