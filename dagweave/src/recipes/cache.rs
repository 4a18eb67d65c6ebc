use std::sync::Arc;

use super::MappingRecipe;
use crate::storage::{PersistencePort, StoreResult};

/// Recipe lookup and outcome bookkeeping over the shared store.
#[derive(Clone)]
pub struct MappingCache {
    store: Arc<dyn PersistencePort>,
}

impl MappingCache {
    pub fn new(store: Arc<dyn PersistencePort>) -> Self {
        Self { store }
    }

    /// Recipes recorded for a shape pair, most successful first. Ties go to
    /// the recipe with fewer failures, then to the lower id so the order is
    /// stable.
    pub async fn lookup(
        &self,
        source_fingerprint: &str,
        target_fingerprint: &str,
    ) -> StoreResult<Vec<MappingRecipe>> {
        let mut recipes = self
            .store
            .recipes_for(source_fingerprint, target_fingerprint)
            .await?;
        recipes.sort_by(|a, b| {
            b.success_count
                .cmp(&a.success_count)
                .then(a.fail_count.cmp(&b.fail_count))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(recipes)
    }

    pub async fn best(
        &self,
        source_fingerprint: &str,
        target_fingerprint: &str,
    ) -> StoreResult<Option<MappingRecipe>> {
        Ok(self
            .lookup(source_fingerprint, target_fingerprint)
            .await?
            .into_iter()
            .next())
    }

    /// Stores the recipe if new and bumps its success or failure counter.
    pub async fn record(&self, recipe: &MappingRecipe, success: bool) -> StoreResult<MappingRecipe> {
        let stored = self.store.record_recipe_outcome(recipe, success).await?;
        log::debug!(
            "[MappingCache] {} {} -> success={} fail={}",
            stored.id,
            if success { "ok" } else { "failed" },
            stored.success_count,
            stored.fail_count
        );
        Ok(stored)
    }
}
