//! Read-through L1 cache over the step and template stores.
//!
//! Steps and templates are immutable once a journey is published, so a
//! short TTL is enough to keep hot jobs off the backing store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::contracts::{StepStore, TemplateStore};
use courier_core::types::{Step, Template};
use courier_core::CourierResult;
use tracing::debug;
use uuid::Uuid;

use crate::local::LocalCache;

pub struct CachedCatalog {
    steps: Arc<dyn StepStore>,
    templates: Arc<dyn TemplateStore>,
    step_cache: LocalCache<Uuid, Step>,
    template_cache: LocalCache<Uuid, Template>,
}

impl CachedCatalog {
    pub fn new(
        steps: Arc<dyn StepStore>,
        templates: Arc<dyn TemplateStore>,
        ttl: Duration,
        max_entries: usize,
    ) -> Self {
        Self {
            steps,
            templates,
            step_cache: LocalCache::new(ttl, max_entries),
            template_cache: LocalCache::new(ttl, max_entries),
        }
    }

    /// Drops any cached copy of a step or template with this id.
    pub fn invalidate(&self, id: Uuid) {
        self.step_cache.invalidate(&id);
        self.template_cache.invalidate(&id);
    }

    /// Run periodic maintenance (L1 eviction).
    pub fn maintenance(&self) {
        let evicted = self.step_cache.evict_expired() + self.template_cache.evict_expired();
        if evicted > 0 {
            debug!(evicted = evicted, "Catalog cache eviction complete");
        }
    }

    pub fn len(&self) -> usize {
        self.step_cache.len() + self.template_cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StepStore for CachedCatalog {
    async fn get_by_id(&self, id: Uuid) -> CourierResult<Option<Step>> {
        if let Some(step) = self.step_cache.get(&id) {
            metrics::counter!("cache.l1.hit", "kind" => "step").increment(1);
            return Ok(Some(step));
        }
        metrics::counter!("cache.l1.miss", "kind" => "step").increment(1);

        let step = self.steps.get_by_id(id).await?;
        if let Some(step) = &step {
            self.step_cache.put(id, step.clone());
        }
        Ok(step)
    }
}

#[async_trait]
impl TemplateStore for CachedCatalog {
    async fn get_by_id(&self, id: Uuid) -> CourierResult<Option<Template>> {
        if let Some(template) = self.template_cache.get(&id) {
            metrics::counter!("cache.l1.hit", "kind" => "template").increment(1);
            return Ok(Some(template));
        }
        metrics::counter!("cache.l1.miss", "kind" => "template").increment(1);

        let template = self.templates.get_by_id(id).await?;
        if let Some(template) = &template {
            self.template_cache.put(id, template.clone());
        }
        Ok(template)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use courier_core::types::{ExitMetadata, StepKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        step: Step,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl StepStore for CountingStore {
        async fn get_by_id(&self, id: Uuid) -> CourierResult<Option<Step>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok((id == self.step.id).then(|| self.step.clone()))
        }
    }

    #[async_trait]
    impl TemplateStore for CountingStore {
        async fn get_by_id(&self, _id: Uuid) -> CourierResult<Option<Template>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    fn store() -> Arc<CountingStore> {
        Arc::new(CountingStore {
            step: Step {
                id: Uuid::new_v4(),
                journey_id: Uuid::new_v4(),
                name: "exit".to_string(),
                kind: StepKind::Exit(ExitMetadata::default()),
            },
            reads: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_step_reads_are_cached() {
        let inner = store();
        let catalog = CachedCatalog::new(inner.clone(), inner.clone(), Duration::from_secs(60), 100);
        let id = inner.step.id;

        for _ in 0..3 {
            let step = StepStore::get_by_id(&catalog, id).await.unwrap();
            assert_eq!(step.unwrap().id, id);
        }
        assert_eq!(inner.reads.load(Ordering::SeqCst), 1);

        catalog.invalidate(id);
        StepStore::get_by_id(&catalog, id).await.unwrap();
        assert_eq!(inner.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_misses_are_not_cached() {
        let inner = store();
        let catalog = CachedCatalog::new(inner.clone(), inner.clone(), Duration::from_secs(60), 100);
        let missing = Uuid::new_v4();

        assert!(TemplateStore::get_by_id(&catalog, missing).await.unwrap().is_none());
        assert!(TemplateStore::get_by_id(&catalog, missing).await.unwrap().is_none());
        assert_eq!(inner.reads.load(Ordering::SeqCst), 2);
        assert!(catalog.is_empty());
    }
}
