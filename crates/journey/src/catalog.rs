//! In-memory step and template catalog.

use async_trait::async_trait;
use courier_core::contracts::{StepStore, TemplateStore};
use courier_core::types::{Step, Template};
use courier_core::CourierResult;
use dashmap::DashMap;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryCatalog {
    steps: DashMap<Uuid, Step>,
    templates: DashMap<Uuid, Template>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_step(&self, step: Step) {
        self.steps.insert(step.id, step);
    }

    pub fn insert_template(&self, template: Template) {
        self.templates.insert(template.id, template);
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

#[async_trait]
impl StepStore for InMemoryCatalog {
    async fn get_by_id(&self, id: Uuid) -> CourierResult<Option<Step>> {
        Ok(self.steps.get(&id).map(|s| s.clone()))
    }
}

#[async_trait]
impl TemplateStore for InMemoryCatalog {
    async fn get_by_id(&self, id: Uuid) -> CourierResult<Option<Template>> {
        Ok(self.templates.get(&id).map(|t| t.clone()))
    }
}
