//! Available models and the current selection

use async_trait::async_trait;
use parley_api::{AiModel, ChatClient};

/// Lists the models the backend can route to
#[async_trait]
pub trait ModelSource: Send + Sync {
    async fn list_models(&self) -> parley_api::Result<Vec<AiModel>>;
}

#[async_trait]
impl ModelSource for ChatClient {
    async fn list_models(&self) -> parley_api::Result<Vec<AiModel>> {
        self.fetch_models().await
    }
}

/// Model list fetched once, plus which one is selected
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: Vec<AiModel>,
    selected: Option<String>,
}

impl ModelCatalog {
    /// Fetch models; a failed fetch yields an empty catalog
    pub async fn load(source: &dyn ModelSource) -> Self {
        match source.list_models().await {
            Ok(models) => Self::from_models(models),
            Err(e) => {
                tracing::warn!("Failed to fetch models: {}", e);
                Self::default()
            }
        }
    }

    /// Fetch again and reconcile; a failed fetch keeps what is loaded
    pub async fn refresh(&mut self, source: &dyn ModelSource) -> bool {
        match source.list_models().await {
            Ok(models) => {
                self.reconcile(models);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to refresh models: {}", e);
                false
            }
        }
    }

    pub fn from_models(models: Vec<AiModel>) -> Self {
        let models: Vec<AiModel> = models.into_iter().map(AiModel::normalized).collect();
        let selected = models.first().map(|m| m.id.clone());
        Self { models, selected }
    }

    pub fn models(&self) -> &[AiModel] {
        &self.models
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&AiModel> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn selected(&self) -> Option<&AiModel> {
        self.selected.as_deref().and_then(|id| self.get(id))
    }

    /// Select by id; unknown ids leave the selection alone
    pub fn select(&mut self, id: &str) -> bool {
        if self.get(id).is_none() {
            return false;
        }
        self.selected = Some(id.to_string());
        true
    }

    /// Replace the model list, keeping the selection when it still exists
    pub fn reconcile(&mut self, models: Vec<AiModel>) {
        let previous = self.selected.take();
        self.models = models.into_iter().map(AiModel::normalized).collect();
        self.selected = previous
            .filter(|id| self.models.iter().any(|m| &m.id == id))
            .or_else(|| self.models.first().map(|m| m.id.clone()));
    }

    /// Distinct group names in first-seen order
    pub fn groups(&self) -> Vec<&str> {
        let mut groups: Vec<&str> = vec![];
        for model in &self.models {
            if !groups.contains(&model.group.as_str()) {
                groups.push(&model.group);
            }
        }
        groups
    }

    pub fn in_group<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a AiModel> + 'a {
        self.models.iter().filter(move |m| m.group == group)
    }
}
