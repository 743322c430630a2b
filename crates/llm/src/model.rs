use reqwest::Method;
use serde::Deserialize;

use super::transport::BackendClient;

pub const MODELS_PATH: &str = "/models";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            category: None,
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelCatalogSource {
    ProviderApi,
    StaticFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    pub models: Vec<Model>,
    pub default_model: String,
    pub source: ModelCatalogSource,
    pub warning: Option<String>,
}

impl ModelCatalog {
    pub fn from_provider_api(models: Vec<Model>, default_model: String) -> Self {
        Self {
            models,
            default_model,
            source: ModelCatalogSource::ProviderApi,
            warning: None,
        }
    }

    pub fn from_static_fallback(warning: String) -> Self {
        Self {
            models: default_models(),
            default_model: DEFAULT_MODEL.to_string(),
            source: ModelCatalogSource::StaticFallback,
            warning: Some(warning),
        }
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.models.iter().any(|model| model.id == model_id)
    }
}

pub fn default_models() -> Vec<Model> {
    vec![
        Model::new("gpt-4o-mini", "GPT-4o Mini")
            .with_description("Fast, low-cost model")
            .with_category("gpt-4"),
        Model::new("gpt-4o", "GPT-4o")
            .with_description("Latest high-performance model")
            .with_category("gpt-4"),
        Model::new("gpt-4-turbo", "GPT-4 Turbo")
            .with_description("High-performance model")
            .with_category("gpt-4"),
        Model::new("gpt-4", "GPT-4")
            .with_description("Standard high-performance model")
            .with_category("gpt-4"),
        Model::new("gpt-3.5-turbo", "GPT-3.5 Turbo")
            .with_description("Fast response model")
            .with_category("gpt-3.5"),
    ]
}

pub fn is_known_model(model_id: &str) -> bool {
    default_models().iter().any(|model| model.id == model_id)
}

#[derive(Debug, Deserialize)]
struct ModelListPayload {
    models: Vec<ModelEntry>,
    #[serde(default)]
    default_model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    value: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    category: Option<String>,
}

impl From<ModelEntry> for Model {
    fn from(entry: ModelEntry) -> Self {
        let name = entry
            .label
            .filter(|label| !label.trim().is_empty())
            .unwrap_or_else(|| entry.value.clone());
        Self {
            id: entry.value,
            name,
            description: entry.description.filter(|text| !text.is_empty()),
            category: entry.category,
        }
    }
}

impl BackendClient {
    /// Loads the backend's model list, falling back to the built-in catalog.
    pub async fn fetch_models(&self) -> ModelCatalog {
        let result = self
            .send_json::<ModelListPayload>(self.request(Method::GET, MODELS_PATH), "fetch-models")
            .await;

        match result {
            Ok(payload) if !payload.models.is_empty() => {
                let models = payload
                    .models
                    .into_iter()
                    .map(Model::from)
                    .collect::<Vec<_>>();
                let default_model = payload
                    .default_model
                    .filter(|id| models.iter().any(|model| &model.id == id))
                    .unwrap_or_else(|| models[0].id.clone());
                ModelCatalog::from_provider_api(models, default_model)
            }
            Ok(_) => {
                tracing::warn!("backend returned an empty model list; serving static fallback models");
                ModelCatalog::from_static_fallback("backend returned no models".to_string())
            }
            Err(error) => {
                let error_message = error.to_string();
                tracing::warn!(
                    error = %error_message,
                    fallback_model_count = default_models().len(),
                    "model fetch failed; serving static fallback models"
                );
                ModelCatalog::from_static_fallback(error_message)
            }
        }
    }
}
