use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::provider::ProviderResult;

/// How long a fetched model list is served without asking the provider again.
pub const MODEL_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
        }
    }

    /// A model whose display name is its id.
    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Where a [`ModelCatalog`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelCatalogSource {
    ProviderApi,
    CacheFresh,
    CacheStaleFallback,
    StaticFallback,
}

impl ModelCatalogSource {
    /// Stale and static catalogs are served because the provider call failed.
    pub fn is_degraded(self) -> bool {
        matches!(self, Self::CacheStaleFallback | Self::StaticFallback)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    pub models: Vec<Model>,
    pub source: ModelCatalogSource,
    /// Provider error that forced a fallback, if any.
    pub warning: Option<String>,
}

impl ModelCatalog {
    pub fn from_provider_api(models: Vec<Model>) -> Self {
        Self::with_source(models, ModelCatalogSource::ProviderApi, None)
    }

    pub fn from_static_fallback(models: Vec<Model>, warning: String) -> Self {
        Self::with_source(models, ModelCatalogSource::StaticFallback, Some(warning))
    }

    fn with_source(models: Vec<Model>, source: ModelCatalogSource, warning: Option<String>) -> Self {
        Self {
            models,
            source,
            warning,
        }
    }

    pub fn model_ids(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|model| model.id.as_str())
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.model_ids().any(|id| id == model_id)
    }
}

#[derive(Debug, Clone)]
struct CachedModels {
    models: Vec<Model>,
    stored_at: Instant,
}

/// Model lists keyed by provider id, shared by every adapter instance so a
/// provider rebuilt after a settings change keeps its catalog.
pub struct ModelCache {
    by_provider: RwLock<HashMap<String, CachedModels>>,
    ttl: Duration,
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new(MODEL_CACHE_TTL)
    }
}

impl ModelCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            by_provider: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Resolves the catalog for `provider_id`: a fresh cache entry, then
    /// `fetch`, then a stale entry, then `fallback`. Successful fetches
    /// refresh the cache. Never fails; fallbacks carry the fetch error.
    pub async fn catalog<F>(&self, provider_id: &str, fallback: &[Model], fetch: F) -> ModelCatalog
    where
        F: Future<Output = ProviderResult<Vec<Model>>>,
    {
        let cached = self.by_provider.read().await.get(provider_id).cloned();
        if let Some(entry) = &cached
            && entry.stored_at.elapsed() < self.ttl
        {
            return ModelCatalog::with_source(
                entry.models.clone(),
                ModelCatalogSource::CacheFresh,
                None,
            );
        }

        let error = match fetch.await {
            Ok(models) => {
                self.store(provider_id, models.clone()).await;
                return ModelCatalog::from_provider_api(models);
            }
            Err(error) => error.to_string(),
        };

        match cached {
            Some(entry) => {
                tracing::warn!(
                    provider_id,
                    cached_model_count = entry.models.len(),
                    error = %error,
                    "model fetch failed, serving stale cached models"
                );
                ModelCatalog::with_source(
                    entry.models,
                    ModelCatalogSource::CacheStaleFallback,
                    Some(error),
                )
            }
            None => {
                tracing::warn!(
                    provider_id,
                    fallback_model_count = fallback.len(),
                    error = %error,
                    "model fetch failed without cache, serving static models"
                );
                ModelCatalog::from_static_fallback(fallback.to_vec(), error)
            }
        }
    }

    pub async fn store(&self, provider_id: &str, models: Vec<Model>) {
        self.by_provider.write().await.insert(
            provider_id.to_string(),
            CachedModels {
                models,
                stored_at: Instant::now(),
            },
        );
    }

    pub async fn invalidate(&self, provider_id: &str) {
        self.by_provider.write().await.remove(provider_id);
    }
}

static SHARED_MODEL_CACHE: OnceLock<Arc<ModelCache>> = OnceLock::new();

/// Process-wide cache used by adapters unless one is injected.
pub fn shared_model_cache() -> Arc<ModelCache> {
    SHARED_MODEL_CACHE
        .get_or_init(|| Arc::new(ModelCache::default()))
        .clone()
}

pub fn default_openai_models() -> Vec<Model> {
    vec![
        Model::from_id(DEFAULT_OPENAI_MODEL).with_description("Fast and inexpensive"),
        Model::from_id("gpt-4o").with_description("General purpose flagship"),
        Model::from_id("gpt-4.1").with_description("Long context"),
        Model::from_id("o3").with_description("Reasoning"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;

    fn unreachable_provider() -> ProviderError {
        ProviderError::ProviderReported {
            stage: "test-fetch",
            message: "connection refused".to_string(),
        }
    }

    #[tokio::test]
    async fn fetched_models_are_cached_until_they_expire() {
        let cache = ModelCache::default();
        let fetched = cache
            .catalog("groq", &[], async { Ok(vec![Model::from_id("llama3")]) })
            .await;
        assert_eq!(fetched.source, ModelCatalogSource::ProviderApi);

        let cached = cache
            .catalog("groq", &[], async { Err(unreachable_provider()) })
            .await;
        assert_eq!(cached.source, ModelCatalogSource::CacheFresh);
        assert!(cached.contains("llama3"));
    }

    #[tokio::test]
    async fn failed_fetches_fall_back_to_stale_then_static_models() {
        let cache = ModelCache::new(Duration::ZERO);
        cache.store("openai", vec![Model::from_id("gpt-4o")]).await;

        let stale = cache
            .catalog("openai", &[], async { Err(unreachable_provider()) })
            .await;
        assert_eq!(stale.source, ModelCatalogSource::CacheStaleFallback);
        assert_eq!(stale.warning.as_deref(), Some("connection refused"));
        assert!(stale.contains("gpt-4o"));

        cache.invalidate("openai").await;
        let fallback = default_openai_models();
        let fixed = cache
            .catalog("openai", &fallback, async { Err(unreachable_provider()) })
            .await;
        assert_eq!(fixed.source, ModelCatalogSource::StaticFallback);
        assert!(fixed.source.is_degraded());
        assert!(fixed.contains(DEFAULT_OPENAI_MODEL));
    }
}
