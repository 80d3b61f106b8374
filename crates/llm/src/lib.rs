use std::sync::Arc;

mod model;
mod ollama;
mod provider;
mod rig_adapter;
#[cfg(test)]
mod test_support;

pub use model::{
    DEFAULT_OPENAI_MODEL, MODEL_CACHE_TTL, Model, ModelCache, ModelCatalog, ModelCatalogSource,
    default_openai_models, shared_model_cache,
};
pub use ollama::{DEFAULT_OLLAMA_BASE_URL, NdjsonDecoder, OllamaAdapter};
pub use provider::{
    BoxFuture, LlmProvider, ProviderConfig, ProviderError, ProviderEvent, ProviderEventSender,
    ProviderEventStream, ProviderKind, ProviderMessage, ProviderResult, ProviderStreamHandle,
    ProviderWorker, Role, StreamRequest,
};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigProviderAdapter, parse_model_list};

/// Builds the adapter matching `config.kind`.
pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = match config.kind {
            ProviderKind::OpenAi => RIG_OPENAI_PROVIDER_ID.to_string(),
            kind => kind.as_str().to_string(),
        };
    }

    match config.kind {
        ProviderKind::OpenAi
        | ProviderKind::Groq
        | ProviderKind::Together
        | ProviderKind::Fireworks => Ok(Arc::new(RigProviderAdapter::new(config)?)),
        ProviderKind::Ollama => Ok(Arc::new(OllamaAdapter::new(config)?)),
    }
}
