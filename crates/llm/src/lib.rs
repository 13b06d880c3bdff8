pub mod provider;
pub mod rig_adapter;

pub use provider::{
    PromptMessage, ProviderConfig, ProviderError, ProviderEventStream, ProviderResult,
    ProviderStreamHandle, ProviderWorker, ResponseProvider, Role, StreamEventMapped,
    StreamEventPayload, StreamRequest, StreamTarget, make_event_stream,
};
pub use rig_adapter::{DEFAULT_GEMINI_MODEL, RIG_GEMINI_PROVIDER_ID, RigProviderAdapter};

use std::sync::Arc;

/// Builds the provider adapter for the configured provider id.
pub fn create_provider(config: ProviderConfig) -> ProviderResult<Arc<dyn ResponseProvider>> {
    let provider_id = config.provider_id.clone();
    match provider_id.as_str() {
        RIG_GEMINI_PROVIDER_ID | "" => Ok(Arc::new(RigProviderAdapter::new(config)?)),
        _ => provider::UnsupportedProviderSnafu {
            stage: "create-provider",
            provider_id,
        }
        .fail(),
    }
}
