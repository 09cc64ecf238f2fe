//! Provider client implementations and the factory that builds them from config

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::traits::ModelProviderClient;
use super::{ModelProviderError, ModelResult, ProviderConfig, ProviderKind};

pub mod mock;
pub mod openai_compatible;

pub use mock::{MockBehavior, MockProviderClient};
pub use openai_compatible::OpenAICompatibleClient;

/// Build a client for one provider entry
pub fn build_client(config: &ProviderConfig, timeout: Duration) -> ModelResult<Arc<dyn ModelProviderClient>> {
    match config.kind {
        ProviderKind::Mock => Ok(Arc::new(MockProviderClient::echo(config.provider_id.clone()))),
        ProviderKind::OpenaiCompatible => {
            let endpoint = config.endpoint.clone().ok_or_else(|| {
                ModelProviderError::Internal(format!(
                    "provider '{}' has no endpoint configured",
                    config.provider_id
                ))
            })?;

            let api_key = match &config.api_key_env {
                Some(var) => match std::env::var(var) {
                    Ok(key) => Some(key),
                    Err(_) => {
                        warn!(provider_id = %config.provider_id, env = %var, "API key variable not set");
                        None
                    }
                },
                None => None,
            };

            Ok(Arc::new(OpenAICompatibleClient::new(
                config.provider_id.clone(),
                endpoint,
                api_key,
                config.model_name.clone(),
                timeout,
            )))
        }
    }
}
