//! Common trait for model provider clients

use async_trait::async_trait;

use super::{ModelRequest, ModelResult, ProviderReply};

/// Core trait that every model backend client implements
///
/// A client performs exactly one attempt per call. Retries, timeouts,
/// breaker bookkeeping and failover belong to the pool.
#[async_trait]
pub trait ModelProviderClient: Send + Sync {
    fn provider_id(&self) -> &str;

    /// Model used when the request does not name one
    fn default_model(&self) -> &str;

    async fn complete(&self, request: &ModelRequest) -> ModelResult<ProviderReply>;
}
