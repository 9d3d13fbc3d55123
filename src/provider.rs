use bytes::Bytes;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;

use crate::error::Result;

/// Upstream response body as a stream of arbitrarily sized chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Type alias for the future returned by send_request
pub type StreamFuture = Pin<Box<dyn Future<Output = Result<ByteStream>> + Send>>;

/// A request ready to be sent upstream
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub model: String,
    /// Client body, forwarded as-is
    pub body: Bytes,
    pub stream: bool,
}

/// Transport that delivers the upstream event-stream body
pub trait Provider: Send + Sync {
    /// Send a request and return the response body stream
    ///
    /// # Arguments
    /// * `request` - Target model and body to forward
    ///
    /// # Returns
    /// The upstream body, or an error for non-success statuses and transport failures
    fn send_request(&self, request: UpstreamRequest) -> StreamFuture;

    /// Get the provider name for logging
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub access_token: String,
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenWithUsage {
    pub token: TokenInfo,
    /// Times this token has been handed out
    pub use_count: u64,
}

/// Source of upstream bearer tokens
pub trait CredentialProvider: Send + Sync {
    fn get_token(&self) -> Result<TokenInfo>;

    fn get_token_with_usage(&self) -> Result<TokenWithUsage>;
}

/// Process-wide usage sink; must not fail or block the caller
pub trait StatsRecorder: Send + Sync {
    fn record(&self, input_tokens: u32, output_tokens: u32, model: &str);
}
