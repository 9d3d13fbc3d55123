use futures::StreamExt;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::config::UpstreamConfig;
use crate::error::{ProxyError, Result};
use crate::provider::{ByteStream, CredentialProvider, Provider, StreamFuture, UpstreamRequest};

const EVENT_STREAM_CONTENT_TYPE: &str = "application/vnd.amazon.eventstream";

/// Posts client bodies to the event-stream endpoint
pub struct HttpUpstream {
    client: Client,
    endpoint: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                ProxyError::InternalError(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            credentials,
        })
    }
}

impl Provider for HttpUpstream {
    fn send_request(&self, request: UpstreamRequest) -> StreamFuture {
        let client = self.client.clone();
        let url = self.endpoint.clone();
        let token = self.credentials.get_token();

        Box::pin(async move {
            let token = token?;
            Self::send_request_impl(client, url, token.access_token, request).await
        })
    }

    fn name(&self) -> &str {
        "http-upstream"
    }
}

impl HttpUpstream {
    async fn send_request_impl(
        client: Client,
        url: String,
        token: String,
        request: UpstreamRequest,
    ) -> Result<ByteStream> {
        info!(
            url = %url,
            model = %request.model,
            bytes = request.body.len(),
            stream = request.stream,
            "Sending upstream request"
        );

        let response = client
            .post(&url)
            .bearer_auth(&token)
            .header("Content-Type", "application/json")
            .header("Accept", EVENT_STREAM_CONTENT_TYPE)
            .body(request.body)
            .send()
            .await
            .map_err(|e| ProxyError::TransportError(format!("Upstream request failed: {}", e)))?;

        let status = response.status();
        info!(status = status.as_u16(), "Upstream responded");

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!(status = status.as_u16(), body = %message, "Upstream returned an error");
            return Err(ProxyError::UpstreamError {
                status: status.as_u16(),
                message,
            });
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        Ok(Box::pin(stream))
    }
}
