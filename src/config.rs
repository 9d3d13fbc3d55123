use crate::error::{ProxyError, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Full URL the client body is posted to
    pub endpoint: String,
    /// Bearer token handed out by the static credential provider
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Whether outbound protocol violations abort the stream or get corrected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolMode {
    #[default]
    Lenient,
    Strict,
}

/// Tunables of the streaming translation engine
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub protocol_mode: ProtocolMode,
    /// Consecutive empty reads mid-header before the parser synthesizes headers
    pub header_stall_threshold: u32,
    pub max_message_bytes: usize,
    pub verify_crc: bool,
    pub max_read_retries: u32,
    pub retry_backoff_ms: u64,
    pub non_stream_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            protocol_mode: ProtocolMode::Lenient,
            header_stall_threshold: 8,
            max_message_bytes: 16 * 1024 * 1024,
            verify_crc: true,
            max_read_retries: 3,
            retry_backoff_ms: 100,
            non_stream_timeout_secs: 10,
        }
    }
}

impl StreamConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn non_stream_timeout(&self) -> Duration {
        Duration::from_secs(self.non_stream_timeout_secs)
    }
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl ProxyConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let listen_addr =
            env::var("GATEWAY_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

        let log_format = match env::var("GATEWAY_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let endpoint = env::var("UPSTREAM_ENDPOINT")
            .map_err(|_| ProxyError::ConfigError("UPSTREAM_ENDPOINT not set".to_string()))?;

        let token = env::var("UPSTREAM_TOKEN").unwrap_or_default();

        let mut stream = StreamConfig::default();
        if let Ok(mode) = env::var("GATEWAY_PROTOCOL_MODE") {
            stream.protocol_mode = parse_protocol_mode(&mode)?;
        }
        if let Ok(retries) = env::var("GATEWAY_MAX_READ_RETRIES") {
            stream.max_read_retries = retries.parse::<u32>().map_err(|e| {
                ProxyError::ConfigError(format!("Invalid max read retries: {}", e))
            })?;
        }

        Ok(ProxyConfig {
            server: ServerConfig {
                listen_addr,
                log_format,
            },
            upstream: UpstreamConfig {
                endpoint,
                token,
                request_timeout_secs: default_request_timeout_secs(),
            },
            stream,
        })
    }

    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ProxyError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let mut config: ProxyConfig = toml::from_str(&contents)
            .map_err(|e| ProxyError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        // Allow environment variables to override file config
        if let Ok(token) = env::var("UPSTREAM_TOKEN") {
            config.upstream.token = token;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.upstream.endpoint.is_empty() {
            return Err(ProxyError::ConfigError("Endpoint is empty".to_string()));
        }

        if self.upstream.token.is_empty() {
            return Err(ProxyError::ConfigError("Upstream token is empty".to_string()));
        }

        if self.stream.header_stall_threshold == 0 {
            return Err(ProxyError::ConfigError(
                "Header stall threshold must be greater than 0".to_string(),
            ));
        }

        if self.stream.max_message_bytes < 16 {
            return Err(ProxyError::ConfigError(
                "Max message size must hold at least a frame prelude".to_string(),
            ));
        }

        if self.stream.non_stream_timeout_secs == 0 {
            return Err(ProxyError::ConfigError(
                "Non-streaming timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_protocol_mode(value: &str) -> Result<ProtocolMode> {
    match value {
        "lenient" => Ok(ProtocolMode::Lenient),
        "strict" => Ok(ProtocolMode::Strict),
        other => Err(ProxyError::ConfigError(format!(
            "Unknown protocol mode: {}",
            other
        ))),
    }
}
