//! # Eventstream Gateway
//!
//! A chat-completion gateway that speaks the Anthropic Messages API and the
//! OpenAI Chat Completions API to clients, and a length-prefixed binary
//! event-stream protocol to its upstream.
//!
//! ## Overview
//!
//! The interesting part is the response path. For every request the
//! [`streaming`] engine:
//! - decodes the upstream's binary frames from arbitrarily chunked bytes
//! - normalizes each frame into a typed upstream event
//! - tracks tool invocations and buffers their argument fragments
//! - validates the outbound event order and re-emits it as SSE
//! - accounts output tokens from what the client actually received
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use eventstream_gateway::config::ProxyConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProxyConfig::from_env()?;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Error types and handling
//! - [`models`] - Client and upstream payload types
//! - [`streaming`] - Frame decoder, normalizer, tool tracking and SSE output
//! - [`provider`] - Collaborator traits (upstream, credentials, statistics)
//! - [`client`] - `reqwest` upstream and static credentials
//! - [`handler`] - `axum` routes
//! - [`metrics`] - Process-wide usage statistics

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod models;
pub mod provider;
pub mod streaming;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
