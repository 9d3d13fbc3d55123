use arc_swap::ArcSwap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::error::{ProxyError, Result};
use crate::provider::{CredentialProvider, TokenInfo, TokenWithUsage};

/// A single configured token that can be swapped at runtime
///
/// Reads are lock-free; `rotate` replaces the token atomically.
pub struct StaticCredentials {
    token: ArcSwap<TokenInfo>,
    uses: AtomicU64,
}

impl StaticCredentials {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            token: ArcSwap::from_pointee(TokenInfo {
                access_token: access_token.into(),
                expires_at: None,
            }),
            uses: AtomicU64::new(0),
        }
    }

    /// Replace the current token; the use counter restarts
    pub fn rotate(&self, token: TokenInfo) {
        info!(expires_at = ?token.expires_at, "Rotating upstream token");
        self.token.store(Arc::new(token));
        self.uses.store(0, Ordering::Relaxed);
    }

    pub fn uses(&self) -> u64 {
        self.uses.load(Ordering::Relaxed)
    }

    fn current(&self) -> Result<TokenInfo> {
        let token = self.token.load();
        if token.access_token.is_empty() {
            return Err(ProxyError::CredentialError(
                "no upstream token configured".to_string(),
            ));
        }
        Ok((**token).clone())
    }
}

impl CredentialProvider for StaticCredentials {
    fn get_token(&self) -> Result<TokenInfo> {
        let token = self.current()?;
        let uses = self.uses.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(uses, "Handing out upstream token");
        Ok(token)
    }

    fn get_token_with_usage(&self) -> Result<TokenWithUsage> {
        let token = self.current()?;
        let use_count = self.uses.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(TokenWithUsage { token, use_count })
    }
}
