use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::provider::StatsRecorder;

/// Token usage across all responses served by this process
///
/// Thread-safe atomic counters plus a per-model breakdown.
#[derive(Default)]
pub struct UsageStats {
    /// Total number of responses recorded
    pub total_requests: AtomicU64,

    pub input_tokens: AtomicU64,

    pub output_tokens: AtomicU64,

    per_model: DashMap<String, ModelUsage>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModelUsage {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Average output tokens per response
    pub fn avg_output_tokens(&self) -> u64 {
        let total = self.output_tokens.load(Ordering::Relaxed);
        let count = self.total_requests.load(Ordering::Relaxed);
        if count > 0 { total / count } else { 0 }
    }

    pub fn model(&self, model: &str) -> Option<ModelUsage> {
        self.per_model.get(model).map(|entry| *entry.value())
    }

    /// Get snapshot of current usage
    pub fn snapshot(&self) -> UsageSnapshot {
        let mut models: Vec<(String, ModelUsage)> = self
            .per_model
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        models.sort_by(|a, b| a.0.cmp(&b.0));

        UsageSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            avg_output_tokens: self.avg_output_tokens(),
            models: models.into_iter().collect(),
        }
    }

    /// Reset all counters (useful for testing)
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.input_tokens.store(0, Ordering::Relaxed);
        self.output_tokens.store(0, Ordering::Relaxed);
        self.per_model.clear();
    }
}

impl StatsRecorder for UsageStats {
    fn record(&self, input_tokens: u32, output_tokens: u32, model: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.input_tokens
            .fetch_add(input_tokens as u64, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(output_tokens as u64, Ordering::Relaxed);

        let mut entry = self.per_model.entry(model.to_string()).or_default();
        entry.requests += 1;
        entry.input_tokens += input_tokens as u64;
        entry.output_tokens += output_tokens as u64;
    }
}

/// Immutable snapshot of usage at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub total_requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub avg_output_tokens: u64,
    pub models: std::collections::BTreeMap<String, ModelUsage>,
}

impl std::fmt::Display for UsageSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Usage: {} responses, {} input / {} output tokens, avg {} output, {} models",
            self.total_requests,
            self.input_tokens,
            self.output_tokens,
            self.avg_output_tokens,
            self.models.len()
        )
    }
}
