//! Token counting for prompts and completions.
//!
//! Prefers a BPE tokenizer selected by model name. Models without a known
//! BPE (local and mock backends, GigaChat, YandexGPT) fall back to a word
//! count heuristic; the fallback is logged once per model, not per call.

use dashmap::DashMap;
use std::sync::Arc;
use tiktoken_rs::CoreBPE;

/// Words-to-tokens ratio used when no BPE is available for a model.
const FALLBACK_TOKENS_PER_WORD: f64 = 1.3;

/// Counts tokens for `(text, model)` pairs, caching one encoder per model.
pub struct TokenCounter {
    /// `None` marks a model with no usable BPE, so the lookup runs once.
    encoders: DashMap<String, Option<Arc<CoreBPE>>>,
    warned: DashMap<String, ()>,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self {
            encoders: DashMap::new(),
            warned: DashMap::new(),
        }
    }

    /// Number of tokens in `text` for the given model. Empty input is zero.
    pub fn count(&self, text: &str, model: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }

        if let Some(bpe) = self.encoder_for(model) {
            return bpe.encode_ordinary(text).len() as u64;
        }

        if self.warned.insert(model.to_string(), ()).is_none() {
            tracing::warn!(
                model,
                "no BPE tokenizer for model, falling back to word-count estimate"
            );
        }
        let words = text.split_whitespace().count();
        (words as f64 * FALLBACK_TOKENS_PER_WORD).round() as u64
    }

    fn encoder_for(&self, model: &str) -> Option<Arc<CoreBPE>> {
        if let Some(cached) = self.encoders.get(model) {
            return cached.value().clone();
        }
        let encoder = tiktoken_rs::get_bpe_from_model(model).ok().map(Arc::new);
        self.encoders.insert(model.to_string(), encoder.clone());
        encoder
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}
