//! Pricing table: `(provider kind, model)` to rubles per 1000 tokens.

use crate::providers::ProviderKind;
use std::collections::HashMap;

/// Maps `(kind, model)` to a unit price with per-kind defaults.
///
/// Lookup order: exact `(kind, model)` match, then the kind's default, then
/// 0.0 with a warning. Model names are matched case-insensitively; free
/// kinds (mock, local inference) always price at 0.0.
#[derive(Debug, Clone)]
pub struct PricingTable {
    exact: HashMap<(ProviderKind, String), f64>,
    defaults: HashMap<ProviderKind, f64>,
}

impl PricingTable {
    /// An empty table: every lookup falls through to 0.0.
    pub fn empty() -> Self {
        Self {
            exact: HashMap::new(),
            defaults: HashMap::new(),
        }
    }

    pub fn with_price(
        mut self,
        kind: ProviderKind,
        model: impl Into<String>,
        price_per_1k_rub: f64,
    ) -> Self {
        self.exact
            .insert((kind, model.into().to_lowercase()), price_per_1k_rub);
        self
    }

    pub fn with_default_price(mut self, kind: ProviderKind, price_per_1k_rub: f64) -> Self {
        self.defaults.insert(kind, price_per_1k_rub);
        self
    }

    /// Price in rubles per 1000 tokens for the given kind and model.
    ///
    /// An explicit entry always wins, so tests and demos may price a free
    /// backend; without one, free kinds stay at 0.0 without a warning.
    pub fn price_per_1k(&self, kind: ProviderKind, model: &str) -> f64 {
        if let Some(price) = self.exact.get(&(kind, model.to_lowercase())) {
            return *price;
        }
        if let Some(price) = self.defaults.get(&kind) {
            return *price;
        }
        if kind.is_free() {
            return 0.0;
        }
        tracing::warn!(kind = %kind, model, "no pricing entry for model, assuming 0.0");
        0.0
    }

    /// Monetary cost of `total_tokens` tokens in rubles.
    pub fn cost(&self, kind: ProviderKind, model: &str, total_tokens: u64) -> f64 {
        (total_tokens as f64 / 1000.0) * self.price_per_1k(kind, model)
    }
}

impl Default for PricingTable {
    /// List prices for the billed backends, in rubles per 1000 tokens.
    fn default() -> Self {
        Self::empty()
            .with_price(ProviderKind::GigaChat, "GigaChat", 0.2)
            .with_price(ProviderKind::GigaChat, "GigaChat-Pro", 1.5)
            .with_price(ProviderKind::GigaChat, "GigaChat-Max", 1.95)
            .with_default_price(ProviderKind::GigaChat, 0.2)
            .with_price(ProviderKind::YandexGpt, "yandexgpt-lite", 0.2)
            .with_price(ProviderKind::YandexGpt, "yandexgpt", 1.2)
            .with_default_price(ProviderKind::YandexGpt, 0.4)
            .with_default_price(ProviderKind::Mock, 0.0)
            .with_default_price(ProviderKind::Ollama, 0.0)
    }
}
