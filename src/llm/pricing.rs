//! Per-model prices and running cost totals.

/// Context size and USD price per 1000 tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub max_tokens: usize,
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPricing {
    const fn new(max_tokens: usize, input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            max_tokens,
            input_per_1k,
            output_per_1k,
        }
    }

    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 / 1000.0) * self.input_per_1k
            + (completion_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

const MODELS: &[(&str, ModelPricing)] = &[
    ("gpt-3.5-turbo-16k", ModelPricing::new(16_384, 0.0015, 0.002)),
    ("gpt-4", ModelPricing::new(8_192, 0.03, 0.06)),
    ("gpt-4-32k", ModelPricing::new(32_768, 0.06, 0.12)),
    ("gpt-4-1106-preview", ModelPricing::new(128_000, 0.01, 0.03)),
    ("gpt-4o-mini", ModelPricing::new(16_384, 0.00015, 0.0006)),
    ("gpt-4o", ModelPricing::new(16_384, 0.0025, 0.01)),
    ("o3-mini", ModelPricing::new(4_096, 0.0011, 0.0044)),
    ("o1-mini", ModelPricing::new(2_048, 0.0165, 0.066)),
];

/// Look up a model by exact name, ignoring case.
pub fn pricing_for(model: &str) -> Option<ModelPricing> {
    let model = model.trim();
    MODELS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(model))
        .map(|(_, pricing)| *pricing)
}

/// Token and cost totals across model calls.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

impl Usage {
    /// Add one call. Returns its cost (zero for unknown models).
    pub fn record(
        &mut self,
        pricing: Option<ModelPricing>,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> f64 {
        let cost = pricing
            .map(|p| p.cost(prompt_tokens, completion_tokens))
            .unwrap_or(0.0);
        self.calls += 1;
        self.prompt_tokens += prompt_tokens;
        self.completion_tokens += completion_tokens;
        self.cost_usd += cost;
        cost
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_models() {
        let gpt4o = pricing_for("gpt-4o").unwrap();
        assert_eq!(gpt4o.max_tokens, 16_384);
        assert_eq!(pricing_for("GPT-4").unwrap().input_per_1k, 0.03);
        // Exact match only, so "gpt-4o-mini" does not resolve to "gpt-4o".
        assert_eq!(pricing_for("gpt-4o-mini").unwrap().output_per_1k, 0.0006);
        assert!(pricing_for("claude-3").is_none());
    }

    #[test]
    fn test_usage_totals() {
        let mut usage = Usage::default();
        let pricing = pricing_for("gpt-4");
        let first = usage.record(pricing, 1000, 500);
        assert!((first - 0.06).abs() < 1e-9);
        usage.record(pricing, 2000, 0);
        assert_eq!(usage.calls, 2);
        assert_eq!(usage.total_tokens(), 3500);
        assert!((usage.cost_usd - 0.12).abs() < 1e-9);

        assert_eq!(usage.record(None, 100, 100), 0.0);
        assert_eq!(usage.calls, 3);
    }
}
