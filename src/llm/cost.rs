//! Per-model token pricing used for cost telemetry.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
}

/// Estimates the USD cost of a completion from its token counts.
///
/// Lookups match the longest known model-family prefix, so dated model ids
/// such as `claude-3-haiku-20240307` resolve to the `claude-3-haiku` entry.
/// Unknown models are priced at the table average.
#[derive(Debug, Clone)]
pub struct CostAnalyzer {
    pricing: HashMap<String, ModelPricing>,
}

impl Default for CostAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl CostAnalyzer {
    pub fn new() -> Self {
        let mut analyzer = Self {
            pricing: HashMap::new(),
        };
        analyzer.load_default_pricing();
        analyzer
    }

    fn load_default_pricing(&mut self) {
        // $0.25 / $1.25 per 1M tokens
        self.set_pricing("claude-3-haiku", 0.000_000_25, 0.000_001_25);
        self.set_pricing("claude-3-5-haiku", 0.000_000_8, 0.000_004);
        self.set_pricing("claude-3-sonnet", 0.000_003, 0.000_015);
        self.set_pricing("claude-3-5-sonnet", 0.000_003, 0.000_015);
        self.set_pricing("claude-3-opus", 0.000_015, 0.000_075);
    }

    pub fn set_pricing(&mut self, model_prefix: &str, input: f64, output: f64) {
        self.pricing.insert(
            model_prefix.to_string(),
            ModelPricing {
                input_cost_per_token: input,
                output_cost_per_token: output,
            },
        );
    }

    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        self.pricing
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, pricing)| *pricing)
            .unwrap_or_else(|| self.average_pricing())
    }

    pub fn estimate(&self, model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
        let pricing = self.pricing_for(model);
        tokens_in as f64 * pricing.input_cost_per_token
            + tokens_out as f64 * pricing.output_cost_per_token
    }

    fn average_pricing(&self) -> ModelPricing {
        if self.pricing.is_empty() {
            return ModelPricing {
                input_cost_per_token: 0.000_01,
                output_cost_per_token: 0.000_02,
            };
        }
        let count = self.pricing.len() as f64;
        ModelPricing {
            input_cost_per_token: self.pricing.values().map(|p| p.input_cost_per_token).sum::<f64>() / count,
            output_cost_per_token: self.pricing.values().map(|p| p.output_cost_per_token).sum::<f64>() / count,
        }
    }
}
