//! Pricing for inference work
//!
//! Cost is a coarse proxy: the character length of the produced text times a
//! flat per-token rate. Not a real tokenizer.

use serde::{Deserialize, Serialize};

/// Default per-token price offered to the broker
pub const DEFAULT_BASE_RATE: f64 = 0.0001;

/// Price sheet for inference jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSheet {
    /// Flat price per token
    pub base_rate: f64,
}

impl Default for PriceSheet {
    fn default() -> Self {
        Self {
            base_rate: DEFAULT_BASE_RATE,
        }
    }
}

impl PriceSheet {
    /// Create a price sheet with a custom rate (negative rates clamp to zero)
    pub fn new(base_rate: f64) -> Self {
        Self {
            base_rate: base_rate.max(0.0),
        }
    }

    /// Count billable tokens in a produced text
    pub fn tokens(text: &str) -> u64 {
        text.chars().count() as u64
    }

    /// Calculate the cost of a produced text
    pub fn cost(&self, tokens: u64) -> f64 {
        tokens as f64 * self.base_rate
    }
}
