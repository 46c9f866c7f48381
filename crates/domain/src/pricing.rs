//! Model pricing table and integer cost arithmetic.
//!
//! Costs are carried as `i64` milli-cents (1 USD = 100 000) end to end;
//! floating point only appears at display boundaries.

use serde::{Deserialize, Serialize};

/// Milli-cents per US dollar.
pub const MILLI_CENTS_PER_USD: i64 = 100_000;

/// One pricing row. `model_substring` is matched case-insensitively against
/// the model name; first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingEntry {
    pub model_substring: String,
    /// Milli-cents per million input tokens.
    pub input_per_mtok: i64,
    /// Milli-cents per million output tokens.
    pub output_per_mtok: i64,
}

/// The resolved pricing table. Falls back to the deepseek rates for
/// unrecognised models.
#[derive(Debug, Clone)]
pub struct PricingTable {
    entries: Vec<PricingEntry>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            entries: builtin_entries(),
        }
    }
}

/// Built-in rates, milli-cents per MTok:
/// deepseek $0.14/$0.28, gpt-4 $2.50/$10.00, gpt-3.5 $0.15/$0.60.
fn builtin_entries() -> Vec<PricingEntry> {
    vec![
        PricingEntry {
            model_substring: "deepseek".into(),
            input_per_mtok: 14_000,
            output_per_mtok: 28_000,
        },
        PricingEntry {
            model_substring: "gpt-4".into(),
            input_per_mtok: 250_000,
            output_per_mtok: 1_000_000,
        },
        PricingEntry {
            model_substring: "gpt-3.5".into(),
            input_per_mtok: 15_000,
            output_per_mtok: 60_000,
        },
    ]
}

/// Default rates for models with no table entry (deepseek).
const DEFAULT_INPUT_PER_MTOK: i64 = 14_000;
const DEFAULT_OUTPUT_PER_MTOK: i64 = 28_000;

impl PricingTable {
    /// Build a table from configured entries; empty config means built-ins.
    pub fn from_entries(entries: Vec<PricingEntry>) -> Self {
        if entries.is_empty() {
            Self::default()
        } else {
            Self { entries }
        }
    }

    fn rates_for(&self, model: &str) -> (i64, i64) {
        let lower = model.to_lowercase();
        for entry in &self.entries {
            if lower.contains(&entry.model_substring.to_lowercase()) {
                return (entry.input_per_mtok, entry.output_per_mtok);
            }
        }
        (DEFAULT_INPUT_PER_MTOK, DEFAULT_OUTPUT_PER_MTOK)
    }

    /// Incremental cost of one call, in milli-cents, rounded to nearest.
    pub fn cost_milli_cents(&self, model: &str, input_tokens: u64, output_tokens: u64) -> i64 {
        let (in_rate, out_rate) = self.rates_for(model);
        scaled(input_tokens, in_rate) + scaled(output_tokens, out_rate)
    }
}

/// tokens * rate_per_mtok / 1e6, rounded half-up, without overflow.
fn scaled(tokens: u64, rate_per_mtok: i64) -> i64 {
    ((tokens as i128 * rate_per_mtok as i128 + 500_000) / 1_000_000) as i64
}

/// Convert milli-cents to USD for display only.
pub fn milli_cents_to_usd(milli_cents: i64) -> f64 {
    milli_cents as f64 / MILLI_CENTS_PER_USD as f64
}

/// Convert a USD figure (e.g. from a subprocess result message) to
/// milli-cents, rounded to nearest.
pub fn usd_to_milli_cents(usd: f64) -> i64 {
    (usd * MILLI_CENTS_PER_USD as f64).round() as i64
}
