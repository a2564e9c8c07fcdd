//! Cost accounting for LLM usage.
//!
//! [`ModelPricing`] turns token usage into dollars when the backend does not
//! report a cost itself. [`CostTracker`] aggregates spend across every task
//! of a run so the batch summary can report totals per model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use super::litellm::Usage;

/// Micro-dollars per dollar. Agent calls routinely cost fractions of a cent,
/// so spend is accumulated in millionths of a dollar.
const MICROS_PER_DOLLAR: f64 = 1_000_000.0;

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Dollars per one million prompt tokens.
    pub input_per_1m: f64,
    /// Dollars per one million completion tokens.
    pub output_per_1m: f64,
}

impl ModelPricing {
    pub fn new(input_per_1m: f64, output_per_1m: f64) -> Self {
        Self {
            input_per_1m,
            output_per_1m,
        }
    }

    /// Dollar cost of the given usage.
    pub fn cost_of(&self, usage: &Usage) -> f64 {
        (usage.prompt_tokens as f64 / 1_000_000.0) * self.input_per_1m
            + (usage.completion_tokens as f64 / 1_000_000.0) * self.output_per_1m
    }
}

/// Resolve the dollar cost of one call.
///
/// A cost reported by the backend wins; otherwise the configured pricing is
/// applied; with neither the call is counted as free.
pub fn resolve_call_cost(usage: &Usage, pricing: Option<&ModelPricing>) -> f64 {
    match (usage.cost, pricing) {
        (Some(cost), _) => cost.max(0.0),
        (None, Some(pricing)) => pricing.cost_of(usage),
        (None, None) => 0.0,
    }
}

/// Run-wide spend tracker shared by every task of a batch.
#[derive(Debug, Default)]
pub struct CostTracker {
    total_micros: AtomicU64,
    calls: AtomicU64,
    by_model: RwLock<BTreeMap<String, u64>>,
}

/// Snapshot of tracked spend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostReport {
    /// Total spend in dollars.
    pub total_cost: f64,
    /// Number of model calls recorded.
    pub calls: u64,
    /// Spend per model in dollars.
    pub by_model: BTreeMap<String, f64>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one model call.
    pub fn record(&self, model: &str, cost: f64) {
        let micros = dollars_to_micros(cost);
        self.total_micros.fetch_add(micros, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut by_model = self.by_model.write().unwrap_or_else(|e| e.into_inner());
        *by_model.entry(model.to_string()).or_insert(0) += micros;

        tracing::trace!(model = model, cost = cost, "Recorded LLM usage");
    }

    /// Total spend in dollars.
    pub fn total_cost(&self) -> f64 {
        micros_to_dollars(self.total_micros.load(Ordering::SeqCst))
    }

    /// Number of calls recorded.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn report(&self) -> CostReport {
        let by_model = self.by_model.read().unwrap_or_else(|e| e.into_inner());
        CostReport {
            total_cost: self.total_cost(),
            calls: self.calls(),
            by_model: by_model
                .iter()
                .map(|(model, micros)| (model.clone(), micros_to_dollars(*micros)))
                .collect(),
        }
    }
}

fn dollars_to_micros(dollars: f64) -> u64 {
    if dollars <= 0.0 || !dollars.is_finite() {
        return 0;
    }
    (dollars * MICROS_PER_DOLLAR).round() as u64
}

fn micros_to_dollars(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_DOLLAR
}
