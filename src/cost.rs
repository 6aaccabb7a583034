//! Cost tracker — converts token usage to USD and keeps the month's books.
//!
//! Records are append-only and immutable once written; ordering is arrival
//! order with a per-process sequence number breaking clock ties. All money
//! arithmetic is fixed-scale decimal (6 places) so thousands of small
//! charges cannot drift the way binary floats do; the public surface
//! exposes USD as `f64` rounded to 6 places.
//!
//! Month aggregates (total, per-provider, per-model) are maintained in
//! concurrent maps on the write path so admin reads never scan the full
//! record list.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Datelike, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::budget::{system_clock, Clock};
use crate::catalog::ModelCatalog;
use crate::types::{decimal_to_f64, ProviderName};

/// One immutable charge. Exactly one exists per completed request.
#[derive(Debug, Clone, Serialize)]
pub struct CostRecord {
    pub timestamp: DateTime<Utc>,
    /// Per-process arrival sequence; breaks timestamp ties.
    pub sequence: u64,
    pub provider: ProviderName,
    pub model_id: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    /// Fixed-scale USD amount (6 decimal places).
    pub cost_usd: Decimal,
    pub request_id: String,
    /// True when token counts came from the char/4 estimate.
    pub estimated_usage: bool,
    /// True when the model id was unknown to the catalog and priced at zero.
    pub unknown_model: bool,
}

/// Month filter and aggregate view for the admin surface.
#[derive(Debug, Clone, Default)]
pub struct CostFilter {
    pub provider: Option<ProviderName>,
    pub model: Option<String>,
    /// `(year, month)`; defaults to the current month.
    pub month: Option<(i32, u32)>,
}

/// Aggregated totals for one month.
#[derive(Debug, Clone, Serialize)]
pub struct CostSummary {
    /// `YYYY-MM`.
    pub month: String,
    pub total_usd: f64,
    pub by_provider: HashMap<String, f64>,
    pub by_model: HashMap<String, f64>,
    pub record_count: usize,
}

fn month_key(ts: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", ts.year(), ts.month())
}

/// Append-only cost ledger with concurrent month aggregates.
pub struct CostTracker {
    catalog: Arc<ModelCatalog>,
    clock: Clock,
    records: RwLock<Vec<CostRecord>>,
    sequence: AtomicU64,
    /// month → total.
    month_totals: DashMap<String, Decimal>,
    /// (month, provider) → total.
    provider_totals: DashMap<(String, ProviderName), Decimal>,
    /// (month, model id) → total.
    model_totals: DashMap<(String, String), Decimal>,
}

impl CostTracker {
    pub fn new(catalog: Arc<ModelCatalog>) -> Self {
        Self::with_clock(catalog, system_clock())
    }

    /// Construction with an injected clock, for month-rollover tests.
    pub fn with_clock(catalog: Arc<ModelCatalog>, clock: Clock) -> Self {
        Self {
            catalog,
            clock,
            records: RwLock::new(Vec::new()),
            sequence: AtomicU64::new(0),
            month_totals: DashMap::new(),
            provider_totals: DashMap::new(),
            model_totals: DashMap::new(),
        }
    }

    /// Convert token usage to USD, append the record, return the cost.
    ///
    /// `cost = prompt·price_in/1000 + completion·price_out/1000` at scale 6.
    /// A model id unknown to the catalog is priced at zero and the record is
    /// flagged `unknown_model`.
    pub fn record(
        &self,
        provider: ProviderName,
        model_id: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
        request_id: &str,
        estimated_usage: bool,
    ) -> Decimal {
        let (price_in, price_out, unknown_model) = match self.catalog.price_for(model_id) {
            Some((input, output)) => (input, output, false),
            None => (Decimal::ZERO, Decimal::ZERO, true),
        };

        let thousand = Decimal::from(1_000u32);
        let cost = (Decimal::from(prompt_tokens) * price_in / thousand
            + Decimal::from(completion_tokens) * price_out / thousand)
            .round_dp(6);

        let timestamp = (self.clock)();
        let month = month_key(timestamp);
        let record = CostRecord {
            timestamp,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            provider,
            model_id: model_id.to_string(),
            prompt_tokens,
            completion_tokens,
            cost_usd: cost,
            request_id: request_id.to_string(),
            estimated_usage,
            unknown_model,
        };

        if unknown_model {
            tracing::warn!(%provider, model = model_id, "unknown model id — priced at zero");
        }

        *self.month_totals.entry(month.clone()).or_insert(Decimal::ZERO) += cost;
        *self
            .provider_totals
            .entry((month.clone(), provider))
            .or_insert(Decimal::ZERO) += cost;
        *self
            .model_totals
            .entry((month, model_id.to_string()))
            .or_insert(Decimal::ZERO) += cost;

        self.records.write().expect("cost ledger poisoned").push(record);
        cost
    }

    /// Total spend for one calendar month.
    pub fn month_total(&self, year: i32, month: u32) -> Decimal {
        let key = format!("{year:04}-{month:02}");
        self.month_totals
            .get(&key)
            .map(|v| *v)
            .unwrap_or(Decimal::ZERO)
    }

    /// Per-provider totals for one calendar month.
    pub fn totals_by_provider(&self, year: i32, month: u32) -> HashMap<ProviderName, Decimal> {
        let key = format!("{year:04}-{month:02}");
        self.provider_totals
            .iter()
            .filter(|e| e.key().0 == key)
            .map(|e| (e.key().1, *e.value()))
            .collect()
    }

    /// Per-model totals for one calendar month.
    pub fn totals_by_model(&self, year: i32, month: u32) -> HashMap<String, Decimal> {
        let key = format!("{year:04}-{month:02}");
        self.model_totals
            .iter()
            .filter(|e| e.key().0 == key)
            .map(|e| (e.key().1.clone(), *e.value()))
            .collect()
    }

    /// Paginated record list, newest first.
    pub fn records(&self, offset: usize, limit: usize) -> Vec<CostRecord> {
        let records = self.records.read().expect("cost ledger poisoned");
        records
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn record_count(&self) -> usize {
        self.records.read().expect("cost ledger poisoned").len()
    }

    /// Filtered aggregate view for the admin surface. Defaults to the
    /// current month when the filter names none.
    pub fn summary(&self, filter: &CostFilter) -> CostSummary {
        let (year, month) = filter.month.unwrap_or_else(|| {
            let now = (self.clock)();
            (now.year(), now.month())
        });
        let key = format!("{year:04}-{month:02}");

        let records = self.records.read().expect("cost ledger poisoned");
        let mut total = Decimal::ZERO;
        let mut by_provider: HashMap<String, Decimal> = HashMap::new();
        let mut by_model: HashMap<String, Decimal> = HashMap::new();
        let mut count = 0usize;

        for r in records.iter() {
            if month_key(r.timestamp) != key {
                continue;
            }
            if let Some(p) = filter.provider {
                if r.provider != p {
                    continue;
                }
            }
            if let Some(m) = &filter.model {
                if &r.model_id != m {
                    continue;
                }
            }
            total += r.cost_usd;
            *by_provider.entry(r.provider.to_string()).or_default() += r.cost_usd;
            *by_model.entry(r.model_id.clone()).or_default() += r.cost_usd;
            count += 1;
        }

        CostSummary {
            month: key,
            total_usd: decimal_to_f64(total),
            by_provider: by_provider.into_iter().map(|(k, v)| (k, decimal_to_f64(v))).collect(),
            by_model: by_model.into_iter().map(|(k, v)| (k, decimal_to_f64(v))).collect(),
            record_count: count,
        }
    }
}
