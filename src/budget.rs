//! Monthly budget circuit breaker.
//!
//! Three states derived from `usage = spend / monthly_limit`:
//!
//! - **CLOSED** — `usage < alert_threshold`. All requests admitted.
//! - **HALF_OPEN** — `alert_threshold ≤ usage < breaker_threshold`. All
//!   requests admitted; each admission emits one `budget_alert`
//!   observation, deduplicated per minute.
//! - **OPEN** — `usage ≥ breaker_threshold`. Admissions denied until month
//!   rollover or an explicit administrative reset.
//!
//! Admission gates on *current* spend, never on a projection: the estimate
//! passed to [`BudgetBreaker::check_and_admit`] only appears in the log
//! line. Concurrent requests may therefore all be admitted under HALF_OPEN
//! even when their aggregate would trip OPEN — the breaker trades exactness
//! for throughput.
//!
//! The month key is compared on every public call inside the same critical
//! section as the read, so rollover is race-free: the first observation in
//! a new month sees spend already reset to zero.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::BudgetConfig;
use crate::error::GatewayError;
use crate::types::decimal_to_f64;

/// Time source. Injected so month rollover is testable; production uses
/// [`system_clock`].
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Circuit position, re-evaluated from spend on every observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        })
    }
}

/// Point-in-time view of the budget, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub monthly_limit_usd: f64,
    pub spend_usd: f64,
    /// `spend / limit`, rounded like all public money values.
    pub usage_ratio: f64,
    pub circuit: CircuitState,
    /// `(year, month)` of the period the spend belongs to.
    pub month_key: (i32, u32),
}

struct BreakerState {
    month: (i32, u32),
    spend: Decimal,
    /// Minute-of-epoch of the last HALF_OPEN alert, for dedup.
    last_alert_minute: Option<i64>,
    #[cfg(test)]
    alerts_emitted: u64,
}

/// The process-wide budget gate. One critical section covers every
/// read-modify-write; no await happens under the lock.
pub struct BudgetBreaker {
    limit: Decimal,
    alert_threshold: Decimal,
    breaker_threshold: Decimal,
    clock: Clock,
    state: Mutex<BreakerState>,
}

impl BudgetBreaker {
    pub fn new(config: &BudgetConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: &BudgetConfig, clock: Clock) -> Self {
        // Config::validate() guarantees the limit is finite and
        // decimal-representable and the thresholds sit in (0, 1].
        let limit = Decimal::from_f64(config.monthly_limit_usd).expect("validated budget limit");
        let alert_threshold =
            Decimal::from_f64(config.alert_threshold).expect("validated alert threshold");
        let breaker_threshold =
            Decimal::from_f64(config.breaker_threshold).expect("validated breaker threshold");

        let now = clock();
        Self {
            limit,
            alert_threshold,
            breaker_threshold,
            clock,
            state: Mutex::new(BreakerState {
                month: (now.year(), now.month()),
                spend: Decimal::ZERO,
                last_alert_minute: None,
                #[cfg(test)]
                alerts_emitted: 0,
            }),
        }
    }

    /// Admit or deny a request based on current spend.
    ///
    /// `estimated_cost_usd` is logged, never compared. Returns the state
    /// under which the request was admitted.
    pub fn check_and_admit(&self, estimated_cost_usd: f64) -> Result<CircuitState, GatewayError> {
        let now = (self.clock)();
        let mut state = self.state.lock().expect("budget state poisoned");
        self.roll_month_locked(&mut state, now);

        match self.circuit_of(state.spend) {
            CircuitState::Open => {
                tracing::warn!(
                    spend_usd = decimal_to_f64(state.spend),
                    limit_usd = decimal_to_f64(self.limit),
                    estimated_cost_usd,
                    "budget circuit open — request denied"
                );
                Err(GatewayError::BudgetExceeded {
                    spend_usd: decimal_to_f64(state.spend),
                    limit_usd: decimal_to_f64(self.limit),
                })
            }
            CircuitState::HalfOpen => {
                let minute = now.timestamp() / 60;
                if state.last_alert_minute != Some(minute) {
                    state.last_alert_minute = Some(minute);
                    #[cfg(test)]
                    {
                        state.alerts_emitted += 1;
                    }
                    tracing::warn!(
                        spend_usd = decimal_to_f64(state.spend),
                        limit_usd = decimal_to_f64(self.limit),
                        estimated_cost_usd,
                        "budget_alert: monthly spend past alert threshold"
                    );
                }
                Ok(CircuitState::HalfOpen)
            }
            CircuitState::Closed => Ok(CircuitState::Closed),
        }
    }

    /// Add an actual charge to the month's spend. Never denies; the new
    /// state takes effect on the next `check_and_admit`.
    pub fn record_usage(&self, cost_usd: Decimal) {
        let now = (self.clock)();
        let mut state = self.state.lock().expect("budget state poisoned");
        self.roll_month_locked(&mut state, now);
        state.spend += cost_usd;
    }

    /// Current snapshot. Observing state also applies month rollover.
    pub fn state(&self) -> BudgetSnapshot {
        let now = (self.clock)();
        let mut state = self.state.lock().expect("budget state poisoned");
        self.roll_month_locked(&mut state, now);

        let usage = if self.limit.is_zero() {
            Decimal::ZERO
        } else {
            state.spend / self.limit
        };
        BudgetSnapshot {
            monthly_limit_usd: decimal_to_f64(self.limit),
            spend_usd: decimal_to_f64(state.spend),
            usage_ratio: decimal_to_f64(usage),
            circuit: self.circuit_of(state.spend),
            month_key: state.month,
        }
    }

    /// Administrative reset: spend to zero, circuit CLOSED, month key
    /// unchanged.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("budget state poisoned");
        state.spend = Decimal::ZERO;
        state.last_alert_minute = None;
        tracing::info!("budget administratively reset");
    }

    fn circuit_of(&self, spend: Decimal) -> CircuitState {
        let usage = if self.limit.is_zero() {
            Decimal::ZERO
        } else {
            spend / self.limit
        };
        if usage >= self.breaker_threshold {
            CircuitState::Open
        } else if usage >= self.alert_threshold {
            CircuitState::HalfOpen
        } else {
            CircuitState::Closed
        }
    }

    fn roll_month_locked(&self, state: &mut BreakerState, now: DateTime<Utc>) {
        let current = (now.year(), now.month());
        if state.month != current {
            tracing::info!(
                from = format!("{:04}-{:02}", state.month.0, state.month.1),
                to = format!("{:04}-{:02}", current.0, current.1),
                carried_spend_usd = decimal_to_f64(state.spend),
                "monthly_reset: budget period rolled over"
            );
            state.month = current;
            state.spend = Decimal::ZERO;
            state.last_alert_minute = None;
        }
    }

    #[cfg(test)]
    fn alert_count(&self) -> u64 {
        self.state.lock().unwrap().alerts_emitted
    }
}
