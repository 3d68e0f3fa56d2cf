use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

const MICROS_PER_USD: f64 = 1_000_000.0;

pub fn usd_to_micros(usd: f64) -> u64 {
    if !usd.is_finite() || usd <= 0.0 {
        return 0;
    }
    (usd * MICROS_PER_USD).round() as u64
}

pub fn micros_to_usd(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_USD
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("budget exceeded: spent ${spent:.4} of ${limit:.4}, next call needs ${requested:.4}")]
pub struct BudgetExceeded {
    pub spent: f64,
    pub limit: f64,
    pub requested: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LedgerSnapshot {
    pub spent_usd: f64,
    pub reserved_usd: f64,
    pub limit_usd: f64,
    pub commits: u64,
}

#[derive(Debug, Default)]
struct LedgerState {
    spent: u64,
    reserved: u64,
    commits: u64,
}

/// Run-wide spend counter against a fixed ceiling.
///
/// Amounts are held as integer micro-dollars. A call must hold a
/// [`Reservation`] before it is sent; the reservation is either committed
/// (the provider charged) or released when dropped.
#[derive(Debug)]
pub struct CostLedger {
    limit: u64,
    state: Mutex<LedgerState>,
}

impl CostLedger {
    pub fn new(limit_usd: f64) -> Self {
        Self {
            limit: usd_to_micros(limit_usd),
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn try_reserve(&self, unit_cost_usd: f64) -> Result<Reservation<'_>, BudgetExceeded> {
        let amount = usd_to_micros(unit_cost_usd);
        let mut state = self.lock();
        let projected = state
            .spent
            .checked_add(state.reserved)
            .and_then(|held| held.checked_add(amount));
        if !projected.is_some_and(|total| total <= self.limit) {
            return Err(BudgetExceeded {
                spent: micros_to_usd(state.spent),
                limit: micros_to_usd(self.limit),
                requested: micros_to_usd(amount),
            });
        }
        state.reserved += amount;
        Ok(Reservation {
            ledger: self,
            amount,
            settled: false,
        })
    }

    pub fn spent_usd(&self) -> f64 {
        micros_to_usd(self.lock().spent)
    }

    pub fn limit_usd(&self) -> f64 {
        micros_to_usd(self.limit)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.lock();
        LedgerSnapshot {
            spent_usd: micros_to_usd(state.spent),
            reserved_usd: micros_to_usd(state.reserved),
            limit_usd: micros_to_usd(self.limit),
            commits: state.commits,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn settle(&self, amount: u64, charged: bool) {
        let mut state = self.lock();
        state.reserved = state.reserved.saturating_sub(amount);
        if charged {
            state.spent = state.spent.saturating_add(amount);
            state.commits += 1;
        }
    }
}

/// Budget held for one in-flight billed call.
#[derive(Debug)]
#[must_use = "a reservation is released as soon as it is dropped"]
pub struct Reservation<'a> {
    ledger: &'a CostLedger,
    amount: u64,
    settled: bool,
}

impl Reservation<'_> {
    pub fn amount_usd(&self) -> f64 {
        micros_to_usd(self.amount)
    }

    /// Moves the reserved amount into `spent` and returns it in dollars.
    pub fn commit(mut self) -> f64 {
        self.settled = true;
        self.ledger.settle(self.amount, true);
        micros_to_usd(self.amount)
    }

    pub fn release(mut self) {
        self.settled = true;
        self.ledger.settle(self.amount, false);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.ledger.settle(self.amount, false);
        }
    }
}
