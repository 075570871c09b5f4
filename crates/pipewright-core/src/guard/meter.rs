//! Resource consumption accumulator.
//!
//! `ResourceMeter` counts what a run segment has consumed since its last
//! checkpoint. The count is drained into the next checkpoint write, so the
//! budget deduction and the progress it paid for commit together.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const SCALE: f64 = 1_000_000.0;

/// Status returned after recording consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    /// Under the warning threshold (< 80% of the baseline).
    Ok,
    /// Just crossed 80% of the baseline. Returned exactly once per meter.
    Warning,
    /// At or over the baseline.
    Exhausted,
}

/// Lock-free consumption meter shared by a run segment's concurrent tasks.
///
/// Amounts are kept in micro-units so additions stay atomic.
#[derive(Debug, Clone)]
pub struct ResourceMeter {
    /// Budget remaining when the segment started.
    baseline: f64,
    pending: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
    warned: Arc<AtomicBool>,
}

fn to_micros(amount: f64) -> u64 {
    if amount.is_finite() && amount > 0.0 {
        (amount * SCALE).round() as u64
    } else {
        0
    }
}

fn from_micros(micros: u64) -> f64 {
    micros as f64 / SCALE
}

impl ResourceMeter {
    pub fn new(baseline: f64) -> Self {
        Self {
            baseline,
            pending: Arc::new(AtomicU64::new(0)),
            total: Arc::new(AtomicU64::new(0)),
            warned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Record consumption and report where the segment stands.
    pub fn record(&self, amount: f64) -> BudgetStatus {
        let micros = to_micros(amount);
        self.pending.fetch_add(micros, Ordering::SeqCst);
        let prev = self.total.fetch_add(micros, Ordering::SeqCst);
        let spent = from_micros(prev.saturating_add(micros));

        if spent >= self.baseline {
            return BudgetStatus::Exhausted;
        }

        let threshold = self.baseline * 0.8;
        if from_micros(prev) < threshold
            && spent >= threshold
            && self
                .warned
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return BudgetStatus::Warning;
        }

        BudgetStatus::Ok
    }

    /// Consumption not yet charged to a checkpoint.
    pub fn pending(&self) -> f64 {
        from_micros(self.pending.load(Ordering::SeqCst))
    }

    /// Drain the pending consumption for a checkpoint write.
    pub fn take(&self) -> f64 {
        from_micros(self.pending.swap(0, Ordering::SeqCst))
    }

    /// Put back an amount whose checkpoint write failed.
    pub fn restore(&self, amount: f64) {
        self.pending.fetch_add(to_micros(amount), Ordering::SeqCst);
    }

    /// Everything recorded by this meter, charged or not.
    pub fn total(&self) -> f64 {
        from_micros(self.total.load(Ordering::SeqCst))
    }

    pub fn baseline(&self) -> f64 {
        self.baseline
    }
}
