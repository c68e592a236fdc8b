//! The write-only statistics sink the engine reports into.

use std::cell::RefCell;
use std::collections::HashMap;

/// Counters and gauges, addressed by name.
pub trait StatsSink {
    fn counter_inc(&self, name: &str);

    fn gauge_add(&self, name: &str, delta: i64);
}

/// Discards every value.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatsSink;

impl StatsSink for NullStatsSink {
    fn counter_inc(&self, _name: &str) {}

    fn gauge_add(&self, _name: &str, _delta: i64) {}
}

/// Keeps values in memory so they can be read back, mostly from tests.
#[derive(Debug, Default)]
pub struct IsolatedStatsStore {
    counters: RefCell<HashMap<String, u64>>,
    gauges: RefCell<HashMap<String, i64>>,
}

impl IsolatedStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero for a counter that was never incremented.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.borrow().get(name).copied().unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> i64 {
        self.gauges.borrow().get(name).copied().unwrap_or(0)
    }
}

impl StatsSink for IsolatedStatsStore {
    fn counter_inc(&self, name: &str) {
        *self.counters.borrow_mut().entry(name.to_owned()).or_default() += 1;
    }

    fn gauge_add(&self, name: &str, delta: i64) {
        *self.gauges.borrow_mut().entry(name.to_owned()).or_default() += delta;
    }
}
