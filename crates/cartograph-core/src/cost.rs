// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};

use crate::events::{CostSnapshot, Usage};

/// One append-only entry in the cost ledger. Entries are never mutated or
/// removed; totals are always derived by summing.
#[derive(Debug, Clone)]
pub struct CostEntry {
    pub usage: Usage,
    pub cost: f64,
    pub model: String,
    pub timestamp: DateTime<Utc>,
}

/// Accumulates per-request usage reported from `message_end` events into a
/// running total, without ever mutating a past entry.
#[derive(Debug, Default)]
pub struct CostTracker {
    entries: Vec<CostEntry>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, usage: Usage, cost: f64, model: impl Into<String>, timestamp: DateTime<Utc>) {
        self.entries.push(CostEntry {
            usage,
            cost,
            model: model.into(),
            timestamp,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&CostEntry> {
        self.entries.last()
    }

    /// Sum of usage across every recorded entry.
    pub fn total_usage(&self) -> Usage {
        let mut total = Usage::default();
        for entry in &self.entries {
            total.add(&entry.usage);
        }
        total
    }

    /// Sum of cost across every recorded entry.
    pub fn total_cost(&self) -> f64 {
        self.entries.iter().map(|e| e.cost).sum()
    }

    pub fn latest_snapshot(&self) -> Option<CostSnapshot> {
        self.latest().map(|e| CostSnapshot {
            usage: e.usage,
            cost: e.cost,
            model: e.model.clone(),
            timestamp: e.timestamp,
        })
    }

    pub fn entries(&self) -> &[CostEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u32, output: u32) -> Usage {
        Usage {
            input,
            output,
            cache_read: 0,
            cache_write: 0,
        }
    }

    #[test]
    fn empty_tracker_has_zero_totals() {
        let t = CostTracker::new();
        assert_eq!(t.total_usage(), Usage::default());
        assert_eq!(t.total_cost(), 0.0);
        assert!(t.latest().is_none());
    }

    #[test]
    fn total_usage_is_sum_of_all_entries() {
        let mut t = CostTracker::new();
        t.record(usage(10, 5), 0.01, "m1", Utc::now());
        t.record(usage(20, 8), 0.02, "m1", Utc::now());
        let total = t.total_usage();
        assert_eq!(total.input, 30);
        assert_eq!(total.output, 13);
    }

    #[test]
    fn total_cost_is_sum_of_all_entries() {
        let mut t = CostTracker::new();
        t.record(usage(1, 1), 0.5, "m1", Utc::now());
        t.record(usage(1, 1), 0.25, "m1", Utc::now());
        assert_eq!(t.total_cost(), 0.75);
    }

    #[test]
    fn entries_are_never_mutated_in_place() {
        let mut t = CostTracker::new();
        t.record(usage(1, 1), 1.0, "m1", Utc::now());
        let first_cost = t.entries()[0].cost;
        t.record(usage(1, 1), 2.0, "m1", Utc::now());
        assert_eq!(t.entries()[0].cost, first_cost);
    }

    #[test]
    fn latest_snapshot_reflects_most_recent_entry() {
        let mut t = CostTracker::new();
        t.record(usage(1, 1), 1.0, "m1", Utc::now());
        t.record(usage(2, 2), 2.0, "m2", Utc::now());
        let snap = t.latest_snapshot().unwrap();
        assert_eq!(snap.model, "m2");
        assert_eq!(snap.cost, 2.0);
    }
}
