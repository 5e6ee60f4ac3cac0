//! Running per-category order statistics.
//!
//! The aggregator is an explicit instance injected into the consume loop (and
//! shared with the stats surface). All state sits behind one mutex: category
//! cardinality is small and fixed (a product catalog), so contention is low
//! and a single lock keeps every update atomic, including the overall totals.
//!
//! Duplicate deliveries are counted again. At-least-once delivery means the
//! statistics are "at least" the true values; callers that need exact numbers
//! must deduplicate upstream.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

/// Sum and count for one category.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProductStatistic {
    total: f64,
    count: u64,
}

impl ProductStatistic {
    fn add(&mut self, amount: f64) {
        self.total += amount;
        self.count += 1;
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean amount. Zero for an empty statistic (never stored in the map).
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }
}

#[derive(Debug, Default)]
struct Totals {
    per_category: HashMap<String, ProductStatistic>,
    overall: ProductStatistic,
}

/// Point-in-time copy of the aggregate, in the shape served by `/metrics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
    pub total_count: u64,
    pub overall_average_price: f64,
    pub per_product: BTreeMap<String, CategorySnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySnapshot {
    pub count: u64,
    pub average_price: f64,
}

/// Thread-safe running averages keyed by category.
#[derive(Debug, Default)]
pub struct Aggregator {
    totals: Mutex<Totals>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Totals> {
        // Updates cannot panic half-way, so a poisoned guard still holds
        // consistent totals.
        self.totals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `amount` to `category` and return the category's new average.
    ///
    /// Look-up-or-create, add, increment and average happen under one lock,
    /// so concurrent callers never lose an update or observe a half-applied
    /// one.
    pub fn update_average(&self, category: &str, amount: f64) -> f64 {
        let mut totals = self.lock();
        totals.overall.add(amount);

        let stat = totals
            .per_category
            .entry(category.to_string())
            .or_default();
        stat.add(amount);
        stat.average()
    }

    /// Current statistic for `category`, if it has been seen.
    pub fn statistic(&self, category: &str) -> Option<ProductStatistic> {
        self.lock().per_category.get(category).copied()
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        let totals = self.lock();

        AggregateSnapshot {
            total_count: totals.overall.count(),
            overall_average_price: totals.overall.average(),
            per_product: totals
                .per_category
                .iter()
                .map(|(category, stat)| {
                    (
                        category.clone(),
                        CategorySnapshot {
                            count: stat.count(),
                            average_price: stat.average(),
                        },
                    )
                })
                .collect(),
        }
    }
}
