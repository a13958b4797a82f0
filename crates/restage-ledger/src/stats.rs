//! Usage aggregates derived from the transaction log

use crate::types::{Transaction, TransactionKind};
use chrono::NaiveDate;
use restage_types::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One day of activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub used: u64,
    pub refunded: u64,
    pub charges: u32,
}

/// Usage over a trailing window
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub window_days: u32,
    pub total_used: u64,
    pub total_refunded: u64,
    pub net_used: u64,
    pub usage_count: u32,
    pub daily: BTreeMap<NaiveDate, DailyUsage>,
    /// Gross credits charged per operation tag
    pub by_operation: BTreeMap<String, u64>,
}

impl UsageStats {
    pub(crate) fn aggregate<'a>(
        window_days: u32,
        since: Timestamp,
        log: impl IntoIterator<Item = &'a Transaction>,
    ) -> Self {
        let mut stats = Self {
            window_days,
            ..Self::default()
        };

        for txn in log.into_iter().filter(|t| t.created_at >= since) {
            let day = stats.daily.entry(txn.created_at.date_naive()).or_default();
            match txn.kind {
                TransactionKind::Usage => {
                    let cost = txn.magnitude();
                    day.used += cost;
                    day.charges += 1;
                    stats.total_used += cost;
                    stats.usage_count += 1;
                    let tag = txn.operation.clone().unwrap_or_else(|| "other".to_string());
                    *stats.by_operation.entry(tag).or_default() += cost;
                }
                TransactionKind::Refund => {
                    day.refunded += txn.magnitude();
                    stats.total_refunded += txn.magnitude();
                }
                TransactionKind::Purchase | TransactionKind::Adjustment => {}
            }
        }

        stats.daily.retain(|_, d| d.used > 0 || d.refunded > 0);
        stats.net_used = stats.total_used.saturating_sub(stats.total_refunded);
        stats
    }
}
