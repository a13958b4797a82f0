//! Seeded end-to-end workload
//!
//! Drives a [`Studio`] with random edits from several agents and share-link
//! holders, then audits every account. Used by `restage simulate` and the
//! integration tests.

use crate::config::StudioConfig;
use crate::error::StudioError;
use crate::simulated::SimulatedExecutor;
use crate::studio::Studio;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use restage_ledger::{AuditReport, LedgerConfig};
use restage_queue::{EditOutcome, EditParameters, FailureReason, OperationKind, QueueConfig};
use restage_token::Permissions;
use restage_types::{AccountId, ResourceId, ResourceLocator};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

/// Workload shape
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    pub operations: u64,
    pub accounts: usize,
    pub images_per_account: usize,
    pub starting_grant: u64,
    /// Fraction of executor calls that fail
    pub failure_rate: f64,
    /// Upper bound of the simulated provider latency
    pub max_latency: Duration,
    /// Fraction of edits submitted through a share link
    pub share_ratio: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            operations: 200,
            accounts: 3,
            images_per_account: 4,
            starting_grant: 100,
            failure_rate: 0.15,
            max_latency: Duration::from_millis(2),
            share_ratio: 0.25,
        }
    }
}

/// What happened during a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationReport {
    pub seed: u64,
    pub submitted: u64,
    pub rejected_at_submission: u64,
    pub completed: u64,
    pub failed: BTreeMap<String, u64>,
    pub credits_charged: u64,
    pub credits_refunded: u64,
    /// Refunds the ledger could not record
    pub credits_owed: u64,
    pub via_share_link: u64,
    pub audits: Vec<AuditReport>,
    pub final_balances: BTreeMap<String, u64>,
}

impl SimulationReport {
    /// Every account's log replays to its balance and no refund is owed
    #[must_use]
    pub fn passed(&self) -> bool {
        self.credits_owed == 0 && self.audits.iter().all(AuditReport::is_consistent)
    }

    /// Human-readable summary
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Simulation Report (seed {})", self.seed);
        let _ = writeln!(out, "==========================");
        let _ = writeln!(out, "Submitted:        {}", self.submitted);
        let _ = writeln!(out, "Rejected:         {}", self.rejected_at_submission);
        let _ = writeln!(out, "Completed:        {}", self.completed);
        for (reason, count) in &self.failed {
            let _ = writeln!(out, "Failed ({reason}): {count}");
        }
        let _ = writeln!(out, "Via share link:   {}", self.via_share_link);
        let _ = writeln!(out, "Credits charged:  {}", self.credits_charged);
        let _ = writeln!(out, "Credits refunded: {}", self.credits_refunded);
        if self.credits_owed > 0 {
            let _ = writeln!(out, "Credits owed:     {}", self.credits_owed);
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "Ledger audit:");
        for audit in &self.audits {
            let _ = writeln!(
                out,
                "  {}: {} entries, replayed {} vs recorded {} [{}]",
                audit.account_id,
                audit.entries,
                audit.replayed_balance,
                audit.recorded_remaining,
                if audit.is_consistent() { "OK" } else { "BROKEN" }
            );
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "Result: {}", if self.passed() { "PASS" } else { "FAIL" });
        out
    }
}

fn failure_label(reason: &FailureReason) -> &'static str {
    match reason {
        FailureReason::InsufficientCredits { .. } => "insufficient_credits",
        FailureReason::Executor { .. } => "executor",
        FailureReason::Timeout { .. } => "timeout",
        FailureReason::Cancelled => "cancelled",
        FailureReason::Ledger { .. } => "ledger",
    }
}

/// Run the workload to completion
///
/// # Errors
/// Setup failures only; per-edit failures are counted in the report.
pub async fn run_simulation(config: &SimulationConfig) -> Result<SimulationReport, StudioError> {
    let executor = SimulatedExecutor::new(config.seed)
        .with_failure_rate(config.failure_rate)
        .with_latency(Duration::ZERO, config.max_latency);
    let studio = Studio::new(
        StudioConfig::new()
            .with_ledger(LedgerConfig::default().with_starting_grant(config.starting_grant))
            .with_queue(QueueConfig::default().with_executor_timeout(Duration::from_secs(5))),
        Arc::new(executor),
    );
    let mut rng = StdRng::seed_from_u64(config.seed);

    let mut images: Vec<(AccountId, ResourceId, String)> = Vec::new();
    for a in 0..config.accounts.max(1) {
        let account = AccountId::named(format!("brokerage-{a}"));
        for i in 0..config.images_per_account.max(1) {
            let image = ResourceId::named(format!("{account}/listing-{i}"));
            studio.open_listing_image(
                &account,
                image.clone(),
                ResourceLocator::named(format!("uploads/{image}.jpg")),
            )?;
            let link = studio.share(
                &account,
                &format!("agent@{account}"),
                &image,
                Permissions::default(),
                None,
            )?;
            images.push((account.clone(), image, link.token));
        }
    }

    let mut report = SimulationReport {
        seed: config.seed,
        ..SimulationReport::default()
    };
    let share_ratio = config.share_ratio.clamp(0.0, 1.0);
    let mut tickets = Vec::new();

    for _ in 0..config.operations {
        let (account, image, link) = &images[rng.gen_range(0..images.len())];
        let kind = OperationKind::ALL[rng.gen_range(0..OperationKind::ALL.len())];
        let mask = kind.requires_mask().then(|| "c2ltdWxhdGVkLW1hc2s=".to_string());
        let via_link = rng.gen_bool(share_ratio);

        let submitted = if via_link {
            studio.submit_with_token(link, image, kind.as_str(), EditParameters::new(), mask)
        } else {
            studio.submit_as_account(account, image, kind.as_str(), EditParameters::new(), mask)
        };
        report.submitted += 1;
        match submitted {
            Ok(ticket) => {
                if via_link {
                    report.via_share_link += 1;
                }
                tickets.push(ticket.outcome());
            }
            Err(e) => {
                tracing::warn!("submission rejected: {e}");
                report.rejected_at_submission += 1;
            }
        }
    }

    for outcome in join_all(tickets).await {
        match outcome? {
            EditOutcome::Completed {
                credits_charged, ..
            } => {
                report.completed += 1;
                report.credits_charged += credits_charged;
            }
            EditOutcome::Failed {
                reason,
                refunded,
                refund_owed,
                ..
            } => {
                *report
                    .failed
                    .entry(failure_label(&reason).to_string())
                    .or_default() += 1;
                report.credits_refunded += refunded;
                report.credits_owed += refund_owed;
            }
        }
    }

    for a in 0..config.accounts.max(1) {
        let account = AccountId::named(format!("brokerage-{a}"));
        report.audits.push(studio.ledger().audit(&account)?);
        report
            .final_balances
            .insert(account.to_string(), studio.balance(&account)?.remaining);
    }
    Ok(report)
}
