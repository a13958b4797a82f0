use chrono::Duration;
use pretty_assertions::assert_eq;
use restage_core::{run_simulation, SimulationConfig, Studio, StudioConfig, StudioError};
use restage_ledger::{LedgerConfig, TransactionFilter, TransactionKind, WarningLevel};
use restage_queue::{EditParameters, FailureReason, QueueError};
use restage_test_utils::{params, ScriptedExecutor};
use restage_token::{InvalidReason, Permissions};
use restage_types::{AccountId, ManualClock, ResourceId, ResourceLocator};
use serde_json::json;
use std::sync::Arc;
use tokio_test::assert_ok;

struct Fixture {
    studio: Studio,
    clock: Arc<ManualClock>,
    agent: AccountId,
    kitchen: ResourceId,
}

fn fixture(starting_grant: u64, executor: ScriptedExecutor) -> Fixture {
    let clock = Arc::new(ManualClock::starting_now());
    let studio = Studio::with_clock(
        StudioConfig::new()
            .with_ledger(LedgerConfig::default().with_starting_grant(starting_grant))
            .with_signing_secret("test-secret"),
        Arc::new(executor),
        clock.clone(),
    );
    let agent = AccountId::named("acme-realty");
    let kitchen = ResourceId::named("listing-9/kitchen");
    studio
        .open_listing_image(&agent, kitchen.clone(), ResourceLocator::named("uploads/kitchen.jpg"))
        .unwrap();
    Fixture {
        studio,
        clock,
        agent,
        kitchen,
    }
}

#[tokio::test]
async fn test_remove_failure_restores_balance() {
    let f = fixture(1000, ScriptedExecutor::failing("model overloaded"));

    let ticket = f
        .studio
        .submit_as_account(
            &f.agent,
            &f.kitchen,
            "remove",
            params(json!({"objectType": "fridge"})),
            Some("bWFzaw==".into()),
        )
        .unwrap();
    let outcome = ticket.outcome().await.unwrap();
    assert!(matches!(
        outcome.failure(),
        Some(FailureReason::Executor { .. })
    ));

    let balance = f.studio.balance(&f.agent).unwrap();
    assert_eq!(balance.remaining, 1000);
    assert_eq!(balance.warning, WarningLevel::None);

    let refunds = f
        .studio
        .transactions(&f.agent, &TransactionFilter::new().of_kind(TransactionKind::Refund))
        .unwrap();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount, 2);
}

#[tokio::test]
async fn test_insufficient_credits_surface_shortfall() {
    let f = fixture(1, ScriptedExecutor::succeeding());
    let first = f
        .studio
        .submit_as_account(&f.agent, &f.kitchen, "furniture", EditParameters::new(), None)
        .unwrap();
    assert!(first.outcome().await.unwrap().is_completed());

    let balance = f.studio.balance(&f.agent).unwrap();
    assert_eq!(balance.remaining, 0);
    assert_eq!(balance.warning, WarningLevel::Critical);

    let second = f
        .studio
        .submit_as_account(&f.agent, &f.kitchen, "furniture", EditParameters::new(), None)
        .unwrap();
    assert_eq!(
        second.outcome().await.unwrap().failure(),
        Some(&FailureReason::InsufficientCredits {
            required: 1,
            remaining: 0
        })
    );

    f.studio.purchase_credits(&f.agent, 50, "top-up").unwrap();
    assert_eq!(f.studio.balance(&f.agent).unwrap().remaining, 50);
}

#[tokio::test]
async fn test_share_link_defaults_and_edit_through_link() {
    let f = fixture(1000, ScriptedExecutor::succeeding());
    let link = f
        .studio
        .share(
            &f.agent,
            "agent@acme.test",
            &f.kitchen,
            Permissions::default(),
            Some(Duration::days(7)),
        )
        .unwrap();

    let claims = f.studio.validate_share(&link.token).into_result().unwrap();
    assert!(claims.permissions.can_edit);
    assert!(!claims.permissions.can_reshare);

    let ticket = f
        .studio
        .submit_with_token(
            &link.token,
            &f.kitchen,
            "walls",
            params(json!({"color": "sage"})),
            None,
        )
        .unwrap();
    assert!(ticket.outcome().await.unwrap().is_completed());

    // Billed to the issuing account
    assert_eq!(f.studio.balance(&f.agent).unwrap().remaining, 999);
    let analytics = f.studio.share_analytics(&f.kitchen);
    assert_eq!(analytics.len(), 1);
    assert_eq!(analytics[0].access_count, 1);
    assert_eq!(f.studio.active_shares("agent@acme.test").len(), 1);
}

#[tokio::test]
async fn test_share_link_rejections_are_structured() {
    let f = fixture(1000, ScriptedExecutor::succeeding());
    let view_only = f
        .studio
        .share(&f.agent, "agent", &f.kitchen, Permissions::view_only(), None)
        .unwrap();
    let err = f
        .studio
        .submit_with_token(&view_only.token, &f.kitchen, "walls", EditParameters::new(), None)
        .unwrap_err();
    assert_eq!(err, StudioError::PermissionDenied { permission: "edit" });
    // Viewing is allowed and counted
    assert_ok!(f.studio.view_with_token(&view_only.token, &f.kitchen));

    let other = ResourceId::named("listing-9/bath");
    let err = f
        .studio
        .submit_with_token(&view_only.token, &other, "walls", EditParameters::new(), None)
        .unwrap_err();
    assert!(matches!(err, StudioError::WrongResource { .. }));

    let err = f
        .studio
        .submit_with_token("not-a-token", &f.kitchen, "walls", EditParameters::new(), None)
        .unwrap_err();
    assert_eq!(err.access_reason(), Some(InvalidReason::Malformed));

    let short = f
        .studio
        .share(&f.agent, "agent", &f.kitchen, Permissions::default(), Some(Duration::hours(1)))
        .unwrap();
    f.clock.advance(Duration::hours(2));
    let err = f
        .studio
        .submit_with_token(&short.token, &f.kitchen, "walls", EditParameters::new(), None)
        .unwrap_err();
    assert_eq!(err, StudioError::Access(InvalidReason::Expired));
}

#[tokio::test]
async fn test_revoked_link_stops_working() {
    let f = fixture(1000, ScriptedExecutor::succeeding());
    let link = f
        .studio
        .share(&f.agent, "agent", &f.kitchen, Permissions::default(), None)
        .unwrap();
    assert!(f.studio.validate_share(&link.token).is_valid());

    assert_eq!(f.studio.revoke_share(&link.token).unwrap(), link.token_id);
    let err = f
        .studio
        .submit_with_token(&link.token, &f.kitchen, "walls", EditParameters::new(), None)
        .unwrap_err();
    assert_eq!(err.access_reason(), Some(InvalidReason::Revoked));
    assert!(f.studio.share_analytics(&f.kitchen)[0].revoked);
    assert_eq!(f.studio.balance(&f.agent).unwrap().remaining, 1000);
}

#[tokio::test]
async fn test_only_owner_may_edit_or_share() {
    let f = fixture(1000, ScriptedExecutor::succeeding());
    let rival = AccountId::named("rival-homes");

    let err = f
        .studio
        .submit_as_account(&rival, &f.kitchen, "walls", EditParameters::new(), None)
        .unwrap_err();
    assert!(matches!(err, StudioError::NotOwner { .. }));

    let err = f
        .studio
        .share(&rival, "rival", &f.kitchen, Permissions::default(), None)
        .unwrap_err();
    assert!(matches!(err, StudioError::NotOwner { .. }));

    let err = f
        .studio
        .open_listing_image(&rival, f.kitchen.clone(), ResourceLocator::named("x.jpg"))
        .unwrap_err();
    assert!(matches!(
        err,
        StudioError::Queue(QueueError::AccountMismatch { .. })
    ));
}

#[tokio::test]
async fn test_unknown_kind_is_rejected_without_charge() {
    let f = fixture(1000, ScriptedExecutor::succeeding());
    let err = f
        .studio
        .submit_as_account(&f.agent, &f.kitchen, "pool", EditParameters::new(), None)
        .unwrap_err();
    assert_eq!(
        err,
        StudioError::Queue(QueueError::UnknownOperationKind("pool".into()))
    );
    assert!(f.studio.queue_status(&f.kitchen).unwrap().is_idle());
    assert_eq!(f.studio.balance(&f.agent).unwrap().remaining, 1000);
}

#[tokio::test]
async fn test_usage_stats_group_by_operation() {
    let f = fixture(1000, ScriptedExecutor::succeeding());
    for kind in ["walls", "walls", "exterior"] {
        f.studio
            .submit_as_account(&f.agent, &f.kitchen, kind, EditParameters::new(), None)
            .unwrap()
            .outcome()
            .await
            .unwrap();
    }

    let stats = f.studio.usage_stats(&f.agent, 30).unwrap();
    assert_eq!(stats.total_used, 4);
    assert_eq!(stats.usage_count, 3);
    assert_eq!(stats.by_operation.get("walls"), Some(&2));
    assert_eq!(stats.by_operation.get("exterior"), Some(&2));

    let versions = f.studio.image_versions(&f.kitchen).unwrap();
    assert_eq!(versions.len(), 4);
    assert_eq!(f.studio.queue_status(&f.kitchen).unwrap().version, 3);
}

#[tokio::test]
async fn test_studios_with_same_secret_accept_each_others_links() {
    let a = fixture(1000, ScriptedExecutor::succeeding());
    let b = fixture(1000, ScriptedExecutor::succeeding());
    let link = a
        .studio
        .share(&a.agent, "agent", &a.kitchen, Permissions::default(), None)
        .unwrap();
    assert!(b.studio.validate_share(&link.token).is_valid());
}

#[tokio::test]
async fn test_seeded_simulation_keeps_ledgers_consistent() {
    let config = SimulationConfig {
        operations: 120,
        starting_grant: 20,
        failure_rate: 0.3,
        ..SimulationConfig::default()
    };
    let report = run_simulation(&config).await.unwrap();

    assert!(report.passed(), "{}", report.generate_text());
    assert_eq!(report.submitted, 120);
    assert_eq!(report.credits_owed, 0);
    let failed: u64 = report.failed.values().sum();
    assert_eq!(
        report.completed + failed + report.rejected_at_submission,
        report.submitted
    );
    assert!(report.failed.contains_key("executor"));
    // Tight budget: some edits must have been refused
    assert!(report.failed.contains_key("insufficient_credits"));

    for remaining in report.final_balances.values() {
        assert!(*remaining <= 20);
    }
}
