//! Ledger conservation properties
//!
//! Replaying an account's log from zero must reproduce its balance, and no
//! interleaving of deducts may drive the balance below zero.

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use restage_ledger::{
    CreditLedger, GrantRequest, LedgerConfig, LedgerError, TransactionFilter, TransactionKind,
    UsageMetadata,
};
use restage_types::AccountId;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Step {
    Deduct(u64),
    Purchase(u64),
    Adjust(u64),
    RefundLast,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (1u64..40).prop_map(Step::Deduct),
        1 => (1u64..60).prop_map(Step::Purchase),
        1 => (1u64..10).prop_map(Step::Adjust),
        2 => Just(Step::RefundLast),
    ]
}

proptest! {
    #[test]
    fn prop_log_replay_reproduces_balance(
        starting in 0u64..200,
        steps in prop::collection::vec(step(), 0..60),
    ) {
        let ledger = CreditLedger::new(LedgerConfig::new().with_starting_grant(starting));
        let account = AccountId::named("prop");
        let mut unrefunded = Vec::new();

        for step in steps {
            match step {
                Step::Deduct(cost) => {
                    let before = ledger.balance(&account).unwrap().remaining();
                    match ledger.deduct(&account, cost, UsageMetadata::new("walls")) {
                        Ok(txn) => {
                            prop_assert!(cost <= before);
                            unrefunded.push(txn);
                        }
                        Err(LedgerError::InsufficientCredits { required, remaining }) => {
                            prop_assert!(cost > before);
                            prop_assert_eq!(required, cost);
                            prop_assert_eq!(remaining, before);
                        }
                        Err(e) => prop_assert!(false, "unexpected error {e}"),
                    }
                }
                Step::Purchase(amount) => {
                    ledger.grant(&account, GrantRequest::purchase(amount, "pack")).unwrap();
                }
                Step::Adjust(amount) => {
                    ledger.grant(&account, GrantRequest::adjustment(amount, "goodwill")).unwrap();
                }
                Step::RefundLast => {
                    if let Some(usage) = unrefunded.pop() {
                        ledger
                            .grant(
                                &account,
                                GrantRequest::refund(usage.magnitude(), "failed edit")
                                    .reversing(usage.id),
                            )
                            .unwrap();
                    }
                }
            }
        }

        let remaining = ledger.balance(&account).unwrap().remaining();
        let log = ledger
            .transactions(&account, &TransactionFilter::new().page(usize::MAX, 0))
            .unwrap();
        let replayed: i128 = log.iter().map(|t| i128::from(t.amount)).sum();

        prop_assert_eq!(replayed, i128::from(remaining));
        prop_assert!(log.iter().all(|t| t.is_balanced()));
        prop_assert!(ledger.audit(&account).unwrap().is_consistent());
    }
}

#[test]
fn concurrent_deducts_never_overdraw() {
    let ledger = Arc::new(CreditLedger::new(LedgerConfig::new().with_starting_grant(100)));
    let account = AccountId::named("shared");

    let successes: u64 = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let account = account.clone();
                scope.spawn(move || {
                    let mut ok = 0u64;
                    for _ in 0..50 {
                        if ledger.deduct(&account, 3, UsageMetadata::new("remove")).is_ok() {
                            ok += 1;
                        }
                    }
                    ok
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    // 100 / 3 = 33 charges fit, one credit is left over
    assert_eq!(successes, 33);
    let account_state = ledger.balance(&account).unwrap();
    assert_eq!(account_state.remaining(), 1);

    let usage = ledger
        .transactions(
            &account,
            &TransactionFilter::new()
                .of_kind(TransactionKind::Usage)
                .page(usize::MAX, 0),
        )
        .unwrap();
    assert_eq!(usage.len(), 33);
    assert!(ledger.audit(&account).unwrap().is_consistent());
}

#[test]
fn concurrent_accounts_do_not_interfere() {
    let ledger = Arc::new(CreditLedger::new(LedgerConfig::default()));

    std::thread::scope(|scope| {
        for i in 0..4 {
            let ledger = Arc::clone(&ledger);
            scope.spawn(move || {
                let account = AccountId::named(format!("acct-{i}"));
                for _ in 0..100 {
                    ledger.deduct(&account, 2, UsageMetadata::default()).unwrap();
                }
            });
        }
    });

    for i in 0..4 {
        let account = AccountId::named(format!("acct-{i}"));
        assert_eq!(ledger.balance(&account).unwrap().remaining(), 800);
    }
}
