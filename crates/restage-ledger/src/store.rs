//! Storage seam for accounts and their transaction logs
//!
//! The ledger never touches rows directly; it hands a mutation closure to
//! [`LedgerStore::update`] and the store applies it atomically. A durable
//! implementation wraps the same closure in a database transaction.

use crate::error::LedgerError;
use crate::types::{Account, Transaction};
use dashmap::DashMap;
use restage_types::AccountId;

/// Mutation applied under the account's write lock.
///
/// Receives the current row and its log (oldest first) and returns the next
/// row plus the single transaction to append.
pub type AccountMutation<'a> =
    dyn FnMut(&Account, &[Transaction]) -> Result<(Account, Transaction), LedgerError> + 'a;

/// Transactional account store
pub trait LedgerStore: Send + Sync {
    /// Fetch an account row
    fn get(&self, account_id: &AccountId) -> Result<Option<Account>, LedgerError>;

    /// Insert a row (with its opening entry) unless one exists; returns the
    /// row that is stored afterwards
    fn insert_if_absent(
        &self,
        account: Account,
        opening: Option<Transaction>,
    ) -> Result<Account, LedgerError>;

    /// Atomic read-modify-write of one account.
    ///
    /// Either the new row and the appended transaction are both persisted or
    /// nothing is.
    fn update(
        &self,
        account_id: &AccountId,
        mutate: &mut AccountMutation<'_>,
    ) -> Result<Transaction, LedgerError>;

    /// Full log for an account, oldest first
    fn transactions(&self, account_id: &AccountId) -> Result<Vec<Transaction>, LedgerError>;
}

#[derive(Debug)]
struct AccountRow {
    account: Account,
    log: Vec<Transaction>,
}

/// In-process store
///
/// Each account lives in one map entry; holding the entry's write guard for
/// the duration of a mutation serialises writers of that account without
/// blocking other accounts.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    rows: DashMap<AccountId, AccountRow>,
}

impl InMemoryLedgerStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of provisioned accounts
    #[must_use]
    pub fn account_count(&self) -> usize {
        self.rows.len()
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn get(&self, account_id: &AccountId) -> Result<Option<Account>, LedgerError> {
        Ok(self.rows.get(account_id).map(|row| row.account.clone()))
    }

    fn insert_if_absent(
        &self,
        account: Account,
        opening: Option<Transaction>,
    ) -> Result<Account, LedgerError> {
        let row = self
            .rows
            .entry(account.id.clone())
            .or_insert_with(|| AccountRow {
                account,
                log: opening.into_iter().collect(),
            });
        Ok(row.account.clone())
    }

    fn update(
        &self,
        account_id: &AccountId,
        mutate: &mut AccountMutation<'_>,
    ) -> Result<Transaction, LedgerError> {
        let mut row = self
            .rows
            .get_mut(account_id)
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.clone()))?;

        let (next, txn) = mutate(&row.account, &row.log)?;
        row.account = next;
        row.log.push(txn.clone());
        Ok(txn)
    }

    fn transactions(&self, account_id: &AccountId) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self
            .rows
            .get(account_id)
            .map(|row| row.log.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionKind;
    use chrono::Utc;
    use restage_types::TransactionId;

    fn entry(account: &Account, amount: i64) -> Transaction {
        let before = account.remaining();
        Transaction {
            id: TransactionId::new(),
            account_id: account.id.clone(),
            amount,
            kind: TransactionKind::Adjustment,
            operation: None,
            resource_id: None,
            reverses: None,
            description: "test".into(),
            created_at: Utc::now(),
            balance_before: before,
            balance_after: before.saturating_add_signed(amount),
        }
    }

    #[test]
    fn insert_if_absent_keeps_first_row() {
        let store = InMemoryLedgerStore::new();
        let id = AccountId::named("a");
        let mut first = Account::open(id.clone(), Utc::now());
        first.total_credits = 10;
        let second = Account::open(id.clone(), Utc::now());

        store.insert_if_absent(first, None).unwrap();
        let stored = store.insert_if_absent(second, None).unwrap();

        assert_eq!(stored.total_credits, 10);
        assert_eq!(store.account_count(), 1);
    }

    #[test]
    fn failed_mutation_leaves_row_untouched() {
        let store = InMemoryLedgerStore::new();
        let id = AccountId::named("a");
        store
            .insert_if_absent(Account::open(id.clone(), Utc::now()), None)
            .unwrap();

        let result = store.update(&id, &mut |_, _| {
            Err(LedgerError::InvalidAmount("nope".into()))
        });

        assert!(result.is_err());
        assert!(store.transactions(&id).unwrap().is_empty());
    }

    #[test]
    fn update_appends_exactly_one_entry() {
        let store = InMemoryLedgerStore::new();
        let id = AccountId::named("a");
        store
            .insert_if_absent(Account::open(id.clone(), Utc::now()), None)
            .unwrap();

        store
            .update(&id, &mut |account, _| {
                let mut next = account.clone();
                next.total_credits += 5;
                Ok((next, entry(account, 5)))
            })
            .unwrap();

        assert_eq!(store.get(&id).unwrap().unwrap().remaining(), 5);
        assert_eq!(store.transactions(&id).unwrap().len(), 1);
    }

    #[test]
    fn update_unknown_account_fails() {
        let store = InMemoryLedgerStore::new();
        let result = store.update(&AccountId::named("ghost"), &mut |account, _| {
            Ok((account.clone(), entry(account, 1)))
        });
        assert!(matches!(result, Err(LedgerError::AccountNotFound(_))));
    }
}
