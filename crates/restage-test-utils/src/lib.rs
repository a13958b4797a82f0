//! Testing utilities for the Restage workspace
//!
//! Scripted executors, concurrency tracking and common fixtures.

#![allow(missing_docs)]

use parking_lot::Mutex;
use restage_ledger::{
    Account, AccountMutation, CreditLedger, InMemoryLedgerStore, LedgerConfig, LedgerError,
    LedgerStore, Transaction,
};
use restage_queue::{
    CostTable, EditExecutor, EditParameters, EditQueue, EditRequest, ExecutorError, QueueConfig,
};
use restage_types::{AccountId, ResourceId, ResourceLocator, SystemClock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What the next executor call does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Succeed,
    Fail(ExecutorError),
    /// Never answer; only the queue timeout ends the call
    Hang,
}

/// Records how many calls overlap, per resource and overall
#[derive(Debug, Default)]
pub struct ConcurrencyTracker {
    inner: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    per_resource: HashMap<ResourceId, (usize, usize)>,
    current: usize,
    peak: usize,
}

impl ConcurrencyTracker {
    pub fn enter(self: &Arc<Self>, resource_id: &ResourceId) -> InFlight {
        let mut state = self.inner.lock();
        let entry = state.per_resource.entry(resource_id.clone()).or_default();
        entry.0 += 1;
        entry.1 = entry.1.max(entry.0);
        state.current += 1;
        state.peak = state.peak.max(state.current);
        InFlight {
            tracker: Arc::clone(self),
            resource_id: resource_id.clone(),
        }
    }

    /// Most calls ever in flight at once for `resource_id`
    pub fn peak_for(&self, resource_id: &ResourceId) -> usize {
        self.inner
            .lock()
            .per_resource
            .get(resource_id)
            .map_or(0, |(_, peak)| *peak)
    }

    /// Most calls ever in flight at once across all resources
    pub fn peak(&self) -> usize {
        self.inner.lock().peak
    }
}

/// Guard held while a call runs; also released when the call is aborted
#[derive(Debug)]
pub struct InFlight {
    tracker: Arc<ConcurrencyTracker>,
    resource_id: ResourceId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut state = self.tracker.inner.lock();
        if let Some(entry) = state.per_resource.get_mut(&self.resource_id) {
            entry.0 -= 1;
        }
        state.current -= 1;
    }
}

/// Executor that plays back a script of outcomes
///
/// Calls past the end of the script use the fallback step.
#[derive(Debug)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    latency: Duration,
    calls: Mutex<Vec<EditRequest>>,
    tracker: Arc<ConcurrencyTracker>,
}

impl ScriptedExecutor {
    /// Succeeds on every call
    pub fn succeeding() -> Self {
        Self::with_fallback(Step::Succeed)
    }

    /// Fails on every call
    pub fn failing(message: &str) -> Self {
        Self::with_fallback(Step::Fail(ExecutorError::Provider(message.to_string())))
    }

    pub fn with_fallback(fallback: Step) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            tracker: Arc::new(ConcurrencyTracker::default()),
        }
    }

    /// Steps for the next calls, in order
    #[must_use]
    pub fn scripted(self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script.lock().extend(steps);
        self
    }

    /// Sleep this long inside every call
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Requests received so far, in call order
    pub fn calls(&self) -> Vec<EditRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn tracker(&self) -> &ConcurrencyTracker {
        &self.tracker
    }

    /// Locator this executor returns for `request`
    pub fn locator_for(request: &EditRequest) -> ResourceLocator {
        ResourceLocator::named(format!(
            "{}~{}@v{}",
            request.input_locator,
            request.kind,
            request.input_version + 1
        ))
    }
}

#[async_trait::async_trait]
impl EditExecutor for ScriptedExecutor {
    async fn execute(&self, request: &EditRequest) -> Result<ResourceLocator, ExecutorError> {
        let _in_flight = self.tracker.enter(&request.resource_id);
        self.calls.lock().push(request.clone());
        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match step {
            Step::Succeed => Ok(Self::locator_for(request)),
            Step::Fail(e) => Err(e),
            Step::Hang => std::future::pending().await,
        }
    }
}

/// Ledger with the given starting grant
pub fn ledger(starting_grant: u64) -> Arc<CreditLedger> {
    Arc::new(CreditLedger::new(
        LedgerConfig::default().with_starting_grant(starting_grant),
    ))
}

/// In-memory ledger store whose writes fail for a window of calls
///
/// Writes `skip..skip + failures` (zero-based) return `LedgerError::Storage`
/// without touching the account.
#[derive(Debug, Default)]
pub struct FlakyLedgerStore {
    inner: InMemoryLedgerStore,
    updates: AtomicUsize,
    skip: usize,
    failures: usize,
}

impl FlakyLedgerStore {
    pub fn failing_after(skip: usize, failures: usize) -> Self {
        Self {
            skip,
            failures,
            ..Self::default()
        }
    }

    /// Writes attempted so far, failed ones included
    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

impl LedgerStore for FlakyLedgerStore {
    fn get(&self, account_id: &AccountId) -> Result<Option<Account>, LedgerError> {
        self.inner.get(account_id)
    }

    fn insert_if_absent(
        &self,
        account: Account,
        opening: Option<Transaction>,
    ) -> Result<Account, LedgerError> {
        self.inner.insert_if_absent(account, opening)
    }

    fn update(
        &self,
        account_id: &AccountId,
        mutate: &mut AccountMutation<'_>,
    ) -> Result<Transaction, LedgerError> {
        let call = self.updates.fetch_add(1, Ordering::SeqCst);
        if (self.skip..self.skip + self.failures).contains(&call) {
            return Err(LedgerError::Storage(format!("write {call} unavailable")));
        }
        self.inner.update(account_id, mutate)
    }

    fn transactions(&self, account_id: &AccountId) -> Result<Vec<Transaction>, LedgerError> {
        self.inner.transactions(account_id)
    }
}

/// Ledger over `store` with a starting grant
pub fn ledger_on(store: Arc<dyn LedgerStore>, starting_grant: u64) -> Arc<CreditLedger> {
    Arc::new(CreditLedger::with_parts(
        LedgerConfig::default().with_starting_grant(starting_grant),
        store,
        Arc::new(SystemClock),
    ))
}

/// Queue with standard costs over `ledger` and `executor`
pub fn queue(
    config: QueueConfig,
    ledger: &Arc<CreditLedger>,
    executor: &Arc<ScriptedExecutor>,
) -> EditQueue {
    EditQueue::new(
        config,
        CostTable::default(),
        Arc::clone(ledger),
        Arc::clone(executor) as Arc<dyn EditExecutor>,
    )
}

/// Open `name` on `queue`, billed to `account`, starting at `<name>.jpg`
pub fn open_image(queue: &EditQueue, name: &str, account: &AccountId) -> ResourceId {
    let id = ResourceId::named(name);
    queue
        .open_resource(
            id.clone(),
            account.clone(),
            ResourceLocator::named(format!("{name}.jpg")),
        )
        .unwrap();
    id
}

/// Parameters from a JSON object literal
pub fn params(value: serde_json::Value) -> EditParameters {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("edit parameters must be an object, got {other}"),
    }
}
