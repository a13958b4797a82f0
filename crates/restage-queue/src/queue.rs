//! Per-resource edit queue
//!
//! Each open resource owns a lane: a FIFO of pending edits plus the current
//! image version. A lane has at most one worker task, spawned when the first
//! edit arrives and exiting as soon as the lane drains, so no two edits on
//! the same image are ever in flight together. Lanes for different images
//! run in parallel.
//!
//! Per edit, the worker runs deduct → execute (bounded by the timeout) →
//! commit the new version, or refund the charge if the executor failed.

use crate::error::QueueError;
use crate::executor::{EditExecutor, EditRequest};
use crate::kind::{CostTable, OperationKind};
use crate::operation::{
    EditEvent, EditOperation, EditOutcome, EditParameters, EditStatus, FailureReason,
    ResourceVersion,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use restage_ledger::{CreditLedger, GrantRequest, LedgerError, UsageMetadata};
use restage_types::{
    AccountId, Clock, OperationId, ResourceId, ResourceLocator, SystemClock, Timestamp,
    TransactionId,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

const REFUND_ATTEMPTS: u32 = 3;
const REFUND_BACKOFF: Duration = Duration::from_millis(5);

/// Queue configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Upper bound on one executor call, in milliseconds
    pub executor_timeout_ms: u64,
    /// Events buffered per subscriber before it starts lagging
    pub event_capacity: usize,
    /// Versions and finished operations kept per resource
    pub history_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            executor_timeout_ms: 60_000,
            event_capacity: 256,
            history_limit: 100,
        }
    }
}

impl QueueConfig {
    /// Default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With executor timeout
    #[inline]
    #[must_use]
    pub fn with_executor_timeout(mut self, timeout: Duration) -> Self {
        self.executor_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With event buffer size
    #[inline]
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// With history size
    #[inline]
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Executor timeout as a duration
    #[inline]
    #[must_use]
    pub fn executor_timeout(&self) -> Duration {
        Duration::from_millis(self.executor_timeout_ms)
    }
}

/// Read-only snapshot of one resource lane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub resource_id: ResourceId,
    pub account_id: AccountId,
    /// Edits waiting behind the one in flight
    pub depth: usize,
    /// Waiting edits in the order they will run
    pub pending: Vec<OperationId>,
    pub processing: Option<OperationId>,
    pub current_locator: ResourceLocator,
    pub version: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStatus {
    /// Nothing waiting or running
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.depth == 0 && self.processing.is_none()
    }
}

/// Handle returned by `submit`
#[derive(Debug)]
pub struct OperationTicket {
    id: OperationId,
    resource_id: ResourceId,
    outcome: oneshot::Receiver<EditOutcome>,
}

impl OperationTicket {
    /// Id of the queued edit
    #[inline]
    #[must_use]
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Image the edit targets
    #[inline]
    #[must_use]
    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    /// Wait for the edit to finish
    ///
    /// Dropping the ticket instead does not cancel the edit.
    ///
    /// # Errors
    /// `QueueError::WorkerStopped` if the runtime went away first.
    pub async fn outcome(self) -> Result<EditOutcome, QueueError> {
        self.outcome
            .await
            .map_err(|_| QueueError::WorkerStopped(self.id))
    }
}

struct Queued {
    operation: EditOperation,
    reply: oneshot::Sender<EditOutcome>,
    cancelled: bool,
}

struct LaneState {
    pending: VecDeque<Queued>,
    processing: Option<EditOperation>,
    /// Never empty; the back is the current version
    versions: VecDeque<ResourceVersion>,
    finished: VecDeque<EditOperation>,
    worker_active: bool,
    completed: u64,
    failed: u64,
}

struct Lane {
    resource_id: ResourceId,
    account_id: AccountId,
    state: Mutex<LaneState>,
}

/// Work the worker took off the lane
enum Next {
    Run {
        operation: EditOperation,
        reply: oneshot::Sender<EditOutcome>,
        input: ResourceVersion,
    },
    Skip {
        operation: EditOperation,
        reply: oneshot::Sender<EditOutcome>,
    },
}

impl Lane {
    fn open(
        resource_id: ResourceId,
        account_id: AccountId,
        locator: ResourceLocator,
        now: Timestamp,
    ) -> Self {
        let origin = ResourceVersion {
            version: 0,
            locator,
            produced_by: None,
            created_at: now,
        };
        Self {
            resource_id,
            account_id,
            state: Mutex::new(LaneState {
                pending: VecDeque::new(),
                processing: None,
                versions: VecDeque::from([origin]),
                finished: VecDeque::new(),
                worker_active: false,
                completed: 0,
                failed: 0,
            }),
        }
    }

    /// Pop the next edit, or retire the worker if the lane is empty
    ///
    /// Runs under the same lock `enqueue` takes, so an edit is never left
    /// behind without a worker.
    fn next(&self) -> Option<Next> {
        let mut state = self.state.lock();
        let Some(queued) = state.pending.pop_front() else {
            state.worker_active = false;
            return None;
        };

        let Queued {
            mut operation,
            reply,
            cancelled,
        } = queued;

        if cancelled {
            return Some(Next::Skip { operation, reply });
        }

        if let Err(e) = operation.transition(EditStatus::Processing) {
            tracing::error!(operation = %operation.id, "cannot start edit: {e}");
            return Some(Next::Skip { operation, reply });
        }
        state.processing = Some(operation.clone());
        let input = state.current().clone();
        Some(Next::Run {
            operation,
            reply,
            input,
        })
    }

    /// Queue an edit; returns true if a worker must be spawned
    fn enqueue(&self, operation: EditOperation, reply: oneshot::Sender<EditOutcome>) -> bool {
        let mut state = self.state.lock();
        state.pending.push_back(Queued {
            operation,
            reply,
            cancelled: false,
        });
        !std::mem::replace(&mut state.worker_active, true)
    }

    fn mark_charged(&self, operation_id: OperationId, cost: u64) {
        let mut state = self.state.lock();
        if let Some(op) = state.processing.as_mut().filter(|op| op.id == operation_id) {
            op.credits_charged = cost;
        }
    }

    /// Advance the version chain; returns the new version number
    fn commit(
        &self,
        operation_id: OperationId,
        locator: ResourceLocator,
        now: Timestamp,
        history_limit: usize,
    ) -> u64 {
        let mut state = self.state.lock();
        let version = state.current().version + 1;
        state.versions.push_back(ResourceVersion {
            version,
            locator,
            produced_by: Some(operation_id),
            created_at: now,
        });
        while state.versions.len() > history_limit.max(1) {
            state.versions.pop_front();
        }
        version
    }

    fn finish(
        &self,
        mut operation: EditOperation,
        outcome: &EditOutcome,
        now: Timestamp,
        history_limit: usize,
    ) {
        let mut state = self.state.lock();
        let charged = match state.processing.take() {
            Some(running) if running.id == operation.id => running.credits_charged,
            other => {
                state.processing = other;
                0
            }
        };

        let to = match outcome {
            EditOutcome::Completed {
                result_locator,
                credits_charged,
                ..
            } => {
                operation.result_locator = Some(result_locator.clone());
                operation.credits_charged = *credits_charged;
                state.completed += 1;
                EditStatus::Completed
            }
            EditOutcome::Failed {
                reason, refunded, ..
            } => {
                operation.failure = Some(reason.clone());
                operation.credits_charged = charged.saturating_sub(*refunded);
                state.failed += 1;
                EditStatus::Failed
            }
        };
        if let Err(e) = operation.transition(to) {
            tracing::error!(operation = %operation.id, "cannot finish edit: {e}");
        }
        operation.finished_at = Some(now);

        state.finished.push_back(operation);
        while state.finished.len() > history_limit {
            state.finished.pop_front();
        }
    }

    fn status(&self) -> QueueStatus {
        let state = self.state.lock();
        let pending: Vec<_> = state
            .pending
            .iter()
            .filter(|q| !q.cancelled)
            .map(|q| q.operation.id)
            .collect();
        let current = state.current();
        QueueStatus {
            resource_id: self.resource_id.clone(),
            account_id: self.account_id.clone(),
            depth: pending.len(),
            pending,
            processing: state.processing.as_ref().map(|op| op.id),
            current_locator: current.locator.clone(),
            version: current.version,
            completed: state.completed,
            failed: state.failed,
        }
    }

    /// Flag pending edits as cancelled; returns how many were flagged
    fn cancel_where(&self, mut pred: impl FnMut(&EditOperation) -> bool) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;
        for queued in state.pending.iter_mut().filter(|q| !q.cancelled) {
            if pred(&queued.operation) {
                queued.cancelled = true;
                count += 1;
            }
        }
        count
    }
}

impl LaneState {
    fn current(&self) -> &ResourceVersion {
        // `versions` is created non-empty and trimming keeps at least one
        &self.versions[self.versions.len() - 1]
    }
}

struct Shared {
    config: QueueConfig,
    costs: CostTable,
    ledger: Arc<CreditLedger>,
    executor: Arc<dyn EditExecutor>,
    clock: Arc<dyn Clock>,
    lanes: DashMap<ResourceId, Arc<Lane>>,
    events: broadcast::Sender<EditEvent>,
}

/// Serialised, metered edit execution per image
///
/// Cloning is cheap; clones share lanes and subscribers.
#[derive(Clone)]
pub struct EditQueue {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EditQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditQueue")
            .field("config", &self.shared.config)
            .field("resources", &self.shared.lanes.len())
            .finish_non_exhaustive()
    }
}

impl EditQueue {
    /// Queue on the system clock
    #[must_use]
    pub fn new(
        config: QueueConfig,
        costs: CostTable,
        ledger: Arc<CreditLedger>,
        executor: Arc<dyn EditExecutor>,
    ) -> Self {
        Self::with_parts(config, costs, ledger, executor, Arc::new(SystemClock))
    }

    /// Queue on a specific clock
    #[must_use]
    pub fn with_parts(
        config: QueueConfig,
        costs: CostTable,
        ledger: Arc<CreditLedger>,
        executor: Arc<dyn EditExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                costs,
                ledger,
                executor,
                clock,
                lanes: DashMap::new(),
                events,
            }),
        }
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Credits charged per edit kind
    #[inline]
    #[must_use]
    pub fn cost_table(&self) -> &CostTable {
        &self.shared.costs
    }

    /// Register an image and the account that pays for its edits
    ///
    /// Opening an already open resource with the same account is a no-op
    /// and keeps its version chain.
    ///
    /// # Errors
    /// `QueueError::AccountMismatch` if the resource is billed to another
    /// account.
    pub fn open_resource(
        &self,
        resource_id: ResourceId,
        account_id: AccountId,
        initial_locator: ResourceLocator,
    ) -> Result<QueueStatus, QueueError> {
        let now = self.shared.clock.now();
        let lane = self
            .shared
            .lanes
            .entry(resource_id.clone())
            .or_insert_with(|| {
                tracing::info!(resource = %resource_id, account = %account_id, "resource opened");
                Arc::new(Lane::open(
                    resource_id.clone(),
                    account_id.clone(),
                    initial_locator,
                    now,
                ))
            })
            .clone();

        if lane.account_id != account_id {
            return Err(QueueError::AccountMismatch {
                resource: resource_id,
                existing: lane.account_id.clone(),
                requested: account_id,
            });
        }
        Ok(lane.status())
    }

    /// Account billed for edits on `resource_id`
    ///
    /// # Errors
    /// `QueueError::UnknownResource` if it was never opened.
    pub fn account_of(&self, resource_id: &ResourceId) -> Result<AccountId, QueueError> {
        Ok(self.lane(resource_id)?.account_id.clone())
    }

    /// Enqueue an edit and return immediately
    ///
    /// Every call creates a new operation and, once it runs, a new charge;
    /// identical resubmissions are not merged.
    ///
    /// # Errors
    /// - `QueueError::UnknownResource` if the resource was never opened
    /// - `QueueError::MaskRequired` for a mask-only kind without a mask
    /// - `QueueError::NoRuntime` outside a tokio runtime
    pub fn submit(
        &self,
        resource_id: &ResourceId,
        kind: OperationKind,
        parameters: EditParameters,
        mask: Option<String>,
    ) -> Result<OperationTicket, QueueError> {
        if kind.requires_mask() && !mask.as_deref().is_some_and(|m| !m.trim().is_empty()) {
            return Err(QueueError::MaskRequired(kind));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| QueueError::NoRuntime)?;
        let lane = self.lane(resource_id)?;

        let operation = EditOperation::pending(
            resource_id.clone(),
            kind,
            parameters,
            mask,
            self.shared.clock.now(),
        );
        let id = operation.id;
        let (reply, outcome) = oneshot::channel();

        let spawn_worker = lane.enqueue(operation, reply);
        tracing::info!(resource = %resource_id, operation = %id, %kind, "edit queued");
        if spawn_worker {
            runtime.spawn(run_lane(Arc::clone(&self.shared), lane));
        }

        Ok(OperationTicket {
            id,
            resource_id: resource_id.clone(),
            outcome,
        })
    }

    /// [`submit`](Self::submit) with the kind given by name
    ///
    /// # Errors
    /// `QueueError::UnknownOperationKind` before anything is enqueued, plus
    /// everything `submit` returns.
    pub fn submit_named(
        &self,
        resource_id: &ResourceId,
        kind: &str,
        parameters: EditParameters,
        mask: Option<String>,
    ) -> Result<OperationTicket, QueueError> {
        let kind: OperationKind = kind.parse()?;
        self.submit(resource_id, kind, parameters, mask)
    }

    /// Withdraw one edit that has not started
    ///
    /// The edit fails with `Cancelled` when its turn comes, without being
    /// charged or dispatched, so observers still see outcomes in submission
    /// order.
    ///
    /// # Errors
    /// - `QueueError::UnknownResource`
    /// - `QueueError::NotPending` if it already started, finished or was
    ///   cancelled
    pub fn cancel(
        &self,
        resource_id: &ResourceId,
        operation_id: OperationId,
    ) -> Result<(), QueueError> {
        let lane = self.lane(resource_id)?;
        match lane.cancel_where(|op| op.id == operation_id) {
            0 => Err(QueueError::NotPending(operation_id)),
            _ => {
                tracing::info!(resource = %resource_id, operation = %operation_id, "edit cancelled");
                Ok(())
            }
        }
    }

    /// Withdraw every edit that has not started; the one in flight finishes
    ///
    /// # Errors
    /// `QueueError::UnknownResource`
    pub fn clear(&self, resource_id: &ResourceId) -> Result<usize, QueueError> {
        let cancelled = self.lane(resource_id)?.cancel_where(|_| true);
        if cancelled > 0 {
            tracing::info!(resource = %resource_id, cancelled, "queue cleared");
        }
        Ok(cancelled)
    }

    /// Depth, in-flight edit and current version of one resource
    ///
    /// # Errors
    /// `QueueError::UnknownResource`
    pub fn status(&self, resource_id: &ResourceId) -> Result<QueueStatus, QueueError> {
        Ok(self.lane(resource_id)?.status())
    }

    /// Retained version chain, oldest first
    ///
    /// # Errors
    /// `QueueError::UnknownResource`
    pub fn versions(&self, resource_id: &ResourceId) -> Result<Vec<ResourceVersion>, QueueError> {
        let lane = self.lane(resource_id)?;
        let state = lane.state.lock();
        Ok(state.versions.iter().cloned().collect())
    }

    /// Retained finished edits, then the one in flight, then the waiting ones
    ///
    /// # Errors
    /// `QueueError::UnknownResource`
    pub fn operations(&self, resource_id: &ResourceId) -> Result<Vec<EditOperation>, QueueError> {
        let lane = self.lane(resource_id)?;
        let state = lane.state.lock();
        Ok(state
            .finished
            .iter()
            .chain(state.processing.iter())
            .chain(state.pending.iter().filter(|q| !q.cancelled).map(|q| &q.operation))
            .cloned()
            .collect())
    }

    /// Open resources
    #[must_use]
    pub fn resources(&self) -> Vec<ResourceId> {
        let mut ids: Vec<_> = self.shared.lanes.iter().map(|l| l.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Receive every event published from now on
    ///
    /// A subscriber more than `event_capacity` events behind skips ahead and
    /// sees `RecvError::Lagged`.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EditEvent> {
        self.shared.events.subscribe()
    }

    fn lane(&self, resource_id: &ResourceId) -> Result<Arc<Lane>, QueueError> {
        self.shared
            .lanes
            .get(resource_id)
            .map(|lane| Arc::clone(lane.value()))
            .ok_or_else(|| QueueError::UnknownResource(resource_id.clone()))
    }
}

/// Drain one lane, then exit
async fn run_lane(shared: Arc<Shared>, lane: Arc<Lane>) {
    tracing::debug!(resource = %lane.resource_id, "worker started");
    while let Some(next) = lane.next() {
        let (operation, reply, outcome) = match next {
            Next::Run {
                operation,
                reply,
                input,
            } => {
                shared.publish(EditEvent::Started {
                    operation_id: operation.id,
                    resource_id: lane.resource_id.clone(),
                    kind: operation.kind,
                });
                let outcome = shared.process(&lane, &operation, &input).await;
                (operation, reply, outcome)
            }
            Next::Skip { operation, reply } => {
                let outcome = EditOutcome::Failed {
                    operation_id: operation.id,
                    reason: FailureReason::Cancelled,
                    refunded: 0,
                    refund_owed: 0,
                };
                (operation, reply, outcome)
            }
        };

        lane.finish(
            operation,
            &outcome,
            shared.clock.now(),
            shared.config.history_limit,
        );
        shared.publish(EditEvent::terminal(lane.resource_id.clone(), &outcome));
        // The submitter may have dropped its ticket
        let _ = reply.send(outcome);
    }
    tracing::debug!(resource = %lane.resource_id, "worker idle, exiting");
}

impl Shared {
    fn publish(&self, event: EditEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn process(
        &self,
        lane: &Lane,
        operation: &EditOperation,
        input: &ResourceVersion,
    ) -> EditOutcome {
        let cost = self.costs.cost_of(operation.kind);
        let usage = match self.charge(lane, operation, cost) {
            Ok(usage) => usage,
            Err(reason) => {
                return EditOutcome::Failed {
                    operation_id: operation.id,
                    reason,
                    refunded: 0,
                    refund_owed: 0,
                }
            }
        };
        lane.mark_charged(operation.id, cost);

        let request = EditRequest {
            operation_id: operation.id,
            resource_id: operation.resource_id.clone(),
            kind: operation.kind,
            parameters: operation.parameters.clone(),
            mask: operation.mask.clone(),
            input_locator: input.locator.clone(),
            input_version: input.version,
        };

        match self.dispatch(request).await {
            Ok(locator) => {
                let version = lane.commit(
                    operation.id,
                    locator.clone(),
                    self.clock.now(),
                    self.config.history_limit,
                );
                tracing::info!(
                    resource = %lane.resource_id,
                    operation = %operation.id,
                    version,
                    cost,
                    "edit completed"
                );
                EditOutcome::Completed {
                    operation_id: operation.id,
                    result_locator: locator,
                    credits_charged: cost,
                    version,
                }
            }
            Err(reason) => {
                tracing::warn!(
                    resource = %lane.resource_id,
                    operation = %operation.id,
                    "edit failed: {reason}"
                );
                let refunded = match usage {
                    Some(usage) => self.refund(lane, operation, cost, usage).await,
                    None => 0,
                };
                EditOutcome::Failed {
                    operation_id: operation.id,
                    reason,
                    refunded,
                    refund_owed: if usage.is_some() { cost - refunded } else { 0 },
                }
            }
        }
    }

    /// Deduct the edit's cost; `None` for a free edit
    fn charge(
        &self,
        lane: &Lane,
        operation: &EditOperation,
        cost: u64,
    ) -> Result<Option<TransactionId>, FailureReason> {
        if cost == 0 {
            return Ok(None);
        }
        let metadata = UsageMetadata::new(operation.kind.as_str())
            .with_resource(operation.resource_id.clone())
            .with_description(format!("{} edit {}", operation.kind, operation.id));

        match self.ledger.deduct(&lane.account_id, cost, metadata) {
            Ok(txn) => Ok(Some(txn.id)),
            Err(LedgerError::InsufficientCredits {
                required,
                remaining,
            }) => Err(FailureReason::InsufficientCredits {
                required,
                remaining,
            }),
            Err(e) => Err(FailureReason::Ledger {
                message: e.to_string(),
            }),
        }
    }

    /// Run the executor in its own task, bounded by the timeout
    async fn dispatch(&self, request: EditRequest) -> Result<ResourceLocator, FailureReason> {
        let executor = Arc::clone(&self.executor);
        let mut call = tokio::spawn(async move { executor.execute(&request).await });

        match tokio::time::timeout(self.config.executor_timeout(), &mut call).await {
            Ok(Ok(Ok(locator))) => Ok(locator),
            Ok(Ok(Err(e))) => Err(FailureReason::Executor {
                message: e.to_string(),
            }),
            Ok(Err(join)) => Err(FailureReason::Executor {
                message: format!("executor task aborted: {join}"),
            }),
            Err(_) => {
                call.abort();
                Err(FailureReason::Timeout {
                    after_ms: self.config.executor_timeout_ms,
                })
            }
        }
    }

    /// Reverse the usage entry; returns the credits given back
    ///
    /// Storage failures are retried with a short backoff. Anything else, or
    /// running out of attempts, leaves the credits owed and logged.
    async fn refund(
        &self,
        lane: &Lane,
        operation: &EditOperation,
        cost: u64,
        usage: TransactionId,
    ) -> u64 {
        let request = GrantRequest::refund(
            cost,
            format!("refund for failed {} edit {}", operation.kind, operation.id),
        )
        .reversing(usage)
        .with_resource(operation.resource_id.clone());

        for attempt in 1..=REFUND_ATTEMPTS {
            match self.ledger.grant(&lane.account_id, request.clone()) {
                Ok(_) => return cost,
                Err(LedgerError::Storage(e)) if attempt < REFUND_ATTEMPTS => {
                    tracing::warn!(
                        account = %lane.account_id,
                        operation = %operation.id,
                        attempt,
                        "refund not recorded, retrying: {e}"
                    );
                    tokio::time::sleep(REFUND_BACKOFF * attempt).await;
                }
                Err(e) => {
                    tracing::error!(
                        account = %lane.account_id,
                        operation = %operation.id,
                        %usage,
                        cost,
                        "refund failed, credits owed: {e}"
                    );
                    break;
                }
            }
        }
        0
    }
}
