//! Admission of client operations and their execution on the worker pool.
//!
//! Per connection, `submit` decides whether an operation goes straight to the
//! work queue or waits in the connection's held queue behind a bind:
//!
//! - Abandon is never held and never refused for capacity.
//! - While a bind is negotiating, everything except the awaited continuation
//!   is held.
//! - A bind with no negotiation running starts one.
//! - Anything else is queued.
//!
//! When a bind reaches a terminal outcome the worker running it publishes the
//! new `AuthState`, delivers the bind result, and moves the whole held queue
//! into the work queue, all under the connection's state lock. No other
//! operation from that connection can reach the work queue in between, and
//! released operations snapshot the post-bind `AuthState` when dequeued.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ldapd_core::{
    AbandonRequest, AuthState, BindPhase, BindRequest, LdapResult, MessageId, Operation,
    Request, ResultCode,
};

use crate::config::{validate_worker_threads, FailedBindPolicy, ServerConfig};
use crate::connection::{BindSession, Connection, ConnectionRegistry, ConnectionState};
use crate::context::ServerContext;
use crate::error::{BackendError, ServerError};
use crate::lifecycle::{HealthState, InFlightGuard, Lifecycle};
use crate::pool::{WorkHandler, WorkerPool};
use crate::queue::WorkQueue;
use crate::sasl::{BindContext, BindOutcome, BindStateMachine};

/// What `submit` did with an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Placed on the work queue.
    Queued,
    /// Waiting behind an in-progress bind.
    Held,
    /// Refused. The result carrying this code has already been delivered.
    Rejected(ResultCode),
}

/// An admitted operation and the connection it belongs to.
#[derive(Debug, Clone)]
pub(crate) struct WorkItem {
    pub operation: Arc<Operation>,
    pub connection: Arc<Connection>,
}

impl WorkItem {
    fn new(operation: Arc<Operation>, connection: &Arc<Connection>) -> Self {
        Self {
            operation,
            connection: Arc::clone(connection),
        }
    }
}

/// A dequeued item with the connection's identity as of the dequeue.
#[derive(Debug)]
pub(crate) struct ClaimedWork {
    item: WorkItem,
    auth: Arc<AuthState>,
    _in_flight: InFlightGuard,
}

/// Entry point for the protocol layer.
#[derive(Debug)]
pub struct AdmissionDispatcher {
    core: Arc<DispatchCore>,
    pool: WorkerPool<DispatchCore>,
}

impl AdmissionDispatcher {
    /// Validates the configuration and starts the worker pool.
    ///
    /// # Errors
    ///
    /// `ServerError::Config` for an invalid configuration or an enabled
    /// mechanism with no factory; `ServerError::Spawn` if a worker thread
    /// cannot be created.
    pub fn start(context: ServerContext) -> Result<Self, ServerError> {
        let config = context.config();
        config.validate()?;
        context.mechanisms().validate(&config.sasl)?;

        let queue = Arc::new(WorkQueue::new(config.admission));
        let core = Arc::new(DispatchCore {
            context,
            queue: Arc::clone(&queue),
            connections: ConnectionRegistry::new(),
            lifecycle: Lifecycle::new(),
        });
        let pool = WorkerPool::start(queue, Arc::clone(&core), config.worker_threads as usize)?;
        core.lifecycle.set_ready();
        tracing::info!(
            workers = config.worker_threads,
            admission = ?config.admission,
            mechanisms = ?config.sasl.enabled_mechanisms,
            "admission dispatcher started"
        );
        Ok(Self { core, pool })
    }

    /// Registers a new anonymous connection. Results for it arrive on the
    /// returned receiver.
    pub fn open_connection(
        &self,
        peer_address: impl Into<String>,
    ) -> (Arc<Connection>, tokio::sync::mpsc::UnboundedReceiver<LdapResult>) {
        let (connection, results) = self.core.connections.register(peer_address);
        tracing::debug!(connection_id = %connection.id(), peer = connection.peer_address(), "connection opened");
        (connection, results)
    }

    /// Admits one operation. Safe to call from many threads at once.
    ///
    /// Every operation eventually gets exactly one result on the
    /// connection's channel, including rejected ones.
    pub fn submit(
        &self,
        connection: &Arc<Connection>,
        message_id: MessageId,
        request: Request,
    ) -> Admission {
        self.core.submit(connection, message_id, request)
    }

    /// Closes a connection. Held operations complete as canceled now;
    /// queued and running ones are flagged and complete as canceled.
    ///
    /// Returns `false` if the connection was not registered.
    pub fn disconnect(&self, connection: &Connection) -> bool {
        self.core.disconnect(connection)
    }

    /// Applies a new configuration. Worker count and admission policy take
    /// effect immediately.
    ///
    /// # Errors
    ///
    /// Rejects an invalid configuration and keeps the current one. A spawn
    /// failure while growing the pool is also reported; the configuration is
    /// then stored with the worker count actually reached.
    pub fn reconfigure(&self, config: ServerConfig) -> Result<(), ServerError> {
        config.validate()?;
        self.core.context.mechanisms().validate(&config.sasl)?;

        self.core.queue.set_policy(config.admission);
        let resized = self.pool.resize(config.worker_threads as usize);
        let mut stored = config;
        if resized.is_err() {
            stored.worker_threads = u32::try_from(self.pool.target()).unwrap_or(stored.worker_threads);
        }
        self.core.context.store_config(stored);
        tracing::info!(workers = self.pool.target(), "configuration applied");
        resized
    }

    /// Changes only the worker thread target.
    ///
    /// # Errors
    ///
    /// `ConfigError::WorkerThreads` outside `1..=2^31-1`, leaving the pool
    /// untouched; `ServerError::Spawn` if growth fails part way.
    pub fn set_worker_threads(&self, count: u64) -> Result<(), ServerError> {
        let count = validate_worker_threads(count)?;
        let mut config = (*self.core.context.config()).clone();
        config.worker_threads = count;
        self.reconfigure(config)
    }

    /// Stops admissions, completes queued and held operations as
    /// unavailable, and waits up to `drain_timeout_ms` for running ones.
    ///
    /// Returns `true` if every worker exited in time.
    pub fn shutdown(&self) -> bool {
        if self.core.lifecycle.health_state() == HealthState::Stopped {
            return true;
        }
        let timeout = Duration::from_millis(self.core.context.config().drain_timeout_ms);
        let started = Instant::now();
        tracing::info!(
            in_flight = self.core.lifecycle.in_flight_count(),
            "admission dispatcher draining"
        );
        self.core.lifecycle.begin_drain();
        self.core.drain_queued();
        self.core.fail_all_held();

        let workers_done = self.pool.shutdown(timeout);
        let remaining = timeout.saturating_sub(started.elapsed());
        let drained = self.core.lifecycle.wait_for_drain(remaining);
        if workers_done && drained {
            tracing::info!(elapsed_ms = elapsed_ms(started), "admission dispatcher stopped");
        } else {
            tracing::warn!(
                in_flight = self.core.lifecycle.in_flight_count(),
                "shutdown timed out with operations still running"
            );
        }
        workers_done && drained
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        self.core.lifecycle.health_state()
    }

    /// Current worker target.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.pool.target()
    }

    /// Worker threads that have not yet exited.
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.pool.live()
    }

    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.core.queue.len()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.core.connections.count()
    }

    #[must_use]
    pub fn config(&self) -> Arc<ServerConfig> {
        self.core.context.config()
    }
}

impl Drop for AdmissionDispatcher {
    fn drop(&mut self) {
        if self.core.lifecycle.health_state() != HealthState::Stopped {
            self.core.lifecycle.begin_drain();
            self.core.drain_queued();
            self.core.fail_all_held();
        }
    }
}

/// State shared by `submit` callers and every worker.
#[derive(Debug)]
struct DispatchCore {
    context: ServerContext,
    queue: Arc<WorkQueue<WorkItem>>,
    connections: ConnectionRegistry,
    lifecycle: Lifecycle,
}

impl DispatchCore {
    fn submit(&self, conn: &Arc<Connection>, message_id: MessageId, request: Request) -> Admission {
        let op = Arc::new(Operation::new(conn.id(), message_id, request));
        let mut state = conn.state.lock();

        if state.closed || !self.lifecycle.is_accepting() {
            return self.reject(conn, &op, ResultCode::Unavailable, "server is not accepting operations");
        }
        if state.outstanding.contains_key(&message_id) {
            return self.reject(conn, &op, ResultCode::ProtocolError, "message id already in use");
        }

        let admission = match op.request() {
            Request::Abandon(abandon) => {
                let admission = self.enqueue_unbounded(conn, &op);
                if admission == Admission::Queued {
                    self.abandon_target(conn, &mut state, abandon.target);
                }
                admission
            }
            Request::Bind(bind) => match state.bind.as_mut() {
                Some(session)
                    if session.awaiting_continuation
                        && session.mechanism.eq_ignore_ascii_case(bind.mechanism()) =>
                {
                    let admission = self.enqueue(conn, &op);
                    if admission == Admission::Queued {
                        session.awaiting_continuation = false;
                    }
                    admission
                }
                Some(_) => Self::hold(&mut state, &op),
                None => {
                    let admission = self.enqueue(conn, &op);
                    if admission == Admission::Queued {
                        self.start_bind(conn, &mut state, bind.mechanism());
                    }
                    admission
                }
            },
            _ if state.bind.is_some() => Self::hold(&mut state, &op),
            _ => self.enqueue(conn, &op),
        };

        match admission {
            Admission::Queued | Admission::Held => {
                state.outstanding.insert(message_id, Arc::clone(&op));
                tracing::trace!(
                    connection_id = %conn.id(),
                    message_id = message_id.0,
                    kind = %op.kind(),
                    admission = ?admission,
                    "operation admitted"
                );
            }
            Admission::Rejected(_) => {}
        }
        admission
    }

    fn enqueue(&self, conn: &Arc<Connection>, op: &Arc<Operation>) -> Admission {
        match self.queue.try_push(WorkItem::new(Arc::clone(op), conn)) {
            Ok(()) => Admission::Queued,
            Err(err) => self.reject(conn, op, err.result_code(), &err.to_string()),
        }
    }

    /// Queues without the capacity check.
    fn enqueue_unbounded(&self, conn: &Arc<Connection>, op: &Arc<Operation>) -> Admission {
        match self.queue.push_batch(vec![WorkItem::new(Arc::clone(op), conn)]) {
            Ok(()) => Admission::Queued,
            Err(_) => self.reject(conn, op, ResultCode::Unavailable, "server is not accepting operations"),
        }
    }

    fn hold(state: &mut ConnectionState, op: &Arc<Operation>) -> Admission {
        state.held.push_back(Arc::clone(op));
        Admission::Held
    }

    fn reject(&self, conn: &Connection, op: &Operation, code: ResultCode, message: &str) -> Admission {
        metrics::counter!("ldapd_admission_rejected_total", "result" => code.name()).increment(1);
        tracing::debug!(
            connection_id = %conn.id(),
            message_id = op.message_id().0,
            kind = %op.kind(),
            result = code.name(),
            "operation rejected at admission"
        );
        op.complete(code);
        conn.deliver(LdapResult::new(op.message_id(), code).with_diagnostic(message));
        Admission::Rejected(code)
    }

    /// Opens a negotiation. Caller holds the connection lock.
    fn start_bind(&self, conn: &Connection, state: &mut ConnectionState, mechanism: &str) {
        let config = self.context.config();
        let machine = BindStateMachine::new(self.context.mechanisms().create(mechanism, &config.sasl));
        let previous = conn.auth();
        conn.publish_auth(previous.with_bind_in_progress(mechanism, BindPhase::Initial));
        state.bind = Some(BindSession {
            mechanism: mechanism.to_string(),
            machine: Some(machine),
            awaiting_continuation: false,
            previous,
        });
    }

    /// Identity after a failed or aborted bind.
    fn restored_auth(&self, previous: &AuthState) -> AuthState {
        match self.context.config().failed_bind {
            FailedBindPolicy::RetainPrevious => previous.settled(),
            FailedBindPolicy::ResetToAnonymous => AuthState::anonymous(),
        }
    }

    /// Moves the held queue to the work queue in arrival order. A held bind
    /// starts the next negotiation and ends the batch; what follows it stays
    /// held.
    fn release_held(&self, conn: &Arc<Connection>, state: &mut ConnectionState) {
        let mut batch = Vec::with_capacity(state.held.len());
        while let Some(op) = state.held.pop_front() {
            if let Request::Bind(bind) = op.request() {
                self.start_bind(conn, state, bind.mechanism());
                batch.push(WorkItem::new(op, conn));
                break;
            }
            batch.push(WorkItem::new(op, conn));
        }
        if batch.is_empty() {
            return;
        }
        let released = batch.len();
        if let Err(batch) = self.queue.push_batch(batch) {
            state.bind = None;
            for item in batch {
                self.finish_locked(&item.connection, state, &item.operation, unavailable(&item.operation));
            }
            self.fail_held(conn, state, ResultCode::Unavailable);
            return;
        }
        tracing::debug!(connection_id = %conn.id(), released, "held operations released");
    }

    /// Completes every held operation with `code` and drops any negotiation.
    fn fail_held(&self, conn: &Connection, state: &mut ConnectionState, code: ResultCode) {
        if let Some(session) = state.bind.take() {
            conn.publish_auth(session.previous.settled());
        }
        let held: Vec<Arc<Operation>> = state.held.drain(..).collect();
        for op in held {
            self.finish_locked(conn, state, &op, LdapResult::new(op.message_id(), code));
        }
    }

    /// Fails every held operation on every open connection as unavailable.
    fn fail_all_held(&self) {
        for connection in self.connections.all() {
            let mut state = connection.state.lock();
            self.fail_held(&connection, &mut state, ResultCode::Unavailable);
        }
    }

    /// Completes queued work that no worker will now run.
    fn drain_queued(&self) {
        for item in self.queue.close() {
            let mut state = item.connection.state.lock();
            if let Request::Bind(_) = item.operation.request() {
                if let Some(session) = state.bind.take() {
                    item.connection.publish_auth(session.previous.settled());
                }
            }
            self.finish_locked(
                &item.connection,
                &mut state,
                &item.operation,
                unavailable(&item.operation),
            );
        }
    }

    fn disconnect(&self, conn: &Connection) -> bool {
        if self.connections.remove(conn.id()).is_none() {
            return false;
        }
        let mut state = conn.state.lock();
        state.closed = true;
        let flagged = state
            .outstanding
            .values()
            .filter(|op| op.cancel())
            .count();
        self.fail_held(conn, &mut state, ResultCode::Canceled);
        tracing::debug!(connection_id = %conn.id(), flagged, "connection closed, outstanding operations canceled");
        true
    }

    /// Records and delivers a terminal result. Caller holds the connection
    /// lock. A second completion for the same operation is ignored.
    fn finish_locked(
        &self,
        conn: &Connection,
        state: &mut ConnectionState,
        op: &Arc<Operation>,
        mut result: LdapResult,
    ) {
        if op.is_cancelled()
            && result.code != ResultCode::Canceled
            && !matches!(op.request(), Request::Bind(_) | Request::Abandon(_))
        {
            result = LdapResult::new(op.message_id(), ResultCode::Canceled);
        }
        if !op.complete(result.code) {
            return;
        }
        if state
            .outstanding
            .get(&op.message_id())
            .is_some_and(|current| Arc::ptr_eq(current, op))
        {
            state.outstanding.remove(&op.message_id());
        }
        metrics::counter!(
            "ldapd_operations_total",
            "kind" => op.kind().as_str(),
            "result" => result.code.name()
        )
        .increment(1);
        conn.deliver(result);
    }

    fn finish(&self, conn: &Connection, op: &Arc<Operation>, result: LdapResult) {
        let mut state = conn.state.lock();
        self.finish_locked(conn, &mut state, op, result);
    }

    /// Runs one bind step. The terminal transition, result delivery, and
    /// held-queue release happen under one hold of the connection lock.
    fn run_bind(&self, work: &ClaimedWork, request: &BindRequest) -> LdapResult {
        let conn = &work.item.connection;
        let op = &work.item.operation;

        let machine = conn.state.lock().bind.as_mut().and_then(|s| s.machine.take());
        let Some(mut machine) = machine else {
            // The negotiation was torn down after this step was queued.
            return LdapResult::new(op.message_id(), ResultCode::Canceled);
        };

        let config = self.context.config();
        let ctx = BindContext {
            identities: self.context.identities(),
            sasl: &config.sasl,
        };
        let outcome = machine.step(&ctx, request);
        let mechanism = machine.mechanism_name().to_string();

        let mut state = conn.state.lock();
        if state.closed {
            return LdapResult::new(op.message_id(), ResultCode::Canceled);
        }
        let Some(session) = state.bind.as_mut() else {
            return LdapResult::new(op.message_id(), ResultCode::Canceled);
        };

        let result = match outcome {
            BindOutcome::Continue { challenge } => {
                conn.publish_auth(
                    session
                        .previous
                        .with_bind_in_progress(&session.mechanism, BindPhase::ChallengeIssued),
                );
                session.machine = Some(machine);
                let result = LdapResult::new(op.message_id(), ResultCode::SaslBindInProgress)
                    .with_sasl_credentials(challenge);
                self.finish_locked(conn, &mut state, op, result.clone());
                self.admit_pipelined_continuation(conn, &mut state);
                metrics::counter!("ldapd_bind_total", "mechanism" => mechanism, "outcome" => "continue")
                    .increment(1);
                return result;
            }
            BindOutcome::Success {
                identity,
                authorization,
                server_credentials,
            } => {
                state.bind = None;
                let auth = match identity {
                    Some(identity) => AuthState::authenticated(identity, authorization),
                    None => AuthState::anonymous(),
                };
                tracing::info!(
                    connection_id = %conn.id(),
                    mechanism = %mechanism,
                    identity = %auth,
                    "bind succeeded"
                );
                conn.publish_auth(auth);
                metrics::counter!("ldapd_bind_total", "mechanism" => mechanism, "outcome" => "success")
                    .increment(1);
                let mut result = LdapResult::success(op.message_id());
                if let Some(credentials) = server_credentials {
                    result = result.with_sasl_credentials(credentials);
                }
                result
            }
            BindOutcome::Failure(err) => {
                let previous = Arc::clone(&session.previous);
                state.bind = None;
                conn.publish_auth(self.restored_auth(&previous));
                tracing::debug!(
                    connection_id = %conn.id(),
                    mechanism = %mechanism,
                    outcome = err.outcome(),
                    error = ?err,
                    "bind failed"
                );
                metrics::counter!("ldapd_bind_total", "mechanism" => mechanism, "outcome" => err.outcome())
                    .increment(1);
                LdapResult::new(op.message_id(), err.result_code()).with_diagnostic(err.to_string())
            }
        };

        self.finish_locked(conn, &mut state, op, result.clone());
        self.release_held(conn, &mut state);
        result
    }

    /// A continuation that arrived before its challenge was issued is held;
    /// admit it now that the negotiation is waiting for it.
    fn admit_pipelined_continuation(&self, conn: &Arc<Connection>, state: &mut ConnectionState) {
        let Some(session) = state.bind.as_mut() else {
            return;
        };
        // Only the first held bind may continue; later ones belong to a new negotiation.
        let continuation = state
            .held
            .iter()
            .position(|op| matches!(op.request(), Request::Bind(_)))
            .filter(|&index| match state.held[index].request() {
                Request::Bind(bind) => bind.mechanism().eq_ignore_ascii_case(&session.mechanism),
                _ => false,
            });
        let Some(op) = continuation.and_then(|index| state.held.remove(index)) else {
            session.awaiting_continuation = true;
            return;
        };
        if let Err(items) = self.queue.push_batch(vec![WorkItem::new(op, conn)]) {
            for item in items {
                self.finish_locked(conn, state, &item.operation, unavailable(&item.operation));
            }
            self.fail_held(conn, state, ResultCode::Unavailable);
        }
    }

    /// Tears down a negotiation whose step panicked outside the mechanism.
    fn abort_bind(&self, conn: &Arc<Connection>, op: &Arc<Operation>, result: LdapResult) {
        let mut state = conn.state.lock();
        if let Some(session) = state.bind.take() {
            conn.publish_auth(self.restored_auth(&session.previous));
        }
        self.finish_locked(conn, &mut state, op, result);
        if !state.closed {
            self.release_held(conn, &mut state);
        }
    }

    fn run_abandon(&self, work: &ClaimedWork, request: &AbandonRequest) -> LdapResult {
        tracing::debug!(
            connection_id = %work.item.connection.id(),
            target = request.target.0,
            "abandon processed"
        );
        LdapResult::success(work.item.operation.message_id())
    }

    /// Cancels the abandon target at admission so it cannot start after this point.
    ///
    /// A held target completes as canceled at once. A queued or running
    /// target is flagged and reports canceled when its worker finishes.
    /// Binds and abandons are never canceled.
    fn abandon_target(&self, conn: &Arc<Connection>, state: &mut ConnectionState, target: MessageId) {
        let held_at = state.held.iter().position(|op| {
            op.message_id() == target && !matches!(op.request(), Request::Bind(_))
        });
        if let Some(op) = held_at.and_then(|index| state.held.remove(index)) {
            op.cancel();
            self.finish_locked(conn, state, &op, LdapResult::new(target, ResultCode::Canceled));
        } else if let Some(op) = state.outstanding.get(&target) {
            if !matches!(op.request(), Request::Bind(_) | Request::Abandon(_)) {
                op.cancel();
            }
        }
    }

    fn run_backend(&self, work: &ClaimedWork) -> LdapResult {
        let op = &work.item.operation;
        let span = tracing::info_span!(
            "operation",
            connection_id = %op.connection_id(),
            message_id = op.message_id().0,
            kind = %op.kind(),
            identity = %work.auth,
            duration_ms = tracing::field::Empty,
            result = tracing::field::Empty,
        );
        let _enter = span.enter();
        let started = Instant::now();

        let mut result = match self.context.backend().execute(op, &work.auth) {
            Ok(result) => result,
            Err(err) => {
                if let BackendError::Internal(source) = &err {
                    tracing::error!(error = ?source, "backend failed");
                }
                LdapResult::new(op.message_id(), err.result_code()).with_diagnostic(err.diagnostic())
            }
        };
        result.message_id = op.message_id();

        span.record("duration_ms", elapsed_ms(started));
        span.record("result", result.code.name());
        result
    }
}

impl WorkHandler for DispatchCore {
    type Item = WorkItem;
    type Job = ClaimedWork;
    type Output = LdapResult;

    fn claim(&self, item: WorkItem) -> ClaimedWork {
        ClaimedWork {
            auth: item.connection.auth(),
            item,
            _in_flight: self.lifecycle.in_flight_guard(),
        }
    }

    fn run(&self, work: &ClaimedWork) -> LdapResult {
        let op = &work.item.operation;
        match op.request() {
            Request::Bind(request) => self.run_bind(work, request),
            Request::Abandon(request) => self.run_abandon(work, request),
            _ if op.is_cancelled() => LdapResult::new(op.message_id(), ResultCode::Canceled),
            _ => self.run_backend(work),
        }
    }

    fn complete(&self, work: ClaimedWork, outcome: Result<LdapResult, String>) {
        let ClaimedWork { item, .. } = work;
        match outcome {
            Ok(result) => self.finish(&item.connection, &item.operation, result),
            Err(_) => {
                let result = LdapResult::new(item.operation.message_id(), ResultCode::OperationsError)
                    .with_diagnostic("internal server error");
                if matches!(item.operation.request(), Request::Bind(_)) {
                    self.abort_bind(&item.connection, &item.operation, result);
                } else {
                    self.finish(&item.connection, &item.operation, result);
                }
            }
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn unavailable(op: &Operation) -> LdapResult {
    LdapResult::new(op.message_id(), ResultCode::Unavailable)
        .with_diagnostic("server is shutting down")
}
