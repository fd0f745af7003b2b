//! Correlation of engine output with outstanding requests.
//!
//! All bookkeeping lives in one [`RouterState`] behind a `std::sync::Mutex`.
//! Public entry points lock it, mutate it through `*_locked` helpers that
//! return deferred [`Effect`]s, release it, and only then run the effects.
//! Callbacks and channel sends therefore never run under the lock.
//!
//! Lines bound for stdin are queued on an unbounded channel while the lock is
//! held, so the wire order always matches the bookkeeping order. A dedicated
//! writer task drains that channel and performs the blocking writes.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::codec::{DecodedRecord, WireCodec};
use crate::error::{EngineError, EngineResult};
use crate::normalize;
use crate::reader::Dispatch;
use crate::supervisor::ProcessHandle;
use crate::types::{AnalysisQuery, AnalysisResult, RequestId};
use crate::{EngineCommand, Protocol};

pub type Callback = Box<dyn FnOnce(EngineResult<AnalysisResult>) + Send + 'static>;

/// Lifecycle of a request that has not resolved yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting for the line-protocol wire to free up.
    Queued,
    /// Handed to the writer task.
    Submitted,
    /// On the wire; results may arrive.
    AwaitingResult,
}

/// Where the final outcome of a request goes. Fulfilled at most once.
pub enum Completion {
    Ticket(oneshot::Sender<EngineResult<AnalysisResult>>),
    Callback(Callback),
}

impl Completion {
    fn fulfil(self, id: RequestId, outcome: EngineResult<AnalysisResult>) {
        match self {
            Self::Ticket(tx) => {
                // The caller may have dropped the ticket
                let _ = tx.send(outcome);
            }
            Self::Callback(callback) => {
                if catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
                    tracing::error!(id = %id, "Result callback panicked");
                }
            }
        }
    }
}

/// Lines for the writer task.
#[derive(Debug)]
pub struct WriteJob {
    pub lines: Vec<String>,
    /// Request to advance to `AwaitingResult` once written.
    pub written: Option<RequestId>,
}

struct PendingRequest {
    query: AnalysisQuery,
    lines: Vec<String>,
    completion: Completion,
    progress: Option<mpsc::UnboundedSender<AnalysisResult>>,
    issued: Instant,
    /// When the line-protocol analyze command was acknowledged.
    acked: Option<Instant>,
    state: RequestState,
    timer: Option<AbortHandle>,
}

enum Effect {
    Complete {
        id: RequestId,
        completion: Completion,
        outcome: EngineResult<AnalysisResult>,
    },
    Progress {
        tx: mpsc::UnboundedSender<AnalysisResult>,
        result: AnalysisResult,
    },
    AbortTimer(AbortHandle),
}

/// A GTP response the engine still owes us, one per written line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ack {
    Setup(RequestId),
    Analyze(RequestId),
    Stop,
    Command,
}

struct RouterState {
    pending: HashMap<RequestId, PendingRequest>,
    /// Line protocol: requests waiting for the wire, oldest first.
    queue: VecDeque<RequestId>,
    /// Line protocol: the request whose commands are on the wire.
    active: Option<RequestId>,
    /// Line protocol: the active request once its analyze command is acked.
    streaming: Option<RequestId>,
    acks: VecDeque<Ack>,
    writer: Option<mpsc::UnboundedSender<WriteJob>>,
    closed: bool,
}

pub struct Router {
    label: String,
    codec: Arc<dyn WireCodec>,
    protocol: Protocol,
    next_id: AtomicU64,
    state: Mutex<RouterState>,
}

impl Router {
    /// Create a router and the receiving end of its writer queue.
    pub fn new(
        label: impl Into<String>,
        codec: Arc<dyn WireCodec>,
    ) -> (Self, mpsc::UnboundedReceiver<WriteJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Self {
            label: label.into(),
            protocol: codec.protocol(),
            codec,
            next_id: AtomicU64::new(1),
            state: Mutex::new(RouterState {
                pending: HashMap::new(),
                queue: VecDeque::new(),
                active: None,
                streaming: None,
                acks: VecDeque::new(),
                writer: Some(tx),
                closed: false,
            }),
        };
        (router, rx)
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn state_of(&self, id: RequestId) -> Option<RequestState> {
        self.lock().pending.get(&id).map(|p| p.state)
    }

    /// Register a request and queue its commands. Encoding errors surface here.
    pub fn submit(
        &self,
        query: AnalysisQuery,
        completion: Completion,
        progress: Option<mpsc::UnboundedSender<AnalysisResult>>,
    ) -> EngineResult<RequestId> {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let lines = self.codec.encode(&EngineCommand::Analyze {
            id,
            query: query.clone(),
        })?;

        let effects = {
            let mut state = self.lock();
            self.submit_locked(&mut state, id, query, lines, completion, progress)?
        };
        tracing::debug!(engine = %self.label, id = %id, "Submitted analysis");
        run_effects(effects);
        Ok(id)
    }

    fn submit_locked(
        &self,
        state: &mut RouterState,
        id: RequestId,
        query: AnalysisQuery,
        lines: Vec<String>,
        completion: Completion,
        progress: Option<mpsc::UnboundedSender<AnalysisResult>>,
    ) -> EngineResult<Vec<Effect>> {
        if state.closed {
            return Err(EngineError::Stopped);
        }

        let mut request = PendingRequest {
            query,
            lines,
            completion,
            progress,
            issued: Instant::now(),
            acked: None,
            state: RequestState::Queued,
            timer: None,
        };

        let mut effects = Vec::new();
        match self.protocol {
            Protocol::Structured => {
                send(
                    state,
                    WriteJob {
                        lines: request.lines.clone(),
                        written: Some(id),
                    },
                )?;
                request.state = RequestState::Submitted;
                state.pending.insert(id, request);
            }
            Protocol::LineStream => {
                state.pending.insert(id, request);
                state.queue.push_back(id);
                self.issue_next_locked(state, &mut effects);
            }
        }
        Ok(effects)
    }

    /// Put the oldest queued request on the wire if the wire is free.
    fn issue_next_locked(&self, state: &mut RouterState, effects: &mut Vec<Effect>) {
        while state.active.is_none() {
            let Some(id) = state.queue.pop_front() else {
                return;
            };
            let Some(request) = state.pending.get_mut(&id) else {
                continue;
            };
            let lines = request.lines.clone();
            request.state = RequestState::Submitted;

            let setup = lines.len().saturating_sub(1);
            state.acks.extend((0..setup).map(|_| Ack::Setup(id)));
            state.acks.push_back(Ack::Analyze(id));
            state.active = Some(id);
            state.streaming = None;

            if let Err(e) = send(
                state,
                WriteJob {
                    lines,
                    written: Some(id),
                },
            ) {
                self.fail_all_locked(state, &e, effects);
            }
        }
    }

    /// The writer task finished writing a request's commands.
    pub fn mark_written(&self, id: RequestId) {
        let mut state = self.lock();
        if let Some(request) = state.pending.get_mut(&id) {
            if request.state == RequestState::Submitted {
                request.state = RequestState::AwaitingResult;
            }
        }
    }

    fn dispatch_locked(&self, state: &mut RouterState, record: DecodedRecord) -> Vec<Effect> {
        let mut effects = Vec::new();
        match self.protocol {
            Protocol::Structured => self.dispatch_structured(state, record, &mut effects),
            Protocol::LineStream => self.dispatch_line(state, record, &mut effects),
        }
        effects
    }

    fn dispatch_structured(
        &self,
        state: &mut RouterState,
        record: DecodedRecord,
        effects: &mut Vec<Effect>,
    ) {
        match record {
            DecodedRecord::Analysis { result, .. } => {
                let Some(id) = result.id else {
                    tracing::warn!(engine = %self.label, "Dropping result without id");
                    return;
                };
                if result.is_terminal {
                    match state.pending.remove(&id) {
                        Some(request) => resolve(id, request, Ok(result), effects),
                        None => {
                            tracing::debug!(engine = %self.label, id = %id, "Late result for a finished request")
                        }
                    }
                } else if let Some(request) = state.pending.get(&id) {
                    progress(request, result, effects);
                }
            }
            DecodedRecord::Rejected {
                id: Some(id),
                message,
            } => {
                tracing::warn!(engine = %self.label, id = %id, "Engine rejected query: {}", message);
                if let Some(request) = state.pending.remove(&id) {
                    resolve(id, request, Err(EngineError::Rejected(message)), effects);
                }
            }
            DecodedRecord::Rejected { id: None, message } => {
                tracing::warn!(engine = %self.label, "Engine error: {}", message);
            }
            DecodedRecord::Ack { action } => {
                tracing::debug!(engine = %self.label, "Engine acknowledged {}", action);
            }
            DecodedRecord::Response { .. } | DecodedRecord::Ignored => {}
        }
    }

    fn dispatch_line(
        &self,
        state: &mut RouterState,
        record: DecodedRecord,
        effects: &mut Vec<Effect>,
    ) {
        match record {
            DecodedRecord::Response { ok, text } => {
                let Some(ack) = state.acks.pop_front() else {
                    tracing::debug!(engine = %self.label, "Unexpected response: {}", text);
                    return;
                };
                match ack {
                    Ack::Setup(id) | Ack::Analyze(id) if !ok => {
                        tracing::warn!(engine = %self.label, id = %id, "Engine rejected command: {}", text);
                        if let Some(request) = state.pending.remove(&id) {
                            resolve(id, request, Err(EngineError::Rejected(text)), effects);
                        }
                        if state.active == Some(id) {
                            self.finish_active_locked(state, effects);
                        }
                    }
                    Ack::Analyze(id) => {
                        if state.active == Some(id) {
                            if let Some(request) = state.pending.get_mut(&id) {
                                request.acked = Some(Instant::now());
                                request.state = RequestState::AwaitingResult;
                                state.streaming = Some(id);
                            }
                        }
                    }
                    Ack::Setup(_) | Ack::Stop | Ack::Command => {
                        if !ok {
                            tracing::debug!(engine = %self.label, "Command failed: {}", text);
                        }
                    }
                }
            }
            DecodedRecord::Analysis { mut result, .. } => {
                // Output of a stopped query may still be in flight
                let id = match state.streaming {
                    Some(id) if state.acks.is_empty() && state.active == Some(id) => id,
                    _ => {
                        tracing::debug!(engine = %self.label, "Discarding analysis line with no streaming request");
                        return;
                    }
                };
                let Some(request) = state.pending.get(&id) else {
                    return;
                };
                result.id = Some(id);
                result.is_terminal = budget_reached(request, &result);

                if result.is_terminal {
                    if let Some(request) = state.pending.remove(&id) {
                        resolve(id, request, Ok(result), effects);
                    }
                    self.finish_active_locked(state, effects);
                } else {
                    progress(request, result, effects);
                }
            }
            DecodedRecord::Rejected { message, .. } => {
                tracing::warn!(engine = %self.label, "Engine error: {}", message);
            }
            DecodedRecord::Ack { .. } | DecodedRecord::Ignored => {}
        }
    }

    /// Interrupt the analysis on the wire and move on to the next request.
    fn finish_active_locked(&self, state: &mut RouterState, effects: &mut Vec<Effect>) {
        if state.active.take().is_none() {
            return;
        }
        state.streaming = None;
        self.send_stop_locked(state, None, effects);
        self.issue_next_locked(state, effects);
    }

    fn send_stop_locked(
        &self,
        state: &mut RouterState,
        id: Option<RequestId>,
        effects: &mut Vec<Effect>,
    ) {
        let lines = match self.codec.encode(&EngineCommand::Stop { id }) {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!(engine = %self.label, "Cannot encode stop: {}", e);
                return;
            }
        };
        if self.protocol == Protocol::LineStream {
            state.acks.extend(lines.iter().map(|_| Ack::Stop));
        }
        if let Err(e) = send(
            state,
            WriteJob {
                lines,
                written: None,
            },
        ) {
            self.fail_all_locked(state, &e, effects);
        }
    }

    /// Resolve one request with `Cancelled`. The engine is told to stop, best effort.
    pub fn cancel(&self, id: RequestId) -> EngineResult<()> {
        let effects = {
            let mut state = self.lock();
            self.abandon_locked(&mut state, id, EngineError::Cancelled)
                .ok_or(EngineError::UnknownRequest(id))?
        };
        tracing::debug!(engine = %self.label, id = %id, "Cancelled");
        run_effects(effects);
        Ok(())
    }

    /// Resolve every request with `Cancelled` and stop all searching.
    pub fn cancel_all(&self) {
        let effects = {
            let mut state = self.lock();
            let mut effects = Vec::new();
            let ids: Vec<RequestId> = state.pending.keys().copied().collect();
            for id in &ids {
                if let Some(request) = state.pending.remove(id) {
                    resolve(*id, request, Err(EngineError::Cancelled), &mut effects);
                }
            }
            state.queue.clear();
            match self.protocol {
                Protocol::Structured if !ids.is_empty() && !state.closed => {
                    self.send_stop_locked(&mut state, None, &mut effects)
                }
                Protocol::Structured => {}
                Protocol::LineStream => self.finish_active_locked(&mut state, &mut effects),
            }
            effects
        };
        tracing::debug!(engine = %self.label, "Cancelled all requests");
        run_effects(effects);
    }

    /// Resolve a request with `Timeout` if it is still pending.
    pub fn expire(&self, id: RequestId, after: Duration) {
        let effects = {
            let mut state = self.lock();
            self.abandon_locked(&mut state, id, EngineError::Timeout(after))
        };
        if let Some(effects) = effects {
            tracing::warn!(engine = %self.label, id = %id, "Request timed out after {:?}", after);
            run_effects(effects);
        }
    }

    fn abandon_locked(
        &self,
        state: &mut RouterState,
        id: RequestId,
        error: EngineError,
    ) -> Option<Vec<Effect>> {
        let request = state.pending.remove(&id)?;
        let was_queued = request.state == RequestState::Queued;
        let mut effects = Vec::new();
        resolve(id, request, Err(error), &mut effects);

        if state.closed {
            return Some(effects);
        }
        match self.protocol {
            Protocol::Structured => self.send_stop_locked(state, Some(id), &mut effects),
            Protocol::LineStream if was_queued => state.queue.retain(|queued| *queued != id),
            Protocol::LineStream => {
                if state.active == Some(id) {
                    self.finish_active_locked(state, &mut effects);
                }
            }
        }
        Some(effects)
    }

    /// Hand the timeout task to the request so it dies with it.
    pub fn attach_timer(&self, id: RequestId, timer: AbortHandle) {
        let mut state = self.lock();
        match state.pending.get_mut(&id) {
            Some(request) => request.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Send a non-analysis command. Line-protocol engines must be idle.
    pub fn send_raw(&self, command: &EngineCommand) -> EngineResult<()> {
        let lines = self.codec.encode(command)?;
        let mut state = self.lock();
        if state.closed {
            return Err(EngineError::Stopped);
        }
        if self.protocol == Protocol::LineStream {
            if state.active.is_some() || !state.queue.is_empty() {
                return Err(EngineError::Busy);
            }
            state.acks.extend(lines.iter().map(|_| Ack::Command));
        }
        tracing::debug!(engine = %self.label, "Sending {}", command.name());
        send(
            &mut state,
            WriteJob {
                lines,
                written: None,
            },
        )
    }

    /// The engine's stdin could not be written; nothing can succeed any more.
    pub fn write_failed(&self, error: EngineError) {
        let message = match error {
            EngineError::Write(message) => message,
            other => other.to_string(),
        };
        self.close(EngineError::Write(message));
    }

    /// Resolve everything with `Terminated` and refuse new work.
    pub fn shutdown(&self) {
        self.close(EngineError::Terminated);
    }

    fn close(&self, error: EngineError) {
        let effects = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            let mut effects = Vec::new();
            self.fail_all_locked(&mut state, &error, &mut effects);
            effects
        };
        run_effects(effects);
    }

    fn fail_all_locked(&self, state: &mut RouterState, error: &EngineError, effects: &mut Vec<Effect>) {
        state.closed = true;
        state.writer = None;
        state.queue.clear();
        state.acks.clear();
        state.active = None;
        state.streaming = None;

        let count = state.pending.len();
        for (id, request) in state.pending.drain() {
            resolve(id, request, Err(same_error(error)), effects);
        }
        if count > 0 {
            tracing::warn!(engine = %self.label, "Failed {} pending request(s): {}", count, error);
        }
    }
}

impl Dispatch for Router {
    fn dispatch(&self, record: DecodedRecord) {
        let effects = {
            let mut state = self.lock();
            self.dispatch_locked(&mut state, record)
        };
        run_effects(effects);
    }

    fn stream_closed(&self, reason: String) {
        self.close(EngineError::ProcessDied(reason));
    }
}

/// Drain the writer queue into the engine's stdin.
pub async fn run_writer(
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
    handle: Arc<ProcessHandle>,
    router: Arc<Router>,
) {
    while let Some(job) = jobs.recv().await {
        match handle.write_lines(&job.lines).await {
            Ok(()) => {
                if let Some(id) = job.written {
                    router.mark_written(id);
                }
            }
            Err(e) => {
                tracing::error!(engine = %router.label, "Write failed: {}", e);
                router.write_failed(e);
                break;
            }
        }
    }
    tracing::debug!(engine = %router.label, "Writer task exiting");
}

fn send(state: &mut RouterState, job: WriteJob) -> EngineResult<()> {
    let writer = state.writer.as_ref().ok_or(EngineError::Stopped)?;
    writer.send(job).map_err(|_| EngineError::Stopped)
}

fn resolve(
    id: RequestId,
    request: PendingRequest,
    outcome: EngineResult<AnalysisResult>,
    effects: &mut Vec<Effect>,
) {
    if let Some(timer) = request.timer {
        effects.push(Effect::AbortTimer(timer));
    }
    let outcome = outcome.map(|result| finish_result(result, &request.query));
    tracing::trace!(id = %id, elapsed = ?request.issued.elapsed(), ok = outcome.is_ok(), "Resolved");
    effects.push(Effect::Complete {
        id,
        completion: request.completion,
        outcome,
    });
}

fn progress(request: &PendingRequest, result: AnalysisResult, effects: &mut Vec<Effect>) {
    if let Some(tx) = &request.progress {
        effects.push(Effect::Progress {
            tx: tx.clone(),
            result: finish_result(result, &request.query),
        });
    }
}

/// Apply the per-request shaping options.
fn finish_result(mut result: AnalysisResult, query: &AnalysisQuery) -> AnalysisResult {
    if query.options.order_by_visits {
        normalize::order_by_visits(&mut result);
    }
    if let Some(max) = query.options.max_candidates {
        normalize::truncate(&mut result, max);
    }
    result
}

/// Streaming engines never say when they are done; the budget decides.
fn budget_reached(request: &PendingRequest, result: &AnalysisResult) -> bool {
    let options = &request.query.options;
    let visits = options
        .max_visits
        .is_some_and(|max| result.total_visits() >= u64::from(max));
    let time = match (options.max_time, request.acked) {
        (Some(max), Some(acked)) => acked.elapsed() >= max,
        _ => false,
    };
    visits || time
}

/// `EngineError` holds an `io::Error` in one variant so it is not `Clone`.
fn same_error(error: &EngineError) -> EngineError {
    match error {
        EngineError::ProcessDied(reason) => EngineError::ProcessDied(reason.clone()),
        EngineError::Write(reason) => EngineError::Write(reason.clone()),
        EngineError::Terminated => EngineError::Terminated,
        EngineError::Stopped => EngineError::Stopped,
        other => EngineError::ProcessDied(other.to_string()),
    }
}

fn run_effects(effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::Complete {
                id,
                completion,
                outcome,
            } => completion.fulfil(id, outcome),
            Effect::Progress { tx, result } => {
                let _ = tx.send(result);
            }
            Effect::AbortTimer(timer) => timer.abort(),
        }
    }
}
