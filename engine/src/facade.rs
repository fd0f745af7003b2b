//! The public handle on one engine process.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{codec_for, WireCodec};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::router::{run_writer, Completion, RequestState, Router};
use crate::supervisor::{ProcessHandle, ProcessStatus, ProcessSupervisor};
use crate::types::{AnalysisQuery, AnalysisResult, RequestId};
use crate::EngineCommand;

/// Everything tied to one launched process.
struct Session {
    router: Arc<Router>,
    process: Arc<ProcessHandle>,
    writer: Option<JoinHandle<()>>,
    runtime: Handle,
}

/// A long-lived analysis engine.
///
/// Requests may be submitted from any task or thread once [`Engine::start`]
/// has returned. JSON engines answer concurrently and out of order; GTP
/// engines are fed one query at a time, oldest first.
pub struct Engine {
    config: EngineConfig,
    codec: Arc<dyn WireCodec>,
    supervisor: ProcessSupervisor,
    session: Mutex<Option<Session>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let codec = codec_for(config.family);
        Self {
            supervisor: ProcessSupervisor::new(config.label.clone()),
            config,
            codec,
            session: Mutex::new(None),
        }
    }

    /// Create and start an engine in one step.
    pub async fn spawn(config: EngineConfig) -> EngineResult<Self> {
        let engine = Self::new(config);
        engine.start().await?;
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn router(&self) -> EngineResult<(Arc<Router>, Handle)> {
        self.lock_session()
            .as_ref()
            .map(|s| (s.router.clone(), s.runtime.clone()))
            .ok_or(EngineError::NotStarted)
    }

    /// Launch the engine process and its reader and writer tasks.
    #[tracing::instrument(level = "info", skip(self), fields(engine = %self.config.label))]
    pub async fn start(&self) -> EngineResult<()> {
        if self.is_running() {
            return Err(EngineError::AlreadyRunning);
        }

        let (router, jobs) = Router::new(self.config.label.clone(), self.codec.clone());
        let router = Arc::new(router);
        let process = self
            .supervisor
            .start(&self.config, self.codec.clone(), router.clone())
            .await?;
        let writer = tokio::spawn(run_writer(jobs, process.clone(), router.clone()));

        *self.lock_session() = Some(Session {
            router,
            process,
            writer: Some(writer),
            runtime: Handle::current(),
        });
        tracing::info!(family = %self.config.family, "Engine started");
        Ok(())
    }

    /// Submit a query; the ticket resolves with the final result.
    pub fn submit(&self, query: AnalysisQuery) -> EngineResult<AnalysisTicket> {
        let (tx, rx) = oneshot::channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let id = self.submit_inner(query, Completion::Ticket(tx), Some(progress_tx))?;
        Ok(AnalysisTicket {
            id,
            result: rx,
            progress: progress_rx,
        })
    }

    /// Submit a query whose outcome is delivered to `callback`.
    ///
    /// The callback runs on an engine task; a panic inside it is logged and
    /// contained.
    pub fn submit_with_callback<F>(&self, query: AnalysisQuery, callback: F) -> EngineResult<RequestId>
    where
        F: FnOnce(EngineResult<AnalysisResult>) + Send + 'static,
    {
        self.submit_inner(query, Completion::Callback(Box::new(callback)), None)
    }

    fn submit_inner(
        &self,
        mut query: AnalysisQuery,
        completion: Completion,
        progress: Option<mpsc::UnboundedSender<AnalysisResult>>,
    ) -> EngineResult<RequestId> {
        let (router, runtime) = self.router()?;

        if query.options.report_interval.is_none() {
            query.options.report_interval = self.config.report_interval();
        }
        let timeout = query.options.timeout.or(self.config.request_timeout());

        let id = router.submit(query, completion, progress)?;

        if let Some(after) = timeout {
            let weak = Arc::downgrade(&router);
            let timer = runtime.spawn(async move {
                tokio::time::sleep(after).await;
                if let Some(router) = weak.upgrade() {
                    router.expire(id, after);
                }
            });
            router.attach_timer(id, timer.abort_handle());
        }
        Ok(id)
    }

    /// Submit and wait for the final result. Progress records are not kept.
    pub async fn analyze(&self, query: AnalysisQuery) -> EngineResult<AnalysisResult> {
        let (tx, rx) = oneshot::channel();
        self.submit_inner(query, Completion::Ticket(tx), None)?;
        rx.await.unwrap_or(Err(EngineError::Terminated))
    }

    /// Resolve a request with `Cancelled` right away and stop the search.
    pub fn cancel(&self, id: RequestId) -> EngineResult<()> {
        self.router()?.0.cancel(id)
    }

    /// Cancel everything, including open-ended pondering.
    pub fn cancel_all(&self) -> EngineResult<()> {
        self.router()?.0.cancel_all();
        Ok(())
    }

    pub fn request_state(&self, id: RequestId) -> Option<RequestState> {
        self.router().ok()?.0.state_of(id)
    }

    /// Send a command that is not an analysis.
    pub fn send_command(&self, command: EngineCommand) -> EngineResult<()> {
        match command {
            EngineCommand::Stop { id: Some(id) } => self.cancel(id),
            EngineCommand::Stop { id: None } => self.cancel_all(),
            EngineCommand::Analyze { .. } | EngineCommand::Quit => {
                Err(EngineError::NotRaw(command.name()))
            }
            EngineCommand::SetOption { .. } | EngineCommand::ClearCache => {
                self.router()?.0.send_raw(&command)
            }
        }
    }

    /// Resolve outstanding requests with `Terminated` and stop the process.
    ///
    /// Calling it again, or before `start`, does nothing.
    #[tracing::instrument(level = "info", skip(self), fields(engine = %self.config.label))]
    pub async fn shutdown(&self) {
        let taken = {
            let mut session = self.lock_session();
            session
                .as_mut()
                .map(|s| (s.router.clone(), s.writer.take()))
        };
        let Some((router, writer)) = taken else {
            return;
        };

        router.shutdown();
        // Release stdin for the quit command
        if let Some(writer) = writer {
            writer.abort();
            let _ = writer.await;
        }

        let quit = self
            .codec
            .encode(&EngineCommand::Quit)
            .ok()
            .and_then(|lines| lines.into_iter().next());
        self.supervisor.terminate(quit).await;
        tracing::info!("Engine shut down");
    }

    pub fn is_running(&self) -> bool {
        self.lock_session()
            .as_ref()
            .is_some_and(|s| s.process.is_alive() && !s.router.is_closed())
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock_session().as_ref().and_then(|s| s.process.pid())
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.lock_session().as_ref().map(|s| s.process.uptime())
    }

    /// Process details of the current session, if one was started.
    pub fn status(&self) -> Option<ProcessStatus> {
        self.lock_session().as_ref().map(|s| s.process.status())
    }

    pub fn pending_count(&self) -> usize {
        self.router().map(|(r, _)| r.pending_count()).unwrap_or(0)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Pending callers must not hang; the process dies with its Child
        if let Some(session) = self.lock_session().as_ref() {
            session.router.shutdown();
        }
    }
}

/// Handle on one submitted request.
#[derive(Debug)]
pub struct AnalysisTicket {
    id: RequestId,
    result: oneshot::Receiver<EngineResult<AnalysisResult>>,
    progress: mpsc::UnboundedReceiver<AnalysisResult>,
}

impl AnalysisTicket {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Next progress record. `None` once the request has resolved and every
    /// buffered update was taken.
    pub async fn next_progress(&mut self) -> Option<AnalysisResult> {
        self.progress.recv().await
    }

    pub fn try_progress(&mut self) -> Option<AnalysisResult> {
        self.progress.try_recv().ok()
    }

    pub async fn wait(self) -> EngineResult<AnalysisResult> {
        self.result.await.unwrap_or(Err(EngineError::Terminated))
    }

    /// Wait from synchronous code. Panics if called on a runtime thread.
    pub fn blocking_wait(self) -> EngineResult<AnalysisResult> {
        self.result
            .blocking_recv()
            .unwrap_or(Err(EngineError::Terminated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Position;
    use crate::EngineFamily;

    fn engine() -> Engine {
        Engine::new(EngineConfig::new(EngineFamily::KatagoAnalysis, "katago"))
    }

    #[test]
    fn test_submit_before_start() {
        let engine = engine();
        let result = engine.submit(AnalysisQuery::new(Position::empty(19)));
        assert!(matches!(result, Err(EngineError::NotStarted)));
        assert!(matches!(engine.cancel(RequestId(1)), Err(EngineError::NotStarted)));
        assert!(!engine.is_running());
        assert_eq!(engine.pid(), None);
        assert_eq!(engine.status(), None);
    }

    #[tokio::test]
    async fn test_analyze_before_start() {
        let outcome = engine().analyze(AnalysisQuery::new(Position::empty(19))).await;
        assert!(matches!(outcome, Err(EngineError::NotStarted)));
    }

    #[tokio::test]
    async fn test_shutdown_before_start_is_noop() {
        let engine = engine();
        engine.shutdown().await;
        engine.shutdown().await;
    }

    #[test]
    fn test_raw_quit_is_refused() {
        let engine = engine();
        assert!(matches!(
            engine.send_command(EngineCommand::Quit),
            Err(EngineError::NotRaw("quit"))
        ));
    }

    #[tokio::test]
    async fn test_ticket_reports_terminated_when_dropped() {
        let (tx, rx) = oneshot::channel();
        let (_ptx, prx) = mpsc::unbounded_channel();
        let ticket = AnalysisTicket {
            id: RequestId(1),
            result: rx,
            progress: prx,
        };
        drop(tx);
        assert!(matches!(ticket.wait().await, Err(EngineError::Terminated)));
    }
}
