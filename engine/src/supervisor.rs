//! Ownership of the engine OS process and its pipes.
//!
//! The supervisor is the only code that touches the child process. Shutdown is
//! layered: ask politely, then close the pipes, then kill.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

use crate::codec::WireCodec;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::reader::{spawn_stderr_reader, spawn_stdout_reader, Dispatch};

/// Snapshot of a launched process for status reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub label: String,
    pub pid: Option<u32>,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub started_at: SystemTime,
    pub uptime: Duration,
    pub alive: bool,
}

/// One launched engine process. Never restarted once stopped.
#[derive(Debug)]
pub struct ProcessHandle {
    label: String,
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    pid: Option<u32>,
    started_at: SystemTime,
    started: Instant,
    alive: Arc<AtomicBool>,
    stopped: AtomicBool,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: tokio::sync::Mutex<Child>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_grace: Duration,
    pipe_close_grace: Duration,
    write_timeout: Duration,
}

impl ProcessHandle {
    #[tracing::instrument(level = "info", skip_all, fields(engine = %config.label))]
    async fn spawn(
        config: &EngineConfig,
        codec: Arc<dyn WireCodec>,
        dispatcher: Arc<dyn Dispatch>,
    ) -> EngineResult<Self> {
        let program = config.program.clone();
        let start_error = |source: std::io::Error| EngineError::ProcessStart {
            program: program.display().to_string(),
            source,
        };

        config.check_files().map_err(|e| {
            start_error(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                e.to_string(),
            ))
        })?;

        let args = config.command_args();
        tracing::info!("Spawning {} {}", program.display(), args.join(" "));

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            tracing::error!("Failed to spawn engine: {}", e);
            start_error(e)
        })?;

        let missing_pipe =
            |name: &str| start_error(std::io::Error::other(format!("no {} pipe", name)));
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        let alive = Arc::new(AtomicBool::new(true));
        let readers = vec![
            spawn_stdout_reader(
                config.label.clone(),
                BufReader::new(stdout),
                codec,
                dispatcher,
                alive.clone(),
            ),
            spawn_stderr_reader(config.label.clone(), BufReader::new(stderr)),
        ];

        let pid = child.id();
        tracing::info!(pid = ?pid, "Engine process started");

        Ok(Self {
            label: config.label.clone(),
            program,
            args,
            working_dir: config.working_dir.clone(),
            pid,
            started_at: SystemTime::now(),
            started: Instant::now(),
            alive,
            stopped: AtomicBool::new(false),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            child: tokio::sync::Mutex::new(child),
            readers: Mutex::new(readers),
            shutdown_grace: config.shutdown_grace(),
            pipe_close_grace: config.pipe_close_grace(),
            write_timeout: config.write_timeout(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn status(&self) -> ProcessStatus {
        ProcessStatus {
            label: self.label.clone(),
            pid: self.pid,
            program: self.program.clone(),
            args: self.args.clone(),
            working_dir: self.working_dir.clone(),
            started_at: self.started_at,
            uptime: self.uptime(),
            alive: self.is_alive(),
        }
    }

    /// The process is running and has not been asked to stop.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.is_stopped()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Write lines to stdin, each terminated by a newline, then flush.
    pub async fn write_lines(&self, lines: &[String]) -> EngineResult<()> {
        if self.is_stopped() {
            return Err(EngineError::Stopped);
        }
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(EngineError::Stopped)?;

        let mut payload = String::new();
        for line in lines {
            tracing::trace!(engine = %self.label, ">> {}", line);
            payload.push_str(line);
            payload.push('\n');
        }

        let write = async {
            pipe.write_all(payload.as_bytes()).await?;
            pipe.flush().await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(EngineError::Write(e.to_string())),
            Err(_) => Err(EngineError::Write(format!(
                "write blocked for more than {:?}",
                self.write_timeout
            ))),
        }
    }

    /// Stop the process. Only the first call does anything.
    #[tracing::instrument(level = "info", skip_all, fields(engine = %self.label))]
    pub async fn terminate(&self, quit_line: Option<String>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("Already terminated");
            return;
        }
        tracing::info!("Terminating engine");

        // Graceful: quit command, or EOF on stdin for engines without one
        {
            let mut stdin = self.stdin.lock().await;
            match (quit_line, stdin.as_mut()) {
                (Some(line), Some(pipe)) => {
                    tracing::trace!(">> {}", line);
                    let write = async {
                        pipe.write_all(format!("{}\n", line).as_bytes()).await?;
                        pipe.flush().await
                    };
                    match tokio::time::timeout(self.write_timeout, write).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::warn!("Failed to send quit: {}", e),
                        Err(_) => tracing::warn!("Timed out sending quit"),
                    }
                }
                _ => {
                    stdin.take();
                }
            }
        }
        if self.wait_exit(self.shutdown_grace).await {
            self.join_readers().await;
            return;
        }

        // Close every pipe; engines that ignore quit usually exit on EOF
        tracing::info!("Engine ignored quit, closing pipes");
        self.stdin.lock().await.take();
        for reader in self.lock_readers().iter() {
            reader.abort();
        }
        if self.wait_exit(self.pipe_close_grace).await {
            self.join_readers().await;
            return;
        }

        tracing::warn!("Engine still running, killing it");
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            tracing::warn!("Failed to kill engine: {}", e);
        }
        drop(child);
        self.alive.store(false, Ordering::SeqCst);
        self.join_readers().await;
    }

    async fn wait_exit(&self, grace: Duration) -> bool {
        let mut child = self.child.lock().await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!("Engine exited with {}", status);
                self.alive.store(false, Ordering::SeqCst);
                true
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to wait for engine: {}", e);
                false
            }
            Err(_) => false,
        }
    }

    async fn join_readers(&self) {
        let readers: Vec<JoinHandle<()>> = self.lock_readers().drain(..).collect();
        for mut reader in readers {
            // A grandchild may still hold the pipe open
            if tokio::time::timeout(self.pipe_close_grace, &mut reader)
                .await
                .is_err()
            {
                reader.abort();
                let _ = reader.await;
            }
        }
        tracing::debug!("Reader tasks joined");
    }

    fn lock_readers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.readers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Launches engine processes and hands out the current one.
#[derive(Debug)]
pub struct ProcessSupervisor {
    label: String,
    current: Mutex<Option<Arc<ProcessHandle>>>,
}

impl ProcessSupervisor {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            current: Mutex::new(None),
        }
    }

    /// Launch a fresh process. Fails if the previous one is still alive.
    pub async fn start(
        &self,
        config: &EngineConfig,
        codec: Arc<dyn WireCodec>,
        dispatcher: Arc<dyn Dispatch>,
    ) -> EngineResult<Arc<ProcessHandle>> {
        if self.current().is_some_and(|handle| handle.is_alive()) {
            return Err(EngineError::AlreadyRunning);
        }
        let handle = Arc::new(ProcessHandle::spawn(config, codec, dispatcher).await?);
        *self.lock_current() = Some(handle.clone());
        Ok(handle)
    }

    pub fn current(&self) -> Option<Arc<ProcessHandle>> {
        self.lock_current().clone()
    }

    pub async fn write(&self, lines: &[String]) -> EngineResult<()> {
        let handle = self.current().ok_or(EngineError::NotStarted)?;
        handle.write_lines(lines).await
    }

    /// Terminate the current process, if any. Safe to call repeatedly.
    pub async fn terminate(&self, quit_line: Option<String>) {
        match self.current() {
            Some(handle) => handle.terminate(quit_line).await,
            None => tracing::debug!(engine = %self.label, "Nothing to terminate"),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.current().is_some_and(|handle| handle.is_alive())
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<Arc<ProcessHandle>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
