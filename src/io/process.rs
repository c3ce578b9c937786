//! Process management layer
//!
//! Handles external process lifecycle and stderr monitoring,
//! completely separate from transport concerns.

use crate::io::transport::StdioTransport;
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

/// Default time a process gets to exit after SIGTERM before SIGKILL
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

// ============================================================================
// Process State Management
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGTERM first, SIGKILL once the grace period expires
    Graceful,
    /// SIGKILL immediately
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been started yet
    NotStarted,
    /// Process is currently running
    Running { pid: u32 },
    /// Process has exited; `exit_code` is `None` when killed by a signal
    Exited { exit_code: Option<i32> },
}

impl ProcessState {
    /// Get the process ID if the process is running
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Check if the process is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }

    pub fn has_exited(&self) -> bool {
        matches!(self, ProcessState::Exited { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessState::Exited { exit_code } => *exit_code,
            _ => None,
        }
    }
}

// ============================================================================
// Process Exit Events
// ============================================================================

/// Event fired when the process exits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExitEvent {
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
}

/// Trait for handling process exit events
#[async_trait]
pub trait ProcessExitHandler: Send + Sync {
    /// Called once when the process exits, whatever the cause
    async fn on_process_exit(&self, event: ProcessExitEvent);
}

type SharedExitHandler = Arc<Mutex<Option<Arc<dyn ProcessExitHandler>>>>;

// ============================================================================
// Stderr Monitoring Trait
// ============================================================================

/// Trait for monitoring stderr output from external processes
pub trait StderrMonitor: Send + Sync {
    /// Install a handler for stderr lines
    ///
    /// Only one handler can be active at a time. Must be installed before
    /// the process starts; stderr is drained either way.
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static;
}

// ============================================================================
// Process Management
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to launch '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,

    #[error("Spawned process has no process id")]
    MissingPid,
}

/// Trait for managing external process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start the external process
    async fn start(&mut self) -> Result<(), Self::Error>;

    /// Stop the external process
    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error>;

    /// Wait until the process exits or the timeout elapses
    ///
    /// Returns the final state if the process exited in time.
    async fn wait_for_exit(&self, timeout: Duration) -> Option<ProcessState>;

    /// Check if the process is currently running
    fn is_running(&self) -> bool;

    /// Take the stdio transport for communicating with the process
    ///
    /// This consumes the stdin/stdout from the process; a second call fails.
    fn take_transport(&mut self) -> Result<StdioTransport, Self::Error>;

    /// Synchronous force kill for Drop trait implementations
    fn kill_sync(&mut self);
}

/// Manages child processes spawned via Command
pub struct ChildProcessManager {
    /// Command to execute
    command: String,

    /// Command arguments
    args: Vec<String>,

    /// Working directory for the process (optional)
    working_directory: Option<PathBuf>,

    /// How long a graceful stop waits before escalating
    grace_period: Duration,

    /// Process state, observable by waiters
    state: watch::Sender<ProcessState>,

    /// Stdio transport (created when process starts)
    stdio_transport: Option<StdioTransport>,

    /// Stderr handler
    stderr_handler: Option<Box<dyn Fn(String) + Send + Sync>>,

    /// Stderr monitoring task handle
    stderr_task: Option<JoinHandle<()>>,

    /// Process wait task handle (owns the child)
    wait_task: Option<JoinHandle<()>>,

    /// Process exit event handler, read by the wait task at exit time
    exit_handler: SharedExitHandler,
}

impl std::fmt::Debug for ChildProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcessManager")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("working_directory", &self.working_directory)
            .field("state", &self.get_state())
            .finish()
    }
}

impl ChildProcessManager {
    /// Manager for `command args`, run in `working_dir` when given
    pub fn new(command: String, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        let (state, _) = watch::channel(ProcessState::NotStarted);
        Self {
            command,
            args,
            working_directory: working_dir,
            grace_period: DEFAULT_GRACE_PERIOD,
            state,
            stdio_transport: None,
            stderr_handler: None,
            stderr_task: None,
            wait_task: None,
            exit_handler: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Get current process state
    pub fn get_state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    pub fn process_id(&self) -> Option<u32> {
        self.get_state().pid()
    }

    /// Install the exit handler
    ///
    /// May be called after `start()`; if the process is already gone the
    /// handler fires right away.
    pub fn on_process_exit<H>(&mut self, handler: H)
    where
        H: ProcessExitHandler + 'static,
    {
        let handler: Arc<dyn ProcessExitHandler> = Arc::new(handler);
        *self
            .exit_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&handler));

        if let ProcessState::Exited { exit_code } = self.get_state() {
            let event = ProcessExitEvent {
                pid: None,
                exit_code,
            };
            tokio::spawn(async move { handler.on_process_exit(event).await });
        }
    }

    /// Drain stderr line by line into the handler
    ///
    /// Runs even without a handler so the child never blocks on a full pipe.
    fn spawn_stderr_monitor(&mut self, stderr: ChildStderr) {
        if self.stderr_task.is_some() {
            return;
        }

        let handler = self.stderr_handler.take();
        let command = self.command.clone();

        self.stderr_task = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match &handler {
                        Some(handler) => handler(line),
                        None => trace!("{} stderr: {}", command, line),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Stopped reading {} stderr: {}", command, e);
                        break;
                    }
                }
            }
            trace!("ChildProcessManager: {} closed stderr", command);
        }));
    }

    /// Spawn the wait task that monitors child process exit
    fn spawn_wait_task(&mut self, mut child: Child, pid: u32) {
        let exit_handler = Arc::clone(&self.exit_handler);
        let state = self.state.clone();

        let task = tokio::spawn(async move {
            trace!("ChildProcessManager: Starting wait task for PID {}", pid);

            let exit_code = match child.wait().await {
                Ok(status) => {
                    info!("Process PID {} exited with status: {}", pid, status);
                    status.code()
                }
                Err(e) => {
                    error!("Error waiting for child process {}: {}", pid, e);
                    None
                }
            };

            state.send_replace(ProcessState::Exited { exit_code });

            let handler = exit_handler
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(handler) = handler {
                handler
                    .on_process_exit(ProcessExitEvent {
                        pid: Some(pid),
                        exit_code,
                    })
                    .await;
            }

            trace!("ChildProcessManager: Wait task finished for PID {}", pid);
        });

        self.wait_task = Some(task);
    }

    /// Deliver a signal to the running process
    fn signal(&self, pid: u32, mode: StopMode) {
        #[cfg(unix)]
        {
            let signal = match mode {
                StopMode::Graceful => libc::SIGTERM,
                StopMode::Force => libc::SIGKILL,
            };
            // SAFETY: kill(2) has no memory-safety preconditions; a stale pid
            // only yields ESRCH.
            let result = unsafe { libc::kill(pid as libc::pid_t, signal) };
            if result == 0 {
                info!("Sent {:?} signal to process {}", mode, pid);
            } else {
                trace!("Signal to process {} failed (already gone?)", pid);
            }
        }

        #[cfg(not(unix))]
        {
            // Dropping the child inside the wait task kills it (kill_on_drop)
            warn!("Signals unsupported; aborting wait task for process {}", pid);
            let _ = mode;
            if let Some(task) = &self.wait_task {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl ProcessManager for ChildProcessManager {
    type Error = ProcessError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        if !matches!(self.get_state(), ProcessState::NotStarted) {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("Starting process: {} {:?}", self.command, self.args);

        let mut command_builder = Command::new(&self.command);
        command_builder
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(working_dir) = &self.working_directory {
            command_builder.current_dir(working_dir);
        }

        let mut child = command_builder
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let pid = child.id().ok_or(ProcessError::MissingPid)?;
        info!("Process started with PID: {}", pid);
        self.state.send_replace(ProcessState::Running { pid });

        // Extract stdio streams before moving child to wait task
        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        self.stdio_transport = Some(StdioTransport::from_child(stdin, stdout));
        self.spawn_stderr_monitor(stderr);
        self.spawn_wait_task(child, pid);

        Ok(())
    }

    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error> {
        let pid = match self.get_state() {
            ProcessState::Running { pid } => pid,
            ProcessState::Exited { .. } => return Ok(()),
            ProcessState::NotStarted => return Err(ProcessError::NotStarted),
        };

        match mode {
            StopMode::Graceful => info!("Gracefully stopping process with PID: {}", pid),
            StopMode::Force => info!("Force killing process with PID: {}", pid),
        }

        // An untaken transport still holds stdin open
        self.stdio_transport.take();

        self.signal(pid, mode);

        if mode == StopMode::Graceful && self.wait_for_exit(self.grace_period).await.is_none() {
            warn!(
                "Process {} did not exit within {:?}, killing",
                pid, self.grace_period
            );
            self.signal(pid, StopMode::Force);
        }

        if self.wait_for_exit(self.grace_period).await.is_none() {
            // Last resort: dropping the child kills it
            if let Some(task) = self.wait_task.take() {
                task.abort();
            }
            self.state.send_replace(ProcessState::Exited { exit_code: None });
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        Ok(())
    }

    async fn wait_for_exit(&self, timeout: Duration) -> Option<ProcessState> {
        let mut receiver = self.state.subscribe();
        let waited = tokio::time::timeout(timeout, receiver.wait_for(ProcessState::has_exited));
        match waited.await {
            Ok(Ok(state)) => Some(state.clone()),
            _ => None,
        }
    }

    fn is_running(&self) -> bool {
        self.get_state().is_running()
    }

    fn take_transport(&mut self) -> Result<StdioTransport, Self::Error> {
        self.stdio_transport.take().ok_or(ProcessError::NotStarted)
    }

    fn kill_sync(&mut self) {
        let Some(pid) = self.get_state().pid() else {
            return;
        };

        info!("Synchronously force killing process with PID: {}", pid);
        self.signal(pid, StopMode::Force);

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        // The wait task observes the exit and publishes the final state
    }
}

impl StderrMonitor for ChildProcessManager {
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Box::new(handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sh(script: &str) -> ChildProcessManager {
        ChildProcessManager::new(
            "sh".to_string(),
            vec!["-c".to_string(), script.to_string()],
            None,
        )
    }

    struct RecordingExitHandler {
        events: Arc<Mutex<Vec<ProcessExitEvent>>>,
    }

    #[async_trait]
    impl ProcessExitHandler for RecordingExitHandler {
        async fn on_process_exit(&self, event: ProcessExitEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn test_manager_and_transport_are_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ChildProcessManager>();
        assert_send_sync::<StdioTransport>();
    }

    #[tokio::test]
    async fn test_child_process_manager_lifecycle() {
        let mut manager = sh("sleep 30");

        assert!(!manager.is_running());
        assert_eq!(manager.get_state(), ProcessState::NotStarted);

        manager.start().await.unwrap();
        assert!(manager.is_running());
        assert!(manager.process_id().is_some());

        manager.stop(StopMode::Graceful).await.unwrap();
        assert!(manager.get_state().has_exited());
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_launch_failure_is_reported() {
        let mut manager = ChildProcessManager::new(
            "/definitely/not/a/language-server".to_string(),
            vec![],
            None,
        );

        let result = manager.start().await;
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
        assert_eq!(manager.get_state(), ProcessState::NotStarted);
    }

    #[tokio::test]
    async fn test_exit_code_is_recorded() {
        let mut manager = sh("exit 3");
        manager.start().await.unwrap();

        let state = manager
            .wait_for_exit(Duration::from_secs(5))
            .await
            .expect("process should exit");
        assert_eq!(state.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_exit_handler_fires_on_exit() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut manager = sh("sleep 0.2; exit 4");
        manager.start().await.unwrap();
        manager.on_process_exit(RecordingExitHandler {
            events: Arc::clone(&events),
        });

        manager.wait_for_exit(Duration::from_secs(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].exit_code, Some(4));
    }

    #[tokio::test]
    async fn test_exit_handler_registered_late_still_fires() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut manager = sh("exit 0");
        manager.start().await.unwrap();
        manager.wait_for_exit(Duration::from_secs(5)).await.unwrap();

        manager.on_process_exit(RecordingExitHandler {
            events: Arc::clone(&events),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_graceful_stop_escalates_to_kill() {
        let mut manager =
            sh("trap '' TERM; while true; do sleep 0.05; done").with_grace_period(Duration::from_millis(200));
        manager.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        manager.stop(StopMode::Graceful).await.unwrap();
        assert!(manager.get_state().has_exited());
    }

    #[tokio::test]
    async fn test_stderr_lines_reach_handler() {
        let mut manager = sh("echo 'jedi: starting' >&2; echo >&2; echo 'jedi: ready' >&2");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.on_stderr_line(move |line| sink.lock().unwrap().push(line));

        manager.start().await.unwrap();
        manager.wait_for_exit(Duration::from_secs(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Blank lines are skipped
        assert_eq!(*seen.lock().unwrap(), ["jedi: starting", "jedi: ready"]);
    }

    #[tokio::test]
    async fn test_invalid_operations() {
        let mut manager = sh("sleep 30");

        let result = manager.stop(StopMode::Graceful).await;
        assert!(matches!(result, Err(ProcessError::NotStarted)));
        assert!(matches!(
            manager.take_transport(),
            Err(ProcessError::NotStarted)
        ));

        manager.start().await.unwrap();
        assert!(matches!(
            manager.start().await,
            Err(ProcessError::AlreadyStarted)
        ));

        let _transport = manager.take_transport().unwrap();
        assert!(matches!(
            manager.take_transport(),
            Err(ProcessError::NotStarted)
        ));

        manager.stop(StopMode::Force).await.unwrap();
        // Stopping an exited process is a no-op
        manager.stop(StopMode::Force).await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_sync_terminates_process() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut manager = sh("sleep 30");
        manager.start().await.unwrap();

        struct CountingHandler(Arc<AtomicUsize>);
        #[async_trait]
        impl ProcessExitHandler for CountingHandler {
            async fn on_process_exit(&self, _event: ProcessExitEvent) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        manager.on_process_exit(CountingHandler(Arc::clone(&counter)));

        manager.kill_sync();
        let state = manager.wait_for_exit(Duration::from_secs(5)).await.unwrap();
        assert_eq!(state.exit_code(), None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_process_state_methods() {
        let not_started = ProcessState::NotStarted;
        assert!(!not_started.is_running());
        assert!(not_started.pid().is_none());

        let running = ProcessState::Running { pid: 12345 };
        assert!(running.is_running());
        assert_eq!(running.pid(), Some(12345));

        let exited = ProcessState::Exited { exit_code: Some(1) };
        assert!(!exited.is_running());
        assert!(exited.has_exited());
        assert_eq!(exited.exit_code(), Some(1));
    }
}
