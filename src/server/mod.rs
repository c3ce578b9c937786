//! Language server façade
//!
//! [`LanguageServer`] ties a server process, its RPC session and the protocol
//! session together behind a cheap clonable handle. Queries live in
//! [`queries`], buffer edits in [`edits`].

use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{Level, debug, error, info, warn};

use lsp_types::ServerCapabilities;
use lsp_types::notification::Exit;
use lsp_types::request::Shutdown;

use crate::config::SessionConfig;
use crate::error::LspError;
use crate::io::{
    ChildProcessManager, ProcessExitEvent, ProcessExitHandler, ProcessManager, ProcessState,
    StderrMonitor, StdioTransport, StopMode,
};
use crate::log_timing;
use crate::logging::SERVER_STDERR_TARGET;
use crate::lsp::{ProtocolSession, RpcError, RpcSession, SessionState};

pub mod edits;
pub mod queries;


pub use queries::CompletionEntry;

// ============================================================================
// Crash Detection
// ============================================================================

/// Turns an unexpected process exit into `ServerCrashed`
struct CrashMonitor {
    rpc: RpcSession,
}

#[async_trait]
impl ProcessExitHandler for CrashMonitor {
    async fn on_process_exit(&self, event: ProcessExitEvent) {
        if self.rpc.is_closing() {
            debug!(
                "Language server exited during shutdown (exit code {:?})",
                event.exit_code
            );
            return;
        }

        error!(
            "Language server (pid {:?}) exited unexpectedly with exit code {:?}",
            event.pid, event.exit_code
        );
        self.rpc.terminate(RpcError::ServerCrashed {
            exit_code: event.exit_code,
        });
    }
}

// ============================================================================
// Language Server Handle
// ============================================================================

struct Inner {
    session: ProtocolSession,
    process: Option<tokio::sync::Mutex<ChildProcessManager>>,
    pid: Option<u32>,
    started_at: Instant,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.session.rpc().close();

        if let Some(process) = self.process.as_mut() {
            let process = process.get_mut();
            if process.is_running() {
                warn!("LanguageServer dropped without shutdown() - force killing process");
                process.kill_sync();
            }
        }
    }
}

/// Handle to a running language server session
///
/// Clones share one session. When the last clone drops without
/// [`LanguageServer::shutdown`], the server process is killed.
#[derive(Clone)]
pub struct LanguageServer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LanguageServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageServer")
            .field("pid", &self.inner.pid)
            .field("session", &self.inner.session)
            .finish()
    }
}

impl LanguageServer {
    /// Launch the configured server and complete the handshake
    pub async fn start(config: SessionConfig) -> Result<Self, LspError> {
        let config = Arc::new(config);
        info!(
            "Starting {} language server: {} {:?}",
            config.language, config.command, config.args
        );

        let mut process = ChildProcessManager::new(
            config.command.clone(),
            config.args.clone(),
            Some(config.working_directory.clone()),
        )
        .with_grace_period(config.shutdown_grace);

        let stderr_handler = config.stderr_handler.clone();
        process.on_stderr_line(move |line| {
            debug!(target: SERVER_STDERR_TARGET, "{}", line);
            if let Some(handler) = &stderr_handler {
                handler(line);
            }
        });

        process.start().await?;
        let transport = process.take_transport()?;
        let rpc = RpcSession::new(transport);
        process.on_process_exit(CrashMonitor { rpc: rpc.clone() });

        Self::establish(config, rpc, Some(process)).await
    }

    /// Run a session over an already-connected stream pair
    pub async fn connect(config: SessionConfig, transport: StdioTransport) -> Result<Self, LspError> {
        info!("Connecting {} language session", config.language);
        Self::establish(Arc::new(config), RpcSession::new(transport), None).await
    }

    /// Start a server, run `body`, and shut down on every exit path
    ///
    /// Panics and cancellation are covered by kill-on-drop.
    pub async fn scoped<F, Fut, T>(config: SessionConfig, body: F) -> Result<T, LspError>
    where
        F: FnOnce(LanguageServer) -> Fut,
        Fut: Future<Output = Result<T, LspError>>,
    {
        let server = Self::start(config).await?;
        let outcome = body(server.clone()).await;
        server.shutdown().await;
        outcome
    }

    async fn establish(
        config: Arc<SessionConfig>,
        rpc: RpcSession,
        process: Option<ChildProcessManager>,
    ) -> Result<Self, LspError> {
        let pid = process.as_ref().and_then(ChildProcessManager::process_id);
        let inner = Arc::new(Inner {
            session: ProtocolSession::new(rpc, config),
            process: process.map(tokio::sync::Mutex::new),
            pid,
            started_at: Instant::now(),
        });
        spawn_protocol_watchdog(&inner);

        let server = Self { inner };
        if let Err(e) = server.inner.session.initialize().await {
            server.abort().await;
            return Err(e);
        }
        Ok(server)
    }

    /// Tear everything down without the shutdown handshake
    async fn abort(&self) {
        self.inner.session.rpc().close();
        self.inner.session.mark_terminated();
        if let Some(process) = &self.inner.process
            && let Err(e) = process.lock().await.stop(StopMode::Force).await
        {
            warn!("Failed to kill language server: {}", e);
        }
    }

    /// Graceful shutdown; safe to call more than once
    ///
    /// Stops accepting queries, cancels in-flight calls, sends `shutdown`
    /// and `exit` within the grace period, then waits for the process and
    /// kills it if it lingers.
    pub async fn shutdown(&self) {
        let session = &self.inner.session;
        let rpc = session.rpc();
        let grace = session.config().shutdown_grace;
        let was_ready = session.state().is_ready();

        if let Err(e) = session.begin_shutdown() {
            debug!("Shutdown skipped: {}", e);
            self.stop_process(grace).await;
            rpc.close();
            return;
        }

        info!("Shutting down language server");
        let started = Instant::now();

        let cancelled = rpc.cancel_pending();
        if cancelled > 0 {
            debug!("Cancelled {} in-flight request(s)", cancelled);
        }

        if was_ready {
            if let Err(e) = rpc.request::<Shutdown>((), grace).await {
                warn!("Server did not acknowledge shutdown: {}", e);
            }
            if let Err(e) = rpc.notification::<Exit>(()) {
                debug!("Failed to send exit notification: {}", e);
            }
        }

        self.stop_process(grace).await;
        rpc.close();
        session.mark_terminated();
        log_timing!(Level::INFO, "shutdown", started.elapsed());
    }

    async fn stop_process(&self, grace: Duration) {
        let Some(process) = &self.inner.process else {
            return;
        };

        let mut process = process.lock().await;
        if process.is_running() && process.wait_for_exit(grace).await.is_none() {
            warn!(
                "Language server still running {:?} after exit; killing it",
                grace
            );
            if let Err(e) = process.stop(StopMode::Force).await {
                warn!("Failed to kill language server: {}", e);
            }
        }
    }

    pub(crate) fn session(&self) -> &ProtocolSession {
        &self.inner.session
    }

    pub fn config(&self) -> &SessionConfig {
        self.inner.session.config()
    }

    pub fn root(&self) -> &Path {
        &self.config().root
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.state()
    }

    pub fn capabilities(&self) -> Option<Arc<ServerCapabilities>> {
        self.inner.session.capabilities()
    }

    /// Server process id; `None` for connected sessions
    pub fn process_id(&self) -> Option<u32> {
        self.inner.pid
    }

    /// Server process state; `None` for connected sessions
    pub async fn process_state(&self) -> Option<ProcessState> {
        match &self.inner.process {
            Some(process) => Some(process.lock().await.get_state()),
            None => None,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }
}

/// Kill the server once the RPC session dies of a protocol error
fn spawn_protocol_watchdog(inner: &Arc<Inner>) {
    let rpc = inner.session.rpc().clone();
    let inner: Weak<Inner> = Arc::downgrade(inner);

    tokio::spawn(async move {
        let reason = rpc.terminated().await;
        drop(rpc);

        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.session.mark_terminated();

        if let RpcError::Protocol(message) = &reason
            && let Some(process) = &inner.process
        {
            error!("Protocol error, killing language server: {}", message);
            if let Err(e) = process.lock().await.stop(StopMode::Force).await {
                warn!("Failed to kill language server: {}", e);
            }
        }
    });
}
