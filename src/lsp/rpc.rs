//! JSON-RPC session engine
//!
//! Correlates outgoing requests with responses, dispatches server-initiated
//! requests and notifications to registered handlers, and turns transport
//! failure or process death into a session-wide termination.
//!
//! One reader task per session drains the transport. Callers never share a
//! lock across an await: each call parks on its own oneshot channel, so a
//! slow request never delays a fast one.

use crate::io::transport::{StdioTransport, TransportReceiver, TransportSender};
use crate::log_lsp_message;
use crate::lsp::jsonrpc_utils::{
    error_code_name, error_response, null_success_response, success_response,
};
use crate::lsp::protocol::{Message, Notification, Request, RequestId, Response, ResponseError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Level, debug, trace, warn};

/// How long the reader waits after EOF for the process supervisor to report
/// an exit code before declaring the crash itself
const EOF_SETTLE_PERIOD: Duration = Duration::from_millis(250);

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by RPC calls
///
/// Cloneable because one termination reason is delivered to every pending
/// call and to every later caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    #[error("Server returned error {code}: {message}")]
    Remote {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("Request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("Language server exited unexpectedly (exit code: {exit_code:?})")]
    ServerCrashed { exit_code: Option<i32> },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl RpcError {
    /// Errors after which the session cannot be used any more
    pub fn is_fatal(&self) -> bool {
        matches!(self, RpcError::ServerCrashed { .. } | RpcError::Protocol(_))
    }
}

impl From<ResponseError> for RpcError {
    fn from(error: ResponseError) -> Self {
        RpcError::Remote {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

// ============================================================================
// Session state
// ============================================================================

/// Handler for a server-initiated request; runs on the dispatch path
pub type RequestHandler = Arc<dyn Fn(Option<Value>) -> Result<Value, ResponseError> + Send + Sync>;

/// Handler for a server notification; runs on the dispatch path
pub type NotificationHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;

type Reply = oneshot::Sender<Result<Value, RpcError>>;

/// Outgoing request awaiting its response
struct PendingCall {
    method: String,
    deadline: Instant,
    reply: Reply,
}

/// Pending calls and the termination flag live under one lock so a call can
/// never register after termination
#[derive(Default)]
struct CallTable {
    pending: HashMap<i64, PendingCall>,
    termination: Option<RpcError>,
}

struct Shared {
    sender: TransportSender,
    next_id: AtomicI64,
    calls: Mutex<CallTable>,
    request_handlers: RwLock<HashMap<String, RequestHandler>>,
    notification_handlers: RwLock<HashMap<String, NotificationHandler>>,
    closing: AtomicBool,
    termination_tx: watch::Sender<Option<RpcError>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lock_calls(&self) -> std::sync::MutexGuard<'_, CallTable> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn termination(&self) -> Option<RpcError> {
        self.lock_calls().termination.clone()
    }

    fn terminate(&self, reason: RpcError) -> bool {
        let pending = {
            let mut table = self.lock_calls();
            if table.termination.is_some() {
                return false;
            }
            table.termination = Some(reason.clone());
            std::mem::take(&mut table.pending)
        };

        debug!(
            "RpcSession: terminating ({}), failing {} pending call(s)",
            reason,
            pending.len()
        );
        for (_, call) in pending {
            let _ = call.reply.send(Err(reason.clone()));
        }

        self.termination_tx.send_replace(Some(reason));
        self.sender.close();
        true
    }

    fn send_message(&self, message: &Message) -> Result<(), RpcError> {
        let body = message
            .to_json()
            .map_err(|e| RpcError::Serialization(e.to_string()))?;
        self.sender.send(body).map_err(|e| {
            self.termination()
                .unwrap_or_else(|| RpcError::Protocol(format!("Failed to write message: {e}")))
        })
    }

    fn dispatch(&self, message: Message) {
        match message {
            Message::Response(response) => self.resolve(response),
            Message::Request(request) => self.answer(request),
            Message::Notification(notification) => self.notify_handler(notification),
        }
    }

    fn resolve(&self, response: Response) {
        let id = match response.id {
            Some(RequestId::Number(id)) => id,
            other => {
                warn!(
                    "RpcSession: dropping response with foreign id {:?}: {:?}",
                    other, response.outcome
                );
                return;
            }
        };

        let Some(call) = self.lock_calls().pending.remove(&id) else {
            debug!(
                "RpcSession: dropping response for unknown or expired request id {}",
                id
            );
            return;
        };

        log_lsp_message!(Level::DEBUG, "incoming", call.method.as_str(), &response.outcome);
        if let Err(error) = &response.outcome {
            debug!(
                "RpcSession: '{}' failed with {} ({}): {}",
                call.method,
                error.code,
                error_code_name(error.code).unwrap_or("ServerError"),
                error.message
            );
        }
        let _ = call.reply.send(response.outcome.map_err(RpcError::from));
    }

    fn answer(&self, request: Request) {
        log_lsp_message!(Level::DEBUG, "incoming", request.method.as_str(), &request.params);

        let handler = self
            .request_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.method)
            .cloned();

        let reply = match handler {
            Some(handler) => match handler(request.params) {
                Ok(result) => success_response(request.id, result),
                Err(error) => error_response(request.id, error),
            },
            None => {
                debug!(
                    "RpcSession: no handler for server request '{}', replying null",
                    request.method
                );
                null_success_response(request.id)
            }
        };

        if let Err(e) = self.send_message(&reply) {
            warn!("RpcSession: failed to reply to '{}': {}", request.method, e);
        }
    }

    fn notify_handler(&self, notification: Notification) {
        let handler = self
            .notification_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&notification.method)
            .cloned();

        match handler {
            Some(handler) => handler(notification.params),
            None => trace!(
                "RpcSession: ignoring notification '{}'",
                notification.method
            ),
        }
    }
}

/// Removes the PendingCall when the caller's future completes or is dropped
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock_calls().pending.remove(&self.id);
    }
}

// ============================================================================
// RPC Session
// ============================================================================

/// Handle to a JSON-RPC session
///
/// Cheap to clone; all clones share the same connection and reader task.
#[derive(Clone)]
pub struct RpcSession {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("pending", &self.pending_count())
            .field("termination", &self.termination())
            .finish()
    }
}

impl RpcSession {
    /// Start a session over a transport and spawn its reader task
    pub fn new(transport: StdioTransport) -> Self {
        let (sender, receiver) = transport.split();
        let (termination_tx, _) = watch::channel(None);

        let shared = Arc::new(Shared {
            sender,
            next_id: AtomicI64::new(1),
            calls: Mutex::new(CallTable::default()),
            request_handlers: RwLock::new(HashMap::new()),
            notification_handlers: RwLock::new(HashMap::new()),
            closing: AtomicBool::new(false),
            termination_tx,
            reader: Mutex::new(None),
        });

        let reader = tokio::spawn(Self::read_loop(Arc::downgrade(&shared), receiver));
        *shared.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(reader);

        Self { shared }
    }

    async fn read_loop(session: Weak<Shared>, mut receiver: TransportReceiver) {
        loop {
            let next = receiver.receive().await;
            let Some(shared) = session.upgrade() else {
                trace!("RpcSession: all handles dropped, reader exiting");
                return;
            };

            match next {
                Ok(Some(body)) => {
                    trace!("RpcSession: received {} bytes", body.len());
                    match Message::parse(&body) {
                        Ok(message) => shared.dispatch(message),
                        Err(e) => {
                            warn!("RpcSession: unparseable message from server: {}", e);
                            shared.terminate(RpcError::Protocol(e.to_string()));
                            return;
                        }
                    }
                }
                Ok(None) => {
                    if shared.closing.load(Ordering::SeqCst) {
                        shared.terminate(RpcError::Cancelled);
                        return;
                    }
                    // Give the process supervisor a chance to report the exit code
                    let mut termination = shared.termination_tx.subscribe();
                    let settled = tokio::time::timeout(
                        EOF_SETTLE_PERIOD,
                        termination.wait_for(Option::is_some),
                    )
                    .await
                    .is_ok();
                    if !settled {
                        warn!("RpcSession: server closed its output stream");
                        shared.terminate(RpcError::ServerCrashed { exit_code: None });
                    }
                    return;
                }
                Err(e) => {
                    warn!("RpcSession: transport failure: {}", e);
                    shared.terminate(RpcError::Protocol(e.to_string()));
                    return;
                }
            }
        }
    }

    /// Send a request and wait for its response
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let mut table = self.shared.lock_calls();
            if let Some(reason) = &table.termination {
                return Err(reason.clone());
            }
            table.pending.insert(
                id,
                PendingCall {
                    method: method.to_string(),
                    deadline: Instant::now() + timeout,
                    reply: reply_tx,
                },
            );
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        log_lsp_message!(Level::DEBUG, "outgoing", method, &params);
        self.shared.send_message(&Message::Request(Request {
            id: RequestId::Number(id),
            method: method.to_string(),
            params,
        }))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.termination().unwrap_or(RpcError::Cancelled)),
            Err(_) => {
                warn!(
                    "RpcSession: request {} '{}' timed out after {:?}",
                    id, method, timeout
                );
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Typed request using an `lsp_types` request definition
    pub async fn request<R>(&self, params: R::Params, timeout: Duration) -> Result<R::Result, RpcError>
    where
        R: lsp_types::request::Request,
    {
        let params = to_params(&params)?;
        let result = self.call(R::METHOD, params, timeout).await?;
        serde_json::from_value(result)
            .map_err(|e| RpcError::Deserialization(format!("{}: {e}", R::METHOD)))
    }

    /// Send a notification; no response is expected
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        if let Some(reason) = self.termination() {
            return Err(reason);
        }

        log_lsp_message!(Level::DEBUG, "outgoing", method, &params);
        self.shared
            .send_message(&Message::Notification(Notification {
                method: method.to_string(),
                params,
            }))
    }

    /// Typed notification using an `lsp_types` notification definition
    pub fn notification<N>(&self, params: N::Params) -> Result<(), RpcError>
    where
        N: lsp_types::notification::Notification,
    {
        self.notify(N::METHOD, to_params(&params)?)
    }

    /// Register the handler for a server-initiated request method
    ///
    /// Replaces any handler previously registered for the method.
    pub fn on_request<F>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>) -> Result<Value, ResponseError> + Send + Sync + 'static,
    {
        self.shared
            .request_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.to_string(), Arc::new(handler));
    }

    /// Register the handler for a server notification method
    ///
    /// Replaces any handler previously registered for the method.
    pub fn on_notification<F>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        self.shared
            .notification_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.to_string(), Arc::new(handler));
    }

    /// Fail every pending call and every later call with `reason`
    ///
    /// Returns false if the session was already terminated; the first reason
    /// wins.
    pub fn terminate(&self, reason: RpcError) -> bool {
        self.shared.terminate(reason)
    }

    /// Resolve in-flight calls with `Cancelled` without terminating
    pub fn cancel_pending(&self) -> usize {
        let pending = std::mem::take(&mut self.shared.lock_calls().pending);
        let count = pending.len();
        for (id, call) in pending {
            trace!(
                "RpcSession: cancelling request {} '{}' ({:?} before deadline)",
                id,
                call.method,
                call.deadline.saturating_duration_since(Instant::now())
            );
            let _ = call.reply.send(Err(RpcError::Cancelled));
        }
        count
    }

    /// Mark the session as closing: EOF from now on is expected, not a crash
    pub fn begin_shutdown(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
    }

    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }

    /// Close the transport and stop the reader
    pub fn close(&self) {
        self.begin_shutdown();
        self.shared.terminate(RpcError::Cancelled);
        if let Some(reader) = self
            .shared
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
    }

    /// Number of calls still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.shared.lock_calls().pending.len()
    }

    /// Reason the session terminated, if it has
    pub fn termination(&self) -> Option<RpcError> {
        self.shared.termination()
    }

    /// Wait until the session terminates and return the reason
    pub async fn terminated(&self) -> RpcError {
        let mut receiver = self.shared.termination_tx.subscribe();
        match receiver.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(RpcError::Cancelled),
            // The sender lives in `shared`, which we hold
            Err(_) => RpcError::Cancelled,
        }
    }
}

/// Serialize typed params; unit params (`()`) become an absent member
fn to_params<P: Serialize>(params: &P) -> Result<Option<Value>, RpcError> {
    match serde_json::to_value(params) {
        Ok(Value::Null) => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(e) => Err(RpcError::Serialization(e.to_string())),
    }
}

/// Deserialize untyped handler params
pub fn parse_params<P: DeserializeOwned>(params: Option<Value>) -> Result<P, ResponseError> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(|e| {
        ResponseError::new(
            crate::lsp::jsonrpc_utils::error_codes::INVALID_PARAMS,
            e.to_string(),
        )
    })
}
