//! In-process scripted language server for tests
//!
//! Speaks framed JSON-RPC over a `tokio::io::duplex` pipe. Every message the
//! client sends is recorded; requests are answered by a caller-supplied
//! script.

use crate::io::transport::{StdioTransport, TransportSender};
use crate::lsp::protocol::{Message, Notification, Request, RequestId, Response, ResponseError};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// How the fake server answers one request
#[derive(Debug, Clone)]
pub enum Reply {
    Result(Value),
    Error(ResponseError),
    /// Never answer
    NoReply,
    /// Answer with a result after a delay, without blocking other requests
    Delay(Duration, Value),
}

type Script = Arc<dyn Fn(&Request) -> Reply + Send + Sync>;
type ServerPending = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Result<Value, ResponseError>>>>>;

pub struct FakeServer {
    client_io: Mutex<Option<DuplexStream>>,
    sender: TransportSender,
    received: Arc<Mutex<Vec<Message>>>,
    received_count: watch::Receiver<usize>,
    pending: ServerPending,
    next_id: Mutex<u64>,
}

impl FakeServer {
    /// Start a server that answers every request with `script`
    pub fn start<F>(script: F) -> Self
    where
        F: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        let (client_io, server_io) = tokio::io::duplex(1 << 20);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (sender, mut receiver) = StdioTransport::new(server_read, server_write).split();

        let script: Script = Arc::new(script);
        let received = Arc::new(Mutex::new(Vec::new()));
        let (count_tx, count_rx) = watch::channel(0usize);
        let pending: ServerPending = Arc::new(Mutex::new(HashMap::new()));

        let task_sender = sender.clone();
        let task_received = Arc::clone(&received);
        let task_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Ok(Some(body)) = receiver.receive().await {
                let Ok(message) = Message::parse(&body) else {
                    continue;
                };

                let count = {
                    let mut received = task_received.lock().unwrap();
                    received.push(message.clone());
                    received.len()
                };
                count_tx.send_replace(count);

                match &message {
                    Message::Request(request) => {
                        let reply = script(request);
                        Self::answer(&task_sender, request.id.clone(), reply);
                    }
                    Message::Response(response) => {
                        if let Some(id) = &response.id
                            && let Some(waiter) = task_pending.lock().unwrap().remove(id)
                        {
                            let _ = waiter.send(response.outcome.clone());
                        }
                    }
                    Message::Notification(notification) => {
                        if notification.method == "exit" {
                            task_sender.close();
                        }
                    }
                }
            }
        });

        Self {
            client_io: Mutex::new(Some(client_io)),
            sender,
            received,
            received_count: count_rx,
            pending,
            next_id: Mutex::new(0),
        }
    }

    /// Start a server that completes the LSP handshake with `capabilities`
    /// and delegates every other request to `script`
    pub fn language_server<F>(capabilities: Value, script: F) -> Self
    where
        F: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        Self::start(move |request| match request.method.as_str() {
            "initialize" => Reply::Result(json!({
                "capabilities": capabilities,
                "serverInfo": {"name": "fake-server", "version": "0.0.1"}
            })),
            "shutdown" => Reply::Result(Value::Null),
            _ => script(request),
        })
    }

    fn answer(sender: &TransportSender, id: RequestId, reply: Reply) {
        let outcome = match reply {
            Reply::Result(value) => Ok(value),
            Reply::Error(error) => Err(error),
            Reply::NoReply => return,
            Reply::Delay(delay, value) => {
                let sender = sender.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    Self::answer(&sender, id, Reply::Result(value));
                });
                return;
            }
        };

        let body = Message::Response(Response {
            id: Some(id),
            outcome,
        })
        .to_json()
        .unwrap();
        let _ = sender.send(body);
    }

    /// The client end of the pipe; may only be taken once
    pub fn client_transport(&self) -> StdioTransport {
        let (read, write) = self.client_streams();
        StdioTransport::new(read, write)
    }

    /// Raw halves of the client end, for tests that wrap them
    pub fn client_streams(&self) -> (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
        let client_io = self
            .client_io
            .lock()
            .unwrap()
            .take()
            .expect("client transport already taken");
        tokio::io::split(client_io)
    }

    /// Write an arbitrary body, framed, to the client
    pub fn send_raw(&self, body: &str) {
        self.sender.send(body.to_string()).unwrap();
    }

    /// Send a notification to the client
    pub fn notify(&self, method: &str, params: Option<Value>) {
        let body = Message::Notification(Notification {
            method: method.to_string(),
            params,
        })
        .to_json()
        .unwrap();
        self.send_raw(&body);
    }

    /// Send a request to the client and wait for its reply
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Option<Result<Value, ResponseError>> {
        let id = {
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            RequestId::String(format!("server-{}", *next_id))
        };
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), tx);

        let body = Message::Request(Request {
            id,
            method: method.to_string(),
            params,
        })
        .to_json()
        .unwrap();
        self.send_raw(&body);

        tokio::time::timeout(WAIT_LIMIT, rx).await.ok()?.ok()
    }

    /// Close the server's output; the client sees end-of-stream
    pub fn close(&self) {
        self.sender.close();
    }

    pub fn messages(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.messages()
            .into_iter()
            .filter_map(|message| match message {
                Message::Request(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.messages()
            .into_iter()
            .filter_map(|message| match message {
                Message::Notification(notification) => Some(notification),
                _ => None,
            })
            .collect()
    }

    /// Params of every notification received for `method`
    pub fn notifications_for(&self, method: &str) -> Vec<Value> {
        self.notifications()
            .into_iter()
            .filter(|notification| notification.method == method)
            .map(|notification| notification.params.unwrap_or(Value::Null))
            .collect()
    }

    /// Requests received for `method`
    pub fn requests_for(&self, method: &str) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|request| request.method == method)
            .collect()
    }

    async fn wait_until<P>(&self, mut predicate: P)
    where
        P: FnMut(&Self) -> bool,
    {
        let mut count = self.received_count.clone();
        let waited = tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                if predicate(self) {
                    return;
                }
                if count.changed().await.is_err() {
                    // Server task finished; re-check once more
                    assert!(predicate(self), "fake server stopped before condition held");
                    return;
                }
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting on fake server");
    }

    pub async fn wait_for_requests(&self, count: usize) {
        self.wait_until(|server| server.requests().len() >= count)
            .await;
    }

    pub async fn wait_for_notifications(&self, count: usize) {
        self.wait_until(|server| server.notifications().len() >= count)
            .await;
    }

    /// Wait until `count` notifications for `method` have arrived
    pub async fn wait_for_notification(&self, method: &str, count: usize) {
        self.wait_until(|server| server.notifications_for(method).len() >= count)
            .await;
    }
}
