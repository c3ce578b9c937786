//! LSP client protocol layer
//!
//! Message framing, JSON-RPC correlation, the `initialize` handshake and
//! document synchronization. Nothing in here knows about child processes.

pub mod capabilities;
pub mod documents;
pub mod framing;
pub mod jsonrpc_utils;
pub mod protocol;
pub mod rpc;
pub mod session;

#[cfg(test)]
pub mod testing;

pub use capabilities::{Feature, supports};
pub use documents::{DocumentAction, DocumentRegistry, OpenDocument};
pub use framing::{FramingError, LspCodec};
pub use protocol::{Message, Notification, Request, RequestId, Response, ResponseError};
pub use rpc::{RpcError, RpcSession};
pub use session::{ProtocolSession, SessionState};
