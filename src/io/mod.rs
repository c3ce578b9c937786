//! I/O layer - process management and transport
//!
//! - **Transport**: framed bidirectional message exchange over byte streams
//! - **Process**: language server process lifecycle with stdio integration
//!
//! Neither knows anything about JSON-RPC; the protocol layer sits on top.

pub mod process;
pub mod transport;

pub use process::{
    ChildProcessManager, ProcessError, ProcessExitEvent, ProcessExitHandler, ProcessManager,
    ProcessState, StderrMonitor, StopMode,
};
pub use transport::{StdioTransport, TransportError, TransportReceiver, TransportSender};
