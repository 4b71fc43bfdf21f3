//! Worker protocol
//!
//! JSON-RPC 2.0, one message per line, over any byte stream pair. In
//! practice the CLI spawns `storyshot-worker` and talks over its stdio.
//!
//! ```text
//! RpcClient ── Transport ══ stdin/stdout ══ Transport ── WorkerService
//!                                                          ↓
//!                                       catalog → filter → Engine → indexes
//! ```

pub mod client;
pub mod messages;
pub mod server;
pub mod transport;

pub use client::{ClientConfig, ClientState, RpcClient, WorkerCommand};
pub use messages::{DecodeError, Message, RpcError, JSONRPC_VERSION};
pub use server::{
    CleanupReports, Collaborators, ConfiguredCollaborators, WorkerPhase, WorkerService, WorkerStatus,
    WORKER_VERSION,
};
pub use transport::{
    Handler, ListenerId, Notification, Transport, TransportConfig, TransportError, TransportResult, ANY_METHOD,
};
