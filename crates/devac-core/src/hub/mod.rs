//! Central hub: single-writer registry shared over a local socket.

pub mod client;
pub mod protocol;
pub mod registry;
pub mod server;

pub use client::HubClient;
pub use protocol::{HubMethod, RpcError, RpcRequest, RpcResponse};
pub use registry::{
    CentralHub, CrossRepoEdge, Diagnostic, DiagnosticsFilter, DiagnosticsSummary, RepoInfo, RepoStatus,
    Severity,
};
pub use server::{probe_socket, HubHandle, HubServer};
