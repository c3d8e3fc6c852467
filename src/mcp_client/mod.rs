//! Tool client: JSON-RPC tool servers reached over stdio or a stream channel.
//!
//! This module handles:
//! - Spawning stdio server processes and opening stream channels
//! - JSON-RPC 2.0 communication over both wire shapes
//! - Tool discovery and aggregation into a copy-on-write snapshot
//! - Tool call resolution, validation and dispatch
//! - Server lifecycle (lazy start, restart with backoff, graceful shutdown)
//!
//! The agent loop dispatches through a per-task `ToolSession`.

pub mod client;
pub mod errors;
pub mod lifecycle;
pub mod registry;
pub mod stream;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use client::{McpClient, ToolSession};
pub use errors::{DiscoveryError, McpError};
pub use registry::{ToolRegistry, ToolResolution, ToolSnapshot};
pub use types::{
    McpServersConfig, ServerConfig, ToolCall, ToolDescriptor, ToolResult, ToolStatus,
    TransportKind,
};
