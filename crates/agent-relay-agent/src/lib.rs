//! Agent side of agent relay.
//!
//! Provides:
//! - `CapabilityHandler` trait and the `CapabilityTable` keyed by message type
//! - `Dispatcher` - Routes inbound envelopes to handlers and queues replies
//! - `AgentClient` - Connects, authenticates, heartbeats and reconnects

pub mod capability;
pub mod client;
pub mod dispatcher;

pub use capability::{CapabilityError, CapabilityHandler, CapabilityTable, FnHandler, handler_fn};
pub use client::{AgentClient, AgentConfig, AgentIdentity, ClientError};
pub use dispatcher::Dispatcher;
