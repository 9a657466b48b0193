//! Session registry and command routing for agent relay.
//!
//! Provides:
//! - `Session` - One authenticated agent connection and its outbound queue
//! - `Registry` - Identity-keyed table of live sessions, with events
//! - `CommandGateway` - Bounded-wait command delivery to a named agent
//! - `run_session` - Handshake plus reader/writer pumps over any `Frame` transport

pub mod gateway;
pub mod pending;
pub mod pump;
pub mod registry;
pub mod session;

pub use gateway::{CommandGateway, GatewayError};
pub use pending::PendingReplies;
pub use pump::{HandshakeError, handshake, run_session};
pub use registry::{Registry, RegistryEvent};
pub use session::{EnqueueError, Session};
