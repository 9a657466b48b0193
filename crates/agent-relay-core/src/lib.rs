//! Core types for the agent relay controller and agents.
//!
//! This crate provides the pieces every other crate speaks:
//! - `Envelope` - Typed, timestamped wire message and its codec
//! - `Payload` - Per-type payload schemas
//! - `Frame` - Transport-neutral message unit
//! - `SessionConfig` / `ControllerConfig` - Timers, capacities and addresses
//! - `AgentMetadata` / `SessionSnapshot` - Session identity data

pub mod config;
pub mod envelope;
pub mod frame;
pub mod metadata;
pub mod payload;

pub use config::{ConfigError, ControllerConfig, SessionConfig};
pub use envelope::{CorrelationId, DecodeError, Envelope, MessageType, now_unix};
pub use frame::Frame;
pub use metadata::{AgentMetadata, CloseReason, SessionSnapshot, SessionState};
pub use payload::{AuthPayload, ErrorPayload, Payload, ResponsePayload};
