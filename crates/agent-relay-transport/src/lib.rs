//! Network transport for the agent relay controller.
//!
//! Provides:
//! - WebSocket upgrade route feeding `run_session` (feature: websocket)
//! - Liveness endpoint for orchestration health checks
//! - `serve` with graceful shutdown that drains the registry

#[cfg(feature = "websocket")]
pub mod frame;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "websocket")]
pub use websocket::{ControllerState, ServeError, create_router, serve};
