//! Routes inbound envelopes to capability handlers.

use std::sync::Arc;

use agent_relay_core::{Envelope, ResponsePayload};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::capability::CapabilityTable;

/// Agent-side demultiplexer.
///
/// Each request runs on its own task, so a slow handler never holds up the
/// next inbound frame. Replies go onto the connection's outbound queue.
#[derive(Clone)]
pub struct Dispatcher {
    table: Arc<CapabilityTable>,
    outbound: mpsc::Sender<Envelope>,
}

impl Dispatcher {
    #[must_use]
    pub const fn new(table: Arc<CapabilityTable>, outbound: mpsc::Sender<Envelope>) -> Self {
        Self { table, outbound }
    }

    /// Decode and dispatch one inbound text frame.
    ///
    /// Unknown types are logged and dropped without a reply; other decode
    /// failures are answered with an `error` envelope.
    pub fn handle_text(&self, text: &str) -> Option<JoinHandle<()>> {
        match Envelope::decode(text) {
            Ok(envelope) => self.dispatch(envelope),
            Err(e) if e.is_unknown_type() => {
                tracing::debug!("Ignoring message: {e}");
                None
            }
            Err(e) => {
                tracing::warn!("Invalid message: {e}");
                let reply = Envelope::error("bad_message", e.to_string(), e.correlation_id());
                if let Err(err) = self.outbound.try_send(reply) {
                    tracing::warn!("Dropping error reply: {err}");
                }
                None
            }
        }
    }

    /// Run the handler for `envelope` on a new task.
    ///
    /// Returns `None` for envelopes that are not capability requests.
    pub fn dispatch(&self, envelope: Envelope) -> Option<JoinHandle<()>> {
        let kind = envelope.kind();
        if !kind.is_capability() {
            tracing::trace!(%kind, "Not a request, nothing to dispatch");
            return None;
        }

        let table = Arc::clone(&self.table);
        let outbound = self.outbound.clone();
        Some(tokio::spawn(async move {
            let reply_to = envelope.id;
            tracing::info!(%kind, "Executing request");
            let result = match table.execute(envelope.payload).await {
                Ok(data) => ResponsePayload::ok(data),
                Err(e) => {
                    let report = e.report();
                    tracing::warn!(%kind, "Error: {report}");
                    ResponsePayload::failure(report)
                }
            };
            if outbound.send(Envelope::response(result, reply_to)).await.is_err() {
                tracing::debug!(%kind, "Connection closed before reply could be sent");
            }
        }))
    }
}
