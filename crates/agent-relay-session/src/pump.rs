//! Controller side of a connection: handshake, then reader and writer pumps.
//!
//! The pumps work over any `Frame` stream/sink pair, so the same code
//! serves axum WebSockets and in-memory transports.

use std::{fmt::Display, sync::Arc, time::Duration};

use agent_relay_core::{
    CloseReason, DecodeError, Envelope, Frame, MessageType, Payload, SessionConfig, SessionState,
    payload::AuthPayload,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};

use crate::{registry::Registry, session::Session};

/// Handshake error. Every variant drops the connection without a reply.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Handshake timed out")]
    Timeout,
    #[error("Connection closed before auth")]
    Closed,
    #[error("Transport error during handshake: {0}")]
    Transport(String),
    #[error("Failed to read auth message: {0}")]
    Decode(#[from] DecodeError),
    #[error("Expected auth message, got: {0}")]
    UnexpectedType(MessageType),
    #[error("Auth message has an empty client id")]
    EmptyIdentity,
}

/// Wait for the first data frame and require it to be a valid `auth`.
///
/// Control frames before it are skipped.
///
/// # Errors
/// Any decode failure, wrong type, transport error or deadline expiry.
pub async fn handshake<St, E>(stream: &mut St, deadline: Duration) -> Result<AuthPayload, HandshakeError>
where
    St: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    let deadline = Instant::now() + deadline;
    let text = loop {
        let frame = match tokio::time::timeout_at(deadline, stream.next()).await {
            Err(_) => return Err(HandshakeError::Timeout),
            Ok(None) => return Err(HandshakeError::Closed),
            Ok(Some(Err(e))) => return Err(HandshakeError::Transport(e.to_string())),
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            Frame::Text(text) => break text,
            Frame::Close => return Err(HandshakeError::Closed),
            Frame::Ping(_) | Frame::Pong(_) => {}
        }
    };

    match Envelope::decode(&text)?.payload {
        Payload::Auth(auth) if auth.client_id.is_empty() => Err(HandshakeError::EmptyIdentity),
        Payload::Auth(auth) => Ok(auth),
        other => Err(HandshakeError::UnexpectedType(other.kind())),
    }
}

/// Run one connection to completion.
///
/// Authenticates, admits the session, runs both pumps, and releases the
/// session from the registry when either pump stops.
///
/// # Errors
/// Returns the handshake error if authentication fails; nothing is admitted.
pub async fn run_session<St, Si, E>(
    registry: Arc<Registry>,
    config: &SessionConfig,
    mut stream: St,
    sink: Si,
) -> Result<CloseReason, HandshakeError>
where
    St: Stream<Item = Result<Frame, E>> + Unpin + Send,
    E: Display,
    Si: Sink<Frame> + Unpin + Send + 'static,
    Si::Error: Display,
{
    let auth = match handshake(&mut stream, config.handshake_timeout).await {
        Ok(auth) => auth,
        Err(e) => {
            tracing::warn!("Rejecting connection: {e}");
            return Err(e);
        }
    };

    let (session, rx) = Session::new(&auth, config.outbound_capacity);
    registry.admit(Arc::clone(&session)).await;

    let writer = tokio::spawn(write_pump(
        Arc::clone(&session),
        rx,
        sink,
        config.ping_interval,
        config.write_timeout,
    ));

    let reason = read_pump(&registry, &session, &mut stream, config.idle_timeout).await;
    registry.release(&session, reason).await;

    match writer.await {
        Ok(0) => {}
        Ok(discarded) => {
            tracing::warn!(
                identity = %session.identity(),
                discarded,
                "Session closed with undelivered messages"
            );
        }
        Err(e) => tracing::error!(identity = %session.identity(), "Writer task failed: {e}"),
    }

    // The first close wins; a replaced or removed session reports that instead.
    Ok(match session.state() {
        SessionState::Closed(first) => first,
        _ => reason,
    })
}

async fn read_pump<St, E>(
    registry: &Registry,
    session: &Session,
    stream: &mut St,
    idle_timeout: Duration,
) -> CloseReason
where
    St: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            reason = session.closed() => return reason,
            next = tokio::time::timeout(idle_timeout, stream.next()) => next,
        };
        let frame = match next {
            Err(_) => {
                tracing::warn!(identity = %session.identity(), "No traffic within idle deadline");
                return CloseReason::IdleTimeout;
            }
            Ok(None) => return CloseReason::PeerClosed,
            Ok(Some(Err(e))) => {
                tracing::warn!(identity = %session.identity(), "WebSocket error: {e}");
                return CloseReason::TransportError;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        session.touch();
        match frame {
            Frame::Text(text) => handle_inbound(registry, session, &text),
            Frame::Close => return CloseReason::PeerClosed,
            Frame::Ping(_) | Frame::Pong(_) => {}
        }
    }
}

fn handle_inbound(registry: &Registry, session: &Session, text: &str) {
    let identity = session.identity();
    match Envelope::decode(text) {
        Ok(envelope) => match envelope.kind() {
            MessageType::Heartbeat => tracing::trace!(identity = %identity, "Heartbeat"),
            MessageType::Auth => tracing::debug!(identity = %identity, "Ignoring repeated auth"),
            _ => registry.publish(identity, envelope),
        },
        Err(e) if e.is_unknown_type() => {
            tracing::debug!(identity = %identity, "Ignoring message: {e}");
        }
        Err(e) => {
            tracing::warn!(identity = %identity, "Invalid message: {e}");
            // The reader never waits on the outbound queue.
            let reply = Envelope::error("bad_message", e.to_string(), e.correlation_id());
            if let Err(err) = session.try_enqueue(reply) {
                tracing::warn!(identity = %identity, "Dropping error reply: {err}");
            }
        }
    }
}

async fn send_with_deadline<Si>(sink: &mut Si, frame: Frame, deadline: Duration) -> Result<(), String>
where
    Si: Sink<Frame> + Unpin,
    Si::Error: Display,
{
    match tokio::time::timeout(deadline, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("write deadline exceeded".to_string()),
    }
}

/// Returns how many queued envelopes were never written.
async fn write_pump<Si>(
    session: Arc<Session>,
    mut rx: mpsc::Receiver<Envelope>,
    mut sink: Si,
    ping_interval: Duration,
    write_timeout: Duration,
) -> usize
where
    Si: Sink<Frame> + Unpin,
    Si::Error: Display,
{
    let mut probe = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let failure = loop {
        tokio::select! {
            biased;
            _ = session.closed() => break None,
            msg = rx.recv() => {
                let Some(envelope) = msg else { break None };
                let frame = match Frame::envelope(&envelope) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!(identity = %session.identity(), "Failed to serialize message: {e}");
                        continue;
                    }
                };
                if let Err(e) = send_with_deadline(&mut sink, frame, write_timeout).await {
                    tracing::warn!(identity = %session.identity(), "Write failed: {e}");
                    break Some(CloseReason::WriteFailed);
                }
            }
            _ = probe.tick() => {
                if let Err(e) = send_with_deadline(&mut sink, Frame::probe(), write_timeout).await {
                    tracing::warn!(identity = %session.identity(), "Probe failed: {e}");
                    break Some(CloseReason::ProbeFailed);
                }
            }
        }
    };

    // Reject further enqueues and wake any sender still waiting for room.
    rx.close();
    let mut discarded = 0;
    while rx.try_recv().is_ok() {
        discarded += 1;
    }
    match failure {
        Some(reason) => {
            session.close(reason);
        }
        None => {
            let _ = send_with_deadline(&mut sink, Frame::Close, write_timeout).await;
        }
    }
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
    discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{CommandGateway, GatewayError};
    use agent_relay_core::{ResponsePayload, payload::CommandPayload};
    use futures::channel::mpsc as fmpsc;
    use std::{
        convert::Infallible,
        pin::Pin,
        task::{Context, Poll},
    };
    use tokio::task::JoinHandle;

    /// Sink whose peer never accepts another write.
    struct StalledSink;

    impl Sink<Frame> for StalledSink {
        type Error = String;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Frame) -> Result<(), String> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), String>> {
            Poll::Ready(Ok(()))
        }
    }

    struct Peer {
        to_controller: fmpsc::UnboundedSender<Frame>,
        from_controller: fmpsc::UnboundedReceiver<Frame>,
        task: JoinHandle<Result<CloseReason, HandshakeError>>,
    }

    impl Peer {
        fn send(&self, envelope: &Envelope) {
            self.to_controller
                .unbounded_send(Frame::envelope(envelope).unwrap())
                .unwrap();
        }

        fn send_raw(&self, text: &str) {
            self.to_controller
                .unbounded_send(Frame::Text(text.to_string()))
                .unwrap();
        }

        /// Next data frame from the controller, skipping probes.
        async fn recv(&mut self) -> Envelope {
            loop {
                if let Frame::Text(text) = self.from_controller.next().await.unwrap() {
                    return Envelope::decode(text).unwrap();
                }
            }
        }
    }

    fn connect(registry: &Arc<Registry>, config: SessionConfig) -> Peer {
        let (to_controller, inbound) = fmpsc::unbounded::<Frame>();
        let (outbound, from_controller) = fmpsc::unbounded::<Frame>();
        let registry = Arc::clone(registry);
        let task = tokio::spawn(async move {
            run_session(
                registry,
                &config,
                inbound.map(Ok::<_, Infallible>),
                outbound,
            )
            .await
        });
        Peer {
            to_controller,
            from_controller,
            task,
        }
    }

    fn connect_with<Si>(
        registry: &Arc<Registry>,
        config: SessionConfig,
        sink: Si,
    ) -> (
        fmpsc::UnboundedSender<Frame>,
        JoinHandle<Result<CloseReason, HandshakeError>>,
    )
    where
        Si: Sink<Frame> + Unpin + Send + 'static,
        Si::Error: Display,
    {
        let (to_controller, inbound) = fmpsc::unbounded::<Frame>();
        let registry = Arc::clone(registry);
        let task = tokio::spawn(async move {
            run_session(registry, &config, inbound.map(Ok::<_, Infallible>), sink).await
        });
        (to_controller, task)
    }

    fn auth_envelope(client_id: &str) -> Envelope {
        Envelope::new(crate::session::auth(client_id, "h"))
    }

    async fn wait_for_admit(registry: &Registry, identity: &str) -> Arc<Session> {
        loop {
            if let Some(session) = registry.lookup(identity).await {
                return session;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_handshake_admits_identity() {
        let registry = Arc::new(Registry::new());
        let peer = connect(&registry, SessionConfig::default());
        peer.send(&auth_envelope("c1"));

        let session = wait_for_admit(&registry, "c1").await;
        assert_eq!(session.identity(), "c1");
        assert_eq!(session.metadata().username, "u");
    }

    #[tokio::test]
    async fn test_non_auth_first_frame_is_fatal_and_silent() {
        let registry = Arc::new(Registry::new());
        let mut peer = connect(&registry, SessionConfig::default());
        peer.send(&Envelope::new(CommandPayload::new("whoami")));

        let err = (&mut peer.task).await.unwrap().unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedType(MessageType::Command)));
        assert!(registry.is_empty().await);
        // Transport dropped without a reply.
        assert!(peer.from_controller.next().await.is_none());
    }

    #[tokio::test]
    async fn test_undecodable_first_frame_is_fatal() {
        let registry = Arc::new(Registry::new());
        let mut peer = connect(&registry, SessionConfig::default());
        peer.send_raw(r#"{"type":"auth","payload":{"hostname":"h"},"timestamp":1}"#);

        let err = (&mut peer.task).await.unwrap().unwrap_err();
        assert!(matches!(err, HandshakeError::Decode(_)));
        assert!(registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_never_admitted() {
        let registry = Arc::new(Registry::new());
        let peer = connect(&registry, SessionConfig::default());
        let err = peer.task.await.unwrap().unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_is_removed_and_queue_closed() {
        let registry = Arc::new(Registry::new());
        let peer = connect(&registry, SessionConfig::default());
        peer.send(&auth_envelope("c1"));
        let session = wait_for_admit(&registry, "c1").await;

        let started = Instant::now();
        let reason = peer.task.await.unwrap().unwrap();
        assert_eq!(reason, CloseReason::IdleTimeout);
        assert!(started.elapsed() >= Duration::from_secs(60));

        assert!(registry.lookup("c1").await.is_none());
        assert!(session.is_closed());
        assert!(
            session
                .enqueue(Envelope::new(CommandPayload::new("id")), Duration::from_secs(1))
                .await
                .is_err()
        );
        drop(peer.to_controller);
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_frame_refreshes_idle_deadline() {
        let registry = Arc::new(Registry::new());
        let peer = connect(&registry, SessionConfig::default());
        peer.send(&auth_envelope("c1"));
        wait_for_admit(&registry, "c1").await;

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(45)).await;
            peer.to_controller
                .unbounded_send(Frame::Pong(Vec::new()))
                .unwrap();
        }
        assert!(registry.lookup("c1").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_sends_probes() {
        let registry = Arc::new(Registry::new());
        let mut peer = connect(&registry, SessionConfig::default());
        peer.send(&auth_envelope("c1"));
        wait_for_admit(&registry, "c1").await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(peer.from_controller.next().await.unwrap(), Frame::probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_writer_fails_probe_and_unregisters() {
        let registry = Arc::new(Registry::new());
        let (to_controller, task) = connect_with(&registry, SessionConfig::default(), StalledSink);
        to_controller
            .unbounded_send(Frame::envelope(&auth_envelope("c1")).unwrap())
            .unwrap();
        wait_for_admit(&registry, "c1").await;

        let started = Instant::now();
        assert_eq!(task.await.unwrap().unwrap(), CloseReason::ProbeFailed);
        // Probe at 30s, then the 10s write deadline; well before the idle deadline.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(40));
        assert!(elapsed < Duration::from_secs(60));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_write_error_closes_session() {
        let registry = Arc::new(Registry::new());
        let gateway = CommandGateway::new(Arc::clone(&registry), &SessionConfig::default());
        let (sink, gone) = fmpsc::unbounded::<Frame>();
        drop(gone);
        let (to_controller, task) = connect_with(&registry, SessionConfig::default(), sink);
        to_controller
            .unbounded_send(Frame::envelope(&auth_envelope("c1")).unwrap())
            .unwrap();
        let session = wait_for_admit(&registry, "c1").await;

        gateway
            .send_command("c1", Envelope::new(CommandPayload::new("whoami")))
            .await
            .unwrap();
        assert_eq!(task.await.unwrap().unwrap(), CloseReason::WriteFailed);
        assert_eq!(session.state(), SessionState::Closed(CloseReason::WriteFailed));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_writer_counts_undelivered_on_close() {
        let (session, rx) = Session::new(&crate::session::auth("c1", "h"), 8);
        for i in 0..3 {
            session
                .try_enqueue(Envelope::new(CommandPayload::new(format!("cmd {i}"))))
                .unwrap();
        }
        session.close(CloseReason::Removed);

        let (sink, mut written) = fmpsc::unbounded::<Frame>();
        let discarded = write_pump(
            Arc::clone(&session),
            rx,
            sink,
            Duration::from_secs(30),
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(discarded, 3);
        assert_eq!(written.next().await, Some(Frame::Close));
        assert!(written.next().await.is_none());
    }

    #[tokio::test]
    async fn test_command_and_reply_round_trip() {
        let registry = Arc::new(Registry::new());
        let gateway = CommandGateway::new(Arc::clone(&registry), &SessionConfig::default());
        let mut peer = connect(&registry, SessionConfig::default());
        peer.send(&auth_envelope("c1"));
        wait_for_admit(&registry, "c1").await;
        let mut events = registry.subscribe();

        let request = tokio::spawn({
            let gateway = gateway.clone();
            async move {
                gateway
                    .request("c1", Envelope::new(CommandPayload::new("whoami")))
                    .await
            }
        });

        let command = peer.recv().await;
        assert_eq!(command.kind(), MessageType::Command);
        peer.send(&Envelope::response(ResponsePayload::ok("root\n"), command.id));

        let reply = request.await.unwrap().unwrap();
        assert_eq!(reply.payload, Payload::Response(ResponsePayload::ok("root\n")));
        assert!(matches!(
            events.recv().await.unwrap(),
            crate::RegistryEvent::Message { identity, envelope }
                if identity == "c1" && envelope.kind() == MessageType::Response
        ));
    }

    #[tokio::test]
    async fn test_unknown_type_ignored_and_session_survives() {
        let registry = Arc::new(Registry::new());
        let mut peer = connect(&registry, SessionConfig::default());
        peer.send(&auth_envelope("c1"));
        wait_for_admit(&registry, "c1").await;
        let mut events = registry.subscribe();

        peer.send_raw(r#"{"type":"bogus","payload":{},"timestamp":1}"#);
        peer.send(&Envelope::response(ResponsePayload::ok("later"), None));

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            crate::RegistryEvent::Message { envelope, .. }
                if envelope.payload == Payload::Response(ResponsePayload::ok("later"))
        ));
        assert!(registry.lookup("c1").await.is_some());
        tokio::task::yield_now().await;
        assert!(peer.from_controller.try_next().is_err());
    }

    #[tokio::test]
    async fn test_malformed_message_gets_error_reply() {
        let registry = Arc::new(Registry::new());
        let mut peer = connect(&registry, SessionConfig::default());
        peer.send(&auth_envelope("c1"));
        wait_for_admit(&registry, "c1").await;

        peer.send_raw("{not json");
        let reply = peer.recv().await;
        assert!(matches!(reply.payload, Payload::Error(ref e) if e.code == "bad_message"));
        assert!(registry.lookup("c1").await.is_some());
    }

    #[tokio::test]
    async fn test_invalid_payload_error_echoes_id() {
        let registry = Arc::new(Registry::new());
        let mut peer = connect(&registry, SessionConfig::default());
        peer.send(&auth_envelope("c1"));
        wait_for_admit(&registry, "c1").await;

        let id = uuid::Uuid::new_v4();
        peer.send_raw(&format!(
            r#"{{"type":"response","payload":{{"success":"yes"}},"timestamp":1,"id":"{id}"}}"#
        ));
        let reply = peer.recv().await;
        assert!(matches!(reply.payload, Payload::Error(ref e) if e.code == "bad_message"));
        assert_eq!(reply.id, Some(id));
    }

    #[tokio::test]
    async fn test_reconnect_with_same_identity_closes_old_connection() {
        let registry = Arc::new(Registry::new());
        let first = connect(&registry, SessionConfig::default());
        first.send(&auth_envelope("c1"));
        let old = wait_for_admit(&registry, "c1").await;

        let second = connect(&registry, SessionConfig::default());
        second.send(&auth_envelope("c1"));

        assert_eq!(first.task.await.unwrap().unwrap(), CloseReason::Replaced);
        let current = registry.lookup("c1").await.unwrap();
        assert_ne!(current.session_id(), old.session_id());
        assert!(!current.is_closed());
        drop(second);
    }

    #[tokio::test]
    async fn test_peer_close_unregisters() {
        let registry = Arc::new(Registry::new());
        let peer = connect(&registry, SessionConfig::default());
        peer.send(&auth_envelope("c1"));
        wait_for_admit(&registry, "c1").await;

        peer.to_controller.unbounded_send(Frame::Close).unwrap();
        assert_eq!(peer.task.await.unwrap().unwrap(), CloseReason::PeerClosed);
        assert!(registry.is_empty().await);

        let gateway = CommandGateway::new(Arc::clone(&registry), &SessionConfig::default());
        let err = gateway
            .send_command("c1", Envelope::new(CommandPayload::new("id")))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }
}
