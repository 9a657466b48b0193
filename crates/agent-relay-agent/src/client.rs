//! Agent connection to the controller.

use std::{fmt::Display, future::Future, sync::Arc, time::Duration};

use agent_relay_core::{Envelope, Frame, Payload, payload::AuthPayload};
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use thiserror::Error;
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

use crate::{capability::CapabilityTable, dispatcher::Dispatcher};

/// Client error.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Connection error: {0}")]
    Transport(String),
}

/// Who this agent says it is at handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub client_id: String,
    pub hostname: String,
    pub username: String,
    pub os: String,
}

impl AgentIdentity {
    /// Fresh client id plus host details from the environment.
    #[must_use]
    pub fn discover() -> Self {
        let hostname = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .ok()
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|s| s.trim().to_string())
            })
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();

        Self {
            client_id: Uuid::new_v4().to_string(),
            hostname,
            username,
            os: std::env::consts::OS.to_string(),
        }
    }

    #[must_use]
    pub fn auth_payload(&self) -> AuthPayload {
        AuthPayload {
            client_id: self.client_id.clone(),
            hostname: self.hostname.clone(),
            username: self.username.clone(),
            os: self.os.clone(),
        }
    }
}

/// Agent connection settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Controller WebSocket URL, e.g. `ws://controller:8080/ws`.
    pub server_url: String,
    pub outbound_capacity: usize,
    pub heartbeat_interval: Duration,
    pub write_timeout: Duration,
    /// Wait after a failed dial.
    pub retry_delay: Duration,
    /// Wait after an established connection drops.
    pub reconnect_delay: Duration,
}

impl AgentConfig {
    #[must_use]
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            outbound_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close => Message::Close(None),
    }
}

fn from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text)),
        Message::Binary(data) => String::from_utf8(data).ok().map(Frame::Text),
        Message::Ping(data) => Some(Frame::Ping(data)),
        Message::Pong(data) => Some(Frame::Pong(data)),
        Message::Close(_) => Some(Frame::Close),
        Message::Frame(_) => None,
    }
}

/// Agent that keeps one connection to the controller alive.
pub struct AgentClient {
    config: AgentConfig,
    identity: AgentIdentity,
    table: Arc<CapabilityTable>,
}

impl AgentClient {
    #[must_use]
    pub fn new(config: AgentConfig, identity: AgentIdentity, table: CapabilityTable) -> Self {
        Self {
            config,
            identity,
            table: Arc::new(table),
        }
    }

    #[must_use]
    pub const fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    /// Dial the controller and serve one connection until it ends.
    ///
    /// # Errors
    /// `Connect` if dialing fails, otherwise whatever ended the connection.
    pub async fn run_once(&self) -> Result<(), ClientError> {
        let (ws, _) = connect_async(self.config.server_url.as_str())
            .await
            .map_err(ClientError::Connect)?;
        tracing::info!(
            server = %self.config.server_url,
            id = %self.identity.client_id,
            "Connected to server"
        );

        let (sink, stream) = ws.split();
        let sink = sink.with(|frame: Frame| {
            future::ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(to_message(frame)))
        });
        let stream = stream.filter_map(|msg| future::ready(msg.map(from_message).transpose()));
        self.run_connection(stream, sink).await
    }

    /// Authenticate and serve an established connection.
    ///
    /// Sends `auth`, then runs a writer task (outbound queue plus heartbeats)
    /// alongside the reader loop that feeds the dispatcher.
    ///
    /// # Errors
    /// Returns error if a read or write fails. A clean close returns `Ok`.
    pub async fn run_connection<St, Si, E>(&self, mut stream: St, mut sink: Si) -> Result<(), ClientError>
    where
        St: Stream<Item = Result<Frame, E>> + Unpin,
        E: Display,
        Si: Sink<Frame> + Unpin + Send + 'static,
        Si::Error: Display,
    {
        let auth = Envelope::new(self.identity.auth_payload());
        sink.send(Frame::envelope(&auth)?)
            .await
            .map_err(|e| ClientError::Transport(format!("failed to send auth: {e}")))?;

        let (tx, rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let dispatcher = Dispatcher::new(Arc::clone(&self.table), tx);
        let mut writer = tokio::spawn(write_loop(
            rx,
            sink,
            self.identity.auth_payload(),
            self.config.heartbeat_interval,
            self.config.write_timeout,
        ));

        let result = loop {
            tokio::select! {
                res = &mut writer => {
                    break match res {
                        Ok(res) => res,
                        Err(e) => Err(ClientError::Transport(e.to_string())),
                    };
                }
                next = stream.next() => match next {
                    None | Some(Ok(Frame::Close)) => break Ok(()),
                    Some(Err(e)) => break Err(ClientError::Transport(e.to_string())),
                    Some(Ok(Frame::Text(text))) => {
                        dispatcher.handle_text(&text);
                    }
                    Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => {}
                },
            }
        };

        writer.abort();
        result
    }

    /// Keep reconnecting until `shutdown` resolves.
    pub async fn run_forever<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let delay = tokio::select! {
                () = &mut shutdown => return,
                res = self.run_once() => match res {
                    Err(ClientError::Connect(e)) => {
                        tracing::warn!(
                            "Failed to connect: {e}. Retrying in {}s",
                            self.config.retry_delay.as_secs()
                        );
                        self.config.retry_delay
                    }
                    Err(e) => {
                        tracing::warn!("Client error: {e}. Reconnecting...");
                        self.config.reconnect_delay
                    }
                    Ok(()) => {
                        tracing::info!("Connection closed by server. Reconnecting...");
                        self.config.reconnect_delay
                    }
                },
            };
            tokio::select! {
                () = &mut shutdown => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

async fn send_frame<Si>(sink: &mut Si, frame: Frame, deadline: Duration) -> Result<(), ClientError>
where
    Si: Sink<Frame> + Unpin,
    Si::Error: Display,
{
    match tokio::time::timeout(deadline, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ClientError::Transport(e.to_string())),
        Err(_) => Err(ClientError::Transport("write deadline exceeded".to_string())),
    }
}

async fn write_loop<Si>(
    mut rx: mpsc::Receiver<Envelope>,
    mut sink: Si,
    heartbeat: AuthPayload,
    interval: Duration,
    write_timeout: Duration,
) -> Result<(), ClientError>
where
    Si: Sink<Frame> + Unpin,
    Si::Error: Display,
{
    let heartbeat = serde_json::to_value(heartbeat)?;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let envelope = tokio::select! {
            msg = rx.recv() => match msg {
                Some(envelope) => envelope,
                None => return Ok(()),
            },
            _ = ticker.tick() => Envelope::new(Payload::Heartbeat(heartbeat.clone())),
        };
        send_frame(&mut sink, Frame::envelope(&envelope)?, write_timeout).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::handler_fn;
    use agent_relay_core::{MessageType, ResponsePayload, payload::CommandPayload};
    use futures::channel::mpsc as fmpsc;
    use std::convert::Infallible;

    fn identity() -> AgentIdentity {
        AgentIdentity {
            client_id: "c1".to_string(),
            hostname: "h".to_string(),
            username: "u".to_string(),
            os: "linux".to_string(),
        }
    }

    fn client() -> AgentClient {
        let table = CapabilityTable::new().with(
            MessageType::Command,
            handler_fn(|request| async move {
                match request {
                    Payload::Command(c) if c.command == "whoami" => Ok("root\n".to_string()),
                    _ => Err(crate::CapabilityError::new("unexpected command")),
                }
            }),
        );
        AgentClient::new(AgentConfig::new("ws://unused/ws"), identity(), table)
    }

    async fn next_envelope(rx: &mut fmpsc::UnboundedReceiver<Frame>) -> Envelope {
        loop {
            if let Frame::Text(text) = rx.next().await.unwrap() {
                return Envelope::decode(text).unwrap();
            }
        }
    }

    #[test]
    fn test_discovered_identity_is_unique() {
        let a = AgentIdentity::discover();
        let b = AgentIdentity::discover();
        assert_ne!(a.client_id, b.client_id);
        assert_eq!(a.os, std::env::consts::OS);
        assert!(!a.hostname.is_empty());
    }

    #[tokio::test]
    async fn test_auth_then_command_round_trip() {
        let (to_agent, inbound) = fmpsc::unbounded::<Frame>();
        let (outbound, mut from_agent) = fmpsc::unbounded::<Frame>();
        let client = client();

        let run = tokio::spawn(async move {
            client
                .run_connection(inbound.map(Ok::<_, Infallible>), outbound)
                .await
        });

        let auth = next_envelope(&mut from_agent).await;
        assert_eq!(auth.payload, Payload::Auth(identity().auth_payload()));

        to_agent
            .unbounded_send(Frame::Text(r#"{"type":"bogus","payload":{},"timestamp":1}"#.into()))
            .unwrap();
        let id = Uuid::new_v4();
        to_agent
            .unbounded_send(
                Frame::envelope(&Envelope::new(CommandPayload::new("whoami")).with_id(id)).unwrap(),
            )
            .unwrap();

        let reply = next_envelope(&mut from_agent).await;
        assert_eq!(reply.id, Some(id));
        assert_eq!(reply.payload, Payload::Response(ResponsePayload::ok("root\n")));

        to_agent.unbounded_send(Frame::Close).unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_are_sent() {
        let (_to_agent, inbound) = fmpsc::unbounded::<Frame>();
        let (outbound, mut from_agent) = fmpsc::unbounded::<Frame>();
        let client = client();
        tokio::spawn(async move {
            client
                .run_connection(inbound.map(Ok::<_, Infallible>), outbound)
                .await
        });

        assert_eq!(next_envelope(&mut from_agent).await.kind(), MessageType::Auth);
        let heartbeat = next_envelope(&mut from_agent).await;
        assert_eq!(heartbeat.kind(), MessageType::Heartbeat);
    }

    #[tokio::test]
    async fn test_write_failure_ends_connection() {
        let (_to_agent, inbound) = fmpsc::unbounded::<Frame>();
        let (outbound, from_agent) = fmpsc::unbounded::<Frame>();
        let client = client();
        let run = tokio::spawn(async move {
            client
                .run_connection(inbound.map(Ok::<_, Infallible>), outbound)
                .await
        });
        drop(from_agent);
        // Auth write fails once the controller side is gone.
        assert!(matches!(run.await.unwrap(), Err(ClientError::Transport(_))));
    }

    #[tokio::test]
    async fn test_run_forever_stops_on_shutdown() {
        let client = AgentClient::new(
            AgentConfig::new("ws://127.0.0.1:9/ws"),
            identity(),
            CapabilityTable::new(),
        );
        tokio::time::timeout(Duration::from_secs(5), client.run_forever(async {}))
            .await
            .unwrap();
    }
}
