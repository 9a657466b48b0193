//! Example controller that accepts agents and logs what they do.
//!
//! Run with: cargo run -p controller-demo
//!
//! Listens on `AGENT_RELAY_ADDR` (default `0.0.0.0:8080`) and serves agents
//! at `AGENT_RELAY_WS_PATH` (default `/ws`). Every agent that connects is
//! asked for `whoami` once.

use std::sync::Arc;

use agent_relay_core::{ControllerConfig, Envelope, Payload, payload::CommandPayload};
use agent_relay_session::{CommandGateway, Registry, RegistryEvent};
use agent_relay_transport::{ControllerState, serve};
use anyhow::Context;
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ControllerConfig::from_env().context("invalid controller configuration")?;
    let registry = Arc::new(Registry::new());
    let gateway = CommandGateway::new(Arc::clone(&registry), &config.session);

    tokio::spawn(log_events(gateway));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!("Agents connect to ws://{}{}", config.listen_addr, config.ws_path);

    let state = ControllerState::new(registry, config.session.clone());
    serve(listener, state, &config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {e}");
        }
    })
    .await?;

    Ok(())
}

/// Stand-in for a real front-end: print the registry's event feed.
async fn log_events(gateway: CommandGateway) {
    let mut events = std::pin::pin!(gateway.registry().events());
    while let Some(event) = events.next().await {
        match event {
            RegistryEvent::Connected(snapshot) => {
                tracing::info!(
                    identity = %snapshot.identity,
                    hostname = %snapshot.metadata.hostname,
                    username = %snapshot.metadata.username,
                    platform = %snapshot.metadata.platform,
                    "Agent connected"
                );
                tokio::spawn(whoami(gateway.clone(), snapshot.identity));
            }
            RegistryEvent::Disconnected {
                identity, reason, ..
            } => {
                tracing::info!(%identity, %reason, "Agent disconnected");
            }
            RegistryEvent::Message { identity, envelope } => {
                tracing::debug!(%identity, kind = %envelope.kind(), "Agent message");
            }
        }
    }
}

async fn whoami(gateway: CommandGateway, identity: String) {
    let request = Envelope::new(CommandPayload::new("whoami"));
    match gateway.request(&identity, request).await {
        Ok(Envelope {
            payload: Payload::Response(resp),
            ..
        }) if resp.success => {
            let output = resp.data.unwrap_or_default();
            tracing::info!(%identity, "whoami: {}", output.trim());
        }
        Ok(reply) => tracing::warn!(%identity, kind = %reply.kind(), "whoami failed: {reply:?}"),
        Err(e) => tracing::warn!(%identity, "whoami failed: {e}"),
    }
}
