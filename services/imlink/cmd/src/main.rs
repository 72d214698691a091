//! imlink client binary.
//!
//! Connects one session to an imlink server, sends text messages given on the
//! command line or read from stdin, and logs delivery, heartbeat and
//! connection events until Ctrl-C.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use imlink_session::{
    ConnectState, DeliveryObserver, DisconnectReason, FailureReason, HeartbeatMode,
    HeartbeatObserver, InboundMessage, MessageCategory, MessageObserver, NetworkCoordinator,
    SendOptions, SessionType, StateObserver, TcpTransport,
};
use imlink_wire::{ContentType, TlvBuilder, TlvValue};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

mod config;
mod logging;

use config::ClientConfig;

/// imlink instant-messaging client
#[derive(Parser, Debug)]
#[command(name = "imlink", version, about = "Long-lived TCP session client for imlink")]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, short, default_value = "imlink.yaml")]
    config: PathBuf,

    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(long)]
    port: Option<u16>,

    /// Session type: default, chat, media, signaling
    #[arg(long, value_parser = parse_session_type)]
    session_type: Option<SessionType>,

    /// Heartbeat mode: foreground, background, low_power, suspended
    #[arg(long)]
    heartbeat_mode: Option<String>,

    /// Connect timeout, e.g. 10s
    #[arg(long)]
    connect_timeout: Option<humantime::Duration>,

    /// Disable automatic reconnects
    #[arg(long)]
    no_reconnect: bool,

    /// Enable TLS
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate file (PEM format)
    #[arg(long, requires = "tls")]
    tls_ca: Option<PathBuf>,

    /// Server name for TLS SNI
    #[arg(long, requires = "tls")]
    tls_sni: Option<String>,

    /// Text to send once connected (repeatable)
    #[arg(long, short)]
    message: Vec<String>,

    /// Do not read messages from stdin
    #[arg(long)]
    no_stdin: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_session_type(value: &str) -> Result<SessionType, String> {
    SessionType::ALL
        .iter()
        .copied()
        .find(|t| t.to_string() == value.to_lowercase())
        .ok_or_else(|| format!("unknown session type '{value}'"))
}

impl Args {
    /// Command-line flags win over file and environment
    fn apply(&self, config: &mut ClientConfig) -> Result<()> {
        if let Some(host) = &self.host {
            config.client.host = host.clone();
        }
        if let Some(port) = self.port {
            config.client.port = port;
        }
        if let Some(session_type) = self.session_type {
            config.client.session_type = session_type;
        }
        if let Some(mode) = &self.heartbeat_mode {
            config.client.heartbeat_mode = config::parse_heartbeat_mode(mode)
                .with_context(|| format!("unknown heartbeat mode '{mode}'"))?;
        }
        if let Some(timeout) = self.connect_timeout {
            config.client.connect_timeout = timeout.into();
        }
        if self.no_reconnect {
            config.client.auto_reconnect = false;
        }
        if self.tls {
            config.client.tls.enabled = true;
        }
        if let Some(ca) = &self.tls_ca {
            config.client.tls.ca_file = ca.display().to_string();
        }
        if let Some(sni) = &self.tls_sni {
            config.client.tls.server_name = Some(sni.clone());
        }
        if config.client.tls.enabled && !cfg!(feature = "tls") {
            bail!("TLS requested but imlink was built without the `tls` feature");
        }
        Ok(())
    }
}

/// Logs every session notification
#[derive(Debug)]
struct ConsoleObserver;

impl StateObserver for ConsoleObserver {
    fn on_state_changed(
        &self,
        session_id: Uuid,
        session_type: SessionType,
        old: ConnectState,
        new: ConnectState,
    ) {
        component_info!(
            "state",
            session_id = %session_id,
            %session_type,
            %old,
            %new,
            "connection state changed"
        );
    }

    fn on_disconnected(&self, session_id: Uuid, reason: DisconnectReason) {
        component_warn!("state", session_id = %session_id, ?reason, "disconnected");
    }

    fn on_reconnect_exhausted(&self, session_id: Uuid, attempts: u32) {
        component_error!("state", session_id = %session_id, attempts, "giving up on reconnect");
    }
}

impl DeliveryObserver for ConsoleObserver {
    fn on_sent(&self, _session_id: Uuid, message_id: &str, sequence: u32) {
        component_debug!("delivery", message_id, seq = sequence, "sent");
    }

    fn on_acked(&self, _session_id: Uuid, message_id: &str, rtt: Option<Duration>) {
        component_info!("delivery", message_id, ?rtt, "delivered");
    }

    fn on_retried(&self, _session_id: Uuid, message_id: &str, attempt: u32) {
        component_warn!("delivery", message_id, attempt, "retransmitting");
    }

    fn on_failed(&self, _session_id: Uuid, message_id: &str, reason: &FailureReason) {
        component_error!("delivery", message_id, ?reason, "delivery failed");
    }
}

impl HeartbeatObserver for ConsoleObserver {
    fn on_heartbeat_acked(&self, _session_id: Uuid, rtt: Duration) {
        component_debug!("heartbeat", ?rtt, "heartbeat acknowledged");
    }

    fn on_heartbeat_timeout(&self, session_id: Uuid, consecutive_losses: u32) {
        component_warn!(
            "heartbeat",
            session_id = %session_id,
            consecutive_losses,
            "heartbeat lost"
        );
    }

    fn on_sequence_warning(&self, _session_id: Uuid, category: MessageCategory, counter: u32) {
        component_warn!("heartbeat", ?category, counter, "sequence counter nearing reset");
    }
}

impl MessageObserver for ConsoleObserver {
    fn on_message(&self, message: &InboundMessage) {
        let text = message
            .tlv
            .as_ref()
            .and_then(|fields| fields.get(&ContentType::Text.tag()))
            .and_then(|value| match value {
                TlvValue::Bytes(bytes) => std::str::from_utf8(bytes).ok().map(str::to_string),
                _ => None,
            })
            .unwrap_or_else(|| format!("<{} bytes>", message.payload.len()));
        component_info!(
            "inbound",
            seq = message.sequence,
            session_type = %message.session_type,
            "{}",
            text
        );
    }
}

async fn send_text(
    coordinator: &NetworkCoordinator,
    session_type: SessionType,
    text: &str,
) -> Result<()> {
    let body: Bytes = TlvBuilder::new()
        .text(ContentType::Text, text)
        .build()
        .context("encoding message")?;
    let (message_id, sequence) = coordinator
        .send_through_type(session_type, body, SendOptions::default())
        .await
        .context("sending message")?;
    component_debug!("cli", message_id = %message_id, seq = sequence, "queued");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);

    let mut config = ClientConfig::load_from_file(&args.config)?;
    args.apply(&mut config)?;
    if args.print_config {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let coordinator =
        NetworkCoordinator::start(config.coordinator_config()?, Arc::new(TcpTransport)).await;
    let observer = Arc::new(ConsoleObserver);
    coordinator.add_state_observer(observer.clone());
    coordinator.add_delivery_observer(observer.clone());
    coordinator.add_heartbeat_observer(observer.clone());
    coordinator.add_message_observer(observer);

    let session_type = config.client.session_type;
    let (host, port) = (config.client.host.clone(), config.client.port);
    match coordinator.connect(session_type, &host, port).await {
        Ok(id) => component_info!(
            "cli",
            session_id = %id,
            %session_type,
            "connected to {}:{}",
            host,
            port
        ),
        Err(e) => component_warn!("cli", error = %e, "initial connect to {}:{} failed", host, port),
    }
    coordinator.set_heartbeat_mode(config.client.heartbeat_mode).await;

    for text in &args.message {
        if let Err(e) = send_text(&coordinator, session_type, text).await {
            component_error!("cli", error = %e, "message not sent");
        }
    }

    let mut stdin_open = !args.no_stdin;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                component_info!("cli", "Received Ctrl-C, shutting down");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    if let Err(e) = send_text(&coordinator, session_type, line.trim()).await {
                        component_error!("cli", error = %e, "message not sent");
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    component_warn!("cli", error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
        }
    }

    coordinator.shutdown().await;
    Ok(())
}
