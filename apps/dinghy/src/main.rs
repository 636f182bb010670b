//! Native peer for a cove relay.
//!
//! Connects to the relay's signaling endpoint, negotiates a session as the
//! impolite (initiating) side, then bridges stdin lines onto the relayed
//! data channel and prints what other peers send back.

use anyhow::{Context, Result};
use clap::Parser;
use engine_webrtc::{WebRtcEngine, WebRtcEngineConfig};
use futures_util::{SinkExt, StreamExt};
use negotiation::{EngineEvent, Negotiator, Politeness, TransportEngine};
use signal_proto::{ControlMessage, Decoded};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "dinghy", about = "Native peer for a cove relay")]
struct Cli {
    /// Signaling endpoint, e.g. ws://localhost:8080/ws
    url: String,
    /// STUN server URLs, comma separated (defaults to public Google STUN)
    #[arg(long)]
    stun: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let (socket, _response) = connect_async(&cli.url)
        .await
        .context("connecting to relay")?;
    info!(url = %cli.url, "connected to relay");
    let (mut sink, mut stream) = socket.split();

    let mut engine_config = WebRtcEngineConfig {
        initiator: true,
        ..Default::default()
    };
    if let Some(stun) = cli.stun {
        engine_config.ice_servers = stun
            .split(',')
            .map(|server| server.trim().to_string())
            .filter(|server| !server.is_empty())
            .collect();
    }
    let (engine, mut engine_events) = WebRtcEngine::connect(engine_config)
        .await
        .map_err(|err| anyhow::anyhow!("building transport engine: {err}"))?;

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ControlMessage>();
    let mut negotiator = Negotiator::new("dinghy", Politeness::Impolite, engine.clone(), outbound_tx);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else { break };
                let json = message.encode().context("encoding control message")?;
                sink.send(Message::Text(json.into()))
                    .await
                    .context("sending control message")?;
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => handle_frame(text.as_str(), &mut negotiator).await,
                Some(Ok(Message::Close(_))) | None => {
                    info!("relay closed the channel");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "signaling channel error");
                    break;
                }
            },
            event = engine_events.recv() => match event {
                Some(EngineEvent::LocalCandidate(candidate)) => {
                    negotiator.announce_local_candidate(candidate);
                }
                Some(EngineEvent::NegotiationNeeded) => negotiator.negotiation_needed().await,
                Some(EngineEvent::DataMessage(payload)) => {
                    match std::str::from_utf8(&payload) {
                        Ok(text) => println!("{text}"),
                        Err(_) => info!(bytes = payload.len(), "received binary payload"),
                    }
                }
                Some(EngineEvent::RemoteTrack(track)) => {
                    info!(
                        track = %track.spec.id,
                        mime = %track.spec.mime_type,
                        "remote media track started"
                    );
                }
                None => {
                    warn!("engine stopped");
                    break;
                }
            },
            line = stdin.next_line() => match line {
                Ok(Some(line)) => {
                    if !engine.data_ready() {
                        debug!("data channel not open yet, dropping line");
                        continue;
                    }
                    if let Err(err) = engine.send_data(line.into_bytes().into()).await {
                        warn!(error = %err, "sending data failed");
                    }
                }
                Ok(None) => {
                    info!("stdin closed");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "reading stdin failed");
                    break;
                }
            },
        }
    }

    engine.close().await;
    Ok(())
}

async fn handle_frame(raw: &str, negotiator: &mut Negotiator) {
    match ControlMessage::decode(raw) {
        Ok(Decoded::Control(ControlMessage::SessionDescription { description })) => {
            negotiator.receive_remote_description(description).await;
        }
        Ok(Decoded::Control(ControlMessage::IceCandidate { candidate })) => {
            negotiator.receive_remote_candidate(candidate).await;
        }
        Ok(Decoded::Control(ControlMessage::Error { message })) => {
            warn!(message = %message, "relay reported an error");
        }
        Ok(Decoded::Unknown(tag)) => {
            debug!(message_type = %tag, "ignoring message with unknown type");
        }
        Err(err) => warn!(error = %err, "malformed message from relay"),
    }
}
