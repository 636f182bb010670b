//! Per-peer signaling channel handling.
//!
//! Each WebSocket connection is one session: it owns one transport engine,
//! one polite negotiator, and one driver loop. The loop is the only place
//! that touches the negotiator, so inbound control messages and engine
//! events for a session are applied strictly one at a time, in order.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use engine_webrtc::{WebRtcEngine, WebRtcEngineConfig};
use futures_util::{SinkExt, StreamExt};
use negotiation::{EngineEvent, Negotiator, Politeness};
use signal_proto::{ControlMessage, Decoded};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::relay::{RelayCoordinator, SessionId};

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<RelayCoordinator>,
    pub config: Arc<Config>,
}

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_id: SessionId = Uuid::new_v4().to_string();
    info!(session = %session_id, "peer connected");

    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ControlMessage>();

    // Writer task: serialize outbound control messages onto the socket.
    let writer_session = session_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            match message.encode() {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(session = %writer_session, error = %err, "encoding control message failed");
                }
            }
        }
        debug!(session = %writer_session, "writer task ended");
    });

    let engine_config = WebRtcEngineConfig {
        ice_servers: state.config.ice_servers.clone(),
        initiator: false,
    };
    let (engine, mut engine_events) = match WebRtcEngine::connect(engine_config).await {
        Ok(built) => built,
        Err(err) => {
            error!(session = %session_id, error = %err, "building transport engine failed");
            let _ = outbound_tx.send(ControlMessage::error("transport engine unavailable"));
            return;
        }
    };

    state.relay.register(session_id.clone(), engine.clone());
    let mut negotiator = Negotiator::new(
        session_id.clone(),
        Politeness::Polite,
        engine,
        outbound_tx.clone(),
    );

    loop {
        tokio::select! {
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(&session_id, &text, &mut negotiator, &outbound_tx).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    // Some clients put JSON control messages in binary frames.
                    match String::from_utf8(data) {
                        Ok(text) => handle_frame(&session_id, &text, &mut negotiator, &outbound_tx).await,
                        Err(_) => debug!(session = %session_id, "ignoring non-utf8 binary frame"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(session = %session_id, "signaling channel closed");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(session = %session_id, error = %err, "signaling channel error");
                    break;
                }
            },
            event = engine_events.recv() => match event {
                Some(event) => {
                    handle_engine_event(&session_id, event, &mut negotiator, &state.relay).await;
                }
                None => {
                    debug!(session = %session_id, "engine event stream ended");
                    break;
                }
            },
        }
    }

    // Channel gone: the session leaves the relay before anything else can
    // target it, and its engine is released with it.
    state.relay.unregister(&session_id).await;
    writer.abort();
    info!(session = %session_id, "peer disconnected");
}

async fn handle_frame(
    session_id: &SessionId,
    raw: &str,
    negotiator: &mut Negotiator,
    outbound: &mpsc::UnboundedSender<ControlMessage>,
) {
    match ControlMessage::decode(raw) {
        Ok(Decoded::Control(message)) => dispatch_control(session_id, message, negotiator).await,
        Ok(Decoded::Unknown(tag)) => {
            info!(session = %session_id, message_type = %tag, "ignoring control message with unknown type");
        }
        Err(err) => {
            warn!(session = %session_id, error = %err, "malformed control message");
            let _ = outbound.send(ControlMessage::error(format!(
                "invalid control message: {err}"
            )));
        }
    }
}

async fn dispatch_control(
    session_id: &SessionId,
    message: ControlMessage,
    negotiator: &mut Negotiator,
) {
    match message {
        ControlMessage::SessionDescription { description } => {
            negotiator.receive_remote_description(description).await;
        }
        ControlMessage::IceCandidate { candidate } => {
            negotiator.receive_remote_candidate(candidate).await;
        }
        ControlMessage::Error { message } => {
            warn!(session = %session_id, message = %message, "peer reported an error");
        }
    }
}

async fn handle_engine_event(
    session_id: &SessionId,
    event: EngineEvent,
    negotiator: &mut Negotiator,
    relay: &Arc<RelayCoordinator>,
) {
    match event {
        EngineEvent::LocalCandidate(candidate) => negotiator.announce_local_candidate(candidate),
        EngineEvent::NegotiationNeeded => negotiator.negotiation_needed().await,
        EngineEvent::DataMessage(payload) => {
            debug!(session = %session_id, bytes = payload.len(), "relaying data payload");
            relay.broadcast_data(session_id, payload).await;
        }
        EngineEvent::RemoteTrack(track) => relay.relay_track(session_id.clone(), track),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEngine;
    use signal_proto::DescriptionRole;

    fn session() -> (
        SessionId,
        Arc<TestEngine>,
        Negotiator,
        mpsc::UnboundedSender<ControlMessage>,
        mpsc::UnboundedReceiver<ControlMessage>,
    ) {
        let session_id: SessionId = "s1".into();
        let engine = Arc::new(TestEngine::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let negotiator = Negotiator::new(
            session_id.clone(),
            Politeness::Polite,
            engine.clone(),
            tx.clone(),
        );
        (session_id, engine, negotiator, tx, rx)
    }

    #[tokio::test]
    async fn candidate_before_description_is_queued_then_applied() {
        let (session_id, engine, mut negotiator, tx, mut rx) = session();

        handle_frame(
            &session_id,
            r#"{"type":"icecandidate","candidate":{"candidate":"candidate:0 1 udp 1 10.0.0.9 40000 typ host"}}"#,
            &mut negotiator,
            &tx,
        )
        .await;
        assert!(engine.candidates.lock().unwrap().is_empty(), "queued, not applied");

        handle_frame(
            &session_id,
            r#"{"type":"sessionDescription","description":{"role":"offer","sdp":"v=0 client"}}"#,
            &mut negotiator,
            &tx,
        )
        .await;

        assert_eq!(
            engine.candidates.lock().unwrap().as_slice(),
            ["candidate:0 1 udp 1 10.0.0.9 40000 typ host"]
        );
        match rx.try_recv() {
            Ok(ControlMessage::SessionDescription { description }) => {
                assert_eq!(description.role, DescriptionRole::Answer);
            }
            other => panic!("expected an answer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frame_gets_an_error_reply() {
        let (session_id, engine, mut negotiator, tx, mut rx) = session();

        handle_frame(&session_id, "{not json", &mut negotiator, &tx).await;

        assert!(matches!(rx.try_recv(), Ok(ControlMessage::Error { .. })));
        assert!(engine.candidates.lock().unwrap().is_empty());
        assert!(engine.remote_descriptions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_message_type_is_ignored() {
        let (session_id, _engine, mut negotiator, tx, mut rx) = session();

        handle_frame(
            &session_id,
            r#"{"type":"ping","payload":"anything"}"#,
            &mut negotiator,
            &tx,
        )
        .await;

        assert!(rx.try_recv().is_err(), "no reply for unknown types");
    }

    #[tokio::test]
    async fn peer_error_reports_are_swallowed() {
        let (session_id, _engine, mut negotiator, tx, mut rx) = session();

        handle_frame(
            &session_id,
            r#"{"type":"error","message":"peer had a bad day"}"#,
            &mut negotiator,
            &tx,
        )
        .await;

        assert!(rx.try_recv().is_err());
    }
}
