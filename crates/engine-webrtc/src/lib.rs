//! `webrtc`-crate-backed implementation of the transport engine adapter.
//!
//! Bridges the callback-style `RTCPeerConnection` API into the event stream
//! the negotiation machine and the relay consume: candidates, renegotiation
//! signals, data-channel payloads, and remote tracks all arrive on one
//! per-session channel. Remote tracks are pumped as marshalled RTP so that
//! frames stay opaque above this crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use negotiation::{
    EngineError, EngineEvent, MediaFrame, MediaSource, MediaSourceSpec, RemoteTrack,
    TransportEngine,
};
use signal_proto::{CandidateInit, DescriptionRole, SessionDescription};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Marshal;

const DATA_CHANNEL_LABEL: &str = "cove-data";
const FRAME_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct WebRtcEngineConfig {
    pub ice_servers: Vec<String>,
    /// The initiating side opens the relayed data channel (unordered, no
    /// retransmits); the other side observes it.
    pub initiator: bool,
}

impl Default for WebRtcEngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
            initiator: false,
        }
    }
}

/// One peer connection plus the data-channel handle shared with it.
pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    data_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    data_open: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl WebRtcEngine {
    /// Build a peer connection and wire its callbacks into an event stream.
    pub async fn connect(
        config: WebRtcEngineConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>), EngineError> {
        let api = APIBuilder::new().build();
        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|err| EngineError::Description(err.to_string()))?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let init = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => Some(CandidateInit {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }),
                        Err(err) => {
                            warn!(error = %err, "serializing local candidate failed");
                            return;
                        }
                    },
                    None => None,
                };
                let _ = tx.send(EngineEvent::LocalCandidate(init));
            })
        }));

        let tx = events_tx.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(EngineEvent::NegotiationNeeded);
            })
        }));

        let tx = events_tx.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                pump_remote_track(track, tx);
            })
        }));

        let data_channel = Arc::new(RwLock::new(None));
        let data_open = Arc::new(AtomicBool::new(false));

        if config.initiator {
            let init = RTCDataChannelInit {
                ordered: Some(false),
                max_retransmits: Some(0),
                ..Default::default()
            };
            let dc = pc
                .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
                .await
                .map_err(|err| EngineError::Data(err.to_string()))?;
            attach_data_channel(&dc, events_tx.clone(), data_open.clone());
            *data_channel.write().await = Some(dc);
        } else {
            let slot = data_channel.clone();
            let open = data_open.clone();
            let tx = events_tx.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let slot = slot.clone();
                let open = open.clone();
                let tx = tx.clone();
                Box::pin(async move {
                    debug!(label = dc.label(), "data channel received");
                    attach_data_channel(&dc, tx, open);
                    *slot.write().await = Some(dc);
                })
            }));
        }

        let engine = Arc::new(Self {
            pc,
            data_channel,
            data_open,
            closed: AtomicBool::new(false),
        });
        Ok((engine, events_rx))
    }
}

fn attach_data_channel(
    dc: &Arc<RTCDataChannel>,
    events: mpsc::UnboundedSender<EngineEvent>,
    open: Arc<AtomicBool>,
) {
    let on_open = open.clone();
    dc.on_open(Box::new(move || {
        on_open.store(true, Ordering::SeqCst);
        Box::pin(async {})
    }));
    dc.on_close(Box::new(move || {
        open.store(false, Ordering::SeqCst);
        Box::pin(async {})
    }));
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let events = events.clone();
        Box::pin(async move {
            let _ = events.send(EngineEvent::DataMessage(message.data));
        })
    }));
}

/// Surface a remote track as a frame stream and keep reading RTP from it
/// until the track or the consumer goes away. Frames the consumer cannot
/// keep up with are dropped, not queued without bound.
fn pump_remote_track(track: Arc<TrackRemote>, events: mpsc::UnboundedSender<EngineEvent>) {
    let codec = track.codec();
    let spec = MediaSourceSpec {
        id: track.id(),
        mime_type: codec.capability.mime_type.clone(),
        clock_rate: codec.capability.clock_rate,
        channels: codec.capability.channels,
    };
    let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
    if events
        .send(EngineEvent::RemoteTrack(RemoteTrack {
            spec: spec.clone(),
            frames: frames_rx,
        }))
        .is_err()
    {
        return;
    }
    tokio::spawn(async move {
        loop {
            match track.read_rtp().await {
                Ok((packet, _attributes)) => {
                    let data = match packet.marshal() {
                        Ok(data) => data,
                        Err(err) => {
                            warn!(track = %spec.id, error = %err, "marshalling rtp packet failed");
                            continue;
                        }
                    };
                    match frames_tx.try_send(MediaFrame { data }) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {}
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                Err(err) => {
                    debug!(track = %spec.id, error = %err, "remote track ended");
                    break;
                }
            }
        }
    });
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let result = match desc.role {
        DescriptionRole::Offer => RTCSessionDescription::offer(desc.sdp),
        DescriptionRole::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    result.map_err(|err| EngineError::Description(err.to_string()))
}

#[async_trait]
impl TransportEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| EngineError::Description(err.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| EngineError::Description(err.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(|err| EngineError::Description(err.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(|err| EngineError::Description(err.to_string()))
    }

    async fn rollback_local_description(&self) -> Result<(), EngineError> {
        // RTCSessionDescription offers no rollback constructor; build one the
        // same way it comes off the wire.
        let rollback: RTCSessionDescription =
            serde_json::from_value(serde_json::json!({ "type": "rollback", "sdp": "" }))
                .map_err(|err| EngineError::Description(err.to_string()))?;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(|err| EngineError::Description(err.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| EngineError::Candidate(err.to_string()))
    }

    fn data_ready(&self) -> bool {
        self.data_open.load(Ordering::SeqCst)
    }

    async fn send_data(&self, payload: Bytes) -> Result<(), EngineError> {
        let dc = self
            .data_channel
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::Data("no data channel on this session yet".into()))?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(EngineError::Data("data channel is not open".into()));
        }
        dc.send(&payload)
            .await
            .map_err(|err| EngineError::Data(err.to_string()))?;
        Ok(())
    }

    async fn add_media_source(
        &self,
        spec: &MediaSourceSpec,
    ) -> Result<Arc<dyn MediaSource>, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        let capability = RTCRtpCodecCapability {
            mime_type: spec.mime_type.clone(),
            clock_rate: spec.clock_rate,
            channels: spec.channels,
            ..Default::default()
        };
        let track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            spec.id.clone(),
            format!("relay-{}", spec.id),
        ));
        self.pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|err| EngineError::Media(err.to_string()))?;
        Ok(Arc::new(RtpOutlet { track }))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.data_open.store(false, Ordering::SeqCst);
        if let Err(err) = self.pc.close().await {
            debug!(error = %err, "closing peer connection");
        }
    }
}

/// Outbound media source backed by a static RTP track; frames written here
/// are repacketized by the receiving side's engine, not by us.
struct RtpOutlet {
    track: Arc<TrackLocalStaticRTP>,
}

#[async_trait]
impl MediaSource for RtpOutlet {
    async fn write_frame(&self, frame: &MediaFrame) -> Result<(), EngineError> {
        self.track
            .write(&frame.data)
            .await
            .map_err(|err| EngineError::Media(err.to_string()))?;
        Ok(())
    }
}
