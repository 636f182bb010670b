//! Adapter seam to the underlying transport engine.
//!
//! Everything the negotiation machine and the relay need from an engine is
//! expressed here; the `webrtc`-backed implementation lives in its own crate
//! and nothing above this seam depends on it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use signal_proto::{CandidateInit, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("description rejected: {0}")]
    Description(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("data channel unavailable: {0}")]
    Data(String),
    #[error("media source rejected: {0}")]
    Media(String),
    #[error("engine is closed")]
    Closed,
}

/// Describes one media stream well enough for a receiving session to
/// provision a matching outbound source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSourceSpec {
    pub id: String,
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
}

/// An opaque unit of media, exactly as the engine produced it.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub data: Bytes,
}

/// A media stream arriving from the remote side of a session. The frame
/// receiver ends when the track does.
pub struct RemoteTrack {
    pub spec: MediaSourceSpec,
    pub frames: mpsc::Receiver<MediaFrame>,
}

/// Events the engine pushes at the session that owns it.
pub enum EngineEvent {
    /// A locally discovered candidate; `None` once gathering completes.
    LocalCandidate(Option<CandidateInit>),
    /// Session parameters changed (e.g. a track was added) and a fresh offer
    /// round is required.
    NegotiationNeeded,
    /// Payload received on the session's data channel.
    DataMessage(Bytes),
    /// A remote media track started.
    RemoteTrack(RemoteTrack),
}

/// The capability set consumed from the transport engine. One instance per
/// session, released exactly once via [`TransportEngine::close`]; calls made
/// after close may fail with [`EngineError::Closed`] and callers treat that
/// as silence, not as a fault.
#[async_trait]
pub trait TransportEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;
    /// Discard the uncommitted local description during glare resolution.
    async fn rollback_local_description(&self) -> Result<(), EngineError>;
    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), EngineError>;
    /// Whether the session's data channel is open and writable.
    fn data_ready(&self) -> bool;
    async fn send_data(&self, payload: Bytes) -> Result<(), EngineError>;
    /// Provision an outbound media source on this session. The engine signals
    /// renegotiation once the source is attached.
    async fn add_media_source(
        &self,
        spec: &MediaSourceSpec,
    ) -> Result<Arc<dyn MediaSource>, EngineError>;
    async fn close(&self);
}

/// Write side of an outbound media source provisioned on a session.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn write_frame(&self, frame: &MediaFrame) -> Result<(), EngineError>;
}
