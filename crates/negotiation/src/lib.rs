//! Session negotiation orchestration.
//!
//! One [`Negotiator`] per peer-to-peer session endpoint drives offer/answer
//! exchange against a [`TransportEngine`], buffers reachability candidates
//! that arrive before the remote description, and resolves simultaneous-offer
//! glare according to the session's fixed polite/impolite designation. The
//! engine itself (SDP, ICE, codecs) stays behind the adapter traits in
//! [`engine`].

pub mod engine;
mod machine;

pub use engine::{
    EngineError, EngineEvent, MediaFrame, MediaSource, MediaSourceSpec, RemoteTrack,
    TransportEngine,
};
pub use machine::{NegotiationState, Negotiator, Politeness};
