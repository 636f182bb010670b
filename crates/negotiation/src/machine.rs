//! The per-session negotiation state machine.

use std::sync::Arc;

use signal_proto::{CandidateInit, ControlMessage, DescriptionRole, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::{EngineError, TransportEngine};

/// Fixed per-session glare designation. Assigned when the session is created
/// and never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Politeness {
    /// Rolls its own pending offer back when a competing offer arrives.
    Polite,
    /// Ignores a competing offer while its own is outstanding.
    Impolite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    /// An offer round re-entered from `Stable`, e.g. after a track was added.
    Renegotiating,
    Stable,
}

impl NegotiationState {
    fn offer_outstanding(self) -> bool {
        matches!(
            self,
            NegotiationState::OfferSent | NegotiationState::Renegotiating
        )
    }

    fn can_offer(self) -> bool {
        matches!(self, NegotiationState::Idle | NegotiationState::Stable)
    }
}

/// Drives one endpoint of a session: applies inbound descriptions and
/// candidates to the engine in a safe order and serializes its own side
/// effects out over the signaling channel sender.
///
/// All methods are called from the single task that owns the session, so a
/// message is fully handled before the next one starts.
pub struct Negotiator {
    session_id: String,
    politeness: Politeness,
    state: NegotiationState,
    engine: Arc<dyn TransportEngine>,
    outbound: mpsc::UnboundedSender<ControlMessage>,
    pending_candidates: Vec<CandidateInit>,
    remote_description_set: bool,
}

impl Negotiator {
    pub fn new(
        session_id: impl Into<String>,
        politeness: Politeness,
        engine: Arc<dyn TransportEngine>,
        outbound: mpsc::UnboundedSender<ControlMessage>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            politeness,
            state: NegotiationState::Idle,
            engine,
            outbound,
            pending_candidates: Vec::new(),
            remote_description_set: false,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn politeness(&self) -> Politeness {
        self.politeness
    }

    /// Start an offer round: create a local offer, commit it, transmit it.
    ///
    /// Dropped silently while a round is already in flight; the engine
    /// re-signals when the session next changes. An engine rejection leaves
    /// the state untouched and sends nothing, so the next trigger retries.
    pub async fn send_local_offer(&mut self) {
        if !self.state.can_offer() {
            debug!(
                session = %self.session_id,
                state = ?self.state,
                "offer suppressed, negotiation already in flight"
            );
            return;
        }
        let offer = match self.engine.create_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                warn!(session = %self.session_id, error = %err, "creating local offer failed");
                return;
            }
        };
        if let Err(err) = self.engine.set_local_description(offer.clone()).await {
            warn!(session = %self.session_id, error = %err, "committing local offer failed");
            return;
        }
        self.state = if self.state == NegotiationState::Stable {
            NegotiationState::Renegotiating
        } else {
            NegotiationState::OfferSent
        };
        self.transmit(ControlMessage::SessionDescription { description: offer });
    }

    /// Apply a description received from the remote side.
    pub async fn receive_remote_description(&mut self, desc: SessionDescription) {
        match desc.role {
            DescriptionRole::Offer => self.receive_remote_offer(desc).await,
            DescriptionRole::Answer => self.receive_remote_answer(desc).await,
        }
    }

    async fn receive_remote_offer(&mut self, desc: SessionDescription) {
        if self.state.offer_outstanding() {
            match self.politeness {
                Politeness::Impolite => {
                    debug!(
                        session = %self.session_id,
                        "ignoring competing offer while own offer is outstanding"
                    );
                    return;
                }
                Politeness::Polite => {
                    // Discard our pending offer in favor of the incoming one.
                    // Both halves run as one unit; if either fails the whole
                    // operation is reported as failed.
                    let (rolled_back, applied) = tokio::join!(
                        self.engine.rollback_local_description(),
                        self.engine.set_remote_description(desc),
                    );
                    if let Err(err) = rolled_back.and(applied) {
                        self.report_engine_failure("resolving offer glare", &err);
                        return;
                    }
                }
            }
        } else if let Err(err) = self.engine.set_remote_description(desc).await {
            self.report_engine_failure("applying remote offer", &err);
            return;
        }
        self.remote_description_ready().await;
        self.send_local_answer().await;
    }

    async fn receive_remote_answer(&mut self, desc: SessionDescription) {
        if !self.state.offer_outstanding() {
            warn!(
                session = %self.session_id,
                state = ?self.state,
                "answer received with no offer outstanding"
            );
            self.transmit(ControlMessage::error("unexpected answer: no offer outstanding"));
            return;
        }
        if let Err(err) = self.engine.set_remote_description(desc).await {
            self.report_engine_failure("applying remote answer", &err);
            return;
        }
        self.state = NegotiationState::Stable;
        self.remote_description_ready().await;
    }

    async fn send_local_answer(&mut self) {
        let answer = match self.engine.create_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                self.report_engine_failure("creating local answer", &err);
                self.state = NegotiationState::Idle;
                return;
            }
        };
        if let Err(err) = self.engine.set_local_description(answer.clone()).await {
            self.report_engine_failure("committing local answer", &err);
            self.state = NegotiationState::Idle;
            return;
        }
        // Committing the answer completes the round on this side.
        self.state = NegotiationState::Stable;
        self.transmit(ControlMessage::SessionDescription {
            description: answer,
        });
    }

    /// Buffer or apply a candidate from the remote side. The end-of-candidates
    /// marker is a no-op and never reaches the engine.
    pub async fn receive_remote_candidate(&mut self, candidate: Option<CandidateInit>) {
        let candidate = match candidate {
            Some(candidate) if !candidate.is_end_of_candidates() => candidate,
            _ => {
                debug!(session = %self.session_id, "end-of-candidates marker");
                return;
            }
        };
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            return;
        }
        if let Err(err) = self.engine.add_remote_candidate(candidate).await {
            self.report_engine_failure("adding remote candidate", &err);
        }
    }

    /// Transmit a locally discovered candidate right away; candidates are
    /// never buffered on the sending side. The engine's end-of-gathering
    /// signal stays local.
    pub fn announce_local_candidate(&self, candidate: Option<CandidateInit>) {
        if let Some(candidate) = candidate {
            self.transmit(ControlMessage::IceCandidate {
                candidate: Some(candidate),
            });
        }
    }

    /// Engine callback: session parameters changed and a fresh offer round is
    /// required.
    pub async fn negotiation_needed(&mut self) {
        self.send_local_offer().await;
    }

    async fn remote_description_ready(&mut self) {
        self.remote_description_set = true;
        // The queue drains exactly once: nothing is appended after the flag
        // flips, and a failed candidate does not stop the rest.
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(err) = self.engine.add_remote_candidate(candidate).await {
                self.report_engine_failure("applying buffered candidate", &err);
            }
        }
    }

    fn transmit(&self, message: ControlMessage) {
        if self.outbound.send(message).is_err() {
            debug!(
                session = %self.session_id,
                "signaling channel gone, dropping outbound message"
            );
        }
    }

    fn report_engine_failure(&self, context: &str, err: &EngineError) {
        warn!(session = %self.session_id, error = %err, "{context} failed");
        self.transmit(ControlMessage::error(format!("{context} failed: {err}")));
    }
}
