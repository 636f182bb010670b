//! Fan-out of data and media between live sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use negotiation::{MediaSource, MediaSourceSpec, RemoteTrack, TransportEngine};
use tracing::{debug, info, warn};

pub type SessionId = String;

/// Keys an outbound media source by the session that sourced the track, so
/// the capacity a closing session caused to be provisioned elsewhere can be
/// found and released.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RelayKey {
    source: SessionId,
    track: String,
}

enum OutletSlot {
    /// `add_media_source` is in flight; frames are dropped until it lands.
    Provisioning,
    Ready(Arc<dyn MediaSource>),
}

struct Member {
    engine: Arc<dyn TransportEngine>,
    closed: AtomicBool,
    outlets: DashMap<RelayKey, OutletSlot>,
}

/// The registry of live sessions and the broadcast paths between them.
///
/// Sessions are inserted when their signaling channel opens and removed when
/// it closes; a removed session is never iterated again. Map guards are never
/// held across an `.await`: every broadcast works from a snapshot, and the
/// per-member closed flag catches removals that race a snapshot.
pub struct RelayCoordinator {
    members: DashMap<SessionId, Arc<Member>>,
}

impl RelayCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            members: DashMap::new(),
        })
    }

    /// A session becomes a legal forwarding target only once registered.
    pub fn register(&self, id: SessionId, engine: Arc<dyn TransportEngine>) {
        info!(session = %id, "relay member registered");
        self.members.insert(
            id,
            Arc::new(Member {
                engine,
                closed: AtomicBool::new(false),
                outlets: DashMap::new(),
            }),
        );
    }

    /// Remove a session and release everything it owned: its engine, and the
    /// outbound media sources other members provisioned for its tracks. Safe
    /// for a session that never finished negotiating, and for repeated calls.
    pub async fn unregister(&self, id: &SessionId) {
        let Some((_, member)) = self.members.remove(id) else {
            return;
        };
        member.closed.store(true, Ordering::SeqCst);
        member.engine.close().await;
        for entry in self.members.iter() {
            entry.outlets.retain(|key, _| &key.source != id);
        }
        info!(session = %id, "relay member removed");
    }

    /// Forward a data payload to every other live session whose data channel
    /// is ready. Best effort, at most once: sessions that are not ready drop
    /// the payload, and nothing is buffered.
    pub async fn broadcast_data(&self, source: &SessionId, payload: Bytes) {
        for (id, member) in self.snapshot_except(source) {
            if member.closed.load(Ordering::SeqCst) {
                continue;
            }
            if !member.engine.data_ready() {
                debug!(session = %id, "dropping payload, data channel not ready");
                continue;
            }
            if let Err(err) = member.engine.send_data(payload.clone()).await {
                warn!(session = %id, error = %err, "relaying data failed");
            }
        }
    }

    /// Pump one remote track: outbound sources are provisioned on every other
    /// session, then every frame goes to each session whose source is ready.
    /// A session still provisioning (or one that joined mid-stream) misses
    /// frames until its source lands; there is no catch-up.
    pub fn relay_track(self: &Arc<Self>, source: SessionId, track: RemoteTrack) {
        let relay = self.clone();
        tokio::spawn(async move {
            let key = RelayKey {
                source: source.clone(),
                track: track.spec.id.clone(),
            };
            info!(session = %source, track = %key.track, "relaying media track");
            let spec = track.spec;
            let mut frames = track.frames;
            // Provision the members that are already connected; the per-frame
            // pass below picks up late joiners.
            for (_, member) in relay.snapshot_except(&source) {
                relay.ensure_outlet(&member, &key, &spec);
            }
            while let Some(frame) = frames.recv().await {
                if !relay.members.contains_key(&source) {
                    debug!(session = %source, track = %key.track, "source left, stopping track relay");
                    break;
                }
                for (_, member) in relay.snapshot_except(&source) {
                    if member.closed.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Some(outlet) = relay.ensure_outlet(&member, &key, &spec) {
                        if let Err(err) = outlet.write_frame(&frame).await {
                            debug!(track = %key.track, error = %err, "writing relayed frame failed");
                        }
                    }
                }
            }
            for entry in relay.members.iter() {
                entry.outlets.remove(&key);
            }
            debug!(session = %key.source, track = %key.track, "media track relay ended");
        });
    }

    /// Look up the outbound source a member holds for a relayed track,
    /// kicking off provisioning if it has none yet. Returns `None` while
    /// provisioning is in flight, so callers drop the current frame.
    fn ensure_outlet(
        &self,
        member: &Arc<Member>,
        key: &RelayKey,
        spec: &MediaSourceSpec,
    ) -> Option<Arc<dyn MediaSource>> {
        match member.outlets.entry(key.clone()) {
            Entry::Occupied(slot) => match slot.get() {
                OutletSlot::Ready(outlet) => Some(outlet.clone()),
                OutletSlot::Provisioning => None,
            },
            Entry::Vacant(slot) => {
                slot.insert(OutletSlot::Provisioning);
                tokio::spawn(provision_outlet(member.clone(), key.clone(), spec.clone()));
                None
            }
        }
    }

    fn snapshot_except(&self, source: &SessionId) -> Vec<(SessionId, Arc<Member>)> {
        self.members
            .iter()
            .filter(|entry| entry.key() != source)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

async fn provision_outlet(member: Arc<Member>, key: RelayKey, spec: MediaSourceSpec) {
    match member.engine.add_media_source(&spec).await {
        Ok(outlet) => {
            member.outlets.insert(key, OutletSlot::Ready(outlet));
        }
        Err(err) => {
            warn!(track = %key.track, error = %err, "provisioning outbound media source failed");
            // Retried when a later frame finds the slot empty.
            member.outlets.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEngine;
    use negotiation::MediaFrame;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    fn payload(text: &str) -> Bytes {
        Bytes::copy_from_slice(text.as_bytes())
    }

    fn spec(id: &str) -> MediaSourceSpec {
        MediaSourceSpec {
            id: id.to_string(),
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: 2,
        }
    }

    #[tokio::test]
    async fn data_fans_out_to_every_ready_member_and_never_the_source() {
        let relay = RelayCoordinator::new();
        let a = Arc::new(TestEngine::default());
        let b = Arc::new(TestEngine::default());
        let c = Arc::new(TestEngine::default());
        let d = Arc::new(TestEngine::default());
        a.data_ready.store(true, Ordering::SeqCst);
        b.data_ready.store(true, Ordering::SeqCst);
        c.data_ready.store(true, Ordering::SeqCst);
        relay.register("a".into(), a.clone());
        relay.register("b".into(), b.clone());
        relay.register("c".into(), c.clone());
        relay.register("d".into(), d.clone());

        relay.broadcast_data(&"a".to_string(), payload("hello")).await;

        assert_eq!(b.sent.lock().unwrap().as_slice(), &[payload("hello")]);
        assert_eq!(c.sent.lock().unwrap().as_slice(), &[payload("hello")]);
        assert!(d.sent.lock().unwrap().is_empty(), "not-ready member drops");
        assert!(a.sent.lock().unwrap().is_empty(), "never echoed to the source");
    }

    #[tokio::test]
    async fn unregistered_member_is_released_and_never_targeted_again() {
        let relay = RelayCoordinator::new();
        let a = Arc::new(TestEngine::default());
        let b = Arc::new(TestEngine::default());
        a.data_ready.store(true, Ordering::SeqCst);
        b.data_ready.store(true, Ordering::SeqCst);
        relay.register("a".into(), a.clone());
        relay.register("b".into(), b.clone());

        relay.unregister(&"b".to_string()).await;
        assert!(b.closed.load(Ordering::SeqCst), "engine released on removal");

        relay.broadcast_data(&"a".to_string(), payload("late")).await;
        assert!(b.sent.lock().unwrap().is_empty());

        // Repeated and unknown removals are harmless.
        relay.unregister(&"b".to_string()).await;
        relay.unregister(&"ghost".to_string()).await;
    }

    #[tokio::test]
    async fn track_relay_provisions_other_members_and_delivers_frames() {
        let relay = RelayCoordinator::new();
        let source = Arc::new(TestEngine::default());
        let viewer = Arc::new(TestEngine::default());
        relay.register("source".into(), source.clone());
        relay.register("viewer".into(), viewer.clone());

        let (frames_tx, frames_rx) = mpsc::channel(8);
        relay.relay_track(
            "source".into(),
            RemoteTrack {
                spec: spec("cam-1"),
                frames: frames_rx,
            },
        );
        sleep(Duration::from_millis(50)).await;
        assert_eq!(viewer.provisioned.lock().unwrap().as_slice(), ["cam-1"]);
        assert!(source.provisioned.lock().unwrap().is_empty());

        frames_tx.send(MediaFrame { data: payload("f2") }).await.unwrap();
        frames_tx.send(MediaFrame { data: payload("f3") }).await.unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(
            viewer.outlet_frames.lock().unwrap().as_slice(),
            &[payload("f2"), payload("f3")]
        );
        assert!(
            viewer.provisioned.lock().unwrap().len() == 1,
            "provisioned exactly once per track"
        );
        assert!(source.outlet_frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn member_joining_mid_stream_is_provisioned_on_the_next_frame() {
        let relay = RelayCoordinator::new();
        let source = Arc::new(TestEngine::default());
        relay.register("source".into(), source.clone());

        let (frames_tx, frames_rx) = mpsc::channel(8);
        relay.relay_track(
            "source".into(),
            RemoteTrack {
                spec: spec("cam-1"),
                frames: frames_rx,
            },
        );
        frames_tx.send(MediaFrame { data: payload("early") }).await.unwrap();
        sleep(Duration::from_millis(50)).await;

        let late = Arc::new(TestEngine::default());
        relay.register("late".into(), late.clone());
        frames_tx.send(MediaFrame { data: payload("trigger") }).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(late.provisioned.lock().unwrap().as_slice(), ["cam-1"]);

        frames_tx.send(MediaFrame { data: payload("seen") }).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(
            late.outlet_frames.lock().unwrap().as_slice(),
            &[payload("seen")]
        );
    }

    #[tokio::test]
    async fn closing_the_source_stops_its_track_relay() {
        let relay = RelayCoordinator::new();
        let source = Arc::new(TestEngine::default());
        let viewer = Arc::new(TestEngine::default());
        relay.register("source".into(), source.clone());
        relay.register("viewer".into(), viewer.clone());

        let (frames_tx, frames_rx) = mpsc::channel(8);
        relay.relay_track(
            "source".into(),
            RemoteTrack {
                spec: spec("cam-1"),
                frames: frames_rx,
            },
        );
        frames_tx.send(MediaFrame { data: payload("f1") }).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        frames_tx.send(MediaFrame { data: payload("f2") }).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(!viewer.outlet_frames.lock().unwrap().is_empty());

        relay.unregister(&"source".to_string()).await;
        let frames_before = viewer.outlet_frames.lock().unwrap().len();

        frames_tx.send(MediaFrame { data: payload("stale") }).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(viewer.outlet_frames.lock().unwrap().len(), frames_before);
    }
}
