//! Test doubles shared by the relay and websocket tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use negotiation::{
    EngineError, MediaFrame, MediaSource, MediaSourceSpec, TransportEngine,
};
use signal_proto::{CandidateInit, SessionDescription};

/// Records every adapter interaction so tests can assert on what reached the
/// engine and what was relayed through it.
#[derive(Default)]
pub struct TestEngine {
    pub data_ready: AtomicBool,
    pub closed: AtomicBool,
    pub sent: Mutex<Vec<Bytes>>,
    pub provisioned: Mutex<Vec<String>>,
    pub outlet_frames: Arc<Mutex<Vec<Bytes>>>,
    pub candidates: Mutex<Vec<String>>,
    pub remote_descriptions: Mutex<Vec<SessionDescription>>,
}

#[async_trait]
impl TransportEngine for TestEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        Ok(SessionDescription::offer("v=0 test-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        Ok(SessionDescription::answer("v=0 test-answer"))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), EngineError> {
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.remote_descriptions.lock().unwrap().push(desc);
        Ok(())
    }

    async fn rollback_local_description(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), EngineError> {
        self.candidates.lock().unwrap().push(candidate.candidate);
        Ok(())
    }

    fn data_ready(&self) -> bool {
        self.data_ready.load(Ordering::SeqCst)
    }

    async fn send_data(&self, payload: Bytes) -> Result<(), EngineError> {
        if !self.data_ready() {
            return Err(EngineError::Data("data channel is not open".into()));
        }
        self.sent.lock().unwrap().push(payload);
        Ok(())
    }

    async fn add_media_source(
        &self,
        spec: &MediaSourceSpec,
    ) -> Result<Arc<dyn MediaSource>, EngineError> {
        self.provisioned.lock().unwrap().push(spec.id.clone());
        Ok(Arc::new(TestOutlet {
            frames: self.outlet_frames.clone(),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct TestOutlet {
    frames: Arc<Mutex<Vec<Bytes>>>,
}

#[async_trait]
impl MediaSource for TestOutlet {
    async fn write_frame(&self, frame: &MediaFrame) -> Result<(), EngineError> {
        self.frames.lock().unwrap().push(frame.data.clone());
        Ok(())
    }
}
