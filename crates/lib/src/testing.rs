//! Test doubles for the backend and device collaborators.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::backend::{Backend, BackendError, LeadResponse, TalkResponse};
use crate::device::{CapabilityError, MediaSink, SpeechToText};
use crate::session::LeadRecord;
use crate::store::{MemoryStore, Store, StoreError, SESSION_KEY};

#[derive(Default)]
struct Script {
    talk: VecDeque<Result<TalkResponse, BackendError>>,
    lead: VecDeque<Result<LeadRecord, BackendError>>,
    talk_calls: Vec<String>,
    lead_calls: Vec<Option<String>>,
    reset_calls: usize,
}

/// Backend that replays scripted results and records every call. Clones share the script.
#[derive(Clone, Default)]
pub struct FakeBackend {
    inner: Arc<Mutex<Script>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_talk(&self, r: Result<TalkResponse, BackendError>) {
        self.inner.lock().unwrap().talk.push_back(r);
    }

    pub fn push_lead(&self, r: Result<LeadRecord, BackendError>) {
        self.inner.lock().unwrap().lead.push_back(r);
    }

    pub fn talk_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().talk_calls.clone()
    }

    pub fn lead_calls(&self) -> Vec<Option<String>> {
        self.inner.lock().unwrap().lead_calls.clone()
    }

    pub fn reset_calls(&self) -> usize {
        self.inner.lock().unwrap().reset_calls
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn talk(&self, message: &str) -> Result<TalkResponse, BackendError> {
        let mut s = self.inner.lock().unwrap();
        s.talk_calls.push(message.to_string());
        s.talk
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Api("no scripted reply".to_string())))
    }

    /// Unscripted calls return no lead.
    async fn lead(&self, message: Option<&str>) -> Result<LeadResponse, BackendError> {
        let mut s = self.inner.lock().unwrap();
        s.lead_calls.push(message.map(str::to_string));
        match s.lead.pop_front() {
            Some(Ok(lead)) => Ok(LeadResponse { lead: Some(lead) }),
            Some(Err(e)) => Err(e),
            None => Ok(LeadResponse { lead: None }),
        }
    }

    async fn reset(&self) -> Result<(), BackendError> {
        self.inner.lock().unwrap().reset_calls += 1;
        Ok(())
    }
}

/// Media sink that records the cues it was given.
#[derive(Default)]
pub struct RecordingMedia {
    audio: Mutex<Vec<String>>,
    video: Mutex<Vec<String>>,
}

impl RecordingMedia {
    pub fn audio(&self) -> Vec<String> {
        self.audio.lock().unwrap().clone()
    }

    pub fn video(&self) -> Vec<String> {
        self.video.lock().unwrap().clone()
    }
}

impl MediaSink for RecordingMedia {
    fn play_audio(&self, url: &str) -> Result<(), CapabilityError> {
        self.audio.lock().unwrap().push(url.to_string());
        Ok(())
    }

    fn show_video(&self, url: &str) -> Result<(), CapabilityError> {
        self.video.lock().unwrap().push(url.to_string());
        Ok(())
    }
}

/// Speech capability that always starts; tests feed the resulting events by hand.
pub struct ScriptedSpeech;

impl SpeechToText for ScriptedSpeech {
    fn start(&self) -> Result<(), CapabilityError> {
        Ok(())
    }
}

/// Memory store that records the revision of every session snapshot it is asked to save.
#[derive(Clone, Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    revisions: Arc<Mutex<Vec<u64>>>,
}

impl RecordingStore {
    pub fn session_revisions(&self) -> Vec<u64> {
        self.revisions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Store for RecordingStore {
    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.load(key).await
    }

    async fn save(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        if key == SESSION_KEY {
            if let Some(rev) = value.get("revision").and_then(Value::as_u64) {
                self.revisions.lock().unwrap().push(rev);
            }
        }
        self.inner.save(key, value).await
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.inner.clear(key).await
    }

    async fn update<R, F>(&self, key: &str, edit: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Vec<Value>) -> R + Send + 'static,
    {
        self.inner.update(key, edit).await
    }
}
