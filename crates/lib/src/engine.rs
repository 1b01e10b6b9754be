//! Conversation engine: the single owner of session state.
//!
//! Every trigger (user input, backend reply, closing phrase, speech result, idle expiry,
//! explicit end) is funnelled through the engine, which applies a [`Mutation`], writes the
//! snapshot, and rearms the idle timer. At most one exchange is in flight per session.
//!
//! An exchange is split in two so a caller can keep handling ticks and input while the
//! request runs: [`ConversationEngine::begin_send`] appends the user message and returns an
//! [`Exchange`]; the caller performs `Backend::talk` and hands the result to
//! [`ConversationEngine::finish_exchange`]. [`ConversationEngine::send_user_message`] does
//! all three in one call.

use std::sync::Arc;

use crate::backend::{Backend, BackendError, TalkResponse};
use crate::clock::{Clock, SystemClock};
use crate::closing::ClosingDetector;
use crate::config::SessionConfig;
use crate::device::{CapabilityError, MediaSink, NoMedia, SpeechEvent, SpeechToText, UnsupportedSpeech};
use crate::inactivity::InactivityMonitor;
use crate::leads::LeadBook;
use crate::reveal::TypingRevealer;
use crate::session::{LeadRecord, Message, Mutation, Sender, SessionSnapshot, SessionState};
use crate::store::{Store, StoreError, SESSION_KEY, TRANSCRIPT_KEY};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("could not reach the assistant: {0}")]
    Transport(#[from] BackendError),
    #[error("could not persist session state: {0}")]
    Persistence(#[from] StoreError),
    #[error(transparent)]
    CapabilityUnavailable(#[from] CapabilityError),
    #[error("a message is already being sent")]
    Busy,
    #[error("the conversation has ended; start a new chat")]
    Ended,
    #[error("there is no failed message to retry")]
    NothingToRetry,
}

/// Lifecycle of the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// An exchange is in flight.
    Sending,
    /// A reply is being revealed.
    Typing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Transport,
    Persistence,
    Capability,
    LeadCapture,
}

/// Dismissible, user-visible report of a recoverable error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
    /// A retry action is available (replays the failed message).
    pub retryable: bool,
}

impl Notice {
    fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
        }
    }
}

/// Outcome of the one-shot startup restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Nothing stored.
    Empty,
    /// Stored session resumed.
    Resumed,
    /// Stored session was older than the idle threshold (or unreadable) and was cleared.
    Discarded,
    /// Storage could not be read; starting empty in memory.
    Unavailable,
}

/// A request issued by [`ConversationEngine::begin_send`] or [`ConversationEngine::begin_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub text: String,
    session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Blank input; nothing happened.
    Ignored,
    /// Reply merged and reveal started.
    Delivered { reply: String },
    /// The session was reset while the request was in flight; the reply was dropped.
    Discarded,
}

/// Result of one reveal tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevealStep {
    Shown(String),
    Done,
    Inactive,
}

/// What the chat surface should indicate beneath the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Empty conversation: show the greeting.
    Greeting,
    Answering,
    Listening,
    /// Last message is the user's and no reply is being shown yet.
    Waiting,
    Ended,
    Idle,
}

/// Greeting shown before the first message.
pub const GREETING: &str = "Hi! I am Willow, your sales assistant.";

/// Session-level settings taken from config.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub idle_threshold_ms: i64,
    pub closing_phrases: Vec<String>,
}

impl From<&SessionConfig> for EngineSettings {
    fn from(c: &SessionConfig) -> Self {
        Self {
            idle_threshold_ms: c.idle_threshold_ms,
            closing_phrases: c.closing_phrases.clone(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

pub struct ConversationEngine<B: Backend, S: Store> {
    backend: Arc<B>,
    store: S,
    clock: Arc<dyn Clock>,
    media: Arc<dyn MediaSink>,
    speech: Arc<dyn SpeechToText>,
    detector: ClosingDetector,
    state: SessionState,
    phase: Phase,
    revealer: TypingRevealer,
    monitor: InactivityMonitor,
    pending_input: String,
    failed_text: Option<String>,
    notice: Option<Notice>,
    listening: bool,
    speech_disabled: bool,
    lead_captured: bool,
    show_image: bool,
    video_url: Option<String>,
    restored: Option<RestoreOutcome>,
}

impl<B: Backend + 'static, S: Store> ConversationEngine<B, S> {
    pub fn new(backend: B, store: S, settings: EngineSettings) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let now = clock.now_ms();
        Self {
            backend: Arc::new(backend),
            store,
            clock,
            media: Arc::new(NoMedia),
            speech: Arc::new(UnsupportedSpeech),
            detector: ClosingDetector::new(&settings.closing_phrases),
            state: SessionState::new(now),
            phase: Phase::Idle,
            revealer: TypingRevealer::new(),
            monitor: InactivityMonitor::new(settings.idle_threshold_ms),
            pending_input: String::new(),
            failed_text: None,
            notice: None,
            listening: false,
            speech_disabled: false,
            lead_captured: false,
            show_image: false,
            video_url: None,
            restored: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.state = SessionState::new(clock.now_ms());
        self.clock = clock;
        self
    }

    pub fn with_media(mut self, media: Arc<dyn MediaSink>) -> Self {
        self.media = media;
        self
    }

    pub fn with_speech(mut self, speech: Arc<dyn SpeechToText>) -> Self {
        self.speech = speech;
        self
    }

    /// Shared handle to the backend, for callers that run the exchange themselves.
    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn session_id(&self) -> &str {
        self.state.session_id()
    }

    pub fn conversation(&self) -> &[Message] {
        self.state.conversation()
    }

    pub fn lead(&self) -> Option<&LeadRecord> {
        self.state.lead()
    }

    pub fn ended(&self) -> bool {
        self.state.ended()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn notice(&self) -> Option<&Notice> {
        self.notice.as_ref()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.snapshot()
    }

    pub fn pending_input(&self) -> &str {
        &self.pending_input
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn show_image(&self) -> bool {
        self.show_image
    }

    pub fn video_url(&self) -> Option<&str> {
        self.video_url.as_deref()
    }

    /// Unix ms at which the session resets if nothing happens; `None` when no timer is armed.
    pub fn idle_deadline(&self) -> Option<i64> {
        self.monitor.deadline()
    }

    /// Prefix of the latest reply revealed so far.
    pub fn revealed_text(&self) -> &str {
        self.revealer.shown()
    }

    pub fn status(&self) -> Status {
        if self.listening {
            return Status::Listening;
        }
        if self.phase == Phase::Typing {
            return Status::Answering;
        }
        let last = self.state.conversation().last();
        match last {
            None => Status::Greeting,
            Some(m) if m.sender == Sender::User => Status::Waiting,
            Some(_) if self.state.ended() => Status::Ended,
            Some(_) => Status::Idle,
        }
    }

    /// Decide once per process whether to resume the stored session or discard it.
    pub async fn restore(&mut self) -> RestoreOutcome {
        if let Some(outcome) = self.restored {
            log::debug!("restore: already performed ({:?})", outcome);
            return outcome;
        }
        let now = self.clock.now_ms();
        let loaded = self.store.load(SESSION_KEY).await;
        let outcome = match loaded {
            Err(e) => {
                log::warn!("restore: reading session snapshot failed: {}", e);
                self.set_notice(Notice::new(
                    NoticeKind::Persistence,
                    format!("Could not read the saved chat: {}", e),
                ));
                RestoreOutcome::Unavailable
            }
            Ok(None) => RestoreOutcome::Empty,
            Ok(Some(value)) => match serde_json::from_value::<SessionSnapshot>(value) {
                Ok(mut snapshot)
                    if snapshot.is_valid_for_resume(now, self.monitor.threshold_ms()) =>
                {
                    if snapshot.last_activity > now {
                        log::warn!("restore: stored activity time is in the future, clamping to now");
                        snapshot.last_activity = now;
                    }
                    log::info!(
                        "restore: resuming {} ({} messages)",
                        snapshot.session_id,
                        snapshot.conversation.len()
                    );
                    self.state = SessionState::from_snapshot(snapshot);
                    self.lead_captured = false;
                    let base = self.state.last_activity();
                    self.monitor.rearm(base, self.state.is_empty());
                    self.offer_retry_for_unanswered();
                    RestoreOutcome::Resumed
                }
                Ok(_) => {
                    log::info!("restore: stored session is stale, discarding");
                    self.clear_snapshot().await;
                    RestoreOutcome::Discarded
                }
                Err(e) => {
                    log::warn!("restore: stored session unreadable, discarding: {}", e);
                    self.clear_snapshot().await;
                    RestoreOutcome::Discarded
                }
            },
        };
        self.restored = Some(outcome);
        outcome
    }

    /// A resumed transcript ending in a user message was never answered; offer to resend it.
    fn offer_retry_for_unanswered(&mut self) {
        if self.state.ended() {
            return;
        }
        if let Some(last) = self.state.conversation().last() {
            if last.sender == Sender::User {
                self.failed_text = Some(last.text.clone());
                self.notice = Some(Notice {
                    kind: NoticeKind::Transport,
                    message: "Your last message was not answered.".to_string(),
                    retryable: true,
                });
            }
        }
    }

    /// Append the user's message and start an exchange. `Ok(None)` for blank input.
    pub async fn begin_send(&mut self, text: &str) -> Result<Option<Exchange>, EngineError> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        if self.phase == Phase::Sending {
            return Err(EngineError::Busy);
        }
        if self.state.ended() {
            return Err(EngineError::Ended);
        }
        self.notice = None;
        self.failed_text = None;
        self.pending_input.clear();

        let now = self.clock.now_ms();
        let mut mutations = vec![Mutation::AppendUser {
            text: text.to_string(),
            at_ms: now,
        }];
        if self.detector.is_closing(text) {
            log::debug!("engine: closing phrase detected");
            mutations.push(Mutation::MarkEnded { at_ms: now });
        }
        let ended_edge = self.commit(mutations).await;
        if let Some(entry) = self.state.conversation().last().cloned() {
            self.log_transcript(&entry).await;
        }
        if ended_edge {
            self.capture_lead(Some(text.to_string())).await;
        }

        self.phase = Phase::Sending;
        log::debug!("engine: exchange started");
        Ok(Some(Exchange {
            text: text.to_string(),
            session_id: self.state.session_id().to_string(),
        }))
    }

    /// Re-issue the last failed message without appending it again.
    pub fn begin_retry(&mut self) -> Result<Exchange, EngineError> {
        if self.phase == Phase::Sending {
            return Err(EngineError::Busy);
        }
        let text = self.failed_text.take().ok_or(EngineError::NothingToRetry)?;
        self.notice = None;
        self.phase = Phase::Sending;
        log::debug!("engine: retrying last failed message");
        Ok(Exchange {
            text,
            session_id: self.state.session_id().to_string(),
        })
    }

    /// Merge the result of an exchange. Failures leave the transcript untouched and become a
    /// retryable notice.
    pub async fn finish_exchange(
        &mut self,
        exchange: Exchange,
        result: Result<TalkResponse, BackendError>,
    ) -> Result<SendOutcome, EngineError> {
        if exchange.session_id != self.state.session_id() {
            log::debug!("engine: dropping reply for a session that was reset");
            return Ok(SendOutcome::Discarded);
        }
        self.phase = Phase::Idle;
        let response = match result {
            Ok(r) => r,
            Err(e) => {
                log::warn!("engine: exchange failed: {}", e);
                self.revealer.cancel();
                self.failed_text = Some(exchange.text);
                self.notice = Some(Notice {
                    kind: NoticeKind::Transport,
                    message:
                        "Could not reach Willow backend. Please check your connection and try again."
                            .to_string(),
                    retryable: true,
                });
                return Err(EngineError::Transport(e));
            }
        };

        let now = self.clock.now_ms();
        let reply = response.reply.clone();
        let ended_edge = self
            .commit(vec![Mutation::MergeReply {
                reply: reply.clone(),
                lead: response.lead.clone(),
                end: response.end,
                at_ms: now,
            }])
            .await;
        if let Some(entry) = self.state.conversation().last().cloned() {
            self.log_transcript(&entry).await;
        }
        self.revealer.start(reply.clone());
        self.phase = Phase::Typing;
        self.show_image = response.show_image;
        self.forward_cues(&response);
        log::info!("engine: reply merged ({} chars)", reply.chars().count());

        if ended_edge {
            let context = self.state.last_user_text().map(str::to_string);
            self.capture_lead(context).await;
        }
        Ok(SendOutcome::Delivered { reply })
    }

    /// Append, exchange, and merge in one call.
    pub async fn send_user_message(&mut self, text: &str) -> Result<SendOutcome, EngineError> {
        let Some(exchange) = self.begin_send(text).await? else {
            return Ok(SendOutcome::Ignored);
        };
        let result = self.backend.talk(&exchange.text).await;
        self.finish_exchange(exchange, result).await
    }

    /// Replay the last failed message verbatim.
    pub async fn retry(&mut self) -> Result<SendOutcome, EngineError> {
        let exchange = self.begin_retry()?;
        let result = self.backend.talk(&exchange.text).await;
        self.finish_exchange(exchange, result).await
    }

    pub fn dismiss_notice(&mut self) {
        self.notice = None;
        self.failed_text = None;
    }

    /// Replace the text the user is composing. Counts as activity for the idle timer.
    pub fn set_pending_input(&mut self, text: impl Into<String>) {
        self.pending_input = text.into();
        self.rearm_idle();
    }

    /// Advance the reveal by one step. Completion returns the engine to `Idle`.
    pub fn tick_reveal(&mut self) -> RevealStep {
        if self.phase != Phase::Typing {
            return RevealStep::Inactive;
        }
        match self.revealer.tick() {
            Some(prefix) => RevealStep::Shown(prefix.to_string()),
            None => {
                self.phase = Phase::Idle;
                RevealStep::Done
            }
        }
    }

    /// Start speech capture. Unsupported devices disable the feature for the session.
    pub fn start_listening(&mut self) -> Result<(), EngineError> {
        if self.speech_disabled {
            return Err(CapabilityError::Unavailable("speech recognition".to_string()).into());
        }
        match self.speech.start() {
            Ok(()) => {
                self.listening = true;
                Ok(())
            }
            Err(e) => {
                if matches!(e, CapabilityError::Unavailable(_)) {
                    self.speech_disabled = true;
                }
                self.set_notice(Notice::new(NoticeKind::Capability, e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Feed a speech-to-text callback into the session.
    pub fn speech_event(&mut self, event: SpeechEvent) {
        match event {
            SpeechEvent::Result(text) => {
                self.listening = false;
                self.set_pending_input(text);
            }
            SpeechEvent::Error(msg) => {
                self.listening = false;
                self.set_notice(Notice::new(
                    NoticeKind::Capability,
                    format!("Speech recognition error: {}", msg),
                ));
            }
            SpeechEvent::End => self.listening = false,
        }
    }

    /// Reset the session if the idle deadline has passed. Returns whether a reset happened.
    pub async fn check_idle(&mut self) -> bool {
        if !self.monitor.expired(self.clock.now_ms()) {
            return false;
        }
        log::info!("engine: session idle, resetting");
        self.reset_session().await;
        true
    }

    /// Explicit end: finalize the lead (unless one was already captured) and reset.
    pub async fn end_chat(&mut self) {
        if !self.lead_captured && !self.state.is_empty() {
            let context = self.state.last_user_text().unwrap_or("").to_string();
            self.capture_lead(Some(context)).await;
        }
        self.reset_session().await;
    }

    /// Clear everything local and ask the backend to drop its session.
    async fn reset_session(&mut self) {
        let now = self.clock.now_ms();
        self.state.apply(Mutation::Reset { at_ms: now });
        self.revealer.clear();
        self.monitor.cancel();
        self.pending_input.clear();
        self.failed_text = None;
        self.phase = Phase::Idle;
        self.lead_captured = false;
        self.show_image = false;
        self.listening = false;
        self.hide_video();
        self.clear_snapshot().await;
        let reset = self.backend.reset().await;
        if let Err(e) = reset {
            log::warn!("engine: backend reset failed: {}", e);
            self.set_notice(Notice::new(
                NoticeKind::Transport,
                format!("Could not reset the assistant session: {}", e),
            ));
        }
    }

    /// Apply mutations as one state change, persist, and rearm the idle timer.
    /// Returns whether the end latch went false -> true.
    async fn commit(&mut self, mutations: Vec<Mutation>) -> bool {
        let mut ended_edge = false;
        for m in mutations {
            ended_edge |= self.state.apply(m).ended_edge;
        }
        self.persist_snapshot().await;
        self.rearm_idle();
        ended_edge
    }

    fn rearm_idle(&mut self) {
        let empty = self.state.is_empty() && self.pending_input.is_empty();
        self.monitor.rearm(self.clock.now_ms(), empty);
    }

    async fn persist_snapshot(&mut self) {
        let snapshot = self.state.snapshot();
        let result = match serde_json::to_value(&snapshot) {
            Ok(v) => self.store.save(SESSION_KEY, &v).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            self.persistence_failed("saving the session", e);
        }
    }

    async fn clear_snapshot(&mut self) {
        let cleared = self.store.clear(SESSION_KEY).await;
        if let Err(e) = cleared {
            self.persistence_failed("clearing the saved session", e);
        }
    }

    async fn log_transcript(&mut self, entry: &Message) {
        let result = match serde_json::to_value(entry) {
            Ok(v) => self.store.append(TRANSCRIPT_KEY, v).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            self.persistence_failed("logging the transcript", e);
        }
    }

    fn persistence_failed(&mut self, what: &str, e: StoreError) {
        log::warn!("engine: {} failed: {}", what, e);
        self.set_notice(Notice::new(
            NoticeKind::Persistence,
            format!("Storage problem while {}; continuing without saving: {}", what, e),
        ));
    }

    /// A retryable transport notice outranks later informational notices.
    fn set_notice(&mut self, notice: Notice) {
        if self.notice.as_ref().is_some_and(|n| n.retryable) {
            log::debug!("engine: keeping retryable notice over: {}", notice.message);
            return;
        }
        self.notice = Some(notice);
    }

    fn forward_cues(&mut self, response: &TalkResponse) {
        if let Some(url) = response.audio_url.as_deref() {
            if let Err(e) = self.media.play_audio(url) {
                log::debug!("engine: audio cue not played: {}", e);
                self.set_notice(Notice::new(NoticeKind::Capability, e.to_string()));
            }
        }
        match response.youtube_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => {
                self.video_url = Some(url.to_string());
                if let Err(e) = self.media.show_video(url) {
                    log::debug!("engine: video cue not shown: {}", e);
                    self.set_notice(Notice::new(NoticeKind::Capability, e.to_string()));
                }
            }
            None => self.hide_video(),
        }
    }

    fn hide_video(&mut self) {
        if self.video_url.take().is_some() {
            if let Err(e) = self.media.show_video("") {
                log::debug!("engine: hiding video failed: {}", e);
            }
        }
    }

    /// Fetch the lead summary and store it if new. Failures become a notice; no automatic retry.
    async fn capture_lead(&mut self, context: Option<String>) -> bool {
        let fetched = self.backend.lead(context.as_deref()).await;
        let response = match fetched {
            Ok(r) => r,
            Err(e) => {
                log::warn!("engine: lead capture failed: {}", e);
                self.set_notice(Notice::new(
                    NoticeKind::LeadCapture,
                    "Could not save lead. Please try again.",
                ));
                return false;
            }
        };
        let Some(lead) = response.lead else {
            log::debug!("engine: backend returned no lead");
            return false;
        };
        if lead.is_ready() {
            self.lead_captured = true;
        }
        let appended = LeadBook::new(&self.store).append_if_new(&lead).await;
        match appended {
            Ok(stored) => stored,
            Err(e) => {
                self.persistence_failed("saving the lead", e);
                false
            }
        }
    }
}
