//! Session state: transcript, lead, end latch, and the snapshot written to storage.
//!
//! All mutations go through [`SessionState::apply`]. Callers never write fields directly,
//! so every trigger (user input, backend reply, closing phrase, idle reset) produces one
//! atomic state change and one snapshot write.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unique session identifier (opaque string).
pub type SessionId = String;

fn new_session_id() -> SessionId {
    format!("sess-{}", uuid::Uuid::new_v4())
}

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    #[serde(alias = "bot")]
    Assistant,
}

/// A single transcript entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: Sender,
    pub text: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            sender: Sender::User,
            text: text.into(),
            timestamp,
        }
    }

    pub fn assistant(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            sender: Sender::Assistant,
            text: text.into(),
            timestamp,
        }
    }
}

/// Structured summary of a qualified conversation, produced by the backend.
///
/// `summary` is the dedup key; an empty summary means the backend has nothing ready yet.
/// Fields the backend sends beyond the known ones are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_user_message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LeadRecord {
    /// True when the backend has produced a summary worth storing.
    pub fn is_ready(&self) -> bool {
        !self.summary.trim().is_empty()
    }

    /// Merge fields embedded in a fenced ```json summary over this record, for display.
    /// A summary that is not fenced JSON, or fails to parse, leaves the record unchanged.
    pub fn merged_for_display(&self) -> LeadRecord {
        let trimmed = self.summary.trim();
        let Some(body) = trimmed.strip_prefix("```json") else {
            return self.clone();
        };
        let body = body.trim_end().trim_end_matches("```").trim();
        let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(body) else {
            return self.clone();
        };
        let mut merged = match serde_json::to_value(self) {
            Ok(Value::Object(m)) => m,
            _ => return self.clone(),
        };
        for (k, v) in fields {
            merged.insert(k, v);
        }
        serde_json::from_value(Value::Object(merged)).unwrap_or_else(|_| self.clone())
    }
}

/// One-way flag: false -> true only, cleared solely by a full session reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndLatch(bool);

impl EndLatch {
    pub fn is_set(&self) -> bool {
        self.0
    }

    /// Set the latch. Returns true only on the false -> true edge.
    pub fn latch(&mut self) -> bool {
        let edge = !self.0;
        self.0 = true;
        edge
    }
}

/// Serializable projection of session state, written after every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    #[serde(default)]
    pub session_id: SessionId,
    #[serde(default)]
    pub conversation: Vec<Message>,
    #[serde(default, alias = "leadData")]
    pub lead: Option<LeadRecord>,
    #[serde(default, alias = "end")]
    pub ended: bool,
    /// Unix ms of the last mutation.
    pub last_activity: i64,
    /// Increases by one per mutation within a session.
    #[serde(default)]
    pub revision: u64,
}

impl SessionSnapshot {
    /// A snapshot may be resumed only while it is younger than the idle threshold.
    pub fn is_valid_for_resume(&self, now_ms: i64, idle_threshold_ms: i64) -> bool {
        now_ms.saturating_sub(self.last_activity) < idle_threshold_ms
    }
}

/// A state change. The only way session state is modified.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// The user submitted a message.
    AppendUser { text: String, at_ms: i64 },
    /// A closing phrase was detected in the latest user message.
    MarkEnded { at_ms: i64 },
    /// A successful exchange: assistant reply, replacement lead, backend end flag.
    MergeReply {
        reply: String,
        lead: Option<LeadRecord>,
        end: bool,
        at_ms: i64,
    },
    /// Full reset: new session id, empty transcript, no lead, latch cleared.
    Reset { at_ms: i64 },
}

/// What an applied mutation changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    /// The end latch went false -> true.
    pub ended_edge: bool,
}

/// Live session state owned by the engine.
#[derive(Debug, Clone)]
pub struct SessionState {
    session_id: SessionId,
    conversation: Vec<Message>,
    lead: Option<LeadRecord>,
    ended: EndLatch,
    last_activity: i64,
    revision: u64,
}

fn timestamp_from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

impl SessionState {
    /// Fresh, empty session.
    pub fn new(now_ms: i64) -> Self {
        Self {
            session_id: new_session_id(),
            conversation: Vec::new(),
            lead: None,
            ended: EndLatch::default(),
            last_activity: now_ms,
            revision: 0,
        }
    }

    /// Resume from a stored snapshot (validity is the caller's decision).
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        let mut ended = EndLatch::default();
        if snapshot.ended {
            ended.latch();
        }
        let session_id = if snapshot.session_id.is_empty() {
            new_session_id()
        } else {
            snapshot.session_id
        };
        Self {
            session_id,
            conversation: snapshot.conversation,
            lead: snapshot.lead,
            ended,
            last_activity: snapshot.last_activity,
            revision: snapshot.revision,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            conversation: self.conversation.clone(),
            lead: self.lead.clone(),
            ended: self.ended.is_set(),
            last_activity: self.last_activity,
            revision: self.revision,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn conversation(&self) -> &[Message] {
        &self.conversation
    }

    pub fn lead(&self) -> Option<&LeadRecord> {
        self.lead.as_ref()
    }

    pub fn ended(&self) -> bool {
        self.ended.is_set()
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity
    }

    pub fn is_empty(&self) -> bool {
        self.conversation.is_empty()
    }

    /// Text of the most recent user message, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        self.conversation
            .iter()
            .rev()
            .find(|m| m.sender == Sender::User)
            .map(|m| m.text.as_str())
    }

    /// Apply one mutation atomically.
    pub fn apply(&mut self, mutation: Mutation) -> Applied {
        let mut applied = Applied::default();
        let at_ms = match mutation {
            Mutation::AppendUser { text, at_ms } => {
                self.conversation
                    .push(Message::user(text, timestamp_from_ms(at_ms)));
                at_ms
            }
            Mutation::MarkEnded { at_ms } => {
                applied.ended_edge = self.ended.latch();
                at_ms
            }
            Mutation::MergeReply {
                reply,
                lead,
                end,
                at_ms,
            } => {
                self.conversation
                    .push(Message::assistant(reply, timestamp_from_ms(at_ms)));
                self.lead = lead;
                if end {
                    applied.ended_edge = self.ended.latch();
                }
                at_ms
            }
            Mutation::Reset { at_ms } => {
                *self = Self::new(at_ms);
                return applied;
            }
        };
        self.last_activity = self.last_activity.max(at_ms);
        self.revision += 1;
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn latch_reports_edge_once() {
        let mut l = EndLatch::default();
        assert!(l.latch());
        assert!(!l.latch());
        assert!(l.is_set());
    }

    #[test]
    fn backend_end_false_never_unlatches() {
        let mut s = SessionState::new(0);
        s.apply(Mutation::AppendUser { text: "bye".into(), at_ms: 1 });
        assert!(s.apply(Mutation::MarkEnded { at_ms: 1 }).ended_edge);
        let applied = s.apply(Mutation::MergeReply {
            reply: "See you".into(),
            lead: None,
            end: false,
            at_ms: 2,
        });
        assert!(!applied.ended_edge);
        assert!(s.ended());
    }

    #[test]
    fn last_activity_never_decreases() {
        let mut s = SessionState::new(1_000);
        s.apply(Mutation::AppendUser { text: "hi".into(), at_ms: 5_000 });
        s.apply(Mutation::AppendUser { text: "again".into(), at_ms: 4_000 });
        assert_eq!(s.last_activity(), 5_000);
        assert_eq!(s.snapshot().revision, 2);
    }

    #[test]
    fn reset_clears_everything_and_rotates_id() {
        let mut s = SessionState::new(0);
        let old_id = s.session_id().to_string();
        s.apply(Mutation::AppendUser { text: "hi".into(), at_ms: 1 });
        s.apply(Mutation::MarkEnded { at_ms: 1 });
        s.apply(Mutation::Reset { at_ms: 2 });
        assert!(s.is_empty());
        assert!(!s.ended());
        assert!(s.lead().is_none());
        assert_ne!(s.session_id(), old_id);
    }

    #[test]
    fn snapshot_validity_boundary() {
        let snap = SessionState::new(0).snapshot();
        assert!(snap.is_valid_for_resume(299_999, 300_000));
        assert!(!snap.is_valid_for_resume(300_000, 300_000));
    }

    #[test]
    fn snapshot_validity_saturates_on_extreme_activity() {
        let mut snap = SessionState::new(0).snapshot();
        snap.last_activity = i64::MIN;
        assert!(!snap.is_valid_for_resume(1_700_000_000_000, 300_000));
        snap.last_activity = i64::MAX;
        assert!(snap.is_valid_for_resume(i64::MIN, 300_000));
    }

    #[test]
    fn snapshot_reads_legacy_shape() {
        let v = json!({
            "conversation": [{"sender": "bot", "text": "Hello", "timestamp": "2026-01-01T00:00:00Z"}],
            "leadData": {"summary": "s", "company": "Acme", "critical": true},
            "end": false,
            "lastActivity": 42
        });
        let snap: SessionSnapshot = serde_json::from_value(v).unwrap();
        assert_eq!(snap.conversation[0].sender, Sender::Assistant);
        let lead = snap.lead.unwrap();
        assert_eq!(lead.company.as_deref(), Some("Acme"));
        assert_eq!(lead.extra.get("critical"), Some(&json!(true)));
        assert_eq!(snap.last_activity, 42);
    }

    #[test]
    fn merged_for_display_reads_fenced_summary() {
        let lead = LeadRecord {
            company: Some("Old".into()),
            summary: "```json\n{\"company\": \"Acme\", \"budget\": \"10k\"}\n```".into(),
            ..Default::default()
        };
        let shown = lead.merged_for_display();
        assert_eq!(shown.company.as_deref(), Some("Acme"));
        assert_eq!(shown.budget.as_deref(), Some("10k"));
    }

    #[test]
    fn merged_for_display_keeps_plain_or_broken_summary() {
        let plain = LeadRecord { summary: "Acme wants a demo".into(), ..Default::default() };
        assert_eq!(plain.merged_for_display(), plain);
        let broken = LeadRecord { summary: "```json {oops ```".into(), ..Default::default() };
        assert_eq!(broken.merged_for_display(), broken);
    }
}
