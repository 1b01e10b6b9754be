//! Assistant backend client (http://localhost:8000 by default).
//!
//! Three JSON endpoints: `/talk` for one exchange, `/lead` to finalize the lead summary,
//! and `/reset` to drop the server-side session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::session::LeadRecord;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend api error: {0}")]
    Api(String),
}

/// Reply to `POST /talk`. Every field is optional on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TalkResponse {
    #[serde(default)]
    pub reply: String,
    #[serde(default)]
    pub lead: Option<LeadRecord>,
    #[serde(default)]
    pub end: bool,
    #[serde(default)]
    pub show_image: bool,
    #[serde(default, rename = "audio_url", skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(default, rename = "youtube_url", skip_serializing_if = "Option::is_none")]
    pub youtube_url: Option<String>,
}

/// Reply to `POST /lead`. A lead with an empty summary means "not ready yet".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadResponse {
    #[serde(default)]
    pub lead: Option<LeadRecord>,
}

#[derive(Debug, Serialize)]
struct TalkRequest<'a> {
    message: &'a str,
}

#[derive(Debug, Serialize)]
struct LeadRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

/// Conversational backend. The engine only talks to the backend through this trait.
#[async_trait]
pub trait Backend: Send + Sync {
    /// One exchange: send the user's text, receive the reply and side effects.
    async fn talk(&self, message: &str) -> Result<TalkResponse, BackendError>;

    /// Fetch or finalize the lead summary, optionally with the last user message as context.
    async fn lead(&self, message: Option<&str>) -> Result<LeadResponse, BackendError>;

    /// Ask the backend to drop its server-side session.
    async fn reset(&self) -> Result<(), BackendError>;
}

/// HTTP client for the backend.
#[derive(Clone)]
pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Relative cue URLs (e.g. `/audio/reply.wav`) are served by the backend itself.
    pub fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            format!("{}/{}", self.base_url, url)
        }
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response, BackendError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.post(&url);
        if let Some(b) = body {
            req = req.json(b);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(BackendError::Api(format!("{} {}", status, body)));
        }
        Ok(res)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    /// POST /talk
    async fn talk(&self, message: &str) -> Result<TalkResponse, BackendError> {
        let res = self.post("/talk", Some(&TalkRequest { message })).await?;
        let mut data: TalkResponse = res.json().await?;
        data.audio_url = data
            .audio_url
            .filter(|u| !u.trim().is_empty())
            .map(|u| self.resolve_url(&u));
        data.youtube_url = data.youtube_url.filter(|u| !u.trim().is_empty());
        Ok(data)
    }

    /// POST /lead
    async fn lead(&self, message: Option<&str>) -> Result<LeadResponse, BackendError> {
        let res = self.post("/lead", Some(&LeadRequest { message })).await?;
        let data: LeadResponse = res.json().await?;
        Ok(data)
    }

    /// POST /reset (no body)
    async fn reset(&self) -> Result<(), BackendError> {
        self.post::<()>("/reset", None).await?;
        Ok(())
    }
}
