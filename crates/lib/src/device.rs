//! Device collaborators consumed by the engine: audio/video playback and speech-to-text.
//!
//! The engine never depends on a concrete device. Missing or failing devices surface as
//! notices; they never abort a conversation.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("{0} is not supported on this device")]
    Unavailable(String),
    #[error("{0}")]
    Failed(String),
}

/// Sink for audio and video cues returned with a reply.
pub trait MediaSink: Send + Sync {
    /// Play the audio at `url`, superseding any clip still playing.
    fn play_audio(&self, url: &str) -> Result<(), CapabilityError>;

    /// Show the video at `url`. An empty string hides the current video.
    fn show_video(&self, url: &str) -> Result<(), CapabilityError>;
}

/// Media sink for environments without playback; every cue is reported as unsupported.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMedia;

impl MediaSink for NoMedia {
    fn play_audio(&self, _url: &str) -> Result<(), CapabilityError> {
        Err(CapabilityError::Unavailable("audio playback".to_string()))
    }

    fn show_video(&self, url: &str) -> Result<(), CapabilityError> {
        if url.is_empty() {
            return Ok(());
        }
        Err(CapabilityError::Unavailable("video playback".to_string()))
    }
}

/// Callback events from a speech-to-text capture started with [`SpeechToText::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEvent {
    /// Final transcript; replaces the pending input.
    Result(String),
    /// Recognition failed.
    Error(String),
    /// Capture stopped (after a result, an error, or silence).
    End,
}

/// Speech-to-text capability. Results arrive later as [`SpeechEvent`]s fed to the engine.
pub trait SpeechToText: Send + Sync {
    fn start(&self) -> Result<(), CapabilityError>;
}

/// Speech capability for devices without a recognizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedSpeech;

impl SpeechToText for UnsupportedSpeech {
    fn start(&self) -> Result<(), CapabilityError> {
        Err(CapabilityError::Unavailable("speech recognition".to_string()))
    }
}
