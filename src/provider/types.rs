use super::error::GenerationError;
use super::options::GenerationOptions;
use super::prompt::Prompt;
use super::session::Session;
use futures_core::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    Safety,
    Cancel,
    Error,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::Safety => "safety",
            FinishReason::Cancel => "cancel",
            FinishReason::Error => "error",
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Terminal outcome of one generation attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    /// Concatenated output. Empty for cancelled and failed attempts.
    pub text: String,
    pub usage: Option<TokenUsage>,
    pub finish_reason: FinishReason,
    pub latency: Option<Duration>,
    /// Coarse categories only; no policy internals.
    pub safety_findings: Vec<String>,
    pub error: Option<GenerationError>,
}

impl GenerationResult {
    pub fn failed(error: GenerationError) -> Self {
        let finish_reason = if error.is_cancelled() {
            FinishReason::Cancel
        } else {
            FinishReason::Error
        };
        Self {
            text: String::new(),
            usage: None,
            finish_reason,
            latency: None,
            safety_findings: Vec::new(),
            error: Some(error),
        }
    }

    /// Whether the turn counts as completed and may be recorded.
    pub fn is_completed(&self) -> bool {
        matches!(
            self.finish_reason,
            FinishReason::Stop | FinishReason::Length | FinishReason::Safety
        )
    }
}

/// What a session delivers to its consumer, in order. `Completed` is last.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Token(String),
    Completed(GenerationResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Generating,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Used when `generate` is called without explicit options.
    pub defaults: GenerationOptions,
    /// Log start and terminal events at info instead of debug.
    pub log: bool,
}

/// Raw output of a backend, before the session maps it to a result.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Chunk(String),
    /// Optional; a stream that just ends is a natural stop.
    Finished {
        reason: FinishReason,
        usage: Option<TokenUsage>,
        findings: Vec<String>,
    },
}

pub type BackendStream = BoxStream<'static, Result<BackendEvent, GenerationError>>;

pub type BackendFuture =
    Pin<Box<dyn Future<Output = Result<BackendStream, GenerationError>> + Send>>;

/// A local model runtime that turns one prompt into a stream of chunks.
///
/// Dropping the returned stream must stop the underlying work.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap, local re-check used right before a generation starts.
    fn is_available(&self) -> bool;

    /// Reject prompts the runtime cannot take, before anything streams.
    fn check_prompt(&self, prompt: &Prompt) -> Result<(), GenerationError>;

    fn stream(&self, prompt: Prompt, options: GenerationOptions) -> BackendFuture;
}

/// One on-device generation backend and the gate in front of it.
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Synchronous capability probe. Never fails; never touches the network.
    fn is_supported(&self) -> bool;

    fn backend(&self) -> Arc<dyn Backend>;

    /// Build a fresh single-use session. No generation work happens here.
    fn make_session(&self, config: SessionConfig) -> Result<Session, GenerationError> {
        if !self.is_supported() {
            return Err(GenerationError::ProviderUnavailable(format!(
                "{} backend cannot run on this device",
                self.name()
            )));
        }
        Ok(Session::new(self.backend(), config))
    }
}
