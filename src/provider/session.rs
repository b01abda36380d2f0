//! Single-use, cancellable streaming generation.
//!
//! A [`Session`] moves `Idle -> Generating -> {Completed | Cancelled | Failed}`
//! (or straight `Idle -> Failed` when a pre-flight check rejects the call) and
//! never leaves a terminal state. Output is delivered through a
//! [`GenerationStream`]: token events in generation order, then exactly one
//! [`SessionEvent::Completed`], then the end of the stream.

use super::error::GenerationError;
use super::options::GenerationOptions;
use super::prompt::Prompt;
use super::types::{
    Backend, BackendEvent, FinishReason, GenerationResult, SessionConfig, SessionEvent,
    SessionState, TokenUsage,
};
use crate::chat::{Message, Role};
use futures_core::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 32;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

macro_rules! session_log {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}

#[derive(Debug, Clone)]
struct StateCell(Arc<Mutex<SessionState>>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(SessionState::Idle)))
    }

    fn get(&self) -> SessionState {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, state: SessionState) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Leave `Idle` for `next`, or report the state that blocked it.
    fn leave_idle(&self, next: SessionState) -> Result<(), SessionState> {
        let mut cur = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if *cur != SessionState::Idle {
            return Err(*cur);
        }
        *cur = next;
        Ok(())
    }
}

pub struct Session {
    id: u64,
    backend: Arc<dyn Backend>,
    config: SessionConfig,
    state: StateCell,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("backend", &self.backend.name())
            .field("state", &self.state.get())
            .finish()
    }
}

impl Session {
    pub fn new(backend: Arc<dyn Backend>, config: SessionConfig) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            backend,
            config,
            state: StateCell::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Start the one generation this session may run.
    ///
    /// Returns immediately; output arrives on the returned stream. Misuse
    /// (`InvalidState`, or `EmptyTranscript` when the transcript does not end
    /// with the pending user turn) is reported here and produces no events.
    /// Pre-flight rejections (`ProviderUnavailable`, `InputTooLong`) are
    /// delivered as the stream's only event.
    pub fn generate(
        &self,
        messages: &[Message],
        options: Option<GenerationOptions>,
    ) -> Result<GenerationStream, GenerationError> {
        let current = self.state.get();
        if current != SessionState::Idle {
            return Err(invalid_state(current));
        }
        if messages.last().map(Message::role) != Some(Role::User) {
            return Err(GenerationError::EmptyTranscript);
        }

        let options = options.unwrap_or_else(|| self.config.defaults.clone());
        let prompt = Prompt::assemble(&options.system_prompt, messages);

        let preflight = if self.backend.is_available() {
            self.backend.check_prompt(&prompt)
        } else {
            Err(GenerationError::ProviderUnavailable(format!(
                "{} backend is not available",
                self.backend.name()
            )))
        };

        let next = if preflight.is_ok() {
            SessionState::Generating
        } else {
            SessionState::Failed
        };
        self.state.leave_idle(next).map_err(invalid_state)?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let stream = GenerationStream {
            rx,
            cancel: self.cancel.clone(),
            done: false,
        };

        if let Err(e) = preflight {
            tracing::warn!(session = self.id, error = %e, "generation rejected before start");
            // Fresh channel, so there is room for the single event.
            let _ = tx.try_send(SessionEvent::Completed(GenerationResult::failed(e)));
            return Ok(stream);
        }

        let driver = Driver {
            id: self.id,
            backend: self.backend.clone(),
            cancel: self.cancel.clone(),
            state: self.state.clone(),
            tx,
            verbose: self.config.log,
        };
        tokio::spawn(driver.run(prompt, options));

        Ok(stream)
    }

    /// Callback form of [`Session::generate`].
    ///
    /// Both callbacks run on one task, in order; `on_completion` runs exactly
    /// once. The handle resolves after `on_completion` returned.
    #[cfg_attr(not(feature = "tui"), allow(dead_code))]
    pub fn generate_with<T, C>(
        &self,
        messages: &[Message],
        options: Option<GenerationOptions>,
        mut on_token: T,
        on_completion: C,
    ) -> Result<JoinHandle<()>, GenerationError>
    where
        T: FnMut(String) + Send + 'static,
        C: FnOnce(GenerationResult) + Send + 'static,
    {
        let mut stream = self.generate(messages, options)?;
        Ok(tokio::spawn(async move {
            while let Some(ev) = stream.next().await {
                match ev {
                    SessionEvent::Token(t) => on_token(t),
                    SessionEvent::Completed(result) => {
                        on_completion(result);
                        return;
                    }
                }
            }
        }))
    }

    /// Stop an in-flight generation. No-op unless generating; idempotent.
    pub fn cancel(&self) {
        self.canceller().cancel();
    }

    /// A detachable handle that can cancel this session from another task.
    pub fn canceller(&self) -> SessionCanceller {
        SessionCanceller {
            id: self.id,
            state: self.state.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

fn invalid_state(state: SessionState) -> GenerationError {
    GenerationError::InvalidState(format!("generate called on a {state:?} session"))
}

#[derive(Debug, Clone)]
pub struct SessionCanceller {
    id: u64,
    state: StateCell,
    cancel: CancellationToken,
}

impl SessionCanceller {
    pub fn cancel(&self) {
        if self.state.get() != SessionState::Generating || self.cancel.is_cancelled() {
            return;
        }
        tracing::debug!(session = self.id, "cancellation requested");
        self.cancel.cancel();
    }
}

/// Consumer side of a generation.
///
/// Tokens still buffered when the session is cancelled are dropped, so no
/// token is observed after `cancel()` returns.
#[derive(Debug)]
pub struct GenerationStream {
    rx: mpsc::Receiver<SessionEvent>,
    cancel: CancellationToken,
    done: bool,
}

impl GenerationStream {
    /// Drain the stream and return the terminal result.
    #[cfg(test)]
    pub async fn result(mut self) -> GenerationResult {
        while let Some(ev) = self.next().await {
            if let SessionEvent::Completed(result) = ev {
                return result;
            }
        }
        lost_driver()
    }
}

impl Stream for GenerationStream {
    type Item = SessionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<SessionEvent>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        loop {
            match ready!(this.rx.poll_recv(cx)) {
                Some(SessionEvent::Token(_)) if this.cancel.is_cancelled() => continue,
                Some(ev @ SessionEvent::Token(_)) => return Poll::Ready(Some(ev)),
                Some(ev @ SessionEvent::Completed(_)) => {
                    this.done = true;
                    return Poll::Ready(Some(ev));
                }
                None => {
                    // The driver went away without a result (panicked); still
                    // hand out the one terminal event.
                    this.done = true;
                    return Poll::Ready(Some(SessionEvent::Completed(lost_driver())));
                }
            }
        }
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        // Nobody is left to read the output; stop the driver and the backend.
        if !self.done {
            self.cancel.cancel();
        }
    }
}

fn lost_driver() -> GenerationResult {
    GenerationResult::failed(GenerationError::GenericFailure(
        "generation task ended without a result".to_string(),
    ))
}

enum Outcome {
    Finished {
        reason: FinishReason,
        usage: Option<TokenUsage>,
        findings: Vec<String>,
    },
    Failed(GenerationError),
    Cancelled,
}

/// Background task that owns the backend stream for one generation.
struct Driver {
    id: u64,
    backend: Arc<dyn Backend>,
    cancel: CancellationToken,
    state: StateCell,
    tx: mpsc::Sender<SessionEvent>,
    verbose: bool,
}

impl Driver {
    async fn run(self, prompt: Prompt, options: GenerationOptions) {
        let started = Instant::now();
        session_log!(
            self.verbose,
            session = self.id,
            backend = self.backend.name(),
            prompt_chars = prompt.char_len(),
            messages = prompt.message_count(),
            variant = %options.model_variant,
            "generation started"
        );

        let mut text = String::new();
        let mut chunks = 0usize;
        let outcome = self.produce(prompt, options, &mut text, &mut chunks).await;
        let latency = started.elapsed();

        let (state, result) = match outcome {
            Outcome::Finished {
                reason,
                usage,
                findings,
            } => (
                SessionState::Completed,
                GenerationResult {
                    text,
                    usage,
                    finish_reason: reason,
                    latency: Some(latency),
                    safety_findings: findings,
                    error: None,
                },
            ),
            Outcome::Failed(GenerationError::SafetyBlocked) => (
                SessionState::Completed,
                GenerationResult {
                    text,
                    usage: None,
                    finish_reason: FinishReason::Safety,
                    latency: Some(latency),
                    safety_findings: Vec::new(),
                    error: Some(GenerationError::SafetyBlocked),
                },
            ),
            Outcome::Failed(e) => {
                tracing::warn!(session = self.id, error = %e, "generation failed");
                (
                    SessionState::Failed,
                    GenerationResult {
                        latency: Some(latency),
                        ..GenerationResult::failed(e)
                    },
                )
            }
            Outcome::Cancelled => (
                SessionState::Cancelled,
                GenerationResult {
                    latency: Some(latency),
                    ..GenerationResult::failed(GenerationError::Cancelled)
                },
            ),
        };

        self.state.set(state);
        session_log!(
            self.verbose,
            session = self.id,
            finish_reason = %result.finish_reason,
            chunks,
            latency_ms = latency.as_millis() as u64,
            "generation finished"
        );
        // A dropped consumer simply never sees the result.
        let _ = self.tx.send(SessionEvent::Completed(result)).await;
    }

    async fn produce(
        &self,
        prompt: Prompt,
        options: GenerationOptions,
        text: &mut String,
        chunks: &mut usize,
    ) -> Outcome {
        let started = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Outcome::Cancelled,
            res = self.backend.stream(prompt, options) => res,
        };
        let mut stream = match started {
            Ok(s) => s,
            Err(e) => return Outcome::Failed(e),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Outcome::Cancelled,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(BackendEvent::Chunk(chunk))) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    text.push_str(&chunk);
                    *chunks += 1;
                    let sent = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Outcome::Cancelled,
                        sent = self.tx.send(SessionEvent::Token(chunk)) => sent,
                    };
                    if sent.is_err() {
                        // Consumer is gone; stop the backend.
                        return Outcome::Cancelled;
                    }
                }
                Some(Ok(BackendEvent::Finished {
                    reason,
                    usage,
                    findings,
                })) => {
                    return match reason {
                        FinishReason::Stop | FinishReason::Length | FinishReason::Safety => {
                            Outcome::Finished {
                                reason,
                                usage,
                                findings,
                            }
                        }
                        FinishReason::Cancel | FinishReason::Error => Outcome::Failed(
                            GenerationError::GenericFailure(format!(
                                "backend finished with {reason}"
                            )),
                        ),
                    };
                }
                Some(Err(e)) => return Outcome::Failed(e),
                None => {
                    return Outcome::Finished {
                        reason: FinishReason::Stop,
                        usage: None,
                        findings: Vec::new(),
                    }
                }
            }
        }
    }
}
