use super::{ChatThread, Message};
use crate::provider::{
    resolve_with_defaults, ConfigError, GenerationError, GenerationResult, GenerationStream,
    OptionOverrides, Provider, SafetyPolicy, Session, SessionCanceller, SessionConfig,
    SessionEvent, StylePreset,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_stream::StreamExt;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("no such thread: {0}")]
    UnknownThread(String),

    #[error("thread id prefix {0} is ambiguous")]
    AmbiguousThread(String),

    #[error("thread {0} already has a generation in flight")]
    ThreadBusy(String),

    #[error("message is empty")]
    EmptyMessage,

    #[error(transparent)]
    InvalidOptions(#[from] ConfigError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorSettings {
    /// Applied to every turn below per-call overrides.
    pub defaults: OptionOverrides,
    /// Forwarded to each session's logging flag.
    pub log_generations: bool,
}

/// Owns the chat threads and runs one session per user turn.
pub struct Orchestrator {
    provider: Arc<dyn Provider>,
    settings: OrchestratorSettings,
    threads: Vec<ChatThread>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn Provider>,
        settings: OrchestratorSettings,
        threads: Vec<ChatThread>,
    ) -> Self {
        Self {
            provider,
            settings,
            threads,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn threads(&self) -> &[ChatThread] {
        &self.threads
    }

    pub fn thread(&self, id: &str) -> Option<&ChatThread> {
        self.threads.iter().find(|t| t.id() == id)
    }

    /// Exact id, or a prefix matching exactly one thread.
    pub fn resolve_id(&self, key: &str) -> Result<String, ChatError> {
        if let Some(t) = self.thread(key) {
            return Ok(t.id().to_string());
        }
        let mut hits = self.threads.iter().filter(|t| t.id().starts_with(key));
        match (hits.next(), hits.next()) {
            (Some(t), None) if !key.is_empty() => Ok(t.id().to_string()),
            (Some(_), Some(_)) => Err(ChatError::AmbiguousThread(key.to_string())),
            _ => Err(ChatError::UnknownThread(key.to_string())),
        }
    }

    pub fn create_thread(&mut self, title: impl Into<String>) -> String {
        let thread = ChatThread::new(title);
        let id = thread.id().to_string();
        tracing::debug!(thread = %id, title = thread.title(), "thread created");
        self.threads.push(thread);
        id
    }

    pub fn rename(&mut self, id: &str, title: impl Into<String>) -> Result<(), ChatError> {
        self.thread_mut(id)?.rename(title);
        Ok(())
    }

    pub fn set_style(&mut self, id: &str, style: StylePreset) -> Result<(), ChatError> {
        self.thread_mut(id)?.set_style(style);
        Ok(())
    }

    pub fn set_guardrails(&mut self, id: &str, enabled: bool) -> Result<(), ChatError> {
        self.thread_mut(id)?.set_guardrails(enabled);
        Ok(())
    }

    pub fn clear_history(&mut self, id: &str) -> Result<(), ChatError> {
        self.thread_mut(id)?.clear_history();
        Ok(())
    }

    /// Empty every thread's messages; ids, titles and counters stay.
    pub fn clear_all(&mut self) {
        for t in &mut self.threads {
            t.clear_history();
        }
        tracing::info!(threads = self.threads.len(), "cleared all chat history");
    }

    pub fn delete_thread(&mut self, id: &str) -> Result<ChatThread, ChatError> {
        if self.is_busy(id) {
            return Err(ChatError::ThreadBusy(id.to_string()));
        }
        let pos = self
            .threads
            .iter()
            .position(|t| t.id() == id)
            .ok_or_else(|| ChatError::UnknownThread(id.to_string()))?;
        Ok(self.threads.remove(pos))
    }

    pub fn is_busy(&self, id: &str) -> bool {
        lock(&self.in_flight).contains(id)
    }

    /// Start a turn for `thread_id`. Nothing is recorded until the turn is
    /// handed back through [`Orchestrator::apply`].
    pub fn send(
        &self,
        thread_id: &str,
        text: &str,
        overrides: &OptionOverrides,
    ) -> Result<Turn, ChatError> {
        let (pending, session, transcript) = self.prepare(thread_id, text, overrides)?;
        let events = session.generate(&transcript, None)?;
        Ok(Turn {
            pending,
            session,
            events,
            result: None,
        })
    }

    /// Callback form of [`Orchestrator::send`]. Tokens go to `on_token` and the
    /// finished turn to `on_done`, both on one background task.
    #[cfg(feature = "tui")]
    pub fn send_with<T, D>(
        &self,
        thread_id: &str,
        text: &str,
        overrides: &OptionOverrides,
        on_token: T,
        on_done: D,
    ) -> Result<SessionCanceller, ChatError>
    where
        T: FnMut(String) + Send + 'static,
        D: FnOnce(CompletedTurn) + Send + 'static,
    {
        let (pending, session, transcript) = self.prepare(thread_id, text, overrides)?;
        session.generate_with(&transcript, None, on_token, move |result| {
            on_done(pending.complete(result))
        })?;
        Ok(session.canceller())
    }

    fn prepare(
        &self,
        thread_id: &str,
        text: &str,
        overrides: &OptionOverrides,
    ) -> Result<(PendingTurn, Session, Vec<Message>), ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        overrides.validate()?;
        self.settings.defaults.validate()?;

        let thread = self
            .thread(thread_id)
            .ok_or_else(|| ChatError::UnknownThread(thread_id.to_string()))?;
        let guard = InFlight::acquire(&self.in_flight, thread_id)
            .ok_or_else(|| ChatError::ThreadBusy(thread_id.to_string()))?;

        let per_thread = OptionOverrides {
            safety: Some(SafetyPolicy::from_guardrails(thread.guardrails())),
            ..OptionOverrides::default()
        };
        let options = resolve_with_defaults(
            thread.style(),
            &overrides.clone().or(&per_thread),
            &self.settings.defaults,
        );

        let user = Message::user(text);
        let transcript = thread.transcript_with(&user);

        let session = self.provider.make_session(SessionConfig {
            defaults: options,
            log: self.settings.log_generations,
        })?;
        tracing::debug!(
            thread = thread_id,
            session = session.id(),
            style = %thread.style(),
            history = transcript.len() - 1,
            "turn started"
        );

        let pending = PendingTurn {
            thread_id: thread_id.to_string(),
            user,
            style: thread.style(),
            guard,
        };
        Ok((pending, session, transcript))
    }

    /// Record a finished turn. Completed turns append the user and assistant
    /// messages; cancelled and failed turns leave the thread untouched.
    pub fn apply(&mut self, done: CompletedTurn) -> Result<Option<Message>, ChatError> {
        let CompletedTurn {
            thread_id,
            user,
            style,
            result,
            guard,
        } = done;

        if !result.is_completed() {
            tracing::debug!(
                thread = %thread_id,
                finish_reason = %result.finish_reason,
                "turn not recorded"
            );
            drop(guard);
            return Ok(None);
        }

        let mut assistant = Message::assistant(result.text.clone())
            .with_metadata("finish_reason", result.finish_reason.as_str())
            .with_metadata("style", style.as_str());
        if let Some(latency) = result.latency {
            assistant = assistant.with_metadata("latency_ms", latency.as_millis().to_string());
        }
        if let Some(usage) = result.usage {
            assistant = assistant
                .with_metadata("prompt_tokens", usage.prompt_tokens.to_string())
                .with_metadata("completion_tokens", usage.completion_tokens.to_string());
        }
        if !result.safety_findings.is_empty() {
            let findings = result.safety_findings.join(",");
            assistant = assistant.with_metadata("safety_findings", findings);
        }

        let thread = self.thread_mut(&thread_id)?;
        thread.record_turn(user, assistant.clone());
        drop(guard);
        Ok(Some(assistant))
    }

    fn thread_mut(&mut self, id: &str) -> Result<&mut ChatThread, ChatError> {
        self.threads
            .iter_mut()
            .find(|t| t.id() == id)
            .ok_or_else(|| ChatError::UnknownThread(id.to_string()))
    }
}

fn lock(set: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}

/// Marks a thread busy for as long as it lives.
struct InFlight {
    set: Arc<Mutex<HashSet<String>>>,
    thread_id: String,
}

impl InFlight {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, thread_id: &str) -> Option<Self> {
        if !lock(set).insert(thread_id.to_string()) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            thread_id: thread_id.to_string(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.thread_id);
    }
}

/// What a turn needs to be recorded once its session finishes.
struct PendingTurn {
    thread_id: String,
    user: Message,
    style: StylePreset,
    guard: InFlight,
}

impl PendingTurn {
    fn complete(self, result: GenerationResult) -> CompletedTurn {
        CompletedTurn {
            thread_id: self.thread_id,
            user: self.user,
            style: self.style,
            result,
            guard: self.guard,
        }
    }
}

/// A user turn in flight.
pub struct Turn {
    pending: PendingTurn,
    session: Session,
    events: GenerationStream,
    result: Option<GenerationResult>,
}

impl Turn {
    pub fn cancel(&self) {
        self.session.cancel();
    }

    pub fn canceller(&self) -> SessionCanceller {
        self.session.canceller()
    }

    /// Next streamed chunk; `None` once the terminal result has arrived.
    pub async fn next_token(&mut self) -> Option<String> {
        if self.result.is_some() {
            return None;
        }
        while let Some(ev) = self.events.next().await {
            match ev {
                SessionEvent::Token(t) => return Some(t),
                SessionEvent::Completed(r) => {
                    self.result = Some(r);
                    return None;
                }
            }
        }
        None
    }

    /// Wait for the terminal result, discarding any tokens not yet read.
    pub async fn wait(mut self) -> CompletedTurn {
        while self.next_token().await.is_some() {}
        let result = self.result.take().unwrap_or_else(|| {
            GenerationResult::failed(GenerationError::GenericFailure(
                "turn ended without a result".to_string(),
            ))
        });
        tracing::trace!(
            session = self.session.id(),
            state = ?self.session.state(),
            "turn drained"
        );
        self.pending.complete(result)
    }
}

/// A turn whose session reached a terminal state, ready to be applied.
pub struct CompletedTurn {
    thread_id: String,
    user: Message,
    style: StylePreset,
    result: GenerationResult,
    guard: InFlight,
}

impl CompletedTurn {
    pub fn result(&self) -> &GenerationResult {
        &self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::stub::{Script, StubConfig, StubProvider};
    use crate::chat::Role;
    use crate::provider::{Backend, BackendFuture, FinishReason, GenerationOptions, Prompt};

    fn quick() -> StubConfig {
        StubConfig {
            chunk_delay_ms: 0,
            ..StubConfig::default()
        }
    }

    fn orchestrator(provider: impl Provider + 'static) -> Orchestrator {
        Orchestrator::new(Arc::new(provider), OrchestratorSettings::default(), Vec::new())
    }

    #[tokio::test]
    async fn completed_turn_appends_assistant_message() {
        let mut orch = orchestrator(StubProvider::scripted(
            quick(),
            Script::new(["Hi", " there", "!"]),
        ));
        let id = orch.create_thread("greeting");

        let mut turn = orch.send(&id, "Hello", &OptionOverrides::default()).unwrap();
        let mut tokens = Vec::new();
        while let Some(t) = turn.next_token().await {
            tokens.push(t);
        }
        assert_eq!(tokens, vec!["Hi", " there", "!"]);

        let done = turn.wait().await;
        assert_eq!(done.result().finish_reason, FinishReason::Stop);
        let msg = orch.apply(done).unwrap().unwrap();
        assert_eq!(msg.text(), "Hi there!");
        let meta = msg.metadata();
        assert_eq!(meta.get("finish_reason").map(String::as_str), Some("stop"));
        assert_eq!(meta.get("style").map(String::as_str), Some("balanced"));
        assert_eq!(meta.get("completion_tokens").map(String::as_str), Some("3"));

        let thread = orch.thread(&id).unwrap();
        let roles: Vec<_> = thread.messages().iter().map(|m| m.role()).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(thread.messages()[0].text(), "Hello");
        assert_eq!(thread.turns(), 1);
        assert!(!orch.is_busy(&id));
    }

    #[tokio::test]
    async fn cancelled_turn_appends_nothing() {
        let mut orch = orchestrator(StubProvider::scripted(
            quick(),
            Script::new(["Hi", " there", "!"]).stall_after(2),
        ));
        let id = orch.create_thread("greeting");

        let mut turn = orch.send(&id, "Hello", &OptionOverrides::default()).unwrap();
        assert_eq!(turn.next_token().await.as_deref(), Some("Hi"));
        assert_eq!(turn.next_token().await.as_deref(), Some(" there"));
        turn.cancel();
        assert_eq!(turn.next_token().await, None);

        let done = turn.wait().await;
        assert_eq!(done.result().finish_reason, FinishReason::Cancel);
        assert!(orch.apply(done).unwrap().is_none());
        assert!(orch.thread(&id).unwrap().messages().is_empty());
        assert!(!orch.is_busy(&id));
    }

    #[tokio::test]
    async fn failed_turn_appends_nothing_and_can_be_retried() {
        let mut orch = orchestrator(StubProvider::scripted(
            quick(),
            Script::new(["x"]).fail(GenerationError::GenericFailure("backend crashed".into())),
        ));
        let id = orch.create_thread("t");

        for _ in 0..2 {
            let done = orch
                .send(&id, "Hello", &OptionOverrides::default())
                .unwrap()
                .wait()
                .await;
            assert_eq!(done.result().finish_reason, FinishReason::Error);
            assert!(orch.apply(done).unwrap().is_none());
        }
        assert!(orch.thread(&id).unwrap().messages().is_empty());
    }

    #[tokio::test]
    async fn unsupported_provider_fails_before_generating() {
        let mut orch = orchestrator(StubProvider::new(StubConfig {
            supported: false,
            ..quick()
        }));
        let id = orch.create_thread("t");

        let err = orch.send(&id, "Hello", &OptionOverrides::default()).err().unwrap();
        assert!(matches!(
            err,
            ChatError::Generation(GenerationError::ProviderUnavailable(_))
        ));
        assert!(!orch.is_busy(&id));
        assert!(orch.thread(&id).unwrap().messages().is_empty());
    }

    #[tokio::test]
    async fn one_turn_in_flight_per_thread() {
        let mut orch = orchestrator(StubProvider::scripted(
            quick(),
            Script::new(["a"]).stall_after(1),
        ));
        let a = orch.create_thread("a");
        let b = orch.create_thread("b");

        let turn_a = orch.send(&a, "one", &OptionOverrides::default()).unwrap();
        assert!(matches!(
            orch.send(&a, "two", &OptionOverrides::default()).err().unwrap(),
            ChatError::ThreadBusy(_)
        ));
        assert!(matches!(orch.delete_thread(&a), Err(ChatError::ThreadBusy(_))));

        let turn_b = orch.send(&b, "other", &OptionOverrides::default()).unwrap();
        turn_b.cancel();
        turn_a.cancel();
        let done_a = turn_a.wait().await;
        let done_b = turn_b.wait().await;
        orch.apply(done_a).unwrap();
        orch.apply(done_b).unwrap();

        assert!(orch.send(&a, "three", &OptionOverrides::default()).is_ok());
    }

    #[cfg(feature = "tui")]
    #[tokio::test]
    async fn callback_turn_delivers_tokens_then_completion() {
        let mut orch = orchestrator(StubProvider::scripted(quick(), Script::new(["a", "b"])));
        let id = orch.create_thread("t");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let tokens = Arc::new(Mutex::new(Vec::new()));
        let sink = tokens.clone();
        orch.send_with(
            &id,
            "Hello",
            &OptionOverrides::default(),
            move |t| sink.lock().unwrap().push(t),
            move |done| {
                let _ = tx.send(done);
            },
        )
        .unwrap();
        assert!(orch.is_busy(&id));

        let done = rx.recv().await.unwrap();
        assert_eq!(*tokens.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(orch.apply(done).unwrap().unwrap().text(), "ab");
        assert!(!orch.is_busy(&id));
    }

    #[tokio::test]
    async fn guardrails_flag_reaches_backend() {
        let config = StubConfig {
            blocked_terms: vec!["secret".into()],
            ..quick()
        };
        let mut orch = orchestrator(StubProvider::new(config));
        let id = orch.create_thread("t");

        let done = orch
            .send(&id, "tell me the secret", &OptionOverrides::default())
            .unwrap()
            .wait()
            .await;
        assert_eq!(done.result().finish_reason, FinishReason::Safety);
        orch.apply(done).unwrap();

        orch.set_guardrails(&id, false).unwrap();
        let done = orch
            .send(&id, "tell me the secret", &OptionOverrides::default())
            .unwrap()
            .wait()
            .await;
        assert_eq!(done.result().finish_reason, FinishReason::Stop);
        assert_eq!(done.result().text, "You said: tell me the secret");
    }

    /// Records the options each generation was started with.
    struct Recording {
        inner: Arc<dyn Backend>,
        seen: Arc<Mutex<Vec<GenerationOptions>>>,
    }

    impl Backend for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }
        fn is_available(&self) -> bool {
            true
        }
        fn check_prompt(&self, prompt: &Prompt) -> Result<(), GenerationError> {
            self.inner.check_prompt(prompt)
        }
        fn stream(&self, prompt: Prompt, options: GenerationOptions) -> BackendFuture {
            self.seen.lock().unwrap().push(options.clone());
            self.inner.stream(prompt, options)
        }
    }

    struct RecordingProvider(Arc<Recording>);

    impl Provider for RecordingProvider {
        fn name(&self) -> &'static str {
            "recording"
        }
        fn is_supported(&self) -> bool {
            true
        }
        fn backend(&self) -> Arc<dyn Backend> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn style_and_overrides_resolve_per_turn() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner = StubProvider::scripted(quick(), Script::new(["ok"])).backend();
        let provider = RecordingProvider(Arc::new(Recording {
            inner,
            seen: seen.clone(),
        }));
        let settings = OrchestratorSettings {
            defaults: OptionOverrides::default()
                .system_prompt("Be brief.")
                .temperature(1.0),
            log_generations: false,
        };
        let mut orch = Orchestrator::new(Arc::new(provider), settings, Vec::new());
        let id = orch.create_thread("t");
        orch.set_style(&id, StylePreset::Precise).unwrap();

        let done = orch.send(&id, "q1", &OptionOverrides::default()).unwrap().wait().await;
        orch.apply(done).unwrap();
        let done = orch
            .send(&id, "q2", &OptionOverrides::default().temperature(1.5))
            .unwrap()
            .wait()
            .await;
        orch.apply(done).unwrap();
        orch.set_style(&id, StylePreset::Balanced).unwrap();
        let done = orch.send(&id, "q3", &OptionOverrides::default()).unwrap().wait().await;
        orch.apply(done).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].temperature, Some(0.25));
        assert_eq!(seen[0].system_prompt, "Be brief.");
        assert_eq!(seen[0].safety, SafetyPolicy::Guarded);
        assert_eq!(seen[1].temperature, Some(1.5));
        assert_eq!(seen[1].top_p, None);
        // The configured default only fills what the preset leaves open.
        assert_eq!(seen[2].temperature, Some(1.0));
    }

    #[tokio::test]
    async fn invalid_overrides_are_rejected() {
        let orch = {
            let mut o = orchestrator(StubProvider::new(quick()));
            o.create_thread("t");
            o
        };
        let id = orch.threads()[0].id().to_string();
        let err = orch
            .send(&id, "hi", &OptionOverrides::default().temperature(3.0))
            .err()
            .unwrap();
        assert!(matches!(err, ChatError::InvalidOptions(_)));
        assert!(matches!(
            orch.send(&id, "   ", &OptionOverrides::default()).err().unwrap(),
            ChatError::EmptyMessage
        ));
    }

    #[tokio::test]
    async fn clear_all_keeps_threads() {
        let mut orch = orchestrator(StubProvider::scripted(quick(), Script::new(["ok"])));
        let a = orch.create_thread("alpha");
        let b = orch.create_thread("beta");
        for id in [&a, &b] {
            let done = orch.send(id, "hi", &OptionOverrides::default()).unwrap().wait().await;
            orch.apply(done).unwrap();
        }

        orch.clear_all();
        let titles: Vec<_> = orch.threads().iter().map(|t| t.title()).collect();
        assert_eq!(titles, vec!["alpha", "beta"]);
        assert!(orch.threads().iter().all(|t| t.messages().is_empty() && t.turns() == 1));
    }

    #[test]
    fn resolve_id_accepts_unique_prefix() {
        let mut orch = orchestrator(StubProvider::new(quick()));
        let id = orch.create_thread("t");
        assert_eq!(orch.resolve_id(&id[..8]).unwrap(), id);
        assert!(matches!(orch.resolve_id("zz-nope"), Err(ChatError::UnknownThread(_))));
        assert!(matches!(orch.resolve_id(""), Err(ChatError::UnknownThread(_))));
    }
}
