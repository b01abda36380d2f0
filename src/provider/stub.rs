use super::{
    Backend, BackendEvent, BackendFuture, BackendStream, FinishReason, GenerationError,
    GenerationOptions, Prompt, Provider, SafetyPolicy, TokenUsage,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StubConfig {
    /// Reported by the capability probe.
    pub supported: bool,
    /// Pause before each chunk.
    pub chunk_delay_ms: u64,
    /// Prompts above this many chars are rejected up front.
    pub max_prompt_chars: Option<usize>,
    /// With guardrails on, a user message containing any of these is refused.
    pub blocked_terms: Vec<String>,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            supported: true,
            chunk_delay_ms: 40,
            max_prompt_chars: Some(16_000),
            blocked_terms: Vec::new(),
        }
    }
}

/// A fixed sequence of chunks and how the stream ends.
#[derive(Debug, Clone, Default)]
pub struct Script {
    chunks: Vec<String>,
    end: ScriptEnd,
    stall_after: Option<usize>,
    #[cfg(test)]
    echo_prompt: bool,
}

#[derive(Debug, Clone)]
enum ScriptEnd {
    Finish {
        reason: FinishReason,
        findings: Vec<String>,
    },
    #[cfg(test)]
    Fail(GenerationError),
}

impl Default for ScriptEnd {
    fn default() -> Self {
        ScriptEnd::Finish {
            reason: FinishReason::Stop,
            findings: Vec::new(),
        }
    }
}

impl Script {
    pub fn new<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Reply with the assembled prompt as a single chunk.
    #[cfg(test)]
    pub fn echo_prompt() -> Self {
        Self {
            echo_prompt: true,
            ..Self::default()
        }
    }

    /// After `n` chunks, produce nothing more until the stream is dropped.
    #[cfg(test)]
    pub fn stall_after(mut self, n: usize) -> Self {
        self.stall_after = Some(n);
        self
    }

    pub fn finish<I, S>(mut self, reason: FinishReason, findings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.end = ScriptEnd::Finish {
            reason,
            findings: findings.into_iter().map(Into::into).collect(),
        };
        self
    }

    #[cfg(test)]
    pub fn fail(mut self, error: GenerationError) -> Self {
        self.end = ScriptEnd::Fail(error);
        self
    }
}

#[derive(Debug, Clone)]
enum Reply {
    /// Answer with "You said: <last user message>".
    Echo,
    #[cfg(test)]
    Script(Script),
}

/// In-process backend that drips canned output.
#[derive(Debug, Clone)]
pub struct StubBackend {
    config: StubConfig,
    reply: Reply,
}

impl StubBackend {
    pub fn echo(config: StubConfig) -> Self {
        Self {
            config,
            reply: Reply::Echo,
        }
    }

    #[cfg(test)]
    pub fn scripted(config: StubConfig, script: Script) -> Self {
        Self {
            config,
            reply: Reply::Script(script),
        }
    }

    fn plan(&self, prompt: &Prompt, options: &GenerationOptions) -> Script {
        match &self.reply {
            #[cfg(test)]
            Reply::Script(s) if s.echo_prompt => Script {
                chunks: vec![prompt.as_str().to_string()],
                ..s.clone()
            },
            #[cfg(test)]
            Reply::Script(s) => s.clone(),
            Reply::Echo => {
                let said = prompt.last_user_text().unwrap_or("").trim();
                if options.safety == SafetyPolicy::Guarded && self.is_blocked(said) {
                    return Script::default().finish(FinishReason::Safety, ["blocked_term"]);
                }
                let reply = format!("You said: {said}");
                Script::new(reply.split_inclusive(' '))
            }
        }
    }

    fn is_blocked(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.config
            .blocked_terms
            .iter()
            .any(|t| !t.is_empty() && lower.contains(&t.to_lowercase()))
    }
}

impl Backend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn is_available(&self) -> bool {
        self.config.supported
    }

    fn check_prompt(&self, prompt: &Prompt) -> Result<(), GenerationError> {
        match self.config.max_prompt_chars {
            Some(limit) if prompt.char_len() > limit => Err(GenerationError::InputTooLong {
                chars: prompt.char_len(),
                limit,
            }),
            _ => Ok(()),
        }
    }

    fn stream(&self, prompt: Prompt, options: GenerationOptions) -> BackendFuture {
        let plan = self.plan(&prompt, &options);
        let delay = Duration::from_millis(self.config.chunk_delay_ms);
        let prompt_tokens = prompt.as_str().split_whitespace().count() as u32;

        Box::pin(async move {
            let (tx, rx) = mpsc::channel::<Result<BackendEvent, GenerationError>>(32);

            tokio::spawn(async move {
                let stall_at = plan.stall_after.unwrap_or(usize::MAX);
                let mut sent = 0u32;
                for (i, chunk) in plan.chunks.into_iter().enumerate() {
                    if i >= stall_at {
                        tx.closed().await;
                        return;
                    }
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if tx.send(Ok(BackendEvent::Chunk(chunk))).await.is_err() {
                        return;
                    }
                    sent += 1;
                }
                if plan.stall_after.is_some() {
                    tx.closed().await;
                    return;
                }

                let last = match plan.end {
                    ScriptEnd::Finish { reason, findings } => Ok(BackendEvent::Finished {
                        reason,
                        usage: Some(TokenUsage {
                            prompt_tokens,
                            completion_tokens: sent,
                        }),
                        findings,
                    }),
                    #[cfg(test)]
                    ScriptEnd::Fail(e) => Err(e),
                };
                let _ = tx.send(last).await;
            });

            Ok(Box::pin(ReceiverStream::new(rx)) as BackendStream)
        })
    }
}

#[derive(Debug, Clone)]
pub struct StubProvider {
    backend: Arc<StubBackend>,
}

impl StubProvider {
    pub fn new(config: StubConfig) -> Self {
        Self {
            backend: Arc::new(StubBackend::echo(config)),
        }
    }

    #[cfg(test)]
    pub fn scripted(config: StubConfig, script: Script) -> Self {
        Self {
            backend: Arc::new(StubBackend::scripted(config, script)),
        }
    }
}

impl Provider for StubProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn is_supported(&self) -> bool {
        self.backend.config.supported
    }

    fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Message;
    use crate::provider::SessionConfig;

    fn quick() -> StubConfig {
        StubConfig {
            chunk_delay_ms: 0,
            ..StubConfig::default()
        }
    }

    #[tokio::test]
    async fn echo_replies_with_last_user_message() {
        let p = StubProvider::new(quick());
        let s = p.make_session(SessionConfig::default()).unwrap();
        let msgs = vec![
            Message::user("first"),
            Message::assistant("ok"),
            Message::user("Hello there"),
        ];
        let r = s.generate(&msgs, None).unwrap().result().await;
        assert_eq!(r.text, "You said: Hello there");
        assert_eq!(r.usage.map(|u| u.completion_tokens), Some(4));
    }

    #[tokio::test]
    async fn blocked_terms_only_apply_with_guardrails() {
        let config = StubConfig {
            blocked_terms: vec!["Forbidden".into()],
            ..quick()
        };
        let p = StubProvider::new(config);
        let msgs = vec![Message::user("say the forbidden word")];

        let guarded = GenerationOptions::default();
        assert_eq!(guarded.safety, SafetyPolicy::Guarded);
        let r = p
            .make_session(SessionConfig::default())
            .unwrap()
            .generate(&msgs, Some(guarded.clone()))
            .unwrap()
            .result()
            .await;
        assert_eq!(r.finish_reason, FinishReason::Safety);
        assert_eq!(r.safety_findings, vec!["blocked_term".to_string()]);
        assert_eq!(r.text, "");

        let open = GenerationOptions {
            safety: SafetyPolicy::Unguarded,
            ..guarded
        };
        let r = p
            .make_session(SessionConfig::default())
            .unwrap()
            .generate(&msgs, Some(open))
            .unwrap()
            .result()
            .await;
        assert_eq!(r.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn unsupported_provider_refuses_sessions() {
        let p = StubProvider::new(StubConfig {
            supported: false,
            ..quick()
        });
        assert!(!p.is_supported());
        let err = p.make_session(SessionConfig::default()).unwrap_err();
        assert!(matches!(err, GenerationError::ProviderUnavailable(_)));
    }
}
