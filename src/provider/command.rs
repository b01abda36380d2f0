//! Backend that runs a locally installed model runner as a child process.
//!
//! The prompt is written to the child's stdin and its stdout is streamed back
//! as chunks. Sampling parameters travel as `LOCALCHAT_*` environment
//! variables; unset options are not exported so the runner keeps its own
//! defaults. Dropping the stream kills the child.

use super::{
    Backend, BackendEvent, BackendFuture, BackendStream, FinishReason, GenerationError,
    GenerationOptions, Prompt, Provider, SafetyPolicy,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CommandConfig {
    /// Executable name (looked up on PATH) or path.
    pub program: String,
    pub args: Vec<String>,
    pub max_prompt_chars: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CommandBackend {
    config: CommandConfig,
}

impl CommandBackend {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }
}

impl Backend for CommandBackend {
    fn name(&self) -> &'static str {
        "command"
    }

    fn is_available(&self) -> bool {
        resolve_program(&self.config.program).is_some()
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
        let config = self.config.clone();

        Box::pin(async move {
            let mut cmd = tokio::process::Command::new(&config.program);
            cmd.args(&config.args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            apply_options(&mut cmd, &options);

            let mut child = cmd.spawn().map_err(|e| {
                GenerationError::GenericFailure(format!(
                    "failed to spawn model runner {} {:?}: {e}",
                    config.program, config.args
                ))
            })?;
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| GenerationError::GenericFailure("child stdin missing".into()))?;
            let mut stdout = child
                .stdout
                .take()
                .ok_or_else(|| GenerationError::GenericFailure("child stdout missing".into()))?;

            tracing::debug!(program = %config.program, pid = ?child.id(), "model runner started");

            let (tx, rx) = mpsc::channel::<Result<BackendEvent, GenerationError>>(64);

            tokio::spawn(async move {
                // Feed stdin separately so a chatty runner cannot deadlock us.
                let body = prompt.into_string();
                tokio::spawn(async move {
                    let _ = stdin.write_all(body.as_bytes()).await;
                    let _ = stdin.shutdown().await;
                });

                let mut pending = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    let read = tokio::select! {
                        _ = tx.closed() => return,
                        r = stdout.read(&mut buf) => r,
                    };
                    match read {
                        Ok(0) => break,
                        Ok(n) => {
                            pending.extend_from_slice(&buf[..n]);
                            let text = take_utf8(&mut pending);
                            if text.is_empty() {
                                continue;
                            }
                            if tx.send(Ok(BackendEvent::Chunk(text))).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx
                                .send(Err(GenerationError::GenericFailure(format!(
                                    "failed to read model output: {e}"
                                ))))
                                .await;
                            return;
                        }
                    }
                }
                if !pending.is_empty() {
                    let rest = String::from_utf8_lossy(&pending).into_owned();
                    if tx.send(Ok(BackendEvent::Chunk(rest))).await.is_err() {
                        return;
                    }
                }

                let status = tokio::select! {
                    _ = tx.closed() => return,
                    s = child.wait() => s,
                };
                let last = match status {
                    Ok(s) if s.success() => Ok(BackendEvent::Finished {
                        reason: FinishReason::Stop,
                        usage: None,
                        findings: Vec::new(),
                    }),
                    Ok(s) => Err(GenerationError::GenericFailure(format!(
                        "model runner exited with {s}"
                    ))),
                    Err(e) => Err(GenerationError::GenericFailure(format!(
                        "failed to wait for model runner: {e}"
                    ))),
                };
                let _ = tx.send(last).await;
            });

            Ok(Box::pin(ReceiverStream::new(rx)) as BackendStream)
        })
    }
}

fn apply_options(cmd: &mut tokio::process::Command, options: &GenerationOptions) {
    cmd.env("LOCALCHAT_MODEL_VARIANT", options.model_variant.as_str());
    cmd.env(
        "LOCALCHAT_SAFETY",
        match options.safety {
            SafetyPolicy::Guarded => "guarded",
            SafetyPolicy::Unguarded => "unguarded",
        },
    );
    if let Some(t) = options.temperature {
        cmd.env("LOCALCHAT_TEMPERATURE", t.to_string());
    }
    if let Some(p) = options.top_p {
        cmd.env("LOCALCHAT_TOP_P", p.to_string());
    }
}

/// Decode the longest valid UTF-8 prefix, keeping an incomplete trailing
/// sequence for the next read.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(s) => {
            let out = s.to_string();
            pending.clear();
            out
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let out = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            out
        }
        Err(_) => String::from_utf8_lossy(&std::mem::take(pending)).into_owned(),
    }
}

fn resolve_program(program: &str) -> Option<PathBuf> {
    let program = program.trim();
    if program.is_empty() {
        return None;
    }
    let path = Path::new(program);
    if path.is_absolute() || path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[derive(Debug, Clone)]
pub struct CommandProvider {
    backend: Arc<CommandBackend>,
}

impl CommandProvider {
    pub fn new(config: CommandConfig) -> Self {
        Self {
            backend: Arc::new(CommandBackend::new(config)),
        }
    }
}

impl Provider for CommandProvider {
    fn name(&self) -> &'static str {
        "command"
    }

    fn is_supported(&self) -> bool {
        self.backend.is_available()
    }

    fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }
}
