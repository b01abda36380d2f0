use crate::chat::{title_from_prompt, Orchestrator, OrchestratorSettings};
use crate::cli::{SamplingArgs, ThreadCommand};
use crate::provider::command::CommandProvider;
use crate::provider::stub::StubProvider;
use crate::provider::Provider;
use crate::{config, store};
use anyhow::Context;
use std::io::Write;
use std::sync::Arc;

pub fn build_provider(
    cfg: Option<&config::Config>,
    provider_name: &str,
) -> anyhow::Result<Arc<dyn Provider>> {
    let defaults = config::Config::default();
    let cfg = cfg.unwrap_or(&defaults);
    let provider: Arc<dyn Provider> = match provider_name {
        "stub" => Arc::new(StubProvider::new(cfg.stub.clone())),
        "command" => {
            if cfg.command.program.trim().is_empty() {
                anyhow::bail!("command provider needs `command.program` in config.toml");
            }
            Arc::new(CommandProvider::new(cfg.command.clone()))
        }
        other => anyhow::bail!("unknown provider: {other} (expected stub or command)"),
    };
    tracing::debug!(
        provider = provider.name(),
        supported = provider.is_supported(),
        "selected provider"
    );
    Ok(provider)
}

pub fn build_orchestrator(
    cfg: Option<&config::Config>,
    provider: Arc<dyn Provider>,
    store: &store::ThreadStore,
) -> anyhow::Result<Orchestrator> {
    let threads = store.load()?;
    tracing::debug!(path = %store.path().display(), threads = threads.len(), "thread store opened");
    let settings = OrchestratorSettings {
        defaults: cfg.map(|c| c.overrides()).unwrap_or_default(),
        log_generations: cfg.is_some_and(|c| c.log_generations),
    };
    Ok(Orchestrator::new(provider, settings, threads))
}

pub fn cmd_check(provider: &dyn Provider, out: &mut dyn Write) -> anyhow::Result<bool> {
    let ok = provider.is_supported();
    if ok {
        writeln!(out, "{}: supported", provider.name())?;
    } else {
        writeln!(out, "{}: not supported on this device", provider.name())?;
    }
    Ok(ok)
}

pub fn cmd_threads(
    orch: &mut Orchestrator,
    cmd: ThreadCommand,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    match cmd {
        ThreadCommand::List => {
            if orch.threads().is_empty() {
                writeln!(out, "(no threads)")?;
            }
            for t in orch.threads() {
                writeln!(
                    out,
                    "{}\t{}\t{}\t{} msgs\t{}\t{}",
                    &t.id()[..8.min(t.id().len())],
                    t.style(),
                    if t.guardrails() { "guarded" } else { "unguarded" },
                    t.messages().len(),
                    t.updated_at().format("%Y-%m-%d %H:%M"),
                    t.title()
                )?;
            }
        }
        ThreadCommand::New { title } => {
            let id = orch.create_thread(title);
            writeln!(out, "{id}")?;
        }
        ThreadCommand::Show { id } => {
            let id = orch.resolve_id(&id)?;
            let Some(t) = orch.thread(&id) else {
                anyhow::bail!("no such thread: {id}");
            };
            writeln!(
                out,
                "# {} ({}, {} turns, since {})",
                t.title(),
                t.style(),
                t.turns(),
                t.created_at().format("%Y-%m-%d")
            )?;
            for m in t.messages() {
                write!(out, "[{}] {}: {}", m.timestamp().format("%H:%M"), m.role(), m.text())?;
                match m.metadata().get("finish_reason").map(String::as_str) {
                    Some(reason) if reason != "stop" => writeln!(out, " ({reason})")?,
                    _ => writeln!(out)?,
                }
            }
        }
        ThreadCommand::Rename { id, title } => {
            let id = orch.resolve_id(&id)?;
            orch.rename(&id, title)?;
        }
        ThreadCommand::Style { id, style } => {
            let id = orch.resolve_id(&id)?;
            orch.set_style(&id, style)?;
        }
        ThreadCommand::Guardrails { id, enabled } => {
            let id = orch.resolve_id(&id)?;
            orch.set_guardrails(&id, enabled)?;
        }
        ThreadCommand::Clear { id } => {
            let id = orch.resolve_id(&id)?;
            orch.clear_history(&id)?;
        }
        ThreadCommand::ClearAll => orch.clear_all(),
        ThreadCommand::Delete { id } => {
            let id = orch.resolve_id(&id)?;
            let t = orch.delete_thread(&id)?;
            writeln!(out, "deleted {}", t.title())?;
        }
    }
    Ok(())
}

/// Run one turn, streaming tokens to `out`. Ctrl-C cancels the generation.
/// `--style` without `--thread` styles the new thread, with it restyles that one.
pub async fn cmd_prompt(
    orch: &mut Orchestrator,
    thread: Option<String>,
    prompt: &str,
    sampling: &SamplingArgs,
    default_style: Option<crate::provider::StylePreset>,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let (thread_id, style) = match thread {
        Some(key) => (orch.resolve_id(&key)?, sampling.style),
        None => (
            orch.create_thread(title_from_prompt(prompt)),
            sampling.style.or(default_style),
        ),
    };
    if let Some(style) = style {
        orch.set_style(&thread_id, style)?;
    }

    let mut turn = orch
        .send(&thread_id, prompt, &sampling.overrides())
        .context("failed to start generation")?;

    let canceller = turn.canceller();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    while let Some(token) = turn.next_token().await {
        if let Err(e) = write!(out, "{token}").and_then(|()| out.flush()) {
            turn.cancel();
            ctrl_c.abort();
            return Err(anyhow::Error::new(e).context("failed to write reply"));
        }
    }
    writeln!(out)?;
    ctrl_c.abort();

    let done = turn.wait().await;
    let result = done.result().clone();
    orch.apply(done)?;
    tracing::debug!(
        thread = %thread_id,
        finish_reason = %result.finish_reason,
        latency = ?result.latency,
        "turn finished"
    );

    match result.error {
        Some(e) if e.is_cancelled() => {
            writeln!(out, "(cancelled)")?;
            Ok(())
        }
        Some(crate::provider::GenerationError::SafetyBlocked) => {
            writeln!(out, "(blocked by guardrails)")?;
            Ok(())
        }
        Some(e) => Err(anyhow::Error::new(e).context("generation failed")),
        None => Ok(()),
    }
}
