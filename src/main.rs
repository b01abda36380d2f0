mod app;
mod chat;
mod cli;
mod config;
mod paths;
mod provider;
mod store;

#[cfg(feature = "tui")]
mod tui;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    let config_dir = paths::config_dir()?;
    let cfg = config::Config::load_optional(config_dir.join("config.toml"))?;
    tracing::debug!(?config_dir, ?cfg, "resolved config");

    let provider_name = args
        .provider
        .clone()
        .or_else(|| cfg.as_ref().and_then(|c| c.provider.clone()))
        .unwrap_or_else(|| "stub".to_string());
    let provider = app::build_provider(cfg.as_ref(), &provider_name)?;

    let mut out = std::io::stdout();

    if let Some(cli::Command::Check) = args.cmd {
        if !app::cmd_check(provider.as_ref(), &mut out)? {
            std::process::exit(1);
        }
        return Ok(());
    }

    let store = store::ThreadStore::new(paths::threads_path()?);
    let mut orch = app::build_orchestrator(cfg.as_ref(), provider, &store)?;
    let default_style = cfg.as_ref().and_then(|c| c.style);

    let res = match args.cmd {
        Some(cli::Command::Threads { cmd }) => app::cmd_threads(&mut orch, cmd, &mut out),
        #[cfg(feature = "tui")]
        Some(cli::Command::Tui) => {
            tui::run_tui(&mut orch, args.thread.clone(), default_style).await
        }
        Some(cli::Command::Check) => Ok(()),
        None => {
            let prompt = args.prompt.join(" ");
            if prompt.trim().is_empty() {
                anyhow::bail!(
                    "No prompt provided. Try: localchat \"Hello\" or `localchat threads list`"
                );
            }
            app::cmd_prompt(
                &mut orch,
                args.thread.clone(),
                &prompt,
                &args.sampling,
                default_style,
                &mut out,
            )
            .await
        }
    };

    // Whatever happened, keep the threads that were touched.
    store.save(orch.threads())?;
    res
}
