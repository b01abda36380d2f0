use anyhow::Context;
use std::env;
use std::path::{Path, PathBuf};

/// Lookup order for one class of files: `$LOCALCHAT_HOME/<home_sub>`, then
/// `$<xdg_var>/localchat`, then `~/<fallback>/localchat`.
struct DirKind {
    home_sub: &'static str,
    xdg_var: &'static str,
    fallback: &'static [&'static str],
}

const CONFIG: DirKind = DirKind {
    home_sub: "config",
    xdg_var: "XDG_CONFIG_HOME",
    fallback: &[".config"],
};

const STATE: DirKind = DirKind {
    home_sub: "state",
    xdg_var: "XDG_STATE_HOME",
    fallback: &[".local", "state"],
};

fn locate(kind: &DirKind) -> anyhow::Result<PathBuf> {
    let dir = if let Some(base) = env::var_os("LOCALCHAT_HOME") {
        PathBuf::from(base).join(kind.home_sub)
    } else if let Some(xdg) = env::var_os(kind.xdg_var) {
        PathBuf::from(xdg).join("localchat")
    } else {
        let home = env::var_os("HOME").context("HOME is not set")?;
        let mut p = PathBuf::from(home);
        p.extend(kind.fallback);
        p.join("localchat")
    };
    ensure_dir(&dir)
}

fn ensure_dir(path: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))?;
    Ok(path.to_path_buf())
}

pub fn config_dir() -> anyhow::Result<PathBuf> {
    locate(&CONFIG)
}

pub fn state_dir() -> anyhow::Result<PathBuf> {
    locate(&STATE)
}

pub fn threads_path() -> anyhow::Result<PathBuf> {
    Ok(state_dir()?.join("threads.json"))
}
