use crate::chat::ChatThread;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ThreadsFile {
    #[serde(default)]
    threads: Vec<ChatThread>,
}

/// JSON file holding every chat thread.
#[derive(Debug, Clone)]
pub struct ThreadStore {
    path: PathBuf,
}

impl ThreadStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means no threads yet.
    pub fn load(&self) -> anyhow::Result<Vec<ChatThread>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("failed to read threads: {}", self.path.display()))
            }
        };

        let file: ThreadsFile = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse JSON: {}", self.path.display()))?;
        tracing::debug!(
            path = %self.path.display(),
            threads = file.threads.len(),
            "loaded threads"
        );
        Ok(file.threads)
    }

    /// Write through a temp file and rename so a crash never leaves half a file.
    pub fn save(&self, threads: &[ChatThread]) -> anyhow::Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create state dir: {}", dir.display()))?;

        let tmp = tmp_path(&self.path);
        let file = ThreadsFile {
            threads: threads.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&file).context("failed to encode threads")?;
        std::fs::write(&tmp, bytes).with_context(|| format!("failed to write: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace: {}", self.path.display()))?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut p = path.to_path_buf();
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "threads.json".to_string());
    p.set_file_name(format!("{name}.tmp"));
    p
}
