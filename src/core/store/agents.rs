use std::path::PathBuf;
use tracing::warn;

use super::AgentDirectory;

/// Agent names are the `*.md` persona files of the agent program's agents directory.
pub struct FsAgentDirectory {
    dir: PathBuf,
    fallback: Vec<String>,
}

impl FsAgentDirectory {
    pub fn new(dir: impl Into<PathBuf>, fallback: Vec<String>) -> Self {
        Self {
            dir: dir.into(),
            fallback,
        }
    }
}

impl AgentDirectory for FsAgentDirectory {
    fn list_agent_names(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "Agents directory {:?} unavailable ({}), using default agents",
                    self.dir, e
                );
                return self.fallback.clone();
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .strip_suffix(".md")
                    .map(str::to_string)
            })
            .filter(|name| !name.is_empty())
            .collect();

        if names.is_empty() {
            warn!("No agents found in {:?}, using default agents", self.dir);
            return self.fallback.clone();
        }
        names.sort();
        names
    }
}
