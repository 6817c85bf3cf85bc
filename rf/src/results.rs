//! Result persistence
//!
//! Each finished session writes one `agent-<id>.json` file holding its
//! [`AgentResults`]. The `results` command reads them back.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};

use crate::domain::{AgentId, AgentResults};
use crate::error::FleetError;

/// Directory of per-agent result files
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    /// Create a store rooted at `dir`; the directory is created on first save
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        debug!(?dir, "ResultStore::new: called");
        Self { dir }
    }

    /// Path of one agent's result file
    pub fn path_for(&self, agent: AgentId) -> PathBuf {
        self.dir.join(format!("agent-{}.json", agent))
    }

    /// Write one session's results, replacing any earlier file for the agent
    pub async fn save(&self, results: &AgentResults) -> Result<PathBuf, FleetError> {
        debug!(agent = %results.agent, episodes = results.episodes.len(), "ResultStore::save: called");
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| FleetError::Persistence(format!("create {}: {}", self.dir.display(), e)))?;

        let path = self.path_for(results.agent);
        let json = serde_json::to_string_pretty(results)
            .map_err(|e| FleetError::Persistence(format!("encode results for agent {}: {}", results.agent, e)))?;

        // Write then rename so a reader never sees a half-written file
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .map_err(|e| FleetError::Persistence(format!("write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| FleetError::Persistence(format!("rename {}: {}", path.display(), e)))?;

        info!(agent = %results.agent, path = %path.display(), "Saved results");
        Ok(path)
    }

    /// Read one agent's results
    pub async fn load(&self, agent: AgentId) -> Result<AgentResults, FleetError> {
        let path = self.path_for(agent);
        read_results(&path).await
    }

    /// Read every result file in the directory, ordered by agent
    ///
    /// Files that fail to parse are skipped with a warning.
    pub async fn load_all(&self) -> Result<Vec<AgentResults>, FleetError> {
        debug!(dir = ?self.dir, "ResultStore::load_all: called");
        if !self.dir.exists() {
            debug!("ResultStore::load_all: directory does not exist");
            return Ok(vec![]);
        }

        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| FleetError::Persistence(format!("read {}: {}", self.dir.display(), e)))?;

        let mut all = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FleetError::Persistence(format!("read {}: {}", self.dir.display(), e)))?
        {
            let path = entry.path();
            if !is_result_file(&path) {
                continue;
            }
            match read_results(&path).await {
                Ok(results) => all.push(results),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable result file"),
            }
        }

        all.sort_by_key(|r| r.agent);
        Ok(all)
    }
}

fn is_result_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.strip_prefix("agent-")
        .and_then(|rest| rest.strip_suffix(".json"))
        .is_some_and(|id| id.parse::<AgentId>().is_ok())
}

async fn read_results(path: &Path) -> Result<AgentResults, FleetError> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| FleetError::Persistence(format!("read {}: {}", path.display(), e)))?;
    serde_json::from_str(&content).map_err(|e| FleetError::Persistence(format!("parse {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EpisodeRecord, Termination};
    use tempfile::tempdir;

    fn sample(agent: u32) -> AgentResults {
        let mut results = AgentResults::new(AgentId::new(agent));
        results.episodes.push(EpisodeRecord::new(0, 3.5, 12, Termination::Done));
        results.episodes.push(EpisodeRecord::new(1, -1.0, 40, Termination::Timeout));
        results.aborted_episodes = 1;
        results
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let store = ResultStore::new(temp.path().join("results"));

        let results = sample(3);
        let path = store.save(&results).await.unwrap();
        assert_eq!(path.file_name().unwrap(), "agent-3.json");

        let loaded = store.load(AgentId::new(3)).await.unwrap();
        assert_eq!(loaded, results);
    }

    #[tokio::test]
    async fn test_save_replaces_previous_file() {
        let temp = tempdir().unwrap();
        let store = ResultStore::new(temp.path());

        store.save(&sample(1)).await.unwrap();
        let empty = AgentResults::new(AgentId::new(1));
        store.save(&empty).await.unwrap();

        assert_eq!(store.load(AgentId::new(1)).await.unwrap(), empty);
    }

    #[tokio::test]
    async fn test_load_all_sorted_and_skips_foreign_files() {
        let temp = tempdir().unwrap();
        let store = ResultStore::new(temp.path());

        store.save(&sample(10)).await.unwrap();
        store.save(&sample(2)).await.unwrap();
        std::fs::write(temp.path().join("notes.txt"), "hello").unwrap();
        std::fs::write(temp.path().join("agent-7.json"), "{ not json").unwrap();

        let all = store.load_all().await.unwrap();
        let agents: Vec<u32> = all.iter().map(|r| r.agent.value()).collect();
        assert_eq!(agents, vec![2, 10]);
    }

    #[tokio::test]
    async fn test_load_all_missing_dir() {
        let temp = tempdir().unwrap();
        let store = ResultStore::new(temp.path().join("nope"));
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[test]
    fn test_is_result_file() {
        assert!(is_result_file(Path::new("/x/agent-0.json")));
        assert!(!is_result_file(Path::new("/x/agent-a.json")));
        assert!(!is_result_file(Path::new("/x/agent-1.json.tmp")));
        assert!(!is_result_file(Path::new("/x/other.json")));
    }
}
