//! Artifacts produced by finished tasks

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    #[serde(default)]
    pub summary: String,
    /// Names other tasks may rely on (files, symbols, documents)
    #[serde(default)]
    pub exports: Vec<String>,
}

/// Where artifacts come from
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Artifacts for the given ids; ids with nothing recorded are left out
    async fn load_for_dependencies(&self, ids: &[String]) -> Result<BTreeMap<String, Artifact>>;
}

/// Reads `<dir>/<id>.json`
#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    dir: PathBuf,
}

impl FileArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn load_for_dependencies(&self, ids: &[String]) -> Result<BTreeMap<String, Artifact>> {
        let mut found = BTreeMap::new();
        for id in ids {
            let path = self.dir.join(format!("{}.json", id));
            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(contents) => contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_str::<Artifact>(&contents) {
                Ok(artifact) => {
                    found.insert(id.clone(), artifact);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable artifact");
                }
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_artifacts_are_absent() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("T1.json"),
            r#"{"summary": "token model", "exports": ["src/auth/token.ts"]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("T3.json"), "not json").unwrap();

        let store = FileArtifactStore::new(dir.path());
        let found = store
            .load_for_dependencies(&["T1".to_string(), "T2".to_string(), "T3".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["T1"].exports, vec!["src/auth/token.ts".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let store = FileArtifactStore::new("/nonexistent/warden/artifacts");
        assert!(store.load_for_dependencies(&["T1".to_string()]).await.unwrap().is_empty());
    }
}
