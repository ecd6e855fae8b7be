//! JSON-lines journal of trajectory events

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::TrajectoryEvent;
use crate::{Error, Result};

/// Append-only event journal backed by `trajectory.jsonl`
///
/// Appends and reads share one lock, so events come back in the order
/// `log` was called. Lines that fail to parse are skipped with a warning.
pub struct TrajectoryLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl std::fmt::Debug for TrajectoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrajectoryLog").field("path", &self.path).finish()
    }
}

impl TrajectoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event
    pub async fn log(&self, event: &TrajectoryEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Last `n` events, oldest first
    pub async fn tail(&self, n: usize) -> Result<Vec<TrajectoryEvent>> {
        let _guard = self.lock.lock().await;
        let mut window = VecDeque::with_capacity(n.min(1024));
        self.scan(|event| {
            if n == 0 {
                return true;
            }
            if window.len() == n {
                window.pop_front();
            }
            window.push_back(event);
            true
        })
        .await?;
        Ok(window.into())
    }

    /// First `limit` events of one agent, in file order
    pub async fn filter_by_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<TrajectoryEvent>> {
        let _guard = self.lock.lock().await;
        let mut matches = Vec::new();
        if limit == 0 {
            return Ok(matches);
        }
        self.scan(|event| {
            if event.belongs_to(agent_id) {
                matches.push(event);
            }
            matches.len() < limit
        })
        .await?;
        Ok(matches)
    }

    /// Last `n` events of one agent, oldest first
    pub async fn tail_by_agent(&self, agent_id: &str, n: usize) -> Result<Vec<TrajectoryEvent>> {
        let _guard = self.lock.lock().await;
        let mut window = VecDeque::new();
        if n == 0 {
            return Ok(Vec::new());
        }
        self.scan(|event| {
            if event.belongs_to(agent_id) {
                if window.len() == n {
                    window.pop_front();
                }
                window.push_back(event);
            }
            true
        })
        .await?;
        Ok(window.into())
    }

    /// Number of events in the journal
    pub async fn count(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut count = 0;
        self.scan(|_| {
            count += 1;
            true
        })
        .await?;
        Ok(count)
    }

    /// Delete the journal
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Feed parsed events to `visit` until it returns false or the file ends
    async fn scan<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(TrajectoryEvent) -> bool,
    {
        let file = match tokio::fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut lines = BufReader::new(file).lines();
        let mut line_no = 0usize;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<TrajectoryEvent>(trimmed) {
                Ok(event) => {
                    if !visit(event) {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), line = line_no, error = %e, "Skipping unreadable trajectory line");
                }
            }
        }
        Ok(())
    }
}
