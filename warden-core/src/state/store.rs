//! Crash-safe persistence of workflow state
//!
//! Every operation that reads and then writes the state file runs under one
//! async mutex, so two in-flight claims (or a claim and a save) can never
//! interleave their read-modify-write. Writes go to a sibling temp file that
//! is synced and renamed over `state.json`; a crash mid-write leaves the
//! previous file intact. The in-memory cache only changes after a write
//! succeeds.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::model::{AgentStatus, TaskState, TaskStatus, WorkflowState};
use crate::clock::{Clock, SystemClock};
use crate::{Error, Result};

/// Outcome of a claim request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResult {
    pub task: Option<TaskState>,
    /// The worker already held this task
    pub is_retry: bool,
    /// The task was taken over from a worker that exceeded its timeout
    pub is_reclaim: bool,
}

impl ClaimResult {
    fn none() -> Self {
        Self::default()
    }

    fn fresh(task: TaskState) -> Self {
        Self {
            task: Some(task),
            is_retry: false,
            is_reclaim: false,
        }
    }
}

/// What crash recovery repaired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairKind {
    /// A running task lost its owner or outlived its timeout and went back to pending
    OrphanedTask,
    /// An agent recorded as active belonged to a previous daemon
    StaleAgent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repair {
    pub kind: RepairKind,
    pub id: String,
    pub previous_owner: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recovery {
    pub state: Option<WorkflowState>,
    pub repaired: Vec<Repair>,
}

/// Single authoritative store for [`WorkflowState`]
pub struct StateStore {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    cache: Mutex<Option<WorkflowState>>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").field("path", &self.path).finish()
    }
}

impl StateStore {
    /// Store backed by `path` (normally `<state dir>/state.json`)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_clock(path, Arc::new(SystemClock))
    }

    pub fn with_clock(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current state, or `None` when nothing has been persisted yet
    pub async fn load(&self) -> Result<Option<WorkflowState>> {
        let mut cache = self.cache.lock().await;
        self.read_locked(&mut cache).await
    }

    /// Alias of [`load`](Self::load) for read-only consumers
    pub async fn snapshot(&self) -> Result<Option<WorkflowState>> {
        self.load().await
    }

    /// Replace the persisted state
    pub async fn save(&self, state: WorkflowState) -> Result<()> {
        state.validate()?;
        let mut cache = self.cache.lock().await;
        self.write_locked(&mut cache, state).await
    }

    /// Read-modify-write under the store lock
    ///
    /// `f` works on a copy; if it fails, or the write fails, nothing changes.
    pub async fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WorkflowState) -> Result<T>,
    {
        let mut cache = self.cache.lock().await;
        let mut state = self
            .read_locked(&mut cache)
            .await?
            .ok_or_else(|| Error::NotFound("workflow state".to_string()))?;
        let out = f(&mut state)?;
        self.write_locked(&mut cache, state).await?;
        Ok(out)
    }

    /// Hand the next claimable task to `worker_id`
    pub async fn claim_task(&self, worker_id: &str) -> Result<ClaimResult> {
        let now = self.clock.now();
        let mut cache = self.cache.lock().await;
        let Some(mut state) = self.read_locked(&mut cache).await? else {
            return Ok(ClaimResult::none());
        };

        if let Some(held) = state.task_held_by(worker_id) {
            tracing::debug!(worker_id, task_id = %held.id, "Worker retried claim for held task");
            return Ok(ClaimResult {
                task: Some(held.clone()),
                is_retry: true,
                is_reclaim: false,
            });
        }

        let pending = state
            .tasks
            .iter()
            .position(|t| t.status == TaskStatus::Pending && state.tasks.dependencies_met(t));
        let (index, is_reclaim) = match pending {
            Some(i) => (i, false),
            None => {
                let expired = state
                    .tasks
                    .iter()
                    .position(|t| t.is_expired(now) && state.tasks.dependencies_met(t));
                match expired {
                    Some(i) => (i, true),
                    None => return Ok(ClaimResult::none()),
                }
            }
        };

        let task = {
            let Some(task) = state.tasks.at_mut(index) else {
                return Ok(ClaimResult::none());
            };
            if is_reclaim {
                tracing::warn!(
                    task_id = %task.id,
                    previous_owner = ?task.claimed_by,
                    worker_id,
                    "Reclaiming timed-out task"
                );
            }
            task.claim(worker_id, now);
            task.clone()
        };
        if let Some(agent) = state.agents.get_mut(worker_id) {
            agent.current_task = Some(task.id.clone());
        }

        self.write_locked(&mut cache, state).await?;
        tracing::info!(worker_id, task_id = %task.id, is_reclaim, "Task claimed");
        Ok(ClaimResult {
            task: Some(task),
            is_retry: false,
            is_reclaim,
        })
    }

    /// Claim one specific task for a freshly spawned worker
    ///
    /// Returns an empty result when the task is no longer claimable.
    pub async fn assign_task(&self, task_id: &str, worker_id: &str) -> Result<ClaimResult> {
        let now = self.clock.now();
        let mut cache = self.cache.lock().await;
        let Some(mut state) = self.read_locked(&mut cache).await? else {
            return Ok(ClaimResult::none());
        };

        let task = state
            .tasks
            .get(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
        if task.status == TaskStatus::Running && task.claimed_by.as_deref() == Some(worker_id) {
            return Ok(ClaimResult {
                task: Some(task.clone()),
                is_retry: true,
                is_reclaim: false,
            });
        }
        if task.status != TaskStatus::Pending || !state.tasks.dependencies_met(task) {
            return Ok(ClaimResult::none());
        }

        let claimed = match state.tasks.get_mut(task_id) {
            Some(task) => {
                task.claim(worker_id, now);
                task.clone()
            }
            None => return Ok(ClaimResult::none()),
        };
        if let Some(agent) = state.agents.get_mut(worker_id) {
            agent.current_task = Some(claimed.id.clone());
        }

        self.write_locked(&mut cache, state).await?;
        Ok(ClaimResult::fresh(claimed))
    }

    /// Mark a task completed on behalf of its owner
    pub async fn complete_task(&self, task_id: &str, worker_id: &str, force: bool) -> Result<TaskState> {
        let now = self.clock.now();
        let task = self
            .update(|state| {
                let task = state
                    .tasks
                    .get_mut(task_id)
                    .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
                if !force && task.claimed_by.as_deref() != Some(worker_id) {
                    return Err(Error::Ownership {
                        task_id: task_id.to_string(),
                        owner: task.claimed_by.clone(),
                        worker_id: worker_id.to_string(),
                    });
                }
                task.status = TaskStatus::Completed;
                task.completed_at = Some(now);
                let done = task.clone();
                if let Some(owner) = done.claimed_by.as_deref() {
                    if let Some(agent) = state.agents.get_mut(owner) {
                        if agent.current_task.as_deref() == Some(task_id) {
                            agent.current_task = None;
                        }
                    }
                }
                Ok(done)
            })
            .await?;
        tracing::info!(task_id, worker_id, force, "Task completed");
        Ok(task)
    }

    /// Record a failed attempt by the owning worker
    pub async fn fail_task(&self, task_id: &str, worker_id: &str, error: impl Into<String>) -> Result<TaskState> {
        let now = self.clock.now();
        let error = error.into();
        self.update(|state| {
            let task = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
            if task.claimed_by.as_deref() != Some(worker_id) {
                return Err(Error::Ownership {
                    task_id: task_id.to_string(),
                    owner: task.claimed_by.clone(),
                    worker_id: worker_id.to_string(),
                });
            }
            task.status = TaskStatus::Failed;
            task.completed_at = Some(now);
            task.last_error = Some(error);
            Ok(task.clone())
        })
        .await
    }

    /// Put a task back into the pool, whoever holds it
    pub async fn release_task(&self, task_id: &str) -> Result<TaskState> {
        self.update(|state| {
            let task = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
            let owner = task.claimed_by.clone();
            task.release();
            let released = task.clone();
            if let Some(agent) = owner.and_then(|o| state.agents.get_mut(&o)) {
                agent.current_task = None;
            }
            Ok(released)
        })
        .await
    }

    /// Forget all persisted state
    pub async fn reset(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        for path in [self.path.clone(), self.temp_path()] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        *cache = None;
        tracing::info!(path = %self.path.display(), "Workflow state reset");
        Ok(())
    }

    /// Release orphaned work left behind by a previous daemon
    pub async fn recover_from_crash(&self) -> Result<Recovery> {
        let now = self.clock.now();
        let mut cache = self.cache.lock().await;
        let Some(mut state) = self.read_locked(&mut cache).await? else {
            return Ok(Recovery::default());
        };

        // agents recorded active died with the previous daemon
        let stale: Vec<String> = state.active_agents().map(|a| a.id.clone()).collect();

        let mut repaired = Vec::new();
        for task in state.tasks.iter_mut() {
            let abandoned = task.status == TaskStatus::Running
                && task.claimed_by.as_ref().is_some_and(|owner| stale.contains(owner));
            if abandoned || task.is_expired(now) {
                let previous_owner = task.claimed_by.clone();
                task.release();
                repaired.push(Repair {
                    kind: RepairKind::OrphanedTask,
                    id: task.id.clone(),
                    previous_owner,
                });
            }
        }
        for agent in state.agents.values_mut() {
            if stale.contains(&agent.id) {
                agent.status = AgentStatus::Stopped;
                agent.pid = None;
                agent.current_task = None;
                repaired.push(Repair {
                    kind: RepairKind::StaleAgent,
                    id: agent.id.clone(),
                    previous_owner: None,
                });
            }
        }

        if !repaired.is_empty() {
            for repair in &repaired {
                tracing::warn!(kind = ?repair.kind, id = %repair.id, owner = ?repair.previous_owner, "Crash recovery repair");
            }
            self.write_locked(&mut cache, state.clone()).await?;
        }

        Ok(Recovery {
            state: Some(state),
            repaired,
        })
    }

    /// Persist the cached state again
    pub async fn flush(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        if let Some(state) = cache.clone() {
            self.write_locked(&mut cache, state).await?;
        }
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    async fn read_locked(&self, cache: &mut Option<WorkflowState>) -> Result<Option<WorkflowState>> {
        if let Some(state) = cache.as_ref() {
            return Ok(Some(state.clone()));
        }

        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        let state: WorkflowState = serde_json::from_str(&contents).map_err(|e| {
            Error::Validation(format!("invalid state file {}: {}", self.path.display(), e))
        })?;
        state.validate()?;
        *cache = Some(state.clone());
        Ok(Some(state))
    }

    async fn write_locked(&self, cache: &mut Option<WorkflowState>, state: WorkflowState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut buf = serde_json::to_vec_pretty(&state)?;
        buf.push(b'\n');

        let tmp_path = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &self.path).await?;

        *cache = Some(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::state::model::AgentState;
    use chrono::Utc;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn seeded_state(tasks: Vec<TaskState>) -> WorkflowState {
        let mut state = WorkflowState::new("wf-1", "demo", "implement", Utc::now());
        for task in tasks {
            state.tasks.insert(task);
        }
        state
    }

    async fn store_with(tasks: Vec<TaskState>) -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.save(seeded_state(tasks)).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        assert!(store.load().await.unwrap().is_none());
        assert!(store.claim_task("w1").await.unwrap().task.is_none());
    }

    #[tokio::test]
    async fn test_save_and_reload_from_disk() {
        let (dir, store) = store_with(vec![TaskState::new("t1", "one")]).await;
        drop(store);

        let reopened = StateStore::new(dir.path().join("state.json"));
        let state = reopened.load().await.unwrap().unwrap();
        assert_eq!(state.workflow_id, "wf-1");
        assert!(state.tasks.contains("t1"));
    }

    #[tokio::test]
    async fn test_invalid_state_file_is_validation_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = StateStore::new(&path);
        assert!(matches!(store.load().await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_claim_picks_first_ready_task() {
        let (_dir, store) = store_with(vec![
            TaskState::new("t1", "one").with_dependencies(vec!["t0".into()]),
            TaskState::new("t0", "zero"),
        ])
        .await;

        let claim = store.claim_task("w1").await.unwrap();
        let task = claim.task.unwrap();
        assert_eq!(task.id, "t0");
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.claimed_by.as_deref(), Some("w1"));
        assert_eq!(task.claimed_at, task.started_at);
        assert!(!claim.is_retry && !claim.is_reclaim);

        // t1 is blocked until t0 completes
        assert!(store.claim_task("w2").await.unwrap().task.is_none());
    }

    #[tokio::test]
    async fn test_claim_is_idempotent_for_holder() {
        let (_dir, store) = store_with(vec![TaskState::new("t1", "one"), TaskState::new("t2", "two")]).await;

        let first = store.claim_task("w1").await.unwrap();
        let again = store.claim_task("w1").await.unwrap();
        assert!(again.is_retry);
        assert_eq!(again.task.unwrap().id, first.task.unwrap().id);
    }

    #[tokio::test]
    async fn test_claim_reclaims_timed_out_task() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(Utc::now().timestamp_millis());
        let store = StateStore::with_clock(dir.path().join("state.json"), Arc::new(clock.clone()));
        store
            .save(seeded_state(vec![TaskState::new("t1", "one").with_timeout(10)]))
            .await
            .unwrap();

        store.claim_task("w1").await.unwrap();
        assert!(store.claim_task("w2").await.unwrap().task.is_none());

        clock.advance(10_001);
        let claim = store.claim_task("w2").await.unwrap();
        assert!(claim.is_reclaim);
        let task = claim.task.unwrap();
        assert_eq!(task.claimed_by.as_deref(), Some("w2"));
        assert_eq!(task.attempts, 2);
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let tasks = (0..5).map(|i| TaskState::new(format!("t{}", i), "work")).collect();
        let (_dir, store) = store_with(tasks).await;
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for w in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_task(&format!("w{}", w)).await.unwrap().task.map(|t| t.id)
            }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(id) = handle.await.unwrap() {
                claimed.push(id);
            }
        }
        let unique: HashSet<_> = claimed.iter().cloned().collect();
        assert_eq!(claimed.len(), 5);
        assert_eq!(unique.len(), 5);
    }

    #[tokio::test]
    async fn test_complete_requires_ownership() {
        let (_dir, store) = store_with(vec![TaskState::new("t1", "one")]).await;
        store.claim_task("w1").await.unwrap();

        let err = store.complete_task("t1", "w2", false).await.unwrap_err();
        assert!(matches!(err, Error::Ownership { .. }));
        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.tasks.get("t1").unwrap().status, TaskStatus::Running);

        let done = store.complete_task("t1", "w2", true).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_complete_unknown_task() {
        let (_dir, store) = store_with(vec![]).await;
        assert!(store.complete_task("ghost", "w1", true).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_assign_specific_task() {
        let (_dir, store) = store_with(vec![TaskState::new("t1", "one"), TaskState::new("t2", "two")]).await;

        let claim = store.assign_task("t2", "w1").await.unwrap();
        assert_eq!(claim.task.unwrap().id, "t2");
        // the worker's own claim is a retry on the assigned task
        let retry = store.claim_task("w1").await.unwrap();
        assert!(retry.is_retry);
        assert_eq!(retry.task.unwrap().id, "t2");
        // already taken
        assert!(store.assign_task("t2", "w2").await.unwrap().task.is_none());
    }

    #[tokio::test]
    async fn test_release_and_fail() {
        let (_dir, store) = store_with(vec![TaskState::new("t1", "one")]).await;
        store.claim_task("w1").await.unwrap();

        let released = store.release_task("t1").await.unwrap();
        assert_eq!(released.status, TaskStatus::Pending);

        store.claim_task("w2").await.unwrap();
        let failed = store.fail_task("t1", "w2", "tests failed").await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("tests failed"));
    }

    #[tokio::test]
    async fn test_corrupt_temp_file_leaves_state_intact() {
        let (dir, store) = store_with(vec![TaskState::new("t1", "one")]).await;
        drop(store);

        // a crash mid-save leaves a truncated sibling temp file behind
        std::fs::write(dir.path().join("state.json.tmp"), "{\"workflowId\": \"wf").unwrap();

        let reopened = StateStore::new(dir.path().join("state.json"));
        let state = reopened.load().await.unwrap().unwrap();
        assert!(state.tasks.contains("t1"));
    }

    #[tokio::test]
    async fn test_failed_save_keeps_last_good_state() {
        let (dir, store) = store_with(vec![TaskState::new("t1", "one")]).await;

        // block the temp file path so the next write fails
        std::fs::create_dir(dir.path().join("state.json.tmp")).unwrap();

        let changed = seeded_state(vec![TaskState::new("t9", "nine")]);
        assert!(store.save(changed).await.is_err());

        let state = store.load().await.unwrap().unwrap();
        assert!(state.tasks.contains("t1"));
        assert!(!state.tasks.contains("t9"));
        let on_disk: WorkflowState =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("state.json")).unwrap()).unwrap();
        assert!(on_disk.tasks.contains("t1"));
    }

    #[tokio::test]
    async fn test_update_error_leaves_state_unchanged() {
        let (_dir, store) = store_with(vec![TaskState::new("t1", "one")]).await;
        let result: Result<()> = store
            .update(|state| {
                state.current_phase = "verify".to_string();
                Err(Error::Other("abort".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.load().await.unwrap().unwrap().current_phase, "implement");
    }

    #[tokio::test]
    async fn test_recover_from_crash_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(Utc::now().timestamp_millis());
        let store = StateStore::with_clock(dir.path().join("state.json"), Arc::new(clock.clone()));

        let mut state = seeded_state(vec![
            TaskState::new("t1", "one").with_timeout(5),
            TaskState::new("t2", "two").with_timeout(3600),
        ]);
        let mut agent = AgentState::new("w1", "implementer");
        agent.status = AgentStatus::Active;
        state.agents.insert("w1".into(), agent);
        store.save(state).await.unwrap();
        store.claim_task("w1").await.unwrap();
        store.claim_task("w2").await.unwrap();

        clock.advance(6_000);
        let first = store.recover_from_crash().await.unwrap();
        let orphaned: Vec<_> = first
            .repaired
            .iter()
            .filter(|r| r.kind == RepairKind::OrphanedTask)
            .collect();
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].id, "t1");
        assert_eq!(orphaned[0].previous_owner.as_deref(), Some("w1"));
        assert!(first.repaired.iter().any(|r| r.kind == RepairKind::StaleAgent));

        let state = first.state.unwrap();
        let t1 = state.tasks.get("t1").unwrap();
        assert_eq!(t1.status, TaskStatus::Pending);
        assert!(t1.claimed_by.is_none() && t1.claimed_at.is_none() && t1.started_at.is_none());
        assert_eq!(state.tasks.get("t2").unwrap().status, TaskStatus::Running);

        let second = store.recover_from_crash().await.unwrap();
        assert!(second.repaired.is_empty());
    }

    #[tokio::test]
    async fn test_recover_releases_unexpired_task_of_active_agent() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(Utc::now().timestamp_millis());
        let store = StateStore::with_clock(dir.path().join("state.json"), Arc::new(clock.clone()));

        let mut state = seeded_state(vec![
            TaskState::new("t1", "one").with_timeout(3600),
            TaskState::new("t2", "two").with_timeout(3600),
        ]);
        let mut agent = AgentState::new("w1", "implementer");
        agent.status = AgentStatus::Active;
        state.agents.insert("w1".into(), agent);
        store.save(state).await.unwrap();
        store.claim_task("w1").await.unwrap();
        store.claim_task("w2").await.unwrap();

        // well inside the timeout: only ownership by a dead agent orphans t1
        clock.advance(1_000);
        let first = store.recover_from_crash().await.unwrap();
        assert_eq!(first.repaired.len(), 2);
        assert!(first
            .repaired
            .iter()
            .any(|r| r.kind == RepairKind::OrphanedTask && r.id == "t1" && r.previous_owner.as_deref() == Some("w1")));
        assert!(first
            .repaired
            .iter()
            .any(|r| r.kind == RepairKind::StaleAgent && r.id == "w1"));

        let state = store.load().await.unwrap().unwrap();
        let t1 = state.tasks.get("t1").unwrap();
        assert_eq!(t1.status, TaskStatus::Pending);
        assert!(t1.claimed_by.is_none());
        // w2 was never recorded as an agent, so its unexpired claim stands
        assert_eq!(state.tasks.get("t2").unwrap().claimed_by.as_deref(), Some("w2"));
        let w1 = &state.agents["w1"];
        assert_eq!(w1.status, AgentStatus::Stopped);
        assert!(w1.pid.is_none() && w1.current_task.is_none());

        let second = store.recover_from_crash().await.unwrap();
        assert!(second.repaired.is_empty());
        assert_eq!(second.state.unwrap().tasks.get("t1").unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_reset_removes_state() {
        let (dir, store) = store_with(vec![TaskState::new("t1", "one")]).await;
        store.reset().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        assert!(!dir.path().join("state.json").exists());
        // resetting twice is fine
        store.reset().await.unwrap();
    }
}
