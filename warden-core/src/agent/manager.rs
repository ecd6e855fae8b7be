//! Agent process supervision
//!
//! Each spawned agent gets three background tasks: stdout and stderr readers
//! that turn lines into [`AgentOutput`]s on one shared channel, and a
//! supervisor that owns the [`Child`], waits for it to exit (or to be told to
//! kill it), removes the agent from the live set and queues `Exited`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use super::backend::{Backend, LaunchSpec};
use super::output::{AgentOutput, OutputStream, StreamParser};
use crate::{Error, Result};

/// How long a reader may outlive its process before it is abandoned
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Public view of a live agent
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    pub agent_type: String,
    pub task_id: Option<String>,
    pub pid: Option<u32>,
    pub session_id: String,
    pub spawned_at: DateTime<Utc>,
}

/// Control surface the correction applicator needs
#[async_trait]
pub trait AgentControl: Send + Sync {
    /// Write a user message to the agent's input stream
    async fn inject(&self, agent_id: &str, text: &str) -> Result<()>;

    /// Stop the agent and launch it again under the same id
    async fn restart(&self, agent_id: &str) -> Result<AgentInfo>;

    async fn stop(&self, agent_id: &str) -> Result<()>;
}

struct LiveAgent {
    info: AgentInfo,
    launch: LaunchSpec,
    stdin: Option<ChildStdin>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

type LiveMap = Arc<Mutex<HashMap<String, LiveAgent>>>;

pub struct AgentManager {
    backend: Arc<dyn Backend>,
    workdir: PathBuf,
    grace: Duration,
    agents: LiveMap,
    output_tx: mpsc::UnboundedSender<(String, AgentOutput)>,
    output_rx: Mutex<mpsc::UnboundedReceiver<(String, AgentOutput)>>,
}

impl std::fmt::Debug for AgentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentManager")
            .field("backend", &self.backend.name())
            .field("workdir", &self.workdir)
            .field("grace", &self.grace)
            .finish()
    }
}

impl AgentManager {
    pub fn new(backend: Arc<dyn Backend>, workdir: impl Into<PathBuf>) -> Self {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        Self {
            backend,
            workdir: workdir.into(),
            grace: Duration::from_secs(5),
            agents: Arc::new(Mutex::new(HashMap::new())),
            output_tx,
            output_rx: Mutex::new(output_rx),
        }
    }

    /// Time between SIGTERM and SIGKILL
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// `{type}-{first 8 chars of task}-{6 hex}`
    pub fn generate_id(agent_type: &str, task_id: Option<&str>) -> String {
        let task: String = task_id.unwrap_or("none").chars().take(8).collect();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", agent_type, task, &suffix[..6])
    }

    /// Launch a new agent process
    pub async fn spawn(&self, spec: LaunchSpec) -> Result<AgentInfo> {
        let id = Self::generate_id(&spec.agent_type, spec.task_id.as_deref());
        self.spawn_as(id, spec).await
    }

    async fn spawn_as(&self, id: String, spec: LaunchSpec) -> Result<AgentInfo> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let spec = spec.with_env("WARDEN_AGENT_ID", id.clone());
        let mut child = self.backend.spawn(&spec, &session_id, &self.workdir).await?;

        let info = AgentInfo {
            id: id.clone(),
            agent_type: spec.agent_type.clone(),
            task_id: spec.task_id.clone(),
            pid: child.id(),
            session_id: session_id.clone(),
            spawned_at: Utc::now(),
        };

        let mut stdin = child.stdin.take();
        if let Some(pipe) = stdin.as_mut() {
            if !spec.prompt.is_empty() {
                let line = self.backend.encode_input(&spec.prompt);
                if let Err(e) = write_line(pipe, &line).await {
                    tracing::warn!(agent_id = %id, error = %e, "Could not send initial prompt");
                }
            }
        }

        let readers = self.start_readers(&id, &mut child);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);

        self.agents.lock().await.insert(
            id.clone(),
            LiveAgent {
                info: info.clone(),
                launch: spec,
                stdin,
                kill_tx: Some(kill_tx),
                exited: exited_rx,
            },
        );

        tokio::spawn(supervise(
            id.clone(),
            session_id,
            child,
            kill_rx,
            readers,
            self.agents.clone(),
            self.output_tx.clone(),
            exited_tx,
        ));

        tracing::info!(agent_id = %id, agent_type = %info.agent_type, task_id = ?info.task_id, pid = ?info.pid, "Agent spawned");
        Ok(info)
    }

    fn start_readers(&self, id: &str, child: &mut Child) -> Vec<tokio::task::JoinHandle<()>> {
        let mut readers = Vec::new();

        if let Some(stdout) = child.stdout.take() {
            let tx = self.output_tx.clone();
            let id = id.to_string();
            readers.push(tokio::spawn(async move {
                let mut parser = StreamParser::new();
                let mut reader = BufReader::new(stdout);
                let mut buf = Vec::new();
                loop {
                    match next_lossy_line(&mut reader, &mut buf).await {
                        Ok(Some(line)) => {
                            for output in parser.parse_line(&line) {
                                if tx.send((id.clone(), output)).is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::debug!(agent_id = %id, error = %e, "Agent stdout closed");
                            break;
                        }
                    }
                }
            }));
        }

        if let Some(stderr) = child.stderr.take() {
            let tx = self.output_tx.clone();
            let id = id.to_string();
            readers.push(tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                while let Ok(Some(line)) = next_lossy_line(&mut reader, &mut buf).await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let output = AgentOutput::Raw {
                        stream: OutputStream::Stderr,
                        line,
                    };
                    if tx.send((id.clone(), output)).is_err() {
                        return;
                    }
                }
            }));
        }

        readers
    }

    /// Everything the agents produced since the last drain, in arrival order
    pub async fn drain(&self) -> Vec<(String, AgentOutput)> {
        let mut rx = self.output_rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(item) = rx.try_recv() {
            drained.push(item);
        }
        drained
    }

    pub async fn list(&self) -> Vec<AgentInfo> {
        let agents = self.agents.lock().await;
        let mut list: Vec<_> = agents.values().map(|a| a.info.clone()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentInfo> {
        self.agents.lock().await.get(agent_id).map(|a| a.info.clone())
    }

    pub async fn is_running(&self, agent_id: &str) -> bool {
        self.agents.lock().await.contains_key(agent_id)
    }

    pub async fn len(&self) -> usize {
        self.agents.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.lock().await.is_empty()
    }

    /// SIGTERM, then SIGKILL once the grace period runs out
    pub async fn stop(&self, agent_id: &str) -> Result<()> {
        let (pid, kill_tx, mut exited) = {
            let mut agents = self.agents.lock().await;
            let agent = agents
                .get_mut(agent_id)
                .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?;
            // closing stdin lets well-behaved agents finish on their own
            agent.stdin = None;
            (agent.info.pid, agent.kill_tx.take(), agent.exited.clone())
        };

        if let Some(pid) = pid {
            match i32::try_from(pid) {
                Ok(raw) => {
                    if let Err(e) = signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
                        tracing::debug!(agent_id, pid, error = %e, "SIGTERM failed");
                    }
                }
                Err(_) => tracing::warn!(agent_id, pid, "Pid out of range, skipping SIGTERM"),
            }
        }

        let graceful = tokio::time::timeout(self.grace, exited.wait_for(|done| *done))
            .await
            .is_ok();
        if !graceful {
            tracing::warn!(agent_id, grace_ms = self.grace.as_millis() as u64, "Agent ignored SIGTERM, killing");
            if let Some(tx) = kill_tx {
                let _ = tx.send(());
            }
            let _ = exited.wait_for(|done| *done).await;
        }

        tracing::info!(agent_id, "Agent stopped");
        Ok(())
    }

    /// Stop every live agent concurrently
    pub async fn kill_all(&self) {
        let ids: Vec<String> = self.agents.lock().await.keys().cloned().collect();
        let results = futures::future::join_all(ids.iter().map(|id| self.stop(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                tracing::debug!(agent_id = %id, error = %e, "Stop during kill_all failed");
            }
        }
    }

    /// Stop an agent and relaunch it under the same id with a fresh session
    pub async fn restart(&self, agent_id: &str) -> Result<AgentInfo> {
        let launch = {
            let agents = self.agents.lock().await;
            agents
                .get(agent_id)
                .map(|a| a.launch.clone())
                .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?
        };
        self.stop(agent_id).await?;
        tracing::info!(agent_id, "Restarting agent");
        self.spawn_as(agent_id.to_string(), launch).await
    }

    /// Send a user message to the agent's stdin
    pub async fn inject(&self, agent_id: &str, text: &str) -> Result<()> {
        let line = self.backend.encode_input(text);
        let mut agents = self.agents.lock().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?;
        let stdin = agent
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Agent(format!("agent {} has no input stream", agent_id)))?;
        write_line(stdin, &line)
            .await
            .map_err(|e| Error::Agent(format!("write to agent {} failed: {}", agent_id, e)))
    }
}

#[async_trait]
impl AgentControl for AgentManager {
    async fn inject(&self, agent_id: &str, text: &str) -> Result<()> {
        AgentManager::inject(self, agent_id, text).await
    }

    async fn restart(&self, agent_id: &str) -> Result<AgentInfo> {
        AgentManager::restart(self, agent_id).await
    }

    async fn stop(&self, agent_id: &str) -> Result<()> {
        AgentManager::stop(self, agent_id).await
    }
}

/// Next line with invalid UTF-8 replaced, so odd bytes never end the stream
async fn next_lossy_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    id: String,
    session_id: String,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    readers: Vec<tokio::task::JoinHandle<()>>,
    agents: LiveMap,
    output_tx: mpsc::UnboundedSender<(String, AgentOutput)>,
    exited_tx: watch::Sender<bool>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(agent_id = %id, error = %e, "SIGKILL failed");
            }
            child.wait().await
        }
    };
    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(agent_id = %id, error = %e, "Waiting on agent failed");
            None
        }
    };

    // let buffered output land before the exit notice
    for reader in readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
            tracing::debug!(agent_id = %id, "Output reader outlived its process");
        }
    }

    {
        let mut live = agents.lock().await;
        if live.get(&id).map(|a| a.info.session_id == session_id).unwrap_or(false) {
            live.remove(&id);
        }
    }

    tracing::info!(agent_id = %id, exit_code = ?code, "Agent exited");
    let _ = output_tx.send((id, AgentOutput::Exited { code }));
    let _ = exited_tx.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::backend::CommandBackend;
    use std::time::Instant;

    fn manager(script: &str) -> (tempfile::TempDir, AgentManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = AgentManager::new(Arc::new(CommandBackend::shell(script)), dir.path())
            .with_grace_period(Duration::from_millis(300));
        (dir, manager)
    }

    async fn drain_until_exit(manager: &AgentManager, agent_id: &str) -> Vec<AgentOutput> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            for (id, output) in manager.drain().await {
                if id == agent_id {
                    let done = matches!(output, AgentOutput::Exited { .. });
                    seen.push(output);
                    if done {
                        return seen;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("agent {} never exited; saw {:?}", agent_id, seen);
    }

    #[test]
    fn test_generate_id_format() {
        let id = AgentManager::generate_id("implementer", Some("task-0123456789"));
        let parts: Vec<_> = id.rsplitn(2, '-').collect();
        assert_eq!(parts[1], "implementer-task-012");
        assert_eq!(parts[0].len(), 6);
        assert!(parts[0].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_output_is_parsed_and_exit_reported() {
        let script = r#"echo '{"type":"tool_use","tool":"Write","input":{"file_path":"src/a.ts"}}'; echo 'plain text'; echo oops >&2; exit 3"#;
        let (_dir, manager) = manager(script);
        let info = manager.spawn(LaunchSpec::new("implementer", "").with_task("T1")).await.unwrap();
        assert!(info.id.starts_with("implementer-T1-"));

        let outputs = drain_until_exit(&manager, &info.id).await;
        assert!(outputs.iter().any(|o| matches!(o, AgentOutput::ToolUse { tool, .. } if tool == "Write")));
        assert!(outputs
            .iter()
            .any(|o| matches!(o, AgentOutput::Raw { stream: OutputStream::Stdout, line } if line == "plain text")));
        assert!(outputs
            .iter()
            .any(|o| matches!(o, AgentOutput::Raw { stream: OutputStream::Stderr, .. })));
        assert_eq!(outputs.last(), Some(&AgentOutput::Exited { code: Some(3) }));
        assert!(!manager.is_running(&info.id).await);
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_does_not_end_stream() {
        let script = r#"printf '\377\376\n'; echo '{"type":"tool_use","tool":"Edit","input":{"file_path":"src/b.ts"}}'; printf 'bad \377\n' >&2; echo after >&2"#;
        let (_dir, manager) = manager(script);
        let info = manager.spawn(LaunchSpec::new("implementer", "")).await.unwrap();

        let outputs = drain_until_exit(&manager, &info.id).await;
        assert!(outputs.iter().any(|o| matches!(o, AgentOutput::ToolUse { tool, .. } if tool == "Edit")));
        assert!(outputs
            .iter()
            .any(|o| matches!(o, AgentOutput::Raw { stream: OutputStream::Stdout, line } if line.contains('\u{FFFD}'))));
        assert!(outputs
            .iter()
            .any(|o| matches!(o, AgentOutput::Raw { stream: OutputStream::Stderr, line } if line == "after")));
    }

    #[tokio::test]
    async fn test_stop_terminates_gracefully() {
        let (_dir, manager) = manager("exec sleep 30");
        let info = manager.spawn(LaunchSpec::new("explorer", "")).await.unwrap();
        assert!(manager.is_running(&info.id).await);

        let started = Instant::now();
        manager.stop(&info.id).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!manager.is_running(&info.id).await);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let (_dir, manager) = manager("trap '' TERM; exec sleep 30");
        let info = manager.spawn(LaunchSpec::new("explorer", "")).await.unwrap();
        // give the shell a moment to install the trap
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        manager.stop(&info.id).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "killed before grace: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(10));
        assert!(!manager.is_running(&info.id).await);
    }

    #[tokio::test]
    async fn test_kill_all_and_unknown_agent() {
        let (_dir, manager) = manager("exec sleep 30");
        manager.spawn(LaunchSpec::new("a", "")).await.unwrap();
        manager.spawn(LaunchSpec::new("b", "")).await.unwrap();
        assert_eq!(manager.len().await, 2);

        manager.kill_all().await;
        assert!(manager.is_empty().await);
        assert!(manager.stop("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_inject_reaches_stdin() {
        // echo the first injected line back as assistant text
        let script = r#"read first; read line; printf '{"type":"assistant","message":{"content":"got %s"}}\n' "$(echo "$line" | wc -c | tr -d ' ')"; exec sleep 30"#;
        let (_dir, manager) = manager(script);
        let info = manager.spawn(LaunchSpec::new("implementer", "hello")).await.unwrap();
        manager.inject(&info.id, "stop that").await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut got = None;
        while got.is_none() && Instant::now() < deadline {
            for (_, output) in manager.drain().await {
                if let AgentOutput::Message { text } = output {
                    got = Some(text);
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let text = got.expect("agent never answered");
        assert!(text.starts_with("got "));
        manager.kill_all().await;
    }

    #[tokio::test]
    async fn test_restart_keeps_id() {
        let (_dir, manager) = manager("exec sleep 30");
        let info = manager.spawn(LaunchSpec::new("implementer", "").with_task("T1")).await.unwrap();
        let restarted = manager.restart(&info.id).await.unwrap();

        assert_eq!(restarted.id, info.id);
        assert_ne!(restarted.session_id, info.session_id);
        assert!(manager.is_running(&info.id).await);
        manager.kill_all().await;
    }
}
