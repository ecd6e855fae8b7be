//! Unix socket server for the control protocol

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use warden_core::EventSink;

use crate::handler::RequestHandler;
use crate::protocol::{encode_line, PushEvent, Request, Response, CHANNELS};
use crate::{Error, Result};

struct Subscriber {
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<String>,
}

/// Accepts control connections and fans out published events
///
/// Each connection gets a writer task fed by a channel, so responses and
/// pushed events never interleave mid-line.
pub struct ControlServer {
    path: PathBuf,
    listener: tokio::sync::Mutex<Option<UnixListener>>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for ControlServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlServer").field("path", &self.path).finish_non_exhaustive()
    }
}

impl ControlServer {
    /// Bind the socket, replacing a stale one left by a dead daemon
    pub async fn bind(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        if path.exists() {
            if UnixStream::connect(&path).await.is_ok() {
                return Err(Error::AddressInUse(path));
            }
            tracing::debug!(path = %path.display(), "Removing stale socket");
            tokio::fs::remove_file(&path).await?;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let listener = UnixListener::bind(&path)?;
        tracing::info!(path = %path.display(), "Control socket listening");

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            path,
            listener: tokio::sync::Mutex::new(Some(listener)),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called
    pub async fn serve(self: Arc<Self>, handler: Arc<dyn RequestHandler>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::InvalidRequest("server is already serving".to_string()))?;
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        let server = Arc::clone(&self);
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            if let Err(e) = server.connection(id, stream, handler).await {
                                tracing::debug!(connection = id, error = %e, "Connection ended with error");
                            }
                            server.subscribers().remove(&id);
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        self.subscribers().clear();
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::debug!(path = %self.path.display(), error = %e, "Socket already gone");
        }
        tracing::info!("Control socket closed");
        Ok(())
    }

    /// Stop accepting; open connections end when their clients hang up
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    async fn connection(&self, id: u64, stream: UnixStream, handler: Arc<dyn RequestHandler>) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut reader = BufReader::new(read_half);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line.trim(),
                Err(e) => {
                    let response = Response::error(format!("Invalid request: {}", e));
                    if tx.send(encode_line(&response)?).is_err() {
                        break;
                    }
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<Request>(line) {
                Ok(Request::Subscribe { channel }) => self.subscribe(id, &channel, &tx),
                Ok(request) => {
                    tracing::debug!(connection = id, command = request.name(), "Request");
                    handler.handle(request).await
                }
                Err(e) => Response::error(format!("Invalid request: {}", e)),
            };
            if tx.send(encode_line(&response)?).is_err() {
                break;
            }
        }

        drop(tx);
        self.subscribers().remove(&id);
        let _ = writer.await;
        Ok(())
    }

    fn subscribe(&self, id: u64, channel: &str, tx: &mpsc::UnboundedSender<String>) -> Response {
        if !CHANNELS.contains(&channel) {
            return Response::error(format!(
                "Unknown channel '{}', expected one of: {}",
                channel,
                CHANNELS.join(", ")
            ));
        }
        let mut subscribers = self.subscribers();
        let entry = subscribers.entry(id).or_insert_with(|| Subscriber {
            channels: HashSet::new(),
            tx: tx.clone(),
        });
        entry.channels.insert(channel.to_string());
        tracing::debug!(connection = id, channel, "Subscribed");
        Response::ok(serde_json::json!({ "channel": channel }))
    }

    /// Send `data` to every subscriber of `topic`; dead subscribers are dropped
    pub fn broadcast(&self, topic: &str, data: serde_json::Value) {
        let line = match encode_line(&PushEvent::new(topic, data)) {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!(topic, error = %e, "Unencodable event dropped");
                return;
            }
        };
        self.subscribers().retain(|id, sub| {
            if !sub.channels.contains(topic) {
                return true;
            }
            let alive = sub.tx.send(line.clone()).is_ok();
            if !alive {
                tracing::debug!(connection = id, "Pruning dead subscriber");
            }
            alive
        });
    }
}

impl EventSink for ControlServer {
    fn publish(&self, topic: &str, data: serde_json::Value) {
        self.broadcast(topic, data);
    }
}
