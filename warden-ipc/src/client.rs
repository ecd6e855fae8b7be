//! Client side of the control protocol

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use crate::protocol::{encode_line, PushEvent, Request, Response, ServerMessage};
use crate::socket::socket_path;
use crate::{Error, Result};

/// Talks to a running daemon
///
/// Every [`request`](Self::request) opens its own connection; subscriptions
/// keep theirs open.
#[derive(Debug, Clone)]
pub struct ControlClient {
    path: PathBuf,
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await.map_err(|source| Error::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        })
    }

    async fn send(&mut self, request: &Request) -> Result<()> {
        self.writer.write_all(encode_line(request)?.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<ServerMessage>> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(&line)?));
        }
        Ok(None)
    }

    /// Read until the response, skipping pushed events
    async fn response(&mut self) -> Result<Response> {
        loop {
            match self.next_message().await? {
                Some(ServerMessage::Response(response)) => return Ok(response),
                Some(ServerMessage::Event(_)) => continue,
                None => return Err(Error::Closed),
            }
        }
    }
}

fn into_data(response: Response) -> Result<serde_json::Value> {
    match response {
        Response::Ok { data } => Ok(data),
        Response::Error { message } => Err(Error::Remote(message)),
    }
}

impl ControlClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Client for the daemon serving `project_root`
    pub fn for_project(project_root: &Path) -> Self {
        Self::new(socket_path(project_root))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send one request and return the `data` of its response
    pub async fn request(&self, request: &Request) -> Result<serde_json::Value> {
        let mut conn = Connection::open(&self.path).await?;
        conn.send(request).await?;
        into_data(conn.response().await?)
    }

    pub async fn request_with_timeout(&self, request: &Request, limit: Duration) -> Result<serde_json::Value> {
        tokio::time::timeout(limit, self.request(request))
            .await
            .map_err(|_| Error::Timeout(limit))?
    }

    /// True when a daemon answers a ping
    pub async fn is_alive(&self) -> bool {
        self.request_with_timeout(&Request::Ping, Duration::from_secs(2))
            .await
            .is_ok()
    }

    /// Open a connection subscribed to `channel`
    pub async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut conn = Connection::open(&self.path).await?;
        conn.send(&Request::Subscribe {
            channel: channel.to_string(),
        })
        .await?;
        into_data(conn.response().await?)?;
        tracing::debug!(channel, "Subscribed to daemon events");
        Ok(Subscription { conn })
    }
}

/// Events pushed on a subscribed connection
pub struct Subscription {
    conn: Connection,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl Subscription {
    /// Next pushed event, or `None` once the daemon hangs up
    pub async fn next(&mut self) -> Result<Option<PushEvent>> {
        loop {
            match self.conn.next_message().await? {
                Some(ServerMessage::Event(event)) => return Ok(Some(event)),
                Some(ServerMessage::Response(_)) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Subscribe to another channel on the same connection
    pub async fn add_channel(&mut self, channel: &str) -> Result<()> {
        self.conn
            .send(&Request::Subscribe {
                channel: channel.to_string(),
            })
            .await?;
        into_data(self.conn.response().await?)?;
        Ok(())
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<PushEvent>> {
        futures::stream::unfold(self, |mut sub| async move {
            match sub.next().await {
                Ok(Some(event)) => Some((Ok(event), sub)),
                Ok(None) => None,
                Err(e) => Some((Err(e), sub)),
            }
        })
    }
}
