//! Watch command - stream daemon events

use clap::Args;
use futures::StreamExt;
use warden_ipc::{ControlClient, CHANNELS};

/// Arguments for the watch command
#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Channels to follow (default: all)
    channels: Vec<String>,
}

impl WatchArgs {
    pub async fn execute(&self, client: &ControlClient) -> anyhow::Result<()> {
        let channels: Vec<String> = if self.channels.is_empty() {
            CHANNELS.iter().map(|c| c.to_string()).collect()
        } else {
            self.channels.clone()
        };
        let Some((first, rest)) = channels.split_first() else {
            return Ok(());
        };

        let mut subscription = client.subscribe(first).await?;
        for channel in rest {
            subscription.add_channel(channel).await?;
        }
        tracing::info!(channels = ?channels, "Watching daemon events");

        let mut events = Box::pin(subscription.into_stream());
        while let Some(event) = events.next().await {
            let event = event?;
            println!("{} {}", event.event, serde_json::to_string(&event.data)?);
        }
        eprintln!("Daemon closed the connection.");
        Ok(())
    }
}
