//! Channel layer: named, process-wide message destinations.
//!
//! Every command connection owns one channel. Requests are routed through
//! it to the connection itself, and dispatch results come back through it,
//! so a producer never needs a handle to the socket.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use ahs_core::{AhsError, AhsResult, ChannelMessage};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

type LayerFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// At-least-once delivery to named destinations.
pub trait ChannelLayer: Send + Sync {
    /// Create a uniquely named channel and return its receiving end.
    fn new_channel<'a>(
        &'a self,
        prefix: &'a str,
    ) -> LayerFuture<'a, AhsResult<(String, mpsc::Receiver<ChannelMessage>)>>;

    fn send<'a>(&'a self, channel: &'a str, message: ChannelMessage) -> LayerFuture<'a, AhsResult<()>>;

    /// Forget a channel; later sends to it fail.
    fn discard<'a>(&'a self, channel: &'a str) -> LayerFuture<'a, ()>;
}

/// Single-process channel layer backed by bounded mpsc queues.
pub struct InMemoryChannelLayer {
    channels: Arc<RwLock<HashMap<String, mpsc::Sender<ChannelMessage>>>>,
    capacity: usize,
}

impl InMemoryChannelLayer {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }
}

impl ChannelLayer for InMemoryChannelLayer {
    fn new_channel<'a>(
        &'a self,
        prefix: &'a str,
    ) -> LayerFuture<'a, AhsResult<(String, mpsc::Receiver<ChannelMessage>)>> {
        Box::pin(async move {
            let name = format!("{prefix}.{}", Uuid::new_v4().simple());
            let (tx, rx) = mpsc::channel(self.capacity);
            self.channels.write().await.insert(name.clone(), tx);
            debug!(channel = %name, "channel created");
            Ok((name, rx))
        })
    }

    fn send<'a>(&'a self, channel: &'a str, message: ChannelMessage) -> LayerFuture<'a, AhsResult<()>> {
        Box::pin(async move {
            let tx = self
                .channels
                .read()
                .await
                .get(channel)
                .cloned()
                .ok_or_else(|| AhsError::Channel(format!("no such channel: {channel}")))?;
            tx.send(message)
                .await
                .map_err(|_| AhsError::Channel(format!("channel closed: {channel}")))
        })
    }

    fn discard<'a>(&'a self, channel: &'a str) -> LayerFuture<'a, ()> {
        Box::pin(async move {
            if self.channels.write().await.remove(channel).is_some() {
                debug!(channel, "channel discarded");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahs_core::ResponseEnvelope;
    use serde_json::json;

    fn response(n: i64) -> ChannelMessage {
        ChannelMessage::CommandResponse(ResponseEnvelope {
            app: "system".into(),
            cmd: "ping".into(),
            data: json!(n),
            unique_id: json!(n),
        })
    }

    #[tokio::test]
    async fn send_and_receive_in_order() {
        let layer = InMemoryChannelLayer::new(8);
        let (name, mut rx) = layer.new_channel("ahs").await.unwrap();
        assert!(name.starts_with("ahs."));

        layer.send(&name, response(1)).await.unwrap();
        layer.send(&name, response(2)).await.unwrap();
        assert_eq!(rx.recv().await, Some(response(1)));
        assert_eq!(rx.recv().await, Some(response(2)));
    }

    #[tokio::test]
    async fn names_are_unique() {
        let layer = InMemoryChannelLayer::new(1);
        let (a, _ra) = layer.new_channel("ahs").await.unwrap();
        let (b, _rb) = layer.new_channel("ahs").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(layer.len().await, 2);
    }

    #[tokio::test]
    async fn unknown_and_discarded_channels_fail() {
        let layer = InMemoryChannelLayer::new(1);
        assert!(matches!(
            layer.send("ahs.nope", response(0)).await,
            Err(AhsError::Channel(_))
        ));

        let (name, rx) = layer.new_channel("ahs").await.unwrap();
        layer.discard(&name).await;
        drop(rx);
        assert!(layer.send(&name, response(0)).await.is_err());
        assert_eq!(layer.len().await, 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_an_error() {
        let layer = InMemoryChannelLayer::new(1);
        let (name, rx) = layer.new_channel("ahs").await.unwrap();
        drop(rx);
        assert!(matches!(
            layer.send(&name, response(0)).await,
            Err(AhsError::Channel(_))
        ));
    }
}
