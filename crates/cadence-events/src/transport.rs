//! Event transports — move serialized events between named channels.

use std::collections::HashMap;

use futures::stream::{self, BoxStream};
use tokio::sync::{RwLock, broadcast};
use tracing::warn;

use crate::Result;

/// Raw messages received on one channel.
pub type ChannelStream = BoxStream<'static, String>;

/// A fan-out message transport keyed by channel name.
///
/// Implementations must preserve ordering of sequential publishes to the
/// same channel; nothing else is guaranteed.
#[async_trait::async_trait]
pub trait EventTransport: Send + Sync {
    /// Publish a raw message. Returns how many subscribers it reached.
    async fn publish(&self, channel: &str, message: String) -> Result<usize>;

    /// Start receiving messages published on `channel` from now on.
    async fn subscribe(&self, channel: &str) -> Result<ChannelStream>;
}

/// In-process transport built on `tokio::sync::broadcast`.
///
/// Share one instance (behind an `Arc`) between every `EventBus` that should
/// see each other's events.
pub struct LocalTransport {
    capacity: usize,
    channels: RwLock<HashMap<String, broadcast::Sender<String>>>,
}

impl LocalTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait::async_trait]
impl EventTransport for LocalTransport {
    async fn publish(&self, channel: &str, message: String) -> Result<usize> {
        let abandoned = {
            let channels = self.channels.read().await;
            match channels.get(channel) {
                Some(sender) if sender.receiver_count() > 0 => {
                    // No receivers is not an error for pub/sub
                    return Ok(sender.send(message).unwrap_or(0));
                }
                Some(_) => true,
                None => false,
            }
        };
        if abandoned {
            let mut channels = self.channels.write().await;
            if channels
                .get(channel)
                .is_some_and(|sender| sender.receiver_count() == 0)
            {
                channels.remove(channel);
            }
        }
        Ok(0)
    }

    async fn subscribe(&self, channel: &str) -> Result<ChannelStream> {
        let rx = {
            let mut channels = self.channels.write().await;
            channels.retain(|_, sender| sender.receiver_count() > 0);
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        let channel = channel.to_string();
        let stream = stream::unfold(rx, move |mut rx| {
            let channel = channel.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(msg) => return Some((msg, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(channel = %channel, skipped, "Event listener lagged, dropping messages");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let transport = LocalTransport::default();
        assert_eq!(transport.publish("events:nobody", "x".into()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ordering_within_channel() {
        let transport = LocalTransport::new(16);
        let mut stream = transport.subscribe("events:a").await.unwrap();
        for i in 0..5 {
            transport.publish("events:a", i.to_string()).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(stream.next().await.unwrap(), i.to_string());
        }
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let transport = LocalTransport::new(16);
        let mut a = transport.subscribe("events:a").await.unwrap();
        let _b = transport.subscribe("events:b").await.unwrap();

        assert_eq!(transport.publish("events:b", "for-b".into()).await.unwrap(), 1);
        assert_eq!(transport.publish("events:a", "for-a".into()).await.unwrap(), 1);
        assert_eq!(a.next().await.unwrap(), "for-a");
    }

    #[tokio::test]
    async fn test_abandoned_channels_are_pruned() {
        let transport = LocalTransport::new(16);
        let a = transport.subscribe("events:a").await.unwrap();
        let b = transport.subscribe("events:b").await.unwrap();
        assert_eq!(transport.channels.read().await.len(), 2);

        drop(a);
        assert_eq!(transport.publish("events:a", "x".into()).await.unwrap(), 0);
        assert!(!transport.channels.read().await.contains_key("events:a"));

        drop(b);
        let _c = transport.subscribe("events:c").await.unwrap();
        let channels = transport.channels.read().await;
        assert_eq!(channels.len(), 1);
        assert!(channels.contains_key("events:c"));
    }
}
