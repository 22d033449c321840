//! Event bus — agent-facing publish/subscribe API over an `EventTransport`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cadence_types::EventMessage;

use crate::transport::EventTransport;
use crate::{BROADCAST_CHANNEL, agent_channel};

/// Async event handler function type.
pub type EventHandler =
    Arc<dyn Fn(EventMessage) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`].
pub fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(EventMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| -> Pin<Box<dyn Future<Output = ()> + Send>> { Box::pin(f(event)) })
}

struct Subscription {
    agent_name: String,
    event_type: Option<String>,
    handler: EventHandler,
}

struct JoinedChannel {
    agents: HashSet<String>,
    forwarder: JoinHandle<()>,
}

#[derive(Default)]
struct BusState {
    channels: HashMap<String, JoinedChannel>,
    handlers: HashMap<String, Vec<Subscription>>,
}

/// One subscriber's view of the event channel.
///
/// Each bus receives a given message at most once, even when several agents
/// are subscribed through it.
pub struct EventBus {
    transport: Arc<dyn EventTransport>,
    inbox_tx: mpsc::UnboundedSender<(String, String)>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<(String, String)>>,
    state: RwLock<BusState>,
}

impl EventBus {
    pub fn new(transport: Arc<dyn EventTransport>) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
            state: RwLock::new(BusState::default()),
        }
    }

    /// Publish an event to `target_agent`, or to everyone when `None`.
    ///
    /// Transport failures are logged, never returned.
    pub async fn publish(
        &self,
        event_type: &str,
        source_agent: &str,
        payload: Value,
        target_agent: Option<&str>,
    ) {
        let event = EventMessage::new(
            event_type,
            source_agent,
            payload,
            target_agent.map(str::to_string),
        );
        self.publish_message(&event).await;
    }

    /// Publish an already-built event.
    pub async fn publish_message(&self, event: &EventMessage) {
        let channel = match &event.target_agent {
            Some(agent) => agent_channel(agent),
            None => BROADCAST_CHANNEL.to_string(),
        };
        let message = match serde_json::to_string(event) {
            Ok(m) => m,
            Err(e) => {
                error!("Error serializing event {}: {e}", event.event_type);
                return;
            }
        };
        match self.transport.publish(&channel, message).await {
            Ok(receivers) => info!(
                event_type = %event.event_type,
                source = %event.source_agent,
                channel = %channel,
                receivers,
                "Published event"
            ),
            Err(e) => error!("Error publishing event {}: {e}", event.event_type),
        }
    }

    /// Join the broadcast channel and `agent_name`'s private channel.
    ///
    /// With a handler, it runs for every received message whose type equals
    /// `event_type` (or for all messages when `event_type` is `None`).
    pub async fn subscribe(
        &self,
        agent_name: &str,
        event_type: Option<&str>,
        handler: Option<EventHandler>,
    ) -> crate::Result<()> {
        let channels = [agent_channel(agent_name), BROADCAST_CHANNEL.to_string()];
        let mut state = self.state.write().await;

        for channel in &channels {
            if !state.channels.contains_key(channel) {
                let stream = self.transport.subscribe(channel).await?;
                let forwarder = spawn_forwarder(channel.clone(), stream, self.inbox_tx.clone());
                state.channels.insert(
                    channel.clone(),
                    JoinedChannel {
                        agents: HashSet::new(),
                        forwarder,
                    },
                );
            }
            if let Some(joined) = state.channels.get_mut(channel) {
                joined.agents.insert(agent_name.to_string());
            }
            if let Some(handler) = &handler {
                state
                    .handlers
                    .entry(channel.clone())
                    .or_default()
                    .push(Subscription {
                        agent_name: agent_name.to_string(),
                        event_type: event_type.map(str::to_string),
                        handler: handler.clone(),
                    });
            }
        }

        info!("Subscribed {agent_name} to channels: {channels:?}");
        Ok(())
    }

    /// Leave both of `agent_name`'s channels and drop its handlers.
    ///
    /// The broadcast channel stays joined while other agents on this bus use it.
    pub async fn unsubscribe(&self, agent_name: &str) {
        let channels = [agent_channel(agent_name), BROADCAST_CHANNEL.to_string()];
        let mut state = self.state.write().await;

        for channel in &channels {
            let now_unused = match state.channels.get_mut(channel) {
                Some(joined) => {
                    joined.agents.remove(agent_name);
                    joined.agents.is_empty()
                }
                None => false,
            };
            if now_unused {
                if let Some(joined) = state.channels.remove(channel) {
                    joined.forwarder.abort();
                }
            }
            if let Some(subs) = state.handlers.get_mut(channel) {
                subs.retain(|s| s.agent_name != agent_name);
                if subs.is_empty() {
                    state.handlers.remove(channel);
                }
            }
        }

        info!("Unsubscribed {agent_name} from events");
    }

    /// Wait for the next message, running matching handlers before returning it.
    ///
    /// A `None` timeout waits until a message arrives.
    pub async fn listen(&self, timeout: Option<Duration>) -> Option<EventMessage> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut inbox = self.inbox_rx.lock().await;

        loop {
            let received = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, inbox.recv()).await {
                    Ok(received) => received,
                    Err(_) => return None,
                },
                None => inbox.recv().await,
            };
            let (channel, raw) = received?;

            // Messages still buffered from a channel we have since left
            if !self.state.read().await.channels.contains_key(&channel) {
                debug!(channel = %channel, "Dropping event from unsubscribed channel");
                continue;
            }

            let event: EventMessage = match serde_json::from_str(&raw) {
                Ok(event) => event,
                Err(e) => {
                    warn!(channel = %channel, "Discarding malformed event: {e}");
                    continue;
                }
            };

            self.dispatch(&channel, &event).await;
            return Some(event);
        }
    }

    /// Deliver messages to handlers until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Event listener started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.listen(Some(Duration::from_secs(1))) => {}
            }
        }
        info!("Event listener stopped");
    }

    /// Drop every subscription held by this bus.
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        for (_, joined) in state.channels.drain() {
            joined.forwarder.abort();
        }
        state.handlers.clear();
    }

    async fn dispatch(&self, channel: &str, event: &EventMessage) {
        let handlers: Vec<EventHandler> = {
            let state = self.state.read().await;
            state
                .handlers
                .get(channel)
                .map(|subs| {
                    subs.iter()
                        .filter(|s| {
                            s.event_type
                                .as_deref()
                                .is_none_or(|t| t == event.event_type)
                        })
                        .map(|s| s.handler.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        for handler in handlers {
            // A panicking handler must not take the listener down with it
            if let Err(e) = tokio::spawn(handler(event.clone())).await {
                error!("Error in event callback for {}: {e}", event.event_type);
            }
        }
    }
}

fn spawn_forwarder(
    channel: String,
    mut stream: crate::transport::ChannelStream,
    inbox: mpsc::UnboundedSender<(String, String)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(raw) = stream.next().await {
            if inbox.send((channel.clone(), raw)).is_err() {
                break;
            }
        }
        debug!(channel = %channel, "Event forwarder finished");
    })
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_write() {
            for (_, joined) in state.channels.drain() {
                joined.forwarder.abort();
            }
        }
    }
}
