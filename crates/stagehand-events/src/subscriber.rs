//! Subscriber registration and per-subscription delivery workers.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use stagehand_protocol::{Event, SessionId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

/// Who is listening. Closed set; one session may hold several of each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberKind {
    AgentController,
    Server,
    Runtime,
    Memory,
    Persistence,
    Ui,
    Test,
}

impl fmt::Display for SubscriberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriberKind::AgentController => "agent_controller",
            SubscriberKind::Server => "server",
            SubscriberKind::Runtime => "runtime",
            SubscriberKind::Memory => "memory",
            SubscriberKind::Persistence => "persistence",
            SubscriberKind::Ui => "ui",
            SubscriberKind::Test => "test",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_event(&self, event: Arc<Event>) -> anyhow::Result<()>;
}

struct FnSubscriber<F>(F);

#[async_trait]
impl<F, Fut> EventSubscriber for FnSubscriber<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn on_event(&self, event: Arc<Event>) -> anyhow::Result<()> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as a subscriber.
pub fn subscriber_fn<F, Fut>(f: F) -> Arc<dyn EventSubscriber>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnSubscriber(f))
}

pub(crate) struct Subscription {
    pub(crate) kind: SubscriberKind,
    pub(crate) sender: mpsc::UnboundedSender<Arc<Event>>,
    pub(crate) worker: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn spawn(
        session_id: SessionId,
        id: SubscriptionId,
        kind: SubscriberKind,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<Arc<Event>>();
        let worker = tokio::spawn(async move {
            let mut events = UnboundedReceiverStream::new(receiver);
            while let Some(event) = events.next().await {
                let event_id = event.id;
                let delivery = AssertUnwindSafe(subscriber.on_event(event)).catch_unwind();
                match delivery.await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => warn!(
                        %session_id,
                        subscription = %id,
                        %kind,
                        %event_id,
                        error = %error,
                        "subscriber failed handling event"
                    ),
                    Err(panic) => warn!(
                        %session_id,
                        subscription = %id,
                        %kind,
                        %event_id,
                        panic = panic_message(panic.as_ref()),
                        "subscriber panicked handling event"
                    ),
                }
            }
            debug!(%session_id, subscription = %id, %kind, "subscription worker drained");
        });
        Self {
            kind,
            sender,
            worker,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
