//! Broadcast broker: fan published events out to every live subscriber.
//!
//! One coordinating task owns the subscriber set. Subscribe, unsubscribe and
//! publish requests all travel through a single FIFO command queue that the
//! task drains one command at a time, so the set needs no lock and every
//! subscriber observes publishes in the same total order. Each subscriber
//! owns an unbounded delivery queue and drains it from its own task, so a
//! slow connection never stalls fan-out to the rest.

use crate::message::StreamEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Identity of one subscriber queue.
pub type SubscriberId = u64;

/// Counter for subscriber identities, unique across all brokers.
static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Commands accepted by the coordinating task.
enum Command {
    Subscribe {
        id: SubscriberId,
        queue: mpsc::UnboundedSender<Arc<StreamEvent>>,
    },
    Unsubscribe {
        id: SubscriberId,
    },
    Publish {
        event: Arc<StreamEvent>,
    },
    SubscriberCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to the broadcast broker.
///
/// Cheap to clone; all clones feed the same coordinating task, which runs
/// for the lifetime of the process.
#[derive(Clone)]
pub struct Broker {
    commands: mpsc::UnboundedSender<Command>,
}

impl Broker {
    /// Create a broker and spawn its coordinating task.
    #[must_use]
    pub fn new() -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();
        tokio::spawn(listen(inbox));
        Self { commands }
    }

    /// Register a new subscriber queue.
    ///
    /// The subscription receives every event published after this call
    /// returns, in publish order. Dropping it unsubscribes.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
        let (queue, events) = mpsc::unbounded_channel();
        let _ = self.commands.send(Command::Subscribe { id, queue });

        Subscription {
            id,
            events,
            commands: self.commands.clone(),
        }
    }

    /// Remove a subscriber queue from the live set.
    ///
    /// A no-op when the subscriber is already gone, so explicit teardown and
    /// guard-driven teardown can both call it without coordination.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let _ = self.commands.send(Command::Unsubscribe { id });
    }

    /// Fan an event out to every currently registered subscriber.
    ///
    /// Cannot fail. A subscriber whose queue has been closed is removed from
    /// the set during fan-out rather than surfacing an error.
    pub fn publish(&self, event: StreamEvent) {
        let _ = self.commands.send(Command::Publish {
            event: Arc::new(event),
        });
    }

    /// Number of currently registered subscribers.
    ///
    /// Answered by the coordinating task after it has processed every
    /// command enqueued before this one.
    pub async fn subscriber_count(&self) -> usize {
        let (reply, count) = oneshot::channel();
        if self
            .commands
            .send(Command::SubscriberCount { reply })
            .is_err()
        {
            return 0;
        }
        count.await.unwrap_or(0)
    }

    /// Spawn the keepalive task.
    ///
    /// Every `interval` it publishes a synthetic [`StreamEvent::keepalive`]
    /// through the ordinary publish path, under the same ordering and
    /// fan-out guarantees as real messages, so intermediary infrastructure
    /// does not reclaim idle connections. Keepalives are never stored.
    pub fn spawn_keepalive(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                trace!("Publishing keepalive");
                broker.publish(StreamEvent::keepalive());
            }
        })
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

/// The coordinating task: drains the command queue one command at a time.
async fn listen(mut inbox: mpsc::UnboundedReceiver<Command>) {
    let mut subscribers: HashMap<SubscriberId, mpsc::UnboundedSender<Arc<StreamEvent>>> =
        HashMap::new();

    while let Some(command) = inbox.recv().await {
        match command {
            Command::Subscribe { id, queue } => {
                debug!(subscriber = id, "Subscriber connected");
                subscribers.insert(id, queue);
            }
            Command::Unsubscribe { id } => {
                if subscribers.remove(&id).is_some() {
                    debug!(subscriber = id, "Subscriber disconnected");
                }
            }
            Command::Publish { event } => {
                trace!(subscribers = subscribers.len(), "Fanning out event");
                subscribers.retain(|id, queue| {
                    let delivered = queue.send(Arc::clone(&event)).is_ok();
                    if !delivered {
                        debug!(subscriber = *id, "Dropping closed subscriber queue");
                    }
                    delivered
                });
            }
            Command::SubscriberCount { reply } => {
                let _ = reply.send(subscribers.len());
            }
        }
    }
}

/// A live subscription to the broker.
///
/// Events arrive in publish order. Dropping the subscription removes its
/// queue from the broker on every exit path, normal or cancelled; the
/// removal is idempotent, so an explicit [`Broker::unsubscribe`] beforehand
/// is harmless.
pub struct Subscription {
    id: SubscriberId,
    events: mpsc::UnboundedReceiver<Arc<StreamEvent>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    /// Identity of this subscriber's queue.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the subscription has been removed from the broker
    /// and its queue is drained.
    pub async fn recv(&mut self) -> Option<Arc<StreamEvent>> {
        self.events.recv().await
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Arc<StreamEvent>> {
        self.events.try_recv().ok()
    }

    /// Poll for the next event.
    ///
    /// This is the adapter seam for wrapping a subscription into a `Stream`.
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Arc<StreamEvent>>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Unsubscribe { id: self.id });
    }
}
