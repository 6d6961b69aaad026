use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use shared::{
    domain::{ChannelId, Conversation, MessageId},
    paths,
};
use storage::DocumentStore;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    cache::{raw_from_collection, MessageCache, ThreadView},
    listener::ListenerGuard,
    SyncError, SyncEvent,
};

struct ActiveThread {
    channel_id: ChannelId,
    parent_id: MessageId,
    _listener: ListenerGuard,
}

enum ThreadState {
    Idle,
    Subscribed(ActiveThread),
}

/// Holds the single live reply subscription for the selected message. Every transition
/// drops the previous listener guard; dropping the manager drops the last one.
pub struct ThreadSubscriptionManager {
    store: Arc<dyn DocumentStore>,
    cache: Arc<MessageCache>,
    events: broadcast::Sender<SyncEvent>,
    state: Mutex<ThreadState>,
    generation: Arc<AtomicU64>,
}

impl ThreadSubscriptionManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Arc<MessageCache>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            store,
            cache,
            events,
            state: Mutex::new(ThreadState::Idle),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribes to the replies of `parent_id`. Returns `false` when that thread is
    /// already the active one.
    pub async fn select_message(
        &self,
        channel_id: &ChannelId,
        parent_id: &MessageId,
    ) -> Result<bool, SyncError> {
        let conversation = Conversation::Channel(channel_id.clone());
        let replies_path = paths::thread_replies(channel_id, parent_id);

        let seed_token = {
            let mut state = self.state.lock().await;
            if let ThreadState::Subscribed(active) = &*state {
                if &active.channel_id == channel_id && &active.parent_id == parent_id {
                    return Ok(false);
                }
            }
            // Release before acquiring: at no point are two reply listeners alive.
            *state = ThreadState::Idle;
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

            let subscription = match self.store.subscribe_collection(&replies_path).await {
                Ok(subscription) => subscription,
                Err(err) => {
                    warn!(path = %replies_path, %err, "thread: failed to subscribe to replies");
                    let _ = self.events.send(SyncEvent::ActiveThreadChanged(None));
                    return Err(SyncError::Store(err));
                }
            };

            let streamed = Arc::new(AtomicBool::new(false));
            let listener = ListenerGuard::spawn(subscription, {
                let cache = Arc::clone(&self.cache);
                let events = self.events.clone();
                let current = Arc::clone(&self.generation);
                let streamed = Arc::clone(&streamed);
                let conversation = conversation.clone();
                let parent_id = parent_id.clone();
                move |documents| {
                    if current.load(Ordering::SeqCst) != generation {
                        return;
                    }
                    streamed.store(true, Ordering::SeqCst);
                    if cache.apply_thread_snapshot(&conversation, &parent_id, raw_from_collection(documents)) {
                        let _ = events.send(SyncEvent::ActiveThreadChanged(Some(
                            cache.thread(&conversation, &parent_id),
                        )));
                    }
                }
            });

            *state = ThreadState::Subscribed(ActiveThread {
                channel_id: channel_id.clone(),
                parent_id: parent_id.clone(),
                _listener: listener,
            });
            info!(channel_id = %channel_id, parent_id = %parent_id, "thread: subscribed");
            let _ = self.events.send(SyncEvent::ActiveThreadChanged(Some(
                self.cache.thread(&conversation, parent_id),
            )));
            (generation, streamed)
        };

        self.seed(&conversation, parent_id, &replies_path, seed_token)
            .await;
        Ok(true)
    }

    /// One-shot read of the current replies so the panel fills before the first streamed
    /// snapshot. Failure is tolerated: the stream is authoritative.
    async fn seed(
        &self,
        conversation: &Conversation,
        parent_id: &MessageId,
        replies_path: &str,
        (generation, streamed): (u64, Arc<AtomicBool>),
    ) {
        let documents = match self.store.get_collection(replies_path).await {
            Ok(documents) => documents,
            Err(err) => {
                warn!(path = %replies_path, %err, "thread: seed fetch failed; waiting for live snapshots");
                return;
            }
        };
        if self.generation.load(Ordering::SeqCst) != generation || streamed.load(Ordering::SeqCst) {
            debug!(path = %replies_path, "thread: seed superseded");
            return;
        }
        if self
            .cache
            .apply_thread_snapshot(conversation, parent_id, raw_from_collection(documents))
        {
            let _ = self.events.send(SyncEvent::ActiveThreadChanged(Some(
                self.cache.thread(conversation, parent_id),
            )));
        }
    }

    /// Subscribed → Idle. Returns whether a thread was active.
    pub async fn deselect(&self) -> bool {
        let mut state = self.state.lock().await;
        self.release(&mut state)
    }

    /// Clears the selection if it belongs to `channel_id`.
    pub async fn deselect_if_in(&self, channel_id: &ChannelId) -> bool {
        let mut state = self.state.lock().await;
        let in_channel = matches!(
            &*state,
            ThreadState::Subscribed(active) if &active.channel_id == channel_id
        );
        in_channel && self.release(&mut state)
    }

    fn release(&self, state: &mut ThreadState) -> bool {
        let previous = std::mem::replace(state, ThreadState::Idle);
        let ThreadState::Subscribed(active) = previous else {
            return false;
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!(channel_id = %active.channel_id, parent_id = %active.parent_id, "thread: released");
        drop(active);
        let _ = self.events.send(SyncEvent::ActiveThreadChanged(None));
        true
    }

    pub async fn active(&self) -> Option<(ChannelId, MessageId)> {
        match &*self.state.lock().await {
            ThreadState::Idle => None,
            ThreadState::Subscribed(active) => {
                Some((active.channel_id.clone(), active.parent_id.clone()))
            }
        }
    }

    pub async fn current_thread(&self) -> Option<Arc<ThreadView>> {
        self.active().await.map(|(channel_id, parent_id)| {
            self.cache
                .thread(&Conversation::Channel(channel_id), &parent_id)
        })
    }
}

#[cfg(test)]
#[path = "tests/thread_tests.rs"]
mod tests;
