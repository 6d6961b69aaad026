use storage::{ListenerHandle, Subscription};
use tokio::task::JoinHandle;

/// Owns a live store subscription and the task draining it. Dropping the guard
/// unregisters the listener from the store and stops the task.
pub struct ListenerGuard {
    handle: Option<ListenerHandle>,
    task: JoinHandle<()>,
}

impl ListenerGuard {
    pub fn spawn<T, F>(subscription: Subscription<T>, mut on_snapshot: F) -> Self
    where
        T: Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let (mut receiver, handle) = subscription.into_parts();
        let task = tokio::spawn(async move {
            while let Some(snapshot) = receiver.recv().await {
                on_snapshot(snapshot);
            }
        });
        Self {
            handle: Some(handle),
            task,
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
        self.task.abort();
    }
}
