use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::models::DocumentStatus;

/// Per-document status channels for callers waiting on a transition.
///
/// Channels exist only while someone subscribed; publishing to a document
/// nobody watches is a no-op. A terminal status closes the channel.
#[derive(Clone, Default)]
pub struct StatusNotifier {
    channels: Arc<RwLock<HashMap<Uuid, watch::Sender<DocumentStatus>>>>,
}

impl StatusNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `document_id`, seeding a new channel with `current`.
    pub async fn subscribe(
        &self,
        document_id: Uuid,
        current: DocumentStatus,
    ) -> watch::Receiver<DocumentStatus> {
        let mut guard = self.channels.write().await;
        guard
            .entry(document_id)
            .or_insert_with(|| watch::channel(current).0)
            .subscribe()
    }

    pub async fn publish(&self, document_id: Uuid, status: DocumentStatus) {
        let mut guard = self.channels.write().await;
        if let Some(sender) = guard.get(&document_id) {
            sender.send_replace(status);
        }
        if status.is_terminal() {
            guard.remove(&document_id);
        }
    }

    pub async fn unregister(&self, document_id: Uuid) {
        self.channels.write().await.remove(&document_id);
    }

    pub async fn watched(&self) -> usize {
        self.channels.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let notifier = StatusNotifier::new();
        let id = Uuid::new_v4();

        let mut rx = notifier.subscribe(id, DocumentStatus::Pending).await;
        notifier.publish(id, DocumentStatus::Processing).await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), DocumentStatus::Processing);

        notifier.publish(id, DocumentStatus::Completed).await;
        assert_eq!(*rx.borrow_and_update(), DocumentStatus::Completed);
        assert_eq!(notifier.watched().await, 0);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let notifier = StatusNotifier::new();
        notifier.publish(Uuid::new_v4(), DocumentStatus::Processing).await;
        assert_eq!(notifier.watched().await, 0);
    }
}
