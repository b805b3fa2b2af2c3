use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use stepwise_core::error::Result;
use stepwise_core::traits::ThreadStore;
use stepwise_core::types::{ThreadId, ThreadSnapshot};

/// Process-local thread store. Threads are lost when the process exits.
#[derive(Default)]
pub struct InMemoryThreadStore {
    threads: Mutex<HashMap<ThreadId, ThreadSnapshot>>,
}

impl InMemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ThreadStore for InMemoryThreadStore {
    fn load(&self, id: &ThreadId) -> BoxFuture<'_, Result<Option<ThreadSnapshot>>> {
        let snapshot = self
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned();
        Box::pin(async move { Ok(snapshot) })
    }

    fn save(&self, snapshot: &ThreadSnapshot) -> BoxFuture<'_, Result<()>> {
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(snapshot.thread_id.clone(), snapshot.clone());
        Box::pin(async { Ok(()) })
    }

    fn delete(&self, id: &ThreadId) -> BoxFuture<'_, Result<()>> {
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        Box::pin(async { Ok(()) })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<ThreadId>>> {
        let mut ids: Vec<ThreadId> = self
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Box::pin(async move { Ok(ids) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot(id: &str, step: &str) -> ThreadSnapshot {
        ThreadSnapshot {
            thread_id: ThreadId::from_str(id),
            step: step.into(),
            facts: Default::default(),
            history: vec![],
            outcome: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_load_replace_delete() {
        let store = InMemoryThreadStore::new();
        let id = ThreadId::from_str("t-1");
        assert!(store.load(&id).await.unwrap().is_none());

        store.save(&snapshot("t-1", "warranty_collector")).await.unwrap();
        store.save(&snapshot("t-1", "issue_classifier")).await.unwrap();
        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.step, "issue_classifier");

        store.delete(&id).await.unwrap();
        assert!(store.load(&id).await.unwrap().is_none());
        store.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn list_is_sorted() {
        let store = InMemoryThreadStore::new();
        store.save(&snapshot("b", "s")).await.unwrap();
        store.save(&snapshot("a", "s")).await.unwrap();
        let ids = store.list().await.unwrap();
        assert_eq!(ids, vec![ThreadId::from_str("a"), ThreadId::from_str("b")]);
    }
}
