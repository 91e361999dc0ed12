//! In-memory store, used by tests and ephemeral (non-durable) runs.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::RecognitionError;
use crate::model::{
    EngineKind, QueueItem, QueueStatus, RecognitionConfig, RecognitionResult, ResultStatus,
};

use super::{claim_item, ConfigStore, QueueStore, ResultStore};

#[derive(Default)]
struct Inner {
    results: HashMap<(String, EngineKind), RecognitionResult>,
    queue: HashMap<Uuid, QueueItem>,
    configs: HashMap<String, RecognitionConfig>,
}

/// All three stores behind one mutex. The single lock doubles as the
/// per-document write serialization the result upserts require.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, RecognitionError> {
        self.inner
            .lock()
            .map_err(|_| RecognitionError::Storage("memory store lock poisoned".to_string()))
    }
}

impl ResultStore for MemoryStore {
    fn upsert(&self, result: &RecognitionResult) -> Result<(), RecognitionError> {
        let mut inner = self.lock()?;
        let key = (result.document_id.clone(), result.engine);
        let mut stored = result.clone();
        stored.updated_at = Utc::now();
        if let Some(existing) = inner.results.get(&key) {
            stored.created_at = existing.created_at;
        }
        inner.results.insert(key, stored);
        Ok(())
    }

    fn get(
        &self,
        document_id: &str,
        engine: EngineKind,
    ) -> Result<Option<RecognitionResult>, RecognitionError> {
        let inner = self.lock()?;
        Ok(inner
            .results
            .get(&(document_id.to_string(), engine))
            .cloned())
    }

    fn for_document(&self, document_id: &str) -> Result<Vec<RecognitionResult>, RecognitionError> {
        let inner = self.lock()?;
        let mut results: Vec<RecognitionResult> = inner
            .results
            .values()
            .filter(|r| r.document_id == document_id)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.engine.as_str());
        Ok(results)
    }

    fn sweep_failed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RecognitionError> {
        let mut inner = self.lock()?;
        let before = inner.results.len();
        inner
            .results
            .retain(|_, r| !(r.status == ResultStatus::Failed && r.updated_at < cutoff));
        Ok(before - inner.results.len())
    }
}

impl QueueStore for MemoryStore {
    fn insert(&self, item: &QueueItem) -> Result<(), RecognitionError> {
        let mut inner = self.lock()?;
        inner.queue.insert(item.id, item.clone());
        Ok(())
    }

    fn update(&self, item: &QueueItem) -> Result<(), RecognitionError> {
        let mut inner = self.lock()?;
        match inner.queue.get(&item.id) {
            Some(existing) if existing.status.is_terminal() && existing.status != item.status => {
                // Terminal statuses never transition again.
                Ok(())
            }
            Some(_) => {
                inner.queue.insert(item.id, item.clone());
                Ok(())
            }
            None => Err(RecognitionError::NotFound(format!(
                "queue item {}",
                item.id
            ))),
        }
    }

    fn get(&self, id: Uuid) -> Result<Option<QueueItem>, RecognitionError> {
        let inner = self.lock()?;
        Ok(inner.queue.get(&id).cloned())
    }

    fn for_document(&self, document_id: &str) -> Result<Vec<QueueItem>, RecognitionError> {
        let inner = self.lock()?;
        let mut items: Vec<QueueItem> = inner
            .queue
            .values()
            .filter(|i| i.document_id == document_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.created_at);
        Ok(items)
    }

    fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, RecognitionError> {
        let mut inner = self.lock()?;
        let mut due: Vec<Uuid> = inner
            .queue
            .values()
            .filter(|i| i.status == QueueStatus::Queued && i.scheduled_for <= now)
            .map(|i| i.id)
            .collect();
        due.sort_by_key(|id| {
            let item = &inner.queue[id];
            (Reverse(item.priority), item.created_at)
        });
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(item) = inner.queue.get_mut(&id) {
                claim_item(item, now);
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    fn claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<QueueItem>, RecognitionError> {
        let mut inner = self.lock()?;
        match inner.queue.get_mut(&id) {
            Some(item) if item.status == QueueStatus::Queued => {
                claim_item(item, now);
                Ok(Some(item.clone()))
            }
            _ => Ok(None),
        }
    }

    fn sweep_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RecognitionError> {
        let mut inner = self.lock()?;
        let before = inner.queue.len();
        inner.queue.retain(|_, i| {
            !(i.status.is_terminal() && i.completed_at.map(|t| t < cutoff).unwrap_or(false))
        });
        Ok(before - inner.queue.len())
    }
}

impl ConfigStore for MemoryStore {
    fn insert(&self, config: &RecognitionConfig) -> Result<(), RecognitionError> {
        let mut inner = self.lock()?;
        if config.active {
            for other in inner.configs.values_mut() {
                other.active = false;
            }
        }
        inner.configs.insert(config.id.clone(), config.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<RecognitionConfig>, RecognitionError> {
        let inner = self.lock()?;
        let mut configs: Vec<RecognitionConfig> = inner.configs.values().cloned().collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(configs)
    }

    fn get(&self, id: &str) -> Result<Option<RecognitionConfig>, RecognitionError> {
        let inner = self.lock()?;
        Ok(inner.configs.get(id).cloned())
    }

    fn active(&self) -> Result<Option<RecognitionConfig>, RecognitionError> {
        let inner = self.lock()?;
        Ok(inner.configs.values().find(|c| c.active).cloned())
    }

    fn activate(&self, id: &str) -> Result<RecognitionConfig, RecognitionError> {
        let mut inner = self.lock()?;
        if !inner.configs.contains_key(id) {
            return Err(RecognitionError::NotFound(format!("configuration {}", id)));
        }
        for config in inner.configs.values_mut() {
            config.active = config.id == id;
            if config.active {
                config.updated_at = Utc::now();
            }
        }
        Ok(inner.configs[id].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobPriority;

    #[test]
    fn upsert_keeps_one_row_per_engine() {
        let store = MemoryStore::new();
        let mut result = RecognitionResult::pending("doc-1", EngineKind::Fast, "cfg");
        result.text = "first run".to_string();
        ResultStore::upsert(&store, &result).unwrap();

        result.text = "second run".to_string();
        result.status = ResultStatus::Completed;
        ResultStore::upsert(&store, &result).unwrap();

        let all = ResultStore::for_document(&store, "doc-1").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].text, "second run");
    }

    #[test]
    fn claim_batch_orders_by_priority_then_age() {
        let store = MemoryStore::new();
        let priorities = [
            JobPriority::Normal,
            JobPriority::Urgent,
            JobPriority::Low,
            JobPriority::Urgent,
        ];
        let mut ids = Vec::new();
        for (i, priority) in priorities.iter().enumerate() {
            let mut item =
                QueueItem::new(&format!("doc-{}", i), vec![EngineKind::Fast], *priority, None, false);
            // Force strictly increasing creation times
            item.created_at = Utc::now() + chrono::Duration::milliseconds(i as i64);
            item.scheduled_for = item.created_at;
            ids.push(item.id);
            QueueStore::insert(&store, &item).unwrap();
        }

        let claimed = store
            .claim_batch(10, Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        let claimed_ids: Vec<Uuid> = claimed.iter().map(|i| i.id).collect();
        assert_eq!(claimed_ids, vec![ids[1], ids[3], ids[0], ids[2]]);
        assert!(claimed.iter().all(|i| i.status == QueueStatus::Processing));
    }

    #[test]
    fn terminal_items_do_not_transition() {
        let store = MemoryStore::new();
        let mut item = QueueItem::new("doc-1", vec![EngineKind::Fast], JobPriority::Normal, None, false);
        QueueStore::insert(&store, &item).unwrap();

        item.status = QueueStatus::Cancelled;
        store.update(&item).unwrap();

        item.status = QueueStatus::Completed;
        store.update(&item).unwrap();

        let stored = QueueStore::get(&store, item.id).unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Cancelled);
    }

    #[test]
    fn activate_is_singleton() {
        let store = MemoryStore::new();
        let mut a = RecognitionConfig::baseline();
        a.id = "a".to_string();
        a.active = true;
        let mut b = RecognitionConfig::baseline();
        b.id = "b".to_string();
        b.active = false;
        ConfigStore::insert(&store, &a).unwrap();
        ConfigStore::insert(&store, &b).unwrap();

        store.activate("b").unwrap();

        let active: Vec<String> = store
            .list()
            .unwrap()
            .into_iter()
            .filter(|c| c.active)
            .map(|c| c.id)
            .collect();
        assert_eq!(active, vec!["b".to_string()]);
    }

    #[test]
    fn sweep_removes_old_terminal_items() {
        let store = MemoryStore::new();
        let mut old = QueueItem::new("doc-1", vec![EngineKind::Fast], JobPriority::Normal, None, false);
        old.status = QueueStatus::Completed;
        old.completed_at = Some(Utc::now() - chrono::Duration::days(100));
        QueueStore::insert(&store, &old).unwrap();

        let mut active = QueueItem::new("doc-2", vec![EngineKind::Fast], JobPriority::Normal, None, false);
        active.status = QueueStatus::Processing;
        QueueStore::insert(&store, &active).unwrap();

        let removed = store
            .sweep_terminal_before(Utc::now() - chrono::Duration::days(90))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(QueueStore::get(&store, old.id).unwrap().is_none());
        assert!(QueueStore::get(&store, active.id).unwrap().is_some());
    }
}
