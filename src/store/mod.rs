//! Task record store.
//!
//! The store is the source of truth for tasks; events are published only after
//! a write here has committed. Production deployments plug their own database
//! in behind [`TaskStore`]; [`InMemoryTaskStore`] backs tests and local runs.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::task::TaskRecord;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Persistent storage for task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn record_exists(&self, id: &str) -> Result<bool>;

    async fn load(&self, id: &str) -> Result<TaskRecord>;

    /// Insert or replace the record with the same id.
    async fn save(&self, record: TaskRecord) -> Result<()>;

    /// Find a task by title among those assigned to `assignee`.
    async fn find_assigned(&self, title: &str, assignee: &str) -> Result<Option<TaskRecord>>;

    /// All tasks in insertion order.
    async fn list(&self) -> Result<Vec<TaskRecord>>;
}

/// Store keeping records in memory.
#[derive(Default)]
pub struct InMemoryTaskStore {
    records: RwLock<Vec<TaskRecord>>,
    fail_on_save: RwLock<bool>,
    unavailable: RwLock<bool>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_save(&self, fail: bool) {
        *self.fail_on_save.write().await = fail;
    }

    /// Fail every operation, as an unreachable database would.
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }

    async fn check_available(&self) -> Result<()> {
        if *self.unavailable.read().await {
            Err(StoreError::Unavailable("store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Save `record` unless the store already holds the same or a newer version.
///
/// Returns whether the record was written. Used to mirror records received
/// as events into a service's own store.
pub async fn save_if_newer(store: &dyn TaskStore, record: &TaskRecord) -> Result<bool> {
    match store.load(&record.id).await {
        Ok(existing) if existing == *record => return Ok(false),
        Ok(existing) if existing.last_modified() > record.last_modified() => return Ok(false),
        Ok(_) | Err(StoreError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    store.save(record.clone()).await?;
    Ok(true)
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn record_exists(&self, id: &str) -> Result<bool> {
        self.check_available().await?;
        Ok(self.records.read().await.iter().any(|r| r.id == id))
    }

    async fn load(&self, id: &str) -> Result<TaskRecord> {
        self.check_available().await?;
        self.records
            .read()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn save(&self, record: TaskRecord) -> Result<()> {
        self.check_available().await?;
        if *self.fail_on_save.read().await {
            return Err(StoreError::Unavailable("save rejected".to_string()));
        }
        let mut records = self.records.write().await;
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        Ok(())
    }

    async fn find_assigned(&self, title: &str, assignee: &str) -> Result<Option<TaskRecord>> {
        self.check_available().await?;
        Ok(self
            .records
            .read()
            .await
            .iter()
            .find(|r| r.title == title && r.assigned_to == assignee)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<TaskRecord>> {
        self.check_available().await?;
        Ok(self.records.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;

    #[tokio::test]
    async fn test_save_and_load() {
        let store = InMemoryTaskStore::new();
        store
            .save(TaskRecord::new("t1", "Draft spec", "alice"))
            .await
            .unwrap();

        assert!(store.record_exists("t1").await.unwrap());
        assert!(!store.record_exists("t2").await.unwrap());
        assert_eq!(store.load("t1").await.unwrap().title, "Draft spec");
        assert!(matches!(
            store.load("t2").await,
            Err(StoreError::NotFound(ref id)) if id == "t2"
        ));
    }

    #[tokio::test]
    async fn test_save_replaces_by_id_and_keeps_order() {
        let store = InMemoryTaskStore::new();
        store.save(TaskRecord::new("t1", "A", "alice")).await.unwrap();
        store.save(TaskRecord::new("t2", "B", "bob")).await.unwrap();
        store
            .save(TaskRecord::new("t1", "A", "alice").with_status(TaskStatus::Completed))
            .await
            .unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "t1");
        assert_eq!(all[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_find_assigned_matches_title_and_assignee() {
        let store = InMemoryTaskStore::new();
        store.save(TaskRecord::new("t1", "Review", "alice")).await.unwrap();
        store.save(TaskRecord::new("t2", "Review", "bob")).await.unwrap();

        let found = store.find_assigned("Review", "bob").await.unwrap().unwrap();
        assert_eq!(found.id, "t2");
        assert!(store.find_assigned("Review", "carol").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_on_save() {
        let store = InMemoryTaskStore::new();
        store.set_fail_on_save(true).await;

        assert!(matches!(
            store.save(TaskRecord::new("t1", "A", "alice")).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(!store.record_exists("t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_reads() {
        let store = InMemoryTaskStore::new();
        store.set_unavailable(true).await;

        assert!(matches!(
            store.record_exists("t1").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false).await;
        assert!(!store.record_exists("t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_save_if_newer_keeps_latest_version() {
        let store = InMemoryTaskStore::new();
        let created = TaskRecord::new("t1", "Draft spec", "alice");
        let mut updated = created.clone().with_status(TaskStatus::Completed);
        updated.updated_at = Some(chrono::Utc::now());

        assert!(save_if_newer(&store, &created).await.unwrap());
        assert!(!save_if_newer(&store, &created).await.unwrap());
        assert!(save_if_newer(&store, &updated).await.unwrap());

        // A late creation event must not roll the status back.
        assert!(!save_if_newer(&store, &created).await.unwrap());
        assert_eq!(store.load("t1").await.unwrap().status, TaskStatus::Completed);
    }
}
