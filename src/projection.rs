//! Local read model of tasks, fed by task events.
//!
//! Each service reads its own copy of the task queues, so its projection
//! sees every event, shortly after it was published.
//!
//! Delivery is at-least-once and the two queues are consumed independently,
//! so the projection must tolerate replays and cross-queue reordering:
//! an event identical to the current record is a duplicate, and an event
//! older than the current record is stale. Neither changes the view.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::bus::{Disposition, EventHandler, HandlerError};
use crate::store::{save_if_newer, TaskStore};
use crate::task::{TaskEvent, TaskRecord};

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Duplicate,
    Stale,
}

#[derive(Default)]
pub struct TaskProjection {
    tasks: RwLock<HashMap<String, TaskRecord>>,
}

impl TaskProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply(&self, event: &TaskEvent) -> ApplyOutcome {
        let incoming = &event.payload;
        let mut tasks = self.tasks.write().await;

        if let Some(current) = tasks.get(&incoming.id) {
            if current == incoming {
                return ApplyOutcome::Duplicate;
            }
            if let (Some(seen), Some(new)) = (current.last_modified(), incoming.last_modified()) {
                if new < seen {
                    return ApplyOutcome::Stale;
                }
            }
        }

        tasks.insert(incoming.id.clone(), incoming.clone());
        ApplyOutcome::Applied
    }

    pub async fn get(&self, id: &str) -> Option<TaskRecord> {
        self.tasks.read().await.get(id).cloned()
    }

    /// Snapshot of every task, sorted by id.
    pub async fn snapshot(&self) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

/// Logs every event from the shared task queues.
///
/// Services compete for messages on the shared queues, so each service logs
/// only the share it received.
pub struct EventLogHandler {
    service: String,
}

impl EventLogHandler {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl EventHandler for EventLogHandler {
    fn handle(
        &self,
        event: Arc<TaskEvent>,
    ) -> BoxFuture<'static, Result<Disposition, HandlerError>> {
        let service = self.service.clone();
        Box::pin(async move {
            info!(
                service = %service,
                kind = %event.kind,
                task_id = %event.payload.id,
                title = %event.payload.title,
                status = %event.payload.status,
                assigned_to = %event.payload.assigned_to,
                redelivered = event.redelivered,
                "Received task event"
            );
            Ok(Disposition::Ack)
        })
    }
}

/// Feeds a service's own queue copies into its [`TaskProjection`] and,
/// when set, mirrors the records into its task store.
pub struct ProjectionHandler {
    projection: Arc<TaskProjection>,
    store: Option<Arc<dyn TaskStore>>,
}

impl ProjectionHandler {
    pub fn new(projection: Arc<TaskProjection>) -> Self {
        Self {
            projection,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }
}

impl EventHandler for ProjectionHandler {
    fn handle(
        &self,
        event: Arc<TaskEvent>,
    ) -> BoxFuture<'static, Result<Disposition, HandlerError>> {
        let projection = Arc::clone(&self.projection);
        let store = self.store.clone();
        Box::pin(async move {
            let outcome = projection.apply(&event).await;
            debug!(key = %event.dedup_key(), ?outcome, "Projection updated");

            if let Some(store) = store {
                let saved = save_if_newer(store.as_ref(), &event.payload)
                    .await
                    .map_err(|e| HandlerError::new(format!("mirroring task to store: {}", e)))?;
                if saved {
                    debug!(task_id = %event.payload.id, "Task mirrored into store");
                }
            }
            Ok(Disposition::Ack)
        })
    }
}
