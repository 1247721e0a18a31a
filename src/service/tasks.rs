//! Task operations: write to the store, then publish the event.
//!
//! There is no transaction spanning the two steps. A publish that fails after
//! the write committed is reported as [`TaskError::Publish`] carrying the
//! committed record, so the caller can retry or reconcile.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use crate::bus::{BusError, EventPublisher};
use crate::store::{StoreError, TaskStore};
use crate::task::{TaskRecord, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Task '{title}' not found or not assigned to {assignee}")]
    NotAssigned { title: String, assignee: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Task saved but event not published: {source}")]
    Publish {
        task: Box<TaskRecord>,
        #[source]
        source: BusError,
    },
}

/// Body of a create request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub title: String,
    pub assigned_to: String,
    /// Leader creating the task.
    #[serde(alias = "username")]
    pub created_by: String,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

/// Body of a status update request. Tasks are addressed by title within the
/// member's own assignments.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusUpdate {
    pub title: String,
    pub status: TaskStatus,
    pub username: String,
}

pub struct TaskService {
    store: Arc<dyn TaskStore>,
    publisher: Arc<EventPublisher>,
}

impl TaskService {
    pub fn new(store: Arc<dyn TaskStore>, publisher: Arc<EventPublisher>) -> Self {
        Self { store, publisher }
    }

    pub async fn create_task(&self, request: NewTask) -> Result<TaskRecord, TaskError> {
        require("title", &request.title)?;
        require("assignedTo", &request.assigned_to)?;
        require("createdBy", &request.created_by)?;

        let mut record = TaskRecord::new(
            uuid::Uuid::new_v4().to_string(),
            request.title,
            request.assigned_to,
        )
        .with_created_by(request.created_by);
        record.deadline = request.deadline;
        record.created_at = Some(Utc::now());

        self.store.save(record.clone()).await?;
        info!(task_id = %record.id, assigned_to = %record.assigned_to, "Task created");

        self.publish(record, true).await
    }

    pub async fn update_status(&self, request: StatusUpdate) -> Result<TaskRecord, TaskError> {
        require("title", &request.title)?;
        require("username", &request.username)?;

        let mut record = self
            .store
            .find_assigned(&request.title, &request.username)
            .await?
            .ok_or_else(|| TaskError::NotAssigned {
                title: request.title.clone(),
                assignee: request.username.clone(),
            })?;

        record.status = request.status;
        record.updated_at = Some(Utc::now());

        self.store.save(record.clone()).await?;
        info!(task_id = %record.id, status = %record.status, "Task status updated");

        self.publish(record, false).await
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskRecord>, TaskError> {
        Ok(self.store.list().await?)
    }

    async fn publish(&self, record: TaskRecord, created: bool) -> Result<TaskRecord, TaskError> {
        let published = if created {
            self.publisher.publish_created(&record).await
        } else {
            self.publisher.publish_updated(&record).await
        };

        match published {
            Ok(()) => Ok(record),
            Err(source) => {
                warn!(task_id = %record.id, error = %source, "Task saved but event not published");
                Err(TaskError::Publish {
                    task: Box::new(record),
                    source,
                })
            }
        }
    }
}

fn require(field: &str, value: &str) -> Result<(), TaskError> {
    if value.trim().is_empty() {
        Err(TaskError::Invalid(format!("{} is required", field)))
    } else {
        Ok(())
    }
}
