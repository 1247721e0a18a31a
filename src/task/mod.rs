//! Task records and the events emitted when they change.
//!
//! The record is the payload carried on the wire: a task is published in full
//! (never as a diff) every time it is created or its status changes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::topology::{
    TASK_CREATED_QUEUE, TASK_CREATED_ROUTING_KEY, TASK_UPDATED_QUEUE, TASK_UPDATED_ROUTING_KEY,
};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    #[default]
    #[serde(rename = "Not Started")]
    NotStarted,
    #[serde(rename = "In Progress")]
    InProgress,
    Completed,
    Blocked,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::NotStarted => "Not Started",
            TaskStatus::InProgress => "In Progress",
            TaskStatus::Completed => "Completed",
            TaskStatus::Blocked => "Blocked",
        };
        f.write_str(label)
    }
}

/// A persisted task as stored by the record store.
///
/// Fields this crate does not know about are kept in `extra` and written back
/// unchanged, so the store schema can grow without touching the event core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    #[serde(alias = "_id")]
    pub id: String,
    pub title: String,
    pub assigned_to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskRecord {
    /// Create a record with the required fields and status `Not Started`.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        assigned_to: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            assigned_to: assigned_to.into(),
            created_by: None,
            status: TaskStatus::NotStarted,
            deadline: None,
            created_at: None,
            updated_at: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = Some(created_by.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Last time this record changed, as far as the record itself can tell.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.updated_at.or(self.created_at)
    }
}

/// Kind of task event. Determines the routing key and therefore the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskCreated,
    TaskUpdated,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::TaskCreated, EventKind::TaskUpdated];

    /// Routing key used on the `task_events` exchange.
    pub fn routing_key(self) -> &'static str {
        match self {
            EventKind::TaskCreated => TASK_CREATED_ROUTING_KEY,
            EventKind::TaskUpdated => TASK_UPDATED_ROUTING_KEY,
        }
    }

    /// Queue the routing key is bound to.
    pub fn queue(self) -> &'static str {
        match self {
            EventKind::TaskCreated => TASK_CREATED_QUEUE,
            EventKind::TaskUpdated => TASK_UPDATED_QUEUE,
        }
    }

    pub fn from_routing_key(routing_key: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.routing_key() == routing_key)
    }

    /// Resolve the kind from a queue name, including its dead-letter queue
    /// and per-service copies.
    pub fn from_queue(queue: &str) -> Option<Self> {
        let base = queue.strip_suffix(".dlq").unwrap_or(queue);
        Self::ALL.into_iter().find(|kind| {
            base == kind.queue()
                || base
                    .strip_prefix(kind.queue())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::TaskCreated => f.write_str("TaskCreated"),
            EventKind::TaskUpdated => f.write_str("TaskUpdated"),
        }
    }
}

/// A task event as seen by a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub kind: EventKind,
    pub payload: TaskRecord,
    /// Broker message id, when the publisher set one.
    pub message_id: Option<String>,
    /// True when the broker has delivered this message before.
    pub redelivered: bool,
}

impl TaskEvent {
    pub fn new(kind: EventKind, payload: TaskRecord) -> Self {
        Self {
            kind,
            payload,
            message_id: None,
            redelivered: false,
        }
    }

    /// Stable key for de-duplicating replays: task id, kind and last-modified time.
    pub fn dedup_key(&self) -> String {
        let stamp = self
            .payload
            .last_modified()
            .map(|t| t.timestamp_millis().to_string())
            .unwrap_or_else(|| "-".to_string());
        format!("{}:{}:{}", self.payload.id, self.kind, stamp)
    }
}
