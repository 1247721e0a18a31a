//! tasksync - task lifecycle events between leader and member services
//!
//! A leader service creates tasks and a member service updates their status.
//! Each change is written to the task store and then published as a durable
//! event over RabbitMQ, so every service can keep a local view of all tasks.

pub mod bus;
pub mod config;
pub mod dlq;
pub mod projection;
pub mod service;
pub mod store;
pub mod task;
pub mod utils;
