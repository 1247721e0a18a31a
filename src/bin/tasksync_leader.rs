//! tasksync-leader: task creation service
//!
//! Creates tasks, stores them and publishes `task.created` events. Consumes
//! both task queues to keep a local projection of every task.
//!
//! ## Architecture
//! ```text
//! POST /api/tasks --> [tasksync-leader] --(task.created)--> [task_events]
//!                            ^                                    |
//!                            +------ task_created / task_updated --+
//! ```
//!
//! ## Configuration
//! - TASKSYNC_CONFIG: Path to a YAML config file (or `--config <path>`)
//! - TASKSYNC__BROKER__URL / RABBITMQ_URL: AMQP broker URL
//! - TASKSYNC__LEADER__PORT / PORT_LEADER: HTTP port (default: 5000)
//! - TASKSYNC_LOG: Log filter (default: info)

use tasksync::service::{self, Role};
use tasksync::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    service::run(Role::Leader).await?;
    Ok(())
}
