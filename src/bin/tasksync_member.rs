//! tasksync-member: task status service
//!
//! Updates the status of tasks assigned to a member and publishes
//! `task.updated` events. Consumes both task queues for its projection.
//!
//! ## Configuration
//! - TASKSYNC_CONFIG: Path to a YAML config file (or `--config <path>`)
//! - TASKSYNC__BROKER__URL / RABBITMQ_URL: AMQP broker URL
//! - TASKSYNC__MEMBER__PORT / PORT_MEMBER: HTTP port (default: 5001)
//! - TASKSYNC_LOG: Log filter (default: info)

use tasksync::service::{self, Role};
use tasksync::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    service::run(Role::Member).await?;
    Ok(())
}
