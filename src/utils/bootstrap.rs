//! Bootstrap utilities for tasksync binaries.
//!
//! Shared initialization code for the leader and member services.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with TASKSYNC_LOG environment variable.
///
/// Defaults to "info" level if TASKSYNC_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Config file path from `--config <path>` or `--config=<path>`.
pub fn config_path_from_args<I>(args: I) -> Option<String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_config_path_from_args() {
        assert_eq!(
            config_path_from_args(args(&["bin", "--config", "leader.yaml"])),
            Some("leader.yaml".to_string())
        );
        assert_eq!(
            config_path_from_args(args(&["bin", "--config=member.yaml"])),
            Some("member.yaml".to_string())
        );
        assert_eq!(config_path_from_args(args(&["bin"])), None);
        assert_eq!(config_path_from_args(args(&["bin", "--config"])), None);
    }
}
