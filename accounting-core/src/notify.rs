//! Provider notifications
//!
//! After a synchronization cycle has flushed new deposits, every provider
//! serving a category that received funds is told once to pull its pending
//! deposit notifications.

use crate::error::Result;
use async_trait::async_trait;
use tracing::info;

/// Dispatcher for "new deposits available" signals
#[async_trait]
pub trait ProviderNotifier: Send + Sync {
    /// Ask `provider` to pull its deposit notifications
    async fn notify_deposits(&self, provider: &str) -> Result<()>;
}

/// Notifier that only logs, for deployments without provider integration
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl ProviderNotifier for LogNotifier {
    async fn notify_deposits(&self, provider: &str) -> Result<()> {
        info!(provider, "deposit notifications pending");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        LogNotifier.notify_deposits("hpc").await.unwrap();
    }
}
