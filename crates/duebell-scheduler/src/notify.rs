use async_trait::async_trait;

use duebell_core::Task;

use crate::error::DeliveryError;

/// Outbound delivery channel for due notifications (push, email, webhook).
///
/// The engine treats every call as fire-and-forget: it runs on a spawned
/// task, errors are logged, and a failed delivery is never re-armed.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Stable lowercase identifier used in log fields (e.g. `"webhook"`).
    fn name(&self) -> &str;

    /// Send the due notification for `tasks` to their owners and assignees.
    ///
    /// The engine always passes a single occurrence snapshot.
    async fn send_due(&self, tasks: &[Task]) -> Result<(), DeliveryError>;
}
