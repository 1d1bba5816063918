use async_trait::async_trait;

use crate::types::Map;

/// Write-path notification for live query updates.
///
/// Implementations observe every successful save and delete and notify
/// active subscriptions. Objects are passed in REST JSON form.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    /// Called after a create (`original` is `None`) or an update.
    async fn after_save(
        &self,
        class_name: &str,
        current: &Map,
        original: Option<&Map>,
    ) -> anyhow::Result<()>;

    /// Called after a delete with the last stored version of the object.
    async fn after_delete(&self, class_name: &str, object: &Map) -> anyhow::Result<()>;
}
