use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tracing::debug;

use crate::instance::ExtensionInstance;

/// Asks every lookup-capable extension about `address` concurrently and
/// keeps the values they returned, in instance order. Failures and empty
/// (`undefined`/`null`) results are dropped.
pub async fn collect_additional_data(
    instances: &[Arc<ExtensionInstance>],
    address: &str,
    caller: Option<&str>,
) -> Vec<Value> {
    let lookups = instances
        .iter()
        .filter(|instance| instance.has_lookup())
        .map(|instance| async move {
            match instance.lookup(address, caller).await {
                Ok(Some(Value::Null)) | Ok(None) => None,
                Ok(Some(value)) => Some(value),
                Err(error) => {
                    debug!(
                        extension = %instance.name(),
                        address,
                        error = %error,
                        "dropping failed extension lookup"
                    );
                    None
                }
            }
        });
    join_all(lookups).await.into_iter().flatten().collect()
}
