//! Conflict condition writes shared by the hub controllers

use tokio_util::sync::CancellationToken;
use tracing::debug;

use fleet_net_common::condition::{equal_condition, find_condition, set_status_condition};
use fleet_net_common::crd::{Condition, InternalServiceExport, SERVICE_EXPORT_CONFLICT};
use fleet_net_common::retry::{retry_on_transient, RetryConfig};
use fleet_net_common::store::{ObjectKey, ObjectStore};
use fleet_net_common::Result;

/// Write the `Conflict` condition on a claim unless an equal one is present
///
/// Returns false when the claim no longer exists.
pub(crate) async fn mark_claim(
    claims: &dyn ObjectStore<InternalServiceExport>,
    retry: &RetryConfig,
    token: &CancellationToken,
    claim: &InternalServiceExport,
    desired: Condition,
) -> Result<bool> {
    let conditions = claim
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    if equal_condition(find_condition(conditions, SERVICE_EXPORT_CONFLICT), Some(&desired)) {
        return Ok(true);
    }

    debug!(
        claim = %ObjectKey::of(claim),
        status = %desired.status,
        reason = %desired.reason,
        "Marking claim"
    );
    let mut updated = claim.clone();
    set_status_condition(
        &mut updated.status.get_or_insert_with(Default::default).conditions,
        desired,
    );
    match retry_on_transient(retry, token, "update InternalServiceExport status", || {
        claims.update_status(&updated)
    })
    .await
    {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => {
            debug!(claim = %ObjectKey::of(claim), "Claim is gone, skipping");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
