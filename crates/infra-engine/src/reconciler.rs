//! The reconciliation loop.
//!
//! A single-worker, fixed-rate timer: every five seconds the engine
//! re-registers its destination, pulls the current roles, and applies them.
//! Overlap is impossible by construction (one loop, missed ticks skipped)
//! and each tick runs under a deadline slightly shorter than the period so a
//! hung tick cannot back the loop up. Errors are logged and dropped; the
//! registry holds canonical state, so the next tick repairs anything a
//! failed one left behind.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use infra_common::api::CreateDestinationRequest;

use crate::client::RegistryClient;
use crate::error::Result;
use crate::kubernetes::{update_roles, ClusterInfo};

/// Fixed reconciliation period.
pub const RECONCILE_PERIOD: Duration = Duration::from_secs(5);

/// Safety margin subtracted from the period for the per-tick deadline.
const TICK_DEADLINE_MARGIN: Duration = Duration::from_millis(500);

pub struct Reconciler {
    registry: Arc<RegistryClient>,
    kube: kube::Client,
    info: Arc<dyn ClusterInfo>,
    /// Destination name; falls back to the cluster namespace when unset.
    name_override: Option<String>,
    /// API endpoint reported to the registry; introspected when unset.
    endpoint_override: Option<String>,
    /// Update-index cursor from the last applied pull.
    cursor: i64,
}

impl Reconciler {
    pub fn new(
        registry: Arc<RegistryClient>,
        kube: kube::Client,
        info: Arc<dyn ClusterInfo>,
        name_override: Option<String>,
        endpoint_override: Option<String>,
    ) -> Self {
        Reconciler {
            registry,
            kube,
            info,
            name_override,
            endpoint_override,
            cursor: 0,
        }
    }

    /// Run forever. Never returns under normal operation.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(RECONCILE_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let deadline = RECONCILE_PERIOD - TICK_DEADLINE_MARGIN;

        loop {
            ticker.tick().await;
            match tokio::time::timeout(deadline, self.tick()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "reconciliation tick failed"),
                Err(_) => warn!("reconciliation tick exceeded its deadline"),
            }
        }
    }

    /// One reconciliation pass.
    async fn tick(&mut self) -> Result<()> {
        let registration = gather_registration(
            self.info.as_ref(),
            self.name_override.as_deref(),
            self.endpoint_override.as_deref(),
        )
        .await?;
        let destination_id = self.registry.register_destination(&registration).await?;

        let response = self.registry.list_roles(destination_id, self.cursor).await?;
        if response.max_update_index <= self.cursor {
            debug!(cursor = self.cursor, "grants unchanged");
            return Ok(());
        }

        info!(
            roles = response.roles.len(),
            cursor = response.max_update_index,
            "applying updated roles"
        );
        update_roles(&self.kube, &response.roles).await?;
        // Only advance after a successful apply so a failed tick replays.
        self.cursor = response.max_update_index;
        Ok(())
    }
}

/// Assemble the heartbeat registration from cluster introspection, with the
/// operator's overrides applied.
async fn gather_registration(
    info: &dyn ClusterInfo,
    name_override: Option<&str>,
    endpoint_override: Option<&str>,
) -> Result<CreateDestinationRequest> {
    let ca = info.ca().await?;
    let namespace = info.namespace().await?;
    let sa_token = info.sa_token().await?;
    let endpoint = match endpoint_override {
        Some(endpoint) => endpoint.to_string(),
        None => info.endpoint().await?,
    };
    let name = name_override
        .map(str::to_string)
        .unwrap_or_else(|| namespace.clone());
    Ok(CreateDestinationRequest {
        name,
        ca,
        endpoint,
        namespace,
        sa_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::MockClusterInfo;

    fn mock_info() -> MockClusterInfo {
        let mut info = MockClusterInfo::new();
        info.expect_ca().returning(|| Ok("PEM".to_string()));
        info.expect_namespace().returning(|| Ok("infra".to_string()));
        info.expect_sa_token().returning(|| Ok("sa-token".to_string()));
        info.expect_endpoint()
            .returning(|| Ok("10.96.0.1:443".to_string()));
        info
    }

    #[tokio::test]
    async fn registration_defaults_come_from_the_cluster() {
        let info = mock_info();
        let registration = gather_registration(&info, None, None).await.unwrap();
        assert_eq!(registration.name, "infra");
        assert_eq!(registration.endpoint, "10.96.0.1:443");
        assert_eq!(registration.ca, "PEM");
        assert_eq!(registration.sa_token, "sa-token");
    }

    #[tokio::test]
    async fn overrides_replace_introspected_values() {
        let info = mock_info();
        let registration =
            gather_registration(&info, Some("prod-east"), Some("k8s.example.com:6443"))
                .await
                .unwrap();
        assert_eq!(registration.name, "prod-east");
        assert_eq!(registration.endpoint, "k8s.example.com:6443");
        // Namespace still reflects where the engine actually runs.
        assert_eq!(registration.namespace, "infra");
    }
}
