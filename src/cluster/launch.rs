//! Master and worker launch requests

use serde::Serialize;
use tracing::info;

use crate::catalog::MASTER_GROUP;
use crate::config::{ClusterConfig, Setting};
use crate::provider::{LaunchRequest, ProviderGateway, ReservationHandle};
use crate::validate::ValidationFailure;
use crate::{Error, Result};

/// Bounds of the worker launch request
///
/// The provider may start fewer workers than asked for; anything down to
/// half the workers is accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerCounts {
    /// Fewest workers the provider may start
    pub min: u32,
    /// Workers requested
    pub max: u32,
}

/// Worker counts for a cluster of `cluster_size` nodes, `None` when the master is alone
pub fn worker_counts(cluster_size: u32) -> Option<WorkerCounts> {
    if cluster_size <= 1 {
        return None;
    }
    let workers = cluster_size - 1;
    Some(WorkerCounts {
        min: (workers / 2).max(1),
        max: workers.max(1),
    })
}

/// Launch requests derived from a config
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Exactly one master
    pub master: LaunchRequest,
    /// Workers, absent for single-node clusters
    pub workers: Option<LaunchRequest>,
}

/// Reservations returned by the provider for one start
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LaunchReservations {
    /// Master reservation
    pub master: ReservationHandle,
    /// Worker reservation
    pub workers: Option<ReservationHandle>,
}

impl LaunchReservations {
    /// Every instance id launched, master first
    pub fn instance_ids(&self) -> Vec<String> {
        self.master
            .instance_ids
            .iter()
            .chain(self.workers.iter().flat_map(|w| w.instance_ids.iter()))
            .cloned()
            .collect()
    }
}

/// Build the launch requests for `config`
pub fn plan_launch(config: &ClusterConfig) -> Result<LaunchPlan> {
    let missing = |setting: Setting| {
        Error::configuration(
            &config.cluster_tag,
            vec![ValidationFailure::MissingSetting(setting)],
        )
    };

    let node_image = config
        .node_image_id
        .clone()
        .ok_or_else(|| missing(Setting::NodeImageId))?;
    let instance_type = config
        .instance_type
        .clone()
        .ok_or_else(|| missing(Setting::InstanceType))?;
    let key_name = config
        .keyname
        .clone()
        .ok_or_else(|| missing(Setting::Keyname))?;
    let size = config
        .cluster_size
        .ok_or_else(|| missing(Setting::ClusterSize))?;
    let group = config.security_group_name();

    let master = LaunchRequest {
        image_id: config
            .master_image_id
            .clone()
            .unwrap_or_else(|| node_image.clone()),
        instance_type: instance_type.clone(),
        min_count: 1,
        max_count: 1,
        key_name: key_name.clone(),
        security_groups: vec![MASTER_GROUP.to_string(), group.clone()],
        zone: config.availability_zone.clone(),
    };

    let workers = worker_counts(size).map(|counts| LaunchRequest {
        image_id: node_image,
        instance_type,
        min_count: counts.min,
        max_count: counts.max,
        key_name,
        security_groups: vec![group],
        zone: config.availability_zone.clone(),
    });

    Ok(LaunchPlan { master, workers })
}

/// Issue the master and worker launch requests
///
/// Failures are not retried here; a failed worker request leaves the master
/// running for the caller to resume or tear down.
pub async fn launch(
    config: &ClusterConfig,
    gateway: &dyn ProviderGateway,
) -> Result<LaunchReservations> {
    let plan = plan_launch(config)?;
    let tag = &config.cluster_tag;

    info!(cluster = %tag, image = %plan.master.image_id, "launching master node");
    let master = gateway
        .launch_instances(&plan.master)
        .await
        .map_err(|e| Error::provider(tag, "launch master", e))?;

    let workers = match &plan.workers {
        Some(request) => {
            info!(
                cluster = %tag,
                image = %request.image_id,
                min = request.min_count,
                max = request.max_count,
                "launching worker nodes"
            );
            let reservation = gateway
                .launch_instances(request)
                .await
                .map_err(|e| Error::provider(tag, "launch workers", e))?;
            Some(reservation)
        }
        None => None,
    };

    Ok(LaunchReservations { master, workers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockProviderGateway, ProviderError};
    use crate::testing::sample_config;

    #[test]
    fn test_worker_counts() {
        assert_eq!(worker_counts(0), None);
        assert_eq!(worker_counts(1), None);
        assert_eq!(worker_counts(2), Some(WorkerCounts { min: 1, max: 1 }));
        assert_eq!(worker_counts(3), Some(WorkerCounts { min: 1, max: 2 }));
        assert_eq!(worker_counts(5), Some(WorkerCounts { min: 2, max: 4 }));
        assert_eq!(worker_counts(10), Some(WorkerCounts { min: 4, max: 9 }));
    }

    #[test]
    fn test_single_node_plan_has_no_workers() {
        let plan = plan_launch(&sample_config(1)).unwrap();
        assert!(plan.workers.is_none());
        assert_eq!(plan.master.min_count, 1);
        assert_eq!(plan.master.max_count, 1);
    }

    #[test]
    fn test_master_joins_admin_group_and_uses_master_image() {
        let mut config = sample_config(5);
        config.master_image_id = Some("ami-master".to_string());
        config.availability_zone = Some("us-east-1c".to_string());

        let plan = plan_launch(&config).unwrap();
        assert_eq!(plan.master.image_id, "ami-master");
        assert_eq!(
            plan.master.security_groups,
            vec![MASTER_GROUP.to_string(), config.security_group_name()]
        );
        assert_eq!(plan.master.zone.as_deref(), Some("us-east-1c"));

        let workers = plan.workers.unwrap();
        assert_eq!(workers.image_id, "ami-node");
        assert_eq!(workers.security_groups, vec![config.security_group_name()]);
        assert_eq!((workers.min_count, workers.max_count), (2, 4));
    }

    #[test]
    fn test_plan_requires_images() {
        let mut config = sample_config(2);
        config.node_image_id = None;
        let err = plan_launch(&config).unwrap_err();
        assert!(err.to_string().contains("node_image_id"));
    }

    #[tokio::test]
    async fn test_worker_failure_propagates() {
        let mut gateway = MockProviderGateway::new();
        let mut seq = mockall::Sequence::new();
        gateway
            .expect_launch_instances()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(ReservationHandle {
                    reservation_id: "r-1".to_string(),
                    instance_ids: vec!["i-master".to_string()],
                })
            });
        gateway
            .expect_launch_instances()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(ProviderError::transient("InsufficientInstanceCapacity")));

        let err = launch(&sample_config(3), &gateway).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("launch workers"));
    }

    #[tokio::test]
    async fn test_single_node_launch_issues_one_request() {
        let mut gateway = MockProviderGateway::new();
        gateway
            .expect_launch_instances()
            .withf(|r| r.min_count == 1 && r.max_count == 1)
            .times(1)
            .returning(|_| {
                Ok(ReservationHandle {
                    reservation_id: "r-1".to_string(),
                    instance_ids: vec!["i-master".to_string()],
                })
            });

        let reservations = launch(&sample_config(1), &gateway).await.unwrap();
        assert!(reservations.workers.is_none());
        assert_eq!(reservations.instance_ids(), vec!["i-master".to_string()]);
    }
}
