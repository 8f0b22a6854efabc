//! Waiting for a launched cluster to come up
//!
//! A cluster is up when the provider reports exactly `cluster_size` active
//! nodes in the cluster's security group and every one of them accepts a TCP
//! connection on the administrative port. Both must hold in the same
//! observation; any miss starts the next observation from scratch.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use super::{list_group_nodes, ControllerOptions};
use crate::config::{ClusterConfig, Setting};
use crate::provider::{NodeView, ProviderGateway};
use crate::validate::ValidationFailure;
use crate::wait::{poll_until, PollResult};
use crate::{Error, Result};

/// Network reachability check for a node's administrative port
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reachability: Send + Sync {
    /// Whether `host:port` accepts a connection within `timeout`
    async fn is_reachable(&self, host: &str, port: u16, timeout: Duration) -> bool;
}

/// Opens and immediately closes a TCP connection
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpProbe;

#[async_trait]
impl Reachability for TcpProbe {
    async fn is_reachable(&self, host: &str, port: u16, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!(host = %host, port, error = %e, "connection refused");
                false
            }
            Err(_) => {
                debug!(host = %host, port, "connection timed out");
                false
            }
        }
    }
}

/// One readiness observation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Every expected node is visible and reachable
    Ready(Vec<NodeView>),
    /// The active node count does not match the cluster size yet
    Counting {
        /// Active nodes seen
        observed: usize,
        /// Nodes expected
        expected: usize,
    },
    /// Nodes that did not accept a connection, by hostname or instance id
    Unreachable(Vec<String>),
    /// The provider asked to retry later
    ProviderBusy(String),
}

impl Readiness {
    /// Whether the observation found the cluster up
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// Observes a cluster until it is up
pub struct ReadinessPoller<'a> {
    config: &'a ClusterConfig,
    gateway: &'a dyn ProviderGateway,
    probe: &'a dyn Reachability,
    port: u16,
    connect_timeout: Duration,
    interval: Duration,
}

impl<'a> ReadinessPoller<'a> {
    /// Create a poller with the timings from `options`
    pub fn new(
        config: &'a ClusterConfig,
        gateway: &'a dyn ProviderGateway,
        probe: &'a dyn Reachability,
        options: &ControllerOptions,
    ) -> Self {
        Self {
            config,
            gateway,
            probe,
            port: options.admin_port,
            connect_timeout: options.connect_timeout,
            interval: options.poll_interval,
        }
    }

    /// Make one observation
    ///
    /// Transient provider failures and a security group that is not visible
    /// yet are reported as "not ready"; other provider failures are errors.
    /// A config without a positive `cluster_size` is a configuration error,
    /// since an empty cluster is never up.
    pub async fn check(&self) -> Result<Readiness> {
        let expected = match self.config.cluster_size {
            Some(0) => {
                return Err(Error::configuration(
                    &self.config.cluster_tag,
                    vec![ValidationFailure::InvalidSize(0)],
                ))
            }
            Some(size) => size as usize,
            None => {
                return Err(Error::configuration(
                    &self.config.cluster_tag,
                    vec![ValidationFailure::MissingSetting(Setting::ClusterSize)],
                ))
            }
        };

        let group = self.config.security_group_name();
        let nodes = match list_group_nodes(self.gateway, &group).await {
            Ok(nodes) => nodes,
            Err(e) if e.is_retryable() => return Ok(Readiness::ProviderBusy(e.to_string())),
            Err(e) => return Err(Error::provider(&self.config.cluster_tag, "list nodes", e)),
        };

        let active: Vec<NodeView> = nodes.into_iter().filter(NodeView::is_active).collect();
        if active.len() != expected {
            return Ok(Readiness::Counting {
                observed: active.len(),
                expected,
            });
        }

        let probes = active.iter().map(|node| async move {
            match &node.hostname {
                Some(host) => (
                    host.clone(),
                    self.probe
                        .is_reachable(host, self.port, self.connect_timeout)
                        .await,
                ),
                None => (node.instance_id.clone(), false),
            }
        });
        let unreachable: Vec<String> = join_all(probes)
            .await
            .into_iter()
            .filter(|(_, reachable)| !reachable)
            .map(|(name, _)| name)
            .collect();

        if unreachable.is_empty() {
            Ok(Readiness::Ready(active))
        } else {
            Ok(Readiness::Unreachable(unreachable))
        }
    }

    /// Observe until the cluster is up, returning its nodes
    pub async fn wait_until_up(&self, cancel: &CancellationToken) -> Result<Vec<NodeView>> {
        poll_until(cancel, self.interval, "cluster readiness", || self.observe()).await
    }

    async fn observe(&self) -> PollResult<Vec<NodeView>> {
        let tag = &self.config.cluster_tag;
        match self.check().await? {
            Readiness::Ready(nodes) => Ok(Some(nodes)),
            Readiness::Counting { observed, expected } => {
                info!(cluster = %tag, observed, expected, "waiting for all nodes to come up");
                Ok(None)
            }
            Readiness::Unreachable(hosts) => {
                info!(
                    cluster = %tag,
                    unreachable = ?hosts,
                    port = self.port,
                    "waiting for nodes to accept connections"
                );
                Ok(None)
            }
            Readiness::ProviderBusy(reason) => {
                info!(cluster = %tag, reason = %reason, "provider busy, retrying");
                Ok(None)
            }
        }
    }
}
