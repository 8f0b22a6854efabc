//! Detach-then-terminate teardown

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::volume::current_attachment;
use super::{list_group_nodes, ControllerOptions};
use crate::config::ClusterConfig;
use crate::provider::{NodeView, ProviderGateway};
use crate::wait::{poll_until, sleep_or_cancel, PollResult};
use crate::{Error, Result};

/// Which nodes a teardown terminates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeardownScope {
    /// Every active node
    Full,
    /// Every active node except the master
    WorkersOnly,
}

/// How hard teardown tries to detach the volume before terminating
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetachPolicy {
    /// Request the detach, wait one delay, log what the provider reports and
    /// terminate regardless
    #[default]
    BestEffort,
    /// Wait until the volume has no attachment; abort on detach failure
    Strict,
}

impl FromStr for DetachPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "best-effort" => Ok(Self::BestEffort),
            "strict" => Ok(Self::Strict),
            _ => Err(format!(
                "invalid detach policy: {s}, expected one of: best-effort, strict"
            )),
        }
    }
}

impl fmt::Display for DetachPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BestEffort => write!(f, "best-effort"),
            Self::Strict => write!(f, "strict"),
        }
    }
}

/// Result of a teardown request
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum TeardownOutcome {
    /// The caller did not confirm; the provider was not contacted
    Aborted,
    /// No node needed terminating
    NothingToDo,
    /// Termination was requested
    Terminated {
        /// Instance ids passed to terminate
        terminated: Vec<String>,
        /// Node snapshot taken one delay after terminating; `None` when the
        /// snapshot could not be taken
        remaining: Option<Vec<NodeView>>,
    },
}

impl TeardownOutcome {
    /// Number of instances termination was requested for
    pub fn terminated_count(&self) -> usize {
        match self {
            Self::Terminated { terminated, .. } => terminated.len(),
            _ => 0,
        }
    }
}

/// Tears down all or part of a cluster
pub struct TeardownController<'a> {
    config: &'a ClusterConfig,
    gateway: &'a dyn ProviderGateway,
    options: &'a ControllerOptions,
}

impl<'a> TeardownController<'a> {
    /// Create a teardown controller
    pub fn new(
        config: &'a ClusterConfig,
        gateway: &'a dyn ProviderGateway,
        options: &'a ControllerOptions,
    ) -> Self {
        Self {
            config,
            gateway,
            options,
        }
    }

    /// Terminate the nodes `scope` selects
    ///
    /// When the configured volume is attached to one of those nodes it is
    /// detached first, following the configured [`DetachPolicy`].
    pub async fn run(
        &self,
        scope: TeardownScope,
        cancel: &CancellationToken,
    ) -> Result<TeardownOutcome> {
        let tag = &self.config.cluster_tag;
        let group = self.config.security_group_name();

        let active: Vec<NodeView> = list_group_nodes(self.gateway, &group)
            .await
            .map_err(|e| Error::provider(tag, "list nodes", e))?
            .into_iter()
            .filter(NodeView::is_active)
            .collect();
        if active.is_empty() {
            info!(cluster = %tag, "no running instances found");
            return Ok(TeardownOutcome::NothingToDo);
        }

        let targets: Vec<String> = match scope {
            TeardownScope::Full => active.iter(),
            TeardownScope::WorkersOnly => active[1..].iter(),
        }
        .map(|n| n.instance_id.clone())
        .collect();
        if targets.is_empty() {
            info!(cluster = %tag, "only the master is running, no workers to stop");
            return Ok(TeardownOutcome::NothingToDo);
        }

        self.detach_volume(&targets, cancel).await?;

        for id in &targets {
            info!(cluster = %tag, instance = %id, "shutting down instance");
        }
        self.gateway
            .terminate_instances(&targets)
            .await
            .map_err(|e| Error::provider(tag, "terminate instances", e))?;

        let remaining = self.snapshot(&group, cancel).await;
        Ok(TeardownOutcome::Terminated {
            terminated: targets,
            remaining,
        })
    }

    async fn detach_volume(&self, targets: &[String], cancel: &CancellationToken) -> Result<()> {
        let Some(volume) = &self.config.volume else {
            return Ok(());
        };
        match current_attachment(self.gateway, volume).await {
            Ok(Some(attachment)) if !targets.contains(&attachment.instance_id) => {
                debug!(
                    volume = %volume,
                    instance = %attachment.instance_id,
                    "volume stays attached to a node that is kept"
                );
                return Ok(());
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(volume = %volume, "volume not attached");
                return Ok(());
            }
            Err(e) if self.options.detach_policy == DetachPolicy::Strict => {
                return Err(Error::volume_detach(volume, e.to_string()));
            }
            Err(e) => {
                warn!(volume = %volume, error = %e, "could not look up volume, detaching anyway");
            }
        }

        info!(volume = %volume, policy = %self.options.detach_policy, "detaching volume");
        match self.options.detach_policy {
            DetachPolicy::BestEffort => {
                if let Err(e) = self.gateway.detach_volume(volume).await {
                    warn!(volume = %volume, error = %e, "detach request failed, continuing");
                }
                sleep_or_cancel(cancel, self.options.volume_poll_interval, "volume detach")
                    .await?;
                match current_attachment(self.gateway, volume).await {
                    Ok(Some(a)) => warn!(volume = %volume, status = %a.status, "volume still attached"),
                    Ok(None) => info!(volume = %volume, "volume detached"),
                    Err(e) => warn!(volume = %volume, error = %e, "could not confirm detach"),
                }
                Ok(())
            }
            DetachPolicy::Strict => {
                self.gateway
                    .detach_volume(volume)
                    .await
                    .map_err(|e| Error::volume_detach(volume, e.to_string()))?;
                poll_until(cancel, self.options.volume_poll_interval, "volume detach", || {
                    self.detached(volume)
                })
                .await?;
                info!(volume = %volume, "volume detached");
                Ok(())
            }
        }
    }

    async fn detached(&self, volume: &str) -> PollResult<()> {
        match current_attachment(self.gateway, volume).await {
            Ok(None) => Ok(Some(())),
            Ok(Some(attachment)) => {
                debug!(volume = %volume, status = %attachment.status, "volume still attached");
                Ok(None)
            }
            Err(e) if e.is_retryable() => Ok(None),
            Err(e) => Err(Error::volume_detach(volume, e.to_string())),
        }
    }

    async fn snapshot(&self, group: &str, cancel: &CancellationToken) -> Option<Vec<NodeView>> {
        let tag = &self.config.cluster_tag;
        if let Err(e) = sleep_or_cancel(cancel, self.options.teardown_settle, "teardown").await {
            warn!(cluster = %tag, error = %e, "skipping post-teardown listing");
            return None;
        }
        match list_group_nodes(self.gateway, group).await {
            Ok(nodes) => {
                for node in &nodes {
                    info!(cluster = %tag, instance = %node.instance_id, state = %node.state, "instance state");
                }
                Some(nodes)
            }
            Err(e) => {
                warn!(cluster = %tag, error = %e, "could not list instances after teardown");
                None
            }
        }
    }
}
