//! Cluster lifecycle orchestration
//!
//! [`ClusterController`] is the public entry point. It composes validation,
//! launch, readiness polling, volume attachment and teardown into the
//! operations callers use:
//!
//! - [`ClusterController::validate`] checks the config against the provider
//! - [`ClusterController::start`] validates, launches, waits and attaches
//! - [`ClusterController::stop`] detaches and terminates every node
//! - [`ClusterController::stop_workers`] terminates all but the master
//! - [`ClusterController::is_up`] makes one readiness observation
//!
//! Nothing about the cluster is cached. Every query resolves the security
//! group and lists its members again, so results reflect whatever the
//! provider reports at that moment.
//!
//! # Example
//!
//! ```text
//! let controller = ClusterController::builder(config, gateway)
//!     .options(ControllerOptions::default())
//!     .build();
//! let report = controller.start(StartOptions::default(), &cancel).await?;
//! ```

mod launch;
mod readiness;
mod teardown;
mod volume;

pub use launch::{launch, plan_launch, worker_counts, LaunchPlan, LaunchReservations, WorkerCounts};
pub use readiness::{Readiness, ReadinessPoller, Reachability, TcpProbe};
pub use teardown::{DetachPolicy, TeardownController, TeardownOutcome, TeardownScope};
pub use volume::{
    current_attachment, observe_attachment, AttachState, VolumeAttachmentController,
    VolumeObservation,
};

#[cfg(test)]
pub use readiness::MockReachability;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::config::ClusterConfig;
use crate::provider::{NodeView, ProviderGateway, ProviderResult, SecurityGroupHandle};
use crate::validate::{ConfigValidator, ValidationReport};
use crate::{Error, Result};

/// Default interval between readiness observations
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);
/// Default timeout of one administrative port connection attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);
/// Default administrative port
pub const DEFAULT_ADMIN_PORT: u16 = 22;
/// Default interval between volume status polls
pub const DEFAULT_VOLUME_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default delay between terminating and listing the remaining nodes
pub const DEFAULT_TEARDOWN_SETTLE: Duration = Duration::from_secs(5);

/// Timings and policies of a controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Interval between readiness observations
    pub poll_interval: Duration,
    /// Timeout of one administrative port connection attempt
    pub connect_timeout: Duration,
    /// Port probed for readiness
    pub admin_port: u16,
    /// Interval between volume status polls
    pub volume_poll_interval: Duration,
    /// Delay between terminating and listing the remaining nodes
    pub teardown_settle: Duration,
    /// How teardown detaches the volume
    pub detach_policy: DetachPolicy,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            admin_port: DEFAULT_ADMIN_PORT,
            volume_poll_interval: DEFAULT_VOLUME_POLL_INTERVAL,
            teardown_settle: DEFAULT_TEARDOWN_SETTLE,
            detach_policy: DetachPolicy::default(),
        }
    }
}

/// Callbacks fired once a started cluster is ready for use
#[cfg_attr(test, automock)]
pub trait ClusterHooks: Send + Sync {
    /// The master accepts connections and the volume is attached
    fn on_master_ready(&self, hostname: &str);

    /// Every node accepts connections
    fn on_cluster_ready(&self, hostnames: &[String]);
}

/// Logs how to log into the master
#[derive(Clone, Debug)]
pub struct LoggingHooks {
    user: String,
    key_location: PathBuf,
}

impl LoggingHooks {
    /// Hooks for the cluster user and key file in `config`
    pub fn for_config(config: &ClusterConfig) -> Self {
        Self {
            user: config.cluster_user.clone().unwrap_or_else(|| "root".to_string()),
            key_location: config.key_location.clone().unwrap_or_default(),
        }
    }

    /// Command that opens a shell on `master`
    pub fn login_hint(&self, master: &str) -> String {
        format!(
            "ssh -i {} {}@{}",
            self.key_location.display(),
            self.user,
            master
        )
    }
}

impl ClusterHooks for LoggingHooks {
    fn on_master_ready(&self, hostname: &str) {
        info!(master = %hostname, "the cluster has been started and configured");
        info!("login to the master node as {}: {}", self.user, self.login_hint(hostname));
    }

    fn on_cluster_ready(&self, hostnames: &[String]) {
        info!(nodes = hostnames.len(), "all nodes are up");
    }
}

/// Options of one [`ClusterController::start`] call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartOptions {
    /// Launch the nodes; `false` only waits for an already launched cluster
    pub create: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self { create: true }
    }
}

/// What a successful start produced
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartReport {
    /// The master node
    pub master: NodeView,
    /// Every node, master first
    pub nodes: Vec<NodeView>,
    /// Reservations, absent when nothing was launched
    pub reservations: Option<LaunchReservations>,
    /// Wall time from validation to ready
    pub elapsed: Duration,
}

/// Members of a security group, empty while the group is not visible
pub(crate) async fn list_group_nodes(
    gateway: &dyn ProviderGateway,
    group: &str,
) -> ProviderResult<Vec<NodeView>> {
    let handle = match gateway.describe_security_group(group).await {
        Ok(handle) => handle,
        Err(e) if e.is_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    match gateway.list_instances_in_group(&handle).await {
        Err(e) if e.is_not_found() => Ok(Vec::new()),
        other => other,
    }
}

/// Lifecycle operations for one cluster
pub struct ClusterController {
    config: ClusterConfig,
    gateway: Arc<dyn ProviderGateway>,
    probe: Arc<dyn Reachability>,
    hooks: Arc<dyn ClusterHooks>,
    options: ControllerOptions,
}

impl ClusterController {
    /// Create a builder for constructing a controller
    pub fn builder(config: ClusterConfig, gateway: Arc<dyn ProviderGateway>) -> ControllerBuilder {
        ControllerBuilder::new(config, gateway)
    }

    /// Create a controller with default probe, hooks and options
    pub fn new(config: ClusterConfig, gateway: Arc<dyn ProviderGateway>) -> Self {
        Self::builder(config, gateway).build()
    }

    /// The cluster's settings
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The controller's timings and policies
    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }

    fn tag(&self) -> &str {
        &self.config.cluster_tag
    }

    /// Check the config against the schema and the provider
    #[instrument(skip(self), fields(cluster = %self.config.cluster_tag))]
    pub async fn validate(&self) -> ValidationReport {
        ConfigValidator::new(&self.config, self.gateway.as_ref())
            .validate()
            .await
    }

    /// Check only that the provider accepts the credentials
    #[instrument(skip(self), fields(cluster = %self.config.cluster_tag))]
    pub async fn validate_credentials(&self) -> Result<()> {
        let failures = ConfigValidator::new(&self.config, self.gateway.as_ref())
            .check_credentials()
            .await;
        ValidationReport { failures }.into_result(self.tag())
    }

    /// Validate, launch, wait until every node is up, then attach the volume
    ///
    /// Validation failures abort before any provider call that changes
    /// state. With `create = false` nothing is launched and the call only
    /// waits for nodes launched earlier. The wait has no deadline of its own;
    /// cancel through `cancel`.
    #[instrument(skip(self, cancel), fields(cluster = %self.config.cluster_tag))]
    pub async fn start(
        &self,
        options: StartOptions,
        cancel: &CancellationToken,
    ) -> Result<StartReport> {
        let started = Instant::now();
        info!(create = options.create, "starting cluster");

        self.validate().await.into_result(self.tag())?;

        let reservations = if options.create {
            Some(launch(&self.config, self.gateway.as_ref()).await?)
        } else {
            None
        };

        info!("waiting for cluster to start");
        let nodes = ReadinessPoller::new(
            &self.config,
            self.gateway.as_ref(),
            self.probe.as_ref(),
            &self.options,
        )
        .wait_until_up(cancel)
        .await?;

        let master = nodes.first().cloned().ok_or_else(|| Error::NodeNotFound {
            cluster: self.tag().to_string(),
            index: 0,
            available: 0,
        })?;

        VolumeAttachmentController::new(
            &self.config,
            self.gateway.as_ref(),
            self.options.volume_poll_interval,
        )
        .attach(cancel)
        .await?;

        let master_host = master
            .hostname
            .clone()
            .unwrap_or_else(|| master.instance_id.clone());
        let hostnames: Vec<String> = nodes
            .iter()
            .map(|n| n.hostname.clone().unwrap_or_else(|| n.instance_id.clone()))
            .collect();
        self.hooks.on_master_ready(&master_host);
        self.hooks.on_cluster_ready(&hostnames);

        let elapsed = started.elapsed();
        info!(elapsed_secs = elapsed.as_secs_f64(), nodes = nodes.len(), "cluster started");
        Ok(StartReport {
            master,
            nodes,
            reservations,
            elapsed,
        })
    }

    /// Detach the volume and terminate every node
    ///
    /// `confirmed` must be resolved by the caller; when false the provider is
    /// not contacted and [`TeardownOutcome::Aborted`] is returned.
    #[instrument(skip(self, cancel), fields(cluster = %self.config.cluster_tag))]
    pub async fn stop(&self, confirmed: bool, cancel: &CancellationToken) -> Result<TeardownOutcome> {
        if !confirmed {
            info!("exiting without shutting down instances");
            return Ok(TeardownOutcome::Aborted);
        }
        TeardownController::new(&self.config, self.gateway.as_ref(), &self.options)
            .run(TeardownScope::Full, cancel)
            .await
    }

    /// Terminate every node except the master
    #[instrument(skip(self, cancel), fields(cluster = %self.config.cluster_tag))]
    pub async fn stop_workers(&self, cancel: &CancellationToken) -> Result<TeardownOutcome> {
        TeardownController::new(&self.config, self.gateway.as_ref(), &self.options)
            .run(TeardownScope::WorkersOnly, cancel)
            .await
    }

    /// Whether every node is visible and reachable right now
    #[instrument(skip(self), fields(cluster = %self.config.cluster_tag))]
    pub async fn is_up(&self) -> Result<bool> {
        let readiness = ReadinessPoller::new(
            &self.config,
            self.gateway.as_ref(),
            self.probe.as_ref(),
            &self.options,
        )
        .check()
        .await?;
        Ok(readiness.is_ready())
    }

    /// The cluster's security group, `None` until the provider shows it
    pub async fn security_group(&self) -> Result<Option<SecurityGroupHandle>> {
        match self
            .gateway
            .describe_security_group(&self.config.security_group_name())
            .await
        {
            Ok(group) => Ok(Some(group)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(Error::provider(self.tag(), "describe security group", e)),
        }
    }

    /// Every member of the security group in any state
    pub async fn nodes(&self) -> Result<Vec<NodeView>> {
        list_group_nodes(self.gateway.as_ref(), &self.config.security_group_name())
            .await
            .map_err(|e| Error::provider(self.tag(), "list nodes", e))
    }

    /// Pending and running members
    pub async fn active_nodes(&self) -> Result<Vec<NodeView>> {
        Ok(self
            .nodes()
            .await?
            .into_iter()
            .filter(NodeView::is_active)
            .collect())
    }

    /// The first active member
    pub async fn master_node(&self) -> Result<Option<NodeView>> {
        Ok(self.active_nodes().await?.into_iter().next())
    }

    /// Hostname of the active node at `index`, master at 0
    ///
    /// `None` while the node is pending and has no hostname yet.
    pub async fn node_hostname(&self, index: usize) -> Result<Option<String>> {
        let nodes = self.active_nodes().await?;
        let available = nodes.len();
        nodes
            .into_iter()
            .nth(index)
            .map(|node| node.hostname)
            .ok_or_else(|| Error::NodeNotFound {
                cluster: self.tag().to_string(),
                index,
                available,
            })
    }
}

/// Builder for [`ClusterController`]
pub struct ControllerBuilder {
    config: ClusterConfig,
    gateway: Arc<dyn ProviderGateway>,
    probe: Option<Arc<dyn Reachability>>,
    hooks: Option<Arc<dyn ClusterHooks>>,
    options: ControllerOptions,
}

impl ControllerBuilder {
    fn new(config: ClusterConfig, gateway: Arc<dyn ProviderGateway>) -> Self {
        Self {
            config,
            gateway,
            probe: None,
            hooks: None,
            options: ControllerOptions::default(),
        }
    }

    /// Override the reachability probe (primarily for testing)
    pub fn probe(mut self, probe: Arc<dyn Reachability>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Override the readiness hooks
    pub fn hooks(mut self, hooks: Arc<dyn ClusterHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Set timings and policies
    pub fn options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the controller
    pub fn build(self) -> ClusterController {
        let hooks = self
            .hooks
            .unwrap_or_else(|| Arc::new(LoggingHooks::for_config(&self.config)));
        ClusterController {
            probe: self.probe.unwrap_or_else(|| Arc::new(TcpProbe)),
            hooks,
            config: self.config,
            gateway: self.gateway,
            options: self.options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockProviderGateway, ProviderError, SimulatedProvider};
    use crate::testing::{fast_options, valid_setup};

    fn reachable() -> Arc<MockReachability> {
        let mut probe = MockReachability::new();
        probe.expect_is_reachable().returning(|_, _, _| true);
        Arc::new(probe)
    }

    fn controller(
        config: ClusterConfig,
        provider: Arc<SimulatedProvider>,
        hooks: Arc<dyn ClusterHooks>,
    ) -> ClusterController {
        ClusterController::builder(config, provider)
            .probe(reachable())
            .hooks(hooks)
            .options(fast_options())
            .build()
    }

    // ==========================================================================
    // Story Tests: Cluster Lifecycle
    // ==========================================================================

    /// Story: a two node cluster starts, fires its hooks once and stops
    #[tokio::test]
    async fn story_start_then_stop() {
        let (config, provider, _key) = valid_setup(2);
        let provider = Arc::new(provider);

        let mut hooks = MockClusterHooks::new();
        hooks.expect_on_master_ready().times(1).return_const(());
        hooks
            .expect_on_cluster_ready()
            .withf(|hosts| hosts.len() == 2)
            .times(1)
            .return_const(());
        let controller = controller(config, provider.clone(), Arc::new(hooks));

        let report = controller
            .start(StartOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.nodes.len(), 2);
        assert_eq!(report.nodes[0], report.master);
        assert!(controller.is_up().await.unwrap());

        let outcome = controller
            .stop(true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.terminated_count(), 2);
        assert!(!controller.is_up().await.unwrap());
        assert!(controller.active_nodes().await.unwrap().is_empty());
    }

    /// Story: an invalid config never reaches a launch call
    #[tokio::test]
    async fn story_invalid_config_launches_nothing() {
        let (mut config, provider, _key) = valid_setup(2);
        config.cluster_shell = Some("fish".to_string());
        let provider = Arc::new(provider);
        let hooks = MockClusterHooks::new();
        let controller = controller(config, provider.clone(), Arc::new(hooks));

        let err = controller
            .start(StartOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(provider.launch_requests().is_empty());
    }

    /// Story: an unconfirmed stop leaves the provider untouched
    #[tokio::test]
    async fn story_unconfirmed_stop_aborts() {
        let (config, _, _key) = valid_setup(2);
        let gateway = MockProviderGateway::new();
        let controller = ClusterController::builder(config, Arc::new(gateway))
            .options(fast_options())
            .build();

        let outcome = controller
            .stop(false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TeardownOutcome::Aborted);
    }

    /// Story: resuming a wait does not launch again
    #[tokio::test]
    async fn story_resume_without_create() {
        let (config, provider, _key) = valid_setup(3);
        let provider = Arc::new(provider.with_boot_polls(2));
        launch(&config, provider.as_ref()).await.unwrap();

        let mut hooks = MockClusterHooks::new();
        hooks.expect_on_master_ready().return_const(());
        hooks.expect_on_cluster_ready().return_const(());
        let controller = controller(config, provider.clone(), Arc::new(hooks));

        let report = controller
            .start(StartOptions { create: false }, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.reservations.is_none());
        assert_eq!(report.nodes.len(), 3);
        assert_eq!(provider.launch_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_node_queries() {
        let (config, provider, _key) = valid_setup(3);
        let provider = Arc::new(provider);
        let reservations = launch(&config, provider.as_ref()).await.unwrap();
        let controller = controller(config, provider, Arc::new(MockClusterHooks::new()));

        let group = controller.security_group().await.unwrap().unwrap();
        assert_eq!(group.name, controller.config().security_group_name());

        let master = controller.master_node().await.unwrap().unwrap();
        assert_eq!(master.instance_id, reservations.master.instance_ids[0]);
        assert_eq!(controller.nodes().await.unwrap().len(), 3);
        assert_eq!(
            controller.node_hostname(0).await.unwrap().as_deref(),
            Some("localhost")
        );

        let err = controller.node_hostname(3).await.unwrap_err();
        assert!(matches!(
            err,
            Error::NodeNotFound {
                index: 3,
                available: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_queries_before_launch() {
        let (config, provider, _key) = valid_setup(2);
        let controller = controller(config, Arc::new(provider), Arc::new(MockClusterHooks::new()));

        assert_eq!(controller.security_group().await.unwrap(), None);
        assert_eq!(controller.master_node().await.unwrap(), None);
        assert!(!controller.is_up().await.unwrap());
    }

    #[tokio::test]
    async fn test_validate_credentials() {
        let (config, _, _key) = valid_setup(2);
        let mut gateway = MockProviderGateway::new();
        gateway
            .expect_list_all_instances()
            .returning(|| Err(ProviderError::fatal("AuthFailure")));
        let controller = ClusterController::new(config, Arc::new(gateway));

        let err = controller.validate_credentials().await.unwrap_err();
        assert!(err.to_string().contains("AuthFailure"));
    }

    #[test]
    fn test_login_hint() {
        let (config, _, _key) = valid_setup(2);
        let hooks = LoggingHooks::for_config(&config);
        let hint = hooks.login_hint("master.example");
        assert!(hint.starts_with("ssh -i "));
        assert!(hint.ends_with("sgeadmin@master.example"));
    }

    #[test]
    fn test_default_options() {
        let options = ControllerOptions::default();
        assert_eq!(options.poll_interval, Duration::from_secs(15));
        assert_eq!(options.connect_timeout, Duration::from_millis(250));
        assert_eq!(options.admin_port, 22);
        assert_eq!(options.detach_policy, DetachPolicy::BestEffort);
    }
}
