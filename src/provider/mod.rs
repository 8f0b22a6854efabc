//! Cloud provider abstraction layer
//!
//! Every interaction with the compute provider goes through the
//! [`ProviderGateway`] trait. Calls are remote, eventually consistent and may
//! fail transiently, so each returns a tagged [`ProviderError`] that keeps
//! "not found" apart from "try again later" and "give up".
//!
//! # Supported Providers
//!
//! - [`SimulatedProvider`] - in-memory provider for local runs and tests
//!
//! # Example
//!
//! ```text
//! let gateway = create_gateway(ProviderType::Simulated, &config)?;
//! let controller = ClusterController::new(config, gateway);
//! ```

mod simulated;

pub use simulated::SimulatedProvider;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::catalog::Architecture;
use crate::config::ClusterConfig;
use crate::Result;

/// Zone state reported for zones that accept new instances
pub const ZONE_AVAILABLE: &str = "available";
/// Volume status while attached to an instance
pub const VOLUME_IN_USE: &str = "in-use";
/// Volume status while detached
pub const VOLUME_AVAILABLE: &str = "available";
/// Attachment status once the device is usable
pub const ATTACHMENT_ATTACHED: &str = "attached";
/// Attachment status while the attach is in flight
pub const ATTACHMENT_ATTACHING: &str = "attaching";

/// Kind of provider resource, used in "not found" errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    /// Compute instance
    Instance,
    /// Security group
    SecurityGroup,
    /// Machine image
    Image,
    /// Availability zone
    Zone,
    /// Block storage volume
    Volume,
    /// SSH key pair
    KeyPair,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Instance => "instance",
            Self::SecurityGroup => "security group",
            Self::Image => "image",
            Self::Zone => "zone",
            Self::Volume => "volume",
            Self::KeyPair => "key pair",
        };
        f.write_str(name)
    }
}

/// Failure of a single provider call
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The addressed resource does not exist (or is not visible yet)
    #[error("{kind} {id} not found")]
    NotFound {
        /// Kind of resource
        kind: ResourceKind,
        /// Identifier that was looked up
        id: String,
    },

    /// Timeout, throttling or capacity shortage; the same call may succeed later
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Authentication failure or rejected request; repeating will not help
    #[error("provider request failed: {0}")]
    Fatal(String),
}

impl ProviderError {
    /// Create a "not found" error
    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether this is a "not found" response
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the same call may succeed if repeated
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Result of a single provider call
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Lifecycle state of an instance as reported by the provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    /// Booting
    Pending,
    /// Booted
    Running,
    /// Terminate requested
    ShuttingDown,
    /// Gone
    Terminated,
    /// Stop requested
    Stopping,
    /// Powered off
    Stopped,
}

impl NodeState {
    /// Pending or running instances count as cluster members
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Snapshot of one instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeView {
    /// Provider instance id
    pub instance_id: String,
    /// Public hostname; absent until the instance has a network identity
    pub hostname: Option<String>,
    /// Lifecycle state
    pub state: NodeState,
}

impl NodeView {
    /// Whether the node counts as a cluster member
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

/// A security group as resolved by the provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityGroupHandle {
    /// Group name
    pub name: String,
    /// Provider-assigned group id
    pub group_id: String,
}

/// Machine image metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    /// Image id
    pub image_id: String,
    /// Architecture the image was built for
    pub architecture: Architecture,
}

/// Availability zone metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneInfo {
    /// Zone name
    pub name: String,
    /// Reported state ("available", "impaired", ...)
    pub state: String,
}

impl ZoneInfo {
    /// Whether the zone currently accepts instances
    pub fn is_available(&self) -> bool {
        self.state == ZONE_AVAILABLE
    }
}

/// One attachment record of a volume
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeAttachment {
    /// Volume the record belongs to
    pub volume_id: String,
    /// Instance the volume is attached to
    pub instance_id: String,
    /// Device path on the instance
    pub device: String,
    /// "attaching", "attached", "detaching", ...
    pub status: String,
}

/// Block storage volume metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeInfo {
    /// Volume id
    pub volume_id: String,
    /// Zone the volume lives in
    pub zone: String,
    /// "available", "in-use", ...
    pub status: String,
    /// Current attachment records
    pub attachments: Vec<VolumeAttachment>,
}

/// Key pair metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPairInfo {
    /// Key pair name
    pub name: String,
    /// Key fingerprint
    pub fingerprint: String,
}

/// Parameters of one launch call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Image to boot
    pub image_id: String,
    /// Instance type
    pub instance_type: String,
    /// Fewest instances the provider may start
    pub min_count: u32,
    /// Most instances the provider may start
    pub max_count: u32,
    /// Key pair installed on the instances
    pub key_name: String,
    /// Security groups the instances join
    pub security_groups: Vec<String>,
    /// Placement zone, provider default when absent
    pub zone: Option<String>,
}

/// Opaque reference to a fulfilled launch call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationHandle {
    /// Provider reservation id
    pub reservation_id: String,
    /// Instances started by this reservation
    pub instance_ids: Vec<String>,
}

/// Compute provider operations used by the cluster controller
///
/// Implementations are shared across tasks and must be `Send + Sync`. No
/// method retries internally; callers decide how to treat each
/// [`ProviderError`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Start between `min_count` and `max_count` instances
    async fn launch_instances(&self, request: &LaunchRequest) -> ProviderResult<ReservationHandle>;

    /// Resolve a security group by name
    async fn describe_security_group(&self, name: &str) -> ProviderResult<SecurityGroupHandle>;

    /// All instances that are members of a group, in launch order
    async fn list_instances_in_group(
        &self,
        group: &SecurityGroupHandle,
    ) -> ProviderResult<Vec<NodeView>>;

    /// Resolve images by id
    async fn describe_images(&self, image_ids: &[String]) -> ProviderResult<Vec<ImageInfo>>;

    /// All availability zones of the region
    async fn describe_zones(&self) -> ProviderResult<Vec<ZoneInfo>>;

    /// Resolve volumes by id
    async fn describe_volumes(&self, volume_ids: &[String]) -> ProviderResult<Vec<VolumeInfo>>;

    /// Request attachment of a volume to an instance
    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> ProviderResult<()>;

    /// Request detachment of a volume from whatever holds it
    async fn detach_volume(&self, volume_id: &str) -> ProviderResult<()>;

    /// Resolve key pairs by name
    async fn describe_key_pairs(&self, names: &[String]) -> ProviderResult<Vec<KeyPairInfo>>;

    /// Request termination of instances
    async fn terminate_instances(&self, instance_ids: &[String]) -> ProviderResult<()>;

    /// Every instance visible to the account
    async fn list_all_instances(&self) -> ProviderResult<Vec<NodeView>>;
}

/// Provider backends a gateway can be created for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProviderType {
    /// In-memory provider mirroring the cluster's own settings
    #[default]
    Simulated,
    /// Amazon EC2
    Ec2,
}

impl FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simulated" => Ok(Self::Simulated),
            "ec2" => Ok(Self::Ec2),
            _ => Err(format!(
                "invalid provider type: {s}, expected one of: simulated, ec2"
            )),
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simulated => write!(f, "simulated"),
            Self::Ec2 => write!(f, "ec2"),
        }
    }
}

/// Create a gateway for the given provider type
///
/// The simulated backend is seeded from `config` so that a well-formed
/// cluster config validates and launches against it.
pub fn create_gateway(
    provider_type: ProviderType,
    config: &ClusterConfig,
) -> Result<Arc<dyn ProviderGateway>> {
    match provider_type {
        ProviderType::Simulated => Ok(Arc::new(SimulatedProvider::mirroring(config))),
        ProviderType::Ec2 => Err(crate::Error::provider(
            &config.cluster_tag,
            "connect",
            ProviderError::fatal("EC2 gateway not yet implemented"),
        )),
    }
}
