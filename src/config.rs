//! Cluster settings
//!
//! A cluster is described by a [`ClusterConfig`]: a flat set of named,
//! mostly optional settings. Which settings must be present is declared in the
//! [`CLUSTER_SETTINGS`] schema table and checked by the validator, so a config
//! with gaps can still be constructed, inspected and reported on.
//!
//! Settings files are YAML with one credentials section and any number of
//! named cluster templates:
//!
//! ```yaml
//! aws:
//!   aws_access_key_id: AKIA...
//!   aws_secret_access_key: ...
//!   aws_user_id: "123456789012"
//! clusters:
//!   smallcluster:
//!     cluster_size: 2
//!     cluster_user: sgeadmin
//!     cluster_shell: bash
//!     node_image_id: ami-0330d16a
//!     instance_type: m1.small
//!     keyname: gsg-keypair
//!     key_location: /home/me/.ssh/id_rsa-gsg-keypair
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog;
use crate::{Error, Result};

/// Environment variable consulted when the access key id is not in the file
pub const ACCESS_KEY_ID_ENV: &str = "AWS_ACCESS_KEY_ID";
/// Environment variable consulted when the secret key is not in the file
pub const SECRET_ACCESS_KEY_ENV: &str = "AWS_SECRET_ACCESS_KEY";
/// Environment variable consulted when the account id is not in the file
pub const USER_ID_ENV: &str = "AWS_USER_ID";

/// Every setting a cluster config carries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Setting {
    /// Provider access key id
    AwsAccessKeyId,
    /// Provider secret access key
    AwsSecretAccessKey,
    /// Provider account id
    AwsUserId,
    /// Correlation key for all provider lookups
    ClusterTag,
    /// Free-form description
    ClusterDescription,
    /// Total node count including the master
    ClusterSize,
    /// Login user created on the nodes
    ClusterUser,
    /// Login shell for the cluster user
    ClusterShell,
    /// Image for the master node
    MasterImageId,
    /// Image for worker nodes
    NodeImageId,
    /// Provider instance type
    InstanceType,
    /// Placement zone
    AvailabilityZone,
    /// Provider key pair name
    Keyname,
    /// Local private key file for the key pair
    KeyLocation,
    /// Durable volume id
    Volume,
    /// Device path the volume is attached at
    VolumeDevice,
    /// Partition on the volume to mount
    VolumePartition,
}

impl Setting {
    /// The key this setting uses in settings files
    pub fn key(&self) -> &'static str {
        match self {
            Self::AwsAccessKeyId => "aws_access_key_id",
            Self::AwsSecretAccessKey => "aws_secret_access_key",
            Self::AwsUserId => "aws_user_id",
            Self::ClusterTag => "cluster_tag",
            Self::ClusterDescription => "cluster_description",
            Self::ClusterSize => "cluster_size",
            Self::ClusterUser => "cluster_user",
            Self::ClusterShell => "cluster_shell",
            Self::MasterImageId => "master_image_id",
            Self::NodeImageId => "node_image_id",
            Self::InstanceType => "instance_type",
            Self::AvailabilityZone => "availability_zone",
            Self::Keyname => "keyname",
            Self::KeyLocation => "key_location",
            Self::Volume => "volume",
            Self::VolumeDevice => "volume_device",
            Self::VolumePartition => "volume_partition",
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// One row of the settings schema
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SettingSpec {
    /// The setting described
    pub setting: Setting,
    /// Whether validation fails when the setting is absent
    pub required: bool,
}

const fn spec(setting: Setting, required: bool) -> SettingSpec {
    SettingSpec { setting, required }
}

/// Settings schema: which settings a cluster must define
pub const CLUSTER_SETTINGS: &[SettingSpec] = &[
    spec(Setting::AwsAccessKeyId, true),
    spec(Setting::AwsSecretAccessKey, true),
    spec(Setting::AwsUserId, true),
    spec(Setting::ClusterTag, false),
    spec(Setting::ClusterDescription, false),
    spec(Setting::ClusterSize, true),
    spec(Setting::ClusterUser, true),
    spec(Setting::ClusterShell, true),
    spec(Setting::MasterImageId, false),
    spec(Setting::NodeImageId, true),
    spec(Setting::InstanceType, true),
    spec(Setting::AvailabilityZone, false),
    spec(Setting::Keyname, true),
    spec(Setting::KeyLocation, true),
    spec(Setting::Volume, false),
    spec(Setting::VolumeDevice, false),
    spec(Setting::VolumePartition, false),
];

/// Provider credentials section of a settings file
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AwsCredentials {
    /// Access key id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_access_key_id: Option<String>,
    /// Secret access key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_secret_access_key: Option<String>,
    /// Account id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_user_id: Option<String>,
}

impl AwsCredentials {
    /// Read whatever credentials are present in the environment
    pub fn from_env() -> Self {
        Self {
            aws_access_key_id: std::env::var(ACCESS_KEY_ID_ENV).ok(),
            aws_secret_access_key: std::env::var(SECRET_ACCESS_KEY_ENV).ok(),
            aws_user_id: std::env::var(USER_ID_ENV).ok(),
        }
    }

    /// Fill any field missing here from `fallback`
    pub fn or(self, fallback: AwsCredentials) -> Self {
        Self {
            aws_access_key_id: self.aws_access_key_id.or(fallback.aws_access_key_id),
            aws_secret_access_key: self
                .aws_secret_access_key
                .or(fallback.aws_secret_access_key),
            aws_user_id: self.aws_user_id.or(fallback.aws_user_id),
        }
    }
}

/// A named cluster template as written in a settings file
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ClusterTemplate {
    /// Fixed tag; a timestamp tag is generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_tag: Option<String>,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_description: Option<String>,
    /// Total node count including the master
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_size: Option<u32>,
    /// Login user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_user: Option<String>,
    /// Login shell
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_shell: Option<String>,
    /// Master image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_image_id: Option<String>,
    /// Worker image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_image_id: Option<String>,
    /// Instance type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    /// Placement zone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    /// Key pair name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyname: Option<String>,
    /// Private key path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_location: Option<PathBuf>,
    /// Durable volume id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    /// Volume device path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_device: Option<String>,
    /// Volume partition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_partition: Option<String>,
}

/// Settings for one cluster, fixed at construction
///
/// Fields mirror [`Setting`]. Required-ness is not enforced here; see
/// [`CLUSTER_SETTINGS`] and [`crate::validate`].
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterConfig {
    /// Template name this config was built from
    pub profile: Option<String>,
    /// Provider access key id
    pub aws_access_key_id: Option<String>,
    /// Provider secret access key
    pub aws_secret_access_key: Option<String>,
    /// Provider account id
    pub aws_user_id: Option<String>,
    /// Correlation key for all provider lookups
    pub cluster_tag: String,
    /// Free-form description
    pub cluster_description: Option<String>,
    /// Total node count including the master
    pub cluster_size: Option<u32>,
    /// Login user
    pub cluster_user: Option<String>,
    /// Login shell
    pub cluster_shell: Option<String>,
    /// Master image; the node image is used when absent
    pub master_image_id: Option<String>,
    /// Worker image
    pub node_image_id: Option<String>,
    /// Instance type
    pub instance_type: Option<String>,
    /// Placement zone
    pub availability_zone: Option<String>,
    /// Key pair name
    pub keyname: Option<String>,
    /// Private key path
    pub key_location: Option<PathBuf>,
    /// Durable volume id
    pub volume: Option<String>,
    /// Volume device path
    pub volume_device: Option<String>,
    /// Volume partition
    pub volume_partition: Option<String>,
}

impl ClusterConfig {
    /// Build a config from a template and credentials
    ///
    /// The cluster tag is taken from the template or generated from the
    /// current time, and never changes afterwards.
    pub fn from_template(
        profile: Option<&str>,
        credentials: AwsCredentials,
        template: ClusterTemplate,
    ) -> Self {
        Self {
            profile: profile.map(str::to_string),
            aws_access_key_id: credentials.aws_access_key_id,
            aws_secret_access_key: credentials.aws_secret_access_key,
            aws_user_id: credentials.aws_user_id,
            cluster_tag: template.cluster_tag.unwrap_or_else(default_cluster_tag),
            cluster_description: template.cluster_description,
            cluster_size: template.cluster_size,
            cluster_user: template.cluster_user,
            cluster_shell: template.cluster_shell,
            master_image_id: template.master_image_id,
            node_image_id: template.node_image_id,
            instance_type: template.instance_type,
            availability_zone: template.availability_zone,
            keyname: template.keyname,
            key_location: template.key_location,
            volume: template.volume,
            volume_device: template.volume_device,
            volume_partition: template.volume_partition,
        }
    }

    /// Whether a setting has a value
    pub fn is_set(&self, setting: Setting) -> bool {
        match setting {
            Setting::AwsAccessKeyId => self.aws_access_key_id.is_some(),
            Setting::AwsSecretAccessKey => self.aws_secret_access_key.is_some(),
            Setting::AwsUserId => self.aws_user_id.is_some(),
            Setting::ClusterTag => !self.cluster_tag.is_empty(),
            Setting::ClusterDescription => self.cluster_description.is_some(),
            Setting::ClusterSize => self.cluster_size.is_some(),
            Setting::ClusterUser => self.cluster_user.is_some(),
            Setting::ClusterShell => self.cluster_shell.is_some(),
            Setting::MasterImageId => self.master_image_id.is_some(),
            Setting::NodeImageId => self.node_image_id.is_some(),
            Setting::InstanceType => self.instance_type.is_some(),
            Setting::AvailabilityZone => self.availability_zone.is_some(),
            Setting::Keyname => self.keyname.is_some(),
            Setting::KeyLocation => self.key_location.is_some(),
            Setting::Volume => self.volume.is_some(),
            Setting::VolumeDevice => self.volume_device.is_some(),
            Setting::VolumePartition => self.volume_partition.is_some(),
        }
    }

    /// Required settings that have no value, in schema order
    pub fn missing_settings(&self) -> Vec<Setting> {
        CLUSTER_SETTINGS
            .iter()
            .filter(|spec| spec.required && !self.is_set(spec.setting))
            .map(|spec| spec.setting)
            .collect()
    }

    /// Image the master is launched from
    pub fn effective_master_image(&self) -> Option<&str> {
        self.master_image_id
            .as_deref()
            .or(self.node_image_id.as_deref())
    }

    /// The master image, only when it differs from the node image
    pub fn distinct_master_image(&self) -> Option<&str> {
        match (self.master_image_id.as_deref(), self.node_image_id.as_deref()) {
            (Some(master), Some(node)) if master == node => None,
            (master, _) => master,
        }
    }

    /// Name of the security group that scopes this cluster's nodes
    pub fn security_group_name(&self) -> String {
        catalog::security_group_name(&self.cluster_tag)
    }
}

/// Tag used when a cluster does not name one: local time to the minute
pub fn default_cluster_tag() -> String {
    chrono::Local::now().format("%Y%m%d%H%M").to_string()
}

/// A parsed settings file
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Credentials shared by every cluster template
    #[serde(default)]
    pub aws: AwsCredentials,
    /// Cluster templates by name
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterTemplate>,
    #[serde(skip)]
    path: PathBuf,
}

impl ConfigFile {
    /// Load and parse a settings file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config_file(path, format!("failed to read: {e}")))?;
        Self::parse(path, &content)
    }

    /// Parse settings from YAML; `path` is only used in error messages
    pub fn parse(path: impl AsRef<Path>, content: &str) -> Result<Self> {
        let path = path.as_ref();
        let mut file: ConfigFile = serde_yaml::from_str(content)
            .map_err(|e| Error::config_file(path, format!("invalid YAML: {e}")))?;
        file.path = path.to_path_buf();
        Ok(file)
    }

    /// Names of all cluster templates
    pub fn cluster_names(&self) -> impl Iterator<Item = &str> {
        self.clusters.keys().map(String::as_str)
    }

    /// Build the config for a named template
    ///
    /// Credentials missing from the file are taken from the environment.
    pub fn cluster(&self, name: &str) -> Result<ClusterConfig> {
        self.cluster_with_credentials(name, AwsCredentials::from_env())
    }

    /// Build the config for a named template with explicit fallback credentials
    pub fn cluster_with_credentials(
        &self,
        name: &str,
        fallback: AwsCredentials,
    ) -> Result<ClusterConfig> {
        let template = self.clusters.get(name).cloned().ok_or_else(|| {
            let known = self.cluster_names().collect::<Vec<_>>().join(", ");
            Error::config_file(
                &self.path,
                format!("no cluster template named '{name}' (known: {known})"),
            )
        })?;
        let credentials = self.aws.clone().or(fallback);
        Ok(ClusterConfig::from_template(
            Some(name),
            credentials,
            template,
        ))
    }
}
