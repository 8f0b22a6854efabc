//! Cluster configuration validation
//!
//! [`ConfigValidator`] checks a [`ClusterConfig`] against the schema and
//! against live provider lookups before anything is launched. Every check is
//! independent and callable on its own; [`ConfigValidator::validate`] runs them
//! all in a fixed order and accumulates the failures into one report.
//!
//! A check whose inputs are missing is skipped, since the gap is already
//! reported by the completeness check. When the provider rejects the
//! credentials, the checks that need provider lookups are skipped too.

use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, warn};

use crate::catalog::{self, Architecture};
use crate::config::{ClusterConfig, Setting};
use crate::provider::ProviderGateway;
use crate::{Error, Result};

/// One failed validation check
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationFailure {
    /// A required setting has no value
    #[error("missing required setting {0}")]
    MissingSetting(Setting),

    /// The provider rejected the credentials
    #[error("invalid aws_access_key_id/aws_secret_access_key combination: {0}")]
    InvalidCredentials(String),

    /// The provider did not answer the credential probe
    #[error("provider is unavailable, retry later: {0}")]
    ProviderUnavailable(String),

    /// The key pair is not registered with the provider
    #[error("account does not contain a key pair named {0}")]
    UnknownKeyPair(String),

    /// The private key file does not exist
    #[error("key_location {} does not exist", .0.display())]
    KeyFileMissing(PathBuf),

    /// The private key path is not a regular file
    #[error("key_location {} is not a file", .0.display())]
    KeyFileNotRegular(PathBuf),

    /// The cluster would have no nodes
    #[error("cluster_size must be a positive integer, got {0}")]
    InvalidSize(u32),

    /// The zone is not offered by the provider
    #[error("availability_zone {0} does not exist")]
    UnknownZone(String),

    /// The zone exists but does not accept instances
    #[error("availability_zone {zone} is not available at this time (state: {state})")]
    ZoneUnavailable {
        /// Zone name
        zone: String,
        /// Reported state
        state: String,
    },

    /// The volume does not exist
    #[error("volume {0} does not exist")]
    UnknownVolume(String),

    /// A volume is configured without a device
    #[error("volume_device must be set when volume is set")]
    VolumeDeviceMissing,

    /// A volume is configured without a partition
    #[error("volume_partition must be set when volume is set")]
    VolumePartitionMissing,

    /// The volume lives in a different zone than the cluster
    #[error(
        "volume {volume} is only available in zone {volume_zone} but availability_zone is {zone}; \
         change availability_zone or create a new volume in {zone}"
    )]
    VolumeZoneMismatch {
        /// Volume id
        volume: String,
        /// Zone the volume lives in
        volume_zone: String,
        /// Configured zone
        zone: String,
    },

    /// The node image does not exist
    #[error("node_image_id {0} does not exist")]
    UnknownNodeImage(String),

    /// The master image does not exist
    #[error("master_image_id {0} does not exist")]
    UnknownMasterImage(String),

    /// The instance type is not in the catalog
    #[error("unknown instance_type {0}, expected one of: {}", known_instance_types())]
    UnknownInstanceType(String),

    /// The instance type cannot run the image
    #[error(
        "instance_type {instance_type} is for a {expected} platform while image {image_id} is a {found} platform"
    )]
    ArchitectureMismatch {
        /// Configured instance type
        instance_type: String,
        /// Image that does not fit it
        image_id: String,
        /// Architecture of the instance type
        expected: Architecture,
        /// Architecture of the image
        found: Architecture,
    },

    /// The shell cannot be configured on the nodes
    #[error("cluster_shell {0} is not supported, expected one of: {}", catalog::SUPPORTED_SHELLS.join(", "))]
    UnsupportedShell(String),
}

fn known_instance_types() -> String {
    catalog::instance_types().collect::<Vec<_>>().join(", ")
}

/// Outcome of a full validation run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Failed checks in check order
    pub failures: Vec<ValidationFailure>,
}

impl ValidationReport {
    /// Whether no check failed
    pub fn is_valid(&self) -> bool {
        self.failures.is_empty()
    }

    /// Turn a failing report into [`Error::Configuration`]
    pub fn into_result(self, cluster: &str) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::configuration(cluster, self.failures))
        }
    }
}

/// Validates one cluster config against the schema and the provider
pub struct ConfigValidator<'a> {
    config: &'a ClusterConfig,
    gateway: &'a dyn ProviderGateway,
}

impl<'a> ConfigValidator<'a> {
    /// Create a validator
    pub fn new(config: &'a ClusterConfig, gateway: &'a dyn ProviderGateway) -> Self {
        Self { config, gateway }
    }

    /// Run every check and collect the failures
    pub async fn validate(&self) -> ValidationReport {
        let mut failures = self.check_required_settings();

        let credentials = self.check_credentials().await;
        let connected = !credentials
            .iter()
            .any(|f| matches!(f, ValidationFailure::InvalidCredentials(_)));
        failures.extend(credentials);

        if connected {
            failures.extend(self.check_key_pair().await);
        }
        failures.extend(self.check_key_file().await);
        failures.extend(self.check_size());
        if connected {
            failures.extend(self.check_zone().await);
            failures.extend(self.check_volume().await);
            failures.extend(self.check_images().await);
            failures.extend(self.check_instance_type().await);
        }
        failures.extend(self.check_shell());

        debug!(
            cluster = %self.config.cluster_tag,
            failures = failures.len(),
            "validation finished"
        );
        ValidationReport { failures }
    }

    /// Every required setting has a value
    pub fn check_required_settings(&self) -> Vec<ValidationFailure> {
        self.config
            .missing_settings()
            .into_iter()
            .map(ValidationFailure::MissingSetting)
            .collect()
    }

    /// The provider accepts the credentials
    ///
    /// A throttled probe says nothing about the credentials and is reported
    /// as [`ValidationFailure::ProviderUnavailable`].
    pub async fn check_credentials(&self) -> Vec<ValidationFailure> {
        match self.gateway.list_all_instances().await {
            Ok(_) => Vec::new(),
            Err(e) if e.is_retryable() => {
                warn!(cluster = %self.config.cluster_tag, error = %e, "credential probe throttled");
                vec![ValidationFailure::ProviderUnavailable(e.to_string())]
            }
            Err(e) => {
                warn!(cluster = %self.config.cluster_tag, error = %e, "credential probe failed");
                vec![ValidationFailure::InvalidCredentials(e.to_string())]
            }
        }
    }

    /// The key pair is registered with the provider
    pub async fn check_key_pair(&self) -> Vec<ValidationFailure> {
        let Some(keyname) = &self.config.keyname else {
            return Vec::new();
        };
        match self
            .gateway
            .describe_key_pairs(std::slice::from_ref(keyname))
            .await
        {
            Ok(pairs) if pairs.iter().any(|p| &p.name == keyname) => Vec::new(),
            Ok(_) => vec![ValidationFailure::UnknownKeyPair(keyname.clone())],
            Err(e) => {
                warn!(keyname = %keyname, error = %e, "key pair lookup failed");
                vec![ValidationFailure::UnknownKeyPair(keyname.clone())]
            }
        }
    }

    /// The private key file exists and is a regular file
    pub async fn check_key_file(&self) -> Vec<ValidationFailure> {
        let Some(path) = &self.config.key_location else {
            return Vec::new();
        };
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Vec::new(),
            Ok(_) => vec![ValidationFailure::KeyFileNotRegular(path.clone())],
            Err(_) => vec![ValidationFailure::KeyFileMissing(path.clone())],
        }
    }

    /// The cluster has at least one node
    pub fn check_size(&self) -> Vec<ValidationFailure> {
        match self.config.cluster_size {
            Some(0) => vec![ValidationFailure::InvalidSize(0)],
            _ => Vec::new(),
        }
    }

    /// The configured zone exists and is available
    pub async fn check_zone(&self) -> Vec<ValidationFailure> {
        let Some(zone) = &self.config.availability_zone else {
            return Vec::new();
        };
        let zones = match self.gateway.describe_zones().await {
            Ok(zones) => zones,
            Err(e) => {
                warn!(zone = %zone, error = %e, "zone lookup failed");
                return vec![ValidationFailure::UnknownZone(zone.clone())];
            }
        };
        match zones.iter().find(|z| &z.name == zone) {
            None => vec![ValidationFailure::UnknownZone(zone.clone())],
            Some(info) if !info.is_available() => vec![ValidationFailure::ZoneUnavailable {
                zone: zone.clone(),
                state: info.state.clone(),
            }],
            Some(_) => Vec::new(),
        }
    }

    /// The volume exists, is fully specified and lives in the cluster's zone
    pub async fn check_volume(&self) -> Vec<ValidationFailure> {
        let Some(volume) = &self.config.volume else {
            return Vec::new();
        };
        let mut failures = Vec::new();

        let resolved = match self
            .gateway
            .describe_volumes(std::slice::from_ref(volume))
            .await
        {
            Ok(volumes) => volumes.into_iter().find(|v| &v.volume_id == volume),
            Err(e) => {
                warn!(volume = %volume, error = %e, "volume lookup failed");
                None
            }
        };
        if resolved.is_none() {
            failures.push(ValidationFailure::UnknownVolume(volume.clone()));
        }
        if self.config.volume_device.is_none() {
            failures.push(ValidationFailure::VolumeDeviceMissing);
        }
        if self.config.volume_partition.is_none() {
            failures.push(ValidationFailure::VolumePartitionMissing);
        }
        if let (Some(info), Some(zone)) = (&resolved, &self.config.availability_zone) {
            if &info.zone != zone {
                failures.push(ValidationFailure::VolumeZoneMismatch {
                    volume: volume.clone(),
                    volume_zone: info.zone.clone(),
                    zone: zone.clone(),
                });
            }
        }
        failures
    }

    /// The node image and a distinct master image exist
    pub async fn check_images(&self) -> Vec<ValidationFailure> {
        let mut failures = Vec::new();
        if let Some(node) = &self.config.node_image_id {
            if self.image_architecture(node).await.is_none() {
                failures.push(ValidationFailure::UnknownNodeImage(node.clone()));
            }
        }
        if let Some(master) = self.config.distinct_master_image() {
            if self.image_architecture(master).await.is_none() {
                failures.push(ValidationFailure::UnknownMasterImage(master.to_string()));
            }
        }
        failures
    }

    /// The instance type is known and can run the configured images
    ///
    /// Images that do not resolve are reported by [`Self::check_images`] and
    /// skipped here.
    pub async fn check_instance_type(&self) -> Vec<ValidationFailure> {
        let Some(instance_type) = &self.config.instance_type else {
            return Vec::new();
        };
        let Some(expected) = catalog::instance_architecture(instance_type) else {
            return vec![ValidationFailure::UnknownInstanceType(
                instance_type.clone(),
            )];
        };

        let images = self
            .config
            .node_image_id
            .as_deref()
            .into_iter()
            .chain(self.config.distinct_master_image());

        let mut failures = Vec::new();
        for image_id in images {
            match self.image_architecture(image_id).await {
                Some(found) if found != expected => {
                    failures.push(ValidationFailure::ArchitectureMismatch {
                        instance_type: instance_type.clone(),
                        image_id: image_id.to_string(),
                        expected,
                        found,
                    });
                }
                _ => {}
            }
        }
        failures
    }

    /// The login shell is supported
    pub fn check_shell(&self) -> Vec<ValidationFailure> {
        match &self.config.cluster_shell {
            Some(shell) if !catalog::is_supported_shell(shell) => {
                vec![ValidationFailure::UnsupportedShell(shell.clone())]
            }
            _ => Vec::new(),
        }
    }

    async fn image_architecture(&self, image_id: &str) -> Option<Architecture> {
        let ids = [image_id.to_string()];
        match self.gateway.describe_images(&ids).await {
            Ok(images) => images
                .into_iter()
                .find(|i| i.image_id == image_id)
                .map(|i| i.architecture),
            Err(e) => {
                warn!(image = %image_id, error = %e, "image lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        ImageInfo, KeyPairInfo, MockProviderGateway, ProviderError, SimulatedProvider,
        ZONE_AVAILABLE,
    };
    use crate::testing::{sample_config, valid_setup};

    // ==========================================================================
    // Story Tests: Validating a Cluster Before Launch
    // ==========================================================================

    /// Story: a complete config against a matching account is valid
    #[tokio::test]
    async fn story_complete_config_is_valid() {
        let (config, provider, _key) = valid_setup(2);
        let report = ConfigValidator::new(&config, &provider).validate().await;
        assert!(report.is_valid(), "unexpected failures: {:?}", report.failures);
        assert!(report.into_result(&config.cluster_tag).is_ok());
    }

    /// Story: each missing required setting is reported by name
    #[tokio::test]
    async fn story_missing_settings_are_itemized() {
        let (mut config, provider, _key) = valid_setup(2);
        config.keyname = None;
        config.cluster_user = None;

        let report = ConfigValidator::new(&config, &provider).validate().await;
        assert!(!report.is_valid());
        assert!(report
            .failures
            .contains(&ValidationFailure::MissingSetting(Setting::ClusterUser)));
        assert!(report
            .failures
            .contains(&ValidationFailure::MissingSetting(Setting::Keyname)));
        // the key pair check has no input and is skipped
        assert!(!report
            .failures
            .iter()
            .any(|f| matches!(f, ValidationFailure::UnknownKeyPair(_))));
    }

    /// Story: rejected credentials skip every provider lookup
    #[tokio::test]
    async fn story_rejected_credentials_short_circuit_lookups() {
        let mut gateway = MockProviderGateway::new();
        gateway
            .expect_list_all_instances()
            .times(1)
            .returning(|| Err(ProviderError::fatal("AuthFailure")));
        gateway.expect_describe_key_pairs().never();
        gateway.expect_describe_images().never();

        let (config, _provider, _key) = valid_setup(2);
        let report = ConfigValidator::new(&config, &gateway).validate().await;
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            report.failures[0],
            ValidationFailure::InvalidCredentials(_)
        ));
    }

    /// Story: a throttled credential probe is reported on its own and the
    /// provider lookups still run
    #[tokio::test]
    async fn story_throttled_credential_probe_keeps_checking() {
        let mut gateway = MockProviderGateway::new();
        gateway
            .expect_list_all_instances()
            .times(1)
            .returning(|| Err(ProviderError::transient("RequestLimitExceeded")));
        gateway.expect_describe_key_pairs().times(1).returning(|_| {
            Ok(vec![KeyPairInfo {
                name: "gsg-keypair".to_string(),
                fingerprint: "1f:51:ae".to_string(),
            }])
        });
        gateway.expect_describe_images().returning(|_| {
            Ok(vec![ImageInfo {
                image_id: "ami-node".to_string(),
                architecture: Architecture::X86_64,
            }])
        });

        let (config, _provider, _key) = valid_setup(2);
        let report = ConfigValidator::new(&config, &gateway).validate().await;
        assert_eq!(report.failures.len(), 2, "failures: {:?}", report.failures);
        assert!(matches!(
            report.failures[0],
            ValidationFailure::ProviderUnavailable(_)
        ));
        assert!(matches!(
            report.failures[1],
            ValidationFailure::ArchitectureMismatch { .. }
        ));
    }

    /// Story: a volume without a device fails an otherwise valid config
    #[tokio::test]
    async fn story_volume_without_device_fails_validation() {
        let (mut config, _, _key) = valid_setup(2);
        config.volume = Some("vol-1234".to_string());
        config.volume_partition = Some("/dev/sdz1".to_string());
        let provider = SimulatedProvider::mirroring(&config);

        let report = ConfigValidator::new(&config, &provider).validate().await;
        assert_eq!(report.failures, vec![ValidationFailure::VolumeDeviceMissing]);
        assert!(report.into_result(&config.cluster_tag).is_err());
    }

    /// Story: an image built for another architecture fails an otherwise
    /// valid config
    #[tokio::test]
    async fn story_architecture_mismatch_fails_validation() {
        let (config, _, _key) = valid_setup(2);
        let provider = SimulatedProvider::new()
            .with_key_pair("gsg-keypair")
            .with_image("ami-node", Architecture::X86_64);

        let report = ConfigValidator::new(&config, &provider).validate().await;
        assert_eq!(
            report.failures,
            vec![ValidationFailure::ArchitectureMismatch {
                instance_type: "m1.small".to_string(),
                image_id: "ami-node".to_string(),
                expected: Architecture::I386,
                found: Architecture::X86_64,
            }]
        );
        assert!(!report.is_valid());
    }

    /// Story: the validation error message names every failure
    #[tokio::test]
    async fn story_report_becomes_configuration_error() {
        let (mut config, provider, _key) = valid_setup(2);
        config.cluster_shell = Some("fish".to_string());
        config.cluster_size = Some(0);

        let report = ConfigValidator::new(&config, &provider).validate().await;
        assert_eq!(
            report.failures,
            vec![
                ValidationFailure::InvalidSize(0),
                ValidationFailure::UnsupportedShell("fish".to_string()),
            ]
        );
        let err = report.into_result(&config.cluster_tag).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(err.to_string().contains("fish"));
    }

    #[tokio::test]
    async fn test_unknown_key_pair() {
        let (config, _, _key) = valid_setup(2);
        let provider = SimulatedProvider::mirroring(&config);
        let mut other = config.clone();
        other.keyname = Some("someone-elses-key".to_string());

        let failures = ConfigValidator::new(&other, &provider)
            .check_key_pair()
            .await;
        assert_eq!(
            failures,
            vec![ValidationFailure::UnknownKeyPair(
                "someone-elses-key".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_key_file_checks() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sample_config(2);
        let provider = SimulatedProvider::mirroring(&config);

        config.key_location = Some(dir.path().join("absent.pem"));
        let failures = ConfigValidator::new(&config, &provider)
            .check_key_file()
            .await;
        assert!(matches!(failures[..], [ValidationFailure::KeyFileMissing(_)]));

        config.key_location = Some(dir.path().to_path_buf());
        let failures = ConfigValidator::new(&config, &provider)
            .check_key_file()
            .await;
        assert!(matches!(
            failures[..],
            [ValidationFailure::KeyFileNotRegular(_)]
        ));
    }

    #[tokio::test]
    async fn test_zone_must_exist_and_be_available() {
        let mut config = sample_config(2);
        config.availability_zone = Some("us-east-1b".to_string());
        let provider = SimulatedProvider::new().with_zone("us-east-1a", ZONE_AVAILABLE);

        let failures = ConfigValidator::new(&config, &provider).check_zone().await;
        assert_eq!(
            failures,
            vec![ValidationFailure::UnknownZone("us-east-1b".to_string())]
        );

        provider.set_zone_state("us-east-1b", "impaired");
        let failures = ConfigValidator::new(&config, &provider).check_zone().await;
        assert_eq!(
            failures,
            vec![ValidationFailure::ZoneUnavailable {
                zone: "us-east-1b".to_string(),
                state: "impaired".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_volume_without_device() {
        let mut config = sample_config(2);
        config.volume = Some("vol-1234".to_string());
        config.volume_device = None;
        config.volume_partition = Some("/dev/sdz1".to_string());
        let provider = SimulatedProvider::mirroring(&config);

        let failures = ConfigValidator::new(&config, &provider).check_volume().await;
        assert_eq!(failures, vec![ValidationFailure::VolumeDeviceMissing]);
    }

    #[tokio::test]
    async fn test_volume_in_other_zone() {
        let mut config = sample_config(2);
        config.volume = Some("vol-1234".to_string());
        config.volume_device = Some("/dev/sdz".to_string());
        config.volume_partition = Some("/dev/sdz1".to_string());
        config.availability_zone = Some("us-east-1a".to_string());
        let provider = SimulatedProvider::new()
            .with_zone("us-east-1a", ZONE_AVAILABLE)
            .with_volume("vol-1234", "us-west-2a");

        let failures = ConfigValidator::new(&config, &provider).check_volume().await;
        assert_eq!(
            failures,
            vec![ValidationFailure::VolumeZoneMismatch {
                volume: "vol-1234".to_string(),
                volume_zone: "us-west-2a".to_string(),
                zone: "us-east-1a".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_unknown_volume() {
        let mut config = sample_config(2);
        config.volume = Some("vol-missing".to_string());
        config.volume_device = Some("/dev/sdz".to_string());
        config.volume_partition = Some("/dev/sdz1".to_string());
        let provider = SimulatedProvider::new();

        let failures = ConfigValidator::new(&config, &provider).check_volume().await;
        assert_eq!(
            failures,
            vec![ValidationFailure::UnknownVolume("vol-missing".to_string())]
        );
    }

    #[tokio::test]
    async fn test_missing_images_are_reported_separately() {
        let mut config = sample_config(2);
        config.master_image_id = Some("ami-master".to_string());
        let provider = SimulatedProvider::new();

        let failures = ConfigValidator::new(&config, &provider).check_images().await;
        assert_eq!(
            failures,
            vec![
                ValidationFailure::UnknownNodeImage("ami-node".to_string()),
                ValidationFailure::UnknownMasterImage("ami-master".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_architecture_mismatch() {
        let config = sample_config(2);
        let provider = SimulatedProvider::new().with_image("ami-node", Architecture::X86_64);

        let failures = ConfigValidator::new(&config, &provider)
            .check_instance_type()
            .await;
        assert_eq!(
            failures,
            vec![ValidationFailure::ArchitectureMismatch {
                instance_type: "m1.small".to_string(),
                image_id: "ami-node".to_string(),
                expected: Architecture::I386,
                found: Architecture::X86_64,
            }]
        );
        assert!(failures[0].to_string().contains("i386"));
    }

    #[tokio::test]
    async fn test_unknown_instance_type_lists_options() {
        let mut config = sample_config(2);
        config.instance_type = Some("m9.gigantic".to_string());
        let provider = SimulatedProvider::mirroring(&config);

        let failures = ConfigValidator::new(&config, &provider)
            .check_instance_type()
            .await;
        assert_eq!(
            failures,
            vec![ValidationFailure::UnknownInstanceType(
                "m9.gigantic".to_string()
            )]
        );
        assert!(failures[0].to_string().contains("m1.small"));
    }

    #[test]
    fn test_size_and_shell() {
        let mut config = sample_config(2);
        let provider = SimulatedProvider::new();
        let validator = ConfigValidator::new(&config, &provider);
        assert!(validator.check_size().is_empty());
        assert!(validator.check_shell().is_empty());

        config.cluster_shell = Some("fish".to_string());
        let validator = ConfigValidator::new(&config, &provider);
        assert_eq!(
            validator.check_shell(),
            vec![ValidationFailure::UnsupportedShell("fish".to_string())]
        );
    }
}
