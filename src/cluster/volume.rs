//! Durable volume attachment
//!
//! The volume is attached to the master node and polled until the provider
//! reports it `in-use` with an `attached` attachment record for the intended
//! instance. Records that name a different volume or instance fail the
//! attachment outright; anything else short of attached is polled again.

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::list_group_nodes;
use crate::config::{ClusterConfig, Setting};
use crate::provider::{
    NodeView, ProviderGateway, ProviderResult, VolumeAttachment, VolumeInfo, ATTACHMENT_ATTACHED,
    VOLUME_IN_USE,
};
use crate::validate::ValidationFailure;
use crate::wait::{poll_until, PollResult};
use crate::{Error, Result};

/// Where an attachment stands
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttachState {
    /// Nothing requested yet
    Unattached,
    /// The attach call was accepted
    AttachRequested,
    /// Waiting for the provider to report the attachment
    Polling,
    /// The volume is usable on the master
    Attached,
    /// The attachment cannot complete
    Failed(String),
}

impl fmt::Display for AttachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unattached => write!(f, "unattached"),
            Self::AttachRequested => write!(f, "attach-requested"),
            Self::Polling => write!(f, "polling"),
            Self::Attached => write!(f, "attached"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// What one `describe_volumes` response says about the intended attachment
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VolumeObservation {
    /// In use and attached to the intended instance
    Attached,
    /// Not there yet
    Pending,
    /// The response cannot describe the intended attachment
    Malformed(String),
}

/// Interpret a `describe_volumes` response for `volume_id` on `instance_id`
pub fn observe_attachment(
    volumes: &[VolumeInfo],
    volume_id: &str,
    instance_id: &str,
) -> VolumeObservation {
    let volume = match volumes {
        [volume] if volume.volume_id == volume_id => volume,
        [volume] => {
            return VolumeObservation::Malformed(format!(
                "expected volume {volume_id}, provider described {}",
                volume.volume_id
            ))
        }
        _ => {
            return VolumeObservation::Malformed(format!(
                "expected one volume, provider described {}",
                volumes.len()
            ))
        }
    };

    let Some(attachment) = volume.attachments.first() else {
        return VolumeObservation::Pending;
    };
    if attachment.volume_id != volume_id || attachment.instance_id != instance_id {
        return VolumeObservation::Malformed(format!(
            "attachment record is for volume {} on {}, expected {volume_id} on {instance_id}",
            attachment.volume_id, attachment.instance_id
        ));
    }

    if volume.status == VOLUME_IN_USE && attachment.status == ATTACHMENT_ATTACHED {
        VolumeObservation::Attached
    } else {
        VolumeObservation::Pending
    }
}

/// Current attachment record of a volume, if any
pub async fn current_attachment(
    gateway: &dyn ProviderGateway,
    volume_id: &str,
) -> ProviderResult<Option<VolumeAttachment>> {
    let volumes = gateway.describe_volumes(&[volume_id.to_string()]).await?;
    Ok(volumes
        .into_iter()
        .find(|v| v.volume_id == volume_id)
        .and_then(|v| v.attachments.into_iter().next()))
}

/// Attaches the configured volume to the master node
pub struct VolumeAttachmentController<'a> {
    config: &'a ClusterConfig,
    gateway: &'a dyn ProviderGateway,
    interval: Duration,
    state: AttachState,
}

impl<'a> VolumeAttachmentController<'a> {
    /// Create a controller polling every `interval`
    pub fn new(
        config: &'a ClusterConfig,
        gateway: &'a dyn ProviderGateway,
        interval: Duration,
    ) -> Self {
        Self {
            config,
            gateway,
            interval,
            state: AttachState::Unattached,
        }
    }

    /// Current state
    pub fn state(&self) -> &AttachState {
        &self.state
    }

    /// Attach the volume to the master and wait until it is attached
    ///
    /// Does nothing when no volume is configured.
    pub async fn attach(&mut self, cancel: &CancellationToken) -> Result<()> {
        let Some(volume) = self.config.volume.clone() else {
            return Ok(());
        };
        let result = self.run(&volume, cancel).await;
        if let Err(e) = &result {
            self.transition(AttachState::Failed(e.to_string()));
        }
        result
    }

    async fn run(&mut self, volume: &str, cancel: &CancellationToken) -> Result<()> {
        let config = self.config;
        let tag = &config.cluster_tag;
        let device = config.volume_device.clone().ok_or_else(|| {
            Error::configuration(
                tag,
                vec![ValidationFailure::MissingSetting(Setting::VolumeDevice)],
            )
        })?;

        let master = self.master().await?;
        info!(
            cluster = %tag,
            volume = %volume,
            instance = %master.instance_id,
            device = %device,
            "attaching volume to master"
        );
        self.gateway
            .attach_volume(volume, &master.instance_id, &device)
            .await
            .map_err(|e| Error::provider(tag, "attach volume", e))?;
        self.transition(AttachState::AttachRequested);

        self.transition(AttachState::Polling);
        let instance = master.instance_id.as_str();
        poll_until(cancel, self.interval, "volume attachment", || {
            self.poll_once(volume, instance)
        })
        .await?;

        self.transition(AttachState::Attached);
        info!(cluster = %tag, volume = %volume, "volume attached");
        Ok(())
    }

    async fn poll_once(&self, volume: &str, instance: &str) -> PollResult<()> {
        let volumes = match self.gateway.describe_volumes(&[volume.to_string()]).await {
            Ok(volumes) => volumes,
            Err(e) if e.is_retryable() => {
                warn!(volume = %volume, error = %e, "volume status unavailable, retrying");
                return Ok(None);
            }
            Err(e) => {
                return Err(Error::provider(
                    &self.config.cluster_tag,
                    "describe volume",
                    e,
                ))
            }
        };
        match observe_attachment(&volumes, volume, instance) {
            VolumeObservation::Attached => Ok(Some(())),
            VolumeObservation::Pending => {
                debug!(volume = %volume, "volume not attached yet");
                Ok(None)
            }
            VolumeObservation::Malformed(reason) => Err(Error::volume_attachment(volume, reason)),
        }
    }

    async fn master(&self) -> Result<NodeView> {
        let tag = &self.config.cluster_tag;
        let nodes = list_group_nodes(self.gateway, &self.config.security_group_name())
            .await
            .map_err(|e| Error::provider(tag, "resolve master", e))?;
        nodes.into_iter().find(NodeView::is_active).ok_or_else(|| {
            Error::volume_attachment(
                self.config.volume.as_deref().unwrap_or_default(),
                "cluster has no active master node",
            )
        })
    }

    fn transition(&mut self, next: AttachState) {
        debug!(from = %self.state, to = %next, "volume attachment state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        MockProviderGateway, ProviderError, SimulatedProvider, ATTACHMENT_ATTACHING,
    };
    use crate::testing::{fast_options, launched, sample_config};

    fn info(volume: &str, status: &str, attachment: Option<(&str, &str, &str)>) -> VolumeInfo {
        VolumeInfo {
            volume_id: volume.to_string(),
            zone: "us-east-1a".to_string(),
            status: status.to_string(),
            attachments: attachment
                .map(|(vol, instance, status)| VolumeAttachment {
                    volume_id: vol.to_string(),
                    instance_id: instance.to_string(),
                    device: "/dev/sdz".to_string(),
                    status: status.to_string(),
                })
                .into_iter()
                .collect(),
        }
    }

    fn volume_config() -> ClusterConfig {
        let mut config = sample_config(2);
        config.volume = Some("vol-1".to_string());
        config.volume_device = Some("/dev/sdz".to_string());
        config.volume_partition = Some("/dev/sdz1".to_string());
        config
    }

    #[test]
    fn test_observe_attachment() {
        let attached = [info("vol-1", "in-use", Some(("vol-1", "i-1", "attached")))];
        assert_eq!(
            observe_attachment(&attached, "vol-1", "i-1"),
            VolumeObservation::Attached
        );

        let attaching = [info("vol-1", "in-use", Some(("vol-1", "i-1", ATTACHMENT_ATTACHING)))];
        assert_eq!(
            observe_attachment(&attaching, "vol-1", "i-1"),
            VolumeObservation::Pending
        );

        let no_record = [info("vol-1", "available", None)];
        assert_eq!(
            observe_attachment(&no_record, "vol-1", "i-1"),
            VolumeObservation::Pending
        );
    }

    #[test]
    fn test_observe_attachment_rejects_mismatches() {
        let other_instance = [info("vol-1", "in-use", Some(("vol-1", "i-2", "attached")))];
        assert!(matches!(
            observe_attachment(&other_instance, "vol-1", "i-1"),
            VolumeObservation::Malformed(_)
        ));

        let other_volume = [info("vol-2", "in-use", None)];
        assert!(matches!(
            observe_attachment(&other_volume, "vol-1", "i-1"),
            VolumeObservation::Malformed(_)
        ));

        assert!(matches!(
            observe_attachment(&[], "vol-1", "i-1"),
            VolumeObservation::Malformed(_)
        ));
    }

    #[tokio::test]
    async fn test_attach_to_master_until_attached() {
        let config = volume_config();
        let provider = SimulatedProvider::mirroring(&config);
        let reservations = launched(&config, &provider).await;
        let interval = fast_options().volume_poll_interval;

        let mut controller = VolumeAttachmentController::new(&config, &provider, interval);
        controller.attach(&CancellationToken::new()).await.unwrap();
        assert_eq!(controller.state(), &AttachState::Attached);

        let attachment = current_attachment(&provider, "vol-1").await.unwrap().unwrap();
        assert_eq!(attachment.instance_id, reservations.master.instance_ids[0]);
    }

    #[tokio::test]
    async fn test_no_volume_is_a_no_op() {
        let config = sample_config(2);
        let gateway = MockProviderGateway::new();
        let mut controller =
            VolumeAttachmentController::new(&config, &gateway, Duration::from_millis(1));
        controller.attach(&CancellationToken::new()).await.unwrap();
        assert_eq!(controller.state(), &AttachState::Unattached);
    }

    #[tokio::test]
    async fn test_without_master_fails() {
        let config = volume_config();
        let provider = SimulatedProvider::mirroring(&config);
        let mut controller =
            VolumeAttachmentController::new(&config, &provider, Duration::from_millis(1));

        let err = controller
            .attach(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VolumeAttachment { .. }));
        assert!(matches!(controller.state(), AttachState::Failed(_)));
    }

    #[tokio::test]
    async fn test_attachment_to_wrong_instance_fails() {
        let config = volume_config();
        let mut gateway = MockProviderGateway::new();
        gateway.expect_describe_security_group().returning(|name| {
            Ok(crate::provider::SecurityGroupHandle {
                name: name.to_string(),
                group_id: "sg-1".to_string(),
            })
        });
        gateway.expect_list_instances_in_group().returning(|_| {
            Ok(vec![NodeView {
                instance_id: "i-master".to_string(),
                hostname: Some("master.example".to_string()),
                state: crate::provider::NodeState::Running,
            }])
        });
        gateway.expect_attach_volume().times(1).returning(|_, _, _| Ok(()));
        let mut calls = 0;
        gateway.expect_describe_volumes().returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(ProviderError::transient("RequestLimitExceeded"))
            } else {
                Ok(vec![info("vol-1", "in-use", Some(("vol-1", "i-other", "attached")))])
            }
        });

        let mut controller =
            VolumeAttachmentController::new(&config, &gateway, Duration::from_millis(1));
        let err = controller
            .attach(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("i-other"));
        assert!(!err.is_retryable());
    }
}
