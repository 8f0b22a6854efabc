//! In-memory provider for local runs and tests
//!
//! Behaves like an eventually consistent compute API: launched instances stay
//! `pending` for a configurable number of list calls, volume attach and detach
//! settle one describe call after they are requested, and terminated
//! instances linger as `shutting-down` before turning `terminated`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    ImageInfo, KeyPairInfo, LaunchRequest, NodeState, NodeView, ProviderError, ProviderGateway,
    ProviderResult, ReservationHandle, ResourceKind, SecurityGroupHandle, VolumeAttachment,
    VolumeInfo, ZoneInfo, ATTACHMENT_ATTACHED, ATTACHMENT_ATTACHING, VOLUME_AVAILABLE,
    VOLUME_IN_USE, ZONE_AVAILABLE,
};
use crate::catalog::{self, Architecture};
use crate::config::ClusterConfig;

const DEFAULT_ZONE: &str = "us-east-1a";
const DETACHING: &str = "detaching";

#[derive(Debug)]
struct Instance {
    id: String,
    hostname: String,
    state: NodeState,
    groups: Vec<String>,
    boots_in: u32,
}

impl Instance {
    fn view(&self) -> NodeView {
        NodeView {
            instance_id: self.id.clone(),
            hostname: (self.state == NodeState::Running).then(|| self.hostname.clone()),
            state: self.state,
        }
    }
}

#[derive(Debug)]
struct Volume {
    zone: String,
    status: String,
    attachment: Option<VolumeAttachment>,
}

impl Volume {
    fn info(&self, id: &str) -> VolumeInfo {
        VolumeInfo {
            volume_id: id.to_string(),
            zone: self.zone.clone(),
            status: self.status.clone(),
            attachments: self.attachment.iter().cloned().collect(),
        }
    }

    /// Move an in-flight attach or detach one step forward
    fn settle(&mut self) {
        let Some(attachment) = self.attachment.as_mut() else {
            return;
        };
        if attachment.status == ATTACHMENT_ATTACHING {
            attachment.status = ATTACHMENT_ATTACHED.to_string();
        } else if attachment.status == DETACHING {
            self.attachment = None;
            self.status = VOLUME_AVAILABLE.to_string();
        }
    }
}

#[derive(Debug, Default)]
struct State {
    key_pairs: BTreeMap<String, KeyPairInfo>,
    images: BTreeMap<String, Architecture>,
    zones: Vec<ZoneInfo>,
    volumes: BTreeMap<String, Volume>,
    groups: BTreeMap<String, SecurityGroupHandle>,
    instances: Vec<Instance>,
    next_id: u64,
    capacity: Option<u32>,
    boot_polls: u32,
    fixed_hostname: Option<String>,
    auth_failure: bool,
    launches: Vec<LaunchRequest>,
    terminated: Vec<String>,
    detach_requests: Vec<String>,
}

impl State {
    fn authorize(&self) -> ProviderResult<()> {
        if self.auth_failure {
            return Err(ProviderError::fatal(
                "AuthFailure: AWS was not able to validate the provided access credentials",
            ));
        }
        Ok(())
    }

    fn allocate_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:08x}", self.next_id)
    }

    fn active_count(&self) -> u32 {
        self.instances.iter().filter(|i| i.state.is_active()).count() as u32
    }
}

/// In-memory [`ProviderGateway`]
///
/// Seed it with the resources a test needs:
///
/// ```text
/// let provider = SimulatedProvider::new()
///     .with_key_pair("gsg-keypair")
///     .with_image("ami-0330d16a", Architecture::I386)
///     .with_zone("us-east-1a", "available");
/// ```
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    state: Mutex<State>,
}

impl SimulatedProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider holding exactly the resources `config` refers to
    ///
    /// Images get the architecture of the configured instance type and every
    /// instance reports `localhost` as its hostname.
    pub fn mirroring(config: &ClusterConfig) -> Self {
        let architecture = config
            .instance_type
            .as_deref()
            .and_then(catalog::instance_architecture)
            .unwrap_or(Architecture::X86_64);
        let zone = config
            .availability_zone
            .clone()
            .unwrap_or_else(|| DEFAULT_ZONE.to_string());

        let mut provider = Self::new()
            .with_zone(&zone, ZONE_AVAILABLE)
            .with_hostname("localhost");
        if let Some(keyname) = &config.keyname {
            provider = provider.with_key_pair(keyname);
        }
        for image in [&config.node_image_id, &config.master_image_id]
            .into_iter()
            .flatten()
        {
            provider = provider.with_image(image, architecture);
        }
        if let Some(volume) = &config.volume {
            provider = provider.with_volume(volume, &zone);
        }
        provider
    }

    /// Register a key pair
    pub fn with_key_pair(self, name: &str) -> Self {
        self.state.lock().key_pairs.insert(
            name.to_string(),
            KeyPairInfo {
                name: name.to_string(),
                fingerprint: format!("sim:{name}"),
            },
        );
        self
    }

    /// Register an image
    pub fn with_image(self, image_id: &str, architecture: Architecture) -> Self {
        self.state
            .lock()
            .images
            .insert(image_id.to_string(), architecture);
        self
    }

    /// Register a zone in the given state
    pub fn with_zone(self, name: &str, state: &str) -> Self {
        self.set_zone_state(name, state);
        self
    }

    /// Register a detached volume in a zone
    pub fn with_volume(self, volume_id: &str, zone: &str) -> Self {
        self.state.lock().volumes.insert(
            volume_id.to_string(),
            Volume {
                zone: zone.to_string(),
                status: VOLUME_AVAILABLE.to_string(),
                attachment: None,
            },
        );
        self
    }

    /// Limit how many active instances the account may run
    pub fn with_capacity(self, capacity: u32) -> Self {
        self.state.lock().capacity = Some(capacity);
        self
    }

    /// Keep new instances pending for this many group listings
    pub fn with_boot_polls(self, polls: u32) -> Self {
        self.state.lock().boot_polls = polls;
        self
    }

    /// Report the same hostname for every instance
    pub fn with_hostname(self, hostname: &str) -> Self {
        self.state.lock().fixed_hostname = Some(hostname.to_string());
        self
    }

    /// Add or update a zone
    pub fn set_zone_state(&self, name: &str, state: &str) {
        let mut guard = self.state.lock();
        match guard.zones.iter_mut().find(|z| z.name == name) {
            Some(zone) => zone.state = state.to_string(),
            None => guard.zones.push(ZoneInfo {
                name: name.to_string(),
                state: state.to_string(),
            }),
        }
    }

    /// Make every call fail as if the credentials were rejected
    pub fn set_auth_failure(&self, failing: bool) {
        self.state.lock().auth_failure = failing;
    }

    /// Launch requests received so far
    pub fn launch_requests(&self) -> Vec<LaunchRequest> {
        self.state.lock().launches.clone()
    }

    /// Instance ids passed to terminate so far
    pub fn terminated_instances(&self) -> Vec<String> {
        self.state.lock().terminated.clone()
    }

    /// Volume ids passed to detach so far
    pub fn detach_requests(&self) -> Vec<String> {
        self.state.lock().detach_requests.clone()
    }

    /// Ids of all instances ever launched, in launch order
    pub fn instance_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .instances
            .iter()
            .map(|i| i.id.clone())
            .collect()
    }
}

#[async_trait]
impl ProviderGateway for SimulatedProvider {
    async fn launch_instances(&self, request: &LaunchRequest) -> ProviderResult<ReservationHandle> {
        let mut state = self.state.lock();
        state.authorize()?;
        state.launches.push(request.clone());

        if !state.images.contains_key(&request.image_id) {
            return Err(ProviderError::not_found(
                ResourceKind::Image,
                &request.image_id,
            ));
        }
        if !state.key_pairs.contains_key(&request.key_name) {
            return Err(ProviderError::not_found(
                ResourceKind::KeyPair,
                &request.key_name,
            ));
        }
        if let Some(zone) = &request.zone {
            if !state.zones.iter().any(|z| &z.name == zone) {
                return Err(ProviderError::not_found(ResourceKind::Zone, zone));
            }
        }
        if request.min_count == 0 || request.min_count > request.max_count {
            return Err(ProviderError::fatal(format!(
                "InvalidParameterValue: min_count {} / max_count {}",
                request.min_count, request.max_count
            )));
        }

        let available = match state.capacity {
            Some(capacity) => capacity.saturating_sub(state.active_count()),
            None => request.max_count,
        };
        if available < request.min_count {
            return Err(ProviderError::transient(format!(
                "InsufficientInstanceCapacity: requested at least {}, {} available",
                request.min_count, available
            )));
        }
        let count = request.max_count.min(available);

        for group in &request.security_groups {
            if !state.groups.contains_key(group) {
                let group_id = state.allocate_id("sg");
                state.groups.insert(
                    group.clone(),
                    SecurityGroupHandle {
                        name: group.clone(),
                        group_id,
                    },
                );
            }
        }

        let reservation_id = state.allocate_id("r");
        let mut instance_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = state.allocate_id("i");
            let hostname = state
                .fixed_hostname
                .clone()
                .unwrap_or_else(|| format!("{id}.compute.simulated"));
            let boots_in = state.boot_polls;
            state.instances.push(Instance {
                id: id.clone(),
                hostname,
                state: if boots_in == 0 {
                    NodeState::Running
                } else {
                    NodeState::Pending
                },
                groups: request.security_groups.clone(),
                boots_in,
            });
            instance_ids.push(id);
        }

        debug!(
            reservation = %reservation_id,
            count,
            image = %request.image_id,
            "simulated launch"
        );
        Ok(ReservationHandle {
            reservation_id,
            instance_ids,
        })
    }

    async fn describe_security_group(&self, name: &str) -> ProviderResult<SecurityGroupHandle> {
        let state = self.state.lock();
        state.authorize()?;
        state
            .groups
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::not_found(ResourceKind::SecurityGroup, name))
    }

    async fn list_instances_in_group(
        &self,
        group: &SecurityGroupHandle,
    ) -> ProviderResult<Vec<NodeView>> {
        let mut state = self.state.lock();
        state.authorize()?;
        if !state.groups.contains_key(&group.name) {
            return Err(ProviderError::not_found(
                ResourceKind::SecurityGroup,
                &group.name,
            ));
        }

        let mut views = Vec::new();
        for instance in state
            .instances
            .iter_mut()
            .filter(|i| i.groups.contains(&group.name))
        {
            match instance.state {
                NodeState::Pending if instance.boots_in <= 1 => {
                    instance.boots_in = 0;
                    instance.state = NodeState::Running;
                }
                NodeState::Pending => instance.boots_in -= 1,
                NodeState::ShuttingDown => instance.state = NodeState::Terminated,
                _ => {}
            }
            views.push(instance.view());
        }
        Ok(views)
    }

    async fn describe_images(&self, image_ids: &[String]) -> ProviderResult<Vec<ImageInfo>> {
        let state = self.state.lock();
        state.authorize()?;
        image_ids
            .iter()
            .map(|id| {
                state
                    .images
                    .get(id)
                    .map(|arch| ImageInfo {
                        image_id: id.clone(),
                        architecture: *arch,
                    })
                    .ok_or_else(|| ProviderError::not_found(ResourceKind::Image, id))
            })
            .collect()
    }

    async fn describe_zones(&self) -> ProviderResult<Vec<ZoneInfo>> {
        let state = self.state.lock();
        state.authorize()?;
        Ok(state.zones.clone())
    }

    async fn describe_volumes(&self, volume_ids: &[String]) -> ProviderResult<Vec<VolumeInfo>> {
        let mut state = self.state.lock();
        state.authorize()?;
        let mut infos = Vec::with_capacity(volume_ids.len());
        for id in volume_ids {
            let volume = state
                .volumes
                .get_mut(id)
                .ok_or_else(|| ProviderError::not_found(ResourceKind::Volume, id))?;
            infos.push(volume.info(id));
            volume.settle();
        }
        Ok(infos)
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> ProviderResult<()> {
        let mut state = self.state.lock();
        state.authorize()?;
        if !state
            .instances
            .iter()
            .any(|i| i.id == instance_id && i.state.is_active())
        {
            return Err(ProviderError::not_found(ResourceKind::Instance, instance_id));
        }
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| ProviderError::not_found(ResourceKind::Volume, volume_id))?;
        if volume.attachment.is_some() {
            return Err(ProviderError::fatal(format!(
                "VolumeInUse: {volume_id} is already attached"
            )));
        }
        volume.status = VOLUME_IN_USE.to_string();
        volume.attachment = Some(VolumeAttachment {
            volume_id: volume_id.to_string(),
            instance_id: instance_id.to_string(),
            device: device.to_string(),
            status: ATTACHMENT_ATTACHING.to_string(),
        });
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str) -> ProviderResult<()> {
        let mut state = self.state.lock();
        state.authorize()?;
        state.detach_requests.push(volume_id.to_string());
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| ProviderError::not_found(ResourceKind::Volume, volume_id))?;
        match volume.attachment.as_mut() {
            Some(attachment) => {
                attachment.status = DETACHING.to_string();
                Ok(())
            }
            None => Err(ProviderError::fatal(format!(
                "IncorrectState: {volume_id} is not attached"
            ))),
        }
    }

    async fn describe_key_pairs(&self, names: &[String]) -> ProviderResult<Vec<KeyPairInfo>> {
        let state = self.state.lock();
        state.authorize()?;
        names
            .iter()
            .map(|name| {
                state
                    .key_pairs
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ProviderError::not_found(ResourceKind::KeyPair, name))
            })
            .collect()
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> ProviderResult<()> {
        let mut state = self.state.lock();
        state.authorize()?;
        if let Some(missing) = instance_ids
            .iter()
            .find(|id| !state.instances.iter().any(|i| &&i.id == id))
        {
            return Err(ProviderError::not_found(ResourceKind::Instance, missing));
        }
        for instance in state
            .instances
            .iter_mut()
            .filter(|i| instance_ids.contains(&i.id))
        {
            if instance.state.is_active() {
                instance.state = NodeState::ShuttingDown;
            }
        }
        state.terminated.extend(instance_ids.iter().cloned());
        Ok(())
    }

    async fn list_all_instances(&self) -> ProviderResult<Vec<NodeView>> {
        let state = self.state.lock();
        state.authorize()?;
        Ok(state.instances.iter().map(Instance::view).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(min: u32, max: u32) -> LaunchRequest {
        LaunchRequest {
            image_id: "ami-node".to_string(),
            instance_type: "m1.small".to_string(),
            min_count: min,
            max_count: max,
            key_name: "key".to_string(),
            security_groups: vec!["@cumulus-t".to_string()],
            zone: None,
        }
    }

    fn provider() -> SimulatedProvider {
        SimulatedProvider::new()
            .with_key_pair("key")
            .with_image("ami-node", Architecture::I386)
            .with_zone("us-east-1a", ZONE_AVAILABLE)
    }

    #[tokio::test]
    async fn test_launch_creates_group_and_instances() {
        let provider = provider();
        let reservation = provider.launch_instances(&request(1, 3)).await.unwrap();
        assert_eq!(reservation.instance_ids.len(), 3);

        let group = provider.describe_security_group("@cumulus-t").await.unwrap();
        let nodes = provider.list_instances_in_group(&group).await.unwrap();
        assert_eq!(nodes.len(), 3);
        assert!(nodes.iter().all(|n| n.state == NodeState::Running));
        assert!(nodes.iter().all(|n| n.hostname.is_some()));
    }

    #[tokio::test]
    async fn test_capacity_allows_partial_fulfilment() {
        let provider = provider().with_capacity(2);
        let reservation = provider.launch_instances(&request(1, 4)).await.unwrap();
        assert_eq!(reservation.instance_ids.len(), 2);

        let err = provider.launch_instances(&request(1, 1)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_instances_boot_after_polls() {
        let provider = provider().with_boot_polls(2);
        provider.launch_instances(&request(1, 1)).await.unwrap();
        let group = provider.describe_security_group("@cumulus-t").await.unwrap();

        let first = provider.list_instances_in_group(&group).await.unwrap();
        assert_eq!(first[0].state, NodeState::Pending);
        assert_eq!(first[0].hostname, None);

        let second = provider.list_instances_in_group(&group).await.unwrap();
        assert_eq!(second[0].state, NodeState::Running);
    }

    #[tokio::test]
    async fn test_volume_attach_and_detach_settle() {
        let provider = provider().with_volume("vol-1", "us-east-1a");
        let reservation = provider.launch_instances(&request(1, 1)).await.unwrap();
        let instance = &reservation.instance_ids[0];
        let ids = vec!["vol-1".to_string()];

        provider
            .attach_volume("vol-1", instance, "/dev/sdz")
            .await
            .unwrap();
        let first = provider.describe_volumes(&ids).await.unwrap();
        assert_eq!(first[0].attachments[0].status, ATTACHMENT_ATTACHING);
        let second = provider.describe_volumes(&ids).await.unwrap();
        assert_eq!(second[0].status, VOLUME_IN_USE);
        assert_eq!(second[0].attachments[0].status, ATTACHMENT_ATTACHED);

        provider.detach_volume("vol-1").await.unwrap();
        provider.describe_volumes(&ids).await.unwrap();
        let detached = provider.describe_volumes(&ids).await.unwrap();
        assert_eq!(detached[0].status, VOLUME_AVAILABLE);
        assert!(detached[0].attachments.is_empty());
    }

    #[tokio::test]
    async fn test_auth_failure_rejects_every_call() {
        let provider = provider();
        provider.set_auth_failure(true);
        let err = provider.list_all_instances().await.unwrap_err();
        assert!(matches!(err, ProviderError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_terminated_instances_linger() {
        let provider = provider();
        let reservation = provider.launch_instances(&request(2, 2)).await.unwrap();
        provider
            .terminate_instances(&reservation.instance_ids[..1])
            .await
            .unwrap();

        let group = provider.describe_security_group("@cumulus-t").await.unwrap();
        let nodes = provider.list_instances_in_group(&group).await.unwrap();
        assert_eq!(nodes[0].state, NodeState::Terminated);
        assert_eq!(nodes[1].state, NodeState::Running);
        assert_eq!(provider.terminated_instances(), reservation.instance_ids[..1]);
    }

    #[test]
    fn test_mirroring_seeds_config_resources() {
        let config = crate::testing::sample_config(3);
        let provider = SimulatedProvider::mirroring(&config);
        let state = provider.state.lock();
        assert!(state.key_pairs.contains_key("gsg-keypair"));
        assert_eq!(state.images.get("ami-node"), Some(&Architecture::I386));
        assert_eq!(state.fixed_hostname.as_deref(), Some("localhost"));
    }
}
