// registry.rs - device, interface and peer contexts
//! Contexts are shared through `Arc`. The registry holds the owning handle of every live object;
//! any component that keeps an object across an asynchronous boundary (a queued command, a pending
//! event) clones the `Arc`, so an object removed from the registry stays valid until the last
//! such holder lets go.

use std::{fmt, sync::Arc};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    correlator::TransactionSlot,
    discovery::DiscoveryState,
    types::{ChannelInfo, DeviceCaps, MacAddr, MacId, Status, TransactionId, VdevId},
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no device attached")]
    DeviceDetached,
    #[error("device already attached")]
    DeviceAttached,
    #[error("interface {0} not found")]
    InterfaceNotFound(VdevId),
    #[error("interface {0} already exists")]
    InterfaceExists(VdevId),
    #[error("interface {0} is not a NAN data interface")]
    NotDataInterface(VdevId),
    #[error("peer {0} not found")]
    PeerNotFound(MacAddr),
    #[error("peer {peer} already attached to {vdev}")]
    PeerExists { peer: MacAddr, vdev: VdevId },
    #[error("peer table of {0} is full")]
    PeerTableFull(VdevId),
}

/// Result delivered to a blocked enable/disable caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    Enabled { mac_id: MacId, vdev: Option<VdevId> },
    Disabled,
    Failed(Status),
    /// Superseded by a disable before firmware answered.
    Aborted,
}

/// Result delivered to a blocked end-all caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndAllOutcome {
    Done,
    Failed(Status),
    /// The end-all command left the queue without a firmware response.
    Cancelled,
}

/// Mutable device state, guarded by the device lock.
#[derive(Debug, Default)]
pub struct DeviceState {
    pub discovery: DiscoveryState,
    pub social_chan_2g: Option<u32>,
    pub social_chan_5g: Option<u32>,
    pub mac_id: Option<MacId>,
    pub disc_vdev: Option<VdevId>,
    /// Set while a host-requested disable is outstanding.
    pub explicit_disable: bool,
    /// Discovery session registered with the policy engine.
    pub policy_session: bool,
    /// Interface whose end-all is outstanding.
    pub end_all_vdev: Option<VdevId>,
}

/// Per-device NAN context.
#[derive(Debug)]
pub struct DeviceContext {
    caps: RwLock<DeviceCaps>,
    pub(crate) state: Mutex<DeviceState>,
    pub(crate) enable_txn: Arc<TransactionSlot<DiscoveryOutcome>>,
    pub(crate) disable_txn: Arc<TransactionSlot<DiscoveryOutcome>>,
    pub(crate) end_all_txn: Arc<TransactionSlot<EndAllOutcome>>,
}

impl DeviceContext {
    pub fn new(caps: DeviceCaps) -> Self {
        Self {
            caps: RwLock::new(caps),
            state: Mutex::new(DeviceState::default()),
            enable_txn: TransactionSlot::new("enable"),
            disable_txn: TransactionSlot::new("disable"),
            end_all_txn: TransactionSlot::new("end_all"),
        }
    }

    pub fn caps(&self) -> DeviceCaps {
        *self.caps.read()
    }

    /// Firmware reports capabilities at different times; later reports replace earlier ones.
    pub fn update_caps(&self, caps: DeviceCaps) {
        *self.caps.write() = caps;
    }

    pub fn social_channels(&self) -> (Option<u32>, Option<u32>) {
        let state = self.state.lock();
        (state.social_chan_2g, state.social_chan_5g)
    }

    pub fn mac_id(&self) -> Option<MacId> {
        self.state.lock().mac_id
    }

    pub fn disc_vdev(&self) -> Option<VdevId> {
        self.state.lock().disc_vdev
    }
}

/// What an interface is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceMode {
    NanDiscovery,
    Ndi,
}

/// NDP state of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NdpState {
    #[default]
    Creating,
    Created,
    Deleting,
    Deleted,
    PeerCreate,
    PeerDelete,
    Connecting,
    Connected,
    Ending,
    Disconnected,
}

impl fmt::Display for NdpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NdpState::Creating => "creating",
            NdpState::Created => "created",
            NdpState::Deleting => "deleting",
            NdpState::Deleted => "deleted",
            NdpState::PeerCreate => "peer_create",
            NdpState::PeerDelete => "peer_delete",
            NdpState::Connecting => "connecting",
            NdpState::Connected => "connected",
            NdpState::Ending => "ending",
            NdpState::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// Mutable interface state, guarded by the interface lock.
#[derive(Debug, Default)]
pub struct InterfaceState {
    pub ndp_state: NdpState,
    pub active_peers: u32,
    pub active_sessions: u32,
    pub create_txn: Option<TransactionId>,
    pub delete_txn: Option<TransactionId>,
    pub primary_peer: Option<MacAddr>,
    pub ndp_init_done: bool,
    pub peer_multicast: Vec<MacAddr>,
}

/// Per-interface NAN context.
#[derive(Debug)]
pub struct InterfaceContext {
    id: VdevId,
    name: String,
    mac: MacAddr,
    mode: InterfaceMode,
    pub(crate) state: Mutex<InterfaceState>,
}

impl InterfaceContext {
    pub fn new(id: VdevId, name: impl Into<String>, mac: MacAddr, mode: InterfaceMode) -> Self {
        Self {
            id,
            name: name.into(),
            mac,
            mode,
            state: Mutex::new(InterfaceState::default()),
        }
    }

    pub fn id(&self) -> VdevId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn mode(&self) -> InterfaceMode {
        self.mode
    }

    pub fn ndp_state(&self) -> NdpState {
        self.state.lock().ndp_state
    }

    pub fn set_ndp_state(&self, next: NdpState) {
        let mut state = self.state.lock();
        if state.ndp_state != next {
            debug!(vdev = %self.id, from = %state.ndp_state, to = %next, "ndp state changed");
            state.ndp_state = next;
        }
    }

    /// Interface is being or has been torn down.
    pub fn is_closing(&self) -> bool {
        matches!(self.ndp_state(), NdpState::Deleting | NdpState::Deleted)
    }

    pub fn active_peers(&self) -> u32 {
        self.state.lock().active_peers
    }

    pub fn active_sessions(&self) -> u32 {
        self.state.lock().active_sessions
    }

    pub fn primary_peer(&self) -> Option<MacAddr> {
        self.state.lock().primary_peer
    }

    pub fn ndp_init_done(&self) -> bool {
        self.state.lock().ndp_init_done
    }

    pub fn peer_multicast(&self) -> Vec<MacAddr> {
        self.state.lock().peer_multicast.clone()
    }
}

#[derive(Debug, Default)]
pub struct PeerState {
    pub active_sessions: u32,
    pub home_channel: Option<ChannelInfo>,
}

/// Per-peer NDP context.
#[derive(Debug)]
pub struct PeerContext {
    mac: MacAddr,
    vdev: VdevId,
    pub(crate) state: Mutex<PeerState>,
}

impl PeerContext {
    pub fn new(mac: MacAddr, vdev: VdevId) -> Self {
        Self {
            mac,
            vdev,
            state: Mutex::new(PeerState::default()),
        }
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn vdev(&self) -> VdevId {
        self.vdev
    }

    pub fn active_sessions(&self) -> u32 {
        self.state.lock().active_sessions
    }

    pub fn home_channel(&self) -> Option<ChannelInfo> {
        self.state.lock().home_channel
    }
}

#[derive(Debug, Default)]
struct Objects {
    device: Option<Arc<DeviceContext>>,
    interfaces: AHashMap<VdevId, Arc<InterfaceContext>>,
    peers: AHashMap<MacAddr, Arc<PeerContext>>,
}

/// Owner of every live context of one device.
#[derive(Debug)]
pub struct Registry {
    max_peers_per_ndi: usize,
    objects: RwLock<Objects>,
}

impl Registry {
    pub fn new(max_peers_per_ndi: usize) -> Self {
        Self {
            max_peers_per_ndi: max_peers_per_ndi.max(1),
            objects: RwLock::new(Objects::default()),
        }
    }

    pub fn attach_device(&self, caps: DeviceCaps) -> Result<Arc<DeviceContext>, RegistryError> {
        let mut objects = self.objects.write();
        if objects.device.is_some() {
            return Err(RegistryError::DeviceAttached);
        }
        let device = Arc::new(DeviceContext::new(caps));
        objects.device = Some(Arc::clone(&device));
        debug!(?caps, "device attached");
        Ok(device)
    }

    /// Detaches the device and drops every interface and peer it owned.
    pub fn detach_device(&self) -> Result<Arc<DeviceContext>, RegistryError> {
        let mut objects = self.objects.write();
        let device = objects.device.take().ok_or(RegistryError::DeviceDetached)?;
        let interfaces = objects.interfaces.len();
        let peers = objects.peers.len();
        objects.interfaces.clear();
        objects.peers.clear();
        debug!(interfaces, peers, "device detached");
        Ok(device)
    }

    pub fn device(&self) -> Result<Arc<DeviceContext>, RegistryError> {
        self.objects
            .read()
            .device
            .clone()
            .ok_or(RegistryError::DeviceDetached)
    }

    pub fn create_interface(
        &self,
        id: VdevId,
        name: impl Into<String>,
        mac: MacAddr,
        mode: InterfaceMode,
    ) -> Result<Arc<InterfaceContext>, RegistryError> {
        let mut objects = self.objects.write();
        if objects.device.is_none() {
            return Err(RegistryError::DeviceDetached);
        }
        if objects.interfaces.contains_key(&id) {
            return Err(RegistryError::InterfaceExists(id));
        }
        let iface = Arc::new(InterfaceContext::new(id, name, mac, mode));
        objects.interfaces.insert(id, Arc::clone(&iface));
        debug!(vdev = %id, name = iface.name(), ?mode, "interface created");
        Ok(iface)
    }

    /// Removes an interface together with its peers.
    pub fn destroy_interface(&self, id: VdevId) -> Result<Arc<InterfaceContext>, RegistryError> {
        let mut objects = self.objects.write();
        let iface = objects
            .interfaces
            .remove(&id)
            .ok_or(RegistryError::InterfaceNotFound(id))?;
        let before = objects.peers.len();
        objects.peers.retain(|_, peer| peer.vdev() != id);
        let dropped = before - objects.peers.len();
        if dropped > 0 {
            warn!(vdev = %id, dropped, "interface destroyed with peers still attached");
        }
        iface.set_ndp_state(NdpState::Deleted);
        debug!(vdev = %id, "interface destroyed");
        Ok(iface)
    }

    pub fn interface(&self, id: VdevId) -> Result<Arc<InterfaceContext>, RegistryError> {
        self.objects
            .read()
            .interfaces
            .get(&id)
            .cloned()
            .ok_or(RegistryError::InterfaceNotFound(id))
    }

    pub fn interfaces(&self) -> Vec<Arc<InterfaceContext>> {
        self.objects.read().interfaces.values().cloned().collect()
    }

    /// NDIs that currently carry at least one NDP peer.
    pub fn active_data_interfaces(&self) -> Vec<Arc<InterfaceContext>> {
        self.objects
            .read()
            .interfaces
            .values()
            .filter(|iface| iface.mode() == InterfaceMode::Ndi && iface.active_peers() > 0)
            .cloned()
            .collect()
    }

    pub fn create_peer(&self, vdev: VdevId, mac: MacAddr) -> Result<Arc<PeerContext>, RegistryError> {
        let mut objects = self.objects.write();
        let iface = objects
            .interfaces
            .get(&vdev)
            .ok_or(RegistryError::InterfaceNotFound(vdev))?;
        if iface.mode() != InterfaceMode::Ndi {
            return Err(RegistryError::NotDataInterface(vdev));
        }
        if let Some(existing) = objects.peers.get(&mac) {
            return Err(RegistryError::PeerExists {
                peer: mac,
                vdev: existing.vdev(),
            });
        }
        let on_vdev = objects.peers.values().filter(|p| p.vdev() == vdev).count();
        if on_vdev >= self.max_peers_per_ndi {
            return Err(RegistryError::PeerTableFull(vdev));
        }
        let peer = Arc::new(PeerContext::new(mac, vdev));
        objects.peers.insert(mac, Arc::clone(&peer));
        debug!(%vdev, %mac, "peer created");
        Ok(peer)
    }

    pub fn destroy_peer(&self, mac: MacAddr) -> Result<Arc<PeerContext>, RegistryError> {
        let peer = self
            .objects
            .write()
            .peers
            .remove(&mac)
            .ok_or(RegistryError::PeerNotFound(mac))?;
        debug!(vdev = %peer.vdev(), %mac, "peer destroyed");
        Ok(peer)
    }

    pub fn peer(&self, mac: MacAddr) -> Result<Arc<PeerContext>, RegistryError> {
        self.objects
            .read()
            .peers
            .get(&mac)
            .cloned()
            .ok_or(RegistryError::PeerNotFound(mac))
    }

    pub fn peers_of(&self, vdev: VdevId) -> Vec<Arc<PeerContext>> {
        let mut peers: Vec<_> = self
            .objects
            .read()
            .peers
            .values()
            .filter(|peer| peer.vdev() == vdev)
            .cloned()
            .collect();
        peers.sort_by_key(|peer| peer.mac());
        peers
    }

    pub fn peer_count(&self, vdev: VdevId) -> usize {
        self.objects
            .read()
            .peers
            .values()
            .filter(|peer| peer.vdev() == vdev)
            .count()
    }

    /// Counts the peers of `vdev` that still hold at least one NDP session.
    pub fn connected_peer_count(&self, vdev: VdevId) -> usize {
        self.objects
            .read()
            .peers
            .values()
            .filter(|peer| peer.vdev() == vdev && peer.active_sessions() > 0)
            .count()
    }

    pub fn max_peers_per_ndi(&self) -> usize {
        self.max_peers_per_ndi
    }
}
