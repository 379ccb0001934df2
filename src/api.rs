// Public control-plane API: typed requests, firmware commands and events, and the
// collaborator traits injected into the orchestrator.
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::types::{
    AcceptPolicy, ChannelInfo, MacAddr, MacId, NdpInstanceId, NdpRole, ResponseCode, Role, Status,
    TransactionId, VdevId,
};

/// Request to enable NAN discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnableRequest {
    /// 2.4 GHz social channel frequency in MHz.
    pub social_chan_2g: u32,
    /// 5 GHz social channel frequency in MHz, when the band is in use.
    pub social_chan_5g: Option<u32>,
    /// Opaque discovery configuration forwarded to firmware.
    pub params: Bytes,
}

impl EnableRequest {
    pub fn new(social_chan_2g: u32, social_chan_5g: Option<u32>) -> Self {
        Self {
            social_chan_2g,
            social_chan_5g,
            params: Bytes::new(),
        }
    }
}

/// Request to disable NAN discovery.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisableRequest {
    pub params: Bytes,
}

/// Pass-through discovery request (publish, subscribe, follow-up, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericRequest {
    pub params: Bytes,
}

/// Security material for an NDP.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecurityParams {
    pub cipher_suite: u32,
    pub pmk: Bytes,
    pub passphrase: Option<String>,
    pub service_name: Option<String>,
}

/// Request to initiate an NDP with a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiatorRequest {
    pub txn: TransactionId,
    pub vdev: VdevId,
    pub service_instance_id: u32,
    /// Channel preference; `None` lets firmware choose.
    pub channel: Option<ChannelInfo>,
    pub peer_discovery_mac: MacAddr,
    pub app_info: Bytes,
    pub config: Bytes,
    pub security: Option<SecurityParams>,
}

/// Host response to an NDP indication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponderRequest {
    pub txn: TransactionId,
    pub vdev: VdevId,
    pub ndp_instance_id: NdpInstanceId,
    pub response: ResponseCode,
    pub app_info: Bytes,
    pub config: Bytes,
    pub security: Option<SecurityParams>,
}

/// Request to end one or more NDPs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndRequest {
    pub txn: TransactionId,
    pub vdev: VdevId,
    pub ndp_ids: Vec<NdpInstanceId>,
}

/// Request to end every NDP on an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndAllRequest {
    pub vdev: VdevId,
}

/// Commands transmitted to firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareCommand {
    Enable(EnableRequest),
    Disable(DisableRequest),
    Generic(GenericRequest),
    Initiator(InitiatorRequest),
    Responder(ResponderRequest),
    End(EndRequest),
    EndAll(EndAllRequest),
    /// Replaces the peer multicast filter installed on an interface.
    MulticastList { vdev: VdevId, addrs: Vec<MacAddr> },
}

impl FirmwareCommand {
    pub fn name(&self) -> &'static str {
        match self {
            FirmwareCommand::Enable(_) => "enable",
            FirmwareCommand::Disable(_) => "disable",
            FirmwareCommand::Generic(_) => "generic",
            FirmwareCommand::Initiator(_) => "initiator",
            FirmwareCommand::Responder(_) => "responder",
            FirmwareCommand::End(_) => "end",
            FirmwareCommand::EndAll(_) => "end_all",
            FirmwareCommand::MulticastList { .. } => "multicast_list",
        }
    }
}

/// Events on the discovery channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    EnableResponse {
        status: Status,
        mac_id: MacId,
        /// Discovery vdev, when firmware operates discovery on a dedicated interface.
        vdev: Option<VdevId>,
    },
    DisableIndication {
        status: Status,
    },
    /// Opaque discovery event (match, follow-up, ...) forwarded to the host.
    Vendor(Bytes),
}

/// Entry of an NDP end indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndIndicationEntry {
    pub vdev: VdevId,
    pub ndp_instance_id: NdpInstanceId,
    pub peer_ndi_mac: MacAddr,
}

/// Events on the datapath channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatapathEvent {
    InitiatorResponse {
        vdev: VdevId,
        /// Echoed transaction id; some firmware builds leave it out.
        txn: Option<TransactionId>,
        ndp_instance_id: NdpInstanceId,
        status: Status,
    },
    ResponderResponse {
        vdev: VdevId,
        txn: Option<TransactionId>,
        status: Status,
        /// Firmware asks the host to create the peer for an accepted request.
        create_peer: bool,
        peer_ndi_mac: MacAddr,
    },
    Indication {
        vdev: VdevId,
        service_instance_id: u32,
        ndp_instance_id: NdpInstanceId,
        peer_discovery_mac: MacAddr,
        peer_ndi_mac: MacAddr,
        role: NdpRole,
        policy: AcceptPolicy,
        app_info: Bytes,
    },
    Confirm {
        vdev: VdevId,
        ndp_instance_id: NdpInstanceId,
        peer_ndi_mac: MacAddr,
        response: ResponseCode,
        reason: u32,
        channel: Option<ChannelInfo>,
        app_info: Bytes,
    },
    EndResponse {
        vdev: VdevId,
        txn: Option<TransactionId>,
        status: Status,
    },
    EndIndication {
        entries: Vec<EndIndicationEntry>,
    },
    EndAllResponse {
        vdev: VdevId,
        status: Status,
    },
    ScheduleUpdate {
        vdev: VdevId,
        peer_ndi_mac: MacAddr,
        channel: ChannelInfo,
        ndp_ids: Vec<NdpInstanceId>,
    },
    HostUpdate {
        vdev: VdevId,
        peer_ndi_mac: MacAddr,
        payload: Bytes,
    },
}

impl DatapathEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DatapathEvent::InitiatorResponse { .. } => "initiator_response",
            DatapathEvent::ResponderResponse { .. } => "responder_response",
            DatapathEvent::Indication { .. } => "indication",
            DatapathEvent::Confirm { .. } => "confirm",
            DatapathEvent::EndResponse { .. } => "end_response",
            DatapathEvent::EndIndication { .. } => "end_indication",
            DatapathEvent::EndAllResponse { .. } => "end_all_response",
            DatapathEvent::ScheduleUpdate { .. } => "schedule_update",
            DatapathEvent::HostUpdate { .. } => "host_update",
        }
    }
}

/// Any event raised by firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareEvent {
    Discovery(DiscoveryEvent),
    Datapath(DatapathEvent),
}

impl From<DiscoveryEvent> for FirmwareEvent {
    fn from(event: DiscoveryEvent) -> Self {
        FirmwareEvent::Discovery(event)
    }
}

impl From<DatapathEvent> for FirmwareEvent {
    fn from(event: DatapathEvent) -> Self {
        FirmwareEvent::Datapath(event)
    }
}

/// Terminal outcome of a serialized command that did not complete through firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalFailure {
    Cancelled,
    TimedOut,
    ActivationFailed,
}

/// Notifications delivered upward to the control-interface layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Firmware disabled discovery without a host request.
    DiscoveryDisabled,
    /// Opaque discovery event.
    DiscoveryVendor(Bytes),
    /// Datapath event after local state has been updated.
    Datapath(DatapathEvent),
    /// A serialized command ended without a firmware response.
    CommandFailed {
        vdev: VdevId,
        txn: TransactionId,
        command: &'static str,
        failure: LocalFailure,
    },
}

/// Errors returned by [`Firmware::send`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FirmwareError {
    #[error("firmware rejected {0} command for transmission")]
    Rejected(&'static str),
    #[error("firmware link is down")]
    LinkDown,
}

/// Errors returned by the policy engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("hardware mode change to {freq} MHz failed")]
    HwModeChange { freq: u32 },
    #[error("hardware mode change timed out")]
    Timeout,
}

/// Errors returned by [`HostOps`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostOpsError {
    #[error("peer {0} could not be created")]
    PeerCreate(MacAddr),
}

/// Firmware transmit path.
pub trait Firmware: Send + Sync {
    /// Queues a command; `Ok` means accepted for transmission, not completed.
    fn send(&self, command: FirmwareCommand) -> Result<(), FirmwareError>;
}

/// Radio concurrency policy engine.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Whether `role` may operate on `freq` given the currently active roles.
    fn allow_coexistence(&self, role: Role, freq: u32) -> bool;

    /// Whether any connection of `role` is active.
    fn is_role_active(&self, role: Role) -> bool;

    /// Requests a hardware-mode change accommodating `freq` and waits for it.
    async fn request_hw_mode_change(&self, freq: u32) -> Result<(), PolicyError>;

    fn register_active_session(&self, role: Role, vdev: VdevId);

    fn release_active_session(&self, role: Role, vdev: VdevId);

    /// Installs or refreshes the connection-table entry of an NDI.
    fn update_connection(&self, vdev: VdevId, channel: ChannelInfo);

    fn remove_connection(&self, vdev: VdevId);

    fn restart_opportunistic_timer(&self);

    /// Re-runs deferred coexistence checks after NAN discovery came up.
    fn recheck_coexistence(&self);

    /// Starts (without waiting) teardown of links incompatible with NAN, e.g. TDLS.
    fn teardown_opportunistic_links(&self);
}

/// Host datapath callbacks.
pub trait HostOps: Send + Sync {
    fn add_ndi_peer(&self, vdev: VdevId, peer: MacAddr) -> Result<(), HostOpsError>;

    fn delete_ndi_peer(&self, vdev: VdevId, peer: MacAddr);

    /// A peer got its first NDP; `first_peer` is set for the interface's first peer.
    fn new_peer(&self, vdev: VdevId, peer: MacAddr, first_peer: bool);

    /// A peer lost its last NDP; `last_peer` is set when the interface has no peers left.
    fn peer_departed(&self, vdev: VdevId, peer: MacAddr, last_peer: bool);
}
