// testing.rs - recording fakes for the firmware, policy engine and host collaborators
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    api::{Firmware, FirmwareCommand, FirmwareError, HostOps, HostOpsError, PolicyEngine, PolicyError},
    types::{ChannelInfo, MacAddr, Role, VdevId},
};

pub fn mac(last: u8) -> MacAddr {
    MacAddr::new([0x02, 0, 0, 0, 0, last])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyCall {
    HwModeChange(u32),
    RegisterSession(Role, VdevId),
    ReleaseSession(Role, VdevId),
    UpdateConnection(VdevId, u32),
    RemoveConnection(VdevId),
    RestartOpportunisticTimer,
    RecheckCoexistence,
    TeardownOpportunisticLinks,
}

/// Policy engine that records side-effecting calls. Queries are not recorded.
pub struct RecordingPolicy {
    calls: Mutex<Vec<PolicyCall>>,
    allow: AtomicBool,
    active_roles: Mutex<Vec<Role>>,
    hw_mode: Mutex<Result<(), PolicyError>>,
    hw_mode_delay: Mutex<Duration>,
}

impl Default for RecordingPolicy {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            allow: AtomicBool::new(true),
            active_roles: Mutex::new(Vec::new()),
            hw_mode: Mutex::new(Ok(())),
            hw_mode_delay: Mutex::new(Duration::ZERO),
        }
    }
}

impl RecordingPolicy {
    pub fn calls(&self) -> Vec<PolicyCall> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    pub fn set_allow(&self, allow: bool) {
        self.allow.store(allow, Ordering::SeqCst);
    }

    pub fn set_active(&self, role: Role) {
        self.active_roles.lock().push(role);
    }

    pub fn fail_hw_mode(&self, err: PolicyError) {
        *self.hw_mode.lock() = Err(err);
    }

    pub fn delay_hw_mode(&self, delay: Duration) {
        *self.hw_mode_delay.lock() = delay;
    }

    fn record(&self, call: PolicyCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PolicyEngine for RecordingPolicy {
    fn allow_coexistence(&self, _role: Role, _freq: u32) -> bool {
        self.allow.load(Ordering::SeqCst)
    }

    fn is_role_active(&self, role: Role) -> bool {
        self.active_roles.lock().contains(&role)
    }

    async fn request_hw_mode_change(&self, freq: u32) -> Result<(), PolicyError> {
        self.record(PolicyCall::HwModeChange(freq));
        let delay = *self.hw_mode_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.hw_mode.lock().clone()
    }

    fn register_active_session(&self, role: Role, vdev: VdevId) {
        self.record(PolicyCall::RegisterSession(role, vdev));
    }

    fn release_active_session(&self, role: Role, vdev: VdevId) {
        self.record(PolicyCall::ReleaseSession(role, vdev));
    }

    fn update_connection(&self, vdev: VdevId, channel: ChannelInfo) {
        self.record(PolicyCall::UpdateConnection(vdev, channel.freq));
    }

    fn remove_connection(&self, vdev: VdevId) {
        self.record(PolicyCall::RemoveConnection(vdev));
    }

    fn restart_opportunistic_timer(&self) {
        self.record(PolicyCall::RestartOpportunisticTimer);
    }

    fn recheck_coexistence(&self) {
        self.record(PolicyCall::RecheckCoexistence);
    }

    fn teardown_opportunistic_links(&self) {
        self.record(PolicyCall::TeardownOpportunisticLinks);
    }
}

/// Firmware that records every accepted command.
#[derive(Default)]
pub struct RecordingFirmware {
    sent: Mutex<Vec<FirmwareCommand>>,
    fail: AtomicBool,
    notify: Notify,
}

impl RecordingFirmware {
    pub fn sent(&self) -> Vec<FirmwareCommand> {
        self.sent.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(FirmwareCommand::name).collect()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Resolves once at least `count` commands were sent.
    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            if self.sent.lock().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

impl Firmware for RecordingFirmware {
    fn send(&self, command: FirmwareCommand) -> Result<(), FirmwareError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(FirmwareError::Rejected(command.name()));
        }
        self.sent.lock().push(command);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    AddPeer(VdevId, MacAddr),
    DeletePeer(VdevId, MacAddr),
    NewPeer(VdevId, MacAddr, bool),
    PeerDeparted(VdevId, MacAddr, bool),
}

#[derive(Default)]
pub struct RecordingHost {
    calls: Mutex<Vec<HostCall>>,
    fail_add: AtomicBool,
}

impl RecordingHost {
    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().clone()
    }

    pub fn fail_add(&self, fail: bool) {
        self.fail_add.store(fail, Ordering::SeqCst);
    }
}

impl HostOps for RecordingHost {
    fn add_ndi_peer(&self, vdev: VdevId, peer: MacAddr) -> Result<(), HostOpsError> {
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(HostOpsError::PeerCreate(peer));
        }
        self.calls.lock().push(HostCall::AddPeer(vdev, peer));
        Ok(())
    }

    fn delete_ndi_peer(&self, vdev: VdevId, peer: MacAddr) {
        self.calls.lock().push(HostCall::DeletePeer(vdev, peer));
    }

    fn new_peer(&self, vdev: VdevId, peer: MacAddr, first_peer: bool) {
        self.calls.lock().push(HostCall::NewPeer(vdev, peer, first_peer));
    }

    fn peer_departed(&self, vdev: VdevId, peer: MacAddr, last_peer: bool) {
        self.calls
            .lock()
            .push(HostCall::PeerDeparted(vdev, peer, last_peer));
    }
}
