// dispatcher.rs - routes firmware events into local state and up to the host
use std::sync::Arc;

use tokio::{
    runtime::Handle,
    sync::mpsc::{error::TrySendError, Sender},
};
use tracing::{debug, error, info, warn};

use crate::{
    api::{
        DatapathEvent, DiscoveryEvent, EndIndicationEntry, Firmware, FirmwareCommand,
        FirmwareEvent, HostEvent, HostOps, PolicyEngine,
    },
    discovery::{self, DiscoveryState, DISCOVERY_VDEV},
    gate::ConcurrencyGate,
    metrics::Metrics,
    registry::{DeviceContext, DiscoveryOutcome, EndAllOutcome, InterfaceContext, NdpState, Registry},
    serializer::{CommandKind, Serializer},
    tracker::SessionTracker,
    types::{
        AcceptPolicy, ChannelInfo, MacAddr, MacId, NdpRole, ResponseCode, Status, TransactionId,
        VdevId,
    },
};

/// Publishes host events, applying backpressure when the host falls behind.
#[derive(Clone)]
pub struct HostEventSender {
    tx: Sender<HostEvent>,
}

impl HostEventSender {
    pub fn new(tx: Sender<HostEvent>) -> Self {
        Self { tx }
    }

    /// Delivers `event`, waiting for room when the host queue is full.
    pub async fn publish(&self, event: HostEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("host event queue full; applying backpressure");
                if self.tx.send(event).await.is_err() {
                    debug!("host event receiver gone");
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!("host event receiver gone");
            }
        }
    }

    /// Delivers `event` from synchronous code.
    ///
    /// A full queue hands the event to a task that waits for room.
    pub fn notify(&self, event: HostEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => match Handle::try_current() {
                Ok(handle) => {
                    warn!("host event queue full; deferring delivery");
                    let tx = self.tx.clone();
                    handle.spawn(async move {
                        if tx.send(event).await.is_err() {
                            debug!("host event receiver gone");
                        }
                    });
                }
                Err(_) => error!(?event, "host event queue full outside a runtime; event lost"),
            },
            Err(TrySendError::Closed(_)) => {
                debug!("host event receiver gone");
            }
        }
    }
}

/// Entry point for every firmware event.
pub struct Dispatcher {
    registry: Arc<Registry>,
    tracker: Arc<SessionTracker>,
    serializer: Serializer,
    gate: Arc<ConcurrencyGate>,
    firmware: Arc<dyn Firmware>,
    policy: Arc<dyn PolicyEngine>,
    host: Arc<dyn HostOps>,
    metrics: Arc<Metrics>,
    events: HostEventSender,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        tracker: Arc<SessionTracker>,
        serializer: Serializer,
        gate: Arc<ConcurrencyGate>,
        firmware: Arc<dyn Firmware>,
        policy: Arc<dyn PolicyEngine>,
        host: Arc<dyn HostOps>,
        metrics: Arc<Metrics>,
        events: HostEventSender,
    ) -> Self {
        Self {
            registry,
            tracker,
            serializer,
            gate,
            firmware,
            policy,
            host,
            metrics,
            events,
        }
    }

    pub async fn handle_event(&self, event: FirmwareEvent) {
        match event {
            FirmwareEvent::Discovery(event) => self.handle_discovery(event).await,
            FirmwareEvent::Datapath(event) => self.handle_datapath(event).await,
        }
    }

    pub async fn handle_discovery(&self, event: DiscoveryEvent) {
        let device = match self.registry.device() {
            Ok(device) => device,
            Err(err) => {
                warn!(error = %err, "discovery event without a device dropped");
                return;
            }
        };
        let notice = match event {
            DiscoveryEvent::EnableResponse {
                status,
                mac_id,
                vdev,
            } => {
                self.on_enable_response(&device, status, mac_id, vdev);
                None
            }
            DiscoveryEvent::DisableIndication { status } => self
                .on_disable_indication(&device, status)
                .then_some(HostEvent::DiscoveryDisabled),
            DiscoveryEvent::Vendor(payload) => Some(HostEvent::DiscoveryVendor(payload)),
        };
        if let Some(notice) = notice {
            self.events.publish(notice).await;
        }
    }

    fn on_enable_response(
        &self,
        device: &DeviceContext,
        status: Status,
        mac_id: MacId,
        vdev: Option<VdevId>,
    ) {
        let state = discovery::get_state(device);
        if state != DiscoveryState::EnableInProgress {
            self.metrics.late_completions.inc();
            warn!(%state, %status, "enable response outside enable_in_progress ignored");
            return;
        }

        let outcome = if status.is_success() {
            if let Err(err) = discovery::try_transition(device, DiscoveryState::Enabled) {
                warn!(error = %err, "enable response lost a race");
                return;
            }
            {
                let mut state = device.state.lock();
                state.mac_id = Some(mac_id);
                state.disc_vdev = vdev;
            }
            self.gate
                .post_enable(device, vdev.unwrap_or(DISCOVERY_VDEV));
            info!(mac_id = mac_id.0, ?vdev, "nan discovery enabled");
            DiscoveryOutcome::Enabled { mac_id, vdev }
        } else {
            if let Err(err) = discovery::try_transition(device, DiscoveryState::Disabled) {
                warn!(error = %err, "enable failure rollback skipped");
            }
            {
                let mut state = device.state.lock();
                state.social_chan_2g = None;
                state.social_chan_5g = None;
            }
            self.metrics.enable_failures.inc();
            self.policy.restart_opportunistic_timer();
            warn!(%status, "firmware failed nan enable");
            DiscoveryOutcome::Failed(status)
        };

        if !device.enable_txn.complete(outcome) {
            self.metrics.late_completions.inc();
        }
    }

    /// Returns `true` when the host must learn that firmware disabled discovery.
    fn on_disable_indication(&self, device: &DeviceContext, status: Status) -> bool {
        let (explicit, vdev) = {
            let mut state = device.state.lock();
            let explicit = std::mem::take(&mut state.explicit_disable);
            (explicit, state.disc_vdev.unwrap_or(DISCOVERY_VDEV))
        };
        let start = discovery::force_disabled(device);
        {
            let mut state = device.state.lock();
            state.mac_id = None;
            state.disc_vdev = None;
            state.social_chan_2g = None;
            state.social_chan_5g = None;
        }
        self.gate.post_disable(device, vdev);

        if start == DiscoveryState::EnableInProgress {
            device.enable_txn.complete(DiscoveryOutcome::Aborted);
        }
        if explicit {
            if !device.disable_txn.complete(DiscoveryOutcome::Disabled) {
                self.metrics.late_completions.inc();
            }
            info!(%status, "nan discovery disabled");
            false
        } else if start != DiscoveryState::Disabled {
            self.metrics.implicit_disables.inc();
            info!(%status, from = %start, "firmware disabled nan discovery");
            true
        } else {
            debug!(%status, "disable indication while already disabled");
            false
        }
    }

    pub async fn handle_datapath(&self, event: DatapathEvent) {
        debug!(event = event.name(), "datapath event");
        let forward = match &event {
            DatapathEvent::InitiatorResponse {
                vdev, txn, status, ..
            } => self.on_command_response(*vdev, CommandKind::Initiator, *txn, *status),
            DatapathEvent::ResponderResponse {
                vdev,
                txn,
                status,
                create_peer,
                peer_ndi_mac,
            } => {
                let matched =
                    self.on_command_response(*vdev, CommandKind::Responder, *txn, *status);
                if matched && status.is_success() && *create_peer {
                    self.ensure_peer(*vdev, *peer_ndi_mac);
                }
                matched
            }
            DatapathEvent::EndResponse { vdev, txn, status } => {
                self.on_command_response(*vdev, CommandKind::End, *txn, *status)
            }
            DatapathEvent::EndAllResponse { vdev, status } => {
                self.on_end_all_response(*vdev, *status)
            }
            DatapathEvent::Indication {
                vdev,
                peer_ndi_mac,
                role,
                policy,
                ..
            } => {
                if *role == NdpRole::Initiator || *policy == AcceptPolicy::All {
                    self.ensure_peer(*vdev, *peer_ndi_mac);
                }
                true
            }
            DatapathEvent::Confirm {
                vdev,
                peer_ndi_mac,
                response,
                channel,
                ..
            } => self.on_confirm(*vdev, *peer_ndi_mac, *response, *channel),
            DatapathEvent::EndIndication { entries } => {
                self.on_end_indication(entries);
                true
            }
            DatapathEvent::ScheduleUpdate {
                vdev,
                peer_ndi_mac,
                channel,
                ..
            } => {
                self.on_schedule_update(*vdev, *peer_ndi_mac, *channel);
                true
            }
            DatapathEvent::HostUpdate { .. } => true,
        };
        if forward {
            self.events.publish(HostEvent::Datapath(event)).await;
        }
    }

    /// Completes the active serialized command. Returns `false` for stale responses.
    fn on_command_response(
        &self,
        vdev: VdevId,
        kind: CommandKind,
        txn: Option<TransactionId>,
        status: Status,
    ) -> bool {
        match self.serializer.complete(vdev, kind, txn) {
            Some(done) => {
                debug!(%vdev, %kind, txn = %done.txn, %status, "command response matched");
                true
            }
            None => false,
        }
    }

    fn on_end_all_response(&self, vdev: VdevId, status: Status) -> bool {
        if !self.on_command_response(vdev, CommandKind::EndAll, None, status) {
            return false;
        }
        let Ok(device) = self.registry.device() else {
            return true;
        };
        if status.is_success() {
            self.finish_end_all(&device, vdev);
        } else {
            let pending = {
                let mut state = device.state.lock();
                let pending = state.end_all_vdev == Some(vdev);
                if pending {
                    state.end_all_vdev = None;
                }
                pending
            };
            if pending {
                warn!(%vdev, %status, "firmware failed end-all");
                device.end_all_txn.complete(EndAllOutcome::Failed(status));
            }
        }
        true
    }

    fn on_confirm(
        &self,
        vdev: VdevId,
        peer: MacAddr,
        response: ResponseCode,
        channel: Option<ChannelInfo>,
    ) -> bool {
        let iface = match self.registry.interface(vdev) {
            Ok(iface) => iface,
            Err(err) => {
                warn!(%vdev, %peer, error = %err, "confirm for unknown interface dropped");
                return false;
            }
        };

        if response != ResponseCode::Accept {
            self.metrics.confirms_rejected.inc();
            if self.registry.peer(peer).is_ok() && self.tracker.active_sessions(peer) == 0 {
                debug!(%vdev, %peer, "rejected confirm; removing idle peer");
                self.discard_idle_peer(vdev, peer);
            }
            return true;
        }

        self.metrics.confirms_accepted.inc();
        match self.tracker.increment_session(peer, channel) {
            Ok(1) => self.peer_arrived(&iface, peer),
            Ok(sessions) => debug!(%vdev, %peer, sessions, "additional ndp with peer"),
            Err(err) => {
                error!(%vdev, %peer, error = %err, "accepted confirm for unknown peer");
                return true;
            }
        }
        iface.state.lock().active_sessions += 1;
        iface.set_ndp_state(NdpState::Connected);
        true
    }

    fn peer_arrived(&self, iface: &InterfaceContext, peer: MacAddr) {
        let vdev = iface.id();
        let first_peer = {
            let mut state = iface.state.lock();
            state.active_peers += 1;
            state.ndp_init_done = true;
            state.active_peers == 1
        };
        self.metrics.active_ndp_peers.inc();
        self.host.new_peer(vdev, peer, first_peer);
        if let Some(addrs) = self.tracker.add_peer_multicast(iface, peer) {
            self.push_multicast(vdev, addrs);
        }
        self.tracker.select_primary_peer(iface, peer);
    }

    fn on_end_indication(&self, entries: &[EndIndicationEntry]) {
        self.metrics.end_indications.inc_by(entries.len() as u64);
        let mut touched: Vec<VdevId> = Vec::new();
        for entry in entries {
            let iface = match self.registry.interface(entry.vdev) {
                Ok(iface) => iface,
                Err(err) => {
                    warn!(vdev = %entry.vdev, ndp = %entry.ndp_instance_id, error = %err, "end indication for unknown interface");
                    continue;
                }
            };
            if let Ok(peer) = self.registry.peer(entry.peer_ndi_mac) {
                if peer.active_sessions() == 0 {
                    debug!(vdev = %entry.vdev, peer = %entry.peer_ndi_mac, "ndp ended before confirm; removing idle peer");
                    self.discard_idle_peer(peer.vdev(), peer.mac());
                    if !touched.contains(&peer.vdev()) {
                        touched.push(peer.vdev());
                    }
                    continue;
                }
            }
            match self.tracker.decrement_session(entry.peer_ndi_mac) {
                Ok(0) => self.peer_departed(&iface, entry.peer_ndi_mac),
                Ok(_) => {}
                Err(err) => {
                    warn!(vdev = %entry.vdev, peer = %entry.peer_ndi_mac, error = %err, "end indication not counted");
                    continue;
                }
            }
            {
                let mut state = iface.state.lock();
                state.active_sessions = state.active_sessions.saturating_sub(1);
            }
            if !touched.contains(&entry.vdev) {
                touched.push(entry.vdev);
            }
        }

        if let Ok(device) = self.registry.device() {
            for vdev in touched {
                self.finish_end_all(&device, vdev);
            }
        }
    }

    fn peer_departed(&self, iface: &InterfaceContext, peer: MacAddr) {
        let vdev = iface.id();
        let last_peer = {
            let mut state = iface.state.lock();
            state.active_peers = state.active_peers.saturating_sub(1);
            if state.active_peers == 0 {
                state.ndp_init_done = false;
            }
            state.active_peers == 0
        };
        self.metrics.active_ndp_peers.dec();
        self.host.peer_departed(vdev, peer, last_peer);
        if let Some(addrs) = self.tracker.remove_peer_multicast(iface, peer) {
            self.push_multicast(vdev, addrs);
        }
        self.tracker.reassign_primary(iface, peer);
        self.discard_idle_peer(vdev, peer);
        if last_peer && !iface.is_closing() {
            iface.set_ndp_state(NdpState::Disconnected);
        }
    }

    /// Removes `peer` from the host and the registry.
    fn discard_idle_peer(&self, vdev: VdevId, peer: MacAddr) {
        self.host.delete_ndi_peer(vdev, peer);
        if let Err(err) = self.registry.destroy_peer(peer) {
            warn!(%vdev, %peer, error = %err, "peer already gone");
        }
    }

    /// Releases `peer` and every session it still holds when no end indication will arrive.
    pub(crate) fn release_peer(&self, iface: &InterfaceContext, peer: MacAddr) {
        match self.tracker.clear_sessions(peer) {
            Ok(0) => self.discard_idle_peer(iface.id(), peer),
            Ok(released) => {
                {
                    let mut state = iface.state.lock();
                    state.active_sessions = state.active_sessions.saturating_sub(released);
                }
                warn!(vdev = %iface.id(), %peer, released, "ndp sessions released without end indication");
                self.peer_departed(iface, peer);
            }
            Err(err) => warn!(vdev = %iface.id(), %peer, error = %err, "peer release skipped"),
        }
    }

    fn on_schedule_update(&self, vdev: VdevId, peer: MacAddr, channel: ChannelInfo) {
        let result = self
            .tracker
            .interface(vdev)
            .and_then(|iface| self.tracker.update_home_channel(&iface, peer, channel));
        if let Err(err) = result {
            warn!(%vdev, %peer, error = %err, "schedule update not applied");
        }
    }

    /// Wakes the end-all waiter of `vdev` once no peer holds a session.
    fn finish_end_all(&self, device: &DeviceContext, vdev: VdevId) {
        if self.registry.connected_peer_count(vdev) > 0 {
            return;
        }
        let pending = {
            let mut state = device.state.lock();
            let pending = state.end_all_vdev == Some(vdev);
            if pending {
                state.end_all_vdev = None;
            }
            pending
        };
        if pending && !device.end_all_txn.complete(EndAllOutcome::Done) {
            self.metrics.late_completions.inc();
        }
    }

    /// Creates the local peer for `mac` unless it already exists.
    fn ensure_peer(&self, vdev: VdevId, mac: MacAddr) {
        if let Ok(existing) = self.registry.peer(mac) {
            if existing.vdev() != vdev {
                warn!(%vdev, peer = %mac, owner = %existing.vdev(), "peer already attached elsewhere");
            }
            return;
        }
        if let Err(err) = self.host.add_ndi_peer(vdev, mac) {
            warn!(%vdev, peer = %mac, error = %err, "host peer creation failed");
            return;
        }
        match self.registry.create_peer(vdev, mac) {
            Ok(_) => {
                if let Ok(iface) = self.registry.interface(vdev) {
                    iface.set_ndp_state(NdpState::PeerCreate);
                }
            }
            Err(err) => {
                warn!(%vdev, peer = %mac, error = %err, "peer not tracked");
                self.host.delete_ndi_peer(vdev, mac);
            }
        }
    }

    fn push_multicast(&self, vdev: VdevId, addrs: Vec<MacAddr>) {
        if let Err(err) = self
            .firmware
            .send(FirmwareCommand::MulticastList { vdev, addrs })
        {
            warn!(%vdev, error = %err, "peer multicast list not pushed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SapNdpConcurrency,
        orchestrator::NdpLifecycle,
        registry::InterfaceMode,
        testing::{mac, HostCall, PolicyCall, RecordingFirmware, RecordingHost, RecordingPolicy},
        types::{ChannelWidth, DeviceCaps, NdpInstanceId},
    };
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc::{self, Receiver};

    struct Fixture {
        registry: Arc<Registry>,
        policy: Arc<RecordingPolicy>,
        host: Arc<RecordingHost>,
        firmware: Arc<RecordingFirmware>,
        dispatcher: Dispatcher,
        events: Receiver<HostEvent>,
    }

    fn fixture() -> Fixture {
        fixture_with_host_buffer(32)
    }

    fn fixture_with_host_buffer(capacity: usize) -> Fixture {
        let registry = Arc::new(Registry::new(8));
        registry.attach_device(DeviceCaps::default()).unwrap();
        registry
            .create_interface(VdevId(1), "nan0", mac(0xf0), InterfaceMode::Ndi)
            .unwrap();
        let policy = Arc::new(RecordingPolicy::default());
        let host = Arc::new(RecordingHost::default());
        let firmware = Arc::new(RecordingFirmware::default());
        let metrics = Arc::new(Metrics::new().unwrap());
        let (tx, events) = mpsc::channel(capacity);
        let sender = HostEventSender::new(tx);
        let tracker = Arc::new(SessionTracker::new(
            Arc::clone(&registry),
            policy.clone(),
            Arc::clone(&metrics),
            true,
            8,
        ));
        let gate = Arc::new(ConcurrencyGate::new(
            policy.clone(),
            SapNdpConcurrency::Disallowed,
            true,
        ));
        let lifecycle = Arc::new(NdpLifecycle::new(
            Arc::clone(&registry),
            firmware.clone(),
            sender.clone(),
        ));
        let serializer = Serializer::new(lifecycle, Arc::clone(&metrics), Duration::from_secs(4), 8);
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            tracker,
            serializer,
            gate,
            firmware.clone(),
            policy.clone(),
            host.clone(),
            metrics,
            sender,
        );
        Fixture {
            registry,
            policy,
            host,
            firmware,
            dispatcher,
            events,
        }
    }

    fn drain(events: &mut Receiver<HostEvent>) -> Vec<HostEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn confirm(peer: MacAddr, ndp: u32, response: ResponseCode, freq: u32) -> DatapathEvent {
        DatapathEvent::Confirm {
            vdev: VdevId(1),
            ndp_instance_id: NdpInstanceId(ndp),
            peer_ndi_mac: peer,
            response,
            reason: 0,
            channel: Some(ChannelInfo::new(freq, ChannelWidth::Mhz80, 2)),
            app_info: Bytes::new(),
        }
    }

    fn end(entries: &[(u32, MacAddr)]) -> DatapathEvent {
        DatapathEvent::EndIndication {
            entries: entries
                .iter()
                .map(|(ndp, peer)| EndIndicationEntry {
                    vdev: VdevId(1),
                    ndp_instance_id: NdpInstanceId(*ndp),
                    peer_ndi_mac: *peer,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn accepted_confirm_sets_up_first_peer() {
        let mut f = fixture();
        f.registry.create_peer(VdevId(1), mac(1)).unwrap();
        f.dispatcher
            .handle_datapath(confirm(mac(1), 5, ResponseCode::Accept, 5745)).await;

        let iface = f.registry.interface(VdevId(1)).unwrap();
        assert_eq!(f.registry.peer(mac(1)).unwrap().active_sessions(), 1);
        assert_eq!(iface.active_peers(), 1);
        assert!(iface.ndp_init_done());
        assert_eq!(iface.primary_peer(), Some(mac(1)));
        assert_eq!(iface.ndp_state(), NdpState::Connected);
        assert_eq!(f.host.calls(), vec![HostCall::NewPeer(VdevId(1), mac(1), true)]);
        assert_eq!(
            f.firmware.sent(),
            vec![FirmwareCommand::MulticastList {
                vdev: VdevId(1),
                addrs: vec![mac(1).solicited_node_multicast()],
            }]
        );
        assert_eq!(
            f.policy.calls(),
            vec![PolicyCall::UpdateConnection(VdevId(1), 5745)]
        );
        assert_eq!(drain(&mut f.events).len(), 1);
    }

    #[tokio::test]
    async fn rejected_confirm_without_sessions_deletes_peer() {
        let f = fixture();
        f.registry.create_peer(VdevId(1), mac(1)).unwrap();
        f.dispatcher
            .handle_datapath(confirm(mac(1), 5, ResponseCode::Reject, 5745)).await;
        assert!(f.registry.peer(mac(1)).is_err());
        assert_eq!(f.host.calls(), vec![HostCall::DeletePeer(VdevId(1), mac(1))]);
        assert_eq!(f.registry.interface(VdevId(1)).unwrap().active_sessions(), 0);
    }

    #[tokio::test]
    async fn rejected_confirm_keeps_peer_with_sessions() {
        let f = fixture();
        f.registry.create_peer(VdevId(1), mac(1)).unwrap();
        f.dispatcher
            .handle_datapath(confirm(mac(1), 5, ResponseCode::Accept, 5745)).await;
        f.dispatcher
            .handle_datapath(confirm(mac(1), 6, ResponseCode::Reject, 5745)).await;
        assert_eq!(f.registry.peer(mac(1)).unwrap().active_sessions(), 1);
    }

    #[tokio::test]
    async fn end_indication_promotes_next_primary_peer() {
        let f = fixture();
        let p = mac(1);
        let q = mac(2);
        for peer in [p, q] {
            f.registry.create_peer(VdevId(1), peer).unwrap();
        }
        f.dispatcher
            .handle_datapath(confirm(p, 5, ResponseCode::Accept, 5745)).await;
        f.dispatcher
            .handle_datapath(confirm(p, 7, ResponseCode::Accept, 5745)).await;
        f.dispatcher
            .handle_datapath(confirm(q, 9, ResponseCode::Accept, 5180)).await;
        f.policy.clear();

        f.dispatcher.handle_datapath(end(&[(5, p), (7, p)])).await;

        let iface = f.registry.interface(VdevId(1)).unwrap();
        assert!(f.registry.peer(p).is_err());
        assert_eq!(iface.primary_peer(), Some(q));
        assert_eq!(iface.active_peers(), 1);
        assert_eq!(iface.active_sessions(), 1);
        assert_eq!(
            f.policy.calls(),
            vec![
                PolicyCall::UpdateConnection(VdevId(1), 5180),
                PolicyCall::RestartOpportunisticTimer,
            ]
        );
        assert!(f
            .host
            .calls()
            .contains(&HostCall::PeerDeparted(VdevId(1), p, false)));

        f.dispatcher.handle_datapath(end(&[(9, q)])).await;
        assert_eq!(iface.primary_peer(), None);
        assert!(!iface.ndp_init_done());
        assert_eq!(
            f.policy.calls().last(),
            Some(&PolicyCall::RemoveConnection(VdevId(1)))
        );
    }

    #[tokio::test]
    async fn duplicate_end_indication_does_not_underflow() {
        let f = fixture();
        f.registry.create_peer(VdevId(1), mac(1)).unwrap();
        f.dispatcher
            .handle_datapath(confirm(mac(1), 5, ResponseCode::Accept, 5745)).await;
        f.dispatcher.handle_datapath(end(&[(5, mac(1))])).await;
        f.dispatcher.handle_datapath(end(&[(5, mac(1))])).await;
        let iface = f.registry.interface(VdevId(1)).unwrap();
        assert_eq!(iface.active_peers(), 0);
        assert_eq!(iface.active_sessions(), 0);
    }

    fn indication(peer: MacAddr, role: NdpRole, policy: AcceptPolicy) -> DatapathEvent {
        DatapathEvent::Indication {
            vdev: VdevId(1),
            service_instance_id: 1,
            ndp_instance_id: NdpInstanceId(3),
            peer_discovery_mac: mac(0x40),
            peer_ndi_mac: peer,
            role,
            policy,
            app_info: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn end_before_confirm_removes_idle_peer() {
        let f = fixture();
        f.dispatcher
            .handle_datapath(indication(mac(1), NdpRole::Responder, AcceptPolicy::All))
            .await;
        assert!(f.registry.peer(mac(1)).is_ok());

        f.dispatcher.handle_datapath(end(&[(3, mac(1))])).await;

        assert!(f.registry.peer(mac(1)).is_err());
        assert_eq!(
            f.host.calls(),
            vec![
                HostCall::AddPeer(VdevId(1), mac(1)),
                HostCall::DeletePeer(VdevId(1), mac(1)),
            ]
        );
        let iface = f.registry.interface(VdevId(1)).unwrap();
        assert_eq!(iface.active_sessions(), 0);
        assert_eq!(iface.active_peers(), 0);
    }

    #[tokio::test]
    async fn full_host_queue_holds_events_until_drained() {
        let Fixture {
            dispatcher,
            mut events,
            ..
        } = fixture_with_host_buffer(1);

        let deliver = async {
            dispatcher
                .handle_datapath(indication(mac(1), NdpRole::Initiator, AcceptPolicy::None))
                .await;
            dispatcher
                .handle_datapath(indication(mac(2), NdpRole::Initiator, AcceptPolicy::None))
                .await;
        };
        let receive = async {
            let mut received = Vec::new();
            while received.len() < 2 {
                match events.recv().await {
                    Some(event) => received.push(event),
                    None => break,
                }
            }
            received
        };
        let ((), received) = tokio::time::timeout(Duration::from_secs(1), async {
            tokio::join!(deliver, receive)
        })
        .await
        .expect("both events delivered");

        let peers: Vec<MacAddr> = received
            .iter()
            .filter_map(|event| match event {
                HostEvent::Datapath(DatapathEvent::Indication { peer_ndi_mac, .. }) => {
                    Some(*peer_ndi_mac)
                }
                _ => None,
            })
            .collect();
        assert_eq!(peers, vec![mac(1), mac(2)]);
    }

    #[tokio::test]
    async fn indication_creates_peer_only_when_host_will_not_answer() {
        let f = fixture();
        f.dispatcher
            .handle_datapath(indication(mac(1), NdpRole::Responder, AcceptPolicy::None)).await;
        assert!(f.registry.peer(mac(1)).is_err());
        f.dispatcher
            .handle_datapath(indication(mac(1), NdpRole::Responder, AcceptPolicy::All)).await;
        assert!(f.registry.peer(mac(1)).is_ok());
        f.dispatcher
            .handle_datapath(indication(mac(2), NdpRole::Initiator, AcceptPolicy::None)).await;
        assert!(f.registry.peer(mac(2)).is_ok());
        assert_eq!(
            f.registry.interface(VdevId(1)).unwrap().ndp_state(),
            NdpState::PeerCreate
        );
    }

    #[tokio::test]
    async fn failed_host_peer_creation_leaves_registry_untouched() {
        let f = fixture();
        f.host.fail_add(true);
        f.dispatcher.handle_datapath(DatapathEvent::Indication {
            vdev: VdevId(1),
            service_instance_id: 1,
            ndp_instance_id: NdpInstanceId(3),
            peer_discovery_mac: mac(0x40),
            peer_ndi_mac: mac(1),
            role: NdpRole::Initiator,
            policy: AcceptPolicy::None,
            app_info: Bytes::new(),
        }).await;
        assert!(f.registry.peer(mac(1)).is_err());
    }

    #[tokio::test]
    async fn stale_responder_response_is_not_forwarded() {
        let mut f = fixture();
        f.dispatcher.handle_datapath(DatapathEvent::ResponderResponse {
            vdev: VdevId(1),
            txn: Some(TransactionId(4)),
            status: Status::Success,
            create_peer: true,
            peer_ndi_mac: mac(1),
        }).await;
        assert!(drain(&mut f.events).is_empty());
        assert!(f.registry.peer(mac(1)).is_err());
    }

    #[tokio::test]
    async fn schedule_update_refreshes_primary_connection() {
        let f = fixture();
        f.registry.create_peer(VdevId(1), mac(1)).unwrap();
        f.dispatcher
            .handle_datapath(confirm(mac(1), 5, ResponseCode::Accept, 5745)).await;
        f.policy.clear();
        f.dispatcher.handle_datapath(DatapathEvent::ScheduleUpdate {
            vdev: VdevId(1),
            peer_ndi_mac: mac(1),
            channel: ChannelInfo::new(5180, ChannelWidth::Mhz40, 1),
            ndp_ids: vec![NdpInstanceId(5)],
        }).await;
        assert_eq!(
            f.registry.peer(mac(1)).unwrap().home_channel().map(|c| c.freq),
            Some(5180)
        );
        assert_eq!(
            f.policy.calls(),
            vec![PolicyCall::UpdateConnection(VdevId(1), 5180)]
        );
    }

    #[tokio::test]
    async fn vendor_discovery_events_are_forwarded() {
        let mut f = fixture();
        f.dispatcher
            .handle_discovery(DiscoveryEvent::Vendor(Bytes::from_static(b"match"))).await;
        assert_eq!(
            drain(&mut f.events),
            vec![HostEvent::DiscoveryVendor(Bytes::from_static(b"match"))]
        );
    }
}
