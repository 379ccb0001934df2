// tracker.rs - NDP session counters, primary-peer selection and peer multicast list
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
    api::PolicyEngine,
    metrics::Metrics,
    registry::{InterfaceContext, Registry, RegistryError},
    types::{ChannelInfo, MacAddr, VdevId},
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("peer {0} has no active sessions")]
    Underflow(MacAddr),
}

/// Outcome of a primary-peer reassignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryChange {
    /// The departed peer was not primary.
    Unchanged,
    Promoted(MacAddr),
    /// No peer with active sessions is left on the interface.
    Cleared,
}

pub struct SessionTracker {
    registry: Arc<Registry>,
    policy: Arc<dyn PolicyEngine>,
    metrics: Arc<Metrics>,
    multi_ndi: bool,
    max_multicast: usize,
}

impl SessionTracker {
    pub fn new(
        registry: Arc<Registry>,
        policy: Arc<dyn PolicyEngine>,
        metrics: Arc<Metrics>,
        multi_ndi: bool,
        max_multicast: usize,
    ) -> Self {
        Self {
            registry,
            policy,
            metrics,
            multi_ndi,
            max_multicast: max_multicast.max(1),
        }
    }

    /// Counts an accepted NDP with `peer`, returning the new session count.
    ///
    /// The first session records `channel` as the peer's home channel.
    pub fn increment_session(
        &self,
        peer: MacAddr,
        channel: Option<ChannelInfo>,
    ) -> Result<u32, TrackerError> {
        let ctx = self.registry.peer(peer)?;
        let mut state = ctx.state.lock();
        if state.active_sessions == 0 {
            state.home_channel = channel;
        }
        state.active_sessions += 1;
        self.metrics.active_ndp_sessions.inc();
        debug!(%peer, sessions = state.active_sessions, "ndp session counted");
        Ok(state.active_sessions)
    }

    /// Drops one NDP with `peer`, returning the remaining session count.
    pub fn decrement_session(&self, peer: MacAddr) -> Result<u32, TrackerError> {
        let ctx = self.registry.peer(peer)?;
        let mut state = ctx.state.lock();
        if state.active_sessions == 0 {
            self.metrics.session_underflows.inc();
            error!(%peer, "session decrement on peer without sessions rejected");
            return Err(TrackerError::Underflow(peer));
        }
        state.active_sessions -= 1;
        self.metrics.active_ndp_sessions.dec();
        debug!(%peer, sessions = state.active_sessions, "ndp session released");
        Ok(state.active_sessions)
    }

    /// Drops every NDP counted for `peer`, returning how many were released.
    pub fn clear_sessions(&self, peer: MacAddr) -> Result<u32, TrackerError> {
        let ctx = self.registry.peer(peer)?;
        let released = std::mem::take(&mut ctx.state.lock().active_sessions);
        self.metrics.active_ndp_sessions.sub(i64::from(released));
        if released > 0 {
            debug!(%peer, released, "ndp sessions cleared");
        }
        Ok(released)
    }

    /// Records `peer` as the interface's primary peer when none is set yet.
    ///
    /// Returns `true` when `peer` became primary.
    pub fn select_primary_peer(&self, iface: &InterfaceContext, peer: MacAddr) -> bool {
        {
            let mut state = iface.state.lock();
            if state.primary_peer.is_some() {
                return false;
            }
            state.primary_peer = Some(peer);
        }
        info!(vdev = %iface.id(), %peer, "primary ndp peer selected");
        if self.multi_ndi {
            if let Some(channel) = self.home_channel(peer) {
                self.policy.update_connection(iface.id(), channel);
            }
        }
        true
    }

    /// Picks a new primary peer after `departed` lost its last session.
    pub fn reassign_primary(&self, iface: &InterfaceContext, departed: MacAddr) -> PrimaryChange {
        if iface.primary_peer() != Some(departed) {
            return PrimaryChange::Unchanged;
        }
        let candidate = self
            .registry
            .peers_of(iface.id())
            .into_iter()
            .filter(|peer| peer.mac() != departed)
            .find(|peer| peer.active_sessions() > 0);

        match candidate {
            Some(next) => {
                iface.state.lock().primary_peer = Some(next.mac());
                info!(vdev = %iface.id(), from = %departed, to = %next.mac(), "primary ndp peer promoted");
                if self.multi_ndi {
                    if let Some(channel) = next.home_channel() {
                        self.policy.update_connection(iface.id(), channel);
                    }
                    self.policy.restart_opportunistic_timer();
                }
                PrimaryChange::Promoted(next.mac())
            }
            None => {
                iface.state.lock().primary_peer = None;
                info!(vdev = %iface.id(), %departed, "last primary ndp peer gone");
                if self.multi_ndi {
                    self.policy.remove_connection(iface.id());
                }
                PrimaryChange::Cleared
            }
        }
    }

    /// Refreshes the home channel of `peer`, mirroring it to the policy engine when primary.
    pub fn update_home_channel(
        &self,
        iface: &InterfaceContext,
        peer: MacAddr,
        channel: ChannelInfo,
    ) -> Result<(), TrackerError> {
        let ctx = self.registry.peer(peer)?;
        ctx.state.lock().home_channel = Some(channel);
        if self.multi_ndi && iface.primary_peer() == Some(peer) {
            self.policy.update_connection(iface.id(), channel);
        }
        Ok(())
    }

    /// Adds the multicast address derived from `peer`. Returns the new list when it changed.
    pub fn add_peer_multicast(&self, iface: &InterfaceContext, peer: MacAddr) -> Option<Vec<MacAddr>> {
        let addr = peer.solicited_node_multicast();
        let mut state = iface.state.lock();
        if state.peer_multicast.contains(&addr) {
            return None;
        }
        if state.peer_multicast.len() >= self.max_multicast {
            debug!(vdev = %iface.id(), %peer, "peer multicast list full");
            return None;
        }
        state.peer_multicast.push(addr);
        Some(state.peer_multicast.clone())
    }

    /// Removes the multicast address derived from `peer`. Returns the new list when it changed.
    ///
    /// The address stays while another peer with active sessions on the interface derives it.
    pub fn remove_peer_multicast(
        &self,
        iface: &InterfaceContext,
        peer: MacAddr,
    ) -> Option<Vec<MacAddr>> {
        let addr = peer.solicited_node_multicast();
        let shared = self.registry.peers_of(iface.id()).into_iter().any(|other| {
            other.mac() != peer
                && other.active_sessions() > 0
                && other.mac().solicited_node_multicast() == addr
        });
        if shared {
            debug!(vdev = %iface.id(), %peer, %addr, "peer multicast address still in use");
            return None;
        }
        let mut state = iface.state.lock();
        let before = state.peer_multicast.len();
        state.peer_multicast.retain(|existing| *existing != addr);
        (state.peer_multicast.len() != before).then(|| state.peer_multicast.clone())
    }

    pub fn active_sessions(&self, peer: MacAddr) -> u32 {
        self.registry
            .peer(peer)
            .map(|ctx| ctx.active_sessions())
            .unwrap_or(0)
    }

    pub fn interface(&self, vdev: VdevId) -> Result<Arc<InterfaceContext>, TrackerError> {
        Ok(self.registry.interface(vdev)?)
    }

    fn home_channel(&self, peer: MacAddr) -> Option<ChannelInfo> {
        self.registry.peer(peer).ok().and_then(|ctx| ctx.home_channel())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        registry::InterfaceMode,
        testing::{mac, PolicyCall, RecordingPolicy},
        types::{ChannelWidth, DeviceCaps},
    };

    fn setup(multi_ndi: bool) -> (Arc<Registry>, Arc<RecordingPolicy>, SessionTracker) {
        let registry = Arc::new(Registry::new(8));
        registry.attach_device(DeviceCaps::default()).unwrap();
        registry
            .create_interface(VdevId(1), "nan0", mac(0xf0), InterfaceMode::Ndi)
            .unwrap();
        let policy = Arc::new(RecordingPolicy::default());
        let metrics = Arc::new(Metrics::new().unwrap());
        let tracker = SessionTracker::new(
            Arc::clone(&registry),
            policy.clone(),
            metrics,
            multi_ndi,
            2,
        );
        (registry, policy, tracker)
    }

    fn chan(freq: u32) -> Option<ChannelInfo> {
        Some(ChannelInfo::new(freq, ChannelWidth::Mhz80, 2))
    }

    #[test]
    fn first_session_records_home_channel() {
        let (registry, _policy, tracker) = setup(true);
        registry.create_peer(VdevId(1), mac(1)).unwrap();
        assert_eq!(tracker.increment_session(mac(1), chan(5745)), Ok(1));
        assert_eq!(tracker.increment_session(mac(1), chan(5180)), Ok(2));
        let peer = registry.peer(mac(1)).unwrap();
        assert_eq!(peer.home_channel(), chan(5745));
    }

    #[test]
    fn decrement_never_goes_negative() {
        let (registry, _policy, tracker) = setup(true);
        registry.create_peer(VdevId(1), mac(1)).unwrap();
        tracker.increment_session(mac(1), None).unwrap();
        assert_eq!(tracker.decrement_session(mac(1)), Ok(0));
        assert_eq!(
            tracker.decrement_session(mac(1)),
            Err(TrackerError::Underflow(mac(1)))
        );
        assert_eq!(tracker.active_sessions(mac(1)), 0);
    }

    #[test]
    fn increment_requires_known_peer() {
        let (_registry, _policy, tracker) = setup(true);
        assert_eq!(
            tracker.increment_session(mac(9), None),
            Err(TrackerError::Registry(RegistryError::PeerNotFound(mac(9))))
        );
    }

    #[test]
    fn primary_peer_promotion_and_removal() {
        let (registry, policy, tracker) = setup(true);
        let iface = registry.interface(VdevId(1)).unwrap();
        for (last, freq) in [(1, 5745), (2, 5180)] {
            registry.create_peer(VdevId(1), mac(last)).unwrap();
            tracker.increment_session(mac(last), chan(freq)).unwrap();
        }
        assert!(tracker.select_primary_peer(&iface, mac(1)));
        assert!(!tracker.select_primary_peer(&iface, mac(2)));

        tracker.decrement_session(mac(1)).unwrap();
        assert_eq!(
            tracker.reassign_primary(&iface, mac(1)),
            PrimaryChange::Promoted(mac(2))
        );
        assert_eq!(iface.primary_peer(), Some(mac(2)));

        tracker.decrement_session(mac(2)).unwrap();
        assert_eq!(tracker.reassign_primary(&iface, mac(2)), PrimaryChange::Cleared);

        assert_eq!(
            policy.calls(),
            vec![
                PolicyCall::UpdateConnection(VdevId(1), 5745),
                PolicyCall::UpdateConnection(VdevId(1), 5180),
                PolicyCall::RestartOpportunisticTimer,
                PolicyCall::RemoveConnection(VdevId(1)),
            ]
        );
    }

    #[test]
    fn single_ndi_mode_keeps_policy_untouched() {
        let (registry, policy, tracker) = setup(false);
        let iface = registry.interface(VdevId(1)).unwrap();
        registry.create_peer(VdevId(1), mac(1)).unwrap();
        tracker.increment_session(mac(1), chan(5745)).unwrap();
        tracker.select_primary_peer(&iface, mac(1));
        tracker.decrement_session(mac(1)).unwrap();
        assert_eq!(tracker.reassign_primary(&iface, mac(1)), PrimaryChange::Cleared);
        assert!(policy.calls().is_empty());
    }

    #[test]
    fn multicast_list_is_bounded_and_deduplicated() {
        let (registry, _policy, tracker) = setup(true);
        let iface = registry.interface(VdevId(1)).unwrap();
        assert_eq!(tracker.add_peer_multicast(&iface, mac(1)).map(|l| l.len()), Some(1));
        assert_eq!(tracker.add_peer_multicast(&iface, mac(1)), None);
        assert_eq!(tracker.add_peer_multicast(&iface, mac(2)).map(|l| l.len()), Some(2));
        assert_eq!(tracker.add_peer_multicast(&iface, mac(3)), None);
        let remaining = tracker.remove_peer_multicast(&iface, mac(1)).unwrap();
        assert_eq!(remaining, vec![mac(2).solicited_node_multicast()]);
        assert_eq!(tracker.remove_peer_multicast(&iface, mac(1)), None);
    }

    #[test]
    fn shared_multicast_address_outlives_first_peer() {
        let (registry, _policy, tracker) = setup(true);
        let iface = registry.interface(VdevId(1)).unwrap();
        let p = MacAddr::new([0x02, 0x11, 0x11, 0xaa, 0xbb, 0xcc]);
        let q = MacAddr::new([0x02, 0x22, 0x22, 0xaa, 0xbb, 0xcc]);
        for peer in [p, q] {
            registry.create_peer(VdevId(1), peer).unwrap();
            tracker.increment_session(peer, None).unwrap();
        }
        assert_eq!(
            tracker.add_peer_multicast(&iface, p),
            Some(vec![p.solicited_node_multicast()])
        );
        assert_eq!(tracker.add_peer_multicast(&iface, q), None);

        tracker.decrement_session(p).unwrap();
        assert_eq!(tracker.remove_peer_multicast(&iface, p), None);
        assert_eq!(iface.peer_multicast(), vec![q.solicited_node_multicast()]);

        tracker.decrement_session(q).unwrap();
        assert_eq!(tracker.remove_peer_multicast(&iface, q), Some(vec![]));
    }
}
