// gate.rs - concurrency checks run before discovery enable and NDP creation
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    api::{PolicyEngine, PolicyError},
    config::SapNdpConcurrency,
    discovery::{self, DiscoveryState, TransitionError},
    registry::{DeviceContext, Registry},
    types::{Role, VdevId},
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("device lacks host-side NAN concurrency control")]
    NoConcurrencyControl,
    #[error("policy engine refused {role} on {freq} MHz")]
    CoexistenceRefused { role: Role, freq: u32 },
    #[error(transparent)]
    HwMode(#[from] PolicyError),
    #[error("enable superseded by a disable")]
    Superseded,
    #[error("NDP not allowed while a SAP is active")]
    SapActive,
    #[error("a second NDI is not allowed alongside {0}")]
    MultiNdiDisabled(VdevId),
    #[error("device cannot run NDIs on separate bands")]
    NdiDbsUnsupported,
    #[error("device does not support STA + NAN + NDI + NDI")]
    FourPortUnsupported,
}

pub struct ConcurrencyGate {
    policy: Arc<dyn PolicyEngine>,
    sap_ndp: SapNdpConcurrency,
    multi_ndi: bool,
}

impl ConcurrencyGate {
    pub fn new(policy: Arc<dyn PolicyEngine>, sap_ndp: SapNdpConcurrency, multi_ndi: bool) -> Self {
        Self {
            policy,
            sap_ndp,
            multi_ndi,
        }
    }

    pub fn sap_ndp(&self) -> SapNdpConcurrency {
        self.sap_ndp
    }

    /// Whether discovery may be enabled on `freq` right now.
    pub fn can_enable(&self, device: &DeviceContext, freq: u32) -> Result<(), GateError> {
        let state = discovery::get_state(device);
        if state != DiscoveryState::Disabled {
            return Err(if state == DiscoveryState::Enabled {
                TransitionError::Redundant(state).into()
            } else {
                TransitionError::Invalid {
                    from: state,
                    to: DiscoveryState::EnableInProgress,
                }
                .into()
            });
        }
        if !device.caps().host_concurrency_control {
            return Err(GateError::NoConcurrencyControl);
        }
        if !self.policy.allow_coexistence(Role::NanDiscovery, freq) {
            return Err(GateError::CoexistenceRefused {
                role: Role::NanDiscovery,
                freq,
            });
        }
        Ok(())
    }

    /// Moves discovery to `EnableInProgress` and prepares the radio for `freq`.
    ///
    /// On failure the state is rolled back to `Disabled`, unless a disable took over while the
    /// hardware-mode change was pending.
    pub async fn pre_enable(&self, device: &DeviceContext, freq: u32) -> Result<(), GateError> {
        discovery::try_transition(device, DiscoveryState::EnableInProgress)?;
        let caps = device.caps();

        if self.policy.is_role_active(Role::Sap)
            && !caps.sap_coexistence
            && !self.policy.allow_coexistence(Role::NanDiscovery, freq)
        {
            warn!(freq, "nan discovery refused alongside active sap");
            rollback(device);
            return Err(GateError::CoexistenceRefused {
                role: Role::Sap,
                freq,
            });
        }

        if caps.dbs {
            debug!(freq, "waiting for hardware mode change");
            let result = self.policy.request_hw_mode_change(freq).await;
            if discovery::get_state(device) != DiscoveryState::EnableInProgress {
                info!(freq, "enable superseded during hardware mode change");
                return Err(GateError::Superseded);
            }
            if let Err(err) = result {
                warn!(freq, error = %err, "hardware mode change failed");
                rollback(device);
                return Err(err.into());
            }
        }

        self.policy.teardown_opportunistic_links();
        Ok(())
    }

    /// Registers the discovery session once firmware confirmed the enable.
    pub fn post_enable(&self, device: &DeviceContext, vdev: VdevId) {
        device.state.lock().policy_session = true;
        self.policy.register_active_session(Role::NanDiscovery, vdev);
        self.policy.recheck_coexistence();
    }

    /// Releases the discovery session, if one was registered.
    pub fn post_disable(&self, device: &DeviceContext, vdev: VdevId) {
        let registered = std::mem::take(&mut device.state.lock().policy_session);
        if registered {
            self.policy.release_active_session(Role::NanDiscovery, vdev);
        }
        self.policy.restart_opportunistic_timer();
    }

    /// Whether an NDP may be set up on `vdev` given the other active NDIs and roles.
    ///
    /// The NDI-DBS and STA+NAN+NDI+NDI capabilities are checked independently.
    pub fn check_ndp(
        &self,
        device: &DeviceContext,
        registry: &Registry,
        vdev: VdevId,
    ) -> Result<(), GateError> {
        if self.sap_ndp == SapNdpConcurrency::Disallowed && self.policy.is_role_active(Role::Sap) {
            return Err(GateError::SapActive);
        }
        let others = registry
            .active_data_interfaces()
            .iter()
            .filter(|iface| iface.id() != vdev)
            .count();
        if others == 0 {
            return Ok(());
        }
        if !self.multi_ndi {
            return Err(GateError::MultiNdiDisabled(vdev));
        }
        let caps = device.caps();
        if !caps.ndi_dbs {
            return Err(GateError::NdiDbsUnsupported);
        }
        if self.policy.is_role_active(Role::Sta) && !caps.sta_nan_ndi_ndi {
            return Err(GateError::FourPortUnsupported);
        }
        Ok(())
    }
}

fn rollback(device: &DeviceContext) {
    if let Err(err) = discovery::try_transition(device, DiscoveryState::Disabled) {
        warn!(error = %err, "enable rollback skipped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        registry::InterfaceMode,
        testing::{mac, PolicyCall, RecordingPolicy},
        types::DeviceCaps,
    };
    use std::time::Duration;

    fn caps() -> DeviceCaps {
        DeviceCaps {
            host_concurrency_control: true,
            ..DeviceCaps::default()
        }
    }

    fn gate(policy: &Arc<RecordingPolicy>, sap_ndp: SapNdpConcurrency) -> ConcurrencyGate {
        ConcurrencyGate::new(policy.clone(), sap_ndp, true)
    }

    #[test]
    fn can_enable_requires_disabled_state_and_capability() {
        let policy = Arc::new(RecordingPolicy::default());
        let gate = gate(&policy, SapNdpConcurrency::Disallowed);
        let device = DeviceContext::new(DeviceCaps::default());
        assert_eq!(
            gate.can_enable(&device, 2437),
            Err(GateError::NoConcurrencyControl)
        );

        device.update_caps(caps());
        assert_eq!(gate.can_enable(&device, 2437), Ok(()));

        policy.set_allow(false);
        assert!(matches!(
            gate.can_enable(&device, 2437),
            Err(GateError::CoexistenceRefused { .. })
        ));

        policy.set_allow(true);
        discovery::try_transition(&device, DiscoveryState::EnableInProgress).unwrap();
        assert!(matches!(
            gate.can_enable(&device, 2437),
            Err(GateError::Transition(TransitionError::Invalid { .. }))
        ));
    }

    #[tokio::test]
    async fn pre_enable_waits_for_hw_mode_and_tears_down_links() {
        let policy = Arc::new(RecordingPolicy::default());
        let gate = gate(&policy, SapNdpConcurrency::Disallowed);
        let device = DeviceContext::new(DeviceCaps { dbs: true, ..caps() });
        gate.pre_enable(&device, 2437).await.expect("pre-enable");
        assert_eq!(discovery::get_state(&device), DiscoveryState::EnableInProgress);
        assert_eq!(
            policy.calls(),
            vec![
                PolicyCall::HwModeChange(2437),
                PolicyCall::TeardownOpportunisticLinks
            ]
        );
    }

    #[tokio::test]
    async fn refused_sap_coexistence_rolls_back() {
        let policy = Arc::new(RecordingPolicy::default());
        policy.set_active(Role::Sap);
        policy.set_allow(false);
        let gate = gate(&policy, SapNdpConcurrency::Disallowed);
        let device = DeviceContext::new(caps());
        assert!(gate.pre_enable(&device, 2437).await.is_err());
        assert_eq!(discovery::get_state(&device), DiscoveryState::Disabled);
    }

    #[tokio::test]
    async fn hw_mode_failure_rolls_back() {
        let policy = Arc::new(RecordingPolicy::default());
        policy.fail_hw_mode(PolicyError::HwModeChange { freq: 5745 });
        let gate = gate(&policy, SapNdpConcurrency::Disallowed);
        let device = DeviceContext::new(DeviceCaps { dbs: true, ..caps() });
        assert_eq!(
            gate.pre_enable(&device, 5745).await,
            Err(GateError::HwMode(PolicyError::HwModeChange { freq: 5745 }))
        );
        assert_eq!(discovery::get_state(&device), DiscoveryState::Disabled);
    }

    #[tokio::test]
    async fn disable_racing_hw_mode_change_wins() {
        let policy = Arc::new(RecordingPolicy::default());
        policy.delay_hw_mode(Duration::from_millis(30));
        let gate = gate(&policy, SapNdpConcurrency::Disallowed);
        let device = Arc::new(DeviceContext::new(DeviceCaps { dbs: true, ..caps() }));

        let racer = Arc::clone(&device);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            discovery::try_transition(&racer, DiscoveryState::DisableInProgress).unwrap();
        });

        assert_eq!(
            gate.pre_enable(&device, 2437).await,
            Err(GateError::Superseded)
        );
        assert_eq!(discovery::get_state(&device), DiscoveryState::DisableInProgress);
    }

    #[test]
    fn post_disable_releases_only_registered_session() {
        let policy = Arc::new(RecordingPolicy::default());
        let gate = gate(&policy, SapNdpConcurrency::Disallowed);
        let device = DeviceContext::new(caps());
        gate.post_disable(&device, VdevId(0));
        gate.post_enable(&device, VdevId(0));
        gate.post_disable(&device, VdevId(0));
        assert_eq!(
            policy.calls(),
            vec![
                PolicyCall::RestartOpportunisticTimer,
                PolicyCall::RegisterSession(Role::NanDiscovery, VdevId(0)),
                PolicyCall::RecheckCoexistence,
                PolicyCall::ReleaseSession(Role::NanDiscovery, VdevId(0)),
                PolicyCall::RestartOpportunisticTimer,
            ]
        );
    }

    fn two_ndis(caps: DeviceCaps) -> Registry {
        let registry = Registry::new(4);
        registry.attach_device(caps).unwrap();
        let first = registry
            .create_interface(VdevId(1), "nan0", mac(0xf0), InterfaceMode::Ndi)
            .unwrap();
        registry
            .create_interface(VdevId(2), "nan1", mac(0xf1), InterfaceMode::Ndi)
            .unwrap();
        first.state.lock().active_peers = 1;
        registry
    }

    #[test]
    fn sap_ndp_variant_controls_admission() {
        let policy = Arc::new(RecordingPolicy::default());
        policy.set_active(Role::Sap);
        let registry = two_ndis(caps());
        let device = registry.device().unwrap();

        let strict = gate(&policy, SapNdpConcurrency::Disallowed);
        assert_eq!(
            strict.check_ndp(&device, &registry, VdevId(1)),
            Err(GateError::SapActive)
        );
        let relaxed = gate(&policy, SapNdpConcurrency::Allowed);
        assert_eq!(relaxed.check_ndp(&device, &registry, VdevId(1)), Ok(()));
    }

    #[test]
    fn second_ndi_needs_both_capabilities_independently() {
        let policy = Arc::new(RecordingPolicy::default());
        policy.set_active(Role::Sta);
        let gate = gate(&policy, SapNdpConcurrency::Disallowed);

        let registry = two_ndis(DeviceCaps {
            sta_nan_ndi_ndi: true,
            ..caps()
        });
        let device = registry.device().unwrap();
        assert_eq!(
            gate.check_ndp(&device, &registry, VdevId(2)),
            Err(GateError::NdiDbsUnsupported)
        );

        device.update_caps(DeviceCaps {
            ndi_dbs: true,
            ..caps()
        });
        assert_eq!(
            gate.check_ndp(&device, &registry, VdevId(2)),
            Err(GateError::FourPortUnsupported)
        );

        device.update_caps(DeviceCaps {
            ndi_dbs: true,
            sta_nan_ndi_ndi: true,
            ..caps()
        });
        assert_eq!(gate.check_ndp(&device, &registry, VdevId(2)), Ok(()));
        assert_eq!(gate.check_ndp(&device, &registry, VdevId(1)), Ok(()));
    }

    #[test]
    fn multi_ndi_switch_blocks_second_interface() {
        let policy = Arc::new(RecordingPolicy::default());
        let gate = ConcurrencyGate::new(policy, SapNdpConcurrency::Allowed, false);
        let registry = two_ndis(caps());
        let device = registry.device().unwrap();
        assert_eq!(
            gate.check_ndp(&device, &registry, VdevId(2)),
            Err(GateError::MultiNdiDisabled(VdevId(2)))
        );
    }
}
