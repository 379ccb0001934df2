// discovery.rs - NAN discovery state machine
use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};

use crate::{registry::DeviceContext, types::VdevId};

/// Vdev reported to the policy engine when firmware runs discovery without a dedicated interface.
pub const DISCOVERY_VDEV: VdevId = VdevId(0);

/// Device-scoped NAN discovery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DiscoveryState {
    #[default]
    Disabled,
    EnableInProgress,
    Enabled,
    DisableInProgress,
}

impl DiscoveryState {
    /// Whether `self -> next` is an edge of the discovery state machine.
    pub const fn can_transition_to(self, next: DiscoveryState) -> bool {
        use DiscoveryState::*;
        matches!(
            (self, next),
            (Disabled, EnableInProgress)
                | (EnableInProgress, Enabled)
                | (EnableInProgress, Disabled)
                | (EnableInProgress, DisableInProgress)
                | (Enabled, DisableInProgress)
                | (DisableInProgress, Disabled)
        )
    }
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DiscoveryState::Disabled => "disabled",
            DiscoveryState::EnableInProgress => "enable_in_progress",
            DiscoveryState::Enabled => "enabled",
            DiscoveryState::DisableInProgress => "disable_in_progress",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    #[error("discovery already {0}")]
    Redundant(DiscoveryState),
    #[error("invalid discovery transition {from} -> {to}")]
    Invalid {
        from: DiscoveryState,
        to: DiscoveryState,
    },
}

/// Commits `next` if it is a legal edge from the current state, returning the previous state.
pub fn try_transition(
    device: &DeviceContext,
    next: DiscoveryState,
) -> Result<DiscoveryState, TransitionError> {
    let mut state = device.state.lock();
    let current = state.discovery;
    if current == next {
        warn!(state = %current, "redundant discovery transition rejected");
        return Err(TransitionError::Redundant(current));
    }
    if !current.can_transition_to(next) {
        warn!(from = %current, to = %next, "invalid discovery transition rejected");
        return Err(TransitionError::Invalid {
            from: current,
            to: next,
        });
    }
    state.discovery = next;
    debug!(from = %current, to = %next, "discovery state committed");
    Ok(current)
}

pub fn get_state(device: &DeviceContext) -> DiscoveryState {
    device.state.lock().discovery
}

/// Drives the device to `Disabled` through legal edges only. Returns the state it started from.
pub fn force_disabled(device: &DeviceContext) -> DiscoveryState {
    let mut state = device.state.lock();
    let start = state.discovery;
    if matches!(
        start,
        DiscoveryState::EnableInProgress | DiscoveryState::Enabled
    ) {
        state.discovery = DiscoveryState::DisableInProgress;
        debug!(from = %start, to = %state.discovery, "discovery state committed");
    }
    if state.discovery == DiscoveryState::DisableInProgress {
        state.discovery = DiscoveryState::Disabled;
        debug!(
            from = %DiscoveryState::DisableInProgress,
            to = %DiscoveryState::Disabled,
            "discovery state committed"
        );
    }
    start
}
