// orchestrator.rs - control-plane entry points tying the components together
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::{self, Receiver};
use tracing::{debug, info, warn};

use crate::{
    api::{
        DisableRequest, EnableRequest, EndAllRequest, EndRequest, Firmware, FirmwareCommand,
        FirmwareError, FirmwareEvent, GenericRequest, HostEvent, HostOps, HostOpsError,
        InitiatorRequest, LocalFailure, PolicyEngine, PolicyError, ResponderRequest,
    },
    config::{Config, ConfigError},
    correlator::CorrelatorError,
    discovery::{self, DiscoveryState, TransitionError, DISCOVERY_VDEV},
    dispatcher::{Dispatcher, HostEventSender},
    gate::{ConcurrencyGate, GateError},
    metrics::{Metrics, MetricsError},
    registry::{
        DeviceContext, DiscoveryOutcome, EndAllOutcome, InterfaceContext, InterfaceMode, NdpState,
        Registry, RegistryError,
    },
    serializer::{
        CancelReason, Command, CommandId, CommandKind, CommandLifecycle, CommandPayload,
        Serializer, SerializerError,
    },
    tracker::{SessionTracker, TrackerError},
    types::{DeviceCaps, MacAddr, MacId, ResponseCode, Role, Status, TransactionId, VdevId},
};

#[derive(Debug, Error)]
pub enum NanError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Serializer(#[from] SerializerError),
    #[error(transparent)]
    Correlator(#[from] CorrelatorError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Firmware(#[from] FirmwareError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    HostOps(#[from] HostOpsError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[cfg(feature = "runtime")]
    #[error(transparent)]
    Runtime(#[from] crate::runtime::RuntimeError),
    #[error("request timed out")]
    Timeout,
    #[error("firmware reported {0}")]
    FirmwareStatus(Status),
    #[error("request aborted by a disable")]
    Aborted,
    #[error("request cancelled before firmware answered")]
    Cancelled,
}

/// Transmits serialized commands and reports the ones that never got an answer.
pub(crate) struct NdpLifecycle {
    registry: Arc<Registry>,
    firmware: Arc<dyn Firmware>,
    events: HostEventSender,
}

impl NdpLifecycle {
    pub(crate) fn new(
        registry: Arc<Registry>,
        firmware: Arc<dyn Firmware>,
        events: HostEventSender,
    ) -> Self {
        Self {
            registry,
            firmware,
            events,
        }
    }

    fn fail(&self, command: &Command, failure: LocalFailure) {
        if command.kind() == CommandKind::EndAll {
            self.cancel_end_all(command.vdev());
        }
        self.events.notify(HostEvent::CommandFailed {
            vdev: command.vdev(),
            txn: command.txn(),
            command: command.kind().as_str(),
            failure,
        });
    }

    fn cancel_end_all(&self, vdev: VdevId) {
        let Ok(device) = self.registry.device() else {
            return;
        };
        let pending = {
            let mut state = device.state.lock();
            let pending = state.end_all_vdev == Some(vdev);
            if pending {
                state.end_all_vdev = None;
            }
            pending
        };
        if pending {
            device.end_all_txn.complete(EndAllOutcome::Cancelled);
        }
    }
}

impl CommandLifecycle for NdpLifecycle {
    fn on_activate(&self, command: &Command) -> Result<(), FirmwareError> {
        let next = match command.kind() {
            CommandKind::Initiator | CommandKind::Responder => NdpState::Connecting,
            CommandKind::End | CommandKind::EndAll => NdpState::Ending,
        };
        if !command.interface().is_closing() {
            command.interface().set_ndp_state(next);
        }
        self.firmware
            .send(FirmwareCommand::from(command.payload().clone()))
    }

    fn on_cancel(&self, command: &Command, reason: CancelReason) {
        let failure = match reason {
            CancelReason::ActivationFailed => LocalFailure::ActivationFailed,
            CancelReason::Cancelled | CancelReason::Flushed => LocalFailure::Cancelled,
        };
        self.fail(command, failure);
    }

    fn on_timeout(&self, command: &Command) {
        self.fail(command, LocalFailure::TimedOut);
    }

    fn on_release(&self, command: Command) {
        debug!(vdev = %command.vdev(), id = %command.id(), kind = %command.kind(), "command released");
    }
}

/// NAN discovery and data path orchestrator for one device.
pub struct Nan {
    config: Config,
    registry: Arc<Registry>,
    tracker: Arc<SessionTracker>,
    serializer: Serializer,
    gate: Arc<ConcurrencyGate>,
    dispatcher: Arc<Dispatcher>,
    firmware: Arc<dyn Firmware>,
    policy: Arc<dyn PolicyEngine>,
    metrics: Arc<Metrics>,
}

impl Nan {
    /// Builds the orchestrator. Host events are delivered on the returned receiver.
    pub fn new(
        config: Config,
        firmware: Arc<dyn Firmware>,
        policy: Arc<dyn PolicyEngine>,
        host: Arc<dyn HostOps>,
    ) -> Result<(Self, Receiver<HostEvent>), NanError> {
        config.validate()?;
        let metrics = Arc::new(Metrics::new()?);
        let (tx, rx) = mpsc::channel(config.runtime.host_event_buffer);
        let events = HostEventSender::new(tx);

        let registry = Arc::new(Registry::new(config.limits.max_peers_per_ndi));
        let tracker = Arc::new(SessionTracker::new(
            Arc::clone(&registry),
            Arc::clone(&policy),
            Arc::clone(&metrics),
            config.concurrency.multi_ndi,
            config.limits.max_peer_multicast,
        ));
        let gate = Arc::new(ConcurrencyGate::new(
            Arc::clone(&policy),
            config.effective_sap_ndp(),
            config.concurrency.multi_ndi,
        ));
        let lifecycle = Arc::new(NdpLifecycle::new(
            Arc::clone(&registry),
            Arc::clone(&firmware),
            events.clone(),
        ));
        let serializer = Serializer::new(
            lifecycle,
            Arc::clone(&metrics),
            config.timeouts.command(),
            config.limits.max_pending_commands,
        );
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&tracker),
            serializer.clone(),
            Arc::clone(&gate),
            Arc::clone(&firmware),
            Arc::clone(&policy),
            host,
            Arc::clone(&metrics),
            events,
        ));

        let nan = Self {
            config,
            registry,
            tracker,
            serializer,
            gate,
            dispatcher,
            firmware,
            policy,
            metrics,
        };
        Ok((nan, rx))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    pub fn serializer(&self) -> &Serializer {
        &self.serializer
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn attach_device(&self, caps: DeviceCaps) -> Result<Arc<DeviceContext>, NanError> {
        Ok(self.registry.attach_device(caps)?)
    }

    /// Flushes every interface queue and drops all contexts of the device.
    pub fn detach_device(&self) -> Result<(), NanError> {
        for iface in self.registry.interfaces() {
            self.serializer.flush(iface.id());
        }
        self.registry.detach_device()?;
        Ok(())
    }

    pub fn update_caps(&self, caps: DeviceCaps) -> Result<(), NanError> {
        self.registry.device()?.update_caps(caps);
        Ok(())
    }

    pub fn discovery_state(&self) -> Result<DiscoveryState, NanError> {
        let device = self.registry.device()?;
        Ok(discovery::get_state(&device))
    }

    /// Routes a firmware event through the dispatcher.
    ///
    /// Waits for room in the host event queue before returning.
    pub async fn handle_event(&self, event: FirmwareEvent) {
        self.dispatcher.handle_event(event).await;
    }

    /// Enables NAN discovery and waits for firmware to confirm.
    pub async fn enable(&self, req: EnableRequest) -> Result<MacId, NanError> {
        let device = self.registry.device()?;
        self.metrics.enable_requests.inc();
        let freq = req.social_chan_2g;

        if let Err(err) = self.gate.can_enable(&device, freq) {
            self.reject(&err);
            return Err(err.into());
        }
        if let Err(err) = self.gate.pre_enable(&device, freq).await {
            self.metrics.enable_failures.inc();
            return Err(err.into());
        }
        {
            let mut state = device.state.lock();
            state.social_chan_2g = Some(req.social_chan_2g);
            state.social_chan_5g = req.social_chan_5g;
        }

        let pending = match device.enable_txn.arm() {
            Ok(pending) => pending,
            Err(err) => {
                self.abort_enable(&device);
                return Err(err.into());
            }
        };
        if let Err(err) = self.firmware.send(FirmwareCommand::Enable(req)) {
            warn!(error = %err, "enable request not transmitted");
            self.abort_enable(&device);
            return Err(err.into());
        }
        debug!(freq, cookie = %pending.cookie(), "enable sent; waiting for firmware");

        match pending.wait(self.config.timeouts.enable()).await {
            Ok(DiscoveryOutcome::Enabled { mac_id, .. }) => Ok(mac_id),
            Ok(DiscoveryOutcome::Failed(status)) => Err(NanError::FirmwareStatus(status)),
            Ok(DiscoveryOutcome::Aborted | DiscoveryOutcome::Disabled) => Err(NanError::Aborted),
            Err(CorrelatorError::Timeout) => {
                self.metrics.transaction_timeouts.inc();
                self.abort_enable(&device);
                Err(NanError::Timeout)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Disables NAN discovery and waits for the firmware indication.
    ///
    /// Disabling a disabled device succeeds without contacting firmware.
    pub async fn disable(&self, req: DisableRequest) -> Result<(), NanError> {
        let device = self.registry.device()?;
        self.metrics.disable_requests.inc();
        if discovery::get_state(&device) == DiscoveryState::Disabled {
            debug!("disable requested while disabled");
            return Ok(());
        }

        let previous = match discovery::try_transition(&device, DiscoveryState::DisableInProgress) {
            Ok(previous) => previous,
            Err(err) => {
                self.metrics.rejected_transitions.inc();
                return Err(err.into());
            }
        };
        device.state.lock().explicit_disable = true;
        if previous == DiscoveryState::EnableInProgress {
            device.enable_txn.complete(DiscoveryOutcome::Aborted);
        }

        let pending = match device.disable_txn.arm() {
            Ok(pending) => pending,
            Err(err) => {
                self.finish_disable(&device);
                return Err(err.into());
            }
        };
        if let Err(err) = self.firmware.send(FirmwareCommand::Disable(req)) {
            warn!(error = %err, "disable request not transmitted");
            self.finish_disable(&device);
            return Err(err.into());
        }
        debug!(from = %previous, cookie = %pending.cookie(), "disable sent; waiting for firmware");

        match pending.wait(self.config.timeouts.disable()).await {
            Ok(_) => Ok(()),
            Err(CorrelatorError::Timeout) => {
                self.metrics.transaction_timeouts.inc();
                self.finish_disable(&device);
                Err(NanError::Timeout)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Forwards an opaque discovery request.
    pub fn generic(&self, req: GenericRequest) -> Result<(), NanError> {
        self.registry.device()?;
        Ok(self.firmware.send(FirmwareCommand::Generic(req))?)
    }

    /// Queues an NDP initiator request. The outcome arrives as a [`HostEvent`].
    pub fn initiator(&self, req: InitiatorRequest) -> Result<CommandId, NanError> {
        let device = self.registry.device()?;
        let iface = self.data_interface(req.vdev)?;
        self.gate.check_ndp(&device, &self.registry, req.vdev)?;
        if let Some(channel) = req.channel {
            if !self.policy.allow_coexistence(Role::Ndi, channel.freq) {
                return Err(GateError::CoexistenceRefused {
                    role: Role::Ndi,
                    freq: channel.freq,
                }
                .into());
            }
        }
        Ok(self.serializer.submit(iface, CommandPayload::Initiator(req))?)
    }

    /// Queues the host response to an NDP indication.
    pub fn responder(&self, req: ResponderRequest) -> Result<CommandId, NanError> {
        let device = self.registry.device()?;
        let iface = self.data_interface(req.vdev)?;
        if req.response == ResponseCode::Accept {
            self.gate.check_ndp(&device, &self.registry, req.vdev)?;
        }
        Ok(self.serializer.submit(iface, CommandPayload::Responder(req))?)
    }

    /// Queues an end of the listed NDPs.
    pub fn end(&self, req: EndRequest) -> Result<CommandId, NanError> {
        let iface = self.data_interface(req.vdev)?;
        Ok(self.serializer.submit(iface, CommandPayload::End(req))?)
    }

    /// Ends every NDP on `vdev` and waits until its last peer is gone.
    pub async fn end_all(&self, vdev: VdevId) -> Result<(), NanError> {
        let device = self.registry.device()?;
        let iface = self.data_interface(vdev)?;
        if self.registry.peer_count(vdev) == 0 {
            debug!(%vdev, "end-all with no peers");
            return Ok(());
        }

        let pending = device.end_all_txn.arm()?;
        device.state.lock().end_all_vdev = Some(vdev);
        if let Err(err) = self
            .serializer
            .submit(iface, CommandPayload::EndAll(EndAllRequest { vdev }))
        {
            self.clear_end_all(&device, vdev);
            return Err(err.into());
        }

        match pending.wait(self.config.timeouts.end_all()).await {
            Ok(EndAllOutcome::Done) => Ok(()),
            Ok(EndAllOutcome::Failed(status)) => Err(NanError::FirmwareStatus(status)),
            Ok(EndAllOutcome::Cancelled) => Err(NanError::Cancelled),
            Err(CorrelatorError::Timeout) => {
                self.metrics.transaction_timeouts.inc();
                self.clear_end_all(&device, vdev);
                Err(NanError::Timeout)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Cancels a queued NDP command.
    pub fn cancel(&self, vdev: VdevId, id: CommandId) -> Result<(), NanError> {
        Ok(self.serializer.cancel(vdev, id)?)
    }

    /// Registers a NAN data interface, returning the stored create transaction id.
    pub fn create_ndi(
        &self,
        vdev: VdevId,
        name: &str,
        mac: MacAddr,
        txn: TransactionId,
    ) -> Result<TransactionId, NanError> {
        let iface = self
            .registry
            .create_interface(vdev, name, mac, InterfaceMode::Ndi)?;
        iface.state.lock().create_txn = Some(txn);
        iface.set_ndp_state(NdpState::Created);
        info!(%vdev, name, %mac, %txn, "ndi created");
        Ok(txn)
    }

    /// Tears down a NAN data interface, ending its NDPs first.
    ///
    /// Peers left behind by a failed end-all are released locally before the interface goes.
    pub async fn delete_ndi(&self, vdev: VdevId, txn: TransactionId) -> Result<TransactionId, NanError> {
        let iface = self.data_interface(vdev)?;
        iface.state.lock().delete_txn = Some(txn);
        iface.set_ndp_state(NdpState::Deleting);
        self.serializer.flush(vdev);

        if self.registry.peer_count(vdev) > 0 {
            if let Err(err) = self.end_all(vdev).await {
                warn!(%vdev, error = %err, "end-all before ndi delete failed");
            }
        }
        for peer in self.registry.peers_of(vdev) {
            self.dispatcher.release_peer(&iface, peer.mac());
        }
        self.registry.destroy_interface(vdev)?;
        info!(%vdev, %txn, "ndi deleted");
        Ok(txn)
    }

    fn data_interface(&self, vdev: VdevId) -> Result<Arc<InterfaceContext>, NanError> {
        let iface = self.registry.interface(vdev)?;
        if iface.mode() != InterfaceMode::Ndi {
            return Err(RegistryError::NotDataInterface(vdev).into());
        }
        Ok(iface)
    }

    fn reject(&self, err: &GateError) {
        if matches!(err, GateError::Transition(_)) {
            self.metrics.rejected_transitions.inc();
        }
        warn!(error = %err, "enable rejected");
    }

    /// Rolls an enable that never reached a firmware answer back to `Disabled`.
    fn abort_enable(&self, device: &DeviceContext) {
        self.metrics.enable_failures.inc();
        if discovery::get_state(device) == DiscoveryState::EnableInProgress {
            if let Err(err) = discovery::try_transition(device, DiscoveryState::Disabled) {
                warn!(error = %err, "enable rollback skipped");
            }
            let mut state = device.state.lock();
            state.social_chan_2g = None;
            state.social_chan_5g = None;
        }
        self.policy.restart_opportunistic_timer();
    }

    /// Completes a host disable locally when firmware never answered.
    fn finish_disable(&self, device: &DeviceContext) {
        let vdev = {
            let mut state = device.state.lock();
            state.explicit_disable = false;
            state.disc_vdev.unwrap_or(DISCOVERY_VDEV)
        };
        discovery::force_disabled(device);
        {
            let mut state = device.state.lock();
            state.mac_id = None;
            state.disc_vdev = None;
            state.social_chan_2g = None;
            state.social_chan_5g = None;
        }
        self.gate.post_disable(device, vdev);
    }

    fn clear_end_all(&self, device: &DeviceContext, vdev: VdevId) {
        let mut state = device.state.lock();
        if state.end_all_vdev == Some(vdev) {
            state.end_all_vdev = None;
        }
    }
}
