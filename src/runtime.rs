#![cfg(feature = "runtime")]

//! Tokio runtime scaffolding for feeding firmware events into a [`Nan`].
//!
//! Discovery and datapath events travel on separate bounded channels, each drained by its own
//! consumer task, so a burst of datapath traffic never delays an enable response. `spawn_nan`
//! launches both consumers and hands back a [`NanHandle`] whose [`FirmwareEventSink`] is what the
//! firmware receive path pushes into.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError, Receiver, Sender},
        watch,
    },
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::{
    api::{DatapathEvent, DiscoveryEvent, FirmwareEvent},
    config::RuntimeSettings,
    orchestrator::Nan,
};

/// Configuration parameters for the event consumers.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Capacity of the discovery event channel.
    pub discovery_buffer: usize,
    /// Capacity of the datapath event channel.
    pub datapath_buffer: usize,
    /// Grace period allowed for the consumers to stop during [`NanHandle::shutdown`].
    pub shutdown_grace: Duration,
}

impl RuntimeConfig {
    /// Sets the discovery channel capacity.
    pub fn with_discovery_buffer(mut self, capacity: usize) -> Self {
        self.discovery_buffer = capacity.max(1);
        self
    }

    /// Sets the datapath channel capacity.
    pub fn with_datapath_buffer(mut self, capacity: usize) -> Self {
        self.datapath_buffer = capacity.max(1);
        self
    }

    /// Sets the grace period used when shutting down the consumers.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    fn normalize(&mut self) {
        if self.discovery_buffer == 0 {
            self.discovery_buffer = 1;
        }
        if self.datapath_buffer == 0 {
            self.datapath_buffer = 1;
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from(&RuntimeSettings::default())
    }
}

impl From<&RuntimeSettings> for RuntimeConfig {
    fn from(settings: &RuntimeSettings) -> Self {
        Self {
            discovery_buffer: settings.discovery_event_buffer,
            datapath_buffer: settings.datapath_event_buffer,
            shutdown_grace: Duration::from_millis(settings.shutdown_grace_ms),
        }
    }
}

/// Reason why an event consumer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// [`NanHandle::shutdown`] was called or the handle was dropped.
    Shutdown,
    /// Every sink for the channel was dropped.
    ChannelClosed,
}

/// Errors returned by the runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0} event queue is full")]
    QueueFull(&'static str),
    #[error("event runtime channel closed")]
    ChannelClosed,
    #[error("event consumer join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("event runtime shutdown timed out")]
    ShutdownTimeout,
}

/// Cloneable entry point for firmware events.
#[derive(Debug, Clone)]
pub struct FirmwareEventSink {
    discovery: Sender<DiscoveryEvent>,
    datapath: Sender<DatapathEvent>,
}

impl FirmwareEventSink {
    /// Queues an event without waiting.
    pub fn deliver(&self, event: FirmwareEvent) -> Result<(), RuntimeError> {
        match event {
            FirmwareEvent::Discovery(event) => self.deliver_discovery(event),
            FirmwareEvent::Datapath(event) => self.deliver_datapath(event),
        }
    }

    pub fn deliver_discovery(&self, event: DiscoveryEvent) -> Result<(), RuntimeError> {
        self.discovery
            .try_send(event)
            .map_err(|err| map_send_error("discovery", err))
    }

    pub fn deliver_datapath(&self, event: DatapathEvent) -> Result<(), RuntimeError> {
        self.datapath
            .try_send(event)
            .map_err(|err| map_send_error("datapath", err))
    }
}

fn map_send_error<E>(channel: &'static str, err: TrySendError<E>) -> RuntimeError {
    match err {
        TrySendError::Full(_) => {
            warn!(channel, "firmware event queue full; event rejected");
            RuntimeError::QueueFull(channel)
        }
        TrySendError::Closed(_) => RuntimeError::ChannelClosed,
    }
}

/// Handle to a running orchestrator.
pub struct NanHandle {
    nan: Arc<Nan>,
    sink: FirmwareEventSink,
    shutdown: watch::Sender<bool>,
    consumers: Vec<JoinHandle<StopReason>>,
    config: Arc<RuntimeConfig>,
}

impl NanHandle {
    pub fn nan(&self) -> &Arc<Nan> {
        &self.nan
    }

    pub fn sink(&self) -> FirmwareEventSink {
        self.sink.clone()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Stops both consumers after they drained what was already queued.
    pub async fn shutdown(self) -> Result<(), RuntimeError> {
        let NanHandle {
            shutdown,
            consumers,
            config,
            ..
        } = self;
        let _ = shutdown.send(true);

        let join_all = async {
            for consumer in consumers {
                let reason = consumer.await?;
                debug!(?reason, "event consumer joined");
            }
            Ok::<(), RuntimeError>(())
        };

        if config.shutdown_grace.is_zero() {
            return join_all.await;
        }
        match time::timeout(config.shutdown_grace, join_all).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::ShutdownTimeout),
        }
    }
}

/// Spawns the discovery and datapath consumers for `nan`.
pub fn spawn_nan(nan: Arc<Nan>, mut config: RuntimeConfig) -> NanHandle {
    config.normalize();
    let (discovery_tx, discovery_rx) = mpsc::channel(config.discovery_buffer);
    let (datapath_tx, datapath_rx) = mpsc::channel(config.datapath_buffer);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumers = vec![
        tokio::spawn(run_consumer(
            "discovery",
            Arc::clone(&nan),
            discovery_rx,
            shutdown_rx.clone(),
        )),
        tokio::spawn(run_consumer(
            "datapath",
            Arc::clone(&nan),
            datapath_rx,
            shutdown_rx,
        )),
    ];

    NanHandle {
        nan,
        sink: FirmwareEventSink {
            discovery: discovery_tx,
            datapath: datapath_tx,
        },
        shutdown: shutdown_tx,
        consumers,
        config: Arc::new(config),
    }
}

async fn run_consumer<E>(
    channel: &'static str,
    nan: Arc<Nan>,
    mut events: Receiver<E>,
    mut shutdown: watch::Receiver<bool>,
) -> StopReason
where
    E: Into<FirmwareEvent> + Send + 'static,
{
    let reason = loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    while let Ok(event) = events.try_recv() {
                        nan.handle_event(event.into()).await;
                    }
                    break StopReason::Shutdown;
                }
            }
            maybe_event = events.recv() => {
                match maybe_event {
                    Some(event) => nan.handle_event(event.into()).await,
                    None => break StopReason::ChannelClosed,
                }
            }
        }
    };
    debug!(channel, ?reason, "event consumer stopped");
    reason
}
