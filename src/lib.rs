// nanlink public library surface.
// NAN discovery and NAN data path control plane.

pub mod types;

pub mod config;

pub mod metrics;

pub mod api;

pub mod correlator;

pub mod discovery;

pub mod registry;

pub mod tracker;

pub mod serializer;

pub mod gate;

pub mod dispatcher;

pub mod orchestrator;

#[cfg(feature = "runtime")]
pub mod runtime;

#[cfg(test)]
pub(crate) mod testing;

pub use types::{
    AcceptPolicy, ChannelInfo, ChannelWidth, DeviceCaps, MacAddr, MacId, MacParseError,
    NdpInstanceId, NdpRole, ResponseCode, Role, Status, TransactionId, VdevId,
};

pub use config::{
    Concurrency, Config, ConfigError, Limits, RuntimeSettings, SapNdpConcurrency, Timeouts,
};

pub use metrics::{Metrics, MetricsError};

pub use api::{
    DatapathEvent, DisableRequest, DiscoveryEvent, EnableRequest, EndAllRequest,
    EndIndicationEntry, EndRequest, Firmware, FirmwareCommand, FirmwareError, FirmwareEvent,
    GenericRequest, HostEvent, HostOps, HostOpsError, InitiatorRequest, LocalFailure,
    PolicyEngine, PolicyError, ResponderRequest, SecurityParams,
};

pub use correlator::{Cookie, CorrelatorError, PendingTransaction, TransactionSlot};

pub use discovery::{DiscoveryState, TransitionError};

pub use registry::{
    DeviceContext, DiscoveryOutcome, EndAllOutcome, InterfaceContext, InterfaceMode, NdpState,
    PeerContext, Registry, RegistryError,
};

pub use tracker::{PrimaryChange, SessionTracker, TrackerError};

pub use serializer::{
    CancelReason, Command, CommandId, CommandKind, CommandLifecycle, CommandPayload, Completed,
    Serializer, SerializerError,
};

pub use gate::{ConcurrencyGate, GateError};

pub use dispatcher::{Dispatcher, HostEventSender};

pub use orchestrator::{Nan, NanError};

#[cfg(feature = "runtime")]
pub use runtime::{
    spawn_nan, FirmwareEventSink, NanHandle, RuntimeConfig, RuntimeError, StopReason,
};
