// types.rs - identifiers and value types shared across the control plane
use std::{fmt, str::FromStr};

use thiserror::Error;

/// 48-bit IEEE MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// The all-zero address.
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// IPv6 solicited-node multicast MAC for the link-local address derived from this MAC.
    ///
    /// The low 24 bits of the EUI-64 interface identifier are the low 24 bits of the MAC, so the
    /// solicited-node group `ff02::1:ffXX:YYZZ` maps to `33:33:ff:XX:YY:ZZ`.
    pub const fn solicited_node_multicast(&self) -> MacAddr {
        MacAddr([0x33, 0x33, 0xff, self.0[3], self.0[4], self.0[5]])
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed mac address '{0}'")]
pub struct MacParseError(pub String);

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(|| MacParseError(s.to_string()))?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(MacParseError(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| MacParseError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(MacParseError(s.to_string()));
        }
        Ok(Self(bytes))
    }
}

/// Virtual interface identifier assigned by the object framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VdevId(pub u8);

impl fmt::Display for VdevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vdev{}", self.0)
    }
}

/// NDP instance identifier allocated by firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NdpInstanceId(pub u32);

impl fmt::Display for NdpInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ndp{}", self.0)
    }
}

/// Caller-chosen correlation number carried on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransactionId(pub u16);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// MAC (radio) identifier the firmware selected for discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacId(pub u8);

/// Operating channel bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelWidth {
    #[default]
    Mhz20,
    Mhz40,
    Mhz80,
    Mhz160,
    Mhz80P80,
}

/// Channel/width/spatial-stream tuple negotiated for an NDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelInfo {
    /// Primary frequency in MHz.
    pub freq: u32,
    pub width: ChannelWidth,
    /// Number of spatial streams.
    pub nss: u8,
}

impl ChannelInfo {
    pub const fn new(freq: u32, width: ChannelWidth, nss: u8) -> Self {
        Self { freq, width, nss }
    }

    pub const fn is_2ghz(&self) -> bool {
        self.freq >= 2412 && self.freq <= 2484
    }
}

/// Radio roles known to the policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Sta,
    Sap,
    P2pGo,
    P2pClient,
    NanDiscovery,
    Ndi,
    Tdls,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Role::Sta => "sta",
            Role::Sap => "sap",
            Role::P2pGo => "p2p_go",
            Role::P2pClient => "p2p_client",
            Role::NanDiscovery => "nan_disc",
            Role::Ndi => "ndi",
            Role::Tdls => "tdls",
        };
        f.write_str(label)
    }
}

/// Role the local device plays in an NDP negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NdpRole {
    Initiator,
    Responder,
}

/// How the firmware treats incoming NDP requests on an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcceptPolicy {
    /// Each request is forwarded to the host for an explicit response.
    #[default]
    None,
    /// Firmware accepts every request on its own.
    All,
}

/// Response carried by a responder request or a confirm event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Accept,
    Reject,
    Defer,
}

/// Completion status reported by firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    /// Failure with the firmware reason code.
    Failure(u32),
}

impl Status {
    pub const fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }

    pub const fn reason(&self) -> u32 {
        match self {
            Status::Success => 0,
            Status::Failure(reason) => *reason,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => f.write_str("success"),
            Status::Failure(reason) => write!(f, "failure({reason})"),
        }
    }
}

/// Capability flags reported for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceCaps {
    /// Hardware supports dual-band-simultaneous modes.
    pub dbs: bool,
    /// Firmware supports NAN discovery alongside an active SAP.
    pub sap_coexistence: bool,
    /// NAN discovery requires a dedicated vdev.
    pub vdev_creation: bool,
    /// Host drives NAN concurrency decisions.
    pub host_concurrency_control: bool,
    /// NDI may operate on a band other than the STA.
    pub ndi_dbs: bool,
    /// STA + NAN discovery + two NDIs.
    pub sta_nan_ndi_ndi: bool,
}
