use std::net::{IpAddr, SocketAddr};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Default number of media lines relayed per leg.
pub const DEFAULT_MAX_RELAY_STREAMS: usize = 3;

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct BindConfig {
    pub address: IpAddr,
    /// Optional Linux interface name for SO_BINDTODEVICE.
    pub interface: Option<String>,
}

impl BindConfig {
    pub fn socket_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.address, port)
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub bind: BindConfig,
    /// Address written into rewritten SDP. Falls back to the bind address.
    pub advertised_address: Option<IpAddr>,
    pub port_range: PortRange,
    /// Maximum number of media lines relayed per leg.
    pub max_relay_streams: usize,
}

impl MediaConfig {
    pub fn advertised_ip(&self) -> IpAddr {
        self.advertised_address.unwrap_or(self.bind.address)
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    /// Number of even ports available for RTP in the range.
    pub fn rtp_slots(&self) -> usize {
        if self.max < self.min {
            return 0;
        }
        (usize::from(self.max - self.min) / 2) + 1
    }
}

/// How a body is treated when relayed between legs.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyModeConfig {
    #[default]
    Transparent,
    SdpFilter,
}

/// Method used for session refresh.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshMethod {
    #[default]
    Invite,
    Update,
    /// UPDATE when the peer advertises it in Allow, re-INVITE otherwise.
    UpdateFallbackInvite,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Caller legs relay every request from the start instead of waiting
    /// for the application to connect a callee.
    pub relay_only: bool,
    pub rtp_relay: bool,
    /// Re-INVITE the caller with early media SDP when not in relay-only mode.
    pub relay_early_media_sdp: bool,
    pub body_mode: BodyModeConfig,
    /// Media kinds (audio, video, ...) disabled by the SDP filter.
    pub filtered_media: Vec<String>,
    pub refresh_method: RefreshMethod,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct B2bConfig {
    pub media: MediaConfig,
    pub session: SessionConfig,
}
