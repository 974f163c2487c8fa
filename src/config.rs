//! Port numbers and protocol timing constants.

use std::net::Ipv4Addr;
use std::time::Duration;

/// UDP port for HDHomeRun discovery requests, broadcast to 255.255.255.255.
/// Defined as HDHOMERUN_DISCOVER_UDP_PORT in libhdhomerun's hdhomerun_pkt.h.
pub const DISCOVERY_PORT: u16 = 65001;

/// TCP port the tunnel runs over. Reuses the discovery port number by
/// convention; any port works as long as both agents agree.
pub const TUNNEL_PORT: u16 = 65001;

/// How long the responder agent keeps a query's socket open for replies.
/// The reply count is unknown up front (several devices may answer one
/// broadcast), so the window is time-bounded rather than count-bounded.
pub const REPLY_WINDOW: Duration = Duration::from_millis(500);

/// Delay between tunnel reconnection attempts on the capture side.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Configuration for a [`CaptureAgent`](crate::agent::CaptureAgent).
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Address the broadcast listener binds to.
    pub listen_addr: Ipv4Addr,

    /// UDP port discovery queries arrive on.
    pub discovery_port: u16,

    /// TCP port of the responder's tunnel listener.
    pub tunnel_port: u16,

    /// Delay before retrying a failed tunnel connection.
    pub reconnect_delay: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            listen_addr: Ipv4Addr::UNSPECIFIED,
            discovery_port: DISCOVERY_PORT,
            tunnel_port: TUNNEL_PORT,
            reconnect_delay: RECONNECT_DELAY,
        }
    }
}

/// Configuration for a [`ResponderAgent`](crate::agent::ResponderAgent).
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Address the tunnel listener binds to.
    pub bind_addr: Ipv4Addr,

    /// TCP port the tunnel listener binds to.
    pub tunnel_port: u16,

    /// Address relayed queries are broadcast to.
    pub broadcast_addr: Ipv4Addr,

    /// UDP port relayed queries are broadcast on.
    pub discovery_port: u16,

    /// How long replies to one query are collected before its socket closes.
    pub reply_window: Duration,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            bind_addr: Ipv4Addr::UNSPECIFIED,
            tunnel_port: TUNNEL_PORT,
            broadcast_addr: Ipv4Addr::BROADCAST,
            discovery_port: DISCOVERY_PORT,
            reply_window: REPLY_WINDOW,
        }
    }
}
