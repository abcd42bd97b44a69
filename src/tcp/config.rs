/// Standard TTL once a connection has seen traffic from its peer.
pub const TCP_STD_TTL: u8 = 64;

/// Short TTL used while stimulating firewall/NAT mappings during connect.
pub const TCP_DEFAULT_FIREWALL_TTL: u8 = 4;

/// Default receive window ceiling in bytes.
pub const TCP_MAX_WIN: u32 = 65500;

/// Default keepalive interval in seconds.
pub const TCP_ALIVE_TIMEOUT: f64 = 15.0;

/// Initial round-trip estimate (and hence retransmission timeout) in seconds.
pub const TCP_RETRANS_TIMEOUT: f64 = 1.0;

/// Seconds of total silence after which a live connection is torn down.
pub const TCP_NO_PKT_TIMEOUT: f64 = 60.0;

/// Tuning knobs of a [`TcpStream`](super::TcpStream).
#[derive(Debug, Clone, PartialEq)]
pub struct TcpConfig {
    /// Ceiling for the advertised receive window.
    pub max_win_size: u32,
    /// Idle interval after which a bare ACK keeps the path warm.
    pub keepalive_timeout: f64,
    /// Silence interval after which the connection is declared dead.
    pub no_pkt_timeout: f64,
    /// Seed for the RTT estimator.
    pub initial_rtt: f64,
    /// TTL of the first SYN. Leave at [`TCP_STD_TTL`] for ordinary
    /// connections; set [`TCP_DEFAULT_FIREWALL_TTL`] to ramp outgoing
    /// stimulus through NATs that must see traffic before passing inbound.
    pub init_ttl: u8,
    /// Retransmissions of a single packet before the connection fails.
    pub max_pkt_retransmit: u32,
    /// Retransmissions allowed for a SYN still below standard TTL.
    pub max_syn_retransmit: u32,
    /// When set, a read that cannot be fully satisfied while the stream is
    /// live reports would-block instead of a short count.
    pub no_partial_read: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_win_size: TCP_MAX_WIN,
            keepalive_timeout: TCP_ALIVE_TIMEOUT,
            no_pkt_timeout: TCP_NO_PKT_TIMEOUT,
            initial_rtt: TCP_RETRANS_TIMEOUT,
            init_ttl: TCP_STD_TTL,
            max_pkt_retransmit: 20,
            max_syn_retransmit: 1000,
            no_partial_read: false,
        }
    }
}
