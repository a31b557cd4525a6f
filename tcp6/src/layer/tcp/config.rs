//! Namespace configuration.
use core::ops::RangeInclusive;

use crate::time::Duration;

/// When to answer SYNs with cookies instead of storing a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SynCookies {
    /// Never, an overflowing request table drops SYNs.
    Disabled,
    /// Only when the request table of the listener is full.
    OnOverflow,
    /// For every SYN.
    Always,
}

/// Keepalive probing of idle connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Keepalive {
    /// Idle time before the first probe.
    pub idle: Duration,
    /// Time between unanswered probes.
    pub interval: Duration,
    /// Unanswered probes before the connection is aborted.
    pub probes: u32,
}

/// The tunables of a namespace.
///
/// The defaults follow common kernel defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Cookie policy of listeners.
    pub syncookies: SynCookies,
    /// Half-open requests stored per listener.
    pub max_syn_backlog: usize,
    /// Lifetime of a time-wait record.
    pub time_wait: Duration,
    /// How long an orphaned connection waits in FIN-WAIT-2.
    pub fin_timeout: Duration,
    /// Initial retransmission timeout.
    pub rto_initial: Duration,
    /// Upper bound of the backed off retransmission timeout.
    pub rto_max: Duration,
    /// Retransmissions of a SYN before the connect fails.
    pub syn_retries: u32,
    /// Retransmissions of a SYN-ACK before a request is dropped.
    pub synack_retries: u32,
    /// Retransmissions on a synchronized connection before it is aborted.
    pub retries: u32,
    /// Closed connections still finishing their shutdown.
    pub max_orphans: usize,
    /// Records in the time-wait table.
    pub max_tw_buckets: usize,
    /// Segments queued while a socket is owned.
    pub backlog_limit: usize,
    /// The receive window we offer, in octets.
    pub receive_window: u32,
    /// Our window scale, offered on every SYN.
    pub window_scale: u8,
    /// Offer timestamps on active opens.
    pub timestamps: bool,
    /// Offer selective acknowledgments.
    pub sack: bool,
    /// Keepalive probing, off by default.
    pub keepalive: Option<Keepalive>,
    /// Report errors of synchronized connections as hard errors.
    pub recverr: bool,
    /// Abort synchronized connections on hard errors.
    pub abort_on_hard_error: bool,
    /// Reflect the flow label of a segment in resets sent without a socket.
    pub flowlabel_reflect_reset: bool,
    /// Ports used for implicit binds.
    pub ephemeral_ports: RangeInclusive<u16>,
    /// Minimum interval between two signature mismatch log lines.
    pub auth_log_interval: Duration,
    /// The hop limit of all segments we send.
    pub hop_limit: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            syncookies: SynCookies::OnOverflow,
            max_syn_backlog: 128,
            time_wait: Duration::from_secs(60),
            fin_timeout: Duration::from_secs(60),
            rto_initial: Duration::from_secs(1),
            rto_max: Duration::from_secs(120),
            syn_retries: 6,
            synack_retries: 5,
            retries: 15,
            max_orphans: 4096,
            max_tw_buckets: 4096,
            backlog_limit: 256,
            receive_window: 65535 << 7,
            window_scale: 7,
            timestamps: true,
            sack: true,
            keepalive: None,
            recverr: false,
            abort_on_hard_error: false,
            flowlabel_reflect_reset: false,
            ephemeral_ports: 32768..=60999,
            auth_log_interval: Duration::from_secs(1),
            hop_limit: 64,
        }
    }
}
