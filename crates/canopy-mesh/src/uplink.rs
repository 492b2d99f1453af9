//! Notices destined for the external HTTP uplink.
//!
//! The core never performs I/O; it emits these values and the daemon's uplink
//! worker turns them into fire-and-forget GET requests. Delivery is lossy by
//! design and must never block the scheduler.

/// One best-effort notification for the uplink sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UplinkNotice {
    /// A node reported a new sensor status.
    StatusChange { node: String, status: u32 },
    /// Per-command statistic (ack/timeout/raw status trace).
    CommandTrace { node: String, text: String },
    /// A node came up or went down.
    AliveChanged { node: String, alive: bool },
    /// Periodic beacon: at least one node is available.
    Alive,
    /// Pre-built request URL (switch-kind status push).
    RawRequest { url: String },
}
