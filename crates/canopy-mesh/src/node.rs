//! Per-node state machine.
//!
//! A node does not carry one big lifecycle enum. Its progress is a set of
//! orthogonal condition flags plus a single pending mutation that is applied
//! when the in-flight command is acknowledged. Repair is always "set one flag
//! back to the work-owed state and let the next poll re-emit", which keeps
//! the whole priority order in one function:
//!
//! ```text
//!   back-off gate > gateway chain > retransmit > in-flight > injected
//!   > connect > routes > keepalive > status-channel rebuild > kind-specific
//! ```

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::protocol::{Command, STILL_CONFIGURED};
use crate::sensor::SensorState;
use crate::switch::SwitchState;
use crate::uplink::UplinkNotice;

/// Stable arena index of a node inside the registry.
pub type NodeIdx = usize;

/// Orthogonal condition flags driving the next-message policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// Link-layer session to the node is open.
    pub con: bool,
    /// Routing table has been installed.
    pub routes: bool,
    /// A keepalive ping is owed.
    pub check: bool,
    /// A retransmit is owed for the in-flight command.
    pub rt: bool,
    /// Kind-specific configuration completed.
    pub init_done: bool,
    /// Status channel must be rebuilt after a reconnect.
    pub rebuild_sch: bool,
}

/// The single deferred effect applied to the node when its in-flight command
/// is acked. Exactly one variant exists per emission site of the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pending {
    /// Operator-injected command; acking it changes nothing.
    Injected,
    /// `connect` -> `con = true` plus the reconnect bookkeeping.
    Connect,
    /// `reset_routes` -> `routes = true`.
    Routes,
    /// `authping` -> `check = false`.
    Check,
    /// `rebuild_status_channel` -> `rebuild_sch = false`.
    RebuildSch,
    /// Channel calibration -> advance the channel cursor.
    Channel,
    /// `cfg_status_change_indicator` -> indicator configured.
    Indicator,
    /// `enable_sensor` -> `init_done = true`.
    Enable,
    /// `led` -> record the applied colour vector.
    Led(Vec<u32>),
}

/// Kind-specific extension state.
#[derive(Debug, Clone)]
pub enum Kind {
    Base,
    Sensor(SensorState),
    Switch(SwitchState),
}

/// Per-node protocol timing parameters.
#[derive(Debug, Clone, Copy)]
pub struct NodeSettings {
    /// Seconds the radio path may take per hop; scales the connect timeout.
    pub hop_timeout: u64,
    /// Retransmissions allowed before a command is declared failed.
    pub max_retransmissions: u32,
    /// Keepalive period.
    pub check_interval: Duration,
    /// Back-off after a terminal connect failure.
    pub reconnect_delay: Duration,
}

/// State-machine violations surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("node {0} received an ACK with no outstanding command")]
    UnexpectedAck(String),
}

/// Outcome of a `###TIMEOUT` delivered to a node.
#[derive(Debug, Default)]
pub struct TimeoutOutcome {
    /// The retransmission budget is exhausted; the upstream path should be
    /// revalidated.
    pub gave_up: bool,
    pub notices: Vec<UplinkNotice>,
}

/// One leaf of the mesh.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub id: u32,
    /// Arena index of the upstream node; `None` means directly on the root.
    pub gateway: Option<NodeIdx>,
    /// Protocol id of the upstream node (0 for the root).
    pub gateway_id: u32,
    /// Hops to the root, >= 1. Precomputed at config load.
    pub route_length: u32,
    pub settings: NodeSettings,
    pub flags: Flags,
    pub kind: Kind,
    pub last_status: Option<u32>,
    /// `reset_routes` argument, precomputed at config load.
    routes_arg: String,
    rt_count: u32,
    pending: Option<Pending>,
    injected: Option<Command>,
    wait_until: Option<Instant>,
    last_ack: Option<Instant>,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        id: u32,
        gateway: Option<NodeIdx>,
        gateway_id: u32,
        route_length: u32,
        routes_arg: String,
        settings: NodeSettings,
        kind: Kind,
    ) -> Self {
        Node {
            name,
            id,
            gateway,
            gateway_id,
            route_length,
            settings,
            flags: Flags::default(),
            kind,
            last_status: None,
            routes_arg,
            rt_count: 0,
            pending: None,
            injected: None,
            wait_until: None,
            last_ack: None,
        }
    }

    /// Drop all runtime state, as after a link loss. Configuration survives.
    pub fn reset_runtime(&mut self) {
        self.flags = Flags::default();
        self.last_status = None;
        self.rt_count = 0;
        self.pending = None;
        self.injected = None;
        self.wait_until = None;
        self.last_ack = None;
        match &mut self.kind {
            Kind::Base => {}
            Kind::Sensor(s) => s.reset_runtime(),
            Kind::Switch(s) => s.reset_runtime(),
        }
    }

    // ─── Next-message policy ────────────────────────────────────────────────

    /// Produce the next command this node wants on the link, if any.
    ///
    /// `gateway_available` is the availability of the full gateway chain
    /// (true when the node hangs directly off the root).
    pub fn next_message(&mut self, now: Instant, gateway_available: bool) -> Option<Command> {
        if self.wait_until.is_some_and(|t| t > now) {
            return None;
        }

        if !gateway_available {
            return None;
        }

        if self.flags.rt {
            self.flags.rt = false;
            self.rt_count += 1;
            return Some(Command::node(self.id, "retransmit"));
        }

        if self.pending.is_some() {
            return None;
        }

        if let Some(cmd) = self.injected.take() {
            self.pending = Some(Pending::Injected);
            return Some(cmd);
        }

        if !self.flags.con {
            info!(node = %self.name, "connecting");
            self.pending = Some(Pending::Connect);
            let timeout = self.settings.hop_timeout * u64::from(self.route_length);
            return Some(Command::node_with_args(
                self.id,
                "connect",
                format_args!("{} {}", self.gateway_id, timeout),
            ));
        }

        if !self.flags.routes {
            self.pending = Some(Pending::Routes);
            return Some(Command::node_with_args(
                self.id,
                "reset_routes",
                &self.routes_arg,
            ));
        }

        let check_due = self
            .last_ack
            .map_or(true, |t| t + self.settings.check_interval <= now);
        if self.flags.check || check_due {
            debug!(node = %self.name, "keepalive check");
            self.pending = Some(Pending::Check);
            return Some(Command::node(self.id, "authping"));
        }

        if self.flags.rebuild_sch {
            self.pending = Some(Pending::RebuildSch);
            return Some(Command::node(self.id, "rebuild_status_channel"));
        }

        let id = self.id;
        let flags = self.flags;
        let next = match &self.kind {
            Kind::Base => None,
            Kind::Sensor(s) => s.next_message(id, flags),
            Kind::Switch(s) => s.next_message(id, flags),
        };
        if let Some((cmd, pending)) = next {
            self.pending = Some(pending);
            return Some(cmd);
        }
        None
    }

    // ─── Response outcomes ──────────────────────────────────────────────────

    /// Apply the pending mutation for an acked command.
    pub fn on_ack(&mut self, code: u32, now: Instant) -> Result<Vec<UplinkNotice>, StateError> {
        let Some(pending) = self.pending.take() else {
            return Err(StateError::UnexpectedAck(self.name.clone()));
        };

        let mut notices = Vec::new();
        match pending {
            Pending::Injected => {}
            Pending::Connect => {
                self.flags.con = true;
                if self.flags.init_done && code == STILL_CONFIGURED {
                    info!(node = %self.name, "reconnected to still configured node");
                    self.flags.rebuild_sch = true;
                } else {
                    info!(node = %self.name, code, "connected");
                    self.flags.rebuild_sch = false;
                    self.flags.routes = false;
                    self.flags.init_done = false;
                }
                let init_done = self.flags.init_done;
                match &mut self.kind {
                    Kind::Base => {}
                    Kind::Sensor(s) => {
                        notices.push(UplinkNotice::AliveChanged {
                            node: self.name.clone(),
                            alive: true,
                        });
                        if !init_done {
                            s.reset_init();
                        }
                    }
                    Kind::Switch(s) => {
                        if !init_done {
                            s.reset_init();
                        }
                    }
                }
            }
            Pending::Routes => self.flags.routes = true,
            Pending::Check => self.flags.check = false,
            Pending::RebuildSch => self.flags.rebuild_sch = false,
            Pending::Channel => match &mut self.kind {
                Kind::Base => {}
                Kind::Sensor(s) => s.ch_init += 1,
                Kind::Switch(s) => s.ch_init += 1,
            },
            Pending::Indicator => {
                if let Kind::Switch(s) = &mut self.kind {
                    s.cssi_done = true;
                }
            }
            Pending::Enable => self.flags.init_done = true,
            Pending::Led(applied) => match &mut self.kind {
                Kind::Base => {}
                Kind::Sensor(s) => s.led_applied = Some(applied),
                Kind::Switch(s) => s.led_applied = Some(applied),
            },
        }

        self.flags.rt = false;
        self.flags.check = false;
        self.rt_count = 0;
        self.last_ack = Some(now);
        Ok(notices)
    }

    /// Handle a `###TIMEOUT` for the in-flight command.
    pub fn on_timeout(&mut self, now: Instant) -> TimeoutOutcome {
        if self.rt_count >= self.settings.max_retransmissions {
            let mut outcome = TimeoutOutcome {
                gave_up: true,
                notices: Vec::new(),
            };
            if !self.flags.con {
                warn!(
                    node = %self.name,
                    delay_s = self.settings.reconnect_delay.as_secs(),
                    "connection failed, backing off before the next attempt"
                );
                self.wait_until = Some(now + self.settings.reconnect_delay);
                if matches!(self.kind, Kind::Sensor(_)) {
                    outcome.notices.push(UplinkNotice::AliveChanged {
                        node: self.name.clone(),
                        alive: false,
                    });
                }
            }
            self.flags.con = false;
            self.pending = None;
            self.flags.check = true;
            self.rt_count = 0;
            outcome
        } else {
            self.flags.rt = true;
            TimeoutOutcome::default()
        }
    }

    /// Forget the in-flight command after a gateway `###ERR`. The node has to
    /// be brought back through a full reconnect.
    pub fn abort_command(&mut self) {
        self.pending = None;
        self.flags.rt = false;
        self.flags.con = false;
    }

    /// React to a status change of `peer` (which may be this node itself).
    pub fn on_peer_status(&mut self, peer: &str, own: bool, status: u32) -> Vec<UplinkNotice> {
        if own {
            self.last_status = Some(status);
        }
        let name = self.name.clone();
        match &mut self.kind {
            Kind::Base => Vec::new(),
            Kind::Sensor(s) => s.on_peer_status(&name, peer, own, status),
            Kind::Switch(s) => s.on_peer_status(own, status),
        }
    }

    // ─── Queries and small mutators ─────────────────────────────────────────

    /// Connected, routed, and not waiting on a keepalive. The full
    /// availability rule additionally requires every ancestor to be available;
    /// the registry composes that.
    pub fn locally_available(&self) -> bool {
        self.flags.con && self.flags.routes && !self.flags.check
    }

    /// The whole bring-up sequence has completed. Base-kind nodes have no
    /// configuration step, connect plus routes is all there is.
    pub fn fully_initialized(&self) -> bool {
        let kind_done = matches!(self.kind, Kind::Base) || self.flags.init_done;
        self.flags.con && self.flags.routes && kind_done
    }

    /// A command is in flight or a retransmit is owed.
    pub fn transmitting(&self) -> bool {
        self.pending.is_some() || self.flags.rt
    }

    pub fn backing_off(&self, now: Instant) -> bool {
        self.wait_until.is_some_and(|t| t > now)
    }

    /// Owe a keepalive ping on the next poll.
    pub fn set_check(&mut self) {
        self.flags.check = true;
    }

    /// Clear the reconnect back-off gate so the next poll may dial again.
    pub fn reset_timeout(&mut self) {
        self.wait_until = None;
    }

    pub fn can_inject(&self) -> bool {
        self.flags.con && self.pending.is_none()
    }

    /// Queue an operator command for the next poll. Refused while a mutation
    /// is in flight or the node is not connected.
    pub fn inject(&mut self, cmd: Command) -> bool {
        if !self.can_inject() {
            return false;
        }
        self.injected = Some(cmd);
        true
    }

    pub fn pending(&self) -> Option<&Pending> {
        self.pending.as_ref()
    }

    pub fn retransmit_count(&self) -> u32 {
        self.rt_count
    }

    /// Worst-case wall-clock for one command through all its retransmissions.
    pub fn command_budget(&self) -> Duration {
        let hops = u64::from(self.route_length) * self.settings.hop_timeout;
        Duration::from_secs(hops * u64::from(self.settings.max_retransmissions + 2) + 2)
    }

    /// Number of commands a full bring-up of this node takes.
    pub fn bringup_steps(&self) -> u32 {
        let kind_steps = match &self.kind {
            Kind::Base => 0,
            Kind::Sensor(s) => s.channels.len() as u32 + 2,
            Kind::Switch(_) => 4,
        };
        // connect + reset_routes + keepalive headroom
        3 + kind_steps
    }

    /// Human-readable block for the state dump.
    pub fn debug_state(&self, now: Instant, upstream: &str) -> String {
        let last_ack = match self.last_ack {
            None => "None".to_string(),
            Some(t) => format!("{} seconds ago", now.saturating_duration_since(t).as_secs()),
        };
        let wait = match self.wait_until {
            Some(t) if t > now => format!("{}s", t.duration_since(now).as_secs()),
            _ => "No".to_string(),
        };
        let kind = match &self.kind {
            Kind::Base => String::new(),
            Kind::Sensor(s) => s.debug_state(),
            Kind::Switch(s) => s.debug_state(),
        };
        format!(
            "Node: {}\n    id:              {}\n    last_ack:        {}\n    wait:            {}\n    route to node    {}\n    retransmissions: {}\n    status:          {:?} {}\n",
            self.name, self.id, last_ack, wait, upstream, self.rt_count, self.flags, kind
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_node() -> Node {
        Node::new(
            "TEST".into(),
            2,
            None,
            0,
            1,
            "0:0".into(),
            NodeSettings {
                hop_timeout: 2,
                max_retransmissions: 2,
                check_interval: Duration::from_secs(60),
                reconnect_delay: Duration::from_secs(30),
            },
            Kind::Base,
        )
    }

    #[test]
    fn cold_node_dials_first() {
        let mut n = base_node();
        let now = Instant::now();
        let cmd = n.next_message(now, true).expect("wants to connect");
        assert_eq!(cmd.as_line(), "connect 2 0 2");
        // A mutation is now in flight, nothing else may go out.
        assert_eq!(n.next_message(now, true), None);
    }

    #[test]
    fn connect_timeout_scales_with_route_length() {
        let mut n = base_node();
        n.route_length = 3;
        let cmd = n.next_message(Instant::now(), true).expect("connect");
        assert_eq!(cmd.as_line(), "connect 2 0 6");
    }

    #[test]
    fn unavailable_gateway_silences_node() {
        let mut n = base_node();
        assert_eq!(n.next_message(Instant::now(), false), None);
    }

    #[test]
    fn full_bringup_sequence() {
        let mut n = base_node();
        let now = Instant::now();
        assert_eq!(n.next_message(now, true).unwrap().as_line(), "connect 2 0 2");
        n.on_ack(0, now).unwrap();
        assert!(n.flags.con);
        assert_eq!(
            n.next_message(now, true).unwrap().as_line(),
            "reset_routes 2 0:0"
        );
        n.on_ack(0, now).unwrap();
        assert!(n.flags.routes);
        assert!(n.locally_available());
        // Keepalive only once check_interval elapsed.
        assert_eq!(n.next_message(now, true), None);
        let later = now + Duration::from_secs(61);
        assert_eq!(n.next_message(later, true).unwrap().as_line(), "authping 2");
    }

    #[test]
    fn retransmit_bound_is_respected() {
        let mut n = base_node();
        let now = Instant::now();
        n.next_message(now, true).unwrap(); // connect in flight

        // Two timeouts produce two retransmits, the third gives up.
        for round in 1..=2 {
            let outcome = n.on_timeout(now);
            assert!(!outcome.gave_up);
            assert_eq!(n.next_message(now, true).unwrap().as_line(), "retransmit 2");
            assert_eq!(n.retransmit_count(), round);
            assert!(n.retransmit_count() <= n.settings.max_retransmissions);
        }
        let outcome = n.on_timeout(now);
        assert!(outcome.gave_up);
        assert!(!n.flags.con);
        assert!(n.flags.check);
        assert!(n.backing_off(now + Duration::from_secs(1)));
        assert!(!n.backing_off(now + Duration::from_secs(31)));
    }

    #[test]
    fn give_up_while_connected_sets_no_backoff() {
        let mut n = base_node();
        let now = Instant::now();
        n.next_message(now, true).unwrap();
        n.on_ack(0, now).unwrap();
        n.next_message(now, true).unwrap();
        n.on_ack(0, now).unwrap();

        n.set_check();
        assert_eq!(n.next_message(now, true).unwrap().as_line(), "authping 2");
        for _ in 0..2 {
            assert!(!n.on_timeout(now).gave_up);
            n.next_message(now, true).unwrap();
        }
        let outcome = n.on_timeout(now);
        assert!(outcome.gave_up);
        assert!(!n.flags.con);
        // The session was open when the budget ran out, no back-off gate.
        assert!(!n.backing_off(now + Duration::from_secs(1)));
    }

    #[test]
    fn ack_without_pending_is_an_error() {
        let mut n = base_node();
        assert!(n.on_ack(0, Instant::now()).is_err());
    }

    #[test]
    fn injection_gate() {
        let mut n = base_node();
        let now = Instant::now();
        assert!(!n.can_inject()); // not connected
        n.next_message(now, true).unwrap();
        assert!(!n.inject(Command::node_with_args(2, "led", "5")));
        n.on_ack(0, now).unwrap();
        assert!(n.inject(Command::node_with_args(2, "led", "5")));
        // Injected command wins over the routes setup and is emitted once.
        assert_eq!(n.next_message(now, true).unwrap().as_line(), "led 2 5");
        n.on_ack(0, now).unwrap();
        assert_eq!(
            n.next_message(now, true).unwrap().as_line(),
            "reset_routes 2 0:0"
        );
    }

    #[test]
    fn backoff_gates_everything() {
        let mut n = base_node();
        let now = Instant::now();
        n.next_message(now, true).unwrap();
        for _ in 0..2 {
            n.on_timeout(now);
            n.next_message(now, true).unwrap();
        }
        assert!(n.on_timeout(now).gave_up);
        assert_eq!(n.next_message(now + Duration::from_secs(1), true), None);
        let cmd = n.next_message(now + Duration::from_secs(31), true).unwrap();
        assert_eq!(cmd.as_line(), "connect 2 0 2");
    }

    #[test]
    fn abort_forces_reconnect() {
        let mut n = base_node();
        let now = Instant::now();
        n.next_message(now, true).unwrap();
        n.on_ack(0, now).unwrap();
        n.next_message(now, true).unwrap();
        n.abort_command();
        assert!(!n.flags.con);
        assert!(n.pending().is_none());
        assert_eq!(n.next_message(now, true).unwrap().as_line(), "connect 2 0 2");
    }
}
