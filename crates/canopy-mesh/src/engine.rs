//! Single-writer command scheduler.
//!
//! Exactly one command is outstanding on the link at any time. The engine is
//! blocked while no `MASTER>` prompt has been seen since the last send, or
//! while a `###PEND` is waiting for its ACK/TIMEOUT. When it is not blocked,
//! it polls each node for its next desired command and transmits the first
//! non-none answer, then yields so other nodes get their turn on later ticks.
//!
//! The engine performs no I/O. [`Engine::handle_line`] consumes one inbound
//! line, [`Engine::tick`] produces at most one outbound line plus a batch of
//! uplink notices; the daemon loop moves bytes.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::netcheck::NetCheck;
use crate::node::NodeIdx;
use crate::protocol::{parse_line, Command, Response, Target};
use crate::registry::Registry;
use crate::uplink::UplinkNotice;

/// Status updates parked during a sweep are capped; beyond this the oldest
/// entry is dropped.
const PARKED_STATUS_LIMIT: usize = 64;

/// Scheduler timing knobs, resolved from the configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub gateway_watchdog_interval: Duration,
    pub alive_signal_interval: Duration,
    pub network_check_interval: Duration,
    /// Reboot chatter discard window after a session start.
    pub startup_grace: Duration,
    /// Pre-resolved `dst:hop` list for the root `routes` command.
    pub master_routes: String,
}

/// Result of one scheduler tick.
#[derive(Debug, Default)]
pub struct TickOutput {
    /// Line to transmit on the link, if any.
    pub line: Option<String>,
    pub notices: Vec<UplinkNotice>,
}

/// Operator injection failures, reported to the debug socket only.
#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    #[error("no such node")]
    UnknownNode,
    #[error("node cannot accept commands right now")]
    Busy,
}

pub struct Engine {
    registry: Registry,
    cfg: EngineConfig,
    netcheck: NetCheck,
    /// Set on every send, cleared by the gateway prompt.
    wait_for_prompt: Option<Target>,
    /// Set by `###PEND`, cleared by the correlated ACK/TIMEOUT.
    message_pending: bool,
    raw_mode: bool,
    restart_requested: bool,
    injected_raw: Option<String>,
    /// Last command text per node, for the uplink statistics.
    last_commands: HashMap<NodeIdx, String>,
    last_cmd: Option<String>,
    startup_until: Option<Instant>,
    last_wdt_feed: Option<Instant>,
    last_alive_signal: Option<Instant>,
    alive: bool,
    parked_status: VecDeque<(NodeIdx, u32)>,
}

impl Engine {
    pub fn new(registry: Registry, cfg: EngineConfig) -> Self {
        let netcheck = NetCheck::new(cfg.network_check_interval);
        Engine {
            registry,
            cfg,
            netcheck,
            wait_for_prompt: None,
            message_pending: false,
            raw_mode: false,
            restart_requested: false,
            injected_raw: None,
            last_commands: HashMap::new(),
            last_cmd: None,
            startup_until: None,
            last_wdt_feed: None,
            last_alive_signal: None,
            alive: false,
            parked_status: VecDeque::new(),
        }
    }

    // ─── Session lifecycle ──────────────────────────────────────────────────

    /// Discard all per-session state after a link loss: every node goes back
    /// to disconnected, in-flight command state is dropped.
    pub fn reset_runtime(&mut self) {
        self.registry.reset_runtime();
        self.netcheck.cancel();
        self.parked_status.clear();
        self.last_commands.clear();
        self.wait_for_prompt = None;
        self.message_pending = false;
        self.raw_mode = false;
        self.injected_raw = None;
        self.alive = false;
    }

    /// Start scheduling on a fresh link: clear the transmit gates and hold
    /// off node work for the startup grace window.
    pub fn begin_session(&mut self, now: Instant) {
        self.wait_for_prompt = None;
        self.message_pending = false;
        self.startup_until = Some(now + self.cfg.startup_grace);
        self.netcheck.schedule_from(now);
    }

    /// Root `routes` line installing the gateway's own routing table.
    pub fn master_routes_line(&self) -> String {
        if self.cfg.master_routes.is_empty() {
            "routes".to_string()
        } else {
            format!("routes {}", self.cfg.master_routes)
        }
    }

    // ─── Inbound ────────────────────────────────────────────────────────────

    /// Process one line from the link.
    pub fn handle_line(&mut self, raw: &str, now: Instant) -> Vec<UplinkNotice> {
        match parse_line(raw) {
            Response::Prompt => {
                self.wait_for_prompt = None;
                Vec::new()
            }
            Response::Other(line) => {
                if line.contains("###") {
                    error!(%line, "received malformed response");
                } else if !line.is_empty() {
                    trace!(%line, "line without command marker");
                }
                Vec::new()
            }
            Response::Pend { node } => {
                if self.registry.idx_by_id(node).is_none() {
                    debug!(node, "PEND for unknown node");
                    return Vec::new();
                }
                if self.wait_for_prompt.is_none() {
                    warn!(node, "received unexpected pending signal");
                }
                self.message_pending = true;
                Vec::new()
            }
            Response::Err { node } => self.on_err(node),
            Response::Ack { node, code } => self.on_ack(node, code, now),
            Response::Timeout { node } => self.on_timeout(node, now),
            Response::Status { node, value } => self.on_status(node, value),
        }
    }

    fn on_err(&mut self, node: u32) -> Vec<UplinkNotice> {
        if self.raw_mode {
            return Vec::new();
        }
        match self.wait_for_prompt {
            None => error!(node, "out-of-order ERR response"),
            Some(Target::Root) => error!(node, "gateway rejected a root command"),
            Some(Target::Node(id)) => {
                if let Some(idx) = self.registry.idx_by_id(id) {
                    error!(
                        node = %self.registry.get(idx).name,
                        "gateway rejected the outstanding command, failing node"
                    );
                    self.registry.get_mut(idx).abort_command();
                    self.netcheck.request();
                }
            }
        }
        Vec::new()
    }

    fn on_ack(&mut self, node: u32, code: u32, now: Instant) -> Vec<UplinkNotice> {
        if self.raw_mode {
            return Vec::new();
        }
        let Some(idx) = self.registry.idx_by_id(node) else {
            debug!(node, "ACK for unknown node");
            return Vec::new();
        };
        self.message_pending = false;
        let mut notices = self.trace(idx, "ACK");
        match self.registry.get_mut(idx).on_ack(code, now) {
            Ok(more) => notices.extend(more),
            Err(e) => error!(error = %e, "protocol error"),
        }
        notices
    }

    fn on_timeout(&mut self, node: u32, now: Instant) -> Vec<UplinkNotice> {
        if self.raw_mode {
            return Vec::new();
        }
        let Some(idx) = self.registry.idx_by_id(node) else {
            debug!(node, "TIMEOUT for unknown node");
            return Vec::new();
        };
        self.message_pending = false;
        info!(node = %self.registry.get(idx).name, "command timed out");
        let mut notices = self.trace(idx, "TIMEOUT");
        notices.extend(self.registry.node_timeout(idx, now).notices);
        notices
    }

    fn on_status(&mut self, node: u32, value: u32) -> Vec<UplinkNotice> {
        let Some(idx) = self.registry.idx_by_id(node) else {
            warn!(node, "status update for a node that is not configured");
            return Vec::new();
        };
        if self.netcheck.in_progress() {
            info!(
                node = %self.registry.get(idx).name,
                "parking status update until the sweep completes"
            );
            if self.parked_status.len() >= PARKED_STATUS_LIMIT {
                warn!("parked status buffer full, dropping oldest entry");
                self.parked_status.pop_front();
            }
            self.parked_status.push_back((idx, value));
            return Vec::new();
        }
        let mut notices = self.trace_raw(idx, &format!("###STATUS {node} {value}"));
        notices.extend(self.registry.apply_status(idx, value));
        notices
    }

    fn trace(&self, idx: NodeIdx, kind: &str) -> Vec<UplinkNotice> {
        match self.last_commands.get(&idx) {
            Some(cmd) => vec![UplinkNotice::CommandTrace {
                node: self.registry.get(idx).name.clone(),
                text: format!("{kind} - {cmd}"),
            }],
            None => Vec::new(),
        }
    }

    fn trace_raw(&self, idx: NodeIdx, text: &str) -> Vec<UplinkNotice> {
        if self.last_commands.contains_key(&idx) {
            vec![UplinkNotice::CommandTrace {
                node: self.registry.get(idx).name.clone(),
                text: text.to_string(),
            }]
        } else {
            Vec::new()
        }
    }

    // ─── Outbound ───────────────────────────────────────────────────────────

    /// One scheduler tick: produce at most one line to transmit.
    pub fn tick(&mut self, now: Instant) -> TickOutput {
        let mut out = TickOutput::default();

        // Operator raw line: goes out next, regardless of any gate.
        if let Some(line) = self.injected_raw.take() {
            out.line = Some(self.prepare_send(Target::Root, line));
            return out;
        }

        if self.startup_until.is_some_and(|t| now < t) {
            return out;
        }

        let wdt_due = self
            .last_wdt_feed
            .map_or(true, |t| t + self.cfg.gateway_watchdog_interval <= now);
        if wdt_due {
            debug!("feeding gateway watchdog");
            self.last_wdt_feed = Some(now);
            out.line = Some(self.prepare_send(Target::Root, "wdt_feed".to_string()));
            return out;
        }

        if !self.raw_mode {
            self.step_netcheck(now, &mut out.notices);

            if self.wait_for_prompt.is_some() || self.message_pending {
                return out;
            }
        }

        let avail = self.registry.availability();
        self.alive = avail.iter().any(|&a| a);
        if self.alive {
            let due = self
                .last_alive_signal
                .map_or(true, |t| t + self.cfg.alive_signal_interval <= now);
            if due {
                self.last_alive_signal = Some(now);
                out.notices.push(UplinkNotice::Alive);
            }
        }

        if self.raw_mode {
            return out;
        }

        for idx in self.poll_order() {
            let chain = self.registry.chain_available(&avail, idx);
            if let Some(cmd) = self.registry.get_mut(idx).next_message(now, chain) {
                self.last_commands.insert(idx, cmd.as_line().to_string());
                let target = cmd.target;
                out.line = Some(self.prepare_send(target, cmd.into_line()));
                break;
            }
        }
        out
    }

    /// The sweep target is polled first so recovery traffic cannot be starved
    /// by routine refresh traffic.
    fn poll_order(&self) -> Vec<NodeIdx> {
        let mut order: Vec<NodeIdx> = (0..self.registry.len()).collect();
        if let Some(target) = self.netcheck.current_target() {
            order.retain(|&i| i != target);
            order.insert(0, target);
        }
        order
    }

    fn prepare_send(&mut self, target: Target, line: String) -> String {
        self.wait_for_prompt = Some(target);
        self.last_cmd = Some(line.clone());
        line
    }

    fn step_netcheck(&mut self, now: Instant, notices: &mut Vec<UplinkNotice>) {
        let was_running = self.netcheck.in_progress();
        self.netcheck.step(&mut self.registry, now);
        if was_running && !self.netcheck.in_progress() {
            let parked: Vec<_> = self.parked_status.drain(..).collect();
            for (idx, value) in parked {
                notices.extend(self.registry.apply_status(idx, value));
            }
        }
    }

    // ─── Operator surface ───────────────────────────────────────────────────

    /// Queue a command for a node through the normal injection gate.
    pub fn inject_for_node(
        &mut self,
        reference: &str,
        verb: &str,
        args: &str,
    ) -> Result<(), InjectError> {
        let idx = self
            .registry
            .resolve(reference)
            .ok_or(InjectError::UnknownNode)?;
        let node = self.registry.get_mut(idx);
        let id = node.id;
        let cmd = if args.trim().is_empty() {
            Command::node(id, verb)
        } else {
            Command::node_with_args(id, verb, args.trim())
        };
        if !node.inject(cmd) {
            return Err(InjectError::Busy);
        }
        Ok(())
    }

    /// Queue a raw line; it goes out on the next tick, bypassing every gate.
    pub fn inject_raw(&mut self, line: String) {
        self.injected_raw = Some(line);
    }

    /// Owe a keepalive on the given node.
    pub fn force_check(&mut self, reference: &str) -> Result<(), InjectError> {
        let idx = self
            .registry
            .resolve(reference)
            .ok_or(InjectError::UnknownNode)?;
        self.registry.get_mut(idx).set_check();
        Ok(())
    }

    /// Resolve an operator node reference to its protocol id.
    pub fn resolve_id(&self, reference: &str) -> Option<u32> {
        self.registry.resolve(reference).map(|idx| self.registry.get(idx).id)
    }

    pub fn request_netcheck(&mut self) {
        self.netcheck.request();
    }

    pub fn request_restart(&mut self) {
        self.restart_requested = true;
    }

    pub fn take_restart_requested(&mut self) -> bool {
        std::mem::take(&mut self.restart_requested)
    }

    pub fn set_raw_mode(&mut self, raw: bool) {
        if raw != self.raw_mode {
            warn!(raw, "raw mode toggled");
        }
        self.raw_mode = raw;
    }

    pub fn is_raw_mode(&self) -> bool {
        self.raw_mode
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Scheduler is holding back because a command is outstanding.
    pub fn blocked(&self) -> bool {
        self.wait_for_prompt.is_some() || self.message_pending
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Human-readable snapshot for the state file and the debug interface.
    pub fn debug_state(&self, now: Instant) -> String {
        let wait_prompt = match self.wait_for_prompt {
            None => "None".to_string(),
            Some(Target::Root) => "MASTER".to_string(),
            Some(Target::Node(id)) => match self.registry.idx_by_id(id) {
                Some(idx) => self.registry.get(idx).name.clone(),
                None => format!("#{id}"),
            },
        };
        format!(
            "alive:       {}\nraw:         {}\nlast_cmd:    {}\nmsg_pending: {}\nwait_prompt: {}\n\n{}",
            self.alive,
            self.raw_mode,
            self.last_cmd.as_deref().unwrap_or("None"),
            self.message_pending,
            wait_prompt,
            self.registry.debug_state(now)
        )
    }
}
