//! Periodic network sanity sweep.
//!
//! The sweep walks the nodes in ascending route-length order (parents before
//! children) and heals what it finds: an in-flight command gets a bounded
//! settle window, a connected node gets a forced keepalive, a failed node
//! gets exactly one re-initialisation attempt. Repair itself is only ever a
//! flag change; the scheduler's next polls emit the actual traffic.
//!
//! The sweep runs on the same task as the scheduler and is advanced one step
//! per tick, so it never races the single-writer rule. A failed node is not
//! retried between sweeps to avoid busy-looping against hardware that is
//! actually down.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::node::NodeIdx;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Wait for the node's in-flight command to finish.
    Settle,
    /// Keepalive forced; wait for it to resolve either way.
    AwaitCheck,
    /// Re-initialisation attempt; wait for full bring-up or give-up.
    AwaitInit,
}

#[derive(Debug)]
struct Active {
    idx: NodeIdx,
    phase: Phase,
    deadline: Instant,
}

#[derive(Debug)]
struct Sweep {
    queue: VecDeque<NodeIdx>,
    active: Option<Active>,
}

#[derive(Debug, PartialEq, Eq)]
enum Progress {
    Waiting,
    Done,
}

/// Driver state of the sanity sweep.
#[derive(Debug)]
pub struct NetCheck {
    interval: Duration,
    requested: bool,
    next_due: Option<Instant>,
    sweep: Option<Sweep>,
}

impl NetCheck {
    pub fn new(interval: Duration) -> Self {
        NetCheck {
            interval,
            requested: false,
            next_due: None,
            sweep: None,
        }
    }

    /// Ask for a sweep at the next opportunity.
    pub fn request(&mut self) {
        self.requested = true;
    }

    /// Re-arm the periodic timer, e.g. after a session (re)start.
    pub fn schedule_from(&mut self, now: Instant) {
        self.next_due = Some(now + self.interval);
    }

    /// Abort a sweep in progress (link loss). Leaves no recovery marker
    /// behind; the next periodic run starts from scratch.
    pub fn cancel(&mut self) {
        self.sweep = None;
    }

    pub fn in_progress(&self) -> bool {
        self.sweep.is_some()
    }

    /// Node currently worked on; the scheduler polls it first so routine
    /// traffic cannot starve the recovery.
    pub fn current_target(&self) -> Option<NodeIdx> {
        self.sweep.as_ref().and_then(|s| s.active.as_ref()).map(|a| a.idx)
    }

    /// Advance the sweep by at most one waiting step.
    pub fn step(&mut self, reg: &mut Registry, now: Instant) {
        if self.sweep.is_none() {
            let due = self.next_due.is_some_and(|t| now >= t);
            if !(self.requested || due) {
                return;
            }
            self.requested = false;
            self.next_due = Some(now + self.interval);
            info!(nodes = reg.len(), "starting network sanity sweep");
            self.sweep = Some(Sweep {
                queue: reg.sweep_order().to_vec().into(),
                active: None,
            });
        }

        let finished = match self.sweep.as_mut() {
            Some(sweep) => Self::run(sweep, reg, now),
            None => return,
        };
        if finished {
            info!("network sanity sweep complete");
            self.sweep = None;
        }
    }

    /// Returns true when the sweep has visited every node.
    fn run(sweep: &mut Sweep, reg: &mut Registry, now: Instant) -> bool {
        loop {
            if let Some(active) = sweep.active.as_mut() {
                match Self::advance(reg, active, now) {
                    Progress::Waiting => return false,
                    Progress::Done => sweep.active = None,
                }
            }

            loop {
                let Some(idx) = sweep.queue.pop_front() else {
                    return true;
                };
                if let Some(active) = Self::classify(reg, idx, now) {
                    sweep.active = Some(active);
                    break;
                }
            }
        }
    }

    fn classify(reg: &mut Registry, idx: NodeIdx, now: Instant) -> Option<Active> {
        let avail = reg.availability();
        if !reg.chain_available(&avail, idx) {
            // The parent has to come back first; this node is revisited on
            // the next sweep.
            debug!(node = %reg.get(idx).name, "sweep skips node behind offline gateway");
            return None;
        }

        let node = reg.get(idx);
        if node.transmitting() {
            let hops = u64::from(node.route_length) * node.settings.hop_timeout;
            return Some(Active {
                idx,
                phase: Phase::Settle,
                deadline: now + Duration::from_secs(hops + 2),
            });
        }

        if node.flags.con {
            debug!(node = %node.name, "sweep validates connected node");
            let deadline = now + node.command_budget();
            reg.get_mut(idx).set_check();
            return Some(Active {
                idx,
                phase: Phase::AwaitCheck,
                deadline,
            });
        }

        let mut active = Active {
            idx,
            phase: Phase::AwaitInit,
            deadline: now,
        };
        Self::begin_reinit(reg, &mut active, now);
        Some(active)
    }

    fn advance(reg: &mut Registry, active: &mut Active, now: Instant) -> Progress {
        match active.phase {
            Phase::Settle => {
                let node = reg.get(active.idx);
                if !node.transmitting() {
                    if node.flags.con {
                        let deadline = now + node.command_budget();
                        reg.get_mut(active.idx).set_check();
                        active.phase = Phase::AwaitCheck;
                        active.deadline = deadline;
                    } else {
                        Self::begin_reinit(reg, active, now);
                    }
                    Progress::Waiting
                } else if now >= active.deadline {
                    warn!(
                        node = %node.name,
                        "in-flight command did not settle, marking node failed"
                    );
                    reg.get_mut(active.idx).abort_command();
                    Self::begin_reinit(reg, active, now);
                    Progress::Waiting
                } else {
                    Progress::Waiting
                }
            }
            Phase::AwaitCheck => {
                let node = reg.get(active.idx);
                if !node.flags.con {
                    // Keepalive ran out of retransmissions.
                    Self::begin_reinit(reg, active, now);
                    Progress::Waiting
                } else if !node.flags.check {
                    debug!(node = %node.name, "keepalive confirmed");
                    Progress::Done
                } else if now >= active.deadline {
                    warn!(node = %node.name, "keepalive did not resolve within budget");
                    Progress::Done
                } else {
                    Progress::Waiting
                }
            }
            Phase::AwaitInit => {
                let node = reg.get(active.idx);
                if node.fully_initialized() {
                    info!(node = %node.name, "node recovered");
                    Progress::Done
                } else if node.backing_off(now) {
                    info!(
                        node = %node.name,
                        "re-initialisation failed, node left for the next sweep"
                    );
                    Progress::Done
                } else if now >= active.deadline {
                    warn!(node = %node.name, "re-initialisation budget exhausted");
                    Progress::Done
                } else {
                    Progress::Waiting
                }
            }
        }
    }

    fn begin_reinit(reg: &mut Registry, active: &mut Active, now: Instant) {
        let node = reg.get_mut(active.idx);
        info!(node = %node.name, "attempting re-initialisation");
        node.reset_timeout();
        let budget = node.command_budget() * node.bringup_steps();
        active.phase = Phase::AwaitInit;
        active.deadline = now + budget;
    }
}
