//! Kernel-mediated privilege escalation.
//!
//! A process never talks to the arbitration agent directly. The kernel
//! spawns a fresh (unprivileged) agent per request, hands it a dedicated
//! channel, and speaks the request/ack/decision protocol over it:
//!
//! - the request is resent every [`RESEND_INTERVAL_MS`] until the agent
//!   acknowledges it, for at most [`ACK_WINDOW_MS`] after the first send
//! - a decision must arrive within [`DECISION_DEADLINE_MS`] of the first
//!   send; expiry resolves the request as [`PrivilegeOutcome::TimedOut`]
//! - replies naming any pid other than the requester are logged and ignored
//!
//! Resolution always destroys the channel and kills the agent: exit code 0
//! after a decision, 1 on timeout.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};

use log::{debug, info, warn};
use serde_json::Value;
use vos_ipc::{
    pid, ChannelId, IpcMessage, Pid, PrivilegeAck, PrivilegeDecision, PrivilegeRequest,
    ProcessDescriptor, ACK_WINDOW_MS, DECISION_DEADLINE_MS, RESEND_INTERVAL_MS,
};

use crate::gate::{Gate, PrivilegeFn};
use crate::kernel::Kernel;
use crate::sched::TimerId;

/// How an escalation request resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrivilegeOutcome {
    /// The agent granted elevated access; the requester now holds it.
    Granted,
    /// The agent explicitly declined.
    Denied,
    /// No decision arrived before the deadline. Treated like a denial, but
    /// distinguishable by the requester.
    TimedOut,
}

struct PendingRequest {
    requester: Pid,
    agent: Pid,
    channel: ChannelId,
    /// Snapshot taken when the request was made; resends reuse it.
    descriptor: ProcessDescriptor,
    reason: String,
    acked: bool,
    first_send_ms: u64,
    resend_timer: Option<TimerId>,
    deadline_timer: Option<TimerId>,
    on_done: Option<PrivilegeFn>,
}

/// All in-flight escalation requests.
pub(crate) struct PrivilegeBroker {
    requests: BTreeMap<u64, PendingRequest>,
    next: u64,
}

impl PrivilegeBroker {
    pub(crate) fn new() -> Self {
        Self {
            requests: BTreeMap::new(),
            next: 1,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    pub(crate) fn pending(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn clear(&mut self) {
        self.requests.clear();
    }
}

impl Kernel {
    /// Broker privilege escalation for `requester`. The outcome is reported
    /// through `on_done`, always as a deferred task.
    pub(crate) fn request_privilege(&mut self, requester: Pid, reason: &str, on_done: PrivilegeFn) {
        if !self.table.contains(requester) {
            resolve_without_agent(self, requester, on_done, PrivilegeOutcome::Denied);
            return;
        }
        if self.table.get(requester).map_or(false, |p| p.privileged) {
            resolve_without_agent(self, requester, on_done, PrivilegeOutcome::Granted);
            return;
        }
        let descriptor = match self.describe(requester) {
            Some(d) => d,
            None => return,
        };

        let agent_name = self.agent_name();
        let channel = self.ipc.reserve_kernel_channel();
        let line = alloc::format!("{agent_name} {channel} &");
        let agent = match self.spawn_line(&line, false) {
            Ok(spawned) => spawned.pid,
            Err(e) => {
                warn!("cannot spawn privilege agent {agent_name}: {e}");
                self.ipc.destroy_channel(channel);
                resolve_without_agent(self, requester, on_done, PrivilegeOutcome::Denied);
                return;
            }
        };
        self.ipc.assign_kernel_channel(channel, agent);

        let req_id = self.broker.next_id();
        let _ = self.ipc.channel_listen(
            channel,
            pid::KERNEL,
            Box::new(move |gate: Gate<'_>, msg: &IpcMessage| {
                if let Some(mut pg) = gate.privileged() {
                    on_agent_message(pg.kernel(), req_id, msg);
                }
                Ok(())
            }),
        );
        let deadline_timer = self.sched.create_timeout(
            pid::KERNEL,
            DECISION_DEADLINE_MS,
            Some(Box::new(move |gate: Gate<'_>| {
                if let Some(mut pg) = gate.privileged() {
                    finish_request(pg.kernel(), req_id, PrivilegeOutcome::TimedOut);
                }
                Ok(())
            })),
            None,
        );

        info!("privilege request from pid {requester} brokered to {agent_name} (pid {agent})");
        self.broker.requests.insert(
            req_id,
            PendingRequest {
                requester,
                agent,
                channel,
                descriptor,
                reason: reason.to_string(),
                acked: false,
                first_send_ms: self.sched.now_ms(),
                resend_timer: None,
                deadline_timer: Some(deadline_timer),
                on_done: Some(on_done),
            },
        );
        send_request(self, req_id);
    }
}

fn resolve_without_agent(k: &mut Kernel, requester: Pid, on_done: PrivilegeFn, outcome: PrivilegeOutcome) {
    k.sched.defer(Box::new(move |k2| {
        let gate = Gate::for_pid(k2, requester);
        if let Err(e) = on_done(gate, outcome) {
            warn!("privilege completion callback failed: {e}");
        }
    }));
}

/// Send (or resend) the request payload, and arm the next resend if the ack
/// window still allows one.
fn send_request(k: &mut Kernel, req_id: u64) {
    let (channel, payload, first_send) = match k.broker.requests.get(&req_id) {
        Some(r) if !r.acked => (
            r.channel,
            serde_json::to_value(PrivilegeRequest {
                process: r.descriptor.clone(),
                reason: r.reason.clone(),
            })
            .unwrap_or(Value::Null),
            r.first_send_ms,
        ),
        _ => return,
    };
    if !k.ipc_send(channel, pid::KERNEL, payload) {
        warn!("privilege request {req_id}: channel {channel} is gone");
    }
    let resend = if k.sched.now_ms() + RESEND_INTERVAL_MS <= first_send + ACK_WINDOW_MS {
        Some(k.sched.create_timeout(
            pid::KERNEL,
            RESEND_INTERVAL_MS,
            Some(Box::new(move |gate: Gate<'_>| {
                if let Some(mut pg) = gate.privileged() {
                    send_request(pg.kernel(), req_id);
                }
                Ok(())
            })),
            None,
        ))
    } else {
        debug!("privilege request {req_id}: ack window exhausted, no more resends");
        None
    };
    match k.broker.requests.get_mut(&req_id) {
        Some(r) => r.resend_timer = resend,
        None => {
            if let Some(t) = resend {
                k.sched.discard_timer(t);
            }
        }
    }
}

/// Handle a reply on a brokered channel. Unrecognized shapes and replies
/// naming the wrong pid are ignored.
fn on_agent_message(k: &mut Kernel, req_id: u64, msg: &IpcMessage) {
    let requester = match k.broker.requests.get(&req_id) {
        Some(r) => r.requester,
        None => return,
    };

    if let Ok(ack) = serde_json::from_value::<PrivilegeAck>(msg.data.clone()) {
        if ack.process != requester {
            warn!("privilege ack names pid {} but the request is for {requester}; ignored", ack.process);
        } else if ack.handling {
            let resend = k
                .broker
                .requests
                .get_mut(&req_id)
                .and_then(|r| {
                    r.acked = true;
                    r.resend_timer.take()
                });
            if let Some(t) = resend {
                k.sched.discard_timer(t);
            }
            debug!("privilege request {req_id} acknowledged");
        }
        return;
    }

    if let Ok(decision) = serde_json::from_value::<PrivilegeDecision>(msg.data.clone()) {
        if decision.process != requester {
            warn!(
                "privilege decision names pid {} but the request is for {requester}; ignored",
                decision.process
            );
            return;
        }
        let outcome = if decision.granted {
            PrivilegeOutcome::Granted
        } else {
            PrivilegeOutcome::Denied
        };
        finish_request(k, req_id, outcome);
        return;
    }

    debug!("privilege request {req_id}: unrecognized agent payload ignored");
}

/// Resolve a request: tear down the protocol resources, apply the grant,
/// and schedule the completion callback.
fn finish_request(k: &mut Kernel, req_id: u64, outcome: PrivilegeOutcome) {
    let Some(req) = k.broker.requests.remove(&req_id) else {
        return;
    };
    if let Some(t) = req.resend_timer {
        k.sched.discard_timer(t);
    }
    if let Some(t) = req.deadline_timer {
        k.sched.discard_timer(t);
    }
    k.ipc.destroy_channel(req.channel);
    let agent_code = if outcome == PrivilegeOutcome::TimedOut { 1 } else { 0 };
    k.kill(req.agent, agent_code);

    if outcome == PrivilegeOutcome::Granted {
        match k.table.get_mut(req.requester) {
            Some(p) => p.privileged = true,
            None => warn!("privilege granted to pid {} after it exited", req.requester),
        }
    }
    info!("privilege request for pid {} resolved: {:?}", req.requester, outcome);

    let requester = req.requester;
    if let Some(done) = req.on_done {
        k.sched.defer(Box::new(move |k2| {
            let gate = Gate::for_pid(k2, requester);
            if let Err(e) = done(gate, outcome) {
                warn!("privilege completion callback failed: {e}");
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::Syscalls;
    use crate::program::{fn_entry, ProgramError};
    use alloc::rc::Rc;
    use alloc::vec::Vec;
    use core::cell::RefCell;
    use vos_hal::MemHal;

    fn kernel() -> Kernel {
        Kernel::new(Rc::new(MemHal::new()))
    }

    /// An agent that runs `respond` for every request it sees, whether
    /// drained from the queue at startup or pushed through its listener.
    /// Records the exit code the kernel put it down with.
    fn agent_entry(
        name: &'static str,
        exit_codes: Rc<RefCell<Vec<i32>>>,
        respond: impl Fn(&mut Gate<'_>, ChannelId, &PrivilegeRequest) + 'static,
    ) -> crate::program::ProgramEntry {
        let respond = Rc::new(respond);
        fn_entry(name, "1.0.0", move |mut gate, ctx| {
            let channel = ChannelId(
                ctx.args[0]
                    .parse()
                    .map_err(|_| ProgramError::BadArguments(ctx.args[0].clone()))?,
            );
            let codes = exit_codes.clone();
            gate.on_exit(ctx.pid, move |_, code| {
                codes.borrow_mut().push(code);
                Ok(())
            });
            let respond = respond.clone();
            let on_msg = respond.clone();
            let _ = gate.channel_listen(channel, move |mut gate: Gate<'_>, msg: &IpcMessage| {
                if let Ok(req) = serde_json::from_value::<PrivilegeRequest>(msg.data.clone()) {
                    on_msg(&mut gate, channel, &req);
                }
                Ok(())
            });
            while let Some(msg) = gate.channel_receive(channel) {
                if let Ok(req) = serde_json::from_value::<PrivilegeRequest>(msg.data.clone()) {
                    respond(&mut gate, channel, &req);
                }
            }
            Ok(())
        })
    }

    /// A requester program that immediately asks for privilege and records
    /// the outcome.
    fn requester_entry(outcomes: Rc<RefCell<Vec<PrivilegeOutcome>>>) -> crate::program::ProgramEntry {
        fn_entry("app", "1.0.0", move |mut gate, _ctx| {
            let outcomes = outcomes.clone();
            gate.request_privilege("needs root", move |_gate, outcome| {
                outcomes.borrow_mut().push(outcome);
                Ok(())
            });
            Ok(())
        })
    }

    fn ack_of(req: &PrivilegeRequest) -> Value {
        serde_json::to_value(PrivilegeAck {
            process: req.process.pid,
            handling: true,
        })
        .unwrap()
    }

    fn decision_of(req: &PrivilegeRequest, granted: bool) -> Value {
        serde_json::to_value(PrivilegeDecision {
            process: req.process.pid,
            granted,
        })
        .unwrap()
    }

    #[test]
    fn grant_flow_elevates_the_requester() {
        let mut k = kernel();
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        let agent_codes = Rc::new(RefCell::new(Vec::new()));
        k.registry.register(requester_entry(outcomes.clone()));
        k.registry.register(agent_entry("privd", agent_codes.clone(), |gate, ch, req| {
            gate.channel_send(ch, ack_of(req));
            gate.channel_send(ch, decision_of(req, true));
        }));

        let app = k.spawn_line("app", false).unwrap().pid;
        k.run_until_idle();

        assert_eq!(&*outcomes.borrow(), &[PrivilegeOutcome::Granted]);
        assert!(Gate::for_pid(&mut k, app).is_privileged());
        // Protocol resources are gone: the agent is dead (put down cleanly,
        // code 0), the request table is empty, and only the requester
        // remains.
        assert_eq!(&*agent_codes.borrow(), &[0]);
        assert_eq!(k.broker.pending(), 0);
        assert_eq!(k.table.pids(), alloc::vec![app]);
    }

    #[test]
    fn denial_leaves_the_requester_unprivileged() {
        let mut k = kernel();
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        let agent_codes = Rc::new(RefCell::new(Vec::new()));
        k.registry.register(requester_entry(outcomes.clone()));
        k.registry.register(agent_entry("privd", agent_codes.clone(), |gate, ch, req| {
            gate.channel_send(ch, ack_of(req));
            gate.channel_send(ch, decision_of(req, false));
        }));

        let app = k.spawn_line("app", false).unwrap().pid;
        k.run_until_idle();

        assert_eq!(&*outcomes.borrow(), &[PrivilegeOutcome::Denied]);
        assert!(!Gate::for_pid(&mut k, app).is_privileged());
        // A denial is still a decision; the agent exits cleanly.
        assert_eq!(&*agent_codes.borrow(), &[0]);
        assert_eq!(k.broker.pending(), 0);
    }

    #[test]
    fn unacknowledged_requests_resend_then_time_out() {
        let mut k = kernel();
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        let agent_codes = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::new(RefCell::new(0u32));
        let seen_in_agent = seen.clone();
        k.registry.register(requester_entry(outcomes.clone()));
        k.registry.register(agent_entry("privd", agent_codes.clone(), move |_gate, _ch, _req| {
            *seen_in_agent.borrow_mut() += 1;
        }));

        let app = k.spawn_line("app", false).unwrap().pid;
        k.run_until_idle();
        assert_eq!(*seen.borrow(), 1);

        // Resends every 500ms until the 10s ack window closes: sends at
        // t=0, 500, ..., 10_000.
        k.advance_ms(ACK_WINDOW_MS);
        assert_eq!(*seen.borrow(), 21);
        k.advance_ms(ACK_WINDOW_MS);
        assert_eq!(*seen.borrow(), 21);

        assert!(outcomes.borrow().is_empty());
        k.advance_ms(DECISION_DEADLINE_MS);
        assert_eq!(&*outcomes.borrow(), &[PrivilegeOutcome::TimedOut]);
        assert!(!Gate::for_pid(&mut k, app).is_privileged());
        // The hung agent was put down with code 1.
        assert_eq!(&*agent_codes.borrow(), &[1]);
        assert_eq!(k.table.pids(), alloc::vec![app]);
    }

    #[test]
    fn ack_stops_the_resends() {
        let mut k = kernel();
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        let agent_codes = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::new(RefCell::new(0u32));
        let seen_in_agent = seen.clone();
        k.registry.register(requester_entry(outcomes.clone()));
        k.registry.register(agent_entry("privd", agent_codes.clone(), move |gate, ch, req| {
            *seen_in_agent.borrow_mut() += 1;
            gate.channel_send(ch, ack_of(req));
        }));

        k.spawn_line("app", false).unwrap();
        k.run_until_idle();
        k.advance_ms(ACK_WINDOW_MS);
        assert_eq!(*seen.borrow(), 1);

        // Acked but never decided: the decision deadline still applies, and
        // the silent agent is treated as hung.
        k.advance_ms(DECISION_DEADLINE_MS);
        assert_eq!(&*outcomes.borrow(), &[PrivilegeOutcome::TimedOut]);
        assert_eq!(&*agent_codes.borrow(), &[1]);
    }

    #[test]
    fn replies_for_the_wrong_pid_are_ignored() {
        let mut k = kernel();
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        let agent_codes = Rc::new(RefCell::new(Vec::new()));
        k.registry.register(requester_entry(outcomes.clone()));
        k.registry.register(agent_entry("privd", agent_codes.clone(), |gate, ch, req| {
            let spoofed = serde_json::to_value(PrivilegeDecision {
                process: Pid(req.process.pid.0 + 1000),
                granted: true,
            })
            .unwrap();
            gate.channel_send(ch, spoofed);
        }));

        let app = k.spawn_line("app", false).unwrap().pid;
        k.run_until_idle();

        assert!(outcomes.borrow().is_empty());
        assert!(!Gate::for_pid(&mut k, app).is_privileged());

        k.advance_ms(DECISION_DEADLINE_MS);
        assert_eq!(&*outcomes.borrow(), &[PrivilegeOutcome::TimedOut]);
    }

    #[test]
    fn requesters_cannot_cancel_the_brokers_timers() {
        let mut k = kernel();
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        let agent_codes = Rc::new(RefCell::new(Vec::new()));
        // Asks for privilege, then tries to kill every plausible timer so
        // the request can never expire.
        let recorded = outcomes.clone();
        k.registry.register(fn_entry("app", "1.0.0", move |mut gate, _ctx| {
            let recorded = recorded.clone();
            gate.request_privilege("needs root", move |_gate, outcome| {
                recorded.borrow_mut().push(outcome);
                Ok(())
            });
            for raw in 1..64 {
                let _ = gate.cancel_timeout(TimerId(raw));
                let _ = gate.clear_interval(TimerId(raw));
            }
            Ok(())
        }));
        k.registry.register(agent_entry("privd", agent_codes.clone(), |_gate, _ch, _req| {}));

        k.spawn_line("app", false).unwrap();
        k.run_until_idle();

        // The deadline and resend timers are intact; the request still
        // resolves on schedule.
        k.advance_ms(DECISION_DEADLINE_MS);
        assert_eq!(&*outcomes.borrow(), &[PrivilegeOutcome::TimedOut]);
        assert_eq!(&*agent_codes.borrow(), &[1]);
    }

    #[test]
    fn missing_agent_resolves_as_denied() {
        let mut k = kernel();
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        k.registry.register(requester_entry(outcomes.clone()));

        k.spawn_line("app", false).unwrap();
        k.run_until_idle();

        assert_eq!(&*outcomes.borrow(), &[PrivilegeOutcome::Denied]);
    }

    #[test]
    fn already_privileged_requesters_resolve_immediately() {
        let mut k = kernel();
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        k.registry.register(requester_entry(outcomes.clone()));

        k.spawn_line("app", true).unwrap();
        k.run_until_idle();

        assert_eq!(&*outcomes.borrow(), &[PrivilegeOutcome::Granted]);
        assert_eq!(k.broker.pending(), 0);
    }
}
