//! Services, channels and listeners.
//!
//! Discovery is by service name; transport is point-to-point channels with
//! two per-direction queues. Delivery is hybrid: each send enqueues for
//! polling *and* schedules every listener registered by the destination
//! endpoint. Nothing here unregisters anything automatically when a process
//! dies; cleanup is the periodic sweep plus explicit destroy calls.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::RefCell;

use log::{debug, warn};
use serde_json::Value;
use vos_ipc::{pid, ChannelId, IpcMessage, Pid};

use crate::gate::{ConnectFn, Gate, ListenerFn};
use crate::sched::Scheduler;
use crate::table::ProcessTable;

/// Handle to one channel listener registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(pub u64);

struct Service {
    owner: Pid,
    on_connection: Rc<RefCell<ConnectFn>>,
}

struct ListenerRegistration {
    id: ListenerId,
    endpoint: Pid,
    cb: Rc<RefCell<ListenerFn>>,
}

struct Channel {
    initiator: Pid,
    /// The serving endpoint. `None` while a kernel-reserved channel waits
    /// for its peer to be assigned.
    peer: Option<Pid>,
    /// Undelivered messages per receiving endpoint.
    to_initiator: VecDeque<IpcMessage>,
    to_peer: VecDeque<IpcMessage>,
    listeners: Vec<ListenerRegistration>,
}

impl Channel {
    fn is_endpoint(&self, p: Pid) -> bool {
        p == self.initiator || self.peer == Some(p)
    }

    /// The endpoint opposite `from`, if the channel is fully connected.
    fn other_endpoint(&self, from: Pid) -> Option<Pid> {
        if from == self.initiator {
            self.peer
        } else if self.peer == Some(from) {
            Some(self.initiator)
        } else {
            None
        }
    }
}

/// Kernel-side IPC state.
pub struct IpcManager {
    services: BTreeMap<String, Service>,
    channels: BTreeMap<ChannelId, Channel>,
    next_channel: u64,
    next_listener: u64,
}

impl IpcManager {
    pub(crate) fn new() -> Self {
        Self {
            services: BTreeMap::new(),
            channels: BTreeMap::new(),
            next_channel: 1,
            next_listener: 1,
        }
    }

    // =========================================================================
    // Services
    // =========================================================================

    /// Register `name` as served by `owner`. Overwrites any previous
    /// registration, regardless of who owned it.
    pub(crate) fn service_register(&mut self, name: &str, owner: Pid, on_connection: ConnectFn) {
        if self.services.contains_key(name) {
            debug!("service {name} re-registered by pid {owner}");
        }
        self.services.insert(
            name.to_string(),
            Service {
                owner,
                on_connection: Rc::new(RefCell::new(on_connection)),
            },
        );
    }

    pub(crate) fn service_unregister(&mut self, name: &str) -> bool {
        self.services.remove(name).is_some()
    }

    pub(crate) fn service_owner(&self, name: &str) -> Option<Pid> {
        self.services.get(name).map(|s| s.owner)
    }

    /// Resolve a service to its owning pid, evicting the registration if the
    /// owner has died.
    pub(crate) fn service_lookup(&mut self, table: &ProcessTable, name: &str) -> Option<Pid> {
        let owner = self.service_owner(name)?;
        if !table.is_live(owner) {
            self.services.remove(name);
            return None;
        }
        Some(owner)
    }

    // =========================================================================
    // Channels
    // =========================================================================

    fn alloc_channel(&mut self) -> ChannelId {
        let id = ChannelId(self.next_channel);
        self.next_channel += 1;
        id
    }

    /// Connect `initiator` to the named service. Returns `None` when the
    /// service is unknown or its owner is dead (in which case the stale
    /// registration is evicted). On success the service's connection
    /// callback is scheduled.
    pub(crate) fn create_channel(
        &mut self,
        table: &ProcessTable,
        sched: &mut Scheduler,
        initiator: Pid,
        service: &str,
    ) -> Option<ChannelId> {
        let owner = self.service_lookup(table, service)?;
        let id = self.alloc_channel();
        self.channels.insert(
            id,
            Channel {
                initiator,
                peer: Some(owner),
                to_initiator: VecDeque::new(),
                to_peer: VecDeque::new(),
                listeners: Vec::new(),
            },
        );
        let cb = self.services[service].on_connection.clone();
        sched.defer(Box::new(move |k| {
            let gate = Gate::for_pid(k, owner);
            if let Err(e) = (cb.borrow_mut())(gate, id, initiator) {
                warn!("connection callback for channel {id} failed: {e}");
            }
        }));
        Some(id)
    }

    /// Open a channel initiated by the kernel whose peer is not yet known.
    /// Until `assign_kernel_channel` runs, only the kernel endpoint can use
    /// it.
    pub(crate) fn reserve_kernel_channel(&mut self) -> ChannelId {
        let id = self.alloc_channel();
        self.channels.insert(
            id,
            Channel {
                initiator: pid::KERNEL,
                peer: None,
                to_initiator: VecDeque::new(),
                to_peer: VecDeque::new(),
                listeners: Vec::new(),
            },
        );
        id
    }

    /// Bind the peer of a kernel-reserved channel once its pid exists.
    pub(crate) fn assign_kernel_channel(&mut self, id: ChannelId, peer: Pid) -> bool {
        match self.channels.get_mut(&id) {
            Some(ch) if ch.initiator == pid::KERNEL && ch.peer.is_none() => {
                ch.peer = Some(peer);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn destroy_channel(&mut self, id: ChannelId) -> bool {
        self.channels.remove(&id).is_some()
    }

    pub(crate) fn channel_exists(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    pub(crate) fn is_endpoint(&self, id: ChannelId, p: Pid) -> bool {
        self.channels.get(&id).map_or(false, |ch| ch.is_endpoint(p))
    }

    // =========================================================================
    // Listeners & messages
    // =========================================================================

    /// Register a listener for messages addressed to `endpoint` on this
    /// channel. Fails unless `endpoint` actually is one.
    pub(crate) fn channel_listen(
        &mut self,
        id: ChannelId,
        endpoint: Pid,
        cb: ListenerFn,
    ) -> Option<ListenerId> {
        let ch = self.channels.get_mut(&id)?;
        if !ch.is_endpoint(endpoint) {
            return None;
        }
        let lid = ListenerId(self.next_listener);
        self.next_listener += 1;
        ch.listeners.push(ListenerRegistration {
            id: lid,
            endpoint,
            cb: Rc::new(RefCell::new(cb)),
        });
        Some(lid)
    }

    /// Remove a listener registration. Only the endpoint that registered it
    /// may remove it.
    pub(crate) fn channel_unlisten(&mut self, id: ChannelId, endpoint: Pid, listener: ListenerId) -> bool {
        let Some(ch) = self.channels.get_mut(&id) else {
            return false;
        };
        let before = ch.listeners.len();
        ch.listeners.retain(|l| l.id != listener || l.endpoint != endpoint);
        ch.listeners.len() != before
    }

    /// Send `data` from `from` over the channel. Returns `false` if the
    /// channel is unknown, `from` is not an endpoint, or the far side is
    /// unassigned. On success the message is queued for polling and every
    /// far-side listener is scheduled, in registration order.
    pub(crate) fn channel_send(
        &mut self,
        sched: &mut Scheduler,
        id: ChannelId,
        from: Pid,
        data: Value,
    ) -> bool {
        let Some(ch) = self.channels.get_mut(&id) else {
            return false;
        };
        let Some(to) = ch.other_endpoint(from) else {
            return false;
        };
        let msg = IpcMessage { from, to, data };
        if to == ch.initiator {
            ch.to_initiator.push_back(msg.clone());
        } else {
            ch.to_peer.push_back(msg.clone());
        }
        // Snapshot the listener list now; registrations made while the
        // deliveries are in flight only see later messages.
        let targets: Vec<(Pid, Rc<RefCell<ListenerFn>>)> = ch
            .listeners
            .iter()
            .filter(|l| l.endpoint == to)
            .map(|l| (l.endpoint, l.cb.clone()))
            .collect();
        for (endpoint, cb) in targets {
            let msg = msg.clone();
            sched.defer(Box::new(move |k| {
                let gate = Gate::for_pid(k, endpoint);
                if let Err(e) = (cb.borrow_mut())(gate, &msg) {
                    warn!("listener on channel {id} failed: {e}");
                }
            }));
        }
        true
    }

    /// Pop the oldest undelivered message addressed to `endpoint`.
    pub(crate) fn channel_receive(&mut self, id: ChannelId, endpoint: Pid) -> Option<IpcMessage> {
        let ch = self.channels.get_mut(&id)?;
        if endpoint == ch.initiator {
            ch.to_initiator.pop_front()
        } else if ch.peer == Some(endpoint) {
            ch.to_peer.pop_front()
        } else {
            None
        }
    }

    // =========================================================================
    // Sweep
    // =========================================================================

    /// Reap services and channels whose owners have died. A channel survives
    /// while either endpoint is live; kernel-owned resources are never
    /// reaped. Returns (services, channels) removed.
    pub(crate) fn sweep(&mut self, table: &ProcessTable) -> (usize, usize) {
        let services_before = self.services.len();
        self.services.retain(|_, s| table.is_live(s.owner));

        let channels_before = self.channels.len();
        self.channels.retain(|_, ch| {
            table.is_live(ch.initiator) || ch.peer.map_or(false, |p| table.is_live(p))
        });

        let removed = (
            services_before - self.services.len(),
            channels_before - self.channels.len(),
        );
        if removed != (0, 0) {
            debug!("ipc sweep reaped {} services, {} channels", removed.0, removed.1);
        }
        removed
    }

    /// Drop all IPC state (panic teardown).
    pub(crate) fn clear(&mut self) {
        self.services.clear();
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::SourceCommand;
    use serde_json::json;

    fn world() -> (ProcessTable, Scheduler, IpcManager) {
        let mut table = ProcessTable::new();
        table.create_process(SourceCommand::parse("idle").unwrap(), 0); // pid 1
        table.create_process(SourceCommand::parse("echod &").unwrap(), 0); // pid 2
        (table, Scheduler::new(), IpcManager::new())
    }

    #[test]
    fn connect_requires_a_live_owner() {
        let (mut table, mut sched, mut ipc) = world();
        assert_eq!(ipc.create_channel(&table, &mut sched, Pid(1), "echo"), None);

        ipc.service_register("echo", Pid(2), Box::new(|_, _, _| Ok(())));
        assert!(ipc.create_channel(&table, &mut sched, Pid(1), "echo").is_some());

        // Dead owner: lookup evicts the registration and connect fails.
        table.mark_terminated(Pid(2));
        assert_eq!(ipc.create_channel(&table, &mut sched, Pid(1), "echo"), None);
        assert_eq!(ipc.service_owner("echo"), None);
    }

    #[test]
    fn registration_overwrites() {
        let (_, _, mut ipc) = world();
        ipc.service_register("echo", Pid(2), Box::new(|_, _, _| Ok(())));
        ipc.service_register("echo", Pid(1), Box::new(|_, _, _| Ok(())));
        assert_eq!(ipc.service_owner("echo"), Some(Pid(1)));
    }

    #[test]
    fn send_is_endpoint_only_and_queues_per_direction() {
        let (table, mut sched, mut ipc) = world();
        ipc.service_register("echo", Pid(2), Box::new(|_, _, _| Ok(())));
        let ch = ipc.create_channel(&table, &mut sched, Pid(1), "echo").unwrap();

        assert!(!ipc.channel_send(&mut sched, ChannelId(99), Pid(1), json!(1)));
        assert!(!ipc.channel_send(&mut sched, ch, Pid(7), json!(1)));

        assert!(ipc.channel_send(&mut sched, ch, Pid(1), json!("ping")));
        assert!(ipc.channel_send(&mut sched, ch, Pid(2), json!("pong")));

        let to_peer = ipc.channel_receive(ch, Pid(2)).unwrap();
        assert_eq!(to_peer.from, Pid(1));
        assert_eq!(to_peer.to, Pid(2));
        assert_eq!(to_peer.data, json!("ping"));

        let to_initiator = ipc.channel_receive(ch, Pid(1)).unwrap();
        assert_eq!(to_initiator.data, json!("pong"));

        assert!(ipc.channel_receive(ch, Pid(1)).is_none());
        assert!(ipc.channel_receive(ch, Pid(7)).is_none());
    }

    #[test]
    fn listen_is_endpoint_only() {
        let (table, mut sched, mut ipc) = world();
        ipc.service_register("echo", Pid(2), Box::new(|_, _, _| Ok(())));
        let ch = ipc.create_channel(&table, &mut sched, Pid(1), "echo").unwrap();

        assert!(ipc.channel_listen(ch, Pid(1), Box::new(|_, _| Ok(()))).is_some());
        assert!(ipc.channel_listen(ch, Pid(2), Box::new(|_, _| Ok(()))).is_some());
        assert!(ipc.channel_listen(ch, Pid(7), Box::new(|_, _| Ok(()))).is_none());
        assert!(ipc.channel_listen(ChannelId(99), Pid(1), Box::new(|_, _| Ok(()))).is_none());
    }

    #[test]
    fn unlisten_removes_exactly_one_registration() {
        let (table, mut sched, mut ipc) = world();
        ipc.service_register("echo", Pid(2), Box::new(|_, _, _| Ok(())));
        let ch = ipc.create_channel(&table, &mut sched, Pid(1), "echo").unwrap();

        let a = ipc.channel_listen(ch, Pid(1), Box::new(|_, _| Ok(()))).unwrap();
        let b = ipc.channel_listen(ch, Pid(1), Box::new(|_, _| Ok(()))).unwrap();
        assert_ne!(a, b);
        // Only the registering endpoint may unlisten.
        assert!(!ipc.channel_unlisten(ch, Pid(2), a));
        assert!(ipc.channel_unlisten(ch, Pid(1), a));
        assert!(!ipc.channel_unlisten(ch, Pid(1), a));
        assert!(ipc.channel_unlisten(ch, Pid(1), b));
    }

    #[test]
    fn reserved_channels_connect_in_two_steps() {
        let (table, mut sched, mut ipc) = world();
        let ch = ipc.reserve_kernel_channel();

        // Unassigned: the kernel has no far side to send to, and a random
        // pid is not an endpoint.
        assert!(!ipc.channel_send(&mut sched, ch, pid::KERNEL, json!(1)));
        assert!(!ipc.is_endpoint(ch, Pid(2)));

        assert!(ipc.assign_kernel_channel(ch, Pid(2)));
        assert!(!ipc.assign_kernel_channel(ch, Pid(1)));
        assert!(ipc.is_endpoint(ch, Pid(2)));
        assert!(ipc.channel_send(&mut sched, ch, pid::KERNEL, json!(1)));

        // Regular channels cannot be re-assigned.
        ipc.service_register("echo", Pid(2), Box::new(|_, _, _| Ok(())));
        let regular = ipc.create_channel(&table, &mut sched, Pid(1), "echo").unwrap();
        assert!(!ipc.assign_kernel_channel(regular, Pid(1)));
    }

    #[test]
    fn sweep_reaps_dead_owners_but_spares_the_kernel() {
        let (mut table, mut sched, mut ipc) = world();
        ipc.service_register("echo", Pid(2), Box::new(|_, _, _| Ok(())));
        let ch = ipc.create_channel(&table, &mut sched, Pid(1), "echo").unwrap();
        let kernel_ch = ipc.reserve_kernel_channel();

        assert_eq!(ipc.sweep(&table), (0, 0));

        // Peer dies; the channel survives through its live initiator.
        table.mark_terminated(Pid(2));
        assert_eq!(ipc.sweep(&table), (1, 0));
        assert!(ipc.channel_exists(ch));

        // Both endpoints dead: reaped. Kernel-initiated channels stay.
        table.mark_terminated(Pid(1));
        assert_eq!(ipc.sweep(&table), (0, 1));
        assert!(!ipc.channel_exists(ch));
        assert!(ipc.channel_exists(kernel_ch));
    }
}
