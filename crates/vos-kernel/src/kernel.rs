//! Kernel orchestration: boot, spawn, kill, panic, and the pump.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use log::{debug, error, info, warn};
use serde_json::Value;
use vos_hal::{Hal, PanicReport, WindowId, WindowServer};
use vos_ipc::{paths, pid, ChannelId, Pid, ProcessDescriptor, DEFAULT_AGENT, MIN_COMPAT, SWEEP_INTERVAL_MS};

use crate::broker::PrivilegeBroker;
use crate::command::SourceCommand;
use crate::error::KernelError;
use crate::gate::{ExitFn, Gate, IntervalFn, TimerFn, WaitFn};
use crate::ipc::IpcManager;
use crate::program::{compat, ProgramEntry, ProgramLoader, ProgramManifest, StartContext};
use crate::program::ProgramRegistry;
use crate::sched::{Scheduler, TimerEntry, TimerId, TimerKind};
use crate::table::ProcessTable;

/// Result of a successful spawn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Spawned {
    pub pid: Pid,
}

/// The session kernel.
///
/// Single-threaded and event-driven: entry points mutate state and queue
/// deferred tasks; the embedder drives everything by calling
/// [`run_until_idle`](Kernel::run_until_idle) and
/// [`advance_ms`](Kernel::advance_ms).
pub struct Kernel {
    hal: Rc<dyn Hal>,
    window_server: Option<Rc<dyn WindowServer>>,
    loader: Option<Box<dyn ProgramLoader>>,
    pub(crate) table: ProcessTable,
    pub(crate) ipc: IpcManager,
    pub(crate) sched: Scheduler,
    pub(crate) registry: ProgramRegistry,
    pub(crate) broker: PrivilegeBroker,
    window_owners: BTreeMap<WindowId, Pid>,
    init_pid: Option<Pid>,
    panicked: bool,
    after_panic: Option<Box<dyn FnOnce(&PanicReport)>>,
}

impl Kernel {
    /// Build a kernel over the given HAL and arm the periodic IPC sweep.
    pub fn new(hal: Rc<dyn Hal>) -> Self {
        let mut kernel = Self {
            hal,
            window_server: None,
            loader: None,
            table: ProcessTable::new(),
            ipc: IpcManager::new(),
            sched: Scheduler::new(),
            registry: ProgramRegistry::new(),
            broker: PrivilegeBroker::new(),
            window_owners: BTreeMap::new(),
            init_pid: None,
            panicked: false,
            after_panic: None,
        };
        kernel.sched.create_interval(
            pid::KERNEL,
            SWEEP_INTERVAL_MS,
            Box::new(|gate: Gate<'_>| {
                if let Some(mut pg) = gate.privileged() {
                    pg.kernel().sweep_now();
                }
                Ok(())
            }),
        );
        kernel
    }

    pub fn set_window_server(&mut self, ws: Rc<dyn WindowServer>) {
        self.window_server = Some(ws);
    }

    pub fn set_loader(&mut self, loader: impl ProgramLoader + 'static) {
        self.loader = Some(Box::new(loader));
    }

    /// Hook run once, after panic teardown and rendering.
    pub fn set_after_panic(&mut self, hook: impl FnOnce(&PanicReport) + 'static) {
        self.after_panic = Some(Box::new(hook));
    }

    /// Register a program from the embedder side, bypassing gate checks.
    pub fn install_program(&mut self, entry: ProgramEntry) {
        self.registry.register(entry);
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn now_ms(&self) -> u64 {
        self.sched.now_ms()
    }

    pub fn wallclock_ms(&self) -> u64 {
        self.hal.wallclock_ms()
    }

    pub fn has_panicked(&self) -> bool {
        self.panicked
    }

    pub fn init_pid(&self) -> Option<Pid> {
        self.init_pid
    }

    pub(crate) fn hal(&self) -> &dyn Hal {
        &*self.hal
    }

    /// A gate bound to `pid`, reflecting its current privilege.
    pub fn gate(&mut self, pid: Pid) -> Gate<'_> {
        Gate::for_pid(self, pid)
    }

    pub fn describe(&self, pid: Pid) -> Option<ProcessDescriptor> {
        self.table.get(pid).map(|p| p.descriptor())
    }

    pub fn processes(&self) -> Vec<ProcessDescriptor> {
        self.table.pids().into_iter().filter_map(|p| self.describe(p)).collect()
    }

    fn storage_string(&self, path: &str) -> Option<String> {
        let bytes = self.hal.storage_read(path).ok()?;
        let text = String::from_utf8(bytes).ok()?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    fn configured_init(&self) -> Option<String> {
        self.storage_string(paths::INIT_PATH)
    }

    /// The privilege agent currently configured, falling back to the
    /// built-in default.
    pub(crate) fn agent_name(&self) -> String {
        self.storage_string(paths::AGENT_PATH)
            .unwrap_or_else(|| DEFAULT_AGENT.to_string())
    }

    /// Names userspace may not replace or remove: built-ins, the configured
    /// init program, and the configured privilege agent.
    pub(crate) fn is_protected_program(&self, name: &str) -> bool {
        self.registry.is_builtin(name)
            || self.configured_init().as_deref() == Some(name)
            || self.agent_name() == name
    }

    // =========================================================================
    // The pump
    // =========================================================================

    /// Run queued tasks (and the tasks they queue) until none remain.
    pub fn run_until_idle(&mut self) {
        while let Some(task) = self.sched.pop_task() {
            task(self);
        }
    }

    /// Move virtual time forward by `ms`, firing due timers in deadline
    /// order and draining the task queue after each.
    pub fn advance_ms(&mut self, ms: u64) {
        let target = self.sched.now_ms().saturating_add(ms);
        self.run_until_idle();
        while let Some((id, deadline)) = self.sched.next_due(target) {
            self.sched.set_clock(deadline);
            self.fire_timer(id);
            self.run_until_idle();
        }
        self.sched.set_clock(target);
    }

    fn fire_timer(&mut self, id: TimerId) {
        let Some(entry) = self.sched.take_any(id) else {
            return;
        };
        let TimerEntry { owner, deadline_ms, kind } = entry;
        match kind {
            TimerKind::Timeout { cb, on_cancel: _, waiters } => {
                if let Some(p) = self.table.get_mut(owner) {
                    p.timers.remove(&id);
                }
                self.sched.defer(Box::new(move |k| {
                    if let Some(cb) = cb {
                        let gate = Gate::for_pid(k, owner);
                        if let Err(e) = cb(gate) {
                            warn!("timer callback for pid {owner} failed: {e}");
                        }
                    }
                    for (wpid, waiter) in waiters {
                        let gate = Gate::for_pid(k, wpid);
                        if let Err(e) = waiter(gate, true) {
                            warn!("timer waiter for pid {wpid} failed: {e}");
                        }
                    }
                }));
            }
            TimerKind::Interval { period_ms, cb } => {
                let task_cb = cb.clone();
                self.sched.reinsert(
                    id,
                    TimerEntry {
                        owner,
                        deadline_ms: deadline_ms.saturating_add(period_ms),
                        kind: TimerKind::Interval { period_ms, cb },
                    },
                );
                self.sched.defer(Box::new(move |k| {
                    let gate = Gate::for_pid(k, owner);
                    if let Err(e) = (task_cb.borrow_mut())(gate) {
                        warn!("interval callback for pid {owner} failed: {e}");
                    }
                }));
            }
        }
    }

    // =========================================================================
    // Boot
    // =========================================================================

    /// Bring up the session: mount `/bin/` manifests, then spawn the
    /// configured init program privileged as pid 1. Init must outlive the
    /// session; its exit (any code) panics the kernel.
    pub fn boot(&mut self) -> Result<Pid, KernelError> {
        if self.panicked {
            return Err(KernelError::Panicked);
        }
        info!("kernel boot");
        self.mount_programs();

        let Some(init_name) = self.configured_init() else {
            let reason = String::from("no init program configured");
            self.panic(&reason, None);
            return Err(KernelError::BootFailure(reason));
        };
        let command = SourceCommand::new(&init_name, &[], false);
        let spawned = match self.spawn(&command, true) {
            Ok(s) => s,
            Err(e) => {
                let reason = alloc::format!("init program {init_name} failed to spawn: {e}");
                self.panic(&reason, None);
                return Err(KernelError::BootFailure(reason));
            }
        };
        if spawned.pid != pid::INIT {
            let reason = alloc::format!("init received pid {}, expected {}", spawned.pid, pid::INIT);
            self.panic(&reason, None);
            return Err(KernelError::BootFailure(reason));
        }
        self.init_pid = Some(spawned.pid);
        self.do_on_exit(
            pid::KERNEL,
            spawned.pid,
            Box::new(|gate, code| {
                if let Some(mut pg) = gate.privileged() {
                    pg.kernel()
                        .panic(&alloc::format!("init exited with code {code}"), None);
                }
                Ok(())
            }),
        );
        info!("init {init_name} running as pid {}", spawned.pid);
        Ok(spawned.pid)
    }

    /// Register every parseable manifest under `/bin/` for which the loader
    /// supplies an implementation. Failures are logged and skipped.
    fn mount_programs(&mut self) {
        for key in self.hal.storage_list(paths::PROGRAMS_PREFIX) {
            let bytes = match self.hal.storage_read(&key) {
                Ok(b) => b,
                Err(e) => {
                    warn!("cannot read {key}: {e}");
                    continue;
                }
            };
            let manifest: ProgramManifest = match serde_json::from_slice(&bytes) {
                Ok(m) => m,
                Err(e) => {
                    warn!("bad program manifest at {key}: {e}");
                    continue;
                }
            };
            let Some(loader) = &self.loader else {
                debug!("no program loader configured; skipping {key}");
                continue;
            };
            match loader.load(&manifest) {
                Some(factory) => {
                    debug!("mounted program {} from {key}", manifest.name);
                    self.registry.register(ProgramEntry::new(manifest, factory));
                }
                None => warn!("no implementation for program {} at {key}", manifest.name),
            }
        }
    }

    // =========================================================================
    // Spawn / kill
    // =========================================================================

    /// Parse `line` and spawn it.
    pub fn spawn_line(&mut self, line: &str, start_privileged: bool) -> Result<Spawned, KernelError> {
        let command = SourceCommand::parse(line)
            .ok_or_else(|| KernelError::CommandNotFound(line.trim().to_string()))?;
        self.spawn(&command, start_privileged)
    }

    /// Create a process for `command` and queue its program's `start`.
    ///
    /// The instance's own manifest must agree with the name it was resolved
    /// under, and its compat version must be acceptable; both are checked
    /// before a pid is allocated.
    pub fn spawn(&mut self, command: &SourceCommand, start_privileged: bool) -> Result<Spawned, KernelError> {
        if self.panicked {
            return Err(KernelError::Panicked);
        }
        let (manifest, mut program) = match self.registry.resolve(&command.name) {
            Some(entry) => (entry.manifest.clone(), (entry.factory)()),
            None => return Err(KernelError::CommandNotFound(command.name.clone())),
        };
        let reported = program.manifest();
        if reported.name != command.name || manifest.name != command.name {
            return Err(KernelError::ProgramNameMismatch {
                requested: command.name.clone(),
                resolved: reported.name,
            });
        }
        if !compat::is_compatible(&reported.compat, MIN_COMPAT) {
            return Err(KernelError::IncompatibleProgram {
                name: reported.name,
                compat: reported.compat,
            });
        }

        let created_at = self.hal.wallclock_ms();
        let pid = self.table.create_process(command.clone(), created_at);
        if start_privileged {
            if let Some(p) = self.table.get_mut(pid) {
                p.privileged = true;
            }
        }
        debug!("spawned {} as pid {pid}", command.name);

        let ctx = StartContext {
            pid,
            args: command.args.clone(),
            background: command.background,
        };
        let name = command.name.clone();
        self.sched.defer(Box::new(move |k| {
            let gate = Gate::for_pid(k, pid);
            if let Err(e) = program.start(gate, &ctx) {
                warn!("{name} (pid {pid}) failed to start: {e}");
                k.kill(pid, 1);
            }
        }));
        Ok(Spawned { pid })
    }

    /// Terminate a process and dispose everything it owns. Idempotent;
    /// `false` when the pid is not live. The kill is advisory: tasks already
    /// queued on its behalf still run.
    pub fn kill(&mut self, target: Pid, code: i32) -> bool {
        let Some(ctx) = self.table.mark_terminated(target) else {
            return false;
        };
        debug!("pid {target} exited with code {code}");

        for id in ctx.timers {
            if let Some(TimerEntry {
                owner,
                kind: TimerKind::Timeout { on_cancel, waiters, .. },
                ..
            }) = self.sched.take_timeout(id)
            {
                self.schedule_cancellation(owner, on_cancel, waiters);
            }
        }
        for id in ctx.intervals {
            self.sched.discard_timer(id);
        }
        for window in ctx.windows {
            self.window_owners.remove(&window);
            if let Some(ws) = &self.window_server {
                ws.dispose_window(window);
            }
        }
        for (registrant, cb) in ctx.exit_listeners {
            self.sched.defer(Box::new(move |k| {
                let gate = Gate::for_pid(k, registrant);
                if let Err(e) = cb(gate, code) {
                    warn!("exit listener registered by pid {registrant} failed: {e}");
                }
            }));
        }
        true
    }

    // =========================================================================
    // Gate backends
    // =========================================================================

    pub(crate) fn do_detach(&mut self, pid: Pid, silently: bool) -> bool {
        match self.table.get_mut(pid) {
            Some(p) => {
                p.detach(silently);
                true
            }
            None => false,
        }
    }

    pub(crate) fn do_on_exit(&mut self, registrant: Pid, target: Pid, cb: ExitFn) -> bool {
        match self.table.get_mut(target) {
            Some(p) => {
                p.exit_listeners.push((registrant, cb));
                true
            }
            None => false,
        }
    }

    pub(crate) fn do_create_timeout(
        &mut self,
        owner: Pid,
        delay_ms: u64,
        cb: Option<TimerFn>,
        on_cancel: Option<TimerFn>,
    ) -> TimerId {
        let id = self.sched.create_timeout(owner, delay_ms, cb, on_cancel);
        if let Some(p) = self.table.get_mut(owner) {
            p.timers.insert(id);
        }
        id
    }

    /// Whether `caller` may cancel or clear a timer held by `owner`. The
    /// kernel's own protocol timers are off limits from every gate.
    fn may_touch_timer(&self, caller: Pid, owner: Pid) -> bool {
        if owner == pid::KERNEL {
            return false;
        }
        caller == owner
            || caller == pid::KERNEL
            || self.table.get(caller).map_or(false, |p| p.privileged)
    }

    pub(crate) fn do_cancel_timeout(&mut self, caller: Pid, id: TimerId) -> bool {
        match self.sched.timer_owner(id) {
            Some(owner) if self.may_touch_timer(caller, owner) => {}
            _ => return false,
        }
        let Some(TimerEntry {
            owner,
            kind: TimerKind::Timeout { on_cancel, waiters, .. },
            ..
        }) = self.sched.take_timeout(id)
        else {
            return false;
        };
        if let Some(p) = self.table.get_mut(owner) {
            p.timers.remove(&id);
        }
        self.schedule_cancellation(owner, on_cancel, waiters);
        true
    }

    fn schedule_cancellation(&mut self, owner: Pid, on_cancel: Option<TimerFn>, waiters: Vec<(Pid, WaitFn)>) {
        self.sched.defer(Box::new(move |k| {
            if let Some(cb) = on_cancel {
                let gate = Gate::for_pid(k, owner);
                if let Err(e) = cb(gate) {
                    warn!("cancellation callback for pid {owner} failed: {e}");
                }
            }
            for (wpid, waiter) in waiters {
                let gate = Gate::for_pid(k, wpid);
                if let Err(e) = waiter(gate, false) {
                    warn!("timer waiter for pid {wpid} failed: {e}");
                }
            }
        }));
    }

    pub(crate) fn do_wait_timeout(&mut self, caller: Pid, id: TimerId, waiter: WaitFn) {
        if let Err(waiter) = self.sched.try_add_waiter(id, caller, waiter) {
            // Unknown or settled: resolve immediately as not-fired.
            self.sched.defer(Box::new(move |k| {
                let gate = Gate::for_pid(k, caller);
                if let Err(e) = waiter(gate, false) {
                    warn!("timer waiter for pid {caller} failed: {e}");
                }
            }));
        }
    }

    pub(crate) fn do_create_interval(&mut self, owner: Pid, period_ms: u64, cb: IntervalFn) -> TimerId {
        let id = self.sched.create_interval(owner, period_ms, cb);
        if let Some(p) = self.table.get_mut(owner) {
            p.intervals.insert(id);
        }
        id
    }

    pub(crate) fn do_clear_interval(&mut self, caller: Pid, id: TimerId) -> bool {
        match self.sched.timer_owner(id) {
            Some(owner) if self.may_touch_timer(caller, owner) => {}
            _ => return false,
        }
        let Some(entry) = self.sched.take_interval(id) else {
            return false;
        };
        if let Some(p) = self.table.get_mut(entry.owner) {
            p.intervals.remove(&id);
        }
        true
    }

    pub(crate) fn do_create_window(&mut self, owner: Pid) -> Option<WindowId> {
        let ws = self.window_server.clone()?;
        let window = ws.new_window(owner);
        self.window_owners.insert(window, owner);
        if let Some(p) = self.table.get_mut(owner) {
            p.windows.push(window);
        }
        Some(window)
    }

    /// The embedder reports that a window was closed on its side. The window
    /// leaves its owner's set so a later kill will not dispose it again.
    pub fn notify_window_closed(&mut self, window: WindowId) {
        if let Some(owner) = self.window_owners.remove(&window) {
            if let Some(p) = self.table.get_mut(owner) {
                p.windows.retain(|w| *w != window);
            }
        }
    }

    pub(crate) fn sweep_now(&mut self) {
        let _ = self.ipc.sweep(&self.table);
    }

    pub(crate) fn ipc_lookup(&mut self, name: &str) -> Option<Pid> {
        self.ipc.service_lookup(&self.table, name)
    }

    pub(crate) fn ipc_connect(&mut self, initiator: Pid, service: &str) -> Option<ChannelId> {
        self.ipc
            .create_channel(&self.table, &mut self.sched, initiator, service)
    }

    pub(crate) fn ipc_send(&mut self, channel: ChannelId, from: Pid, data: Value) -> bool {
        self.ipc.channel_send(&mut self.sched, channel, from, data)
    }

    // =========================================================================
    // Panic
    // =========================================================================

    /// Kill the session. Idempotent. Collects diagnostics, tears down every
    /// process (without firing exit listeners), clears IPC and timers,
    /// renders the report through the HAL, then runs the `after_panic` hook.
    pub fn panic(&mut self, message: &str, detail: Option<&str>) {
        if self.panicked {
            return;
        }
        self.panicked = true;
        error!("kernel panic: {message}");

        let report = PanicReport {
            message: String::from(message),
            detail: detail.map(String::from),
            processes: self.table.snapshot(),
        };
        let drained = self.table.drain();
        if let Some(ws) = &self.window_server {
            for (_, ctx) in &drained {
                for window in &ctx.windows {
                    ws.dispose_window(*window);
                }
            }
        }
        drop(drained);
        self.window_owners.clear();
        self.ipc.clear();
        self.sched.clear();
        self.broker.clear();

        self.hal.render_panic(&report);
        if let Some(hook) = self.after_panic.take() {
            hook(&report);
        }
    }
}
