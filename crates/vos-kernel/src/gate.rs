//! Capability gates.
//!
//! Every kernel service a program can touch flows through a gate bound to
//! that program's pid. [`PrivilegedGate`] forwards straight to the kernel;
//! [`UserGate`] forwards the allowed calls and rejects the rest. Both
//! implement [`Syscalls`], the surface programs are written against.
//!
//! Gates are transient borrows: the kernel constructs a fresh one for every
//! program entry point and callback invocation, reflecting the privilege the
//! process holds at that moment (an escalation mid-flight is visible to the
//! next callback, not the current one).

use alloc::boxed::Box;
use alloc::string::ToString;
use alloc::vec::Vec;

use serde_json::Value;
use vos_hal::{HalError, WindowId};
use vos_ipc::{paths, pid, ChannelId, IpcMessage, Pid, ProcessDescriptor};

use crate::broker::PrivilegeOutcome;
use crate::error::KernelError;
use crate::ipc::ListenerId;
use crate::kernel::{Kernel, Spawned};
use crate::program::{ProgramEntry, ProgramError};
use crate::sched::TimerId;

// Callback shapes. All run as deferred tasks from the pump, each with a
// freshly constructed gate for the owning process.

pub type TimerFn = Box<dyn FnOnce(Gate<'_>) -> Result<(), ProgramError>>;
pub type IntervalFn = Box<dyn FnMut(Gate<'_>) -> Result<(), ProgramError>>;
/// Timer completion waiter; the flag is `true` if the timer fired and
/// `false` if it was cancelled or its owner died.
pub type WaitFn = Box<dyn FnOnce(Gate<'_>, bool) -> Result<(), ProgramError>>;
/// Exit listener; receives the exit code.
pub type ExitFn = Box<dyn FnOnce(Gate<'_>, i32) -> Result<(), ProgramError>>;
pub type ListenerFn = Box<dyn FnMut(Gate<'_>, &IpcMessage) -> Result<(), ProgramError>>;
/// Service connection callback; receives the new channel and the initiator.
pub type ConnectFn = Box<dyn FnMut(Gate<'_>, ChannelId, Pid) -> Result<(), ProgramError>>;
pub type PrivilegeFn = Box<dyn FnOnce(Gate<'_>, PrivilegeOutcome) -> Result<(), ProgramError>>;

fn is_read_only_path(path: &str) -> bool {
    paths::READ_ONLY_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// The system-call surface shared by both gates.
#[allow(clippy::too_many_arguments)]
pub trait Syscalls {
    /// The pid this gate is bound to.
    fn pid(&self) -> Pid;

    /// Whether this gate carries elevated access.
    fn is_privileged(&self) -> bool;

    /// Virtual clock, milliseconds.
    fn now_ms(&self) -> u64;

    /// Wall-clock milliseconds since the Unix epoch, from the HAL.
    fn wallclock_ms(&self) -> u64;

    /// Read-only view of any live process.
    fn describe(&self, pid: Pid) -> Option<ProcessDescriptor>;

    /// Decouple the calling process from its launcher. One-way.
    fn detach(&mut self, silently: bool) -> bool;

    /// Terminate the calling process. Callbacks already queued may still
    /// run; new resources die with the pid.
    fn exit(&mut self, code: i32) -> bool;

    /// Watch `target` for exit. `false` if it is not live.
    fn on_exit(
        &mut self,
        target: Pid,
        cb: impl FnOnce(Gate<'_>, i32) -> Result<(), ProgramError> + 'static,
    ) -> bool;

    /// One-shot timer.
    fn create_timeout(
        &mut self,
        delay_ms: u64,
        cb: impl FnOnce(Gate<'_>) -> Result<(), ProgramError> + 'static,
    ) -> TimerId;

    /// One-shot timer with a cancellation callback.
    fn create_timeout_with_cancel(
        &mut self,
        delay_ms: u64,
        cb: impl FnOnce(Gate<'_>) -> Result<(), ProgramError> + 'static,
        on_cancel: impl FnOnce(Gate<'_>) -> Result<(), ProgramError> + 'static,
    ) -> TimerId;

    /// Cancel a pending one-shot. Its callback never runs; its cancel
    /// callback and waiters are notified. `false` if already settled or
    /// held by another process (privileged callers may reach across, but
    /// never into the kernel's own timers).
    fn cancel_timeout(&mut self, timer: TimerId) -> bool;

    /// Observe a one-shot's completion. An unknown or settled timer resolves
    /// immediately with `false`.
    fn wait_timeout(
        &mut self,
        timer: TimerId,
        waiter: impl FnOnce(Gate<'_>, bool) -> Result<(), ProgramError> + 'static,
    );

    /// Repeating timer.
    fn create_interval(
        &mut self,
        period_ms: u64,
        cb: impl FnMut(Gate<'_>) -> Result<(), ProgramError> + 'static,
    ) -> TimerId;

    /// Stop a repeating timer. `false` if unknown or held by another
    /// process, with the same ownership rules as
    /// [`cancel_timeout`](Syscalls::cancel_timeout).
    fn clear_interval(&mut self, timer: TimerId) -> bool;

    /// Open a window owned by the calling process. `None` when the embedder
    /// has no window server.
    fn create_window(&mut self) -> Option<WindowId>;

    /// Advertise a service name. Overwrites any existing registration.
    fn service_register(
        &mut self,
        name: &str,
        on_connection: impl FnMut(Gate<'_>, ChannelId, Pid) -> Result<(), ProgramError> + 'static,
    );

    /// Withdraw a service registration.
    fn service_unregister(&mut self, name: &str) -> bool;

    /// Resolve a service to its owning pid, evicting it if the owner died.
    fn service_lookup(&mut self, name: &str) -> Option<Pid>;

    /// Connect to a service, yielding a channel on success.
    fn connect(&mut self, service: &str) -> Option<ChannelId>;

    /// Push delivery of messages addressed to this endpoint.
    fn channel_listen(
        &mut self,
        channel: ChannelId,
        listener: impl FnMut(Gate<'_>, &IpcMessage) -> Result<(), ProgramError> + 'static,
    ) -> Option<ListenerId>;

    fn channel_unlisten(&mut self, channel: ChannelId, listener: ListenerId) -> bool;

    /// Send to the far endpoint. `false` if the channel is gone or the
    /// caller is not an endpoint.
    fn channel_send(&mut self, channel: ChannelId, data: Value) -> bool;

    /// Poll the oldest undelivered message addressed to this endpoint.
    fn channel_receive(&mut self, channel: ChannelId) -> Option<IpcMessage>;

    fn destroy_channel(&mut self, channel: ChannelId) -> bool;

    fn fs_read(&mut self, path: &str) -> Result<Vec<u8>, HalError>;

    fn fs_write(&mut self, path: &str, data: &[u8]) -> Result<(), KernelError>;

    fn fs_exists(&mut self, path: &str) -> bool;

    /// Add a program to the registry.
    fn register_program(&mut self, entry: ProgramEntry) -> Result<(), KernelError>;

    /// Remove a program from the registry. `Ok(false)` if absent.
    fn unregister_program(&mut self, name: &str) -> Result<bool, KernelError>;

    /// Spawn from a command line. The new process always starts
    /// unprivileged.
    fn spawn(&mut self, line: &str) -> Result<Spawned, KernelError>;

    /// Ask the kernel to broker privilege escalation for the calling
    /// process. The outcome arrives through `on_done`.
    fn request_privilege(
        &mut self,
        reason: &str,
        on_done: impl FnOnce(Gate<'_>, PrivilegeOutcome) -> Result<(), ProgramError> + 'static,
    );
}

// =============================================================================
// Privileged gate
// =============================================================================

/// Full-access gate. Held by privileged processes and by the kernel itself.
pub struct PrivilegedGate<'k> {
    kernel: &'k mut Kernel,
    pid: Pid,
}

impl<'k> PrivilegedGate<'k> {
    /// Direct kernel access, for embedders and kernel-internal callbacks.
    pub fn kernel(&mut self) -> &mut Kernel {
        self.kernel
    }

    /// Terminate any process.
    pub fn kill(&mut self, target: Pid, code: i32) -> bool {
        self.kernel.kill(target, code)
    }

    /// Every live pid.
    pub fn list_pids(&self) -> Vec<Pid> {
        self.kernel.table.pids()
    }

    /// Spawn a process that starts with elevated access.
    pub fn spawn_privileged(&mut self, line: &str) -> Result<Spawned, KernelError> {
        self.kernel.spawn_line(line, true)
    }
}

impl Syscalls for PrivilegedGate<'_> {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn is_privileged(&self) -> bool {
        true
    }

    fn now_ms(&self) -> u64 {
        self.kernel.now_ms()
    }

    fn wallclock_ms(&self) -> u64 {
        self.kernel.wallclock_ms()
    }

    fn describe(&self, pid: Pid) -> Option<ProcessDescriptor> {
        self.kernel.describe(pid)
    }

    fn detach(&mut self, silently: bool) -> bool {
        self.kernel.do_detach(self.pid, silently)
    }

    fn exit(&mut self, code: i32) -> bool {
        self.kernel.kill(self.pid, code)
    }

    fn on_exit(
        &mut self,
        target: Pid,
        cb: impl FnOnce(Gate<'_>, i32) -> Result<(), ProgramError> + 'static,
    ) -> bool {
        self.kernel.do_on_exit(self.pid, target, Box::new(cb))
    }

    fn create_timeout(
        &mut self,
        delay_ms: u64,
        cb: impl FnOnce(Gate<'_>) -> Result<(), ProgramError> + 'static,
    ) -> TimerId {
        self.kernel
            .do_create_timeout(self.pid, delay_ms, Some(Box::new(cb)), None)
    }

    fn create_timeout_with_cancel(
        &mut self,
        delay_ms: u64,
        cb: impl FnOnce(Gate<'_>) -> Result<(), ProgramError> + 'static,
        on_cancel: impl FnOnce(Gate<'_>) -> Result<(), ProgramError> + 'static,
    ) -> TimerId {
        self.kernel
            .do_create_timeout(self.pid, delay_ms, Some(Box::new(cb)), Some(Box::new(on_cancel)))
    }

    fn cancel_timeout(&mut self, timer: TimerId) -> bool {
        self.kernel.do_cancel_timeout(self.pid, timer)
    }

    fn wait_timeout(
        &mut self,
        timer: TimerId,
        waiter: impl FnOnce(Gate<'_>, bool) -> Result<(), ProgramError> + 'static,
    ) {
        self.kernel.do_wait_timeout(self.pid, timer, Box::new(waiter));
    }

    fn create_interval(
        &mut self,
        period_ms: u64,
        cb: impl FnMut(Gate<'_>) -> Result<(), ProgramError> + 'static,
    ) -> TimerId {
        self.kernel.do_create_interval(self.pid, period_ms, Box::new(cb))
    }

    fn clear_interval(&mut self, timer: TimerId) -> bool {
        self.kernel.do_clear_interval(self.pid, timer)
    }

    fn create_window(&mut self) -> Option<WindowId> {
        self.kernel.do_create_window(self.pid)
    }

    fn service_register(
        &mut self,
        name: &str,
        on_connection: impl FnMut(Gate<'_>, ChannelId, Pid) -> Result<(), ProgramError> + 'static,
    ) {
        self.kernel
            .ipc
            .service_register(name, self.pid, Box::new(on_connection));
    }

    fn service_unregister(&mut self, name: &str) -> bool {
        self.kernel.ipc.service_unregister(name)
    }

    fn service_lookup(&mut self, name: &str) -> Option<Pid> {
        self.kernel.ipc_lookup(name)
    }

    fn connect(&mut self, service: &str) -> Option<ChannelId> {
        self.kernel.ipc_connect(self.pid, service)
    }

    fn channel_listen(
        &mut self,
        channel: ChannelId,
        listener: impl FnMut(Gate<'_>, &IpcMessage) -> Result<(), ProgramError> + 'static,
    ) -> Option<ListenerId> {
        self.kernel.ipc.channel_listen(channel, self.pid, Box::new(listener))
    }

    fn channel_unlisten(&mut self, channel: ChannelId, listener: ListenerId) -> bool {
        self.kernel.ipc.channel_unlisten(channel, self.pid, listener)
    }

    fn channel_send(&mut self, channel: ChannelId, data: Value) -> bool {
        self.kernel.ipc_send(channel, self.pid, data)
    }

    fn channel_receive(&mut self, channel: ChannelId) -> Option<IpcMessage> {
        self.kernel.ipc.channel_receive(channel, self.pid)
    }

    fn destroy_channel(&mut self, channel: ChannelId) -> bool {
        self.kernel.ipc.destroy_channel(channel)
    }

    fn fs_read(&mut self, path: &str) -> Result<Vec<u8>, HalError> {
        self.kernel.hal().storage_read(path)
    }

    fn fs_write(&mut self, path: &str, data: &[u8]) -> Result<(), KernelError> {
        self.kernel
            .hal()
            .storage_write(path, data)
            .map_err(|e| KernelError::Storage(e.to_string()))
    }

    fn fs_exists(&mut self, path: &str) -> bool {
        self.kernel.hal().storage_exists(path)
    }

    fn register_program(&mut self, entry: ProgramEntry) -> Result<(), KernelError> {
        self.kernel.registry.register(entry);
        Ok(())
    }

    fn unregister_program(&mut self, name: &str) -> Result<bool, KernelError> {
        Ok(self.kernel.registry.unregister(name))
    }

    fn spawn(&mut self, line: &str) -> Result<Spawned, KernelError> {
        self.kernel.spawn_line(line, false)
    }

    fn request_privilege(
        &mut self,
        reason: &str,
        on_done: impl FnOnce(Gate<'_>, PrivilegeOutcome) -> Result<(), ProgramError> + 'static,
    ) {
        self.kernel.request_privilege(self.pid, reason, Box::new(on_done));
    }
}

// =============================================================================
// Userspace gate
// =============================================================================

/// Restricted gate. Forwards the allowed calls; rejects writes to reserved
/// storage, tampering with protected program names, and anything touching
/// resources the caller does not hold an endpoint of.
pub struct UserGate<'k> {
    kernel: &'k mut Kernel,
    pid: Pid,
}

impl Syscalls for UserGate<'_> {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn is_privileged(&self) -> bool {
        false
    }

    fn now_ms(&self) -> u64 {
        self.kernel.now_ms()
    }

    fn wallclock_ms(&self) -> u64 {
        self.kernel.wallclock_ms()
    }

    fn describe(&self, pid: Pid) -> Option<ProcessDescriptor> {
        self.kernel.describe(pid)
    }

    fn detach(&mut self, silently: bool) -> bool {
        self.kernel.do_detach(self.pid, silently)
    }

    fn exit(&mut self, code: i32) -> bool {
        self.kernel.kill(self.pid, code)
    }

    fn on_exit(
        &mut self,
        target: Pid,
        cb: impl FnOnce(Gate<'_>, i32) -> Result<(), ProgramError> + 'static,
    ) -> bool {
        self.kernel.do_on_exit(self.pid, target, Box::new(cb))
    }

    fn create_timeout(
        &mut self,
        delay_ms: u64,
        cb: impl FnOnce(Gate<'_>) -> Result<(), ProgramError> + 'static,
    ) -> TimerId {
        self.kernel
            .do_create_timeout(self.pid, delay_ms, Some(Box::new(cb)), None)
    }

    fn create_timeout_with_cancel(
        &mut self,
        delay_ms: u64,
        cb: impl FnOnce(Gate<'_>) -> Result<(), ProgramError> + 'static,
        on_cancel: impl FnOnce(Gate<'_>) -> Result<(), ProgramError> + 'static,
    ) -> TimerId {
        self.kernel
            .do_create_timeout(self.pid, delay_ms, Some(Box::new(cb)), Some(Box::new(on_cancel)))
    }

    fn cancel_timeout(&mut self, timer: TimerId) -> bool {
        self.kernel.do_cancel_timeout(self.pid, timer)
    }

    fn wait_timeout(
        &mut self,
        timer: TimerId,
        waiter: impl FnOnce(Gate<'_>, bool) -> Result<(), ProgramError> + 'static,
    ) {
        self.kernel.do_wait_timeout(self.pid, timer, Box::new(waiter));
    }

    fn create_interval(
        &mut self,
        period_ms: u64,
        cb: impl FnMut(Gate<'_>) -> Result<(), ProgramError> + 'static,
    ) -> TimerId {
        self.kernel.do_create_interval(self.pid, period_ms, Box::new(cb))
    }

    fn clear_interval(&mut self, timer: TimerId) -> bool {
        self.kernel.do_clear_interval(self.pid, timer)
    }

    fn create_window(&mut self) -> Option<WindowId> {
        self.kernel.do_create_window(self.pid)
    }

    fn service_register(
        &mut self,
        name: &str,
        on_connection: impl FnMut(Gate<'_>, ChannelId, Pid) -> Result<(), ProgramError> + 'static,
    ) {
        self.kernel
            .ipc
            .service_register(name, self.pid, Box::new(on_connection));
    }

    fn service_unregister(&mut self, name: &str) -> bool {
        // Only the owner may withdraw a service from userspace.
        if self.kernel.ipc.service_owner(name) != Some(self.pid) {
            return false;
        }
        self.kernel.ipc.service_unregister(name)
    }

    fn service_lookup(&mut self, name: &str) -> Option<Pid> {
        self.kernel.ipc_lookup(name)
    }

    fn connect(&mut self, service: &str) -> Option<ChannelId> {
        self.kernel.ipc_connect(self.pid, service)
    }

    fn channel_listen(
        &mut self,
        channel: ChannelId,
        listener: impl FnMut(Gate<'_>, &IpcMessage) -> Result<(), ProgramError> + 'static,
    ) -> Option<ListenerId> {
        self.kernel.ipc.channel_listen(channel, self.pid, Box::new(listener))
    }

    fn channel_unlisten(&mut self, channel: ChannelId, listener: ListenerId) -> bool {
        self.kernel.ipc.channel_unlisten(channel, self.pid, listener)
    }

    fn channel_send(&mut self, channel: ChannelId, data: Value) -> bool {
        self.kernel.ipc_send(channel, self.pid, data)
    }

    fn channel_receive(&mut self, channel: ChannelId) -> Option<IpcMessage> {
        self.kernel.ipc.channel_receive(channel, self.pid)
    }

    fn destroy_channel(&mut self, channel: ChannelId) -> bool {
        // Userspace may only tear down channels it is an endpoint of.
        if !self.kernel.ipc.is_endpoint(channel, self.pid) {
            return false;
        }
        self.kernel.ipc.destroy_channel(channel)
    }

    fn fs_read(&mut self, path: &str) -> Result<Vec<u8>, HalError> {
        self.kernel.hal().storage_read(path)
    }

    fn fs_write(&mut self, path: &str, data: &[u8]) -> Result<(), KernelError> {
        if is_read_only_path(path) {
            return Err(KernelError::SecurityViolation(alloc::format!(
                "write to read-only path {path}"
            )));
        }
        self.kernel
            .hal()
            .storage_write(path, data)
            .map_err(|e| KernelError::Storage(e.to_string()))
    }

    fn fs_exists(&mut self, path: &str) -> bool {
        self.kernel.hal().storage_exists(path)
    }

    fn register_program(&mut self, entry: ProgramEntry) -> Result<(), KernelError> {
        let name = entry.manifest.name.clone();
        if self.kernel.is_protected_program(&name) {
            return Err(KernelError::SecurityViolation(alloc::format!(
                "cannot replace protected program {name}"
            )));
        }
        self.kernel.registry.register(entry);
        Ok(())
    }

    fn unregister_program(&mut self, name: &str) -> Result<bool, KernelError> {
        if self.kernel.is_protected_program(name) {
            return Err(KernelError::SecurityViolation(alloc::format!(
                "cannot remove protected program {name}"
            )));
        }
        Ok(self.kernel.registry.unregister(name))
    }

    fn spawn(&mut self, line: &str) -> Result<Spawned, KernelError> {
        self.kernel.spawn_line(line, false)
    }

    fn request_privilege(
        &mut self,
        reason: &str,
        on_done: impl FnOnce(Gate<'_>, PrivilegeOutcome) -> Result<(), ProgramError> + 'static,
    ) {
        self.kernel.request_privilege(self.pid, reason, Box::new(on_done));
    }
}

// =============================================================================
// Gate
// =============================================================================

/// The gate handed to program code: one of the two capability surfaces,
/// chosen by the privilege the process holds when the gate is built.
pub enum Gate<'k> {
    Privileged(PrivilegedGate<'k>),
    User(UserGate<'k>),
}

impl<'k> Gate<'k> {
    /// Build the gate matching `pid`'s current privilege. The kernel
    /// pseudo-process is always privileged; unknown pids get a userspace
    /// gate that mostly no-ops.
    pub fn for_pid(kernel: &'k mut Kernel, pid: Pid) -> Self {
        let privileged = pid == pid::KERNEL
            || kernel.table.get(pid).map_or(false, |p| p.privileged);
        if privileged {
            Gate::Privileged(PrivilegedGate { kernel, pid })
        } else {
            Gate::User(UserGate { kernel, pid })
        }
    }

    /// The privileged surface, if this gate carries it.
    pub fn privileged(self) -> Option<PrivilegedGate<'k>> {
        match self {
            Gate::Privileged(g) => Some(g),
            Gate::User(_) => None,
        }
    }
}

impl Syscalls for Gate<'_> {
    fn pid(&self) -> Pid {
        match self {
            Gate::Privileged(g) => g.pid(),
            Gate::User(g) => g.pid(),
        }
    }

    fn is_privileged(&self) -> bool {
        matches!(self, Gate::Privileged(_))
    }

    fn now_ms(&self) -> u64 {
        match self {
            Gate::Privileged(g) => g.now_ms(),
            Gate::User(g) => g.now_ms(),
        }
    }

    fn wallclock_ms(&self) -> u64 {
        match self {
            Gate::Privileged(g) => g.wallclock_ms(),
            Gate::User(g) => g.wallclock_ms(),
        }
    }

    fn describe(&self, pid: Pid) -> Option<ProcessDescriptor> {
        match self {
            Gate::Privileged(g) => g.describe(pid),
            Gate::User(g) => g.describe(pid),
        }
    }

    fn detach(&mut self, silently: bool) -> bool {
        match self {
            Gate::Privileged(g) => g.detach(silently),
            Gate::User(g) => g.detach(silently),
        }
    }

    fn exit(&mut self, code: i32) -> bool {
        match self {
            Gate::Privileged(g) => g.exit(code),
            Gate::User(g) => g.exit(code),
        }
    }

    fn on_exit(
        &mut self,
        target: Pid,
        cb: impl FnOnce(Gate<'_>, i32) -> Result<(), ProgramError> + 'static,
    ) -> bool {
        match self {
            Gate::Privileged(g) => g.on_exit(target, cb),
            Gate::User(g) => g.on_exit(target, cb),
        }
    }

    fn create_timeout(
        &mut self,
        delay_ms: u64,
        cb: impl FnOnce(Gate<'_>) -> Result<(), ProgramError> + 'static,
    ) -> TimerId {
        match self {
            Gate::Privileged(g) => g.create_timeout(delay_ms, cb),
            Gate::User(g) => g.create_timeout(delay_ms, cb),
        }
    }

    fn create_timeout_with_cancel(
        &mut self,
        delay_ms: u64,
        cb: impl FnOnce(Gate<'_>) -> Result<(), ProgramError> + 'static,
        on_cancel: impl FnOnce(Gate<'_>) -> Result<(), ProgramError> + 'static,
    ) -> TimerId {
        match self {
            Gate::Privileged(g) => g.create_timeout_with_cancel(delay_ms, cb, on_cancel),
            Gate::User(g) => g.create_timeout_with_cancel(delay_ms, cb, on_cancel),
        }
    }

    fn cancel_timeout(&mut self, timer: TimerId) -> bool {
        match self {
            Gate::Privileged(g) => g.cancel_timeout(timer),
            Gate::User(g) => g.cancel_timeout(timer),
        }
    }

    fn wait_timeout(
        &mut self,
        timer: TimerId,
        waiter: impl FnOnce(Gate<'_>, bool) -> Result<(), ProgramError> + 'static,
    ) {
        match self {
            Gate::Privileged(g) => g.wait_timeout(timer, waiter),
            Gate::User(g) => g.wait_timeout(timer, waiter),
        }
    }

    fn create_interval(
        &mut self,
        period_ms: u64,
        cb: impl FnMut(Gate<'_>) -> Result<(), ProgramError> + 'static,
    ) -> TimerId {
        match self {
            Gate::Privileged(g) => g.create_interval(period_ms, cb),
            Gate::User(g) => g.create_interval(period_ms, cb),
        }
    }

    fn clear_interval(&mut self, timer: TimerId) -> bool {
        match self {
            Gate::Privileged(g) => g.clear_interval(timer),
            Gate::User(g) => g.clear_interval(timer),
        }
    }

    fn create_window(&mut self) -> Option<WindowId> {
        match self {
            Gate::Privileged(g) => g.create_window(),
            Gate::User(g) => g.create_window(),
        }
    }

    fn service_register(
        &mut self,
        name: &str,
        on_connection: impl FnMut(Gate<'_>, ChannelId, Pid) -> Result<(), ProgramError> + 'static,
    ) {
        match self {
            Gate::Privileged(g) => g.service_register(name, on_connection),
            Gate::User(g) => g.service_register(name, on_connection),
        }
    }

    fn service_unregister(&mut self, name: &str) -> bool {
        match self {
            Gate::Privileged(g) => g.service_unregister(name),
            Gate::User(g) => g.service_unregister(name),
        }
    }

    fn service_lookup(&mut self, name: &str) -> Option<Pid> {
        match self {
            Gate::Privileged(g) => g.service_lookup(name),
            Gate::User(g) => g.service_lookup(name),
        }
    }

    fn connect(&mut self, service: &str) -> Option<ChannelId> {
        match self {
            Gate::Privileged(g) => g.connect(service),
            Gate::User(g) => g.connect(service),
        }
    }

    fn channel_listen(
        &mut self,
        channel: ChannelId,
        listener: impl FnMut(Gate<'_>, &IpcMessage) -> Result<(), ProgramError> + 'static,
    ) -> Option<ListenerId> {
        match self {
            Gate::Privileged(g) => g.channel_listen(channel, listener),
            Gate::User(g) => g.channel_listen(channel, listener),
        }
    }

    fn channel_unlisten(&mut self, channel: ChannelId, listener: ListenerId) -> bool {
        match self {
            Gate::Privileged(g) => g.channel_unlisten(channel, listener),
            Gate::User(g) => g.channel_unlisten(channel, listener),
        }
    }

    fn channel_send(&mut self, channel: ChannelId, data: Value) -> bool {
        match self {
            Gate::Privileged(g) => g.channel_send(channel, data),
            Gate::User(g) => g.channel_send(channel, data),
        }
    }

    fn channel_receive(&mut self, channel: ChannelId) -> Option<IpcMessage> {
        match self {
            Gate::Privileged(g) => g.channel_receive(channel),
            Gate::User(g) => g.channel_receive(channel),
        }
    }

    fn destroy_channel(&mut self, channel: ChannelId) -> bool {
        match self {
            Gate::Privileged(g) => g.destroy_channel(channel),
            Gate::User(g) => g.destroy_channel(channel),
        }
    }

    fn fs_read(&mut self, path: &str) -> Result<Vec<u8>, HalError> {
        match self {
            Gate::Privileged(g) => g.fs_read(path),
            Gate::User(g) => g.fs_read(path),
        }
    }

    fn fs_write(&mut self, path: &str, data: &[u8]) -> Result<(), KernelError> {
        match self {
            Gate::Privileged(g) => g.fs_write(path, data),
            Gate::User(g) => g.fs_write(path, data),
        }
    }

    fn fs_exists(&mut self, path: &str) -> bool {
        match self {
            Gate::Privileged(g) => g.fs_exists(path),
            Gate::User(g) => g.fs_exists(path),
        }
    }

    fn register_program(&mut self, entry: ProgramEntry) -> Result<(), KernelError> {
        match self {
            Gate::Privileged(g) => g.register_program(entry),
            Gate::User(g) => g.register_program(entry),
        }
    }

    fn unregister_program(&mut self, name: &str) -> Result<bool, KernelError> {
        match self {
            Gate::Privileged(g) => g.unregister_program(name),
            Gate::User(g) => g.unregister_program(name),
        }
    }

    fn spawn(&mut self, line: &str) -> Result<Spawned, KernelError> {
        match self {
            Gate::Privileged(g) => g.spawn(line),
            Gate::User(g) => g.spawn(line),
        }
    }

    fn request_privilege(
        &mut self,
        reason: &str,
        on_done: impl FnOnce(Gate<'_>, PrivilegeOutcome) -> Result<(), ProgramError> + 'static,
    ) {
        match self {
            Gate::Privileged(g) => g.request_privilege(reason, on_done),
            Gate::User(g) => g.request_privilege(reason, on_done),
        }
    }
}
