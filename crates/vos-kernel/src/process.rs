//! Per-process bookkeeping.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::fmt;
use vos_hal::WindowId;
use vos_ipc::{Attachment, Pid, ProcessDescriptor};

use crate::command::SourceCommand;
use crate::gate::ExitFn;
use crate::sched::TimerId;

/// Kernel-side record of a live process.
///
/// Owns the ids of every timer, interval and window the process created, so
/// that kill can dispose them. The resources themselves live in the
/// scheduler and window server.
pub struct ProcessContext {
    pub pid: Pid,
    pub command: SourceCommand,
    /// Wallclock timestamp at creation.
    pub created_at_ms: u64,
    pub attachment: Attachment,
    /// Whether the detach asked to suppress launcher notification.
    pub detach_silently: bool,
    /// Whether this process holds elevated access.
    pub privileged: bool,
    /// Exit listeners: (registrant, callback). Fired once, on kill.
    pub(crate) exit_listeners: Vec<(Pid, ExitFn)>,
    pub(crate) timers: BTreeSet<TimerId>,
    pub(crate) intervals: BTreeSet<TimerId>,
    pub(crate) windows: Vec<WindowId>,
}

impl ProcessContext {
    pub(crate) fn new(pid: Pid, command: SourceCommand, created_at_ms: u64) -> Self {
        let attachment = if command.background {
            Attachment::Background
        } else {
            Attachment::Foreground
        };
        Self {
            pid,
            command,
            created_at_ms,
            attachment,
            detach_silently: false,
            privileged: false,
            exit_listeners: Vec::new(),
            timers: BTreeSet::new(),
            intervals: BTreeSet::new(),
            windows: Vec::new(),
        }
    }

    /// Decouple from the launcher. Idempotent; there is no way back to
    /// foreground or background. Repeated calls may still tighten the
    /// silent flag.
    pub fn detach(&mut self, silently: bool) {
        self.attachment = Attachment::Detached;
        self.detach_silently = self.detach_silently || silently;
    }

    /// Read-only view safe to hand across process boundaries.
    pub fn descriptor(&self) -> ProcessDescriptor {
        ProcessDescriptor {
            pid: self.pid,
            command: self.command.line(),
            created_at_ms: self.created_at_ms,
            attachment: self.attachment,
        }
    }
}

impl fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessContext")
            .field("pid", &self.pid)
            .field("command", &self.command.line())
            .field("attachment", &self.attachment)
            .field("privileged", &self.privileged)
            .field("exit_listeners", &self.exit_listeners.len())
            .field("timers", &self.timers.len())
            .field("intervals", &self.intervals.len())
            .field("windows", &self.windows.len())
            .finish()
    }
}
