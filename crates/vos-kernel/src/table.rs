//! The process table.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use vos_ipc::{pid, Pid};

use crate::command::SourceCommand;
use crate::process::ProcessContext;

/// All live processes, keyed by pid.
///
/// Pids start at 1 and strictly increase for the lifetime of the table;
/// a pid is never reused, even after its process dies.
pub struct ProcessTable {
    processes: BTreeMap<Pid, ProcessContext>,
    next_pid: u64,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            processes: BTreeMap::new(),
            next_pid: pid::INIT.0,
        }
    }

    /// Allocate the next pid and insert a fresh context for it.
    pub fn create_process(&mut self, command: SourceCommand, created_at_ms: u64) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        self.processes
            .insert(pid, ProcessContext::new(pid, command, created_at_ms));
        pid
    }

    pub fn get(&self, pid: Pid) -> Option<&ProcessContext> {
        self.processes.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut ProcessContext> {
        self.processes.get_mut(&pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.processes.contains_key(&pid)
    }

    /// Whether `pid` may own IPC resources. The kernel pseudo-process is
    /// always live despite never appearing in the table.
    pub fn is_live(&self, pid: Pid) -> bool {
        pid == pid::KERNEL || self.contains(pid)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.processes.keys().copied().collect()
    }

    /// Remove a process record. The pid is retired permanently.
    pub(crate) fn mark_terminated(&mut self, pid: Pid) -> Option<ProcessContext> {
        self.processes.remove(&pid)
    }

    /// (pid, command line) for every live process, for diagnostics.
    pub fn snapshot(&self) -> Vec<(Pid, String)> {
        self.processes
            .values()
            .map(|p| (p.pid, p.command.line()))
            .collect()
    }

    /// Empty the table, yielding every context for teardown.
    pub(crate) fn drain(&mut self) -> Vec<(Pid, ProcessContext)> {
        core::mem::take(&mut self.processes).into_iter().collect()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
