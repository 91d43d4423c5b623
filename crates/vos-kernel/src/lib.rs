//! Vireo OS kernel
//!
//! A cooperative, single-session multi-process runtime. One `Kernel` owns
//! the process table, the timer scheduler, the IPC manager and the program
//! registry; programs interact with all of it exclusively through
//! capability [`Gate`]s bound to their pid.
//!
//! The runtime is event-driven on a virtual clock: kernel entry points queue
//! deferred tasks, and the embedder pumps them with
//! [`Kernel::run_until_idle`] and [`Kernel::advance_ms`]. No wall-clock
//! timers, threads or interior mutability cycles are involved, which keeps
//! scheduling fully deterministic under test.

#![no_std]
extern crate alloc;

mod broker;
mod command;
mod error;
mod gate;
mod ipc;
mod kernel;
mod process;
mod program;
mod sched;
mod table;

pub use broker::PrivilegeOutcome;
pub use command::SourceCommand;
pub use error::KernelError;
pub use gate::{
    ConnectFn, ExitFn, Gate, IntervalFn, ListenerFn, PrivilegeFn, PrivilegedGate, Syscalls,
    TimerFn, UserGate, WaitFn,
};
pub use ipc::ListenerId;
pub use kernel::{Kernel, Spawned};
pub use process::ProcessContext;
pub use program::{
    compat, fn_entry, FnProgram, Program, ProgramEntry, ProgramError, ProgramFactory,
    ProgramLoader, ProgramManifest, ProgramRegistry, StartContext,
};
pub use sched::TimerId;
pub use table::ProcessTable;
