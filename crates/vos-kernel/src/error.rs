//! Kernel error taxonomy.

use alloc::string::String;
use vos_ipc::Pid;

/// Errors surfaced by kernel entry points.
///
/// Program-level failures (a program erroring out of `start`, a callback
/// failing) are logged and converted into process exits instead; this enum
/// covers the operations a caller can meaningfully handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// No program with this name is registered.
    CommandNotFound(String),
    /// A program instance reported a different name than the one it was
    /// resolved under.
    ProgramNameMismatch { requested: String, resolved: String },
    /// The program's compat version is below the minimum this kernel runs.
    IncompatibleProgram { name: String, compat: String },
    /// Boot could not bring up the init process.
    BootFailure(String),
    /// A userspace caller attempted a privileged operation.
    SecurityViolation(String),
    /// The HAL storage layer failed.
    Storage(String),
    /// The named process is not in the table.
    ProcessNotFound(Pid),
    /// The kernel has panicked; no further work is accepted.
    Panicked,
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KernelError::CommandNotFound(name) => write!(f, "command not found: {name}"),
            KernelError::ProgramNameMismatch { requested, resolved } => {
                write!(f, "program name mismatch: requested {requested}, resolved {resolved}")
            }
            KernelError::IncompatibleProgram { name, compat } => {
                write!(f, "incompatible program {name} (compat {compat})")
            }
            KernelError::BootFailure(reason) => write!(f, "boot failure: {reason}"),
            KernelError::SecurityViolation(what) => write!(f, "security violation: {what}"),
            KernelError::Storage(what) => write!(f, "storage error: {what}"),
            KernelError::ProcessNotFound(pid) => write!(f, "no such process: {pid}"),
            KernelError::Panicked => write!(f, "kernel has panicked"),
        }
    }
}
