//! IPC protocol types & constants for Vireo OS
//!
//! This crate is the single source of truth for everything that crosses a
//! channel between two processes (or between a process and the kernel):
//!
//! - **Identifiers** (`Pid`, `ChannelId`) and well-known pids
//! - **The message envelope** (`IpcMessage`): an opaque JSON payload plus
//!   sender/receiver pids; no wire schema is enforced beyond the envelope
//! - **Privilege handshake payloads** (`PrivilegeRequest` / `PrivilegeAck` /
//!   `PrivilegeDecision`)
//! - **Protocol constants**: resend cadence, deadlines, reserved storage
//!   paths
//!
//! Keeping these here eliminates duplication between the kernel and the
//! programs that speak the kernel's protocols.

#![no_std]
extern crate alloc;

use alloc::string::String;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Process identifier.
///
/// Positive, strictly increasing for the lifetime of a session, never
/// reused. `Pid(0)` is reserved for the kernel pseudo-process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pid(pub u64);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel identifier, strictly increasing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl core::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Well-known process IDs.
pub mod pid {
    use super::Pid;

    /// The kernel pseudo-process. Never appears in the process table but is
    /// always considered live; the kernel listens on brokered channels under
    /// this pid.
    pub const KERNEL: Pid = Pid(0);

    /// The init process. Boot fails unless the first spawn receives this
    /// pid, and the session panics if it ever exits.
    pub const INIT: Pid = Pid(1);
}

/// How a process is coupled to whatever launched it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attachment {
    /// Blocks its launcher until it exits.
    Foreground,
    /// Launcher continues; it is notified on exit.
    Background,
    /// Fully decoupled from its launcher. There is no transition back.
    Detached,
}

/// A point-to-point message between two endpoint pids.
///
/// Immutable; constructed fresh for every send. The payload is opaque to the
/// transport layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IpcMessage {
    /// Sending endpoint.
    pub from: Pid,
    /// Receiving endpoint.
    pub to: Pid,
    /// Opaque payload.
    pub data: Value,
}

/// Read-only view of a process, safe to hand to other processes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    /// The process's pid.
    pub pid: Pid,
    /// The command line it was spawned from.
    pub command: String,
    /// Creation wallclock timestamp (ms since Unix epoch).
    pub created_at_ms: u64,
    /// Current attachment state.
    pub attachment: Attachment,
}

// =============================================================================
// Privilege handshake payloads
// =============================================================================
//
// The escalation protocol is request → acknowledge → decide. The kernel is
// the only sender of requests and the only consumer of acks/decisions; the
// requesting process never talks to the agent directly. Every reply must
// name the pid it concerns; replies for any other pid are ignored, which
// defends a shared agent against cross-talk and spoofing.

/// Kernel → agent: please arbitrate an escalation request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrivilegeRequest {
    /// Read-only descriptor of the requesting process.
    pub process: ProcessDescriptor,
    /// Human-readable justification supplied by the requester.
    pub reason: String,
}

/// Agent → kernel: the request is being handled; stop resending.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivilegeAck {
    /// Pid of the request this ack concerns.
    pub process: Pid,
    /// Always `true`; present so the shape is self-describing on the wire.
    pub handling: bool,
}

/// Agent → kernel: the final decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivilegeDecision {
    /// Pid of the request this decision concerns.
    pub process: Pid,
    /// Whether elevated access is granted.
    pub granted: bool,
}

// =============================================================================
// Protocol constants
// =============================================================================

/// Cadence at which the kernel resends an unacknowledged privilege request.
pub const RESEND_INTERVAL_MS: u64 = 500;

/// How long the kernel keeps resending before giving up on an ack.
pub const ACK_WINDOW_MS: u64 = 10_000;

/// Overall deadline for a decision, measured from the first send. Expiry is
/// treated as a denial.
pub const DECISION_DEADLINE_MS: u64 = 60_000;

/// Interval of the advisory sweep that reaps services/channels owned by dead
/// processes.
pub const SWEEP_INTERVAL_MS: u64 = 10_000;

/// Minimum program compat version accepted by spawn.
pub const MIN_COMPAT: &str = "1.0.0";

/// Reserved storage paths.
pub mod paths {
    /// Storage key naming the init program.
    pub const INIT_PATH: &str = "/sys/init";

    /// Storage key naming the privilege-arbitration agent program.
    pub const AGENT_PATH: &str = "/sys/privd";

    /// Storage key for the default agent's allow/deny policy.
    pub const AGENT_POLICY_PATH: &str = "/sys/privd/policy";

    /// Prefix under which program manifests are mounted at boot.
    pub const PROGRAMS_PREFIX: &str = "/bin/";

    /// Path prefixes that are read-only for userspace.
    pub const READ_ONLY_PREFIXES: [&str; 2] = ["/bin/", "/sys/"];
}

/// Name of the built-in privilege agent, used when no agent is configured.
pub const DEFAULT_AGENT: &str = "privd";

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn ack_and_decision_shapes_are_distinct() {
        // The kernel tells the two replies apart purely by their fields.
        let decision = serde_json::to_value(PrivilegeDecision {
            process: Pid(7),
            granted: true,
        })
        .unwrap();
        assert!(serde_json::from_value::<PrivilegeAck>(decision.clone()).is_err());
        assert!(serde_json::from_value::<PrivilegeDecision>(decision).is_ok());

        let ack = serde_json::to_value(PrivilegeAck {
            process: Pid(7),
            handling: true,
        })
        .unwrap();
        assert!(serde_json::from_value::<PrivilegeDecision>(ack.clone()).is_err());
        assert!(serde_json::from_value::<PrivilegeAck>(ack).is_ok());
    }

    #[test]
    fn request_embeds_a_descriptor() {
        let req = PrivilegeRequest {
            process: ProcessDescriptor {
                pid: Pid(4),
                command: "pkg install foo".to_string(),
                created_at_ms: 1_737_504_000_000,
                attachment: Attachment::Foreground,
            },
            reason: "install a package".to_string(),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["process"]["pid"], 4);
        assert_eq!(value["reason"], "install a package");
    }

    #[test]
    fn timing_constants_are_consistent() {
        // The ack window must fit inside the overall deadline, and resends
        // must happen several times within the ack window.
        assert!(ACK_WINDOW_MS < DECISION_DEADLINE_MS);
        assert!(RESEND_INTERVAL_MS * 2 < ACK_WINDOW_MS);
    }
}
