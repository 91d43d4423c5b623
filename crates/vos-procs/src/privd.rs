//! `privd`: the default privilege-arbitration agent.
//!
//! Spawned by the kernel with its brokered channel id as the only argument.
//! For every request it acknowledges immediately, then decides from the
//! policy stored at [`AGENT_POLICY_PATH`]: the literal string `allow`
//! grants, anything else (including a missing policy) denies.

use alloc::boxed::Box;
use alloc::string::{String, ToString};

use log::debug;
use vos_ipc::paths::AGENT_POLICY_PATH;
use vos_ipc::{ChannelId, IpcMessage, PrivilegeAck, PrivilegeDecision, PrivilegeRequest};
use vos_kernel::{Gate, Program, ProgramEntry, ProgramError, ProgramManifest, StartContext, Syscalls};

pub struct Privd;

fn manifest() -> ProgramManifest {
    ProgramManifest {
        name: "privd".to_string(),
        compat: "1.0.0".to_string(),
        description: "privilege arbitration agent".to_string(),
    }
}

impl Program for Privd {
    fn manifest(&self) -> ProgramManifest {
        manifest()
    }

    fn start(&mut self, mut gate: Gate<'_>, ctx: &StartContext) -> Result<(), ProgramError> {
        let arg = ctx
            .args
            .first()
            .ok_or_else(|| ProgramError::BadArguments("missing channel id".to_string()))?;
        let channel = ChannelId(
            arg.parse()
                .map_err(|_| ProgramError::BadArguments(arg.clone()))?,
        );

        let _ = gate.channel_listen(channel, move |mut gate, msg| {
            arbitrate(&mut gate, channel, msg);
            Ok(())
        });
        // The first request may already be queued from before we listened.
        while let Some(msg) = gate.channel_receive(channel) {
            arbitrate(&mut gate, channel, &msg);
        }
        Ok(())
    }
}

fn arbitrate(gate: &mut Gate<'_>, channel: ChannelId, msg: &IpcMessage) {
    let Ok(request) = serde_json::from_value::<PrivilegeRequest>(msg.data.clone()) else {
        debug!("privd: unrecognized payload ignored");
        return;
    };
    let process = request.process.pid;
    debug!(
        "privd: request from pid {process} ({}): {}",
        request.process.command, request.reason
    );

    if let Ok(ack) = serde_json::to_value(PrivilegeAck { process, handling: true }) {
        gate.channel_send(channel, ack);
    }
    let granted = gate
        .fs_read(AGENT_POLICY_PATH)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .map_or(false, |policy| policy.trim() == "allow");
    if let Ok(decision) = serde_json::to_value(PrivilegeDecision { process, granted }) {
        gate.channel_send(channel, decision);
    }
}

pub fn entry() -> ProgramEntry {
    ProgramEntry::builtin(manifest(), Box::new(|| Box::new(Privd)))
}
