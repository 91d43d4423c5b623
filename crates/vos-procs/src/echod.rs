//! `echod`: registers the `"echo"` service and sends every payload back.

use alloc::boxed::Box;
use alloc::string::ToString;

use vos_kernel::{Gate, Program, ProgramEntry, ProgramError, ProgramManifest, StartContext, Syscalls};

pub struct Echod;

fn manifest() -> ProgramManifest {
    ProgramManifest {
        name: "echod".to_string(),
        compat: "1.0.0".to_string(),
        description: "echo service".to_string(),
    }
}

impl Program for Echod {
    fn manifest(&self) -> ProgramManifest {
        manifest()
    }

    fn start(&mut self, mut gate: Gate<'_>, _ctx: &StartContext) -> Result<(), ProgramError> {
        gate.service_register("echo", |mut gate, channel, _initiator| {
            let _ = gate.channel_listen(channel, move |mut gate, msg| {
                gate.channel_send(channel, msg.data.clone());
                Ok(())
            });
            Ok(())
        });
        Ok(())
    }
}

pub fn entry() -> ProgramEntry {
    ProgramEntry::builtin(manifest(), Box::new(|| Box::new(Echod)))
}
