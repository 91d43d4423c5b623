//! `idle`: does nothing until killed. Useful as a stand-in init.

use alloc::boxed::Box;
use alloc::string::ToString;

use vos_kernel::{Gate, Program, ProgramEntry, ProgramError, ProgramManifest, StartContext};

pub struct Idle;

fn manifest() -> ProgramManifest {
    ProgramManifest {
        name: "idle".to_string(),
        compat: "1.0.0".to_string(),
        description: "does nothing until killed".to_string(),
    }
}

impl Program for Idle {
    fn manifest(&self) -> ProgramManifest {
        manifest()
    }

    fn start(&mut self, _gate: Gate<'_>, _ctx: &StartContext) -> Result<(), ProgramError> {
        Ok(())
    }
}

pub fn entry() -> ProgramEntry {
    ProgramEntry::builtin(manifest(), Box::new(|| Box::new(Idle)))
}
