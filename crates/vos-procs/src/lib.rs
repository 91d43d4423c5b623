//! Built-in system programs for Vireo OS
//!
//! Ships the programs a minimal session needs: an inert `idle`, the `echod`
//! echo service, and `privd`, the default privilege-arbitration agent.
//! Embedders call [`register_builtins`] before boot.

#![no_std]
extern crate alloc;

pub mod echod;
pub mod idle;
pub mod privd;

use vos_kernel::Kernel;

/// Install every built-in program into the kernel's registry.
pub fn register_builtins(kernel: &mut Kernel) {
    kernel.install_program(idle::entry());
    kernel.install_program(echod::entry());
    kernel.install_program(privd::entry());
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use alloc::string::ToString;
    use alloc::vec::Vec;
    use core::cell::RefCell;
    use serde_json::json;
    use vos_hal::MemHal;
    use vos_ipc::paths::AGENT_POLICY_PATH;
    use vos_ipc::Pid;
    use vos_kernel::{fn_entry, Gate, PrivilegeOutcome, Syscalls};

    fn session() -> (Kernel, Rc<MemHal>) {
        let hal = Rc::new(MemHal::new());
        let mut kernel = Kernel::new(hal.clone());
        register_builtins(&mut kernel);
        (kernel, hal)
    }

    #[test]
    fn idle_runs_until_killed() {
        let (mut k, _) = session();
        let p = k.spawn_line("idle", false).unwrap().pid;
        k.run_until_idle();
        k.advance_ms(60_000);
        assert!(k.describe(p).is_some());
        assert!(k.kill(p, 0));
        assert!(k.describe(p).is_none());
    }

    #[test]
    fn echod_echoes_payloads_back() {
        let (mut k, _) = session();
        k.spawn_line("echod &", false).unwrap();
        let client = k.spawn_line("idle", false).unwrap().pid;
        k.run_until_idle();

        let ch = k.gate(client).connect("echo").unwrap();
        k.run_until_idle();

        let replies = Rc::new(RefCell::new(Vec::new()));
        let seen = replies.clone();
        let _ = k.gate(client).channel_listen(ch, move |_, msg| {
            seen.borrow_mut().push(msg.data.clone());
            Ok(())
        });

        assert!(k.gate(client).channel_send(ch, json!({"n": 1})));
        assert!(k.gate(client).channel_send(ch, json!("two")));
        k.run_until_idle();

        assert_eq!(&*replies.borrow(), &[json!({"n": 1}), json!("two")]);
        // The replies were also queued for polling, addressed to the client.
        let polled = k.gate(client).channel_receive(ch).unwrap();
        assert_eq!(polled.to, client);
    }

    #[test]
    fn echo_service_is_unknown_until_echod_runs() {
        let (mut k, _) = session();
        let client = k.spawn_line("idle", false).unwrap().pid;
        k.run_until_idle();
        assert_eq!(k.gate(client).connect("echo"), None);
    }

    fn requester(outcomes: Rc<RefCell<Vec<PrivilegeOutcome>>>) -> vos_kernel::ProgramEntry {
        fn_entry("app", "1.0.0", move |mut gate: Gate<'_>, _ctx| {
            let outcomes = outcomes.clone();
            gate.request_privilege("install a package", move |_, outcome| {
                outcomes.borrow_mut().push(outcome);
                Ok(())
            });
            Ok(())
        })
    }

    #[test]
    fn privd_grants_when_policy_allows() {
        let (mut k, hal) = session();
        hal.put(AGENT_POLICY_PATH, b"allow");
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        k.install_program(requester(outcomes.clone()));

        let app = k.spawn_line("app", false).unwrap().pid;
        k.run_until_idle();

        assert_eq!(&*outcomes.borrow(), &[PrivilegeOutcome::Granted]);
        assert!(k.gate(app).is_privileged());
    }

    #[test]
    fn privd_denies_by_default() {
        let (mut k, _) = session();
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        k.install_program(requester(outcomes.clone()));

        let app = k.spawn_line("app", false).unwrap().pid;
        k.run_until_idle();

        assert_eq!(&*outcomes.borrow(), &[PrivilegeOutcome::Denied]);
        assert!(!k.gate(app).is_privileged());
    }

    #[test]
    fn privd_denies_on_garbage_policy() {
        let (mut k, hal) = session();
        hal.put(AGENT_POLICY_PATH, b"ask me later");
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        k.install_program(requester(outcomes.clone()));

        k.spawn_line("app", false).unwrap();
        k.run_until_idle();
        assert_eq!(&*outcomes.borrow(), &[PrivilegeOutcome::Denied]);
    }

    #[test]
    fn privd_requires_a_channel_argument() {
        let (mut k, _) = session();
        // Spawned without the kernel's channel handshake the agent cannot
        // start; spawn reports success and the process dies with code 1.
        let codes = Rc::new(RefCell::new(Vec::new()));
        let seen = codes.clone();
        k.install_program(fn_entry("watcher", "1.0.0", move |mut gate, _| {
            let seen = seen.clone();
            let agent = gate
                .spawn("privd")
                .map_err(|e| vos_kernel::ProgramError::Failed(e.to_string()))?;
            gate.on_exit(agent.pid, move |_, code| {
                seen.borrow_mut().push(code);
                Ok(())
            });
            Ok(())
        }));
        k.spawn_line("watcher", false).unwrap();
        k.run_until_idle();
        assert_eq!(&*codes.borrow(), &[1]);
    }

    #[test]
    fn boots_with_idle_as_init() {
        let (mut k, hal) = session();
        hal.put("/sys/init", b"idle");
        let init = k.boot().unwrap();
        k.run_until_idle();
        assert_eq!(init, Pid(1));
        assert!(!k.has_panicked());
    }
}
