//! Programs, manifests and the registry.
//!
//! A program is a factory-produced instance with a single `start` entry
//! point. Long-running behavior is expressed by registering callbacks
//! (timers, listeners, services) before `start` returns; the instance itself
//! is dropped afterwards. State that must outlive `start` belongs in
//! `Rc<RefCell<..>>` captured by those callbacks.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};
use vos_ipc::Pid;

use crate::gate::Gate;

/// Identity and compatibility claims of a program.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramManifest {
    /// The name the program is invoked by. Spawn rejects instances whose
    /// manifest name differs from the name they were resolved under.
    pub name: String,
    /// Semver-style compat version, checked against [`vos_ipc::MIN_COMPAT`].
    pub compat: String,
    #[serde(default)]
    pub description: String,
}

impl ProgramManifest {
    pub fn new(name: &str, compat: &str) -> Self {
        Self {
            name: name.to_string(),
            compat: compat.to_string(),
            description: String::new(),
        }
    }
}

/// Error a program reports from `start` or from a registered callback.
///
/// Either way the kernel logs it; a `start` failure additionally kills the
/// freshly created process with exit code 1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgramError {
    /// The arguments the program was invoked with make no sense.
    BadArguments(String),
    /// Anything else.
    Failed(String),
}

impl core::fmt::Display for ProgramError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ProgramError::BadArguments(what) => write!(f, "bad arguments: {what}"),
            ProgramError::Failed(what) => write!(f, "{what}"),
        }
    }
}

/// What a program learns about its own invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartContext {
    pub pid: Pid,
    pub args: Vec<String>,
    pub background: bool,
}

/// A runnable program.
pub trait Program {
    fn manifest(&self) -> ProgramManifest;

    /// Entry point. Runs once, as a deferred task shortly after spawn
    /// returns, with a capability gate matching the process's privilege.
    fn start(&mut self, gate: Gate<'_>, ctx: &StartContext) -> Result<(), ProgramError>;
}

/// Produces a fresh instance per spawn.
pub type ProgramFactory = Box<dyn Fn() -> Box<dyn Program>>;

/// A registered program: manifest, provenance, factory.
pub struct ProgramEntry {
    pub manifest: ProgramManifest,
    /// Built-in entries (and the init/agent programs) cannot be replaced or
    /// removed from userspace.
    pub builtin: bool,
    pub factory: ProgramFactory,
}

impl ProgramEntry {
    pub fn new(manifest: ProgramManifest, factory: ProgramFactory) -> Self {
        Self {
            manifest,
            builtin: false,
            factory,
        }
    }

    pub fn builtin(manifest: ProgramManifest, factory: ProgramFactory) -> Self {
        Self {
            manifest,
            builtin: true,
            factory,
        }
    }
}

/// Name → program entry map. Registration overwrites.
pub struct ProgramRegistry {
    entries: BTreeMap<String, ProgramEntry>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, entry: ProgramEntry) {
        self.entries.insert(entry.manifest.name.clone(), entry);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn resolve(&self, name: &str) -> Option<&ProgramEntry> {
        self.entries.get(name)
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.entries.get(name).map_or(false, |e| e.builtin)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

impl Default for ProgramRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Supplies executable factories for manifests mounted from storage at boot.
///
/// Storage holds only manifests; an embedder that wants `/bin/` entries to
/// actually run provides the code through this trait.
pub trait ProgramLoader {
    fn load(&self, manifest: &ProgramManifest) -> Option<ProgramFactory>;
}

/// Compat version checks. Versions are `major.minor.patch` with numeric
/// components; anything else is rejected.
pub mod compat {
    /// Parse a semver triple.
    pub fn parse(version: &str) -> Option<(u64, u64, u64)> {
        let mut parts = version.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some((major, minor, patch))
    }

    /// Whether `version` is at least `minimum`. Unparseable versions never
    /// are.
    pub fn is_compatible(version: &str, minimum: &str) -> bool {
        match (parse(version), parse(minimum)) {
            (Some(v), Some(m)) => v >= m,
            _ => false,
        }
    }
}

/// A program whose whole behavior is one closure. The workhorse for tests
/// and for embedders that do not need a struct per program.
pub struct FnProgram {
    manifest: ProgramManifest,
    body: Rc<dyn Fn(Gate<'_>, &StartContext) -> Result<(), ProgramError>>,
}

impl Program for FnProgram {
    fn manifest(&self) -> ProgramManifest {
        self.manifest.clone()
    }

    fn start(&mut self, gate: Gate<'_>, ctx: &StartContext) -> Result<(), ProgramError> {
        (self.body)(gate, ctx)
    }
}

/// Registry entry wrapping a closure as a program.
pub fn fn_entry(
    name: &str,
    compat: &str,
    body: impl Fn(Gate<'_>, &StartContext) -> Result<(), ProgramError> + 'static,
) -> ProgramEntry {
    let manifest = ProgramManifest::new(name, compat);
    let body: Rc<dyn Fn(Gate<'_>, &StartContext) -> Result<(), ProgramError>> = Rc::new(body);
    ProgramEntry::new(
        manifest.clone(),
        Box::new(move || {
            Box::new(FnProgram {
                manifest: manifest.clone(),
                body: body.clone(),
            })
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compat_parses_strict_triples() {
        assert_eq!(compat::parse("1.0.0"), Some((1, 0, 0)));
        assert_eq!(compat::parse("2.10.3"), Some((2, 10, 3)));
        assert_eq!(compat::parse("1.0"), None);
        assert_eq!(compat::parse("1.0.0.0"), None);
        assert_eq!(compat::parse("1.x.0"), None);
        assert_eq!(compat::parse(""), None);
    }

    #[test]
    fn compat_orders_numerically() {
        assert!(compat::is_compatible("1.0.0", "1.0.0"));
        assert!(compat::is_compatible("1.2.0", "1.0.9"));
        assert!(compat::is_compatible("10.0.0", "9.9.9"));
        assert!(!compat::is_compatible("0.9.9", "1.0.0"));
        assert!(!compat::is_compatible("garbage", "1.0.0"));
    }

    #[test]
    fn registry_overwrites_and_tracks_builtins() {
        let mut reg = ProgramRegistry::new();
        reg.register(ProgramEntry::builtin(
            ProgramManifest::new("idle", "1.0.0"),
            Box::new(|| unreachable!()),
        ));
        assert!(reg.is_builtin("idle"));

        reg.register(fn_entry("idle", "1.1.0", |_, _| Ok(())));
        assert!(!reg.is_builtin("idle"));
        assert_eq!(reg.resolve("idle").unwrap().manifest.compat, "1.1.0");

        assert!(reg.unregister("idle"));
        assert!(!reg.unregister("idle"));
        assert!(reg.resolve("idle").is_none());
    }

    #[test]
    fn manifest_description_is_optional_on_the_wire() {
        let m: ProgramManifest =
            serde_json::from_str(r#"{"name":"idle","compat":"1.0.0"}"#).unwrap();
        assert_eq!(m.name, "idle");
        assert_eq!(m.description, "");
    }
}
