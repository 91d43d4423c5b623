//! Platform abstraction for Vireo OS
//!
//! The kernel is embedder-agnostic: everything it needs from the outside
//! world comes through the [`Hal`] trait (wallclock time, a synchronous
//! key/value storage namespace, panic rendering) plus the optional
//! [`WindowServer`] trait for hosts that can display windows.
//!
//! [`MemHal`] is an in-memory implementation for unit tests and headless
//! embedding.

#![no_std]
extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use vos_ipc::Pid;

/// Window identifier assigned by the window server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowId(pub u64);

/// HAL errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalError {
    /// Storage key does not exist.
    NotFound,
    /// Underlying storage failed.
    Io,
    /// Operation not supported on this platform.
    NotSupported,
}

impl core::fmt::Display for HalError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HalError::NotFound => write!(f, "not found"),
            HalError::Io => write!(f, "i/o error"),
            HalError::NotSupported => write!(f, "not supported"),
        }
    }
}

/// Diagnostic snapshot rendered when the session dies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PanicReport {
    /// What went wrong.
    pub message: String,
    /// Optional extra detail supplied by the panic site.
    pub detail: Option<String>,
    /// Every process that was live at panic time: (pid, source command).
    pub processes: Vec<(Pid, String)>,
}

/// Platform contract consumed by the kernel.
///
/// Storage is a flat, synchronous key/value namespace with path-shaped keys
/// (`/sys/init`, `/bin/...`). Implementations use interior mutability; the
/// runtime is single-threaded and cooperative, so no locking is required.
pub trait Hal {
    /// Wall-clock time in milliseconds since the Unix epoch. Used only for
    /// timestamps; all scheduling runs on the kernel's virtual clock.
    fn wallclock_ms(&self) -> u64;

    /// Read a storage key.
    fn storage_read(&self, path: &str) -> Result<Vec<u8>, HalError>;

    /// Write a storage key, creating it if absent.
    fn storage_write(&self, path: &str, data: &[u8]) -> Result<(), HalError>;

    /// Whether a storage key exists.
    fn storage_exists(&self, path: &str) -> bool;

    /// All keys starting with `prefix`, in unspecified order.
    fn storage_list(&self, prefix: &str) -> Vec<String>;

    /// Render an unrecoverable-session report to the user.
    fn render_panic(&self, report: &PanicReport);
}

/// Optional window service contract.
///
/// Window close events originate on the embedder side and are forwarded to
/// the kernel via `Kernel::notify_window_closed`.
pub trait WindowServer {
    /// Open a window owned by `owner`.
    fn new_window(&self, owner: Pid) -> WindowId;

    /// Tear a window down (e.g. because its owner died).
    fn dispose_window(&self, window: WindowId);
}

/// In-memory HAL for tests and headless hosts.
///
/// Wallclock is settable, storage is a `BTreeMap`, and panic reports are
/// captured instead of rendered.
#[derive(Default)]
pub struct MemHal {
    wallclock_ms: core::cell::Cell<u64>,
    storage: RefCell<BTreeMap<String, Vec<u8>>>,
    panics: RefCell<Vec<PanicReport>>,
}

impl MemHal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the wall-clock time returned by `wallclock_ms`.
    pub fn set_wallclock_ms(&self, ms: u64) {
        self.wallclock_ms.set(ms);
    }

    /// Seed a storage key (test convenience).
    pub fn put(&self, path: &str, data: &[u8]) {
        self.storage
            .borrow_mut()
            .insert(String::from(path), data.to_vec());
    }

    /// Panic reports captured so far.
    pub fn panics(&self) -> Vec<PanicReport> {
        self.panics.borrow().clone()
    }
}

impl Hal for MemHal {
    fn wallclock_ms(&self) -> u64 {
        self.wallclock_ms.get()
    }

    fn storage_read(&self, path: &str) -> Result<Vec<u8>, HalError> {
        self.storage
            .borrow()
            .get(path)
            .cloned()
            .ok_or(HalError::NotFound)
    }

    fn storage_write(&self, path: &str, data: &[u8]) -> Result<(), HalError> {
        self.storage
            .borrow_mut()
            .insert(String::from(path), data.to_vec());
        Ok(())
    }

    fn storage_exists(&self, path: &str) -> bool {
        self.storage.borrow().contains_key(path)
    }

    fn storage_list(&self, prefix: &str) -> Vec<String> {
        self.storage
            .borrow()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn render_panic(&self, report: &PanicReport) {
        self.panics.borrow_mut().push(report.clone());
    }
}

/// Window server test double: hands out sequential ids and records disposals.
#[derive(Default)]
pub struct MemWindowServer {
    next: core::cell::Cell<u64>,
    disposed: RefCell<Vec<WindowId>>,
}

impl MemWindowServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Windows disposed so far, in order.
    pub fn disposed(&self) -> Vec<WindowId> {
        self.disposed.borrow().clone()
    }
}

impl WindowServer for MemWindowServer {
    fn new_window(&self, _owner: Pid) -> WindowId {
        let id = self.next.get() + 1;
        self.next.set(id);
        WindowId(id)
    }

    fn dispose_window(&self, window: WindowId) {
        self.disposed.borrow_mut().push(window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec;

    #[test]
    fn mem_storage_read_write_exists() {
        let hal = MemHal::new();
        assert_eq!(hal.storage_read("/sys/init"), Err(HalError::NotFound));
        assert!(!hal.storage_exists("/sys/init"));

        hal.storage_write("/sys/init", b"shelld").unwrap();
        assert_eq!(hal.storage_read("/sys/init").unwrap(), b"shelld");
        assert!(hal.storage_exists("/sys/init"));
    }

    #[test]
    fn mem_storage_list_by_prefix() {
        let hal = MemHal::new();
        hal.put("/bin/idle", b"{}");
        hal.put("/bin/echod", b"{}");
        hal.put("/sys/init", b"idle");

        let mut bins = hal.storage_list("/bin/");
        bins.sort();
        assert_eq!(bins, vec!["/bin/echod".to_string(), "/bin/idle".to_string()]);
    }

    #[test]
    fn mem_hal_captures_panics() {
        let hal = MemHal::new();
        hal.render_panic(&PanicReport {
            message: "boot failed".to_string(),
            detail: None,
            processes: vec![],
        });
        assert_eq!(hal.panics().len(), 1);
        assert_eq!(hal.panics()[0].message, "boot failed");
    }

    #[test]
    fn window_ids_are_sequential() {
        let ws = MemWindowServer::new();
        assert_eq!(ws.new_window(Pid(2)), WindowId(1));
        assert_eq!(ws.new_window(Pid(3)), WindowId(2));
        ws.dispose_window(WindowId(1));
        assert_eq!(ws.disposed(), vec![WindowId(1)]);
    }
}
