//! Busybox-style re-exec dispatch.
//!
//! The supervisor re-invokes its own binary with a distinguished argv[0]
//! so that the child, after entering the new namespaces, lands in an
//! alternate entry point instead of `main`. The registry is built once at
//! program start and consulted once; there is no global mutable state.
//!
//! The re-exec image is `/proc/self/exe` — the in-memory binary — so
//! replacing the file on disk mid-run is safe.

/// Path of the running binary's in-memory image.
pub const SELF_EXE: &str = "/proc/self/exe";

/// The sentinel argv[0] under which the jailer entry runs.
pub const SETUP_SENTINEL: &str = "setup";

type Entry = fn() -> i32;

/// Immutable sentinel → entry table.
pub struct Registry {
    entries: Vec<(&'static str, Entry)>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            entries: Vec::new(),
        }
    }

    /// Add an entry point under a sentinel name.
    ///
    /// Panics if the name is already registered; duplicate sentinels are a
    /// programming error, not a runtime condition.
    pub fn register(mut self, name: &'static str, entry: Entry) -> Self {
        if self.entries.iter().any(|(n, _)| *n == name) {
            panic!("re-exec entry already registered under name {:?}", name);
        }
        self.entries.push((name, entry));
        self
    }

    /// Run the entry matching this process's argv[0], if any, and return
    /// its exit code. `None` means argv[0] is not a sentinel and control
    /// should fall through to the regular CLI.
    pub fn dispatch(&self) -> Option<i32> {
        let argv0 = std::env::args().next()?;
        self.dispatch_for(&argv0)
    }

    fn dispatch_for(&self, argv0: &str) -> Option<i32> {
        let (_, entry) = self.entries.iter().find(|(n, _)| *n == argv0)?;
        Some(entry())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
