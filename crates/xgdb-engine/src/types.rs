//! Thread and module descriptors reported by the engine.

use std::fmt;

/// Guest thread identifier as assigned by the emulated kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Scheduling state of a guest thread at the time of a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Suspended,
    Waiting,
}

impl ThreadState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Waiting => "waiting",
        }
    }
}

/// Snapshot of one live guest thread.
///
/// Only meaningful while the guest is paused; the engine is free to destroy
/// or reschedule the thread as soon as execution continues.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
    pub state: ThreadState,
    pub pc: u64,
}

/// A loaded guest executable or library.
///
/// Shared with the loader via `Arc`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub base: u64,
    pub size: u64,
}
