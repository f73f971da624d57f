//! Debugger-visible snapshot of emulator state.
//!
//! The cache is the only state shared between the engine's callback threads
//! and the transport listener. It sits behind one mutex; a condition variable
//! wakes the listener when a stop notification is posted or the session ends.
//!
//! Lock order is cache, then engine: the cache lock may be held while calling
//! into the engine, never the reverse.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;
use xgdb_engine::{Engine, Module, ThreadId, ThreadInfo};

/// Why the guest stopped, as reported to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopKind {
    /// Generic pause (engine- or UI-initiated).
    Paused,
    /// Pause requested by the client's interrupt byte.
    Interrupted,
    /// Single step finished.
    Step,
    /// Code breakpoint reached.
    Breakpoint,
    /// Guest program ended.
    Exited,
}

/// An event the listener still has to deliver as a stop reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Notification {
    pub kind: StopKind,
    pub thread: Option<ThreadId>,
    pub address: Option<u64>,
}

impl Notification {
    #[must_use]
    pub const fn new(kind: StopKind) -> Self {
        Self {
            kind,
            thread: None,
            address: None,
        }
    }
}

/// Emulator state as last observed at a synchronization point.
#[derive(Debug, Default)]
pub struct StateCache {
    /// Thread addressed by register and step commands.
    pub current_thread: Option<ThreadId>,
    /// Thread that most recently hit a breakpoint.
    pub last_breakpoint_thread: Option<ThreadId>,
    pending: Option<Notification>,
    coalesced: u64,
    stopped: bool,
    terminated: bool,
    detached: bool,
    interrupt_requested: bool,
    modules: Vec<Arc<Module>>,
    // Present only while stopped; cleared as soon as the guest resumes.
    threads: Option<Vec<ThreadInfo>>,
}

impl StateCache {
    /// Re-enumerate threads and modules from the engine.
    ///
    /// Keeps `current_thread` if it is still alive, otherwise selects the
    /// first live thread.
    pub fn refresh(&mut self, engine: &dyn Engine) {
        let threads = engine.threads();
        let still_alive = self
            .current_thread
            .is_some_and(|tid| threads.iter().any(|t| t.id == tid));
        if !still_alive {
            self.current_thread = threads.first().map(|t| t.id);
        }
        self.threads = Some(threads);
        self.modules = engine.modules();
    }

    pub fn refresh_modules(&mut self, engine: &dyn Engine) {
        self.modules = engine.modules();
    }

    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.stopped
    }

    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        self.terminated
    }

    #[must_use]
    pub const fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn mark_stopped(&mut self) {
        debug_assert!(self.threads.is_some(), "stopped without a thread snapshot");
        self.stopped = true;
    }

    /// Guest is running again: thread snapshots are no longer valid.
    pub fn mark_running(&mut self) {
        self.stopped = false;
        self.threads = None;
    }

    pub fn mark_terminated(&mut self) {
        self.mark_running();
        self.terminated = true;
    }

    pub fn mark_detached(&mut self) {
        self.detached = true;
    }

    /// Remember that the next pause was asked for by the client.
    pub fn request_interrupt(&mut self) {
        self.interrupt_requested = true;
    }

    /// Consume the interrupt flag.
    pub fn take_interrupt(&mut self) -> bool {
        std::mem::take(&mut self.interrupt_requested)
    }

    /// Live threads, or `None` while the guest runs.
    #[must_use]
    pub fn threads(&self) -> Option<&[ThreadInfo]> {
        if self.stopped {
            self.threads.as_deref()
        } else {
            None
        }
    }

    #[must_use]
    pub fn thread_info_for(&self, thread: ThreadId) -> Option<&ThreadInfo> {
        self.threads()?.iter().find(|t| t.id == thread)
    }

    #[must_use]
    pub fn current_thread_info(&self) -> Option<&ThreadInfo> {
        self.thread_info_for(self.current_thread?)
    }

    #[must_use]
    pub fn modules(&self) -> &[Arc<Module>] {
        &self.modules
    }

    /// Post a stop notification. A newer one replaces an undelivered older one.
    pub fn post(&mut self, notification: Notification) {
        if let Some(previous) = self.pending.replace(notification) {
            self.coalesced += 1;
            debug!(?previous, latest = ?notification, "coalesced undelivered stop notification");
            crate::metrics::record_notification_coalesced();
        }
    }

    #[must_use]
    pub const fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn take_pending(&mut self) -> Option<Notification> {
        self.pending.take()
    }

    /// Number of notifications replaced before delivery.
    #[must_use]
    pub const fn coalesced(&self) -> u64 {
        self.coalesced
    }

    /// Forget everything observed during a session.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// What the listener found when it woke up.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Wakeup {
    pub notification: Option<Notification>,
    pub current_thread: Option<ThreadId>,
    pub terminated: bool,
    pub detached: bool,
}

/// The cache plus the condition variable used to wake the listener.
#[derive(Debug, Default)]
pub struct SharedCache {
    state: Mutex<StateCache>,
    wake: Condvar,
}

impl SharedCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, StateCache> {
        self.state.lock()
    }

    /// Wake the listener. Call after releasing the lock.
    pub fn notify(&self) {
        self.wake.notify_all();
    }

    /// Take the pending notification, waiting up to `timeout` for one while
    /// the guest is running.
    pub fn wait(&self, timeout: Duration) -> Wakeup {
        let mut state = self.state.lock();
        if !state.has_pending() && !state.stopped && !state.terminated && !state.detached {
            let _ = self.wake.wait_for(&mut state, timeout);
        }
        Wakeup {
            notification: state.take_pending(),
            current_thread: state.current_thread,
            terminated: state.terminated,
            detached: state.detached,
        }
    }
}
