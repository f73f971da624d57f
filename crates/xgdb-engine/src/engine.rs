//! The engine trait and its event callbacks.

use std::sync::Arc;

use crate::{Module, Register, Result, ThreadId, ThreadInfo};

/// Opaque engine-side handle of an installed code breakpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BreakpointHandle(pub u64);

/// Execution events delivered to the attached [`DebugListener`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// The listener became the engine's active debugger.
    FocusGained,
    /// The listener lost focus (detached or replaced).
    FocusLost,
    /// All guest threads were suspended.
    Paused,
    /// Guest threads were resumed.
    Continued,
    /// The guest program terminated.
    Ended,
    /// A single step of `thread` finished; the guest is paused again.
    StepCompleted { thread: ThreadId },
    /// `thread` reached the code breakpoint at `address`; the guest is paused.
    BreakpointHit {
        breakpoint: BreakpointHandle,
        address: u64,
        thread: ThreadId,
    },
}

/// Receiver of engine execution events.
///
/// Called synchronously from whichever host thread caused the event (a guest
/// execution thread, or the caller of [`Engine::resume`]/[`Engine::step`]).
/// Implementations must return quickly and must not block on I/O.
pub trait DebugListener: Send + Sync {
    fn on_event(&self, event: EngineEvent);
}

/// Operations the debug stub needs from the emulation engine.
///
/// Implementations must not hold internal locks while calling
/// [`DebugListener::on_event`]: listeners call back into the engine
/// (thread and module enumeration) from inside the callback.
pub trait Engine: Send + Sync {
    /// Register `listener` as the active debugger. Emits `FocusGained`.
    fn attach(&self, listener: Arc<dyn DebugListener>);

    /// Unregister the active debugger, if any. Emits `FocusLost`.
    fn detach(&self);

    /// Whether guest execution is currently suspended.
    fn is_paused(&self) -> bool;

    /// Suspend all guest threads. Emits `Paused` if the guest was running.
    fn pause(&self) -> Result<()>;

    /// Resume all guest threads. Emits `Continued`.
    fn resume(&self) -> Result<()>;

    /// Execute one instruction on `thread`. Emits `Continued`, then `StepCompleted`.
    fn step(&self, thread: ThreadId) -> Result<()>;

    /// Enumerate live guest threads.
    fn threads(&self) -> Vec<ThreadInfo>;

    /// Enumerate loaded guest modules.
    fn modules(&self) -> Vec<Arc<Module>>;

    fn read_register(&self, thread: ThreadId, reg: Register) -> Result<u64>;

    fn write_register(&self, thread: ThreadId, reg: Register, value: u64) -> Result<()>;

    /// Read guest virtual memory. Fails with `Unmapped` if any byte is unmapped.
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Write guest virtual memory. Fails with `Unmapped` if any byte is unmapped.
    fn write_memory(&self, addr: u64, data: &[u8]) -> Result<()>;

    /// Install a code-execution breakpoint at a guest address.
    fn install_breakpoint(&self, addr: u64) -> Result<BreakpointHandle>;

    fn uninstall_breakpoint(&self, handle: BreakpointHandle) -> Result<()>;
}
