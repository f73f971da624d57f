//! Emulation engine interface for the xgdb debug stub.
//!
//! The debug stub never owns guest state. It talks to the emulator through the
//! [`Engine`] trait and receives pause/step/breakpoint notifications through a
//! [`DebugListener`] it registers on attach.
//!
//! [`SimEngine`] is a small deterministic engine implementing the interface.
//! It backs the test-suite and the `xgdb` demo binary.
//!
//! ```ignore
//! use std::sync::Arc;
//! use xgdb_engine::{Engine, SimEngine};
//!
//! let sim = Arc::new(SimEngine::builder().region(0x8200_0000, 0x1_0000).thread("main", 0x8200_0000).build());
//! let bp = sim.install_breakpoint(0x8200_0010)?;
//! sim.resume()?;
//! sim.run_for(8); // hits the breakpoint after four ticks
//! ```

mod engine;
mod register;
mod sim;
mod types;

pub use engine::{BreakpointHandle, DebugListener, Engine, EngineEvent};
pub use register::{NUM_FPRS, NUM_GPRS, Register};
pub use sim::{SimEngine, SimEngineBuilder};
pub use types::{Module, ThreadId, ThreadInfo, ThreadState};

use thiserror::Error;

/// Errors reported by an emulation engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("guest range {addr:#x}+{len:#x} is not mapped")]
    Unmapped { addr: u64, len: usize },

    #[error("no live guest thread with id {0}")]
    InvalidThread(ThreadId),

    #[error("register {0} is not accessible")]
    InvalidRegister(Register),

    #[error("cannot place a breakpoint at {0:#x}")]
    InvalidAddress(u64),

    #[error("unknown breakpoint handle {0:?}")]
    UnknownBreakpoint(BreakpointHandle),

    #[error("operation requires the guest to be paused")]
    NotPaused,

    #[error("guest execution has ended")]
    Ended,
}

pub type Result<T> = std::result::Result<T, EngineError>;
