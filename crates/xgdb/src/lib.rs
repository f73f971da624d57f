//! xgdb - GDB remote debug stub for an emulated PowerPC guest
//!
//! Exposes an [`Engine`](xgdb_engine::Engine) over the GDB remote serial
//! protocol on a local TCP port, so a stock `gdb` or IDE can pause, step,
//! inspect and breakpoint guest code.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use xgdb::{GdbServer, StubConfig};
//! use xgdb_engine::SimEngine;
//!
//! let sim = Arc::new(SimEngine::builder().region(0x8200_0000, 0x1_0000).thread("main", 0x8200_0000).build());
//! let server = GdbServer::bind(sim, StubConfig::default())?;
//! server.serve()?; // Blocks until the guest ends
//! ```

pub mod breakpoints;
pub mod bridge;
pub mod cache;
pub mod dispatch;
mod error;
pub mod metrics;
pub mod packet;
pub mod server;
pub mod target;

pub use breakpoints::{Breakpoint, BreakpointManager};
pub use bridge::ExecutionBridge;
pub use cache::{Notification, SharedCache, StateCache, StopKind};
pub use dispatch::{Dispatcher, ErrorCode, Response, stop_reply};
pub use error::{Result, StubError};
pub use packet::{Command, Frame, PacketBuffer};
pub use server::{DetachPolicy, GdbServer, SessionEnd, StubConfig};
