//! Code breakpoints owned by the debug session.
//!
//! A single table keyed by guest address owns every breakpoint, so lookup by
//! address and ownership can never disagree.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};
use xgdb_engine::{BreakpointHandle, Engine, EngineError};

/// One installed code breakpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    pub address: u64,
    pub handle: BreakpointHandle,
}

/// Address-keyed breakpoint table.
pub struct BreakpointManager {
    engine: Arc<dyn Engine>,
    table: FxHashMap<u64, Breakpoint>,
}

impl BreakpointManager {
    #[must_use]
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            table: FxHashMap::default(),
        }
    }

    /// Install a breakpoint at `address`, or return the existing one.
    ///
    /// # Errors
    ///
    /// Returns the engine error if installation fails; nothing is recorded then.
    pub fn set(&mut self, address: u64) -> Result<Breakpoint, EngineError> {
        if let Some(existing) = self.table.get(&address) {
            return Ok(*existing);
        }
        let handle = self.engine.install_breakpoint(address)?;
        let breakpoint = Breakpoint { address, handle };
        self.table.insert(address, breakpoint);
        debug!(addr = format!("{:#x}", address), "breakpoint set");
        Ok(breakpoint)
    }

    /// Remove the breakpoint at `address`. Absent breakpoints are a no-op.
    ///
    /// # Errors
    ///
    /// Returns the engine error if uninstalling fails. The entry is dropped
    /// from the table either way.
    pub fn clear(&mut self, address: u64) -> Result<(), EngineError> {
        match self.table.remove(&address) {
            Some(breakpoint) => self.release(breakpoint),
            None => Ok(()),
        }
    }

    /// Remove a breakpoint the caller already holds, skipping the address lookup.
    ///
    /// # Errors
    ///
    /// Same as [`clear`](Self::clear).
    pub fn clear_breakpoint(&mut self, breakpoint: Breakpoint) -> Result<(), EngineError> {
        if self.table.remove(&breakpoint.address).is_none() {
            return Ok(());
        }
        self.release(breakpoint)
    }

    /// Uninstall a breakpoint the caller already took out of the table.
    fn release(&self, breakpoint: Breakpoint) -> Result<(), EngineError> {
        let result = self.engine.uninstall_breakpoint(breakpoint.handle);
        match &result {
            Ok(()) => debug!(addr = format!("{:#x}", breakpoint.address), "breakpoint cleared"),
            Err(e) => warn!(
                addr = format!("{:#x}", breakpoint.address),
                error = %e,
                "engine refused to uninstall breakpoint"
            ),
        }
        result
    }

    #[must_use]
    pub fn lookup(&self, address: u64) -> Option<&Breakpoint> {
        self.table.get(&address)
    }

    /// Uninstall and forget every breakpoint.
    pub fn clear_all(&mut self) {
        let drained: Vec<Breakpoint> = self.table.drain().map(|(_, bp)| bp).collect();
        for breakpoint in drained {
            // Failures are already logged; teardown continues regardless.
            let _ = self.release(breakpoint);
        }
    }

    /// Forget every breakpoint but leave it installed in the engine.
    pub fn forget_all(&mut self) {
        self.table.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Installed addresses, in no particular order.
    #[must_use]
    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.table.keys().copied()
    }
}
