//! Deterministic in-memory engine.
//!
//! Every live thread retires one 4-byte instruction per [`SimEngine::tick`].
//! A thread whose new PC lands on an installed breakpoint pauses the whole
//! guest and reports `BreakpointHit`. Memory is a list of flat mapped regions.

use std::ops::Range;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::{
    BreakpointHandle, DebugListener, Engine, EngineError, EngineEvent, Module, NUM_FPRS, NUM_GPRS,
    Register, Result, ThreadId, ThreadInfo, ThreadState,
};

/// Size of one guest instruction.
const INSN_SIZE: u64 = 4;

/// Initial MSR: 64-bit mode, FP available.
const INITIAL_MSR: u64 = 0x8000_0000_0000_2000;

struct SimThread {
    id: ThreadId,
    name: String,
    state: ThreadState,
    gpr: [u64; NUM_GPRS],
    fpr: [u64; NUM_FPRS],
    pc: u64,
    msr: u64,
    cr: u64,
    lr: u64,
    ctr: u64,
    xer: u64,
    fpscr: u64,
}

impl SimThread {
    fn new(id: ThreadId, name: String, entry: u64, state: ThreadState) -> Self {
        Self {
            id,
            name,
            state,
            gpr: [0; NUM_GPRS],
            fpr: [0; NUM_FPRS],
            pc: entry,
            msr: INITIAL_MSR,
            cr: 0,
            lr: 0,
            ctr: 0,
            xer: 0,
            fpscr: 0,
        }
    }

    fn get(&self, reg: Register) -> Option<u64> {
        let value = match reg {
            Register::Gpr(n) => *self.gpr.get(n as usize)?,
            Register::Fpr(n) => *self.fpr.get(n as usize)?,
            Register::Pc => self.pc,
            Register::Msr => self.msr,
            Register::Cr => self.cr,
            Register::Lr => self.lr,
            Register::Ctr => self.ctr,
            Register::Xer => self.xer,
            Register::Fpscr => self.fpscr,
        };
        Some(value)
    }

    fn set(&mut self, reg: Register, value: u64) -> bool {
        let slot = match reg {
            Register::Gpr(n) => match self.gpr.get_mut(n as usize) {
                Some(slot) => slot,
                None => return false,
            },
            Register::Fpr(n) => match self.fpr.get_mut(n as usize) {
                Some(slot) => slot,
                None => return false,
            },
            Register::Pc => &mut self.pc,
            Register::Msr => &mut self.msr,
            Register::Lr => &mut self.lr,
            Register::Ctr => &mut self.ctr,
            Register::Cr => &mut self.cr,
            Register::Xer => &mut self.xer,
            Register::Fpscr => &mut self.fpscr,
        };
        *slot = match reg {
            Register::Cr | Register::Xer | Register::Fpscr => value & 0xffff_ffff,
            _ => value,
        };
        true
    }

    fn info(&self) -> ThreadInfo {
        ThreadInfo {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            pc: self.pc,
        }
    }
}

struct Region {
    base: u64,
    data: Vec<u8>,
}

impl Region {
    fn span(&self, addr: u64, len: usize) -> Option<Range<usize>> {
        let start = usize::try_from(addr.checked_sub(self.base)?).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.data.len()).then_some(start..end)
    }
}

struct SimState {
    threads: Vec<SimThread>,
    modules: Vec<Arc<Module>>,
    regions: Vec<Region>,
    traps: FxHashMap<BreakpointHandle, u64>,
    next_handle: u64,
    installs: u64,
    paused: bool,
    ended: bool,
}

impl SimState {
    fn locate(&self, addr: u64, len: usize) -> Result<(usize, Range<usize>)> {
        self.regions
            .iter()
            .enumerate()
            .find_map(|(i, region)| region.span(addr, len).map(|span| (i, span)))
            .ok_or(EngineError::Unmapped { addr, len })
    }

    fn thread(&self, id: ThreadId) -> Result<&SimThread> {
        self.threads
            .iter()
            .find(|t| t.id == id)
            .ok_or(EngineError::InvalidThread(id))
    }

    fn thread_mut(&mut self, id: ThreadId) -> Result<&mut SimThread> {
        self.threads
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(EngineError::InvalidThread(id))
    }

    fn trap_at(&self, addr: u64) -> Option<BreakpointHandle> {
        self.traps
            .iter()
            .find_map(|(&handle, &trap)| (trap == addr).then_some(handle))
    }

    fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        let state = if paused {
            ThreadState::Suspended
        } else {
            ThreadState::Running
        };
        for thread in &mut self.threads {
            thread.state = state;
        }
    }
}

/// Builder for [`SimEngine`].
#[derive(Default)]
pub struct SimEngineBuilder {
    threads: Vec<(String, u64)>,
    regions: Vec<(u64, usize)>,
    modules: Vec<Module>,
    running: bool,
}

impl SimEngineBuilder {
    /// Add a guest thread starting at `entry`. Ids are assigned from 1 upward.
    #[must_use]
    pub fn thread(mut self, name: impl Into<String>, entry: u64) -> Self {
        self.threads.push((name.into(), entry));
        self
    }

    /// Map a zero-filled region of guest memory.
    #[must_use]
    pub fn region(mut self, base: u64, size: usize) -> Self {
        self.regions.push((base, size));
        self
    }

    #[must_use]
    pub fn module(mut self, name: impl Into<String>, base: u64, size: u64) -> Self {
        self.modules.push(Module {
            name: name.into(),
            base,
            size,
        });
        self
    }

    /// Start with the guest running instead of paused.
    #[must_use]
    pub const fn running(mut self, running: bool) -> Self {
        self.running = running;
        self
    }

    #[must_use]
    pub fn build(self) -> SimEngine {
        let initial = if self.running {
            ThreadState::Running
        } else {
            ThreadState::Suspended
        };
        let threads = self
            .threads
            .into_iter()
            .zip(1u32..)
            .map(|((name, entry), id)| SimThread::new(ThreadId(id), name, entry, initial))
            .collect();
        let regions = self
            .regions
            .into_iter()
            .map(|(base, size)| Region {
                base,
                data: vec![0; size],
            })
            .collect();

        SimEngine {
            state: Mutex::new(SimState {
                threads,
                modules: self.modules.into_iter().map(Arc::new).collect(),
                regions,
                traps: FxHashMap::default(),
                next_handle: 1,
                installs: 0,
                paused: !self.running,
                ended: false,
            }),
            listener: Mutex::new(None),
        }
    }
}

/// In-memory reference engine.
pub struct SimEngine {
    state: Mutex<SimState>,
    listener: Mutex<Option<Arc<dyn DebugListener>>>,
}

impl SimEngine {
    #[must_use]
    pub fn builder() -> SimEngineBuilder {
        SimEngineBuilder::default()
    }

    fn emit(&self, event: EngineEvent) {
        // Clone out so the callback runs without any engine lock held.
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            trace!(?event, "delivering engine event");
            listener.on_event(event);
        }
    }

    /// Retire one instruction on every thread.
    ///
    /// Returns `false` if the guest is paused or has ended.
    pub fn tick(&self) -> bool {
        let hit = {
            let mut state = self.state.lock();
            if state.paused || state.ended {
                return false;
            }
            let mut hit = None;
            for i in 0..state.threads.len() {
                let pc = {
                    let thread = &mut state.threads[i];
                    thread.pc = thread.pc.wrapping_add(INSN_SIZE);
                    thread.pc
                };
                if let Some(breakpoint) = state.trap_at(pc) {
                    hit = Some(EngineEvent::BreakpointHit {
                        breakpoint,
                        address: pc,
                        thread: state.threads[i].id,
                    });
                    break;
                }
            }
            if hit.is_some() {
                state.set_paused(true);
            }
            hit
        };

        if let Some(event) = hit {
            self.emit(event);
        }
        true
    }

    /// Tick until paused or `max_ticks` elapse. Returns the ticks executed.
    pub fn run_for(&self, max_ticks: usize) -> usize {
        let mut ticks = 0;
        while ticks < max_ticks && self.tick() {
            ticks += 1;
        }
        ticks
    }

    /// Run the guest on a background thread until it ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the host thread cannot be spawned.
    pub fn spawn_runner(self: &Arc<Self>, period: Duration) -> std::io::Result<JoinHandle<()>> {
        let sim = Arc::clone(self);
        thread::Builder::new()
            .name("sim-guest".into())
            .spawn(move || {
                while !sim.is_ended() {
                    sim.tick();
                    thread::sleep(period);
                }
            })
    }

    /// Terminate the guest program.
    pub fn terminate(&self) {
        {
            let mut state = self.state.lock();
            if state.ended {
                return;
            }
            state.set_paused(false);
            state.ended = true;
        }
        self.emit(EngineEvent::Ended);
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.state.lock().ended
    }

    #[must_use]
    pub fn has_listener(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Number of breakpoints currently installed.
    #[must_use]
    pub fn installed_breakpoints(&self) -> usize {
        self.state.lock().traps.len()
    }

    /// Number of successful installations since creation.
    #[must_use]
    pub fn install_count(&self) -> u64 {
        self.state.lock().installs
    }
}

impl Engine for SimEngine {
    fn attach(&self, listener: Arc<dyn DebugListener>) {
        *self.listener.lock() = Some(listener);
        self.emit(EngineEvent::FocusGained);
    }

    fn detach(&self) {
        let previous = self.listener.lock().take();
        if let Some(listener) = previous {
            listener.on_event(EngineEvent::FocusLost);
        }
    }

    fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    fn pause(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.ended {
                return Err(EngineError::Ended);
            }
            if state.paused {
                return Ok(());
            }
            state.set_paused(true);
        }
        self.emit(EngineEvent::Paused);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.ended {
                return Err(EngineError::Ended);
            }
            if !state.paused {
                return Ok(());
            }
            state.set_paused(false);
        }
        self.emit(EngineEvent::Continued);
        Ok(())
    }

    fn step(&self, thread: ThreadId) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.ended {
                return Err(EngineError::Ended);
            }
            if !state.paused {
                return Err(EngineError::NotPaused);
            }
            state.thread(thread)?;
            state.set_paused(false);
        }
        self.emit(EngineEvent::Continued);

        {
            let mut state = self.state.lock();
            let stepped = state.thread_mut(thread)?;
            stepped.pc = stepped.pc.wrapping_add(INSN_SIZE);
            state.set_paused(true);
        }
        self.emit(EngineEvent::StepCompleted { thread });
        Ok(())
    }

    fn threads(&self) -> Vec<ThreadInfo> {
        self.state.lock().threads.iter().map(SimThread::info).collect()
    }

    fn modules(&self) -> Vec<Arc<Module>> {
        self.state.lock().modules.clone()
    }

    fn read_register(&self, thread: ThreadId, reg: Register) -> Result<u64> {
        if !reg.is_valid() {
            return Err(EngineError::InvalidRegister(reg));
        }
        let state = self.state.lock();
        if !state.paused {
            return Err(EngineError::NotPaused);
        }
        state
            .thread(thread)?
            .get(reg)
            .ok_or(EngineError::InvalidRegister(reg))
    }

    fn write_register(&self, thread: ThreadId, reg: Register, value: u64) -> Result<()> {
        if !reg.is_valid() {
            return Err(EngineError::InvalidRegister(reg));
        }
        let mut state = self.state.lock();
        if !state.paused {
            return Err(EngineError::NotPaused);
        }
        if state.thread_mut(thread)?.set(reg, value) {
            Ok(())
        } else {
            Err(EngineError::InvalidRegister(reg))
        }
    }

    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        let (region, span) = state.locate(addr, buf.len())?;
        buf.copy_from_slice(&state.regions[region].data[span]);
        Ok(())
    }

    fn write_memory(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let (region, span) = state.locate(addr, data.len())?;
        state.regions[region].data[span].copy_from_slice(data);
        Ok(())
    }

    fn install_breakpoint(&self, addr: u64) -> Result<BreakpointHandle> {
        let mut state = self.state.lock();
        if addr % INSN_SIZE != 0 || state.locate(addr, INSN_SIZE as usize).is_err() {
            return Err(EngineError::InvalidAddress(addr));
        }
        let handle = BreakpointHandle(state.next_handle);
        state.next_handle += 1;
        state.installs += 1;
        state.traps.insert(handle, addr);
        Ok(handle)
    }

    fn uninstall_breakpoint(&self, handle: BreakpointHandle) -> Result<()> {
        self.state
            .lock()
            .traps
            .remove(&handle)
            .map(|_| ())
            .ok_or(EngineError::UnknownBreakpoint(handle))
    }
}
