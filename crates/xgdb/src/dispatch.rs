//! Command dispatcher.
//!
//! Maps one decoded [`Command`] to a reply payload. Reads of guest state are
//! served only while the cache says the guest is stopped, and the cache lock
//! is held across the engine call so a resume cannot invalidate the thread
//! in between. Commands that resume the guest release the lock first, since
//! the engine reports `Continued`/`StepCompleted` synchronously.

use gdbstub::common::Signal;
use tracing::{debug, warn};
use xgdb_engine::{Engine, EngineError, ThreadId};

use crate::breakpoints::BreakpointManager;
use crate::cache::{Notification, SharedCache, StateCache, StopKind};
use crate::packet::{Command, MAX_PACKET_SIZE, hex_decode, hex_encode, parse_hex};
use crate::target::{self, REGISTERS, register_blob_size};

/// Largest memory read served in one `m` reply (hex doubles it).
pub const MAX_MEMORY_READ: usize = MAX_PACKET_SIZE / 2;

/// What the session should do with a dispatched command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// Send this payload as the reply.
    Reply(String),
    /// The guest was resumed; the reply is the next stop notification.
    Deferred,
    /// Reply `OK` and end the session.
    Detach,
    /// End the session without a reply.
    Kill,
}

/// `Exx` error replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// Guest is running; state reads are refused.
    Running = 0x01,
    InvalidThread = 0x02,
    /// Unmapped or otherwise invalid memory range.
    BadMemory = 0x03,
    /// Engine refused the operation.
    Engine = 0x04,
    Malformed = 0x05,
}

impl ErrorCode {
    #[must_use]
    pub fn reply(self) -> String {
        format!("E{:02x}", self as u8)
    }
}

impl From<EngineError> for ErrorCode {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Unmapped { .. } => Self::BadMemory,
            EngineError::InvalidThread(_) => Self::InvalidThread,
            EngineError::NotPaused => Self::Running,
            _ => Self::Engine,
        }
    }
}

type Reply = Result<String, ErrorCode>;

/// Thread argument of `H`, `T` and `vCont`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ThreadSelector {
    All,
    Any,
    Id(ThreadId),
}

fn parse_thread(text: &str) -> Option<ThreadSelector> {
    match text {
        "-1" => Some(ThreadSelector::All),
        "0" => Some(ThreadSelector::Any),
        _ => {
            let id = u32::try_from(parse_hex(text)?).ok()?;
            Some(ThreadSelector::Id(ThreadId(id)))
        }
    }
}

/// `addr,len` argument pair.
fn parse_range(text: &str) -> Result<(u64, usize), ErrorCode> {
    let (addr, len) = text.split_once(',').ok_or(ErrorCode::Malformed)?;
    let addr = parse_hex(addr).ok_or(ErrorCode::Malformed)?;
    let len = parse_hex(len)
        .and_then(|len| usize::try_from(len).ok())
        .ok_or(ErrorCode::Malformed)?;
    Ok((addr, len))
}

/// The thread register and memory commands address.
fn stopped_thread(state: &StateCache) -> Result<ThreadId, ErrorCode> {
    if !state.is_stopped() {
        return Err(ErrorCode::Running);
    }
    state
        .current_thread_info()
        .map(|t| t.id)
        .ok_or(ErrorCode::InvalidThread)
}

/// Render a stop reply for `notification`.
#[must_use]
pub fn stop_reply(notification: &Notification, current: Option<ThreadId>) -> String {
    let signal = match notification.kind {
        StopKind::Exited => return "W00".to_owned(),
        StopKind::Interrupted => Signal::SIGINT,
        StopKind::Paused | StopKind::Step | StopKind::Breakpoint => Signal::SIGTRAP,
    };
    match notification.thread.or(current) {
        Some(thread) => format!("T{:02x}thread:{:x};", signal.0, thread.0),
        None => format!("S{:02x}", signal.0),
    }
}

/// Verb table bound to one session's cache and breakpoints.
pub struct Dispatcher<'a> {
    engine: &'a dyn Engine,
    cache: &'a SharedCache,
    breakpoints: &'a mut BreakpointManager,
}

impl<'a> Dispatcher<'a> {
    #[must_use]
    pub fn new(
        engine: &'a dyn Engine,
        cache: &'a SharedCache,
        breakpoints: &'a mut BreakpointManager,
    ) -> Self {
        Self {
            engine,
            cache,
            breakpoints,
        }
    }

    pub fn dispatch(&mut self, command: &Command) -> Response {
        let data = command.data.as_str();
        let reply = match command.verb.as_str() {
            "?" => Ok(self.stop_status()),
            "g" => self.read_registers(),
            "G" => self.write_registers(data),
            "p" => self.read_register(data),
            "P" => self.write_register(data),
            "m" => self.read_memory(data),
            "M" => self.write_memory(data),
            "Z" => self.insert_breakpoint(data),
            "z" => self.remove_breakpoint(data),
            "H" => self.select_thread(data),
            "T" => self.thread_alive(data),
            "c" => return self.resume(data),
            "s" => return self.step(data, None),
            "D" => return Response::Detach,
            "k" | "vKill" => return Response::Kill,
            "vCont" => return self.vcont(data),
            verb if verb.starts_with('q') => self.query(verb, data),
            _ => Ok(String::new()),
        };
        Response::Reply(reply.unwrap_or_else(ErrorCode::reply))
    }

    /// Handle the out-of-band interrupt byte.
    ///
    /// Returns `true` if a pause was requested and its stop reply is now owed.
    /// A guest that is already halted has either answered its resume or has a
    /// stop reply queued, so the byte is dropped to keep replies paired with
    /// requests.
    pub fn interrupt(&mut self) -> bool {
        {
            let mut state = self.cache.lock();
            if state.is_terminated() || state.is_stopped() {
                debug!("guest already halted, ignoring interrupt");
                return false;
            }
            state.request_interrupt();
        }
        if let Err(e) = self.engine.pause() {
            warn!(error = %e, "engine refused to pause");
            self.cache.lock().take_interrupt();
            return false;
        }
        true
    }

    fn stop_status(&self) -> String {
        let state = self.cache.lock();
        if state.is_terminated() {
            return "W00".to_owned();
        }
        let thread = state.last_breakpoint_thread.or(state.current_thread);
        stop_reply(
            &Notification {
                kind: StopKind::Breakpoint,
                thread,
                address: None,
            },
            None,
        )
    }

    // ------------------------------------------------------------------------
    // Registers
    // ------------------------------------------------------------------------

    fn read_registers(&self) -> Reply {
        let state = self.cache.lock();
        let thread = stopped_thread(&state)?;
        let mut out = String::with_capacity(register_blob_size() * 2);
        for desc in &REGISTERS {
            let value = self.engine.read_register(thread, desc.register)?;
            desc.encode(value, &mut out);
        }
        Ok(out)
    }

    fn write_registers(&self, data: &str) -> Reply {
        if data.len() != register_blob_size() * 2 || !data.is_ascii() {
            return Err(ErrorCode::Malformed);
        }
        let mut offset = 0;
        let mut values = Vec::with_capacity(REGISTERS.len());
        for desc in &REGISTERS {
            let width = desc.bytes() * 2;
            let value = desc
                .decode(&data[offset..offset + width])
                .ok_or(ErrorCode::Malformed)?;
            values.push(value);
            offset += width;
        }
        let state = self.cache.lock();
        let thread = stopped_thread(&state)?;
        for (desc, value) in REGISTERS.iter().zip(values) {
            self.engine.write_register(thread, desc.register, value)?;
        }
        Ok("OK".to_owned())
    }

    fn read_register(&self, data: &str) -> Reply {
        let desc = parse_hex(data)
            .and_then(|n| REGISTERS.get(usize::try_from(n).ok()?))
            .ok_or(ErrorCode::Malformed)?;
        let state = self.cache.lock();
        let thread = stopped_thread(&state)?;
        let value = self.engine.read_register(thread, desc.register)?;
        let mut out = String::with_capacity(desc.bytes() * 2);
        desc.encode(value, &mut out);
        Ok(out)
    }

    fn write_register(&self, data: &str) -> Reply {
        let (regnum, value) = data.split_once('=').ok_or(ErrorCode::Malformed)?;
        let desc = parse_hex(regnum)
            .and_then(|n| REGISTERS.get(usize::try_from(n).ok()?))
            .ok_or(ErrorCode::Malformed)?;
        let value = desc.decode(value).ok_or(ErrorCode::Malformed)?;
        let state = self.cache.lock();
        let thread = stopped_thread(&state)?;
        self.engine.write_register(thread, desc.register, value)?;
        Ok("OK".to_owned())
    }

    // ------------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------------

    fn read_memory(&self, data: &str) -> Reply {
        let (addr, len) = parse_range(data)?;
        let len = len.min(MAX_MEMORY_READ);
        let state = self.cache.lock();
        if !state.is_stopped() {
            return Err(ErrorCode::Running);
        }
        let mut buf = vec![0u8; len];
        self.engine.read_memory(addr, &mut buf).map_err(|e| {
            debug!(addr = format!("{:#x}", addr), len, error = %e, "memory read refused");
            ErrorCode::BadMemory
        })?;
        Ok(hex_encode(&buf))
    }

    fn write_memory(&self, data: &str) -> Reply {
        let (range, bytes) = data.split_once(':').ok_or(ErrorCode::Malformed)?;
        let (addr, len) = parse_range(range)?;
        let bytes = hex_decode(bytes).ok_or(ErrorCode::Malformed)?;
        if bytes.len() != len {
            return Err(ErrorCode::Malformed);
        }
        let state = self.cache.lock();
        if !state.is_stopped() {
            return Err(ErrorCode::Running);
        }
        self.engine
            .write_memory(addr, &bytes)
            .map_err(|_| ErrorCode::BadMemory)?;
        Ok("OK".to_owned())
    }

    // ------------------------------------------------------------------------
    // Breakpoints
    // ------------------------------------------------------------------------

    /// Parse `type,addr,kind`. Returns `None` for unsupported types.
    fn breakpoint_address(data: &str) -> Result<Option<u64>, ErrorCode> {
        let mut fields = data.split(',');
        let kind = fields.next().ok_or(ErrorCode::Malformed)?;
        let addr = fields
            .next()
            .and_then(parse_hex)
            .ok_or(ErrorCode::Malformed)?;
        match kind {
            // Hardware breakpoints are serviced by the same code traps.
            "0" | "1" => Ok(Some(addr)),
            _ => Ok(None),
        }
    }

    fn insert_breakpoint(&mut self, data: &str) -> Reply {
        let Some(addr) = Self::breakpoint_address(data)? else {
            return Ok(String::new());
        };
        self.breakpoints.set(addr).map_err(|e| {
            warn!(addr = format!("{:#x}", addr), error = %e, "breakpoint rejected");
            ErrorCode::Engine
        })?;
        Ok("OK".to_owned())
    }

    fn remove_breakpoint(&mut self, data: &str) -> Reply {
        let Some(addr) = Self::breakpoint_address(data)? else {
            return Ok(String::new());
        };
        self.breakpoints
            .clear(addr)
            .map_err(|_| ErrorCode::Engine)?;
        Ok("OK".to_owned())
    }

    // ------------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------------

    fn select_thread(&self, data: &str) -> Reply {
        let (op, thread) = data.split_at_checked(1).ok_or(ErrorCode::Malformed)?;
        if op != "g" && op != "c" {
            return Ok(String::new());
        }
        let selector = parse_thread(thread).ok_or(ErrorCode::Malformed)?;
        let mut state = self.cache.lock();
        match selector {
            ThreadSelector::All => {}
            ThreadSelector::Any => {
                let first = state.threads().and_then(<[_]>::first).map(|t| t.id);
                if first.is_some() {
                    state.current_thread = first;
                }
            }
            ThreadSelector::Id(id) => {
                if state.is_stopped() && state.thread_info_for(id).is_none() {
                    return Err(ErrorCode::InvalidThread);
                }
                state.current_thread = Some(id);
            }
        }
        Ok("OK".to_owned())
    }

    fn thread_alive(&self, data: &str) -> Reply {
        let Some(ThreadSelector::Id(id)) = parse_thread(data) else {
            return Err(ErrorCode::Malformed);
        };
        let state = self.cache.lock();
        if !state.is_stopped() {
            return Err(ErrorCode::Running);
        }
        state
            .thread_info_for(id)
            .map(|_| "OK".to_owned())
            .ok_or(ErrorCode::InvalidThread)
    }

    // ------------------------------------------------------------------------
    // Execution control
    // ------------------------------------------------------------------------

    /// Point the current thread at `addr` before resuming (`c addr`, `s addr`).
    fn set_resume_address(&self, state: &StateCache, data: &str) -> Result<(), ErrorCode> {
        if data.is_empty() {
            return Ok(());
        }
        let addr = parse_hex(data).ok_or(ErrorCode::Malformed)?;
        let thread = stopped_thread(state)?;
        self.engine
            .write_register(thread, REGISTERS[target::PC_REGNUM].register, addr)?;
        Ok(())
    }

    fn resume(&self, data: &str) -> Response {
        {
            let state = self.cache.lock();
            if state.is_terminated() {
                return Response::Reply(ErrorCode::Engine.reply());
            }
            if let Err(code) = self.set_resume_address(&state, data) {
                return Response::Reply(code.reply());
            }
        }
        match self.engine.resume() {
            Ok(()) => Response::Deferred,
            Err(e) => {
                warn!(error = %e, "engine refused to resume");
                Response::Reply(ErrorCode::from(e).reply())
            }
        }
    }

    fn step(&self, data: &str, thread: Option<ThreadId>) -> Response {
        let thread = {
            let mut state = self.cache.lock();
            if !state.is_stopped() {
                return Response::Reply(ErrorCode::Running.reply());
            }
            let Some(thread) = thread.or(state.current_thread) else {
                return Response::Reply(ErrorCode::InvalidThread.reply());
            };
            if state.thread_info_for(thread).is_none() {
                return Response::Reply(ErrorCode::InvalidThread.reply());
            }
            state.current_thread = Some(thread);
            if let Err(code) = self.set_resume_address(&state, data) {
                return Response::Reply(code.reply());
            }
            thread
        };
        match self.engine.step(thread) {
            Ok(()) => Response::Deferred,
            Err(e) => {
                warn!(thread = %thread, error = %e, "engine refused to step");
                Response::Reply(ErrorCode::from(e).reply())
            }
        }
    }

    /// `vCont?` and `vCont;action[:tid]...`. Only the first action is honored.
    fn vcont(&self, data: &str) -> Response {
        if data == "?" {
            return Response::Reply("vCont;c;C;s;S".to_owned());
        }
        let Some(actions) = data.strip_prefix(';') else {
            return Response::Reply(String::new());
        };
        let action = actions.split(';').next().unwrap_or_default();
        let (verb, thread) = match action.split_once(':') {
            Some((verb, thread)) => match parse_thread(thread) {
                Some(ThreadSelector::Id(id)) => (verb, Some(id)),
                Some(_) => (verb, None),
                None => return Response::Reply(ErrorCode::Malformed.reply()),
            },
            None => (action, None),
        };
        match verb.chars().next() {
            Some('c' | 'C') => self.resume(""),
            Some('s' | 'S') => self.step("", thread),
            _ => Response::Reply(ErrorCode::Malformed.reply()),
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    fn query(&self, verb: &str, data: &str) -> Reply {
        match verb {
            "qSupported" => Ok(format!(
                "PacketSize={MAX_PACKET_SIZE:x};qXfer:features:read+;qXfer:libraries:read+;vContSupported+"
            )),
            "qAttached" => Ok("1".to_owned()),
            "qSymbol" => Ok("OK".to_owned()),
            "qC" => Ok(self
                .cache
                .lock()
                .current_thread
                .map(|t| format!("QC{:x}", t.0))
                .unwrap_or_default()),
            "qfThreadInfo" => self.thread_list(),
            "qsThreadInfo" => Ok("l".to_owned()),
            "qThreadExtraInfo" => self.thread_extra_info(data),
            "qXfer" => self.xfer(data),
            _ => Ok(String::new()),
        }
    }

    fn thread_list(&self) -> Reply {
        let state = self.cache.lock();
        let threads = state.threads().ok_or(ErrorCode::Running)?;
        if threads.is_empty() {
            return Ok("l".to_owned());
        }
        let ids: Vec<String> = threads.iter().map(|t| format!("{:x}", t.id.0)).collect();
        Ok(format!("m{}", ids.join(",")))
    }

    fn thread_extra_info(&self, data: &str) -> Reply {
        let thread = data.strip_prefix(',').ok_or(ErrorCode::Malformed)?;
        let Some(ThreadSelector::Id(id)) = parse_thread(thread) else {
            return Err(ErrorCode::Malformed);
        };
        let state = self.cache.lock();
        if !state.is_stopped() {
            return Err(ErrorCode::Running);
        }
        let info = state.thread_info_for(id).ok_or(ErrorCode::InvalidThread)?;
        let text = format!("{} ({}, pc {:#010x})", info.name, info.state.as_str(), info.pc);
        Ok(hex_encode(text.as_bytes()))
    }

    /// `qXfer:<object>:read:<annex>:<offset>,<length>`.
    fn xfer(&self, data: &str) -> Reply {
        let fields: Vec<&str> = data.split(':').collect();
        let [_, object, "read", annex, range] = fields.as_slice() else {
            return Ok(String::new());
        };
        let (offset, length) = parse_range(range)?;
        let offset = usize::try_from(offset).map_err(|_| ErrorCode::Malformed)?;
        if length == 0 {
            return Err(ErrorCode::Malformed);
        }
        match (*object, *annex) {
            ("features", "target.xml") => Ok(target::xfer_page(target::target_xml(), offset, length)),
            ("libraries", "") => {
                let document = target::library_list_xml(self.cache.lock().modules());
                Ok(target::xfer_page(&document, offset, length))
            }
            ("features" | "libraries", _) => Err(ErrorCode::Malformed),
            _ => Ok(String::new()),
        }
    }
}
