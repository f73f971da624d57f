//! Translates engine execution events into cache updates and stop
//! notifications.
//!
//! Callbacks arrive on whichever host thread caused the event. Each one takes
//! the cache lock, queries the engine for fresh threads and modules, posts at
//! most one notification and wakes the listener after unlocking. Nothing here
//! touches the socket.

use std::sync::{Arc, Weak};

use tracing::{debug, info};
use xgdb_engine::{DebugListener, Engine, EngineEvent, ThreadId};

use crate::cache::{Notification, SharedCache, StopKind};

/// Engine listener owned by one debug session.
pub struct ExecutionBridge {
    cache: Arc<SharedCache>,
    // The engine holds this listener; a strong reference would form a cycle.
    engine: Weak<dyn Engine>,
}

impl ExecutionBridge {
    #[must_use]
    pub fn new(cache: Arc<SharedCache>, engine: &Arc<dyn Engine>) -> Self {
        Self {
            cache,
            engine: Arc::downgrade(engine),
        }
    }

    fn stopped(&self, kind: StopKind, thread: Option<ThreadId>, address: Option<u64>) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        {
            let mut state = self.cache.lock();
            state.refresh(engine.as_ref());
            state.mark_stopped();
            let kind = if kind == StopKind::Paused && state.take_interrupt() {
                StopKind::Interrupted
            } else {
                // Pause requests satisfied by a step or breakpoint are spent.
                state.take_interrupt();
                kind
            };
            if let Some(thread) = thread {
                state.current_thread = Some(thread);
                if kind == StopKind::Breakpoint {
                    state.last_breakpoint_thread = Some(thread);
                }
            }
            state.post(Notification {
                kind,
                thread,
                address,
            });
        }
        self.cache.notify();
    }
}

impl DebugListener for ExecutionBridge {
    fn on_event(&self, event: EngineEvent) {
        debug!(?event, "engine event");
        match event {
            EngineEvent::FocusGained => {}
            EngineEvent::Paused => self.stopped(StopKind::Paused, None, None),
            EngineEvent::StepCompleted { thread } => {
                self.stopped(StopKind::Step, Some(thread), None);
            }
            EngineEvent::BreakpointHit {
                address, thread, ..
            } => self.stopped(StopKind::Breakpoint, Some(thread), Some(address)),
            EngineEvent::Continued => {
                let mut state = self.cache.lock();
                // A stop can overtake the `Continued` that preceded it.
                if !self.engine.upgrade().is_some_and(|engine| engine.is_paused()) {
                    state.mark_running();
                }
            }
            EngineEvent::Ended => {
                info!("guest execution ended");
                {
                    let mut state = self.cache.lock();
                    state.mark_terminated();
                    state.post(Notification::new(StopKind::Exited));
                }
                self.cache.notify();
            }
            EngineEvent::FocusLost => {
                self.cache.lock().mark_detached();
                self.cache.notify();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xgdb_engine::SimEngine;

    const BASE: u64 = 0x8200_0000;

    fn setup() -> (Arc<SimEngine>, Arc<SharedCache>) {
        let sim = Arc::new(
            SimEngine::builder()
                .region(BASE, 0x1000)
                .thread("main", BASE)
                .thread("worker", BASE + 0x100)
                .build(),
        );
        let cache = Arc::new(SharedCache::new());
        let engine: Arc<dyn Engine> = sim.clone();
        sim.attach(Arc::new(ExecutionBridge::new(cache.clone(), &engine)));
        (sim, cache)
    }

    #[test]
    fn test_breakpoint_hit_posts_stop() {
        let (sim, cache) = setup();
        sim.install_breakpoint(BASE + 0x108).unwrap();
        sim.resume().unwrap();
        assert!(!cache.lock().is_stopped());
        sim.run_for(10);

        let mut state = cache.lock();
        assert!(state.is_stopped());
        assert_eq!(state.current_thread, Some(ThreadId(2)));
        assert_eq!(state.last_breakpoint_thread, Some(ThreadId(2)));
        assert_eq!(
            state.take_pending(),
            Some(Notification {
                kind: StopKind::Breakpoint,
                thread: Some(ThreadId(2)),
                address: Some(BASE + 0x108),
            })
        );
    }

    #[test]
    fn test_step_after_breakpoint_coalesces() {
        let (sim, cache) = setup();
        sim.install_breakpoint(BASE + 4).unwrap();
        sim.resume().unwrap();
        sim.run_for(10);
        sim.step(ThreadId(1)).unwrap();

        let mut state = cache.lock();
        assert_eq!(state.coalesced(), 1);
        let delivered = state.take_pending().unwrap();
        assert_eq!(delivered.kind, StopKind::Step);
        assert_eq!(delivered.thread, Some(ThreadId(1)));
        assert!(state.take_pending().is_none());
    }

    #[test]
    fn test_interrupt_flag_marks_pause() {
        let (sim, cache) = setup();
        sim.resume().unwrap();
        cache.lock().request_interrupt();
        sim.pause().unwrap();

        let mut state = cache.lock();
        assert_eq!(state.take_pending().map(|n| n.kind), Some(StopKind::Interrupted));
        assert!(!state.take_interrupt());
        assert_eq!(state.current_thread, Some(ThreadId(1)));
    }

    #[test]
    fn test_plain_pause_and_resume() {
        let (sim, cache) = setup();
        sim.resume().unwrap();
        sim.pause().unwrap();
        assert_eq!(
            cache.lock().take_pending().map(|n| n.kind),
            Some(StopKind::Paused)
        );
        sim.resume().unwrap();
        let state = cache.lock();
        assert!(!state.is_stopped());
        assert!(state.threads().is_none());
    }

    #[test]
    fn test_late_continue_keeps_stop() {
        let (sim, cache) = setup();
        let engine: Arc<dyn Engine> = sim.clone();
        let bridge = ExecutionBridge::new(cache.clone(), &engine);
        sim.install_breakpoint(BASE + 0x108).unwrap();
        sim.resume().unwrap();
        sim.run_for(10);
        assert!(sim.is_paused());

        // Resume's notification delivered after the breakpoint stop.
        bridge.on_event(EngineEvent::Continued);
        let state = cache.lock();
        assert!(state.is_stopped());
        assert!(state.threads().is_some());
    }

    #[test]
    fn test_end_and_focus_loss() {
        let (sim, cache) = setup();
        sim.terminate();
        {
            let mut state = cache.lock();
            assert!(state.is_terminated());
            assert_eq!(state.take_pending().map(|n| n.kind), Some(StopKind::Exited));
        }
        sim.detach();
        assert!(cache.lock().is_detached());
    }
}
