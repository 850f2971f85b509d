//! GC Controller - Collection State Machine
//!
//! One background thread owns the collection cycle. Requests arrive over a
//! channel and run strictly one after another:
//!
//! ```text
//!        request / occupancy > trigger
//! Idle ─────────────────────────────▶ InitialMark (pause)
//!  ▲                                      │
//!  │                                      ▼
//! ConcurrentSweep ◀─ ConcurrentRelocate ◀─ Remark (pause) ◀─ ConcurrentMark
//! ```
//!
//! Every submitted request gets a ticket; blocking callers wait on a
//! condition variable until the ticket completes. Threshold-triggered
//! requests are coalesced: at most one is queued at a time.
//!
//! A fatal error halts the controller. Later requests complete immediately
//! with the stored error.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::allocator::GcGeneration;
use crate::error::{FgcError, Result};

/// Transitions kept for `phase_history`
pub const PHASE_HISTORY_CAPACITY: usize = 64;

/// Failed tickets remembered for their waiters
const FAILURE_HISTORY: usize = 16;

/// Controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GcPhase {
    Idle,
    InitialMark,
    ConcurrentMark,
    Remark,
    ConcurrentRelocate,
    ConcurrentSweep,
}

impl GcPhase {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> GcPhase {
        match value {
            1 => GcPhase::InitialMark,
            2 => GcPhase::ConcurrentMark,
            3 => GcPhase::Remark,
            4 => GcPhase::ConcurrentRelocate,
            5 => GcPhase::ConcurrentSweep,
            _ => GcPhase::Idle,
        }
    }

    /// Phase that legally follows this one
    pub fn next(self) -> GcPhase {
        match self {
            GcPhase::Idle => GcPhase::InitialMark,
            GcPhase::InitialMark => GcPhase::ConcurrentMark,
            GcPhase::ConcurrentMark => GcPhase::Remark,
            GcPhase::Remark => GcPhase::ConcurrentRelocate,
            GcPhase::ConcurrentRelocate => GcPhase::ConcurrentSweep,
            GcPhase::ConcurrentSweep => GcPhase::Idle,
        }
    }

    /// Whether mutators are stopped during this phase
    pub fn is_pause(self) -> bool {
        matches!(self, GcPhase::InitialMark | GcPhase::Remark)
    }
}

impl fmt::Display for GcPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a cycle was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GcReason {
    Explicit,
    HeapThreshold,
    AllocationFailure,
    /// Last attempt before reporting out of memory
    Aggressive,
    Shutdown,
}

impl fmt::Display for GcReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GcReason::Explicit => "explicit",
            GcReason::HeapThreshold => "heap threshold",
            GcReason::AllocationFailure => "allocation failure",
            GcReason::Aggressive => "aggressive",
            GcReason::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// One collection request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcRequest {
    pub generation: GcGeneration,
    pub reason: GcReason,
}

impl GcRequest {
    pub fn new(generation: GcGeneration, reason: GcReason) -> Self {
        Self { generation, reason }
    }

    pub fn is_aggressive(&self) -> bool {
        self.reason == GcReason::Aggressive
    }
}

/// A recorded phase change
#[derive(Debug, Clone, Serialize)]
pub struct PhaseTransition {
    pub cycle: u64,
    pub from: GcPhase,
    pub to: GcPhase,
    pub at: DateTime<Utc>,
}

/// Runs one complete cycle on the controller thread
pub trait CycleRunner: Send + Sync {
    fn run_cycle(&self, request: &GcRequest) -> Result<()>;
}

enum Command {
    Collect { ticket: u64, request: GcRequest },
    Shutdown,
}

#[derive(Default)]
struct Completion {
    completed: u64,
    failures: VecDeque<(u64, FgcError)>,
}

struct ControllerState {
    phase: AtomicU8,
    history: Mutex<VecDeque<PhaseTransition>>,

    /// Last issued ticket; held while sending so tickets match queue order
    issued: Mutex<u64>,
    stopped: AtomicBool,
    threshold_pending: AtomicBool,

    completion: Mutex<Completion>,
    completed_cond: Condvar,

    halted: Mutex<Option<FgcError>>,
}

impl ControllerState {
    fn halted(&self) -> Option<FgcError> {
        self.halted.lock().clone()
    }

    fn finish(&self, ticket: u64, result: Result<()>) {
        let mut completion = self.completion.lock();
        completion.completed = completion.completed.max(ticket);
        if let Err(err) = result {
            if completion.failures.len() == FAILURE_HISTORY {
                completion.failures.pop_front();
            }
            completion.failures.push_back((ticket, err));
        }
        self.completed_cond.notify_all();
    }

    fn finish_all(&self, err: FgcError) {
        let issued = *self.issued.lock();
        let mut completion = self.completion.lock();
        for ticket in completion.completed + 1..=issued {
            if completion.failures.len() == FAILURE_HISTORY {
                completion.failures.pop_front();
            }
            completion.failures.push_back((ticket, err.clone()));
        }
        completion.completed = completion.completed.max(issued);
        self.completed_cond.notify_all();
    }
}

/// Controller - background cycle thread and request bookkeeping
pub struct Controller {
    sender: Sender<Command>,
    receiver: Mutex<Option<Receiver<Command>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: Mutex<Option<ThreadId>>,
    state: Arc<ControllerState>,
}

impl Controller {
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            thread: Mutex::new(None),
            thread_id: Mutex::new(None),
            state: Arc::new(ControllerState {
                phase: AtomicU8::new(GcPhase::Idle.as_u8()),
                history: Mutex::new(VecDeque::with_capacity(PHASE_HISTORY_CAPACITY)),
                issued: Mutex::new(0),
                stopped: AtomicBool::new(false),
                threshold_pending: AtomicBool::new(false),
                completion: Mutex::new(Completion::default()),
                completed_cond: Condvar::new(),
                halted: Mutex::new(None),
            }),
        }
    }

    /// Spawn the controller thread
    ///
    /// The thread holds the runner weakly; once it is gone requests fail
    /// with `ShutDown`.
    pub fn start(&self, runner: Weak<dyn CycleRunner>) -> Result<()> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| FgcError::invalid_state("controller not started", "already started"))?;
        let state = Arc::clone(&self.state);

        let handle = std::thread::Builder::new()
            .name("fgc-controller".to_string())
            .spawn(move || controller_loop(state, receiver, runner))
            .map_err(|err| {
                FgcError::HeapInitialization(format!("cannot spawn controller thread: {}", err))
            })?;
        *self.thread_id.lock() = Some(handle.thread().id());
        *self.thread.lock() = Some(handle);
        log::debug!("GC controller started");
        Ok(())
    }

    pub fn phase(&self) -> GcPhase {
        GcPhase::from_u8(self.state.phase.load(Ordering::Acquire))
    }

    /// Move to `to`; only the successor of the current phase (or Idle) is
    /// accepted
    pub fn set_phase(&self, to: GcPhase, cycle: u64) -> Result<PhaseTransition> {
        let from = self.phase();
        if to != from.next() && to != GcPhase::Idle {
            return Err(FgcError::concurrent_modification(format!(
                "phase transition {} -> {}",
                from, to
            )));
        }
        self.state.phase.store(to.as_u8(), Ordering::Release);

        let transition = PhaseTransition {
            cycle,
            from,
            to,
            at: Utc::now(),
        };
        let mut history = self.state.history.lock();
        if history.len() == PHASE_HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(transition.clone());
        Ok(transition)
    }

    /// Oldest-first phase transitions
    pub fn phase_history(&self) -> Vec<PhaseTransition> {
        self.state.history.lock().iter().cloned().collect()
    }

    /// The fatal error that halted the controller, if any
    pub fn halted(&self) -> Option<FgcError> {
        self.state.halted()
    }

    pub(crate) fn halt(&self, err: FgcError) {
        let mut halted = self.state.halted.lock();
        if halted.is_none() {
            log::error!("GC controller halted: {}", err);
            *halted = Some(err);
        }
    }

    /// Whether the caller is the controller thread itself
    pub fn is_controller_thread(&self) -> bool {
        *self.thread_id.lock() == Some(std::thread::current().id())
    }

    /// Queue a request; returns its ticket
    pub fn submit(&self, request: GcRequest) -> Result<u64> {
        if let Some(err) = self.state.halted() {
            return Err(err);
        }
        let mut issued = self.state.issued.lock();
        if self.state.stopped.load(Ordering::Acquire) {
            return Err(FgcError::ShutDown);
        }
        let ticket = *issued + 1;
        self.sender
            .send(Command::Collect { ticket, request })
            .map_err(|_| FgcError::ShutDown)?;
        *issued = ticket;
        log::trace!("GC request #{} queued: {:?}", ticket, request);
        Ok(ticket)
    }

    /// Queue a threshold-triggered request unless one is already queued
    ///
    /// Returns false when the request was coalesced.
    pub fn request_background(&self, generation: GcGeneration) -> Result<bool> {
        if self.state.threshold_pending.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        match self.submit(GcRequest::new(generation, GcReason::HeapThreshold)) {
            Ok(_) => Ok(true),
            Err(err) => {
                self.state.threshold_pending.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Wait for `ticket` to complete and return its outcome
    pub fn wait(&self, ticket: u64) -> Result<()> {
        let mut completion = self.state.completion.lock();
        while completion.completed < ticket {
            self.state.completed_cond.wait(&mut completion);
        }
        match completion.failures.iter().find(|(t, _)| *t == ticket) {
            Some((_, err)) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Submit and wait
    pub fn collect(&self, request: GcRequest) -> Result<()> {
        if self.is_controller_thread() {
            return Err(FgcError::invalid_state(
                "mutator thread",
                "collection requested from the controller thread",
            ));
        }
        let ticket = self.submit(request)?;
        self.wait(ticket)
    }

    /// Wait until every request issued so far has completed
    ///
    /// Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let target = *self.state.issued.lock();
        let deadline = Instant::now() + timeout;
        let mut completion = self.state.completion.lock();
        while completion.completed < target {
            if self
                .state
                .completed_cond
                .wait_until(&mut completion, deadline)
                .timed_out()
            {
                return completion.completed >= target;
            }
        }
        true
    }

    pub fn completed_requests(&self) -> u64 {
        self.state.completion.lock().completed
    }

    /// Stop accepting requests, finish queued ones and join the thread
    pub fn shutdown(&self) {
        {
            let _issued = self.state.issued.lock();
            if self.state.stopped.swap(true, Ordering::AcqRel) {
                return;
            }
            let _ = self.sender.send(Command::Shutdown);
        }

        let handle = self.thread.lock().take();
        match handle {
            Some(handle) if !self.is_controller_thread() => {
                if handle.join().is_err() {
                    log::error!("GC controller thread panicked");
                }
            }
            _ => {}
        }
        self.state.finish_all(FgcError::ShutDown);
        log::debug!("GC controller stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::Acquire)
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

fn controller_loop(state: Arc<ControllerState>, receiver: Receiver<Command>, runner: Weak<dyn CycleRunner>) {
    while let Ok(command) = receiver.recv() {
        let (ticket, request) = match command {
            Command::Collect { ticket, request } => (ticket, request),
            Command::Shutdown => break,
        };

        let result = match (state.halted(), runner.upgrade()) {
            (Some(err), _) => Err(err),
            (None, None) => Err(FgcError::ShutDown),
            (None, Some(runner)) => runner.run_cycle(&request),
        };
        if request.reason == GcReason::HeapThreshold {
            state.threshold_pending.store(false, Ordering::Release);
        }

        if let Err(err) = &result {
            if err.is_fatal() {
                let mut halted = state.halted.lock();
                if halted.is_none() {
                    log::error!("GC controller halted: {}", err);
                    *halted = Some(err.clone());
                }
            } else {
                log::warn!("GC request #{} failed: {}", ticket, err);
            }
        }
        state.finish(ticket, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct CountingRunner {
        controller: Controller,
        runs: AtomicU64,
        fail_with: Mutex<Option<FgcError>>,
    }

    impl CycleRunner for CountingRunner {
        fn run_cycle(&self, _request: &GcRequest) -> Result<()> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            let mut phase = GcPhase::Idle;
            for _ in 0..6 {
                phase = phase.next();
                self.controller.set_phase(phase, n)?;
            }
            match self.fail_with.lock().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    fn runner() -> Arc<CountingRunner> {
        let runner = Arc::new(CountingRunner {
            controller: Controller::new(),
            runs: AtomicU64::new(0),
            fail_with: Mutex::new(None),
        });
        let as_runner: Arc<dyn CycleRunner> = runner.clone();
        runner.controller.start(Arc::downgrade(&as_runner)).unwrap();
        runner
    }

    #[test]
    fn test_blocking_collect_runs_full_state_machine() {
        let runner = runner();
        runner
            .controller
            .collect(GcRequest::new(GcGeneration::Full, GcReason::Explicit))
            .unwrap();
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        assert_eq!(runner.controller.phase(), GcPhase::Idle);

        let phases: Vec<GcPhase> = runner.controller.phase_history().iter().map(|t| t.to).collect();
        assert_eq!(
            phases,
            vec![
                GcPhase::InitialMark,
                GcPhase::ConcurrentMark,
                GcPhase::Remark,
                GcPhase::ConcurrentRelocate,
                GcPhase::ConcurrentSweep,
                GcPhase::Idle,
            ]
        );
        runner.controller.shutdown();
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let controller = Controller::new();
        let err = controller.set_phase(GcPhase::Remark, 1).unwrap_err();
        assert!(err.is_fatal());
        controller.set_phase(GcPhase::InitialMark, 1).unwrap();
        controller.set_phase(GcPhase::Idle, 1).unwrap();
    }

    #[test]
    fn test_fatal_error_halts() {
        let runner = runner();
        *runner.fail_with.lock() = Some(FgcError::concurrent_modification("test"));
        let err = runner
            .controller
            .collect(GcRequest::new(GcGeneration::Young, GcReason::Explicit))
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(runner.controller.halted().is_some());

        let again = runner
            .controller
            .collect(GcRequest::new(GcGeneration::Young, GcReason::Explicit));
        assert_eq!(again, Err(err));
        runner.controller.shutdown();
    }

    #[test]
    fn test_background_requests_coalesce_and_complete() {
        let runner = runner();
        let mut queued = 0;
        for _ in 0..10 {
            if runner.controller.request_background(GcGeneration::Young).unwrap() {
                queued += 1;
            }
        }
        assert!(queued >= 1);
        assert!(runner.controller.wait_idle(Duration::from_secs(10)));
        assert_eq!(runner.runs.load(Ordering::SeqCst), queued);
        runner.controller.shutdown();
    }

    #[test]
    fn test_requests_after_shutdown_fail() {
        let runner = runner();
        runner.controller.shutdown();
        assert!(runner.controller.is_stopped());
        assert_eq!(
            runner
                .controller
                .submit(GcRequest::new(GcGeneration::Full, GcReason::Explicit)),
            Err(FgcError::ShutDown)
        );
    }
}
