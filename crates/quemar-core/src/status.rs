//! Pause/resume/stop coordination between the control thread and the
//! worker pool.
//!
//! Typical usage:
//! - Control thread creates the object and calls `add_workers(1)` per
//!   worker, then `initialize()`.
//! - Every worker calls `should_continue()` at the top of each loop
//!   iteration.
//! - Control thread periodically calls `pause_workers()`, sleeps, then
//!   `resume_workers()`.
//! - Workers that finish early call `remove_self()` after their last
//!   `should_continue()`.
//! - Control thread eventually calls `stop_workers()` and joins.
//!
//! The pause rendezvous is a two-phase barrier sized at `num_workers + 1`:
//! the first crossing tells the controller every worker acknowledged the
//! pause, the second releases them all simultaneously on resume. Status
//! transitions are Run ⇄ Pause, Run → Stop, Pause → Stop; nothing else.

use parking_lot::{Condvar, Mutex, RwLock};

/// Run state shared between the controller and the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Run,
    Pause,
    Stop,
}

/// A reusable rendezvous barrier whose arrival count can be resized while
/// no crossing is in flight.
struct PauseBarrier {
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

struct BarrierState {
    required: usize,
    arrived: usize,
    generation: u64,
}

impl PauseBarrier {
    fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState { required: 1, arrived: 0, generation: 0 }),
            cvar: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut state = self.state.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived >= state.required {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cvar.notify_all();
        } else {
            while state.generation == generation {
                self.cvar.wait(&mut state);
            }
        }
    }

    fn resize(&self, required: usize) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.arrived, 0, "barrier resized mid-crossing");
        state.required = required.max(1);
    }
}

/// Shared controller implementing pause/resume/stop with barrier
/// semantics.
pub struct WorkerStatus {
    num_workers: Mutex<usize>,
    status: RwLock<Status>,
    barrier: PauseBarrier,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerStatus {
    /// A controller with zero workers, in Run state once initialized.
    #[must_use]
    pub fn new() -> Self {
        Self {
            num_workers: Mutex::new(0),
            status: RwLock::new(Status::Run),
            barrier: PauseBarrier::new(),
        }
    }

    /// Registered worker count.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        *self.num_workers.lock()
    }

    fn get_status(&self) -> Status {
        *self.status.read()
    }

    /// Swap the status, returning the previous value.
    fn set_status(&self, status: Status) -> Status {
        let mut guard = self.status.write();
        let prev = *guard;
        *guard = status;
        prev
    }

    /// Increase the worker count. Must be called before [`Self::initialize`].
    pub fn add_workers(&self, count: usize) {
        *self.num_workers.lock() += count;
    }

    /// Size the barrier for the registered workers plus the controller and
    /// enter Run state.
    pub fn initialize(&self) {
        self.barrier.resize(*self.num_workers.lock() + 1);
        self.set_status(Status::Run);
    }

    /// Tell the workers to pause. Does not return until every worker has
    /// reached `should_continue()` (or exited via `remove_self()`).
    pub fn pause_workers(&self) {
        if self.set_status(Status::Pause) != Status::Pause {
            self.barrier.wait();
        }
    }

    /// Release paused workers. May only follow [`Self::pause_workers`].
    pub fn resume_workers(&self) {
        if self.set_status(Status::Run) == Status::Pause {
            self.barrier.wait();
        }
    }

    /// Tell the workers to stop. Unblocks paused workers so they can
    /// observe the stop.
    pub fn stop_workers(&self) {
        if self.set_status(Status::Stop) == Status::Pause {
            self.barrier.wait();
        }
    }

    /// Worker-side poll. Returns whether the worker should keep running;
    /// blocks across a pause, setting `paused` when one occurred.
    pub fn should_continue(&self, paused: &mut bool) -> bool {
        *paused = false;
        loop {
            match self.get_status() {
                Status::Run => return true,
                Status::Stop => return false,
                Status::Pause => {
                    // First crossing: everyone acknowledged, pause_workers
                    // can return. Second: wait for resume (or stop).
                    self.barrier.wait();
                    self.barrier.wait();
                    *paused = true;
                }
            }
        }
    }

    /// Worker-side poll that never blocks: running until stopped.
    #[must_use]
    pub fn should_continue_no_pause(&self) -> bool {
        self.get_status() != Status::Stop
    }

    /// Deregister the calling worker. Obeys an in-flight pause first so the
    /// controller is never left waiting on a barrier this worker will not
    /// reach.
    pub fn remove_self(&self) {
        loop {
            {
                let status = self.status.read();
                if *status != Status::Pause {
                    // Holding the status read lock blocks a concurrent
                    // transition into Pause, so the barrier is guaranteed
                    // idle while we shrink it.
                    let mut num = self.num_workers.lock();
                    *num = num.saturating_sub(1);
                    self.barrier.resize(*num + 1);
                    return;
                }
            }
            self.barrier.wait();
            self.barrier.wait();
        }
    }
}
