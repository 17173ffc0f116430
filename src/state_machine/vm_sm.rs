//! VM lifecycle state machine.
//!
//! Hierarchy:
//! ```text
//! Stopped ──Start──► Starting ──Launched──► Running ──Stop──► Stopping ──Halted──► Stopped
//!    ▲                  │                     │
//!    │                  └──Failed──► Error    └──CrashDetected──► Stopped
//!    │                                 │
//!    └──ExternalStartDetected──► Running   Error ──Stop──► Stopping
//! ```
//!
//! Every VM state change goes through [`VmLifecycle::dispatch`]. The machine
//! only validates and records transitions; the side effects (launching,
//! killing) live in the supervisor.

use statig::prelude::*;
use tracing::debug;

use crate::vm::VmState;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events dispatched to the VM state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum VmEvent {
    /// A start was requested.
    Start,
    /// The emulator launched (liveness is checked separately).
    Launched,
    /// The start failed fatally; carries the reason.
    Failed(String),
    /// A stop was requested.
    Stop,
    /// Teardown finished.
    Halted,
    /// The poller saw the emulator disappear.
    CrashDetected,
    /// The poller saw an emulator we did not start.
    ExternalStartDetected,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

/// Shared storage for the VM state machine.
#[derive(Debug, Default)]
pub struct VmMachine {
    /// Number of transitions taken since creation.
    pub transitions: u64,
}

impl VmMachine {
    /// Map a machine state to the public [`VmState`].
    pub fn vm_state(state: &State) -> VmState {
        match state {
            State::Stopped {} => VmState::Stopped,
            State::Starting {} => VmState::Starting,
            State::Running {} => VmState::Running,
            State::Stopping {} => VmState::Stopping,
            State::Error { .. } => VmState::Error,
        }
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::stopped()",
    state(derive(Debug, Clone, PartialEq))
)]
impl VmMachine {
    /// No emulator is running.
    #[state]
    fn stopped(&mut self, event: &VmEvent) -> Outcome<State> {
        match event {
            VmEvent::Start => Transition(State::starting()),
            VmEvent::ExternalStartDetected => Transition(State::running()),
            _ => Handled,
        }
    }

    // ------------------------------------------------------------------
    // Superstate: Busy (a lifecycle operation is mid-flight)
    // ------------------------------------------------------------------

    /// Ignores anything the leaf states do not handle.
    #[superstate]
    fn busy(&mut self, event: &VmEvent) -> Outcome<State> {
        debug!(?event, "event ignored mid-transition");
        Handled
    }

    #[state(superstate = "busy", entry_action = "count_transition")]
    fn starting(&mut self, event: &VmEvent) -> Outcome<State> {
        match event {
            VmEvent::Launched => Transition(State::running()),
            VmEvent::Failed(reason) => Transition(State::error(reason.clone())),
            _ => Super,
        }
    }

    #[state(superstate = "busy", entry_action = "count_transition")]
    fn stopping(&mut self, event: &VmEvent) -> Outcome<State> {
        match event {
            VmEvent::Halted => Transition(State::stopped()),
            _ => Super,
        }
    }

    /// The emulator is believed to be up.
    #[state(entry_action = "count_transition")]
    fn running(&mut self, event: &VmEvent) -> Outcome<State> {
        match event {
            VmEvent::Stop => Transition(State::stopping()),
            VmEvent::CrashDetected => Transition(State::stopped()),
            _ => Handled,
        }
    }

    /// The last start failed; `reason` carries the error. Only `Stop` leaves.
    #[state(entry_action = "count_transition")]
    fn error(&mut self, event: &VmEvent, reason: &String) -> Outcome<State> {
        let _ = reason;
        match event {
            VmEvent::Stop => Transition(State::stopping()),
            _ => Handled,
        }
    }

    #[action]
    fn count_transition(&mut self) {
        self.transitions += 1;
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Owns the running machine and reports what each event did.
pub struct VmLifecycle {
    machine: StateMachine<VmMachine>,
}

impl Default for VmLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl VmLifecycle {
    pub fn new() -> Self {
        Self {
            machine: VmMachine::default().state_machine(),
        }
    }

    pub fn state(&self) -> VmState {
        VmMachine::vm_state(self.machine.state())
    }

    /// Reason recorded by the last failed start, while in `Error`.
    pub fn error_reason(&self) -> Option<String> {
        match self.machine.state() {
            State::Error { reason } => Some(reason.clone()),
            _ => None,
        }
    }

    /// Feed `event` and return `(from, to)`. Equal values mean the event
    /// was not valid in the current state and nothing changed.
    pub fn dispatch(&mut self, event: VmEvent) -> (VmState, VmState) {
        let from = self.state();
        self.machine.handle(&event);
        (from, self.state())
    }
}
