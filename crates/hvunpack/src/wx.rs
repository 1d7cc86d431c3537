//! The per-page write-then-execute state machine.
//!
//! Execution of a page whose contents were written since the last dump (or
//! since tracking began) is the unpack signal. The machine is deliberately
//! pure: it maps an observation onto a new state and an action, and the
//! session applies the action to the traps and the dump queue.
//!
//! ```text
//! CLEAN ──write──▶ WRITTEN ──exec──▶ PENDING_EXEC ──(dump emitted)──▶ DUMPED
//!   ▲                 │                                                │
//!   │                 └──write──▶ WRITTEN                              │
//!   └──────────────────── write ◀──────────────────────────────────────┘
//! ```

/// The write-then-execute state of a page.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum WxState {
    /// No write observed since tracking began or since the last dump cycle.
    #[default]
    Clean,

    /// The page was written and has not been executed yet.
    Written,

    /// Execution of written contents was observed; a dump is in flight.
    PendingExec,

    /// The written contents were dumped; only a new write restarts the
    /// cycle.
    Dumped,
}

/// The kind of access observed on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// A read access. Never changes state.
    Read,

    /// A write access.
    Write,

    /// An instruction fetch.
    Execute,
}

/// What the session must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WxAction {
    /// Nothing to do.
    None,

    /// Arm the frame so instruction fetches fault.
    ArmExecute,

    /// Emit a dump of the process address space.
    TriggerDump,
}

impl WxState {
    /// Applies one observation and returns the successor state with the
    /// action it requires.
    ///
    /// Writes always land in [`WxState::Written`] and re-arm the execute
    /// trap, regardless of the previous state; the caller bumps the page
    /// generation for each of them. Reads are spurious and never change
    /// state.
    pub fn observe(self, observation: Observation) -> (WxState, WxAction) {
        match (self, observation) {
            (state, Observation::Read) => (state, WxAction::None),
            (_, Observation::Write) => (WxState::Written, WxAction::ArmExecute),
            (WxState::Written, Observation::Execute) => {
                (WxState::PendingExec, WxAction::TriggerDump)
            }
            (state, Observation::Execute) => (state, WxAction::None),
        }
    }

    /// Marks the in-flight dump as emitted.
    ///
    /// Only meaningful in [`WxState::PendingExec`]; other states are
    /// returned unchanged.
    pub fn dump_emitted(self) -> WxState {
        match self {
            WxState::PendingExec => WxState::Dumped,
            state => state,
        }
    }
}
