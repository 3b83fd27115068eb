// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VM lifecycle state machine.
//!
//! A VM is always in exactly one [`State`]. It moves between states only when
//! an [`Event`] is applied to it and the pair `(current state, event)` appears
//! in the lifecycle [`TransitionTable`]. The table is built once and shared
//! immutably by every [`StateMachine`] handle, so lookups need no locking.
//!
//! The state machine never mutates anything itself: callers look up the next
//! state and are responsible for recording it (and for bumping the VM's update
//! counter) in whatever store owns the VM record.

use std::collections::BTreeMap;
use std::sync::Arc;

use strum::{Display, EnumIter, IntoStaticStr};
use thiserror::Error;

/// A VM lifecycle state.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumIter,
    IntoStaticStr,
)]
pub enum State {
    Starting,
    Running,
    Stopping,
    Stopped,
    Destroyed,
    Expunging,
    Migrating,
    Error,
    Unknown,
    Shutdowned,
}

impl State {
    /// Returns true if this state represents work in progress that must
    /// eventually resolve to a stable state.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            State::Starting
                | State::Stopping
                | State::Expunging
                | State::Migrating
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            State::Starting => {
                "VM is being started. The host id names the host it is being \
                started on."
            }
            State::Running => {
                "VM is running. The host id names the host it is running on."
            }
            State::Stopping => {
                "VM is being stopped. The host id names the host it is being \
                stopped on."
            }
            State::Stopped => "VM is stopped. The host id should be empty.",
            State::Destroyed => "VM is marked for destroy.",
            State::Expunging => "VM is being expunged.",
            State::Migrating => {
                "VM is being migrated. The host id holds the source host."
            }
            State::Error => "VM is in error.",
            State::Unknown => "VM state is unknown.",
            State::Shutdowned => "VM was shut down from inside the guest.",
        }
    }
}

/// Something that can happen to a VM and may move it to a new state.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumIter,
    IntoStaticStr,
)]
pub enum Event {
    CreateRequested,
    StartRequested,
    StopRequested,
    DestroyRequested,
    RecoveryRequested,
    AgentReportStopped,
    AgentReportRunning,
    MigrationRequested,
    StorageMigrationRequested,
    ExpungeOperation,
    OperationSucceeded,
    OperationFailed,
    OperationFailedToError,
    OperationRetry,
    AgentReportShutdowned,
    AgentReportMigrated,
    RevertRequested,
    SnapshotRequested,
}

/// The lookup failed because no transition is registered for this pair.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("no transition from state {state} on event {event}")]
pub struct TransitionNotFound {
    pub state: State,
    pub event: Event,
}

/// An immutable mapping from `(State, Event)` to the next `State`.
#[derive(Debug)]
pub struct TransitionTable {
    transitions: BTreeMap<(State, Event), State>,
}

impl TransitionTable {
    /// Builds the VM lifecycle table.
    pub fn vm_lifecycle() -> Self {
        use Event as E;
        use State as S;

        const TRANSITIONS: &[(State, &[Event], State)] = &[
            (S::Stopped, &[E::StartRequested], S::Starting),
            (S::Stopped, &[E::DestroyRequested], S::Destroyed),
            (S::Stopped, &[E::OperationFailedToError], S::Error),
            (S::Stopped, &[E::ExpungeOperation], S::Expunging),
            (S::Stopped, &[E::StorageMigrationRequested], S::Migrating),
            (S::Starting, &[E::OperationRetry], S::Starting),
            (
                S::Starting,
                &[E::OperationSucceeded, E::AgentReportRunning],
                S::Running,
            ),
            (
                S::Starting,
                &[
                    E::OperationFailed,
                    E::AgentReportStopped,
                    E::AgentReportShutdowned,
                ],
                S::Stopped,
            ),
            (S::Destroyed, &[E::RecoveryRequested], S::Stopped),
            (S::Destroyed, &[E::ExpungeOperation], S::Expunging),
            (S::Running, &[E::MigrationRequested], S::Migrating),
            (S::Running, &[E::StopRequested], S::Stopping),
            (
                S::Running,
                &[E::AgentReportStopped, E::AgentReportShutdowned],
                S::Stopped,
            ),
            (
                S::Running,
                &[E::AgentReportRunning, E::AgentReportMigrated],
                S::Running,
            ),
            (S::Migrating, &[E::MigrationRequested], S::Migrating),
            (
                S::Migrating,
                &[E::OperationSucceeded, E::AgentReportRunning],
                S::Running,
            ),
            (S::Migrating, &[E::OperationFailed], S::Running),
            (
                S::Migrating,
                &[E::AgentReportStopped, E::AgentReportShutdowned],
                S::Stopped,
            ),
            (
                S::Stopping,
                &[
                    E::OperationSucceeded,
                    E::AgentReportStopped,
                    E::AgentReportShutdowned,
                ],
                S::Stopped,
            ),
            (
                S::Stopping,
                &[E::OperationFailed, E::AgentReportRunning],
                S::Running,
            ),
            (S::Stopping, &[E::StopRequested], S::Stopping),
            (
                S::Expunging,
                &[E::OperationFailed, E::ExpungeOperation],
                S::Expunging,
            ),
            (
                S::Error,
                &[E::DestroyRequested, E::ExpungeOperation],
                S::Expunging,
            ),
        ];

        let mut transitions = BTreeMap::new();
        for (from, events, to) in TRANSITIONS {
            for event in events.iter() {
                let prev = transitions.insert((*from, *event), *to);
                assert!(
                    prev.is_none(),
                    "duplicate transition for ({from}, {event})"
                );
            }
        }

        Self { transitions }
    }

    pub fn next_state(
        &self,
        state: State,
        event: Event,
    ) -> Result<State, TransitionNotFound> {
        self.transitions
            .get(&(state, event))
            .copied()
            .ok_or(TransitionNotFound { state, event })
    }

    /// Lists the events that are accepted in the supplied state.
    pub fn events_from(&self, state: State) -> Vec<Event> {
        self.transitions
            .keys()
            .filter(|(from, _)| *from == state)
            .map(|(_, event)| *event)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }
}

/// A cheaply cloneable handle to a shared, immutable transition table.
#[derive(Clone, Debug)]
pub struct StateMachine {
    table: Arc<TransitionTable>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(Arc::new(TransitionTable::vm_lifecycle()))
    }
}

impl StateMachine {
    pub fn new(table: Arc<TransitionTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    /// Looks up the state a VM in `state` moves to when `event` occurs.
    ///
    /// An error here means the caller asked for a transition the lifecycle
    /// does not allow; the caller must fail its operation rather than pick
    /// a state of its own.
    pub fn transition(
        &self,
        state: State,
        event: Event,
    ) -> Result<State, TransitionNotFound> {
        self.table.next_state(state, event)
    }

    /// The state of a VM that does not exist yet and receives `event`.
    pub fn initial_state(event: Event) -> Option<State> {
        match event {
            Event::CreateRequested => Some(State::Stopped),
            _ => None,
        }
    }
}

/// Did this transition complete a start?
pub fn is_vm_started(old: State, _event: Event, new: State) -> bool {
    old == State::Starting && new == State::Running
}

/// Did this transition complete a stop?
pub fn is_vm_stopped(old: State, _event: Event, new: State) -> bool {
    old == State::Stopping && new == State::Stopped
}

/// Did this transition complete a successful migration?
pub fn is_vm_migrated(old: State, event: Event, new: State) -> bool {
    old == State::Migrating
        && new == State::Running
        && matches!(
            event,
            Event::OperationSucceeded | Event::AgentReportRunning
        )
}

/// Did this transition destroy a stopped VM?
pub fn is_vm_destroyed(old: State, _event: Event, new: State) -> bool {
    old == State::Stopped
        && matches!(new, State::Destroyed | State::Error | State::Expunging)
}
