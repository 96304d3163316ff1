//! Freeze state machine
//!
//! Per-subscription connectivity status stored by the record store.
//! The `wait_*` variants are the first half of a two-phase change: the
//! request has been recorded but the registry has not confirmed it yet.
//!
//! ```text
//! no  --FreezeRequested-->   wait_yes --BanApplied-->   yes
//! yes --UnfreezeRequested--> wait_no  --UnbanApplied--> no
//! ```
//!
//! All legal moves are listed in [`FreezeState::transition`].

use crate::registry::PeerOp;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreezeState {
    /// Peer unblocked
    No,
    /// Unban requested, not yet applied
    WaitNo,
    /// Peer blocked
    Yes,
    /// Ban requested, not yet applied
    WaitYes,
}

/// Something that happened to a record or its peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeEvent {
    /// Subscription lapsed (external)
    FreezeRequested,
    /// Subscription renewed (external)
    UnfreezeRequested,
    /// Registry ban confirmed
    BanApplied,
    /// Registry unban confirmed
    UnbanApplied,
    /// Peer listed as banned on the VPN host
    ObservedBanned,
    /// Peer listed as active on the VPN host
    ObservedActive,
}

impl FreezeState {
    /// Apply `event`. The whole transition table lives here.
    pub fn transition(self, event: FreezeEvent) -> Result<FreezeState, TransitionError> {
        use FreezeEvent::*;
        use FreezeState::*;

        match (self, event) {
            (No, FreezeRequested) => Ok(WaitYes),
            (Yes, UnfreezeRequested) => Ok(WaitNo),
            (WaitYes, BanApplied) => Ok(Yes),
            (WaitNo, UnbanApplied) => Ok(No),
            (No | WaitYes, ObservedBanned) => Ok(Yes),
            (Yes | WaitNo, ObservedActive) => Ok(No),
            (from, event) => Err(TransitionError { from, event }),
        }
    }

    /// Pending states need a registry operation
    pub fn is_pending(self) -> bool {
        matches!(self, FreezeState::WaitNo | FreezeState::WaitYes)
    }

    /// Registry operation that settles a pending state
    pub fn pending_op(self) -> Option<PeerOp> {
        match self {
            FreezeState::WaitYes => Some(PeerOp::Ban),
            FreezeState::WaitNo => Some(PeerOp::Unban),
            FreezeState::No | FreezeState::Yes => None,
        }
    }

    /// Event reported once `pending_op` succeeded
    pub fn applied_event(self) -> Option<FreezeEvent> {
        match self {
            FreezeState::WaitYes => Some(FreezeEvent::BanApplied),
            FreezeState::WaitNo => Some(FreezeEvent::UnbanApplied),
            FreezeState::No | FreezeState::Yes => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FreezeState::No => "no",
            FreezeState::WaitNo => "wait_no",
            FreezeState::Yes => "yes",
            FreezeState::WaitYes => "wait_yes",
        }
    }
}

impl fmt::Display for FreezeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Illegal freeze transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Illegal freeze transition from '{from}' on {event:?}")]
pub struct TransitionError {
    pub from: FreezeState,
    pub event: FreezeEvent,
}
