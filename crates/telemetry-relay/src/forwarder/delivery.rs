// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-record, per-destination delivery state.
//!
//! The state of a stored record for a destination is never written as such. It is
//! derived from the destination's cursor, its dead letters, its attempt counters and the
//! worker's in-flight range, which keeps it single valued: a record at or below the
//! cursor is FORWARDED (or DEAD), never also PENDING.

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    Pending,
    InFlight,
    Forwarded,
    Failed,
    Dead,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// Handed to the sink.
    Dispatched,
    /// The destination confirmed the send.
    Acked,
    /// The attempt failed; `attempts` includes this one.
    SendFailed { attempts: u32, max: u32 },
    /// Retrying cannot help: encoding failed or the destination refused the payload.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal delivery transition from {from:?} on {event:?}")]
pub struct IllegalTransition {
    pub from: DeliveryState,
    pub event: DeliveryEvent,
}

impl DeliveryState {
    pub fn apply(self, event: DeliveryEvent) -> Result<DeliveryState, IllegalTransition> {
        use DeliveryEvent::*;
        use DeliveryState::*;

        match (self, event) {
            (Pending | Failed, Dispatched) => Ok(InFlight),
            (InFlight, Acked) => Ok(Forwarded),
            (InFlight, SendFailed { attempts, max }) if attempts >= max => Ok(Dead),
            (InFlight, SendFailed { .. }) => Ok(Failed),
            (Pending | Failed | InFlight, Rejected) => Ok(Dead),
            (from, event) => Err(IllegalTransition { from, event }),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryState::Forwarded | DeliveryState::Dead)
    }

    /// Derives the state of record `id` for one destination.
    pub fn derive(id: u64, cursor: u64, dead: bool, attempts: u32, in_flight: bool) -> Self {
        if dead {
            DeliveryState::Dead
        } else if id <= cursor {
            DeliveryState::Forwarded
        } else if in_flight {
            DeliveryState::InFlight
        } else if attempts > 0 {
            DeliveryState::Failed
        } else {
            DeliveryState::Pending
        }
    }
}
