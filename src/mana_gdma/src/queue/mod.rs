/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! GDMA queue engine
//!
//! Four ring kinds share DMA memory with the device:
//!
//! - **Send/receive work queues** ([`WorkQueue`]) are produced by the driver. Each
//!   entry (WQE) is a header, an inline out-of-band block and a scatter/gather list,
//!   padded to 32-byte basic units. The driver tracks `head` and `tail` in basic
//!   units and tells the device about new entries through a doorbell.
//! - **Completion and event queues** ([`CompletionQueue`], [`EventQueue`]) are
//!   produced by the device and consumed by the driver. They never report "full";
//!   each entry carries a 3-bit owner counter that the device bumps on every lap,
//!   and the driver infers new entries and overflow from it (see [`OwnerCursor`]).
//!
//! ```text
//!   head/N - 1 (mod 8)     head/N (mod 8)         anything else
//!   ┌──────────────┐       ┌──────────────┐       ┌──────────────┐
//!   │    Empty     │       │    Ready     │       │   Overflow   │
//!   └──────────────┘       └──────────────┘       └──────────────┘
//! ```

mod cq;
mod cursor;
mod desc;
mod eq;
mod wq;

use std::fmt;

use crate::mem::PAGE_SIZE;

pub use cq::{Completion, CompletionQueue, CqHandler, Cqe};
pub use cursor::{OwnerCursor, OwnerState};
pub use desc::{Sge, WqeFlags, WqeHeader, WqeRequest};
pub use eq::{BatchOutcome, EqHandler, EqMode, Eqe, Event, EventQueue, EventType};
pub use wq::{WorkQueue, WqeInfo, wqe_size};

#[cfg(test)]
pub(crate) use eq::tests::{EqProducer, RecordingBar};

/// Size of a basic unit, the granularity of work queue entries
pub const WQE_BU_SIZE: u32 = 32;
/// Size of a scatter/gather entry
pub const SGE_SIZE: u32 = 16;
/// Size of the fixed WQE header
pub const WQE_HEADER_SIZE: u32 = 8;
/// Small inline out-of-band block
pub const INLINE_OOB_SMALL_SIZE: u32 = 8;
/// Large inline out-of-band block
pub const INLINE_OOB_LARGE_SIZE: u32 = 24;
/// Largest entry a send queue accepts
pub const MAX_TX_WQE_SIZE: u32 = 512;
/// Largest entry a receive queue accepts
pub const MAX_RX_WQE_SIZE: u32 = 256;
/// Size of a completion queue entry
pub const CQE_SIZE: u32 = 64;
/// Size of an event queue entry
pub const EQE_SIZE: u32 = 16;
/// Width of the owner counter in completion and event entries
pub const OWNER_BITS: u32 = 3;
/// Mask of the owner counter
pub const OWNER_MASK: u32 = (1 << OWNER_BITS) - 1;
/// DMA region handle of a queue whose memory is not registered with the device
pub const INVALID_DMA_REGION: u64 = 0;
/// Queue id before the device assigns one
pub const INVALID_QUEUE_ID: u32 = u32::MAX;

/// Ring size for `depth` entries of `entry_size` bytes: the next power of
/// two, and never less than a page.
pub fn ring_size(entry_size: u32, depth: u32) -> usize {
    (entry_size as usize * depth as usize)
        .next_power_of_two()
        .max(PAGE_SIZE)
}

/// The four kinds of GDMA queue.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum QueueKind {
    /// Send queue
    Send,
    /// Receive queue
    Receive,
    /// Completion queue
    Completion,
    /// Event queue
    Event,
}

impl QueueKind {
    /// Queue type code used on the wire
    pub const fn code(self) -> u32 {
        match self {
            QueueKind::Send => 1,
            QueueKind::Receive => 2,
            QueueKind::Completion => 3,
            QueueKind::Event => 4,
        }
    }

    /// Inverse of [`code`](Self::code)
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(QueueKind::Send),
            2 => Some(QueueKind::Receive),
            3 => Some(QueueKind::Completion),
            4 => Some(QueueKind::Event),
            _ => None,
        }
    }

    /// Byte offset of this kind's doorbell within a doorbell page
    pub const fn doorbell_offset(self) -> u64 {
        match self {
            QueueKind::Send => 0x000,
            QueueKind::Receive => 0x400,
            QueueKind::Completion => 0x800,
            QueueKind::Event => 0xFF8,
        }
    }

    /// Short name used in logs and metric labels
    pub const fn as_str(self) -> &'static str {
        match self {
            QueueKind::Send => "sq",
            QueueKind::Receive => "rq",
            QueueKind::Completion => "cq",
            QueueKind::Event => "eq",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_sizes() {
        assert_eq!(ring_size(EQE_SIZE, 4), PAGE_SIZE);
        assert_eq!(ring_size(CQE_SIZE, 4 * 2), PAGE_SIZE);
        assert_eq!(ring_size(MAX_TX_WQE_SIZE, 12), 8192);
        assert_eq!(ring_size(CQE_SIZE, 100), 8192);
    }

    #[test]
    fn kind_codes() {
        for kind in [
            QueueKind::Send,
            QueueKind::Receive,
            QueueKind::Completion,
            QueueKind::Event,
        ] {
            assert_eq!(QueueKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(QueueKind::from_code(0), None);
        assert_eq!(QueueKind::Event.to_string(), "eq");
    }
}
