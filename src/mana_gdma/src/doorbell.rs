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

//! Doorbell protocol.
//!
//! A doorbell is a 64-bit MMIO store into a per-device doorbell page. The value
//! layout depends on the queue kind:
//!
//! | kind       | bits (LSB first)                      | page offset |
//! |------------|---------------------------------------|-------------|
//! | send       | id:24, rsvd:8, tail:32                | 0x000       |
//! | receive    | id:24, wqe_cnt:8, tail:32             | 0x400       |
//! | completion | id:24, rsvd:8, tail:31, arm:1         | 0x800       |
//! | event      | id:16, rsvd:16, tail:31, arm:1        | 0xFF8       |

use std::sync::Arc;

use tracing::trace;

use crate::mem::{Mmio, wmb};
use crate::queue::QueueKind;

/// Register holding the BAR offset of doorbell page 0
pub const GDMA_REG_DB_PAGE_OFFSET: u64 = 0x08;
/// Register holding the doorbell page size (low 16 bits)
pub const GDMA_REG_DB_PAGE_SIZE: u64 = 0x10;
/// Register holding the BAR offset of the bootstrap shared memory
pub const GDMA_REG_SHM_OFFSET: u64 = 0x18;

/// A packed doorbell value.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DoorbellEntry(u64);

impl DoorbellEntry {
    const ID24: u64 = 0xFF_FFFF;
    const TAIL31: u64 = 0x7FFF_FFFF;

    /// Send queue doorbell; `tail` is the producer offset in bytes.
    pub fn send(id: u32, tail: u32) -> Self {
        Self((id as u64 & Self::ID24) | ((tail as u64) << 32))
    }

    /// Receive queue doorbell carrying the number of newly posted entries.
    pub fn receive(id: u32, wqe_cnt: u8, tail: u32) -> Self {
        Self((id as u64 & Self::ID24) | ((wqe_cnt as u64) << 24) | ((tail as u64) << 32))
    }

    /// Completion queue doorbell.
    pub fn completion(id: u32, tail: u32, arm: bool) -> Self {
        Self(
            (id as u64 & Self::ID24)
                | ((tail as u64 & Self::TAIL31) << 32)
                | ((arm as u64) << 63),
        )
    }

    /// Event queue doorbell.
    pub fn event(id: u32, tail: u32, arm: bool) -> Self {
        Self(
            (id as u64 & 0xFFFF) | ((tail as u64 & Self::TAIL31) << 32) | ((arm as u64) << 63),
        )
    }

    /// Raw value written to the register
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Queue id field; 16 bits wide for event queues
    pub fn id(self, kind: QueueKind) -> u32 {
        match kind {
            QueueKind::Event => (self.0 & 0xFFFF) as u32,
            _ => (self.0 & Self::ID24) as u32,
        }
    }

    /// Tail field
    pub fn tail(self, kind: QueueKind) -> u32 {
        match kind {
            QueueKind::Send | QueueKind::Receive => (self.0 >> 32) as u32,
            QueueKind::Completion | QueueKind::Event => ((self.0 >> 32) & Self::TAIL31) as u32,
        }
    }

    /// Arm bit (completion and event queues)
    pub fn arm(self) -> bool {
        self.0 >> 63 == 1
    }

    /// Posted entry count (receive queues)
    pub fn wqe_cnt(self) -> u8 {
        (self.0 >> 24) as u8
    }
}

impl From<u64> for DoorbellEntry {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// The doorbell pages of a device BAR.
pub struct DoorbellRegion {
    mmio: Arc<dyn Mmio>,
    page_base: u64,
    page_size: u64,
}

impl std::fmt::Debug for DoorbellRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoorbellRegion")
            .field("page_base", &format_args!("{:#x}", self.page_base))
            .field("page_size", &format_args!("{:#x}", self.page_size))
            .finish()
    }
}

impl DoorbellRegion {
    pub fn new(mmio: Arc<dyn Mmio>, page_base: u64, page_size: u64) -> Self {
        Self {
            mmio,
            page_base,
            page_size,
        }
    }

    /// Discover the doorbell pages from the BAR registers.
    pub fn from_registers(mmio: Arc<dyn Mmio>) -> Self {
        let page_base = mmio.read64(GDMA_REG_DB_PAGE_OFFSET);
        let page_size = (mmio.read32(GDMA_REG_DB_PAGE_SIZE) & 0xFFFF) as u64;
        Self::new(mmio, page_base, page_size)
    }

    /// BAR offset of `kind`'s doorbell in page `db_id`
    pub fn address(&self, db_id: u32, kind: QueueKind) -> u64 {
        self.page_base + self.page_size * db_id as u64 + kind.doorbell_offset()
    }

    /// Doorbell page size in bytes
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Publish all prior ring writes, then write `entry`.
    pub fn ring(&self, db_id: u32, kind: QueueKind, entry: DoorbellEntry) {
        let addr = self.address(db_id, kind);
        trace!(kind = %kind, db_id, value = entry.as_u64(), "ring doorbell");
        wmb();
        self.mmio.write64(addr, entry.as_u64());
    }
}
