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

use super::{OWNER_BITS, OWNER_MASK};

/// What the owner bits of the entry under the cursor say.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OwnerState {
    /// Still holds the previous lap's entry
    Empty,
    /// Written during the current lap
    Ready,
    /// Written more than one lap ahead of the consumer
    Overflow,
}

/// Consumer cursor of a device-produced ring.
///
/// `head` counts consumed entries plus one full lap, so the first lap of the
/// device carries owner value 1 and a zeroed ring reads as empty.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OwnerCursor {
    head: u32,
    entries: u32,
}

impl OwnerCursor {
    /// Create a cursor for a ring of `entries` entries (a power of two).
    pub fn new(entries: u32) -> Self {
        debug_assert!(entries.is_power_of_two());
        Self {
            head: entries,
            entries,
        }
    }

    /// Raw head counter
    #[inline]
    pub fn head(&self) -> u32 {
        self.head
    }

    /// Entries per lap
    #[inline]
    pub fn entries(&self) -> u32 {
        self.entries
    }

    /// Ring index of the entry under the cursor
    #[inline]
    pub fn index(&self) -> u32 {
        self.head & (self.entries - 1)
    }

    /// Owner value of an entry the device has not rewritten since the last lap
    #[inline]
    pub fn empty_owner(&self) -> u32 {
        (self.head / self.entries).wrapping_sub(1) & OWNER_MASK
    }

    /// Owner value of an entry written during the current lap
    #[inline]
    pub fn ready_owner(&self) -> u32 {
        (self.head / self.entries) & OWNER_MASK
    }

    /// Classify the owner bits read from the entry under the cursor.
    #[inline]
    pub fn classify(&self, owner: u32) -> OwnerState {
        let owner = owner & OWNER_MASK;
        if owner == self.empty_owner() {
            OwnerState::Empty
        } else if owner == self.ready_owner() {
            OwnerState::Ready
        } else {
            OwnerState::Overflow
        }
    }

    /// Move past the entry under the cursor.
    #[inline]
    pub fn advance(&mut self) {
        self.head = self.head.wrapping_add(1);
    }

    /// Step back over `n` entries that were read but must be read again.
    #[inline]
    pub fn rewind(&mut self, n: u32) {
        self.head = self.head.wrapping_sub(n);
    }

    /// Head value reported to the device in the doorbell.
    ///
    /// The doorbell tail carries the ring index plus the owner counter bits.
    #[inline]
    pub fn doorbell_tail(&self) -> u32 {
        self.head & ((self.entries << OWNER_BITS) - 1)
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::{TestResult, quickcheck};

    use super::*;

    /// Owner value the device writes for its `n`-th produced entry.
    fn produced_owner(n: u32, entries: u32) -> u32 {
        (n / entries + 1) & OWNER_MASK
    }

    /// Model of a ring slot after `produced` entries; zero before its first write.
    fn slot_owner(slot: u32, produced: u32, entries: u32) -> u32 {
        if produced <= slot {
            return 0;
        }
        let last = slot + ((produced - 1 - slot) / entries) * entries;
        produced_owner(last, entries)
    }

    #[test]
    fn fresh_ring_reads_empty() {
        let c = OwnerCursor::new(4);
        assert_eq!(c.index(), 0);
        assert_eq!(c.classify(0), OwnerState::Empty);
        assert_eq!(c.classify(1), OwnerState::Ready);
        assert_eq!(c.classify(2), OwnerState::Overflow);
    }

    #[test]
    fn doorbell_tail_keeps_owner_bits() {
        let mut c = OwnerCursor::new(4);
        for _ in 0..5 {
            c.advance();
        }
        // head = 9, ring of 4 with 3 owner bits wraps at 32
        assert_eq!(c.doorbell_tail(), 9);
        for _ in 0..24 {
            c.advance();
        }
        assert_eq!(c.doorbell_tail(), 1);
    }

    #[test]
    fn rewind_restores_position() {
        let mut c = OwnerCursor::new(8);
        let start = c;
        c.advance();
        c.advance();
        c.rewind(2);
        assert_eq!(c, start);
    }

    quickcheck! {
        // The consumer sees "empty" exactly when the slot under the cursor has
        // not been produced yet, "ready" when it holds the next entry, and
        // "overflow" once the producer is a full lap or more ahead.
        fn classification_matches_model(log2: u8, consumed: u16, lead: u16) -> TestResult {
            let entries = 1u32 << (log2 % 6);
            let consumed = consumed as u32;
            let lead = lead as u32 % (entries * 6);
            let produced = consumed + lead;

            let mut c = OwnerCursor::new(entries);
            for _ in 0..consumed {
                c.advance();
            }
            let owner = slot_owner(c.index(), produced, entries);
            let expected = if lead == 0 {
                OwnerState::Empty
            } else if lead <= entries {
                OwnerState::Ready
            } else {
                OwnerState::Overflow
            };
            TestResult::from_bool(c.classify(owner) == expected)
        }

        fn head_wraparound_keeps_owner_sequence(log2: u8, laps: u8) -> bool {
            let entries = 1u32 << (log2 % 8);
            let mut c = OwnerCursor {
                head: u32::MAX - entries * (laps as u32 % 4) - (entries - 1),
                entries,
            };
            // Walk across the u32 wrap and check the ready owner moves by one per lap.
            let mut prev = c.ready_owner();
            for _ in 0..entries * 8 {
                let idx_before = c.index();
                c.advance();
                if c.index() == 0 && idx_before == entries - 1 {
                    let now = c.ready_owner();
                    if now != (prev + 1) & OWNER_MASK {
                        return false;
                    }
                    prev = now;
                }
            }
            true
        }
    }
}
