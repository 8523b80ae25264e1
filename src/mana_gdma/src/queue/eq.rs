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

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytemuck::{Pod, Zeroable};
use tracing::{error, trace};

use super::cursor::{OwnerCursor, OwnerState};
use super::{EQE_SIZE, OWNER_MASK, QueueKind};
use crate::doorbell::{DoorbellEntry, DoorbellRegion};
use crate::error::{GdmaError, Result};
use crate::mem::{DmaBuffer, DmaMemory, rmb};
use crate::metrics::{CounterMetric, EmittableMetric};

/// A 16-byte event queue entry.
///
/// The info word packs `type:8, reserved:8, client_id:2, reserved:11, owner:3`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Eqe {
    pub details: [u32; 3],
    pub info: u32,
}

const _: () = assert!(core::mem::size_of::<Eqe>() == EQE_SIZE as usize);

impl Eqe {
    /// Offset of the info word within the entry
    pub const INFO_OFFSET: usize = core::mem::offset_of!(Eqe, info);

    pub fn new(kind: EventType, client_id: u32, owner: u32, details: [u32; 3]) -> Self {
        Self {
            details,
            info: kind.code() as u32 | ((client_id & 0x3) << 16) | ((owner & OWNER_MASK) << 29),
        }
    }

    pub fn event_type(&self) -> EventType {
        EventType::from_code(self.info as u8)
    }

    pub fn client_id(&self) -> u32 {
        (self.info >> 16) & 0x3
    }

    pub fn owner(&self) -> u32 {
        self.info >> 29
    }
}

/// Event types carried by an [`Eqe`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventType {
    /// `details[0]` low 24 bits name a completion queue with new entries
    Completion,
    /// Reply to a generated test event
    TestEvent,
    /// Bring-up: event queue id and doorbell page
    HwcInitEqIdDb,
    /// Bring-up: one negotiated value
    HwcInitData,
    /// Bring-up finished
    HwcInitDone,
    /// Anything else; ignored
    Unknown(u8),
}

impl EventType {
    pub const fn code(self) -> u8 {
        match self {
            EventType::Completion => 3,
            EventType::TestEvent => 64,
            EventType::HwcInitEqIdDb => 129,
            EventType::HwcInitData => 130,
            EventType::HwcInitDone => 131,
            EventType::Unknown(code) => code,
        }
    }

    pub const fn from_code(code: u8) -> Self {
        match code {
            3 => EventType::Completion,
            64 => EventType::TestEvent,
            129 => EventType::HwcInitEqIdDb,
            130 => EventType::HwcInitData,
            131 => EventType::HwcInitDone,
            other => EventType::Unknown(other),
        }
    }
}

/// An event read out of an [`EventQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventType,
    pub details: [u32; 3],
}

/// Callback for events an event queue handles itself (bring-up sub types).
pub trait EqHandler<M: DmaMemory>: Send + Sync {
    fn on_event(&self, eq: &EventQueue<M>, event: &Event);
}

/// Where interrupt-driven processing of an event queue runs.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EqMode {
    /// Drained on the interrupting thread
    Inline,
    /// Handed to the event worker; one bounded batch per wakeup
    Deferred,
}

/// Outcome of one bounded batch.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BatchOutcome {
    /// No more entries were pending
    Drained,
    /// The batch limit was hit with entries possibly left
    Pending,
    /// Owner bits showed an overflow; processing stopped
    Overflow,
}

/// A device-produced ring of 16-byte events.
pub struct EventQueue<M: DmaMemory> {
    id: AtomicU32,
    doorbell_id: AtomicU32,
    buf: DmaBuffer<M>,
    cursor: Mutex<OwnerCursor>,
    msix_index: u32,
    mode: EqMode,
    handler: Option<Arc<dyn EqHandler<M>>>,
    gdma_region: u64,
}

impl<M: DmaMemory> std::fmt::Debug for EventQueue<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("id", &self.id())
            .field("doorbell_id", &self.doorbell_id())
            .field("addr", &format_args!("{:#x}", self.buf.addr()))
            .field("msix_index", &self.msix_index)
            .field("mode", &self.mode)
            .finish()
    }
}

impl<M: DmaMemory> EventQueue<M> {
    pub fn new(
        id: u32,
        doorbell_id: u32,
        buf: DmaBuffer<M>,
        msix_index: u32,
        mode: EqMode,
        handler: Option<Arc<dyn EqHandler<M>>>,
        gdma_region: u64,
    ) -> Result<Self> {
        let entries = buf.len() / EQE_SIZE as usize;
        if !entries.is_power_of_two() || entries > u32::MAX as usize >> 4 {
            return Err(GdmaError::InvalidArgument(format!(
                "event queue of {} bytes",
                buf.len()
            )));
        }
        Ok(Self {
            id: AtomicU32::new(id),
            doorbell_id: AtomicU32::new(doorbell_id),
            buf,
            cursor: Mutex::new(OwnerCursor::new(entries as u32)),
            msix_index,
            mode,
            handler,
            gdma_region,
        })
    }

    /// Hardware id
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    pub fn doorbell_id(&self) -> u32 {
        self.doorbell_id.load(Ordering::Acquire)
    }

    /// Adopt the id and doorbell page the device assigned during bring-up.
    pub fn assign(&self, id: u32, doorbell_id: u32) {
        self.id.store(id, Ordering::Release);
        self.doorbell_id.store(doorbell_id, Ordering::Release);
    }

    /// Interrupt vector the queue reports on
    pub fn msix_index(&self) -> u32 {
        self.msix_index
    }

    pub fn mode(&self) -> EqMode {
        self.mode
    }

    /// Ring capacity in bytes
    pub fn size(&self) -> u32 {
        self.buf.len() as u32
    }

    /// Bus address of the ring
    pub fn addr(&self) -> u64 {
        self.buf.addr()
    }

    /// DMA region handle registered with the device
    pub fn gdma_region(&self) -> u64 {
        self.gdma_region
    }

    /// Raw consumer position
    pub fn head(&self) -> u32 {
        self.lock_cursor().head()
    }

    pub(crate) fn handler(&self) -> Option<&Arc<dyn EqHandler<M>>> {
        self.handler.as_ref()
    }

    fn lock_cursor(&self) -> std::sync::MutexGuard<'_, OwnerCursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consume up to `limit` events, handing each to `f`, then ring the
    /// doorbell. The doorbell is armed unless the batch hit `limit`.
    ///
    /// The consumer lock is held for the whole batch, including `f`, so one
    /// queue is never processed by two threads at once.
    pub fn process_batch(
        &self,
        db: &DoorbellRegion,
        limit: u32,
        mut f: impl FnMut(&Self, &Event),
    ) -> Result<BatchOutcome> {
        let mut cursor = self.lock_cursor();
        let mut outcome = BatchOutcome::Pending;
        for _ in 0..limit {
            let offset = cursor.index() as usize * EQE_SIZE as usize;
            let info = self.buf.load_acquire(offset + Eqe::INFO_OFFSET)?;
            match cursor.classify(info >> 29) {
                OwnerState::Empty => {
                    outcome = BatchOutcome::Drained;
                    break;
                }
                OwnerState::Overflow => {
                    error!(eq = self.id(), head = cursor.head(), "event queue overflow detected");
                    CounterMetric::queue_overflow(QueueKind::Event).emit();
                    outcome = BatchOutcome::Overflow;
                    break;
                }
                OwnerState::Ready => {}
            }
            rmb();
            let eqe: Eqe = self.buf.read_val(offset)?;
            let event = Event {
                kind: eqe.event_type(),
                details: eqe.details,
            };
            trace!(eq = self.id(), kind = ?event.kind, "event");
            f(self, &event);
            cursor.advance();
        }

        let arm = outcome != BatchOutcome::Pending;
        db.ring(
            self.doorbell_id(),
            QueueKind::Event,
            DoorbellEntry::event(self.id(), cursor.doorbell_tail(), arm),
        );
        Ok(outcome)
    }

    /// Arm the queue without consuming anything.
    pub fn arm(&self, db: &DoorbellRegion) {
        let tail = self.lock_cursor().doorbell_tail();
        db.ring(
            self.doorbell_id(),
            QueueKind::Event,
            DoorbellEntry::event(self.id(), tail, true),
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::mem::tests::{TestMem, ring_buffer};
    use crate::mem::{MemOps, Mmio, PAGE_SIZE};

    /// Device side model of an event ring.
    pub(crate) struct EqProducer {
        pub addr: u64,
        pub entries: u32,
        pub produced: u32,
    }

    impl EqProducer {
        pub fn produce(&mut self, mem: &TestMem, kind: EventType, details: [u32; 3]) {
            let idx = self.produced % self.entries;
            let owner = (self.produced / self.entries + 1) & OWNER_MASK;
            let eqe = Eqe::new(kind, 0, owner, details);
            mem.write_val(self.addr + (idx * EQE_SIZE) as u64, eqe)
                .unwrap();
            self.produced += 1;
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingBar {
        pub writes: Mutex<Vec<(u64, u64)>>,
    }

    impl Mmio for RecordingBar {
        fn read32(&self, _offset: u64) -> u32 {
            0
        }
        fn write32(&self, offset: u64, val: u32) {
            self.writes.lock().unwrap().push((offset, val as u64));
        }
        fn write64(&self, offset: u64, val: u64) {
            self.writes.lock().unwrap().push((offset, val));
        }
    }

    impl RecordingBar {
        pub fn last(&self) -> Option<DoorbellEntry> {
            self.writes.lock().unwrap().last().map(|w| w.1.into())
        }
    }

    fn setup(entries: usize) -> (Arc<TestMem>, EventQueue<TestMem>, EqProducer, Arc<RecordingBar>, DoorbellRegion) {
        let mem = TestMem::new(PAGE_SIZE);
        let buf = ring_buffer(&mem, entries * EQE_SIZE as usize);
        let addr = buf.addr();
        let eq = EventQueue::new(3, 0, buf, 0, EqMode::Inline, None, 0).unwrap();
        let bar = Arc::new(RecordingBar::default());
        let db = DoorbellRegion::new(bar.clone(), 0, 0x1000);
        let prod = EqProducer {
            addr,
            entries: entries as u32,
            produced: 0,
        };
        (mem, eq, prod, bar, db)
    }

    #[test]
    fn eqe_info_layout() {
        let eqe = Eqe::new(EventType::HwcInitData, 2, 7, [1, 2, 3]);
        assert_eq!(eqe.info, 130 | (2 << 16) | (7 << 29));
        assert_eq!(eqe.event_type(), EventType::HwcInitData);
        assert_eq!(eqe.client_id(), 2);
        assert_eq!(eqe.owner(), 7);
        assert_eq!(EventType::from_code(200), EventType::Unknown(200));
    }

    #[test]
    fn one_lap_then_empty() {
        let (mem, eq, mut prod, bar, db) = setup(4);
        for i in 0..4 {
            prod.produce(&mem, EventType::Completion, [i, 0, 0]);
        }
        let mut seen = Vec::new();
        let outcome = eq
            .process_batch(&db, 8, |_, ev| seen.push(ev.details[0]))
            .unwrap();
        assert_eq!(outcome, BatchOutcome::Drained);
        assert_eq!(seen, vec![0, 1, 2, 3]);

        // The fifth poll finds the first lap's entry still in slot 0.
        let outcome = eq.process_batch(&db, 8, |_, _| panic!("no event expected")).unwrap();
        assert_eq!(outcome, BatchOutcome::Drained);
        let last = bar.last().unwrap();
        assert!(last.arm());
        assert_eq!(last.tail(QueueKind::Event), 8);

        prod.produce(&mem, EventType::TestEvent, [9, 0, 0]);
        let mut kinds = Vec::new();
        eq.process_batch(&db, 8, |_, ev| kinds.push(ev.kind)).unwrap();
        assert_eq!(kinds, vec![EventType::TestEvent]);
    }

    #[test]
    fn batch_limit_publishes_without_arming() {
        let (mem, eq, mut prod, bar, db) = setup(16);
        for i in 0..7 {
            prod.produce(&mem, EventType::Completion, [i, 0, 0]);
        }
        let mut count = 0;
        assert_eq!(
            eq.process_batch(&db, 5, |_, _| count += 1).unwrap(),
            BatchOutcome::Pending
        );
        assert_eq!(count, 5);
        let last = bar.last().unwrap();
        assert!(!last.arm());
        assert_eq!(last.tail(QueueKind::Event), 16 + 5);

        assert_eq!(
            eq.process_batch(&db, 5, |_, _| count += 1).unwrap(),
            BatchOutcome::Drained
        );
        assert_eq!(count, 7);
        assert!(bar.last().unwrap().arm());
    }

    #[test]
    fn overflow_stops_batch_and_arms() {
        let (mem, eq, mut prod, bar, db) = setup(4);
        for i in 0..9 {
            prod.produce(&mem, EventType::Completion, [i, 0, 0]);
        }
        let mut count = 0;
        let outcome = eq.process_batch(&db, 5, |_, _| count += 1).unwrap();
        assert_eq!(outcome, BatchOutcome::Overflow);
        assert_eq!(count, 0);
        assert_eq!(eq.head(), 4);
        assert!(bar.last().unwrap().arm());
    }

    #[test]
    fn assign_updates_doorbell_identity() {
        let (_mem, eq, _prod, bar, db) = setup(4);
        eq.assign(0x42, 3);
        eq.arm(&db);
        let (offset, value) = *bar.writes.lock().unwrap().last().unwrap();
        assert_eq!(offset, 3 * 0x1000 + 0xFF8);
        assert_eq!(DoorbellEntry::from(value).id(QueueKind::Event), 0x42);
    }
}
