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

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use spin::Mutex;
use tracing::{error, trace};

use super::cursor::{OwnerCursor, OwnerState};
use super::{CQE_SIZE, OWNER_MASK, QueueKind};
use crate::doorbell::{DoorbellEntry, DoorbellRegion};
use crate::error::{GdmaError, Result};
use crate::mem::{DmaBuffer, DmaMemory, rmb};
use crate::metrics::{CounterMetric, EmittableMetric};

/// A 64-byte completion queue entry.
///
/// The info word packs `wq_num:24, is_sq:1, reserved:4, owner:3`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Cqe {
    pub data: [u32; 15],
    pub info: u32,
}

const _: () = assert!(core::mem::size_of::<Cqe>() == CQE_SIZE as usize);

impl Cqe {
    /// Offset of the info word within the entry
    pub const INFO_OFFSET: usize = core::mem::offset_of!(Cqe, info);

    pub fn new(wq_num: u32, is_sq: bool, owner: u32, data: [u32; 15]) -> Self {
        Self {
            data,
            info: (wq_num & 0xFF_FFFF) | ((is_sq as u32) << 24) | ((owner & OWNER_MASK) << 29),
        }
    }

    /// Queue the completed entry was posted to
    pub fn wq_num(&self) -> u32 {
        self.info & 0xFF_FFFF
    }

    /// Whether the completed entry was a send
    pub fn is_sq(&self) -> bool {
        (self.info >> 24) & 1 == 1
    }

    pub fn owner(&self) -> u32 {
        self.info >> 29
    }
}

/// A completion read out of a [`CompletionQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Queue the completed entry was posted to
    pub wq_num: u32,
    /// Whether that queue is a send queue
    pub is_sq: bool,
    /// Queue specific completion payload
    pub data: [u32; 15],
}

impl Completion {
    /// Reinterpret the leading payload bytes as `T`.
    pub fn data_as<T: Pod>(&self) -> T {
        let bytes: &[u8] = bytemuck::cast_slice(&self.data);
        bytemuck::pod_read_unaligned(&bytes[..size_of::<T>()])
    }
}

/// Callback invoked when the device signals new completions on a queue.
pub trait CqHandler<M: DmaMemory>: Send + Sync {
    fn on_event(&self, cq: &CompletionQueue<M>);
}

impl<M: DmaMemory, F> CqHandler<M> for F
where
    F: Fn(&CompletionQueue<M>) + Send + Sync,
{
    fn on_event(&self, cq: &CompletionQueue<M>) {
        self(cq)
    }
}

/// A device-produced ring of 64-byte completions.
pub struct CompletionQueue<M: DmaMemory> {
    id: u32,
    doorbell_id: u32,
    buf: DmaBuffer<M>,
    cursor: Mutex<OwnerCursor>,
    parent_eq: Option<u32>,
    handler: Option<Arc<dyn CqHandler<M>>>,
    gdma_region: u64,
}

impl<M: DmaMemory> std::fmt::Debug for CompletionQueue<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("id", &self.id)
            .field("doorbell_id", &self.doorbell_id)
            .field("addr", &format_args!("{:#x}", self.buf.addr()))
            .field("cursor", &*self.cursor.lock())
            .field("parent_eq", &self.parent_eq)
            .finish()
    }
}

impl<M: DmaMemory> CompletionQueue<M> {
    pub fn new(
        id: u32,
        doorbell_id: u32,
        buf: DmaBuffer<M>,
        parent_eq: Option<u32>,
        handler: Option<Arc<dyn CqHandler<M>>>,
        gdma_region: u64,
    ) -> Result<Self> {
        let entries = buf.len() / CQE_SIZE as usize;
        if !entries.is_power_of_two() || entries > u32::MAX as usize >> 4 {
            return Err(GdmaError::InvalidArgument(format!(
                "completion queue of {} bytes",
                buf.len()
            )));
        }
        Ok(Self {
            id,
            doorbell_id,
            buf,
            cursor: Mutex::new(OwnerCursor::new(entries as u32)),
            parent_eq,
            handler,
            gdma_region,
        })
    }

    /// Hardware id
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn doorbell_id(&self) -> u32 {
        self.doorbell_id
    }

    /// Ring capacity in entries
    pub fn entries(&self) -> u32 {
        self.cursor.lock().entries()
    }

    /// Ring capacity in bytes
    pub fn size(&self) -> u32 {
        self.buf.len() as u32
    }

    /// Bus address of the ring
    pub fn addr(&self) -> u64 {
        self.buf.addr()
    }

    /// Event queue that reports this queue's completions
    pub fn parent_eq(&self) -> Option<u32> {
        self.parent_eq
    }

    /// DMA region handle registered with the device
    pub fn gdma_region(&self) -> u64 {
        self.gdma_region
    }

    /// Raw consumer position
    pub fn head(&self) -> u32 {
        self.cursor.lock().head()
    }

    /// Run the completion callback, if any.
    pub fn notify(&self) {
        if let Some(handler) = &self.handler {
            handler.on_event(self);
        }
    }

    /// Read up to `max` new completions.
    ///
    /// On overflow every entry read by this call is put back and an error is
    /// returned, leaving the queue for the owner to reset.
    pub fn poll(&self, max: usize) -> Result<Vec<Completion>> {
        let mut cursor = self.cursor.lock();
        let mut out = Vec::with_capacity(max.min(cursor.entries() as usize));
        while out.len() < max {
            let offset = cursor.index() as usize * CQE_SIZE as usize;
            let info = self.buf.load_acquire(offset + Cqe::INFO_OFFSET)?;
            match cursor.classify(info >> 29) {
                OwnerState::Empty => break,
                OwnerState::Overflow => {
                    cursor.rewind(out.len() as u32);
                    error!(cq = self.id, head = cursor.head(), "completion queue overflow detected");
                    CounterMetric::queue_overflow(QueueKind::Completion).emit();
                    return Err(GdmaError::QueueOverflow {
                        kind: QueueKind::Completion,
                        id: self.id,
                    });
                }
                OwnerState::Ready => {}
            }
            rmb();
            let cqe: Cqe = self.buf.read_val(offset)?;
            out.push(Completion {
                wq_num: cqe.wq_num(),
                is_sq: cqe.is_sq(),
                data: cqe.data,
            });
            cursor.advance();
        }
        trace!(cq = self.id, polled = out.len(), "polled completion queue");
        Ok(out)
    }

    /// Publish the consumer position and optionally request an interrupt for
    /// the next completion.
    pub fn ring(&self, db: &DoorbellRegion, arm: bool) {
        let tail = self.cursor.lock().doorbell_tail();
        db.ring(
            self.doorbell_id,
            QueueKind::Completion,
            DoorbellEntry::completion(self.id, tail, arm),
        );
    }
}
