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

use smallvec::SmallVec;
use spin::Mutex;
use tracing::{trace, warn};

use super::desc::{Sge, WqeFlags, WqeHeader, WqeRequest};
use super::{
    INLINE_OOB_LARGE_SIZE, INLINE_OOB_SMALL_SIZE, MAX_RX_WQE_SIZE, MAX_TX_WQE_SIZE, QueueKind,
    SGE_SIZE, WQE_BU_SIZE, WQE_HEADER_SIZE,
};
use crate::doorbell::{DoorbellEntry, DoorbellRegion};
use crate::error::{GdmaError, Result};
use crate::mem::{DmaBuffer, DmaMemory};

/// Result of posting a work request.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WqeInfo {
    /// Size of the posted entry in basic units
    pub size_in_bu: u32,
}

/// Size of an entry for `kind` with the given inline OOB length and SGE count.
///
/// Returns `(oob_size, entry_size)` in bytes. Send queues take an 8 or 24 byte
/// OOB block; receive queues take none from the caller and always reserve 8.
pub fn wqe_size(kind: QueueKind, inline_oob_len: usize, num_sge: usize) -> Result<(u32, u32)> {
    if num_sge == 0 {
        return Err(GdmaError::InvalidArgument(
            "work request without scatter/gather entries".to_string(),
        ));
    }
    if num_sge > u8::MAX as usize {
        return Err(GdmaError::InvalidArgument(format!(
            "{num_sge} scatter/gather entries"
        )));
    }
    let (oob_size, max) = match kind {
        QueueKind::Receive => {
            if inline_oob_len != 0 {
                return Err(GdmaError::InvalidArgument(format!(
                    "receive request with {inline_oob_len} byte inline OOB"
                )));
            }
            (INLINE_OOB_SMALL_SIZE, MAX_RX_WQE_SIZE)
        }
        QueueKind::Send => {
            let len = inline_oob_len as u32;
            if len != INLINE_OOB_SMALL_SIZE && len != INLINE_OOB_LARGE_SIZE {
                return Err(GdmaError::InvalidArgument(format!(
                    "send request with {inline_oob_len} byte inline OOB"
                )));
            }
            (len, MAX_TX_WQE_SIZE)
        }
        QueueKind::Completion | QueueKind::Event => {
            return Err(GdmaError::InvalidArgument(format!(
                "cannot post work requests to a {kind} queue"
            )));
        }
    };
    let sgl_size = num_sge as u32 * SGE_SIZE;
    let size = (WQE_HEADER_SIZE + oob_size + sgl_size).next_multiple_of(WQE_BU_SIZE);
    if size > max {
        return Err(GdmaError::WqeTooLarge(size, max));
    }
    Ok((oob_size, size))
}

#[derive(Debug, Default)]
struct WqState {
    /// Producer position in basic units
    head: u32,
    /// Consumer position in basic units
    tail: u32,
    /// Entries posted since the last doorbell
    pending: u32,
}

/// A send or receive queue.
///
/// `head` and `tail` count 32-byte basic units and grow without bound (mod 2^32);
/// the ring offset is `head * 32 mod size`.
#[derive(Debug)]
pub struct WorkQueue<M: DmaMemory> {
    kind: QueueKind,
    id: u32,
    doorbell_id: u32,
    buf: DmaBuffer<M>,
    monitor_avail: bool,
    gdma_region: u64,
    state: Mutex<WqState>,
}

impl<M: DmaMemory> WorkQueue<M> {
    /// Wrap `buf` as a work queue the device knows as `id`.
    ///
    /// With `monitor_avail`, posting fails instead of overwriting entries the
    /// device has not completed.
    pub fn new(
        kind: QueueKind,
        id: u32,
        doorbell_id: u32,
        buf: DmaBuffer<M>,
        monitor_avail: bool,
        gdma_region: u64,
    ) -> Result<Self> {
        if !matches!(kind, QueueKind::Send | QueueKind::Receive) {
            return Err(GdmaError::InvalidArgument(format!(
                "{kind} is not a work queue kind"
            )));
        }
        let size = buf.len();
        if !size.is_power_of_two() || size < WQE_BU_SIZE as usize || size > u32::MAX as usize {
            return Err(GdmaError::InvalidArgument(format!(
                "work queue size {size} is not a power of two"
            )));
        }
        Ok(Self {
            kind,
            id,
            doorbell_id,
            buf,
            monitor_avail,
            gdma_region,
            state: Mutex::new(WqState::default()),
        })
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Hardware id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Doorbell page used by this queue
    pub fn doorbell_id(&self) -> u32 {
        self.doorbell_id
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

    /// Producer position in basic units
    pub fn head(&self) -> u32 {
        self.state.lock().head
    }

    /// Consumer position in basic units
    pub fn tail(&self) -> u32 {
        self.state.lock().tail
    }

    fn avail(&self, st: &WqState) -> u32 {
        let used = st.head.wrapping_sub(st.tail).wrapping_mul(WQE_BU_SIZE);
        self.size().saturating_sub(used)
    }

    /// Free ring space in bytes
    pub fn available_space(&self) -> u32 {
        self.avail(&self.state.lock())
    }

    /// Ring offset in bytes of the entry starting at basic unit `bu`
    pub fn wqe_offset(&self, bu: u32) -> usize {
        (bu.wrapping_mul(WQE_BU_SIZE) & (self.size() - 1)) as usize
    }

    /// Lay out `req` at the head of the ring.
    pub fn post(&self, req: &WqeRequest) -> Result<WqeInfo> {
        let (oob_size, size) = wqe_size(self.kind, req.inline_oob.len(), req.sgl.len())?;

        let oob_in_sgl = req.flags.contains(WqeFlags::OOB_IN_SGL);
        let last_vbytes = match req.flags.contains(WqeFlags::PAD_BY_SGE0) && oob_in_sgl {
            true => req.sgl[0].size as u8,
            false => 0,
        };
        if oob_in_sgl && (!req.flags.contains(WqeFlags::PAD_BY_SGE0) || req.sgl.len() < 2) {
            warn!(queue = self.id, "OOB in SGL without a padding SGE");
        }
        let cdu = match self.kind {
            QueueKind::Send => req.client_data_unit,
            _ => 0,
        };
        let header = WqeHeader::new(
            req.sgl.len() as u8,
            oob_size,
            oob_in_sgl,
            last_vbytes,
            cdu,
        );

        let mut bytes: SmallVec<[u8; 512]> = SmallVec::new();
        bytes.extend_from_slice(bytemuck::bytes_of(&header));
        bytes.extend_from_slice(&req.inline_oob);
        bytes.resize((WQE_HEADER_SIZE + oob_size) as usize, 0);
        bytes.extend_from_slice(bytemuck::cast_slice::<Sge, u8>(&req.sgl));

        let mut st = self.state.lock();
        if self.monitor_avail {
            let available = self.avail(&st);
            if size > available {
                return Err(GdmaError::RingFull {
                    needed: size,
                    available,
                });
            }
        }
        let offset = self.wqe_offset(st.head);
        self.buf.write_wrapped(offset, &bytes)?;

        let size_in_bu = size / WQE_BU_SIZE;
        st.head = st.head.wrapping_add(size_in_bu);
        st.pending += 1;
        trace!(queue = self.id, kind = %self.kind, head = st.head, size, "posted wqe");
        Ok(WqeInfo { size_in_bu })
    }

    /// Retire `units` basic units after the device completed them.
    pub fn advance_tail(&self, units: u32) -> Result<()> {
        let mut st = self.state.lock();
        let outstanding = st.head.wrapping_sub(st.tail);
        if units > outstanding {
            return Err(GdmaError::TailOverrun {
                head: st.head,
                tail: st.tail,
                units,
            });
        }
        st.tail = st.tail.wrapping_add(units);
        Ok(())
    }

    /// Tell the device about every entry posted so far.
    pub fn ring(&self, db: &DoorbellRegion) {
        let mut st = self.state.lock();
        let tail = st.head.wrapping_mul(WQE_BU_SIZE);
        let entry = match self.kind {
            QueueKind::Receive => {
                DoorbellEntry::receive(self.id, st.pending.min(u8::MAX as u32) as u8, tail)
            }
            _ => DoorbellEntry::send(self.id, tail),
        };
        st.pending = 0;
        db.ring(self.doorbell_id, self.kind, entry);
    }

    /// Post `req` and ring the doorbell.
    pub fn post_and_ring(&self, req: &WqeRequest, db: &DoorbellRegion) -> Result<WqeInfo> {
        let info = self.post(req)?;
        self.ring(db);
        Ok(info)
    }

    /// Read back the header of the entry at ring offset `offset`.
    pub fn read_header(&self, offset: usize) -> Result<WqeHeader> {
        let mut hdr = WqeHeader::default();
        self.buf
            .read_wrapped(offset, bytemuck::bytes_of_mut(&mut hdr))?;
        Ok(hdr)
    }

    /// Read the first scatter/gather entry of the entry at ring offset `offset`.
    pub fn read_first_sge(&self, offset: usize) -> Result<Sge> {
        let hdr = self.read_header(offset)?;
        let sge_offset = offset + (WQE_HEADER_SIZE + hdr.inline_oob_size_div4() * 4) as usize;
        let mut sge = Sge::default();
        self.buf
            .read_wrapped(sge_offset, bytemuck::bytes_of_mut(&mut sge))?;
        Ok(sge)
    }
}
