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

//! A simulated GDMA function.
//!
//! [`SimDevice`] plays the firmware side of every protocol the transport
//! speaks: it exposes the BAR registers, answers the bootstrap handshake,
//! posts the bring-up events, consumes hardware channel requests from the
//! send queue and answers them through the receive queue, and keeps a table
//! of the DMA regions and queues created through management requests.
//!
//! Device work runs on its own thread, fed by doorbell and bootstrap writes.
//! Interrupts are delivered through the callback given to
//! [`SimDevice::connect_interrupts`], always with the device state unlocked.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use bytemuck::{Pod, Zeroable, bytes_of};
use crossbeam_channel::{Receiver, Sender};
use mana_gdma::doorbell::{
    DoorbellEntry, GDMA_REG_DB_PAGE_OFFSET, GDMA_REG_DB_PAGE_SIZE, GDMA_REG_SHM_OFFSET,
};
use mana_gdma::hwc::{
    DevId, GDMA_DEVICE_HWC, GDMA_DEVICE_MANA, GDMA_MESSAGE_V1, GDMA_STANDARD_HEADER_TYPE,
    HwcRxOob, InitDataType, MsgHeader, ReqHeader, RespHeader, encode_eq_id_db,
};
use mana_gdma::queue::{
    CQE_SIZE, Cqe, EQE_SIZE, Eqe, EventType, MAX_RX_WQE_SIZE, MAX_TX_WQE_SIZE, OWNER_MASK,
    QueueKind, SGE_SIZE, Sge, WQE_BU_SIZE, WQE_HEADER_SIZE, WqeHeader, ring_size,
};
use mana_gdma::requests::{
    CreateDmaRegionReq, CreateDmaRegionResp, CreateQueueReq, CreateQueueResp,
    DestroyDmaRegionReq, DisableQueueReq, GDMA_CREATE_DMA_REGION, GDMA_CREATE_QUEUE,
    GDMA_DEREGISTER_DEVICE, GDMA_DESTROY_DMA_REGION, GDMA_DISABLE_QUEUE,
    GDMA_GENERATE_TEST_EQE, GDMA_LIST_DEVICES, GDMA_QUERY_MAX_RESOURCES, GDMA_REGISTER_DEVICE,
    GenerateTestEqeReq, ListDevicesResp, QueryMaxResourcesResp, RegisterDeviceResp,
};
use mana_gdma::shm::{SmcHeader, unpack_establish};
use mana_gdma::{MemOps, Mmio};
use tracing::{debug, warn};

use crate::memory::SimMemory;

/// BAR offset of doorbell page 0
pub const DB_PAGE_BASE: u64 = 0x10_0000;
pub const DB_PAGE_SIZE: u64 = 0x1000;
pub const DB_PAGES: u64 = 16;
/// BAR offset of the bootstrap region
pub const SHM_BASE: u64 = 0x4000;

pub const HWC_EQ_ID: u32 = 2;
pub const HWC_CQ_ID: u32 = 1;
pub const HWC_RQ_ID: u32 = 3;
pub const HWC_SQ_ID: u32 = 4;
pub const HWC_DOORBELL: u32 = 0;
pub const HWC_GPA_MKEY: u32 = 7;
pub const HWC_PF_DEST_RQ_ID: u32 = 0x10;
pub const HWC_PF_DEST_CQ_ID: u32 = 0x11;

/// Id given to the first queue created through `CREATE_QUEUE`
pub const FIRST_QUEUE_ID: u32 = 16;
/// Handle of the first DMA region
pub const FIRST_REGION: u64 = 0x100;
/// What `REGISTER_DEVICE` hands out
pub const DEVICE_PDID: u32 = 5;
pub const DEVICE_GPA_MKEY: u32 = 9;
pub const DEVICE_DOORBELL: u32 = 1;

/// Status of a request the device refuses
pub const STATUS_FAILURE: u32 = 1;

const SMC_HEADER_DWORD: usize = 7;
const SMC_OWNER_BIT: u32 = 1 << 31;
const SMC_ESTABLISH: u32 = 1;
const SMC_DESTROY: u32 = 2;

/// Shape of the simulated function.
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// Queue depth reported during bring-up
    pub queue_depth: u16,
    /// Queue depth the driver sized its channel rings for
    pub ring_depth: u32,
    pub max_request: u32,
    pub max_response: u32,
    pub max_num_cqs: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            queue_depth: 4,
            ring_depth: 4,
            max_request: 4096,
            max_response: 4096,
            max_num_cqs: 64,
        }
    }
}

/// Misbehaviours the device can be told to show.
#[derive(Debug, Clone, Default)]
pub struct SimFaults {
    /// Consume requests without ever answering them
    pub drop_responses: bool,
    /// Raw header to answer the bootstrap handshake with
    pub smc_response: Option<u32>,
    /// Status to put in every response
    pub status_override: Option<u32>,
    /// Never post `INIT_DONE`
    pub skip_init_done: bool,
    /// Bytes to add to the response length reported in receive completions
    pub response_padding: u32,
    /// Answer `GENERATE_TEST_EQE` without posting the event
    pub skip_test_events: bool,
    /// Post test events on this queue instead of the requested one
    pub test_event_queue: Option<u32>,
}

/// One doorbell write seen on the BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorbellWrite {
    pub page: u32,
    pub kind: QueueKind,
    pub entry: DoorbellEntry,
}

enum DeviceEvent {
    Smc,
    Doorbell(DoorbellWrite),
    Shutdown,
}

/// Event ring the device produces into.
#[derive(Debug, Clone, Copy)]
struct EventRing {
    addr: u64,
    entries: u32,
    produced: u32,
    msix: u32,
}

impl EventRing {
    fn push(&mut self, mem: &SimMemory, kind: EventType, details: [u32; 3]) {
        let slot = self.produced % self.entries;
        let owner = (self.produced / self.entries + 1) & OWNER_MASK;
        let addr = self.addr + (slot * EQE_SIZE) as u64;
        if let Err(e) = mem.write_val(addr, Eqe::new(kind, 0, owner, details)) {
            warn!(?e, "event write failed");
        }
        self.produced = self.produced.wrapping_add(1);
    }
}

/// Completion ring the device produces into.
#[derive(Debug, Clone, Copy)]
struct CompletionRing {
    addr: u64,
    entries: u32,
    produced: u32,
    eq: u32,
}

impl CompletionRing {
    fn push(&mut self, mem: &SimMemory, wq_num: u32, is_sq: bool, data: [u32; 15]) {
        let slot = self.produced % self.entries;
        let owner = (self.produced / self.entries + 1) & OWNER_MASK;
        let addr = self.addr + (slot * CQE_SIZE) as u64;
        if let Err(e) = mem.write_val(addr, Cqe::new(wq_num, is_sq, owner, data)) {
            warn!(?e, "completion write failed");
        }
        self.produced = self.produced.wrapping_add(1);
    }
}

/// A work queue entry as the device reads it.
struct Wqe {
    offset: u32,
    header: WqeHeader,
    sge: Sge,
}

/// Work ring the device consumes from.
#[derive(Debug, Clone, Copy)]
struct WorkRing {
    addr: u64,
    size: u32,
    /// Bytes consumed, wrapping like the doorbell tail
    consumed: u32,
    tail: u32,
}

impl WorkRing {
    fn new(addr: u64, size: usize) -> Self {
        Self {
            addr,
            size: size as u32,
            consumed: 0,
            tail: 0,
        }
    }

    fn read(&self, mem: &SimMemory, offset: u32, dst: &mut [u8]) {
        let offset = offset % self.size;
        let first = dst.len().min((self.size - offset) as usize);
        let (head, rest) = dst.split_at_mut(first);
        let ok = mem.read(self.addr + offset as u64, head).is_ok()
            && (rest.is_empty() || mem.read(self.addr, rest).is_ok());
        if !ok {
            warn!(addr = self.addr, offset, "work queue read failed");
        }
    }

    fn read_val<T: Pod>(&self, mem: &SimMemory, offset: u32) -> T {
        let mut val = T::zeroed();
        self.read(mem, offset, bytemuck::bytes_of_mut(&mut val));
        val
    }

    /// Take the next posted entry, if any.
    fn next(&mut self, mem: &SimMemory) -> Option<Wqe> {
        if self.consumed == self.tail {
            return None;
        }
        let offset = self.consumed % self.size;
        let header: WqeHeader = self.read_val(mem, offset);
        let oob = header.inline_oob_size_div4() * 4;
        let sge: Sge = self.read_val(mem, offset + WQE_HEADER_SIZE + oob);
        let len = WQE_HEADER_SIZE + oob + header.num_sge() as u32 * SGE_SIZE;
        self.consumed = self
            .consumed
            .wrapping_add(len.next_multiple_of(WQE_BU_SIZE));
        Some(Wqe {
            offset,
            header,
            sge,
        })
    }
}

#[derive(Debug)]
struct HwcRings {
    sq: WorkRing,
    rq: WorkRing,
}

struct DeviceState {
    hwc: Option<HwcRings>,
    eqs: HashMap<u32, EventRing>,
    cqs: HashMap<u32, CompletionRing>,
    wqs: HashMap<u32, QueueKind>,
    regions: HashMap<u64, Vec<u64>>,
    next_region: u64,
    next_queue: u32,
    /// Responses waiting for a receive buffer, with the length to report
    pending_rx: VecDeque<(Vec<u8>, u32)>,
    served: Vec<u32>,
    smc: Vec<SmcHeader>,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            hwc: None,
            eqs: HashMap::new(),
            cqs: HashMap::new(),
            wqs: HashMap::new(),
            regions: HashMap::new(),
            next_region: FIRST_REGION,
            next_queue: FIRST_QUEUE_ID,
            pending_rx: VecDeque::new(),
            served: Vec::new(),
            smc: Vec::new(),
        }
    }

    fn event(
        &mut self,
        mem: &SimMemory,
        eq_id: u32,
        kind: EventType,
        details: [u32; 3],
        irqs: &mut Vec<u32>,
    ) -> bool {
        let Some(eq) = self.eqs.get_mut(&eq_id) else {
            warn!(eq_id, "event for unknown queue");
            return false;
        };
        eq.push(mem, kind, details);
        if !irqs.contains(&eq.msix) {
            irqs.push(eq.msix);
        }
        true
    }

    fn complete(
        &mut self,
        mem: &SimMemory,
        cq_id: u32,
        wq_num: u32,
        is_sq: bool,
        data: [u32; 15],
        irqs: &mut Vec<u32>,
    ) -> bool {
        let Some(cq) = self.cqs.get_mut(&cq_id) else {
            warn!(cq_id, "completion for unknown queue");
            return false;
        };
        cq.push(mem, wq_num, is_sq, data);
        let eq = cq.eq;
        self.event(mem, eq, EventType::Completion, [cq_id, 0, 0], irqs)
    }

    /// Serve one management request. Returns the status, the response with
    /// room for its envelope, and a queue to post a test event on.
    fn handle(&mut self, msg_type: u32, req: &[u8]) -> (u32, Vec<u8>, Option<u32>) {
        let header_only = || vec![0u8; size_of::<RespHeader>()];
        let fail = (STATUS_FAILURE, header_only(), None);
        match msg_type {
            GDMA_QUERY_MAX_RESOURCES => {
                let resp = QueryMaxResourcesResp {
                    max_sq: 64,
                    max_rq: 64,
                    max_cq: 64,
                    max_eq: 32,
                    max_db: DB_PAGES as u32,
                    max_msix: 64,
                    ..Default::default()
                };
                (0, bytes_of(&resp).to_vec(), None)
            }
            GDMA_LIST_DEVICES => {
                let mut resp = ListDevicesResp::zeroed();
                resp.num_of_devs = 2;
                resp.devs[0] = DevId::new(GDMA_DEVICE_HWC, 0);
                resp.devs[1] = DevId::new(GDMA_DEVICE_MANA, 0);
                (0, bytes_of(&resp).to_vec(), None)
            }
            GDMA_REGISTER_DEVICE => {
                let resp = RegisterDeviceResp {
                    pdid: DEVICE_PDID,
                    gpa_mkey: DEVICE_GPA_MKEY,
                    db_id: DEVICE_DOORBELL,
                    ..Default::default()
                };
                (0, bytes_of(&resp).to_vec(), None)
            }
            GDMA_DEREGISTER_DEVICE => (0, header_only(), None),
            GDMA_GENERATE_TEST_EQE => match read::<GenerateTestEqeReq>(req) {
                Some(r) if self.eqs.contains_key(&r.queue_index) => {
                    (0, header_only(), Some(r.queue_index))
                }
                _ => fail,
            },
            GDMA_CREATE_DMA_REGION => {
                let Some((fixed, pages)) = CreateDmaRegionReq::decode(req) else {
                    return fail;
                };
                if pages.is_empty() || pages.len() != fixed.page_count as usize {
                    return fail;
                }
                let handle = self.next_region;
                self.next_region += 1;
                self.regions.insert(handle, pages);
                let resp = CreateDmaRegionResp {
                    dma_region_handle: handle,
                    ..Default::default()
                };
                (0, bytes_of(&resp).to_vec(), None)
            }
            GDMA_DESTROY_DMA_REGION => match read::<DestroyDmaRegionReq>(req) {
                Some(r) if self.regions.remove(&r.dma_region_handle).is_some() => {
                    (0, header_only(), None)
                }
                _ => fail,
            },
            GDMA_CREATE_QUEUE => {
                let Some(r) = read::<CreateQueueReq>(req) else {
                    return fail;
                };
                let addr = self.regions.get(&r.gdma_region).and_then(|p| p.first());
                let (Some(&addr), Some(kind)) = (addr, QueueKind::from_code(r.queue_type)) else {
                    return fail;
                };
                let id = self.next_queue;
                self.next_queue += 1;
                match kind {
                    QueueKind::Event => {
                        let ring = EventRing {
                            addr,
                            entries: r.queue_size / EQE_SIZE,
                            produced: 0,
                            msix: r.eq_pci_msix_index,
                        };
                        self.eqs.insert(id, ring);
                    }
                    QueueKind::Completion => {
                        let ring = CompletionRing {
                            addr,
                            entries: r.queue_size / CQE_SIZE,
                            produced: 0,
                            eq: r.cq_parent_eq_id,
                        };
                        self.cqs.insert(id, ring);
                    }
                    QueueKind::Send | QueueKind::Receive => {
                        self.wqs.insert(id, kind);
                    }
                }
                debug!(%kind, id, "queue created");
                let resp = CreateQueueResp {
                    queue_index: id,
                    ..Default::default()
                };
                (0, bytes_of(&resp).to_vec(), None)
            }
            GDMA_DISABLE_QUEUE => {
                let Some(r) = read::<DisableQueueReq>(req) else {
                    return fail;
                };
                let removed = match QueueKind::from_code(r.queue_type) {
                    Some(QueueKind::Event) => self.eqs.remove(&r.queue_index).is_some(),
                    Some(QueueKind::Completion) => self.cqs.remove(&r.queue_index).is_some(),
                    Some(QueueKind::Send | QueueKind::Receive) => {
                        self.wqs.remove(&r.queue_index).is_some()
                    }
                    None => false,
                };
                if removed { (0, header_only(), None) } else { fail }
            }
            _ => {
                warn!(msg_type, "unsupported request");
                fail
            }
        }
    }
}

fn read<T: Pod>(bytes: &[u8]) -> Option<T> {
    bytemuck::try_pod_read_unaligned(bytes.get(..size_of::<T>())?).ok()
}

type InterruptFn = Arc<dyn Fn(u32) + Send + Sync>;

struct Inner {
    mem: Arc<SimMemory>,
    config: SimConfig,
    shm: Mutex<[u32; 8]>,
    state: Mutex<DeviceState>,
    faults: Mutex<SimFaults>,
    interrupts: Mutex<Option<InterruptFn>>,
    doorbells: Mutex<Vec<DoorbellWrite>>,
    events: Sender<DeviceEvent>,
}

impl Inner {
    fn faults(&self) -> SimFaults {
        self.faults.lock().unwrap().clone()
    }

    fn raise(&self, irqs: &[u32]) {
        let Some(f) = self.interrupts.lock().unwrap().clone() else {
            if !irqs.is_empty() {
                warn!(?irqs, "interrupts dropped, nothing connected");
            }
            return;
        };
        for msix in irqs {
            f(*msix);
        }
    }

    fn run(&self, rx: Receiver<DeviceEvent>) {
        while let Ok(event) = rx.recv() {
            let irqs = match event {
                DeviceEvent::Smc => self.handle_smc(),
                DeviceEvent::Doorbell(db) => self.handle_doorbell(db),
                DeviceEvent::Shutdown => break,
            };
            self.raise(&irqs);
        }
    }

    fn handle_smc(&self) -> Vec<u32> {
        let dwords = *self.shm.lock().unwrap();
        let (addrs, msix, hdr) = unpack_establish(&dwords);
        let faults = self.faults();
        let mut irqs = Vec::new();
        let mut st = self.state.lock().unwrap();
        st.smc.push(hdr);
        debug!(msg_type = hdr.msg_type(), "bootstrap message");

        let accepted = faults.smc_response.is_none()
            && matches!(hdr.msg_type(), SMC_ESTABLISH | SMC_DESTROY);
        if accepted && hdr.msg_type() == SMC_ESTABLISH {
            let depth = self.config.ring_depth;
            st.hwc = Some(HwcRings {
                sq: WorkRing::new(addrs.sq, ring_size(MAX_TX_WQE_SIZE, depth)),
                rq: WorkRing::new(addrs.rq, ring_size(MAX_RX_WQE_SIZE, depth)),
            });
            let eq = EventRing {
                addr: addrs.eq,
                entries: ring_size(EQE_SIZE, depth) as u32 / EQE_SIZE,
                produced: 0,
                msix: msix as u32,
            };
            st.eqs.insert(HWC_EQ_ID, eq);
            let cq = CompletionRing {
                addr: addrs.cq,
                entries: ring_size(CQE_SIZE, depth * 2) as u32 / CQE_SIZE,
                produced: 0,
                eq: HWC_EQ_ID,
            };
            st.cqs.insert(HWC_CQ_ID, cq);
        } else if accepted {
            st.hwc = None;
            st.eqs.remove(&HWC_EQ_ID);
            st.cqs.remove(&HWC_CQ_ID);
            st.pending_rx.clear();
        }

        let status = if accepted { 0 } else { 1 };
        let response = faults
            .smc_response
            .unwrap_or(SmcHeader::response(hdr.msg_type(), 0, status).0);
        self.shm.lock().unwrap()[SMC_HEADER_DWORD] = response;

        if accepted && hdr.msg_type() == SMC_ESTABLISH {
            self.post_init_events(&mut st, &faults, &mut irqs);
        }
        irqs
    }

    fn post_init_events(&self, st: &mut DeviceState, faults: &SimFaults, irqs: &mut Vec<u32>) {
        let mem = &self.mem;
        let cfg = &self.config;
        st.event(
            mem,
            HWC_EQ_ID,
            EventType::HwcInitEqIdDb,
            [encode_eq_id_db(HWC_EQ_ID as u16, HWC_DOORBELL as u16), 0, 0],
            irqs,
        );
        for (kind, value) in [
            (InitDataType::CqId, HWC_CQ_ID),
            (InitDataType::RqId, HWC_RQ_ID),
            (InitDataType::SqId, HWC_SQ_ID),
            (InitDataType::QueueDepth, cfg.queue_depth as u32),
            (InitDataType::MaxRequest, cfg.max_request),
            (InitDataType::MaxResponse, cfg.max_response),
            (InitDataType::MaxNumCqs, cfg.max_num_cqs),
            (InitDataType::Pdid, 0),
            (InitDataType::GpaMkey, HWC_GPA_MKEY),
            (InitDataType::PfDestRqId, HWC_PF_DEST_RQ_ID),
            (InitDataType::PfDestCqId, HWC_PF_DEST_CQ_ID),
        ] {
            st.event(mem, HWC_EQ_ID, EventType::HwcInitData, [kind.encode(value), 0, 0], irqs);
        }
        if !faults.skip_init_done {
            st.event(mem, HWC_EQ_ID, EventType::HwcInitDone, [0; 3], irqs);
        }
    }

    fn handle_doorbell(&self, db: DoorbellWrite) -> Vec<u32> {
        let mut irqs = Vec::new();
        if db.page != HWC_DOORBELL {
            return irqs;
        }
        let mut st = self.state.lock().unwrap();
        let id = db.entry.id(db.kind);
        let tail = db.entry.tail(db.kind);
        match (db.kind, st.hwc.as_mut()) {
            (QueueKind::Receive, Some(hwc)) if id == HWC_RQ_ID => {
                hwc.rq.tail = tail;
                self.flush_responses(&mut st, &mut irqs);
            }
            (QueueKind::Send, Some(hwc)) if id == HWC_SQ_ID => {
                hwc.sq.tail = tail;
                self.serve_requests(&mut st, &mut irqs);
            }
            _ => {}
        }
        irqs
    }

    fn serve_requests(&self, st: &mut DeviceState, irqs: &mut Vec<u32>) {
        let faults = self.faults();
        loop {
            let Some(wqe) = st.hwc.as_mut().and_then(|hwc| hwc.sq.next(&self.mem)) else {
                return;
            };
            if wqe.header.num_sge() == 0 {
                warn!(offset = wqe.offset, "request without a buffer");
                continue;
            }
            let req = self
                .mem
                .read_vec(wqe.sge.addr, wqe.sge.size as usize)
                .unwrap_or_default();
            st.complete(&self.mem, HWC_CQ_ID, HWC_SQ_ID, true, [0; 15], irqs);
            if faults.drop_responses || req.len() < size_of::<ReqHeader>() {
                continue;
            }

            let hdr: ReqHeader = bytemuck::pod_read_unaligned(&req[..size_of::<ReqHeader>()]);
            let msg_type = hdr.req.msg_type;
            st.served.push(msg_type);
            let (status, mut resp, test_eq) = st.handle(msg_type, &req);

            let mut envelope = MsgHeader::zeroed();
            envelope.hdr_type = GDMA_STANDARD_HEADER_TYPE;
            envelope.msg_type = msg_type;
            envelope.msg_version = GDMA_MESSAGE_V1;
            envelope.hwc_msg_id = hdr.req.hwc_msg_id;
            envelope.msg_size = resp.len() as u32;
            let resp_hdr = RespHeader {
                response: envelope,
                dev_id: hdr.dev_id,
                activity_id: hdr.activity_id,
                status: faults.status_override.unwrap_or(status),
                reserved: 0,
            };
            resp[..size_of::<RespHeader>()].copy_from_slice(bytes_of(&resp_hdr));
            let claimed = resp.len() as u32 + faults.response_padding;
            st.pending_rx.push_back((resp, claimed));
            self.flush_responses(st, irqs);

            if let Some(eq) = test_eq.filter(|_| !faults.skip_test_events) {
                let target = faults.test_event_queue.unwrap_or(eq);
                st.event(&self.mem, target, EventType::TestEvent, [0; 3], irqs);
            }
        }
    }

    /// Deliver queued responses into posted receive buffers.
    fn flush_responses(&self, st: &mut DeviceState, irqs: &mut Vec<u32>) {
        while !st.pending_rx.is_empty() {
            let Some(wqe) = st.hwc.as_mut().and_then(|hwc| hwc.rq.next(&self.mem)) else {
                return;
            };
            let Some((resp, claimed)) = st.pending_rx.pop_front() else {
                return;
            };
            let len = resp.len().min(wqe.sge.size as usize);
            if let Err(e) = self.mem.write(wqe.sge.addr, &resp[..len]) {
                warn!(?e, "response write failed");
            }
            let oob = HwcRxOob::new(HWC_SQ_ID, wqe.offset, claimed);
            st.complete(&self.mem, HWC_CQ_ID, HWC_RQ_ID, false, oob.to_cqe_data(), irqs);
        }
    }
}

/// The BAR of a [`SimDevice`].
struct SimBar {
    inner: Arc<Inner>,
}

impl SimBar {
    fn shm_index(offset: u64) -> Option<usize> {
        (SHM_BASE..SHM_BASE + 32)
            .contains(&offset)
            .then(|| ((offset - SHM_BASE) / 4) as usize)
    }
}

impl Mmio for SimBar {
    fn read32(&self, offset: u64) -> u32 {
        match offset {
            GDMA_REG_DB_PAGE_OFFSET => DB_PAGE_BASE as u32,
            o if o == GDMA_REG_DB_PAGE_OFFSET + 4 => (DB_PAGE_BASE >> 32) as u32,
            GDMA_REG_DB_PAGE_SIZE => DB_PAGE_SIZE as u32,
            GDMA_REG_SHM_OFFSET => SHM_BASE as u32,
            o if o == GDMA_REG_SHM_OFFSET + 4 => (SHM_BASE >> 32) as u32,
            o => match Self::shm_index(o) {
                Some(idx) => self.inner.shm.lock().unwrap()[idx],
                None => 0,
            },
        }
    }

    fn write32(&self, offset: u64, val: u32) {
        let Some(idx) = Self::shm_index(offset) else {
            warn!(offset, val, "unexpected 32-bit write");
            return;
        };
        self.inner.shm.lock().unwrap()[idx] = val;
        if idx == SMC_HEADER_DWORD && val & SMC_OWNER_BIT != 0 {
            let _ = self.inner.events.send(DeviceEvent::Smc);
        }
    }

    fn write64(&self, offset: u64, val: u64) {
        let end = DB_PAGE_BASE + DB_PAGES * DB_PAGE_SIZE;
        if !(DB_PAGE_BASE..end).contains(&offset) {
            warn!(offset, val, "unexpected 64-bit write");
            return;
        }
        let rel = offset - DB_PAGE_BASE;
        let kind = match rel % DB_PAGE_SIZE {
            0x000 => QueueKind::Send,
            0x400 => QueueKind::Receive,
            0x800 => QueueKind::Completion,
            0xFF8 => QueueKind::Event,
            other => {
                warn!(other, "write to an unknown doorbell");
                return;
            }
        };
        let write = DoorbellWrite {
            page: (rel / DB_PAGE_SIZE) as u32,
            kind,
            entry: DoorbellEntry::from(val),
        };
        self.inner.doorbells.lock().unwrap().push(write);
        let _ = self.inner.events.send(DeviceEvent::Doorbell(write));
    }
}

/// A simulated GDMA function.
pub struct SimDevice {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl SimDevice {
    pub fn new(mem: Arc<SimMemory>) -> Self {
        Self::with_config(mem, SimConfig::default())
    }

    pub fn with_config(mem: Arc<SimMemory>, config: SimConfig) -> Self {
        let (events, rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(Inner {
            mem,
            config,
            shm: Mutex::new([0; 8]),
            state: Mutex::new(DeviceState::new()),
            faults: Mutex::new(SimFaults::default()),
            interrupts: Mutex::new(None),
            doorbells: Mutex::new(Vec::new()),
            events,
        });
        let worker = inner.clone();
        let thread = thread::Builder::new()
            .name("sim-device".to_string())
            .spawn(move || worker.run(rx))
            .unwrap();
        Self {
            inner,
            thread: Some(thread),
        }
    }

    /// Register access for the driver under test.
    pub fn bar(&self) -> Arc<dyn Mmio> {
        Arc::new(SimBar {
            inner: self.inner.clone(),
        })
    }

    pub fn memory(&self) -> &Arc<SimMemory> {
        &self.inner.mem
    }

    /// Deliver interrupts to `f`, which gets the MSI-X index.
    pub fn connect_interrupts(&self, f: impl Fn(u32) + Send + Sync + 'static) {
        *self.inner.interrupts.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn set_faults(&self, faults: SimFaults) {
        *self.inner.faults.lock().unwrap() = faults;
    }

    /// Doorbell writes seen so far, oldest first.
    pub fn doorbells(&self) -> Vec<DoorbellWrite> {
        self.inner.doorbells.lock().unwrap().clone()
    }

    /// Message types of the requests answered so far.
    pub fn served(&self) -> Vec<u32> {
        self.inner.state.lock().unwrap().served.clone()
    }

    /// Bootstrap headers received so far.
    pub fn smc_log(&self) -> Vec<SmcHeader> {
        self.inner.state.lock().unwrap().smc.clone()
    }

    pub fn hwc_established(&self) -> bool {
        self.inner.state.lock().unwrap().hwc.is_some()
    }

    /// Queues created through `CREATE_QUEUE` and not yet disabled.
    pub fn queue_count(&self) -> usize {
        let st = self.inner.state.lock().unwrap();
        let eqs = st.eqs.keys().filter(|id| **id != HWC_EQ_ID).count();
        let cqs = st.cqs.keys().filter(|id| **id != HWC_CQ_ID).count();
        eqs + cqs + st.wqs.len()
    }

    pub fn region_count(&self) -> usize {
        self.inner.state.lock().unwrap().regions.len()
    }

    /// MSI-X index an event queue was created with.
    pub fn eq_msix(&self, eq_id: u32) -> Option<u32> {
        self.inner.state.lock().unwrap().eqs.get(&eq_id).map(|eq| eq.msix)
    }

    /// Write a completion for `wq_num` into `cq_id`, post the completion
    /// event on its parent queue and raise the interrupt.
    pub fn inject_completion(&self, cq_id: u32, wq_num: u32, is_sq: bool, data: [u32; 15]) -> bool {
        let mut irqs = Vec::new();
        let done = self.inner.state.lock().unwrap().complete(
            &self.inner.mem,
            cq_id,
            wq_num,
            is_sq,
            data,
            &mut irqs,
        );
        self.inner.raise(&irqs);
        done
    }

    /// Post an arbitrary event on `eq_id` and raise the interrupt.
    pub fn inject_event(&self, eq_id: u32, kind: EventType, details: [u32; 3]) -> bool {
        let mut irqs = Vec::new();
        let done =
            self.inner
                .state
                .lock()
                .unwrap()
                .event(&self.inner.mem, eq_id, kind, details, &mut irqs);
        self.inner.raise(&irqs);
        done
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        // The callback usually holds the driver, which holds our BAR.
        self.inner.interrupts.lock().unwrap().take();
        let _ = self.inner.events.send(DeviceEvent::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
