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

//! Hardware channel (HWC).
//!
//! The hardware channel is a request/response transport built from one send
//! queue, one receive queue, a shared completion queue and an event queue.
//! Requests carry a message id in their envelope; the device echoes it in the
//! response, which is how a receive completion finds the waiting caller.
//!
//! ```text
//! caller ── permit ── msg id ── TX buffer[id] ── SQ ──▶ device
//!                                                        │
//! caller ◀── slot[id] ◀── RX buffer[n] ◀── RQ ◀── CQ ◀───┘
//! ```
//!
//! A request that times out gives its id back right away. If the device
//! answers later, the response lands in whatever request holds that id by then.

mod init;
mod msg;

use std::sync::Arc;
use std::time::Duration;

use spin::Mutex;
use tracing::{Span, debug, error, instrument, warn};

pub use init::{HwcParams, InitDataType, encode_eq_id_db};
pub(crate) use init::HwcInitState;
pub use msg::{
    DevId, GDMA_DEVICE_HWC, GDMA_DEVICE_MANA, GDMA_MESSAGE_V1, GDMA_STANDARD_HEADER_TYPE,
    GDMA_STATUS_MORE_ENTRIES, HwcRxOob, HwcTxOob, MsgHeader, ReqHeader, RespHeader,
};
use msg::REQ_MSG_ID_OFFSET;

use crate::config::GdmaConfig;
use crate::dispatch::Dispatcher;
use crate::doorbell::DoorbellRegion;
use crate::error::{GdmaError, Result};
use crate::mem::{DmaBuffer, DmaMemory};
use crate::metrics::{CounterMetric, EmittableMetric, HistogramMetric};
use crate::new_error;
use crate::queue::{
    CQE_SIZE, Completion, CompletionQueue, CqHandler, EQE_SIZE, EqHandler, EqMode, EventQueue,
    INLINE_OOB_LARGE_SIZE, INVALID_DMA_REGION, INVALID_QUEUE_ID, MAX_RX_WQE_SIZE,
    MAX_TX_WQE_SIZE, QueueKind, Sge, WQE_BU_SIZE, WorkQueue, WqeRequest, ring_size, wqe_size,
};
use crate::resource::ResourcePool;
use crate::shm::{HwcQueueAddrs, ShmChannel};
use crate::sync::Semaphore;

#[derive(Debug, Default)]
struct SlotState {
    /// Size of the caller's response buffer
    capacity: usize,
    response: Vec<u8>,
    status: u32,
    /// Length of a response that could not be delivered
    bad_len: Option<usize>,
}

/// Per message id completion state.
#[derive(Debug, Default)]
struct Slot {
    done: Semaphore,
    state: Mutex<SlotState>,
}

/// Returns a message id to the pool when a request ends, however it ends.
struct MsgId<'a> {
    pool: &'a ResourcePool,
    id: usize,
}

impl Drop for MsgId<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.pool.release(self.id) {
            error!(id = self.id, error = %e, "failed to release hwc message id");
        }
    }
}

/// The send/receive half of the hardware channel.
pub(crate) struct HwcCore<M: DmaMemory> {
    sq: WorkQueue<M>,
    rq: WorkQueue<M>,
    tx_bufs: DmaBuffer<M>,
    rx_bufs: DmaBuffer<M>,
    req_stride: usize,
    resp_stride: usize,
    max_request: usize,
    slots: Box<[Slot]>,
    inflight: ResourcePool,
    permits: Semaphore,
    tx_units: u32,
    rx_units: u32,
    routing: HwcTxOob,
    gpa_mkey: u32,
    timeout: Duration,
    doorbell: Arc<DoorbellRegion>,
}

/// Everything [`HwcCore`] is assembled from.
pub(crate) struct HwcCoreParts<M: DmaMemory> {
    pub sq: WorkQueue<M>,
    pub rq: WorkQueue<M>,
    pub tx_bufs: DmaBuffer<M>,
    pub rx_bufs: DmaBuffer<M>,
    pub req_stride: usize,
    pub resp_stride: usize,
    pub max_request: usize,
    pub depth: usize,
    pub cq_id: u32,
    pub params: HwcParams,
    pub timeout: Duration,
    pub doorbell: Arc<DoorbellRegion>,
}

impl<M: DmaMemory> HwcCore<M> {
    pub(crate) fn new(parts: HwcCoreParts<M>) -> Result<Self> {
        if parts.depth == 0
            || parts.tx_bufs.len() < parts.depth * parts.req_stride
            || parts.rx_bufs.len() < parts.depth * parts.resp_stride
        {
            return Err(GdmaError::InvalidArgument(format!(
                "message pools too small for {} slots",
                parts.depth
            )));
        }
        let (_, tx_size) = wqe_size(QueueKind::Send, INLINE_OOB_LARGE_SIZE as usize, 1)?;
        let (_, rx_size) = wqe_size(QueueKind::Receive, 0, 1)?;
        let routing = HwcTxOob::new(
            parts.params.pf_dest_rq_id,
            parts.params.pf_dest_cq_id,
            parts.cq_id,
            parts.sq.id(),
            false,
        );
        Ok(Self {
            routing,
            gpa_mkey: parts.params.gpa_mkey,
            slots: (0..parts.depth).map(|_| Slot::default()).collect(),
            inflight: ResourcePool::new(parts.depth),
            permits: Semaphore::new(parts.depth),
            tx_units: tx_size / WQE_BU_SIZE,
            rx_units: rx_size / WQE_BU_SIZE,
            sq: parts.sq,
            rq: parts.rq,
            tx_bufs: parts.tx_bufs,
            rx_bufs: parts.rx_bufs,
            req_stride: parts.req_stride,
            resp_stride: parts.resp_stride,
            max_request: parts.max_request,
            timeout: parts.timeout,
            doorbell: parts.doorbell,
        })
    }

    /// Number of message slots
    pub(crate) fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Requests that may be started right now without blocking
    pub(crate) fn free_permits(&self) -> usize {
        self.permits.available()
    }

    /// Message ids currently held by requests
    pub(crate) fn ids_in_use(&self) -> usize {
        self.inflight.in_use()
    }

    pub(crate) fn sq(&self) -> &WorkQueue<M> {
        &self.sq
    }

    pub(crate) fn rq(&self) -> &WorkQueue<M> {
        &self.rq
    }

    fn rx_request(&self, idx: usize) -> WqeRequest {
        let addr = self.rx_bufs.addr() + (idx * self.resp_stride) as u64;
        WqeRequest::new().sge(Sge::new(addr, self.gpa_mkey, self.resp_stride as u32))
    }

    /// Fill the receive queue with one entry per slot.
    pub(crate) fn post_initial_rx(&self) -> Result<()> {
        for idx in 0..self.depth() {
            self.rq.post(&self.rx_request(idx))?;
        }
        self.rq.ring(&self.doorbell);
        Ok(())
    }

    /// Send `req` and copy the response into `resp`.
    ///
    /// `req` must start with a [`ReqHeader`]; its message id is filled in
    /// here. Returns the response status, which is either success or
    /// [`GDMA_STATUS_MORE_ENTRIES`].
    pub(crate) fn send_request(&self, req: &[u8], resp: &mut [u8]) -> Result<u32> {
        if req.len() < size_of::<ReqHeader>() {
            return Err(GdmaError::InvalidArgument(format!(
                "request of {} bytes is shorter than its envelope",
                req.len()
            )));
        }
        if req.len() > self.max_request {
            return Err(GdmaError::RequestTooLarge(req.len(), self.max_request));
        }
        if resp.len() < size_of::<RespHeader>() {
            return Err(GdmaError::InvalidArgument(format!(
                "response buffer of {} bytes is shorter than a response envelope",
                resp.len()
            )));
        }
        let hdr: ReqHeader = bytemuck::pod_read_unaligned(&req[..size_of::<ReqHeader>()]);
        let msg_type = hdr.req.msg_type;

        HistogramMetric::time_hwc_request(msg_type, || self.round_trip(msg_type, req, resp))
    }

    fn round_trip(&self, msg_type: u32, req: &[u8], resp: &mut [u8]) -> Result<u32> {
        let _permit = self.permits.acquire();
        let id = MsgId {
            id: self.inflight.acquire()?,
            pool: &self.inflight,
        };
        let slot = &self.slots[id.id];
        slot.done.drain();
        *slot.state.lock() = SlotState {
            capacity: resp.len(),
            ..SlotState::default()
        };

        let offset = id.id * self.req_stride;
        self.tx_bufs.write(offset, req)?;
        self.tx_bufs
            .write(offset + REQ_MSG_ID_OFFSET, &(id.id as u16).to_le_bytes())?;

        let wqe = WqeRequest::new()
            .sge(Sge::new(
                self.tx_bufs.addr() + offset as u64,
                self.gpa_mkey,
                req.len() as u32,
            ))
            .inline_oob(bytemuck::bytes_of(&self.routing));
        self.sq.post_and_ring(&wqe, &self.doorbell)?;
        debug!(msg_type, msg_id = id.id, "hwc request sent");

        if !slot.done.wait_timeout(self.timeout) {
            error!(msg_type, msg_id = id.id, timeout = ?self.timeout, "hwc request timed out");
            CounterMetric::hwc_timeout(msg_type).emit();
            return Err(GdmaError::Timeout(self.timeout, "hardware channel response"));
        }

        let (response, status) = {
            let mut st = slot.state.lock();
            if let Some(len) = st.bad_len {
                return Err(GdmaError::ResponseSize {
                    len,
                    capacity: st.capacity,
                });
            }
            (std::mem::take(&mut st.response), st.status)
        };
        let Some(dst) = resp.get_mut(..response.len()) else {
            CounterMetric::hwc_protocol_error("response_size").emit();
            return Err(GdmaError::ResponseSize {
                len: response.len(),
                capacity: resp.len(),
            });
        };
        dst.copy_from_slice(&response);

        if status != 0 && status != GDMA_STATUS_MORE_ENTRIES {
            debug!(msg_type, status, "hwc request failed");
            return Err(GdmaError::ResponseStatus { msg_type, status });
        }
        Ok(status)
    }

    fn handle_tx(&self, comp: &Completion) {
        if comp.wq_num != self.sq.id() {
            warn!(wq = comp.wq_num, sq = self.sq.id(), "hwc send completion for a foreign queue");
            CounterMetric::hwc_protocol_error("foreign_sq").emit();
            return;
        }
        if let Err(e) = self.sq.advance_tail(self.tx_units) {
            error!(error = %e, "hwc send queue out of sync");
        }
    }

    fn handle_rx(&self, comp: &Completion) -> Result<()> {
        if comp.wq_num != self.rq.id() {
            warn!(wq = comp.wq_num, rq = self.rq.id(), "hwc receive completion for a foreign queue");
            CounterMetric::hwc_protocol_error("foreign_rq").emit();
            return Ok(());
        }
        let oob: HwcRxOob = comp.data_as();
        let wqe_offset = oob.wqe_offset() as usize & (self.rq.size() as usize - 1);
        let sge = self.rq.read_first_sge(wqe_offset)?;
        let idx = sge
            .addr
            .checked_sub(self.rx_bufs.addr())
            .map(|delta| (delta / self.resp_stride as u64) as usize)
            .filter(|idx| *idx < self.depth())
            .ok_or_else(|| {
                new_error!(
                    "receive entry at {:#x} points outside the message pool",
                    wqe_offset
                )
            })?;

        let buf_offset = idx * self.resp_stride;
        let hdr: RespHeader = self.rx_bufs.read_val(buf_offset)?;
        let msg_id = hdr.response.hwc_msg_id as usize;
        let len = oob.tx_oob_data_size() as usize;

        let slot = match self.inflight.is_in_use(msg_id) {
            true => Some(&self.slots[msg_id]),
            false => {
                warn!(msg_id, "hwc response for a message id that is not in flight");
                CounterMetric::hwc_protocol_error("unknown_msg_id").emit();
                None
            }
        };

        if let Some(slot) = slot {
            // Checked and stored under one lock: the id may be reused by a
            // new request with a smaller buffer at any point before this.
            let mut st = slot.state.lock();
            let capacity = st.capacity;
            if len < size_of::<RespHeader>() || len > capacity.min(self.resp_stride) {
                warn!(msg_id, len, capacity, "hwc response size invalid");
                CounterMetric::hwc_protocol_error("response_size").emit();
                st.bad_len = Some(len);
            } else {
                let mut data = vec![0u8; len];
                self.rx_bufs.read(buf_offset, &mut data)?;
                st.response = data;
                st.status = hdr.status;
            }
        }

        // The buffer goes back to the device only after the copy above.
        if let Err(e) = self.rq.advance_tail(self.rx_units) {
            error!(error = %e, "hwc receive queue out of sync");
        }
        self.rq.post_and_ring(&self.rx_request(idx), &self.doorbell)?;

        if let Some(slot) = slot {
            slot.done.post();
        }
        Ok(())
    }
}

impl<M: DmaMemory> CqHandler<M> for HwcCore<M> {
    fn on_event(&self, cq: &CompletionQueue<M>) {
        let depth = self.depth();
        loop {
            let comps = match cq.poll(depth) {
                Ok(comps) => comps,
                Err(e) => {
                    error!(cq = cq.id(), error = %e, "hwc completion queue poll failed");
                    break;
                }
            };
            for comp in &comps {
                if comp.is_sq {
                    self.handle_tx(comp);
                } else if let Err(e) = self.handle_rx(comp) {
                    error!(error = %e, "hwc receive completion dropped");
                }
            }
            if comps.len() < depth {
                break;
            }
        }
        cq.ring(&self.doorbell, true);
    }
}

/// Channel memory allocated before the handshake.
struct HwcBuffers<M: DmaMemory> {
    cq: DmaBuffer<M>,
    rq: DmaBuffer<M>,
    sq: DmaBuffer<M>,
    tx: DmaBuffer<M>,
    rx: DmaBuffer<M>,
}

/// An established hardware channel.
pub(crate) struct HwChannel<M: DmaMemory> {
    eq: Arc<EventQueue<M>>,
    cq: Arc<CompletionQueue<M>>,
    core: Arc<HwcCore<M>>,
    params: HwcParams,
}

impl<M: DmaMemory> HwChannel<M> {
    /// Allocate the channel queues, run the bootstrap handshake and wait for
    /// the device to report the channel's ids.
    ///
    /// Nothing stays registered with `dispatcher` when this fails.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub(crate) fn establish(
        mem: &Arc<M>,
        dispatcher: &Dispatcher<M>,
        shm: &ShmChannel,
        config: &GdmaConfig,
        msix: u32,
    ) -> Result<Self> {
        let depth = config.hwc_queue_depth() as u32;
        let eq_buf = DmaBuffer::new(mem.clone(), ring_size(EQE_SIZE, depth))?;
        let init = Arc::new(HwcInitState::default());
        let handler: Arc<dyn EqHandler<M>> = init.clone();
        let eq = Arc::new(EventQueue::new(
            INVALID_QUEUE_ID,
            0,
            eq_buf,
            msix,
            EqMode::Inline,
            Some(handler),
            INVALID_DMA_REGION,
        )?);
        dispatcher.register_eq(eq.clone())?;

        let result = Self::bring_up(mem, dispatcher, shm, config, eq.clone(), &init);
        if result.is_err() {
            dispatcher.deregister_eq(msix);
        }
        result
    }

    fn bring_up(
        mem: &Arc<M>,
        dispatcher: &Dispatcher<M>,
        shm: &ShmChannel,
        config: &GdmaConfig,
        eq: Arc<EventQueue<M>>,
        init: &HwcInitState,
    ) -> Result<Self> {
        let depth = config.hwc_queue_depth() as u32;
        let bufs = HwcBuffers {
            cq: DmaBuffer::new(mem.clone(), ring_size(CQE_SIZE, depth * 2))?,
            rq: DmaBuffer::new(mem.clone(), ring_size(MAX_RX_WQE_SIZE, depth))?,
            sq: DmaBuffer::new(mem.clone(), ring_size(MAX_TX_WQE_SIZE, depth))?,
            tx: DmaBuffer::new(
                mem.clone(),
                config.hwc_max_request_size() as usize * depth as usize,
            )?,
            rx: DmaBuffer::new(
                mem.clone(),
                config.hwc_max_response_size() as usize * depth as usize,
            )?,
        };

        let addrs = HwcQueueAddrs {
            eq: eq.addr(),
            cq: bufs.cq.addr(),
            rq: bufs.rq.addr(),
            sq: bufs.sq.addr(),
        };
        shm.setup_hwc(&addrs, eq.msix_index(), false)?;

        let result = Self::assemble(dispatcher, config, eq, init, bufs);
        if result.is_err() {
            if let Err(e) = shm.teardown_hwc(false) {
                warn!(error = %e, "hwc teardown after failed bring-up");
            }
        }
        result
    }

    /// Build the channel from the ids and limits the device reported.
    fn assemble(
        dispatcher: &Dispatcher<M>,
        config: &GdmaConfig,
        eq: Arc<EventQueue<M>>,
        init: &HwcInitState,
        bufs: HwcBuffers<M>,
    ) -> Result<Self> {
        let timeout = config.hwc_init_timeout();
        if !init.wait_done(timeout) {
            return Err(GdmaError::Timeout(timeout, "hardware channel init"));
        }
        let params = init.params();
        debug!(?params, "hwc init done");
        if params.cq_id >= params.max_num_cqs {
            return Err(GdmaError::Setup(format!(
                "channel completion queue {} beyond device limit of {}",
                params.cq_id, params.max_num_cqs
            )));
        }
        let q = params.queue_depth.min(config.hwc_queue_depth()) as usize;
        if q == 0 {
            return Err(GdmaError::Setup("device reported zero queue depth".into()));
        }
        let req_stride = config.hwc_max_request_size() as usize;
        let resp_stride = config.hwc_max_response_size() as usize;
        let max_request = (params.max_request as usize).min(req_stride);
        if max_request < size_of::<ReqHeader>()
            || (params.max_response as usize) < size_of::<RespHeader>()
        {
            return Err(GdmaError::Setup(format!(
                "device message limits {}/{} are below the envelope sizes",
                params.max_request, params.max_response
            )));
        }

        let table = dispatcher.init_cq_table(params.max_num_cqs as usize)?;
        let doorbell = dispatcher.doorbell().clone();
        let sq = WorkQueue::new(
            QueueKind::Send,
            params.sq_id,
            params.doorbell,
            bufs.sq,
            true,
            INVALID_DMA_REGION,
        )?;
        let rq = WorkQueue::new(
            QueueKind::Receive,
            params.rq_id,
            params.doorbell,
            bufs.rq,
            true,
            INVALID_DMA_REGION,
        )?;
        let core = Arc::new(HwcCore::new(HwcCoreParts {
            sq,
            rq,
            tx_bufs: bufs.tx,
            rx_bufs: bufs.rx,
            req_stride,
            resp_stride,
            max_request,
            depth: q,
            cq_id: params.cq_id,
            params,
            timeout: config.hwc_timeout(),
            doorbell: doorbell.clone(),
        })?);
        let handler: Arc<dyn CqHandler<M>> = core.clone();
        let cq = Arc::new(CompletionQueue::new(
            params.cq_id,
            params.doorbell,
            bufs.cq,
            Some(params.eq_id),
            Some(handler),
            INVALID_DMA_REGION,
        )?);
        table.insert(cq.clone())?;
        if let Err(e) = core.post_initial_rx() {
            table.remove(cq.id());
            return Err(e);
        }
        cq.ring(&doorbell, true);

        Ok(Self {
            eq,
            cq,
            core,
            params,
        })
    }

    pub(crate) fn core(&self) -> &Arc<HwcCore<M>> {
        &self.core
    }

    pub(crate) fn eq(&self) -> &Arc<EventQueue<M>> {
        &self.eq
    }

    pub(crate) fn cq(&self) -> &Arc<CompletionQueue<M>> {
        &self.cq
    }

    pub(crate) fn params(&self) -> &HwcParams {
        &self.params
    }

    /// Tell the firmware to drop the channel, then unhook its queues.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub(crate) fn destroy(self, dispatcher: &Dispatcher<M>, shm: &ShmChannel) -> Result<()> {
        let result = shm.teardown_hwc(false);
        if let Ok(table) = dispatcher.cq_table() {
            table.remove(self.cq.id());
        }
        dispatcher.deregister_eq(self.eq.msix_index());
        result
    }
}
