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

//! The per-function GDMA context: hardware channel ownership, management
//! requests and the lifecycle of data path queues.

use std::sync::{Arc, Mutex, MutexGuard};

use bytemuck::{Zeroable, bytes_of, bytes_of_mut};
use tracing::{Span, debug, instrument, warn};

use crate::config::GdmaConfig;
use crate::dispatch::{Dispatcher, EqWorker, InterruptRouter};
use crate::doorbell::DoorbellRegion;
use crate::error::{GdmaError, Result};
use crate::hwc::{DevId, GDMA_DEVICE_HWC, HwChannel, HwcCore, HwcParams, RespHeader};
use crate::mem::{DmaBuffer, DmaMemory, DmaRegion, Mmio, PAGE_SIZE};
use crate::new_error;
use crate::queue::{
    Completion, CompletionQueue, CqHandler, EqHandler, EqMode, EventQueue, QueueKind, WorkQueue,
    WqeInfo, WqeRequest,
};
use crate::requests::{
    CreateDmaRegionReq, CreateDmaRegionResp, CreateQueueReq, DeregisterDeviceReq,
    DestroyDmaRegionReq, DisableQueueReq, GdmaRequest, GenerateTestEqeReq, ListDevicesReq,
    QueryMaxResourcesReq, QueryMaxResourcesResp, RegisterDeviceReq,
};
use crate::resource::ResourcePool;
use crate::shm::ShmChannel;

/// A device registered through the hardware channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GdmaDevice {
    pub dev_id: DevId,
    /// Protection domain the device's queues are created in
    pub pdid: u32,
    /// Memory key covering guest physical memory
    pub gpa_mkey: u32,
    /// Doorbell page assigned to the device
    pub doorbell: u32,
}

/// What to create with [`GdmaContext::create_queue`].
pub enum QueueSpec<M: DmaMemory> {
    Send {
        size: usize,
    },
    Receive {
        size: usize,
    },
    Completion {
        size: usize,
        /// Event queue signalled when entries arrive
        eq: Arc<EventQueue<M>>,
        handler: Option<Arc<dyn CqHandler<M>>>,
    },
    Event {
        size: usize,
        mode: EqMode,
        handler: Option<Arc<dyn EqHandler<M>>>,
    },
}

impl<M: DmaMemory> QueueSpec<M> {
    pub fn kind(&self) -> QueueKind {
        match self {
            QueueSpec::Send { .. } => QueueKind::Send,
            QueueSpec::Receive { .. } => QueueKind::Receive,
            QueueSpec::Completion { .. } => QueueKind::Completion,
            QueueSpec::Event { .. } => QueueKind::Event,
        }
    }

    /// Ring size in bytes
    pub fn size(&self) -> usize {
        match self {
            QueueSpec::Send { size }
            | QueueSpec::Receive { size }
            | QueueSpec::Completion { size, .. }
            | QueueSpec::Event { size, .. } => *size,
        }
    }
}

/// The typed queue behind a [`Queue`].
pub enum QueueHandle<M: DmaMemory> {
    Work(Arc<WorkQueue<M>>),
    Completion(Arc<CompletionQueue<M>>),
    Event(Arc<EventQueue<M>>),
}

/// A hardware queue created through [`GdmaContext::create_queue`].
pub struct Queue<M: DmaMemory> {
    dev_id: DevId,
    handle: QueueHandle<M>,
}

impl<M: DmaMemory> std::fmt::Debug for Queue<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .field("dev_id", &self.dev_id)
            .finish()
    }
}

impl<M: DmaMemory> Queue<M> {
    pub fn kind(&self) -> QueueKind {
        match &self.handle {
            QueueHandle::Work(wq) => wq.kind(),
            QueueHandle::Completion(_) => QueueKind::Completion,
            QueueHandle::Event(_) => QueueKind::Event,
        }
    }

    /// Hardware id of the queue
    pub fn id(&self) -> u32 {
        match &self.handle {
            QueueHandle::Work(wq) => wq.id(),
            QueueHandle::Completion(cq) => cq.id(),
            QueueHandle::Event(eq) => eq.id(),
        }
    }

    pub fn dev_id(&self) -> DevId {
        self.dev_id
    }

    pub fn handle(&self) -> &QueueHandle<M> {
        &self.handle
    }

    pub fn as_work(&self) -> Option<&Arc<WorkQueue<M>>> {
        match &self.handle {
            QueueHandle::Work(wq) => Some(wq),
            _ => None,
        }
    }

    pub fn as_completion(&self) -> Option<&Arc<CompletionQueue<M>>> {
        match &self.handle {
            QueueHandle::Completion(cq) => Some(cq),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&Arc<EventQueue<M>>> {
        match &self.handle {
            QueueHandle::Event(eq) => Some(eq),
            _ => None,
        }
    }

    fn gdma_region(&self) -> u64 {
        match &self.handle {
            QueueHandle::Work(wq) => wq.gdma_region(),
            QueueHandle::Completion(cq) => cq.gdma_region(),
            QueueHandle::Event(eq) => eq.gdma_region(),
        }
    }
}

/// Run `undo` when `result` is an error.
fn or_undo<T>(result: Result<T>, undo: impl FnOnce()) -> Result<T> {
    if result.is_err() {
        undo();
    }
    result
}

/// Owns the hardware channel of one GDMA function and everything created
/// through it.
pub struct GdmaContext<M: DmaMemory> {
    mem: Arc<M>,
    config: GdmaConfig,
    shm: ShmChannel,
    dispatcher: Arc<Dispatcher<M>>,
    msix: ResourcePool,
    hwc: Mutex<Option<HwChannel<M>>>,
    // Declared last so the worker stops after everything above is released.
    _worker: EqWorker<M>,
}

impl<M: DmaMemory> std::fmt::Debug for GdmaContext<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GdmaContext")
            .field("config", &self.config)
            .field("shm", &self.shm)
            .field("msix_in_use", &self.msix.in_use())
            .field("hwc", &self.hwc.try_lock().map(|h| h.is_some()).ok())
            .finish()
    }
}

impl<M: DmaMemory> GdmaContext<M> {
    /// Discover the doorbell pages and bootstrap region from the BAR and
    /// start the deferred event worker. No device traffic happens yet.
    pub fn new(mem: Arc<M>, mmio: Arc<dyn Mmio>, config: GdmaConfig) -> Result<Self> {
        let doorbell = Arc::new(DoorbellRegion::from_registers(mmio.clone()));
        let shm = ShmChannel::from_registers(mmio, config.bootstrap_timeout());
        debug!(?doorbell, ?shm, "gdma context");
        let (dispatcher, work_rx) = Dispatcher::new(
            doorbell,
            config.num_msix() as usize,
            config.eq_batch_size() as u32,
        );
        let worker = EqWorker::start(dispatcher.clone(), work_rx)?;
        Ok(Self {
            mem,
            config,
            shm,
            msix: ResourcePool::new(config.num_msix() as usize),
            dispatcher,
            hwc: Mutex::new(None),
            _worker: worker,
        })
    }

    pub fn config(&self) -> &GdmaConfig {
        &self.config
    }

    /// Handle the platform's interrupt glue calls on every MSI-X interrupt.
    pub fn interrupts(&self) -> InterruptRouter<M> {
        InterruptRouter::new(self.dispatcher.clone())
    }

    pub fn doorbell(&self) -> &DoorbellRegion {
        self.dispatcher.doorbell()
    }

    /// MSI-X vectors currently assigned to event queues
    pub fn msix_in_use(&self) -> usize {
        self.msix.in_use()
    }

    fn channel(&self) -> Result<MutexGuard<'_, Option<HwChannel<M>>>> {
        self.hwc
            .lock()
            .map_err(|e| new_error!("Error locking at {}:{}: {}", file!(), line!(), e))
    }

    /// Bring up the hardware channel and check that its event queue delivers.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn create_hw_channel(&self) -> Result<()> {
        let mut hwc = self.channel()?;
        if hwc.is_some() {
            return Err(GdmaError::InvalidArgument(
                "hardware channel already established".into(),
            ));
        }
        let msix = self.msix.acquire()? as u32;
        let channel = match HwChannel::establish(
            &self.mem,
            &self.dispatcher,
            &self.shm,
            &self.config,
            msix,
        ) {
            Ok(channel) => channel,
            Err(e) => {
                let _ = self.msix.release(msix as usize);
                return Err(e);
            }
        };
        let eq = channel.eq().clone();
        let core = channel.core().clone();
        *hwc = Some(channel);
        drop(hwc);

        if let Err(e) = self.test_eq_with(&core, &eq) {
            warn!(error = %e, "hardware channel event queue test failed");
            if let Err(e) = self.destroy_hw_channel() {
                warn!(error = %e, "hardware channel teardown failed");
            }
            return Err(e);
        }
        debug!(eq = eq.id(), msix, "hardware channel ready");
        Ok(())
    }

    /// Tear the hardware channel down and release its resources.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn destroy_hw_channel(&self) -> Result<()> {
        let channel = self
            .channel()?
            .take()
            .ok_or_else(|| GdmaError::InvalidArgument("no hardware channel".into()))?;
        let msix = channel.eq().msix_index();
        let result = channel.destroy(&self.dispatcher, &self.shm);
        let _ = self.msix.release(msix as usize);
        result
    }

    /// Parameters the device reported for the hardware channel.
    pub fn hwc_params(&self) -> Option<HwcParams> {
        self.channel().ok()?.as_ref().map(|c| *c.params())
    }

    /// The hardware channel itself as a device.
    pub fn hwc_device(&self) -> Result<GdmaDevice> {
        let params = self.hwc_params().ok_or_else(|| {
            GdmaError::InvalidArgument("no hardware channel".into())
        })?;
        Ok(GdmaDevice {
            dev_id: DevId::new(GDMA_DEVICE_HWC, 0),
            pdid: params.pdid,
            gpa_mkey: params.gpa_mkey,
            doorbell: params.doorbell,
        })
    }

    fn core(&self) -> Result<Arc<HwcCore<M>>> {
        self.channel()?
            .as_ref()
            .map(|c| c.core().clone())
            .ok_or_else(|| GdmaError::InvalidArgument("no hardware channel".into()))
    }

    /// Send a raw request over the hardware channel and return the response
    /// status. Blocks until the response arrives or the request times out.
    pub fn send_request(&self, req: &[u8], resp: &mut [u8]) -> Result<u32> {
        self.core()?.send_request(req, resp)
    }

    /// Send a typed request and return its response.
    pub fn request<R: GdmaRequest>(&self, req: &R) -> Result<R::Response> {
        let mut resp = R::Response::zeroed();
        self.send_request(bytes_of(req), bytes_of_mut(&mut resp))?;
        Ok(resp)
    }

    pub fn query_max_resources(&self) -> Result<QueryMaxResourcesResp> {
        self.request(&QueryMaxResourcesReq::new(DevId::new(GDMA_DEVICE_HWC, 0)))
    }

    pub fn list_devices(&self) -> Result<Vec<DevId>> {
        let resp = self.request(&ListDevicesReq::new(DevId::new(GDMA_DEVICE_HWC, 0)))?;
        Ok(resp.devices().to_vec())
    }

    pub fn register_device(&self, dev_id: DevId) -> Result<GdmaDevice> {
        let resp = self.request(&RegisterDeviceReq::new(dev_id))?;
        debug!(?dev_id, pdid = resp.pdid, db = resp.db_id, "device registered");
        Ok(GdmaDevice {
            dev_id,
            pdid: resp.pdid,
            gpa_mkey: resp.gpa_mkey,
            doorbell: resp.db_id,
        })
    }

    pub fn deregister_device(&self, dev: &GdmaDevice) -> Result<()> {
        self.request(&DeregisterDeviceReq::new(dev.dev_id))?;
        Ok(())
    }

    /// Register `region` with the device. The page list has to fit in one
    /// request.
    pub fn create_dma_region(&self, dev: &GdmaDevice, region: DmaRegion) -> Result<u64> {
        let req = CreateDmaRegionReq::encode(dev.dev_id, region.addr, region.len as u64);
        let mut resp = CreateDmaRegionResp::zeroed();
        self.send_request(&req, bytes_of_mut(&mut resp))?;
        Ok(resp.dma_region_handle)
    }

    pub fn destroy_dma_region(&self, handle: u64) -> Result<()> {
        self.request(&DestroyDmaRegionReq::new(handle))?;
        Ok(())
    }

    /// Ask the device for a test event on `eq` and wait for it to arrive.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn test_eq(&self, eq: &EventQueue<M>) -> Result<()> {
        let core = self.core()?;
        self.test_eq_with(&core, eq)
    }

    fn test_eq_with(&self, core: &HwcCore<M>, eq: &EventQueue<M>) -> Result<()> {
        let state = self.dispatcher.test_event();
        let _serial = state.begin();
        let req = GenerateTestEqeReq::new(DevId::new(GDMA_DEVICE_HWC, 0), eq.id());
        let mut resp = RespHeader::zeroed();
        core.send_request(bytes_of(&req), bytes_of_mut(&mut resp))?;

        let timeout = self.config.test_event_timeout();
        match state.wait(timeout) {
            None => Err(GdmaError::Timeout(timeout, "test event")),
            Some(got) if got != eq.id() => Err(GdmaError::WrongTestEvent {
                expected: eq.id(),
                got,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Create a hardware queue of `spec.size()` bytes for `dev`.
    ///
    /// Every step is undone when a later one fails.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn create_queue(&self, dev: &GdmaDevice, spec: QueueSpec<M>) -> Result<Queue<M>> {
        let size = spec.size();
        if size < PAGE_SIZE || !size.is_power_of_two() {
            return Err(GdmaError::InvalidArgument(format!(
                "queue size {size} is not a power of two of at least {PAGE_SIZE}"
            )));
        }
        let buf = DmaBuffer::new(self.mem.clone(), size)?;
        let region = self.create_dma_region(dev, buf.region())?;
        let handle = or_undo(self.create_hw_queue(dev, region, buf, spec), || {
            self.destroy_region_logged(region)
        })?;
        let queue = Queue {
            dev_id: dev.dev_id,
            handle,
        };
        debug!(?queue, "queue created");
        Ok(queue)
    }

    fn create_hw_queue(
        &self,
        dev: &GdmaDevice,
        region: u64,
        buf: DmaBuffer<M>,
        spec: QueueSpec<M>,
    ) -> Result<QueueHandle<M>> {
        let kind = spec.kind();
        let mut req = CreateQueueReq::new(
            dev.dev_id,
            kind,
            dev.pdid,
            dev.doorbell,
            region,
            buf.len() as u32,
        );
        match spec {
            QueueSpec::Send { .. } | QueueSpec::Receive { .. } => {
                let id = self.request(&req)?.queue_index;
                let wq = or_undo(
                    WorkQueue::new(kind, id, dev.doorbell, buf, true, region),
                    || self.disable_logged(dev.dev_id, kind, id),
                )?;
                Ok(QueueHandle::Work(Arc::new(wq)))
            }
            QueueSpec::Completion { eq, handler, .. } => {
                req.cq_parent_eq_id = eq.id();
                let table = self.dispatcher.cq_table()?;
                let id = self.request(&req)?.queue_index;
                let undo = || self.disable_logged(dev.dev_id, kind, id);
                let cq = Arc::new(or_undo(
                    CompletionQueue::new(id, dev.doorbell, buf, Some(eq.id()), handler, region),
                    undo,
                )?);
                or_undo(table.insert(cq.clone()), undo)?;
                cq.ring(self.doorbell(), true);
                Ok(QueueHandle::Completion(cq))
            }
            QueueSpec::Event { mode, handler, .. } => {
                let msix = self.msix.acquire()? as u32;
                let release = || {
                    let _ = self.msix.release(msix as usize);
                };
                req.eq_pci_msix_index = msix;
                let id = or_undo(self.request(&req), release)?.queue_index;
                let undo = || {
                    self.disable_logged(dev.dev_id, kind, id);
                    release();
                };
                let eq = Arc::new(or_undo(
                    EventQueue::new(id, dev.doorbell, buf, msix, mode, handler, region),
                    undo,
                )?);
                or_undo(self.dispatcher.register_eq(eq.clone()), undo)?;
                eq.arm(self.doorbell());
                Ok(QueueHandle::Event(eq))
            }
        }
    }

    /// Destroy a queue created by [`create_queue`](Self::create_queue).
    ///
    /// Event queues are flushed with a test event first so no interrupt for
    /// them is still in flight.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn destroy_queue(&self, queue: Queue<M>) -> Result<()> {
        debug!(?queue, "destroying queue");
        let kind = queue.kind();
        let region = queue.gdma_region();
        match &queue.handle {
            QueueHandle::Event(eq) => {
                if let Err(e) = self.test_eq(eq) {
                    warn!(eq = eq.id(), error = %e, "event queue flush failed");
                }
                self.dispatcher.deregister_eq(eq.msix_index());
            }
            QueueHandle::Completion(cq) => {
                if let Ok(table) = self.dispatcher.cq_table() {
                    table.remove(cq.id());
                }
            }
            QueueHandle::Work(_) => {}
        }

        let disabled = self
            .request(&DisableQueueReq::new(queue.dev_id, kind, queue.id()))
            .map(|_| ());
        let destroyed = self.destroy_dma_region(region);
        if let QueueHandle::Event(eq) = &queue.handle {
            let _ = self.msix.release(eq.msix_index() as usize);
        }
        disabled.and(destroyed)
    }

    /// Post `req` to `wq` and ring its doorbell.
    pub fn post_and_ring(&self, wq: &WorkQueue<M>, req: &WqeRequest) -> Result<WqeInfo> {
        wq.post_and_ring(req, self.doorbell())
    }

    /// Reap up to `max` completions from `cq`.
    pub fn poll_completions(&self, cq: &CompletionQueue<M>, max: usize) -> Result<Vec<Completion>> {
        cq.poll(max)
    }

    /// Ask for an event on the next completion written to `cq`.
    pub fn arm_cq(&self, cq: &CompletionQueue<M>) {
        cq.ring(self.doorbell(), true)
    }

    fn disable_logged(&self, dev_id: DevId, kind: QueueKind, id: u32) {
        if let Err(e) = self.request(&DisableQueueReq::new(dev_id, kind, id)) {
            warn!(%kind, id, error = %e, "disable queue during rollback failed");
        }
    }

    fn destroy_region_logged(&self, region: u64) {
        if let Err(e) = self.destroy_dma_region(region) {
            warn!(region, error = %e, "destroy DMA region during rollback failed");
        }
    }
}

impl<M: DmaMemory> Drop for GdmaContext<M> {
    fn drop(&mut self) {
        let channel = match self.hwc.get_mut() {
            Ok(hwc) => hwc.take(),
            Err(e) => e.into_inner().take(),
        };
        if let Some(channel) = channel {
            if let Err(e) = channel.destroy(&self.dispatcher, &self.shm) {
                warn!(error = %e, "hardware channel teardown on drop failed");
            }
        }
    }
}
