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

//! Interrupt routing.
//!
//! Each event queue is registered under its MSI-X vector. Raising a vector
//! processes that queue's events: completion events fire the callback of the
//! named completion queue, test events complete the pending [`test_eq`] probe,
//! and the bring-up sub types go to the queue's own handler.
//!
//! [`test_eq`]: crate::GdmaContext::test_eq

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use spin::RwLock;
use tracing::{debug, error, trace, warn};

use crate::doorbell::DoorbellRegion;
use crate::error::{GdmaError, Result};
use crate::mem::DmaMemory;
use crate::metrics::{CounterMetric, EmittableMetric};
use crate::queue::{
    BatchOutcome, CompletionQueue, EqMode, Event, EventQueue, EventType, INVALID_QUEUE_ID,
};
use crate::sync::Semaphore;

/// Registry of completion queues indexed by hardware id.
///
/// Sized once from the negotiated maximum; lookups take a per-slot read lock
/// that is only contended while a queue is being added or removed.
pub struct CqTable<M: DmaMemory> {
    slots: Box<[RwLock<Option<Arc<CompletionQueue<M>>>>]>,
}

impl<M: DmaMemory> CqTable<M> {
    pub fn new(max_cqs: usize) -> Self {
        Self {
            slots: (0..max_cqs).map(|_| RwLock::new(None)).collect(),
        }
    }

    /// Number of ids the table can hold
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn insert(&self, cq: Arc<CompletionQueue<M>>) -> Result<()> {
        let id = cq.id();
        let slot = self.slots.get(id as usize).ok_or_else(|| {
            GdmaError::InvalidArgument(format!(
                "completion queue id {id} outside table of {}",
                self.slots.len()
            ))
        })?;
        let mut slot = slot.write();
        if slot.is_some() {
            return Err(GdmaError::CqSlotTaken(id));
        }
        *slot = Some(cq);
        Ok(())
    }

    pub fn remove(&self, id: u32) -> Option<Arc<CompletionQueue<M>>> {
        self.slots.get(id as usize)?.write().take()
    }

    pub fn get(&self, id: u32) -> Option<Arc<CompletionQueue<M>>> {
        self.slots.get(id as usize)?.read().clone()
    }
}

/// Shared state of the test event probe.
#[derive(Debug)]
pub(crate) struct TestEventState {
    serial: Mutex<()>,
    done: Semaphore,
    eq_id: AtomicU32,
}

impl TestEventState {
    fn new() -> Self {
        Self {
            serial: Mutex::new(()),
            done: Semaphore::new(0),
            eq_id: AtomicU32::new(INVALID_QUEUE_ID),
        }
    }

    /// Start a probe. Only one probe runs at a time; stale completions from an
    /// earlier timed out probe are discarded.
    pub(crate) fn begin(&self) -> MutexGuard<'_, ()> {
        let guard = self.serial.lock().unwrap_or_else(PoisonError::into_inner);
        let stale = self.done.drain();
        if stale > 0 {
            debug!(stale, "discarded stale test events");
        }
        self.eq_id.store(INVALID_QUEUE_ID, Ordering::Release);
        guard
    }

    /// Wait for the probe's event, returning the queue it arrived on.
    pub(crate) fn wait(&self, timeout: Duration) -> Option<u32> {
        self.done
            .wait_timeout(timeout)
            .then(|| self.eq_id.load(Ordering::Acquire))
    }

    fn complete(&self, eq_id: u32) {
        self.eq_id.store(eq_id, Ordering::Release);
        self.done.post();
    }
}

pub(crate) enum WorkItem<M: DmaMemory> {
    Poll(Arc<EventQueue<M>>),
    Shutdown,
}

/// Routes interrupts to event queues and events to their consumers.
pub(crate) struct Dispatcher<M: DmaMemory> {
    cq_table: OnceLock<CqTable<M>>,
    eqs: Box<[RwLock<Option<Arc<EventQueue<M>>>>]>,
    doorbell: Arc<DoorbellRegion>,
    batch_size: u32,
    test_event: TestEventState,
    work_tx: Sender<WorkItem<M>>,
}

impl<M: DmaMemory> Dispatcher<M> {
    /// Create a dispatcher for `num_msix` vectors along with the receiving end
    /// of its deferred work queue.
    pub(crate) fn new(
        doorbell: Arc<DoorbellRegion>,
        num_msix: usize,
        batch_size: u32,
    ) -> (Arc<Self>, Receiver<WorkItem<M>>) {
        let (work_tx, work_rx) = crossbeam_channel::unbounded();
        let dispatcher = Arc::new(Self {
            cq_table: OnceLock::new(),
            eqs: (0..num_msix).map(|_| RwLock::new(None)).collect(),
            doorbell,
            batch_size,
            test_event: TestEventState::new(),
            work_tx,
        });
        (dispatcher, work_rx)
    }

    pub(crate) fn doorbell(&self) -> &Arc<DoorbellRegion> {
        &self.doorbell
    }

    pub(crate) fn test_event(&self) -> &TestEventState {
        &self.test_event
    }

    /// Size the completion queue table the first time the hardware channel
    /// learns the device's limit. Later channels reuse the table as long as it
    /// is large enough.
    pub(crate) fn init_cq_table(&self, max_cqs: usize) -> Result<&CqTable<M>> {
        let table = self.cq_table.get_or_init(|| CqTable::new(max_cqs));
        if table.len() < max_cqs {
            return Err(GdmaError::Setup(format!(
                "completion queue table holds {} queues, device reports {max_cqs}",
                table.len()
            )));
        }
        Ok(table)
    }

    pub(crate) fn cq_table(&self) -> Result<&CqTable<M>> {
        self.cq_table
            .get()
            .ok_or_else(|| GdmaError::Setup("completion queue table not initialized".into()))
    }

    pub(crate) fn register_eq(&self, eq: Arc<EventQueue<M>>) -> Result<()> {
        let msix = eq.msix_index();
        let slot = self.eqs.get(msix as usize).ok_or_else(|| {
            GdmaError::InvalidArgument(format!("MSI-X index {msix} out of range"))
        })?;
        let mut slot = slot.write();
        if slot.is_some() {
            return Err(GdmaError::InvalidArgument(format!(
                "MSI-X index {msix} already has an event queue"
            )));
        }
        *slot = Some(eq);
        Ok(())
    }

    pub(crate) fn deregister_eq(&self, msix: u32) -> Option<Arc<EventQueue<M>>> {
        self.eqs.get(msix as usize)?.write().take()
    }

    /// Handle an interrupt on `msix`.
    pub(crate) fn raise(&self, msix: u32) {
        let eq = self
            .eqs
            .get(msix as usize)
            .and_then(|slot| slot.read().clone());
        let Some(eq) = eq else {
            warn!(msix, "interrupt without a registered event queue");
            return;
        };
        match eq.mode() {
            EqMode::Inline => loop {
                match self.process(&eq) {
                    Some(BatchOutcome::Pending) => continue,
                    _ => break,
                }
            },
            EqMode::Deferred => {
                if self.work_tx.send(WorkItem::Poll(eq)).is_err() {
                    error!(msix, "event worker is gone; interrupt dropped");
                }
            }
        }
    }

    /// Run one bounded batch over `eq`.
    fn process(&self, eq: &EventQueue<M>) -> Option<BatchOutcome> {
        match eq.process_batch(&self.doorbell, self.batch_size, |eq, event| {
            self.route(eq, event)
        }) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(eq = eq.id(), error = %e, "event queue processing failed");
                None
            }
        }
    }

    fn route(&self, eq: &EventQueue<M>, event: &Event) {
        match event.kind {
            EventType::Completion => {
                let cq_id = event.details[0] & 0xFF_FFFF;
                let cq = self.cq_table.get().and_then(|table| table.get(cq_id));
                match cq {
                    Some(cq) if cq.id() == cq_id => {
                        if cq.parent_eq().is_some_and(|parent| parent != eq.id()) {
                            warn!(cq = cq_id, eq = eq.id(), "completion event on foreign event queue");
                        }
                        cq.notify();
                    }
                    _ => {
                        warn!(cq = cq_id, eq = eq.id(), "completion event for unknown queue");
                        CounterMetric::hwc_protocol_error("unknown_cq").emit();
                    }
                }
            }
            EventType::TestEvent => {
                trace!(eq = eq.id(), "test event");
                self.test_event.complete(eq.id());
            }
            EventType::HwcInitEqIdDb | EventType::HwcInitData | EventType::HwcInitDone => {
                match eq.handler() {
                    Some(handler) => handler.on_event(eq, event),
                    None => warn!(eq = eq.id(), kind = ?event.kind, "bring-up event without a handler"),
                }
            }
            EventType::Unknown(code) => {
                debug!(eq = eq.id(), code, "ignoring unknown event type");
            }
        }
    }

    fn send_shutdown(&self) {
        let _ = self.work_tx.send(WorkItem::Shutdown);
    }
}

/// Cloneable entry point the platform interrupt glue calls.
pub struct InterruptRouter<M: DmaMemory> {
    dispatcher: Arc<Dispatcher<M>>,
}

impl<M: DmaMemory> Clone for InterruptRouter<M> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<M: DmaMemory> InterruptRouter<M> {
    pub(crate) fn new(dispatcher: Arc<Dispatcher<M>>) -> Self {
        Self { dispatcher }
    }

    /// Signal that MSI-X vector `msix` fired.
    pub fn raise(&self, msix: u32) {
        self.dispatcher.raise(msix)
    }
}

/// Thread processing deferred event queues one batch at a time.
pub(crate) struct EqWorker<M: DmaMemory> {
    dispatcher: Arc<Dispatcher<M>>,
    handle: Option<JoinHandle<()>>,
}

impl<M: DmaMemory> EqWorker<M> {
    pub(crate) fn start(dispatcher: Arc<Dispatcher<M>>, rx: Receiver<WorkItem<M>>) -> Result<Self> {
        let worker = dispatcher.clone();
        let handle = thread::Builder::new()
            .name("mana-eq-worker".to_string())
            .spawn(move || {
                debug!("event worker started");
                while let Ok(item) = rx.recv() {
                    match item {
                        WorkItem::Poll(eq) => {
                            if worker.process(&eq) == Some(BatchOutcome::Pending) {
                                let _ = worker.work_tx.send(WorkItem::Poll(eq));
                            }
                        }
                        WorkItem::Shutdown => break,
                    }
                }
                debug!("event worker stopped");
            })
            .map_err(|e| GdmaError::Setup(format!("failed to spawn event worker: {e}")))?;
        Ok(Self {
            dispatcher,
            handle: Some(handle),
        })
    }
}

impl<M: DmaMemory> Drop for EqWorker<M> {
    fn drop(&mut self) {
        self.dispatcher.send_shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("event worker panicked");
            }
        }
    }
}
