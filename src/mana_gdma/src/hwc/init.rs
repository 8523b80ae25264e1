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

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use crate::mem::DmaMemory;
use crate::queue::{EqHandler, Event, EventQueue, EventType};
use crate::sync::Semaphore;

/// Sub types of an `INIT_DATA` event
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum InitDataType {
    CqId = 1,
    RqId = 2,
    SqId = 3,
    QueueDepth = 4,
    MaxRequest = 5,
    MaxResponse = 6,
    MaxNumCqs = 7,
    Pdid = 8,
    GpaMkey = 9,
    PfDestRqId = 10,
    PfDestCqId = 11,
}

impl InitDataType {
    pub fn from_code(code: u8) -> Option<Self> {
        use InitDataType::*;
        Some(match code {
            1 => CqId,
            2 => RqId,
            3 => SqId,
            4 => QueueDepth,
            5 => MaxRequest,
            6 => MaxResponse,
            7 => MaxNumCqs,
            8 => Pdid,
            9 => GpaMkey,
            10 => PfDestRqId,
            11 => PfDestCqId,
            _ => return None,
        })
    }

    /// `details[0]` of an `INIT_DATA` event: `value:24, type:8`
    pub fn encode(self, value: u32) -> u32 {
        (value & 0xFF_FFFF) | ((self as u32) << 24)
    }
}

/// `details[0]` of an `INIT_EQ_ID_DB` event: `eq_id:16, doorbell:16`
pub fn encode_eq_id_db(eq_id: u16, doorbell: u16) -> u32 {
    eq_id as u32 | ((doorbell as u32) << 16)
}

/// What the device told the driver during hardware channel bring-up.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HwcParams {
    pub eq_id: u32,
    /// Doorbell page of the hardware channel queues
    pub doorbell: u32,
    pub cq_id: u32,
    pub rq_id: u32,
    pub sq_id: u32,
    pub queue_depth: u16,
    pub max_request: u32,
    pub max_response: u32,
    pub max_num_cqs: u32,
    /// Protection domain of the hardware channel device
    pub pdid: u32,
    /// Memory key covering guest physical memory
    pub gpa_mkey: u32,
    pub pf_dest_rq_id: u32,
    pub pf_dest_cq_id: u32,
}

/// Collects bring-up events on the hardware channel event queue.
#[derive(Debug, Default)]
pub(crate) struct HwcInitState {
    params: Mutex<HwcParams>,
    done: Semaphore,
}

impl HwcInitState {
    pub(crate) fn params(&self) -> HwcParams {
        *self.params.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for `INIT_DONE`.
    pub(crate) fn wait_done(&self, timeout: Duration) -> bool {
        self.done.wait_timeout(timeout)
    }
}

impl<M: DmaMemory> EqHandler<M> for HwcInitState {
    fn on_event(&self, eq: &EventQueue<M>, event: &Event) {
        let word = event.details[0];
        let mut params = self.params.lock().unwrap_or_else(PoisonError::into_inner);
        match event.kind {
            EventType::HwcInitEqIdDb => {
                params.eq_id = word & 0xFFFF;
                params.doorbell = word >> 16;
                eq.assign(params.eq_id, params.doorbell);
                debug!(eq = params.eq_id, doorbell = params.doorbell, "hwc eq assigned");
            }
            EventType::HwcInitData => {
                let value = word & 0xFF_FFFF;
                let Some(kind) = InitDataType::from_code((word >> 24) as u8) else {
                    warn!(code = word >> 24, "unknown hwc init data type");
                    return;
                };
                match kind {
                    InitDataType::CqId => params.cq_id = value,
                    InitDataType::RqId => params.rq_id = value,
                    InitDataType::SqId => params.sq_id = value,
                    InitDataType::QueueDepth => params.queue_depth = value as u16,
                    InitDataType::MaxRequest => params.max_request = value,
                    InitDataType::MaxResponse => params.max_response = value,
                    InitDataType::MaxNumCqs => params.max_num_cqs = value,
                    InitDataType::Pdid => params.pdid = value,
                    InitDataType::GpaMkey => params.gpa_mkey = value,
                    InitDataType::PfDestRqId => params.pf_dest_rq_id = value,
                    InitDataType::PfDestCqId => params.pf_dest_cq_id = value,
                }
            }
            EventType::HwcInitDone => {
                drop(params);
                debug!("hwc init done");
                self.done.post();
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mem::PAGE_SIZE;
    use crate::mem::tests::{TestMem, ring_buffer};
    use crate::queue::{EQE_SIZE, EqMode, INVALID_QUEUE_ID};

    #[test]
    fn collects_bring_up_values() {
        let mem = TestMem::new(PAGE_SIZE);
        let eq = EventQueue::new(
            INVALID_QUEUE_ID,
            0,
            ring_buffer(&mem, 4 * EQE_SIZE as usize),
            0,
            EqMode::Inline,
            None,
            0,
        )
        .unwrap();
        let state = Arc::new(HwcInitState::default());
        let ev = |kind, word| Event {
            kind,
            details: [word, 0, 0],
        };

        let handler: &dyn EqHandler<TestMem> = state.as_ref();
        handler.on_event(&eq, &ev(EventType::HwcInitEqIdDb, encode_eq_id_db(5, 2)));
        for (kind, value) in [
            (InitDataType::CqId, 1),
            (InitDataType::RqId, 3),
            (InitDataType::SqId, 4),
            (InitDataType::QueueDepth, 16),
            (InitDataType::MaxRequest, 2048),
            (InitDataType::MaxResponse, 1024),
            (InitDataType::MaxNumCqs, 64),
            (InitDataType::GpaMkey, 0xAB),
            (InitDataType::PfDestRqId, 0x10),
            (InitDataType::PfDestCqId, 0x11),
        ] {
            handler.on_event(&eq, &ev(EventType::HwcInitData, kind.encode(value)));
        }
        handler.on_event(&eq, &ev(EventType::HwcInitData, 0x4200_0000));
        assert!(!state.wait_done(Duration::ZERO));
        handler.on_event(&eq, &ev(EventType::HwcInitDone, 0));
        assert!(state.wait_done(Duration::ZERO));

        assert_eq!((eq.id(), eq.doorbell_id()), (5, 2));
        let p = state.params();
        assert_eq!((p.cq_id, p.rq_id, p.sq_id), (1, 3, 4));
        assert_eq!(p.queue_depth, 16);
        assert_eq!((p.max_request, p.max_response), (2048, 1024));
        assert_eq!(p.max_num_cqs, 64);
        assert_eq!(p.gpa_mkey, 0xAB);
        assert_eq!((p.pf_dest_rq_id, p.pf_dest_cq_id), (0x10, 0x11));
    }
}
