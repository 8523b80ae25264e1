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
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mana_gdma::hwc::{DevId, GDMA_DEVICE_MANA};
use mana_gdma::queue::{CompletionQueue, CqHandler, EqMode, QueueKind, Sge, WqeRequest};
use mana_gdma::requests::{GDMA_CREATE_DMA_REGION, GDMA_CREATE_QUEUE};
use mana_gdma::{GdmaDevice, GdmaError, PAGE_SIZE, QueueSpec};
use mana_testing::SimFaults;
use mana_testing::SimMemory;
use mana_testing::device::{FIRST_QUEUE_ID, HWC_EQ_ID};

pub mod common;
use common::{Harness, test_config, wait_until, with_channel, with_channel_cfg};

fn mana_device(h: &Harness) -> GdmaDevice {
    h.ctx
        .register_device(DevId::new(GDMA_DEVICE_MANA, 0))
        .unwrap()
}

fn event_spec(mode: EqMode) -> QueueSpec<SimMemory> {
    QueueSpec::Event {
        size: PAGE_SIZE,
        mode,
        handler: None,
    }
}

#[test]
fn deferred_queues_deliver_completions() {
    with_channel(|h| {
        let dev = mana_device(h);
        let pages = h.dev.memory().pages_in_use();

        let eq_queue = h.ctx.create_queue(&dev, event_spec(EqMode::Deferred)).unwrap();
        let eq = eq_queue.as_event().unwrap().clone();
        assert_eq!(eq.id(), FIRST_QUEUE_ID);
        assert_eq!(h.dev.eq_msix(eq.id()), Some(eq.msix_index()));
        assert_eq!(h.ctx.msix_in_use(), 2);

        let (tx, rx) = crossbeam_channel::unbounded();
        let handler: Arc<dyn CqHandler<SimMemory>> =
            Arc::new(move |cq: &CompletionQueue<SimMemory>| {
                for comp in cq.poll(16).unwrap() {
                    tx.send(comp).unwrap();
                }
            });
        let cq_queue = h
            .ctx
            .create_queue(
                &dev,
                QueueSpec::Completion {
                    size: PAGE_SIZE,
                    eq: eq.clone(),
                    handler: Some(handler),
                },
            )
            .unwrap();
        let cq = cq_queue.as_completion().unwrap().clone();
        assert_eq!(cq.parent_eq(), Some(eq.id()));

        let sq_queue = h
            .ctx
            .create_queue(&dev, QueueSpec::Send { size: PAGE_SIZE })
            .unwrap();
        let sq = sq_queue.as_work().unwrap().clone();
        assert_eq!(sq_queue.kind(), QueueKind::Send);
        assert_eq!(h.dev.queue_count(), 3);
        assert_eq!(h.dev.region_count(), 3);

        let req = WqeRequest::new()
            .inline_oob(&[0xAB; 8])
            .sge(Sge::new(0x1000, dev.gpa_mkey, 64));
        let info = h.ctx.post_and_ring(&sq, &req).unwrap();
        assert_eq!(info.size_in_bu, 1);
        let rung = h
            .dev
            .doorbells()
            .into_iter()
            .rev()
            .find(|db| db.page == dev.doorbell && db.kind == QueueKind::Send)
            .unwrap();
        assert_eq!(rung.entry.id(QueueKind::Send), sq.id());
        assert_eq!(rung.entry.tail(QueueKind::Send), 32);

        let mut data = [0u32; 15];
        data[0] = 0xFEED;
        assert!(h.dev.inject_completion(cq.id(), sq.id(), true, data));
        let comp = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(comp.wq_num, sq.id());
        assert!(comp.is_sq);
        assert_eq!(comp.data[0], 0xFEED);
        sq.advance_tail(info.size_in_bu).unwrap();
        h.ctx.arm_cq(&cq);
        assert!(h.ctx.poll_completions(&cq, 4).unwrap().is_empty());

        drop((eq, cq, sq));
        h.ctx.destroy_queue(sq_queue).unwrap();
        h.ctx.destroy_queue(cq_queue).unwrap();
        h.ctx.destroy_queue(eq_queue).unwrap();
        assert_eq!(h.dev.queue_count(), 0);
        assert_eq!(h.dev.region_count(), 0);
        assert_eq!(h.ctx.msix_in_use(), 1);
        assert!(wait_until(|| h.dev.memory().pages_in_use() == pages));
    });
}

#[test]
fn inline_queue_runs_the_handler_in_interrupt_context() {
    with_channel(|h| {
        let dev = mana_device(h);
        let eq_queue = h.ctx.create_queue(&dev, event_spec(EqMode::Inline)).unwrap();
        let eq = eq_queue.as_event().unwrap().clone();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handler: Arc<dyn CqHandler<SimMemory>> =
            Arc::new(move |cq: &CompletionQueue<SimMemory>| {
                let n = cq.poll(16).unwrap().len();
                counter.fetch_add(n, Ordering::SeqCst);
            });
        let cq_queue = h
            .ctx
            .create_queue(
                &dev,
                QueueSpec::Completion {
                    size: PAGE_SIZE,
                    eq,
                    handler: Some(handler),
                },
            )
            .unwrap();

        for i in 1..=3 {
            assert!(h.dev.inject_completion(cq_queue.id(), 99, false, [0; 15]));
            assert_eq!(seen.load(Ordering::SeqCst), i);
        }
        // unknown queue ids are dropped by the device model itself
        assert!(!h.dev.inject_completion(63, 99, false, [0; 15]));

        h.ctx.destroy_queue(cq_queue).unwrap();
        h.ctx.destroy_queue(eq_queue).unwrap();
    });
}

#[test]
fn test_event_must_arrive_on_the_requested_queue() {
    let mut cfg = test_config();
    cfg.set_test_event_timeout(Duration::from_millis(200));
    with_channel_cfg(cfg, |h| {
        let dev = mana_device(h);
        let eq_queue = h.ctx.create_queue(&dev, event_spec(EqMode::Deferred)).unwrap();
        let eq = eq_queue.as_event().unwrap().clone();
        h.ctx.test_eq(&eq).unwrap();

        h.dev.set_faults(SimFaults {
            test_event_queue: Some(HWC_EQ_ID),
            ..Default::default()
        });
        match h.ctx.test_eq(&eq) {
            Err(GdmaError::WrongTestEvent { expected, got }) => {
                assert_eq!(expected, eq.id());
                assert_eq!(got, HWC_EQ_ID);
            }
            other => panic!("unexpected {other:?}"),
        }

        h.dev.set_faults(SimFaults {
            skip_test_events: true,
            ..Default::default()
        });
        assert!(matches!(h.ctx.test_eq(&eq), Err(GdmaError::Timeout(_, _))));

        // the flush failing does not stop the teardown
        h.ctx.destroy_queue(eq_queue).unwrap();
        assert_eq!(h.dev.queue_count(), 0);
        assert_eq!(h.ctx.msix_in_use(), 1);
    });
}

#[test]
fn bad_queue_size_is_refused_before_any_request() {
    with_channel(|h| {
        let dev = mana_device(h);
        let served = h.dev.served().len();
        for size in [1000, PAGE_SIZE / 2, 3 * PAGE_SIZE] {
            let err = h
                .ctx
                .create_queue(&dev, QueueSpec::Receive { size })
                .unwrap_err();
            assert!(matches!(err, GdmaError::InvalidArgument(_)));
        }
        assert_eq!(h.dev.served().len(), served);
    });
}

#[test]
fn failed_create_is_rolled_back() {
    let mut cfg = test_config();
    // the hardware channel takes the only vector
    cfg.set_num_msix(1);
    with_channel_cfg(cfg, |h| {
        let dev = mana_device(h);
        let err = h
            .ctx
            .create_queue(&dev, event_spec(EqMode::Deferred))
            .unwrap_err();
        assert!(matches!(err, GdmaError::PoolExhausted(_)), "{err}");
        assert_eq!(h.dev.region_count(), 0);
        assert_eq!(h.dev.queue_count(), 0);
        assert!(h.dev.served().contains(&GDMA_CREATE_DMA_REGION));
        assert!(!h.dev.served().contains(&GDMA_CREATE_QUEUE));
    });
}
