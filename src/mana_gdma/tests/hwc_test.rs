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

use std::thread;
use std::time::{Duration, Instant};

use bytemuck::{bytes_of, bytes_of_mut};
use mana_gdma::hwc::{DevId, GDMA_DEVICE_HWC, GDMA_DEVICE_MANA, GDMA_STATUS_MORE_ENTRIES};
use mana_gdma::requests::{
    GDMA_GENERATE_TEST_EQE, GDMA_LIST_DEVICES, GDMA_QUERY_MAX_RESOURCES, GDMA_REGISTER_DEVICE,
    QueryMaxResourcesReq, QueryMaxResourcesResp,
};
use mana_gdma::shm::SmcHeader;
use mana_gdma::{ErrorClass, GdmaError};
use mana_testing::device::{
    DEVICE_DOORBELL, DEVICE_PDID, HWC_CQ_ID, HWC_EQ_ID, HWC_GPA_MKEY, HWC_RQ_ID, HWC_SQ_ID,
};
use mana_testing::{SimConfig, SimFaults};

pub mod common;
use common::{new_harness, test_config, with_channel, with_channel_cfg};

#[test]
fn bring_up_reports_device_parameters() {
    with_channel(|h| {
        let params = h.ctx.hwc_params().unwrap();
        assert_eq!(params.eq_id, HWC_EQ_ID);
        assert_eq!(params.cq_id, HWC_CQ_ID);
        assert_eq!(params.rq_id, HWC_RQ_ID);
        assert_eq!(params.sq_id, HWC_SQ_ID);
        assert_eq!(params.queue_depth, 4);
        assert_eq!(params.gpa_mkey, HWC_GPA_MKEY);

        let smc = h.dev.smc_log();
        assert_eq!(smc.len(), 1);
        assert_eq!(smc[0].msg_type(), 1);
        assert!(smc[0].owner_is_pf());

        // the channel's own event queue was checked with a test event
        assert_eq!(h.dev.served(), vec![GDMA_GENERATE_TEST_EQE]);
        assert_eq!(h.ctx.msix_in_use(), 1);
    });
}

#[test]
fn management_requests() {
    with_channel(|h| {
        let limits = h.ctx.query_max_resources().unwrap();
        assert_eq!(limits.max_msix, 64);
        assert_eq!(limits.max_cq, 64);

        let devs = h.ctx.list_devices().unwrap();
        assert_eq!(
            devs,
            vec![DevId::new(GDMA_DEVICE_HWC, 0), DevId::new(GDMA_DEVICE_MANA, 0)]
        );

        let dev = h.ctx.register_device(devs[1]).unwrap();
        assert_eq!(dev.pdid, DEVICE_PDID);
        assert_eq!(dev.doorbell, DEVICE_DOORBELL);
        h.ctx.deregister_device(&dev).unwrap();

        let served = h.dev.served();
        assert_eq!(
            &served[1..4],
            &[GDMA_QUERY_MAX_RESOURCES, GDMA_LIST_DEVICES, GDMA_REGISTER_DEVICE]
        );
    });
}

#[test]
fn silent_device_times_out_and_frees_the_slot() {
    let mut cfg = test_config();
    cfg.set_hwc_timeout(Duration::from_millis(100));
    with_channel_cfg(cfg, |h| {
        h.dev.set_faults(SimFaults {
            drop_responses: true,
            ..Default::default()
        });

        // more timeouts than there are slots, each failing on its own timer
        for _ in 0..6 {
            let start = Instant::now();
            let err = h.ctx.query_max_resources().unwrap_err();
            assert!(matches!(err, GdmaError::Timeout(_, _)));
            assert_eq!(err.class(), ErrorClass::Timeout);
            assert!(start.elapsed() < Duration::from_secs(2));
        }

        // every slot timing out at once
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| assert!(h.ctx.list_devices().is_err()));
            }
        });

        h.dev.set_faults(SimFaults::default());
        assert_eq!(h.ctx.list_devices().unwrap().len(), 2);
    });
}

#[test]
fn rejected_bootstrap_leaves_no_channel() {
    let faults = SimFaults {
        // a response for the destroy message
        smc_response: Some(SmcHeader::response(2, 0, 0).0),
        ..Default::default()
    };
    let h = new_harness(test_config(), SimConfig::default(), faults);

    let err = h.ctx.create_hw_channel().unwrap_err();
    assert!(matches!(err, GdmaError::BootstrapRejected(_)), "{err}");
    assert_eq!(err.class(), ErrorClass::Protocol);
    assert!(h.ctx.hwc_params().is_none());
    assert_eq!(h.ctx.msix_in_use(), 0);
    assert!(!h.dev.hwc_established());
    assert!(h.ctx.list_devices().is_err());

    h.dev.set_faults(SimFaults::default());
    h.ctx.create_hw_channel().unwrap();
    assert_eq!(h.ctx.list_devices().unwrap().len(), 2);
}

#[test]
fn incomplete_bring_up_times_out_and_tears_down() {
    let mut cfg = test_config();
    cfg.set_hwc_init_timeout(Duration::from_millis(200));
    let faults = SimFaults {
        skip_init_done: true,
        ..Default::default()
    };
    let h = new_harness(cfg, SimConfig::default(), faults);

    let err = h.ctx.create_hw_channel().unwrap_err();
    assert!(matches!(err, GdmaError::Timeout(_, _)), "{err}");
    let smc: Vec<u32> = h.dev.smc_log().iter().map(|hdr| hdr.msg_type()).collect();
    assert_eq!(smc, vec![1, 2]);
    assert!(!h.dev.hwc_established());
    assert_eq!(h.ctx.msix_in_use(), 0);
}

#[test]
fn error_status_fails_the_request() {
    with_channel(|h| {
        h.dev.set_faults(SimFaults {
            status_override: Some(0x42),
            ..Default::default()
        });
        match h.ctx.query_max_resources() {
            Err(GdmaError::ResponseStatus { msg_type, status }) => {
                assert_eq!(msg_type, GDMA_QUERY_MAX_RESOURCES);
                assert_eq!(status, 0x42);
            }
            other => panic!("unexpected {other:?}"),
        }
    });
}

#[test]
fn more_entries_status_is_success() {
    with_channel(|h| {
        h.dev.set_faults(SimFaults {
            status_override: Some(GDMA_STATUS_MORE_ENTRIES),
            ..Default::default()
        });
        let req = QueryMaxResourcesReq::new(DevId::new(GDMA_DEVICE_HWC, 0));
        let mut resp = QueryMaxResourcesResp::default();
        let status = h
            .ctx
            .send_request(bytes_of(&req), bytes_of_mut(&mut resp))
            .unwrap();
        assert_eq!(status, GDMA_STATUS_MORE_ENTRIES);
        assert_eq!(resp.hdr.status, GDMA_STATUS_MORE_ENTRIES);
        assert_eq!(resp.max_msix, 64);
    });
}

#[test]
fn oversized_response_is_rejected() {
    with_channel(|h| {
        h.dev.set_faults(SimFaults {
            response_padding: 64,
            ..Default::default()
        });
        let err = h.ctx.query_max_resources().unwrap_err();
        match err {
            GdmaError::ResponseSize { len, capacity } => {
                assert_eq!(capacity, size_of::<QueryMaxResourcesResp>());
                assert_eq!(len, capacity + 64);
            }
            other => panic!("unexpected {other:?}"),
        }

        h.dev.set_faults(SimFaults::default());
        h.ctx.query_max_resources().unwrap();
    });
}

#[test]
fn oversized_request_is_refused_up_front() {
    with_channel(|h| {
        let mut req = vec![0u8; 5000];
        req[..size_of::<QueryMaxResourcesReq>()]
            .copy_from_slice(bytes_of(&QueryMaxResourcesReq::new(DevId::default())));
        let mut resp = QueryMaxResourcesResp::default();
        let err = h
            .ctx
            .send_request(&req, bytes_of_mut(&mut resp))
            .unwrap_err();
        assert!(matches!(err, GdmaError::RequestTooLarge(5000, 4096)));
        assert_eq!(err.class(), ErrorClass::Admission);
        assert_eq!(h.dev.served(), vec![GDMA_GENERATE_TEST_EQE]);
    });
}

#[test]
fn concurrent_callers_share_the_channel() {
    with_channel(|h| {
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..10 {
                        assert_eq!(h.ctx.list_devices().unwrap().len(), 2);
                    }
                });
            }
        });
        assert_eq!(h.dev.served().len(), 81);
    });
}

#[test]
fn channel_can_be_destroyed_and_recreated() {
    with_channel(|h| {
        h.ctx.destroy_hw_channel().unwrap();
        assert!(!h.dev.hwc_established());
        assert_eq!(h.ctx.msix_in_use(), 0);
        assert!(matches!(
            h.ctx.list_devices(),
            Err(GdmaError::InvalidArgument(_))
        ));
        assert!(h.ctx.destroy_hw_channel().is_err());

        h.ctx.create_hw_channel().unwrap();
        assert!(h.dev.hwc_established());
        assert_eq!(h.ctx.list_devices().unwrap().len(), 2);
        assert!(h.ctx.create_hw_channel().is_err());
    });
}
