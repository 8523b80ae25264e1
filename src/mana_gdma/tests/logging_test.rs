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

use std::time::Duration;

use log::Level;
use mana_gdma::GdmaError;
use mana_testing::SimFaults;
use mana_testing::logger::{LOGGER, SimpleLogger};

pub mod common;
use common::{test_config, with_channel_cfg};

// A single test so the records of one scenario never interleave with another.
#[test]
fn transport_failures_are_logged() {
    SimpleLogger::initialize_test_logger();
    let mut cfg = test_config();
    cfg.set_hwc_timeout(Duration::from_millis(100));
    with_channel_cfg(cfg, |h| {
        LOGGER.clear_log_calls();
        h.dev.set_faults(SimFaults {
            drop_responses: true,
            ..Default::default()
        });
        let err = h.ctx.query_max_resources().unwrap_err();
        assert!(matches!(err, GdmaError::Timeout(_, _)));
        let calls = LOGGER.find(Level::Error, "timed out");
        assert_eq!(calls.len(), 1);
        assert!(calls[0].target.starts_with("mana_gdma::hwc"));

        LOGGER.clear_log_calls();
        h.dev.set_faults(SimFaults {
            response_padding: 64,
            ..Default::default()
        });
        let err = h.ctx.query_max_resources().unwrap_err();
        assert!(matches!(err, GdmaError::ResponseSize { .. }));
        assert_eq!(
            LOGGER.find(Level::Warn, "hwc response size invalid").len(),
            1
        );

        h.dev.set_faults(SimFaults::default());
        LOGGER.clear_log_calls();
        h.ctx.query_max_resources().unwrap();
        LOGGER.test_log_records(|calls| {
            assert!(calls.iter().all(|c| c.level > Level::Warn));
        });
    });
}
