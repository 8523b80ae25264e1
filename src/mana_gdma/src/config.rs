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

use std::cmp::{max, min};
use std::time::Duration;

use tracing::{Span, instrument};

/// Clamp a millisecond duration into `[lo, hi]`, mapping zero to `default`.
fn clamp_millis(value: Duration, default: u32, lo: u32, hi: u32) -> u32 {
    match value.as_millis() {
        0 => default,
        1.. => min(hi.into(), max(value.as_millis(), lo.into())) as u32,
    }
}

/// Tunables for a [`GdmaContext`](crate::GdmaContext)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GdmaConfig {
    /// How long a hardware channel request waits for its response, in milliseconds.
    hwc_timeout: u32,
    /// How long bring-up waits for the device to report the channel ids, in milliseconds.
    hwc_init_timeout: u32,
    /// How long an event queue test waits for its event, in milliseconds.
    test_event_timeout: u32,
    /// How long the bootstrap handshake waits for register ownership, in milliseconds.
    bootstrap_timeout: u32,
    /// Queue depth used for the hardware channel before negotiation
    hwc_queue_depth: u16,
    /// Largest request the hardware channel allocates buffers for
    hwc_max_request_size: u32,
    /// Largest response the hardware channel allocates buffers for
    hwc_max_response_size: u32,
    /// Number of interrupt vectors available to event queues
    num_msix: u16,
    /// Event entries consumed per batch before the doorbell is rung
    eq_batch_size: u16,
}

impl GdmaConfig {
    /// The default hardware channel request timeout (in milliseconds)
    pub const DEFAULT_HWC_TIMEOUT: u32 = 30_000;
    /// The minimum hardware channel request timeout (in milliseconds)
    pub const MIN_HWC_TIMEOUT: u32 = 1;
    /// The maximum hardware channel request timeout (in milliseconds)
    pub const MAX_HWC_TIMEOUT: u32 = 600_000;
    /// The default bring-up timeout (in milliseconds)
    pub const DEFAULT_HWC_INIT_TIMEOUT: u32 = 60_000;
    /// The minimum bring-up timeout (in milliseconds)
    pub const MIN_HWC_INIT_TIMEOUT: u32 = 1;
    /// The maximum bring-up timeout (in milliseconds)
    pub const MAX_HWC_INIT_TIMEOUT: u32 = 600_000;
    /// The default test event timeout (in milliseconds)
    pub const DEFAULT_TEST_EVENT_TIMEOUT: u32 = 30_000;
    /// The minimum test event timeout (in milliseconds)
    pub const MIN_TEST_EVENT_TIMEOUT: u32 = 1;
    /// The maximum test event timeout (in milliseconds)
    pub const MAX_TEST_EVENT_TIMEOUT: u32 = 600_000;
    /// The default bootstrap ownership timeout (in milliseconds)
    pub const DEFAULT_BOOTSTRAP_TIMEOUT: u32 = 20_000;
    /// The minimum bootstrap ownership timeout (in milliseconds)
    pub const MIN_BOOTSTRAP_TIMEOUT: u32 = 1;
    /// The maximum bootstrap ownership timeout (in milliseconds)
    pub const MAX_BOOTSTRAP_TIMEOUT: u32 = 120_000;
    /// Queue depth the hardware channel is bootstrapped with
    pub const DEFAULT_HWC_QUEUE_DEPTH: u16 = 4;
    /// The minimum hardware channel queue depth
    pub const MIN_HWC_QUEUE_DEPTH: u16 = 1;
    /// The maximum hardware channel queue depth
    pub const MAX_HWC_QUEUE_DEPTH: u16 = 64;
    /// The default hardware channel message size for both directions
    pub const DEFAULT_HWC_MESSAGE_SIZE: u32 = 4096;
    /// The minimum hardware channel message size
    pub const MIN_HWC_MESSAGE_SIZE: u32 = 256;
    /// The maximum hardware channel message size
    pub const MAX_HWC_MESSAGE_SIZE: u32 = 64 * 1024;
    /// The default number of interrupt vectors
    pub const DEFAULT_NUM_MSIX: u16 = 64;
    /// The minimum number of interrupt vectors
    pub const MIN_NUM_MSIX: u16 = 1;
    /// The maximum number of interrupt vectors
    pub const MAX_NUM_MSIX: u16 = 2048;
    /// The default event batch size
    pub const DEFAULT_EQ_BATCH_SIZE: u16 = 5;
    /// The minimum event batch size
    pub const MIN_EQ_BATCH_SIZE: u16 = 1;
    /// The maximum event batch size
    pub const MAX_EQ_BATCH_SIZE: u16 = 256;

    /// Set the hardware channel request timeout. If set to 0, the timeout will be set to
    /// `DEFAULT_HWC_TIMEOUT`; otherwise it is clamped to
    /// `[MIN_HWC_TIMEOUT, MAX_HWC_TIMEOUT]`.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_hwc_timeout(&mut self, timeout: Duration) {
        self.hwc_timeout = clamp_millis(
            timeout,
            Self::DEFAULT_HWC_TIMEOUT,
            Self::MIN_HWC_TIMEOUT,
            Self::MAX_HWC_TIMEOUT,
        );
    }

    /// Get the hardware channel request timeout
    pub fn hwc_timeout(&self) -> Duration {
        Duration::from_millis(self.hwc_timeout as u64)
    }

    /// Set how long bring-up waits for the device to finish the channel handshake.
    /// If set to 0, the timeout will be set to `DEFAULT_HWC_INIT_TIMEOUT`.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_hwc_init_timeout(&mut self, timeout: Duration) {
        self.hwc_init_timeout = clamp_millis(
            timeout,
            Self::DEFAULT_HWC_INIT_TIMEOUT,
            Self::MIN_HWC_INIT_TIMEOUT,
            Self::MAX_HWC_INIT_TIMEOUT,
        );
    }

    /// Get the bring-up timeout
    pub fn hwc_init_timeout(&self) -> Duration {
        Duration::from_millis(self.hwc_init_timeout as u64)
    }

    /// Set how long an event queue test waits for the generated event.
    /// If set to 0, the timeout will be set to `DEFAULT_TEST_EVENT_TIMEOUT`.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_test_event_timeout(&mut self, timeout: Duration) {
        self.test_event_timeout = clamp_millis(
            timeout,
            Self::DEFAULT_TEST_EVENT_TIMEOUT,
            Self::MIN_TEST_EVENT_TIMEOUT,
            Self::MAX_TEST_EVENT_TIMEOUT,
        );
    }

    /// Get the test event timeout
    pub fn test_event_timeout(&self) -> Duration {
        Duration::from_millis(self.test_event_timeout as u64)
    }

    /// Set how long the bootstrap handshake polls for register ownership.
    /// If set to 0, the timeout will be set to `DEFAULT_BOOTSTRAP_TIMEOUT`.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_bootstrap_timeout(&mut self, timeout: Duration) {
        self.bootstrap_timeout = clamp_millis(
            timeout,
            Self::DEFAULT_BOOTSTRAP_TIMEOUT,
            Self::MIN_BOOTSTRAP_TIMEOUT,
            Self::MAX_BOOTSTRAP_TIMEOUT,
        );
    }

    /// Get the bootstrap ownership timeout
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout as u64)
    }

    /// Set the queue depth used to bootstrap the hardware channel.
    /// If set to 0, `DEFAULT_HWC_QUEUE_DEPTH` is used.
    pub fn set_hwc_queue_depth(&mut self, depth: u16) {
        self.hwc_queue_depth = match depth {
            0 => Self::DEFAULT_HWC_QUEUE_DEPTH,
            1.. => depth.clamp(Self::MIN_HWC_QUEUE_DEPTH, Self::MAX_HWC_QUEUE_DEPTH),
        };
    }

    /// Get the bootstrap queue depth of the hardware channel
    pub fn hwc_queue_depth(&self) -> u16 {
        self.hwc_queue_depth
    }

    /// Set the request and response buffer sizes of the hardware channel.
    /// A size of 0 selects `DEFAULT_HWC_MESSAGE_SIZE`.
    pub fn set_hwc_message_sizes(&mut self, max_request: u32, max_response: u32) {
        let clamp = |v: u32| match v {
            0 => Self::DEFAULT_HWC_MESSAGE_SIZE,
            1.. => v.clamp(Self::MIN_HWC_MESSAGE_SIZE, Self::MAX_HWC_MESSAGE_SIZE),
        };
        self.hwc_max_request_size = clamp(max_request);
        self.hwc_max_response_size = clamp(max_response);
    }

    /// Get the request buffer size of the hardware channel
    pub fn hwc_max_request_size(&self) -> u32 {
        self.hwc_max_request_size
    }

    /// Get the response buffer size of the hardware channel
    pub fn hwc_max_response_size(&self) -> u32 {
        self.hwc_max_response_size
    }

    /// Set the number of interrupt vectors. If set to 0, `DEFAULT_NUM_MSIX` is used.
    pub fn set_num_msix(&mut self, num: u16) {
        self.num_msix = match num {
            0 => Self::DEFAULT_NUM_MSIX,
            1.. => num.clamp(Self::MIN_NUM_MSIX, Self::MAX_NUM_MSIX),
        };
    }

    /// Get the number of interrupt vectors
    pub fn num_msix(&self) -> u16 {
        self.num_msix
    }

    /// Set how many event entries are handled before the doorbell is rung.
    /// If set to 0, `DEFAULT_EQ_BATCH_SIZE` is used.
    pub fn set_eq_batch_size(&mut self, batch: u16) {
        self.eq_batch_size = match batch {
            0 => Self::DEFAULT_EQ_BATCH_SIZE,
            1.. => batch.clamp(Self::MIN_EQ_BATCH_SIZE, Self::MAX_EQ_BATCH_SIZE),
        };
    }

    /// Get the event batch size
    pub fn eq_batch_size(&self) -> u16 {
        self.eq_batch_size
    }
}

impl Default for GdmaConfig {
    fn default() -> Self {
        Self {
            hwc_timeout: Self::DEFAULT_HWC_TIMEOUT,
            hwc_init_timeout: Self::DEFAULT_HWC_INIT_TIMEOUT,
            test_event_timeout: Self::DEFAULT_TEST_EVENT_TIMEOUT,
            bootstrap_timeout: Self::DEFAULT_BOOTSTRAP_TIMEOUT,
            hwc_queue_depth: Self::DEFAULT_HWC_QUEUE_DEPTH,
            hwc_max_request_size: Self::DEFAULT_HWC_MESSAGE_SIZE,
            hwc_max_response_size: Self::DEFAULT_HWC_MESSAGE_SIZE,
            num_msix: Self::DEFAULT_NUM_MSIX,
            eq_batch_size: Self::DEFAULT_EQ_BATCH_SIZE,
        }
    }
}
