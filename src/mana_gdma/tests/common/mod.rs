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

#![allow(dead_code)]

use std::time::Duration;

use mana_gdma::{GdmaConfig, GdmaContext};
use mana_testing::{SimConfig, SimDevice, SimFaults, SimMemory};

/// Simulated DMA memory handed to every context.
pub const MEM_SIZE: usize = 2 * 1024 * 1024;

/// A context wired to a simulated device.
///
/// `ctx` is declared first so it is torn down while the device still answers.
pub struct Harness {
    pub ctx: GdmaContext<SimMemory>,
    pub dev: SimDevice,
}

/// Config with timeouts short enough for tests.
pub fn test_config() -> GdmaConfig {
    let mut cfg = GdmaConfig::default();
    cfg.set_hwc_timeout(Duration::from_secs(5));
    cfg.set_hwc_init_timeout(Duration::from_secs(5));
    cfg.set_test_event_timeout(Duration::from_secs(5));
    cfg.set_bootstrap_timeout(Duration::from_secs(2));
    cfg
}

/// Creates a harness without bringing up the hardware channel.
pub fn new_harness(cfg: GdmaConfig, sim: SimConfig, faults: SimFaults) -> Harness {
    let mem = SimMemory::new(MEM_SIZE);
    let dev = SimDevice::with_config(mem.clone(), sim);
    dev.set_faults(faults);
    let ctx = GdmaContext::new(mem, dev.bar(), cfg).unwrap();
    let router = ctx.interrupts();
    dev.connect_interrupts(move |msix| router.raise(msix));
    Harness { ctx, dev }
}

/// Runs a test against a context whose hardware channel is up.
pub fn with_channel<F>(f: F)
where
    F: FnOnce(&Harness),
{
    with_channel_cfg(test_config(), f)
}

/// Runs a test against a context with custom configuration whose hardware
/// channel is up.
pub fn with_channel_cfg<F>(cfg: GdmaConfig, f: F)
where
    F: FnOnce(&Harness),
{
    let harness = new_harness(cfg, SimConfig::default(), SimFaults::default());
    harness.ctx.create_hw_channel().unwrap();
    f(&harness);
}

/// Polls `cond` until it holds or five seconds pass.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
