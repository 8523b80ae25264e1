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

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

//! Transport core for GDMA based network adapters: descriptor rings with
//! owner-bit completion tracking, the doorbell protocol, interrupt dispatch,
//! and the hardware channel used to talk to the adapter's firmware.

/// Tunables with their defaults and bounds
pub mod config;
/// Interrupt to event queue dispatch and the completion queue table
pub mod dispatch;
/// Doorbell value encoding and the doorbell page region
pub mod doorbell;
/// Errors returned by this crate
pub mod error;
/// Function level context: hardware channel, management requests, queue lifecycle
pub mod gdma;
/// Hardware channel request/response transport
pub mod hwc;
/// Platform seams for DMA memory and BAR access
pub mod mem;
/// Metrics emitted through the `metrics` facade
mod metrics;
/// Work, completion and event queues
pub mod queue;
/// Typed management messages
pub mod requests;
/// Bitmap id pools
pub mod resource;
/// Bootstrap handshake over the shared memory window
pub mod shm;
/// Blocking completion primitive
pub mod sync;

pub use config::GdmaConfig;
pub use dispatch::{CqTable, InterruptRouter};
pub use error::{ErrorClass, GdmaError, Result};
pub use gdma::{GdmaContext, GdmaDevice, Queue, QueueHandle, QueueSpec};
pub use mem::{AllocError, DmaAllocator, DmaBuffer, DmaMemory, DmaRegion, MemOps, Mmio, PAGE_SIZE};
