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

//! Bootstrap shared memory channel.
//!
//! Before any queue exists, the driver and firmware talk through a 32-byte
//! region in BAR0. The high bit of the last dword says who owns the region:
//! the driver writes a message, hands the region over by setting the bit, and
//! waits for the firmware to clear it again with a response in place.
//!
//! ```text
//! bytes  0..24  low 48 bits of the EQ, CQ, RQ and SQ page frame numbers
//! bytes 24..26  high 4 bits of each page frame number, 4 bits apiece
//! bytes 26..28  MSI-X index
//! bytes 28..32  header
//! ```

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{Span, debug, instrument, warn};

use crate::doorbell::GDMA_REG_SHM_OFFSET;
use crate::error::{GdmaError, Result};
use crate::mem::{Mmio, PAGE_SIZE};

const SMC_NUM_DWORDS: u64 = 8;
const SMC_LAST_DWORD: u64 = SMC_NUM_DWORDS - 1;
const SMC_OWNER_BIT: u32 = 1 << 31;
const SMC_RESET_VALUE: u32 = u32::MAX;
const SMC_POLL_INTERVAL: Duration = Duration::from_millis(1);

const PAGE_SHIFT: u32 = 12;
const PFN_LOW_BYTES: usize = 6;
const PFN_LOW_MASK: u64 = (1 << 48) - 1;
const PFN_HIGH_BITS: u32 = 4;

/// Message types of the bootstrap channel
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SmcMessage {
    /// Create the hardware channel queues
    EstablishHwc,
    /// Tear them down
    DestroyHwc,
}

impl SmcMessage {
    pub const fn code(self) -> u32 {
        match self {
            SmcMessage::EstablishHwc => 1,
            SmcMessage::DestroyHwc => 2,
        }
    }

    pub const fn version(self) -> u32 {
        0
    }
}

/// The header dword of a bootstrap message.
///
/// `msg_type:3, msg_version:3, rsvd:1, is_response:1, status:8, rsvd:8,
/// reset_vf:1, rsvd:6, owner_is_pf:1`
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SmcHeader(pub u32);

impl SmcHeader {
    /// A request handed to the firmware.
    pub fn request(msg: SmcMessage, reset_vf: bool) -> Self {
        Self(msg.code() | (msg.version() << 3) | ((reset_vf as u32) << 24) | SMC_OWNER_BIT)
    }

    /// A firmware response, as written by the device.
    pub fn response(msg_type: u32, msg_version: u32, status: u8) -> Self {
        Self((msg_type & 0x7) | ((msg_version & 0x7) << 3) | (1 << 7) | ((status as u32) << 8))
    }

    pub fn msg_type(self) -> u32 {
        self.0 & 0x7
    }

    pub fn msg_version(self) -> u32 {
        (self.0 >> 3) & 0x7
    }

    pub fn is_response(self) -> bool {
        (self.0 >> 7) & 1 == 1
    }

    pub fn status(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn reset_vf(self) -> bool {
        (self.0 >> 24) & 1 == 1
    }

    pub fn owner_is_pf(self) -> bool {
        self.0 & SMC_OWNER_BIT != 0
    }
}

/// Bus addresses of the hardware channel queues handed to the firmware.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HwcQueueAddrs {
    pub eq: u64,
    pub cq: u64,
    pub rq: u64,
    pub sq: u64,
}

/// Pack an establish message into the eight dwords of the region.
///
/// Each queue address is reduced to its page frame number; the low 48 bits
/// are laid out back to back and the high 4 bits are gathered in one u16.
pub fn pack_establish(addrs: &HwcQueueAddrs, msix_index: u16, reset_vf: bool) -> [u32; 8] {
    let mut bytes = [0u8; 32];
    let mut high_bits: u16 = 0;
    for (i, addr) in [addrs.eq, addrs.cq, addrs.rq, addrs.sq].into_iter().enumerate() {
        let pfn = addr >> PAGE_SHIFT;
        let low = (pfn & PFN_LOW_MASK).to_le_bytes();
        bytes[i * PFN_LOW_BYTES..(i + 1) * PFN_LOW_BYTES].copy_from_slice(&low[..PFN_LOW_BYTES]);
        high_bits |= (((pfn >> 48) & 0xF) as u16) << (i as u32 * PFN_HIGH_BITS);
    }
    bytes[24..26].copy_from_slice(&high_bits.to_le_bytes());
    bytes[26..28].copy_from_slice(&msix_index.to_le_bytes());
    let header = SmcHeader::request(SmcMessage::EstablishHwc, reset_vf);
    bytes[28..32].copy_from_slice(&header.0.to_le_bytes());

    let mut dwords = [0u32; 8];
    for (dw, chunk) in dwords.iter_mut().zip(bytes.chunks_exact(4)) {
        *dw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    dwords
}

/// Inverse of [`pack_establish`], returning the addresses, MSI-X index and header.
pub fn unpack_establish(dwords: &[u32; 8]) -> (HwcQueueAddrs, u16, SmcHeader) {
    let mut bytes = [0u8; 32];
    for (chunk, dw) in bytes.chunks_exact_mut(4).zip(dwords) {
        chunk.copy_from_slice(&dw.to_le_bytes());
    }
    let high_bits = u16::from_le_bytes([bytes[24], bytes[25]]);
    let mut addr = [0u64; 4];
    for (i, a) in addr.iter_mut().enumerate() {
        let mut low = [0u8; 8];
        low[..PFN_LOW_BYTES].copy_from_slice(&bytes[i * PFN_LOW_BYTES..(i + 1) * PFN_LOW_BYTES]);
        let high = ((high_bits >> (i as u32 * PFN_HIGH_BITS)) & 0xF) as u64;
        *a = (u64::from_le_bytes(low) | (high << 48)) << PAGE_SHIFT;
    }
    let addrs = HwcQueueAddrs {
        eq: addr[0],
        cq: addr[1],
        rq: addr[2],
        sq: addr[3],
    };
    (
        addrs,
        u16::from_le_bytes([bytes[26], bytes[27]]),
        SmcHeader(dwords[7]),
    )
}

/// Driver side of the bootstrap channel.
pub struct ShmChannel {
    mmio: Arc<dyn Mmio>,
    base: u64,
    timeout: Duration,
}

impl std::fmt::Debug for ShmChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmChannel")
            .field("base", &format_args!("{:#x}", self.base))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ShmChannel {
    pub fn new(mmio: Arc<dyn Mmio>, base: u64, timeout: Duration) -> Self {
        Self {
            mmio,
            base,
            timeout,
        }
    }

    /// Locate the region through the BAR register.
    pub fn from_registers(mmio: Arc<dyn Mmio>, timeout: Duration) -> Self {
        let base = mmio.read64(GDMA_REG_SHM_OFFSET);
        Self::new(mmio, base, timeout)
    }

    /// BAR offset of the region
    pub fn base(&self) -> u64 {
        self.base
    }

    fn dword_offset(&self, idx: u64) -> u64 {
        self.base + idx * 4
    }

    /// Wait until the firmware hands the region back.
    fn poll_owner(&self, reset_vf: bool) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let last = self.mmio.read32(self.dword_offset(SMC_LAST_DWORD));
            if reset_vf && last == SMC_RESET_VALUE {
                debug!("shared memory reads as reset");
                return Ok(());
            }
            if last & SMC_OWNER_BIT == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(GdmaError::Timeout(self.timeout, "shared memory ownership"));
            }
            thread::sleep(SMC_POLL_INTERVAL);
        }
    }

    fn check_response(&self, msg: SmcMessage) -> Result<()> {
        let hdr = SmcHeader(self.mmio.read32(self.dword_offset(SMC_LAST_DWORD)));
        if hdr.msg_type() != msg.code() {
            return Err(GdmaError::BootstrapRejected(format!(
                "expected message type {}, got {}",
                msg.code(),
                hdr.msg_type()
            )));
        }
        if hdr.msg_version() > msg.version() {
            return Err(GdmaError::BootstrapRejected(format!(
                "unsupported message version {}",
                hdr.msg_version()
            )));
        }
        if !hdr.is_response() {
            return Err(GdmaError::BootstrapRejected("not a response".into()));
        }
        if hdr.status() != 0 {
            return Err(GdmaError::BootstrapRejected(format!(
                "status {:#x}",
                hdr.status()
            )));
        }
        Ok(())
    }

    /// Hand the hardware channel queue addresses to the firmware.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn setup_hwc(&self, addrs: &HwcQueueAddrs, msix_index: u32, reset_vf: bool) -> Result<()> {
        self.poll_owner(reset_vf)?;

        for (name, addr) in [
            ("eq", addrs.eq),
            ("cq", addrs.cq),
            ("rq", addrs.rq),
            ("sq", addrs.sq),
        ] {
            if addr % PAGE_SIZE as u64 != 0 {
                return Err(GdmaError::InvalidArgument(format!(
                    "{name} address {addr:#x} is not page aligned"
                )));
            }
        }
        let msix = u16::try_from(msix_index).map_err(|_| {
            GdmaError::InvalidArgument(format!("MSI-X index {msix_index} does not fit 16 bits"))
        })?;

        let dwords = pack_establish(addrs, msix, reset_vf);
        for (i, dw) in dwords.iter().enumerate() {
            self.mmio.write32(self.dword_offset(i as u64), *dw);
        }

        self.poll_owner(false)?;
        self.check_response(SmcMessage::EstablishHwc)
            .inspect_err(|e| warn!(error = %e, "hardware channel establish rejected"))
    }

    /// Ask the firmware to tear down the hardware channel.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn teardown_hwc(&self, reset_vf: bool) -> Result<()> {
        self.poll_owner(reset_vf)?;
        let header = SmcHeader::request(SmcMessage::DestroyHwc, reset_vf);
        self.mmio
            .write32(self.dword_offset(SMC_LAST_DWORD), header.0);
        self.poll_owner(false)?;
        self.check_response(SmcMessage::DestroyHwc)
    }
}
