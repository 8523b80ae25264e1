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

//! Work queue entry wire layout.
//!
//! ```text
//! ┌────────────┬──────────────────────┬─────────┬─────────┬─────┐
//! │ header (8) │ inline OOB (8 or 24) │ SGE (16)│ SGE (16)│ ... │  padded to 32
//! └────────────┴──────────────────────┴─────────┴─────────┴─────┘
//! ```

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use smallvec::SmallVec;

bitflags! {
    /// Per-request posting flags.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WqeFlags: u32 {
        /// The client OOB travels in the first SGE instead of inline
        const OOB_IN_SGL = 1 << 0;
        /// SGE0 is padding; its size goes into `last_vbytes`
        const PAD_BY_SGE0 = 1 << 1;
    }
}

/// The 8-byte header that starts every work queue entry.
///
/// - dword0: `last_vbytes:8, reserved:24`
/// - dword1: `num_sge:8, inline_oob_size_div4:3, oob_in_sgl:1, reserved:4,
///   client_data_unit:14, reserved:2`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct WqeHeader {
    dw0: u32,
    dw1: u32,
}

const _: () = assert!(core::mem::size_of::<WqeHeader>() == 8);

impl WqeHeader {
    const CDU_SHIFT: u32 = 16;
    const CDU_MASK: u32 = 0x3FFF;

    /// Pack a header.
    pub fn new(
        num_sge: u8,
        inline_oob_size: u32,
        oob_in_sgl: bool,
        last_vbytes: u8,
        client_data_unit: u32,
    ) -> Self {
        let div4 = (inline_oob_size / 4) & 0x7;
        let dw1 = num_sge as u32
            | (div4 << 8)
            | ((oob_in_sgl as u32) << 11)
            | ((client_data_unit & Self::CDU_MASK) << Self::CDU_SHIFT);
        Self {
            dw0: last_vbytes as u32,
            dw1,
        }
    }

    /// Number of scatter/gather entries following the OOB block
    pub fn num_sge(&self) -> u8 {
        self.dw1 as u8
    }

    /// Inline OOB size in dwords
    pub fn inline_oob_size_div4(&self) -> u32 {
        (self.dw1 >> 8) & 0x7
    }

    /// Whether the OOB is carried in the SGL
    pub fn oob_in_sgl(&self) -> bool {
        (self.dw1 >> 11) & 1 == 1
    }

    /// Client data unit (send queues only)
    pub fn client_data_unit(&self) -> u32 {
        (self.dw1 >> Self::CDU_SHIFT) & Self::CDU_MASK
    }

    /// Valid bytes of the padding SGE
    pub fn last_vbytes(&self) -> u8 {
        self.dw0 as u8
    }
}

/// One scatter/gather entry.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Sge {
    /// Bus address of the buffer
    pub addr: u64,
    /// Memory key the device uses to access it
    pub mem_key: u32,
    /// Length in bytes
    pub size: u32,
}

const _: () = assert!(core::mem::size_of::<Sge>() == 16);

impl Sge {
    pub fn new(addr: u64, mem_key: u32, size: u32) -> Self {
        Self {
            addr,
            mem_key,
            size,
        }
    }
}

/// A work request ready to be posted to a [`WorkQueue`](super::WorkQueue).
#[derive(Debug, Clone, Default)]
pub struct WqeRequest {
    pub(crate) sgl: SmallVec<[Sge; 4]>,
    pub(crate) inline_oob: SmallVec<[u8; 24]>,
    pub(crate) flags: WqeFlags,
    pub(crate) client_data_unit: u32,
}

impl WqeRequest {
    /// Start an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a scatter/gather entry.
    pub fn sge(mut self, sge: Sge) -> Self {
        self.sgl.push(sge);
        self
    }

    /// Append several scatter/gather entries.
    pub fn sges(mut self, sges: impl IntoIterator<Item = Sge>) -> Self {
        self.sgl.extend(sges);
        self
    }

    /// Set the inline OOB bytes.
    pub fn inline_oob(mut self, oob: &[u8]) -> Self {
        self.inline_oob = SmallVec::from_slice(oob);
        self
    }

    pub fn flags(mut self, flags: WqeFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn client_data_unit(mut self, cdu: u32) -> Self {
        self.client_data_unit = cdu;
        self
    }

    /// The scatter/gather list
    pub fn sgl(&self) -> &[Sge] {
        &self.sgl
    }

    /// The inline OOB bytes
    pub fn oob(&self) -> &[u8] {
        &self.inline_oob
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_round_trip() {
        let hdr = WqeHeader::new(3, 24, true, 0x40, 0x2ABC);
        assert_eq!(hdr.num_sge(), 3);
        assert_eq!(hdr.inline_oob_size_div4(), 6);
        assert!(hdr.oob_in_sgl());
        assert_eq!(hdr.last_vbytes(), 0x40);
        assert_eq!(hdr.client_data_unit(), 0x2ABC);
    }

    #[test]
    fn header_bit_layout() {
        let hdr = WqeHeader::new(1, 8, false, 0, 0);
        let bytes = bytemuck::bytes_of(&hdr);
        assert_eq!(bytes, &[0, 0, 0, 0, 0x01, 0x02, 0, 0]);

        let hdr = WqeHeader::new(0, 0, false, 0, 0x3FFF);
        assert_eq!(bytemuck::bytes_of(&hdr)[4..], [0, 0, 0xFF, 0x3F]);
    }

    #[test]
    fn builder_collects_entries() {
        let req = WqeRequest::new()
            .sge(Sge::new(0x1000, 7, 64))
            .sges([Sge::new(0x2000, 7, 32), Sge::new(0x3000, 7, 16)])
            .inline_oob(&[1; 8])
            .flags(WqeFlags::PAD_BY_SGE0);
        assert_eq!(req.sgl().len(), 3);
        assert_eq!(req.oob(), &[1; 8]);
        assert!(req.flags.contains(WqeFlags::PAD_BY_SGE0));
    }
}
