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

//! Hardware channel message envelopes and out-of-band blocks.

use bytemuck::{Pod, Zeroable};

/// The only header type in use
pub const GDMA_STANDARD_HEADER_TYPE: u32 = 0;
/// Message version stamped on requests and expected on responses
pub const GDMA_MESSAGE_V1: u16 = 1;
/// Status meaning "success, more entries are available"
pub const GDMA_STATUS_MORE_ENTRIES: u32 = 0x105;

/// Device type of the hardware channel itself
pub const GDMA_DEVICE_HWC: u16 = 1;
/// Device type of the network function
pub const GDMA_DEVICE_MANA: u16 = 2;

/// Common header of every request and response.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct MsgHeader {
    pub hdr_type: u32,
    pub msg_type: u32,
    pub msg_version: u16,
    /// Correlation id, stamped by the channel on send and echoed by the device
    pub hwc_msg_id: u16,
    pub msg_size: u32,
}

/// A device identity: `type:16, instance:16`.
#[repr(transparent)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct DevId(pub u32);

impl DevId {
    pub const fn new(kind: u16, instance: u16) -> Self {
        Self(kind as u32 | ((instance as u32) << 16))
    }

    pub const fn kind(self) -> u16 {
        self.0 as u16
    }

    pub const fn instance(self) -> u16 {
        (self.0 >> 16) as u16
    }
}

/// Envelope every request starts with.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ReqHeader {
    pub req: MsgHeader,
    /// Describes the response the caller expects
    pub resp: MsgHeader,
    pub dev_id: DevId,
    pub activity_id: u32,
}

/// Envelope every response starts with.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RespHeader {
    pub response: MsgHeader,
    pub dev_id: DevId,
    pub activity_id: u32,
    pub status: u32,
    pub reserved: u32,
}

const _: () = assert!(size_of::<MsgHeader>() == 16);
const _: () = assert!(size_of::<ReqHeader>() == 40);
const _: () = assert!(size_of::<RespHeader>() == 32);

impl ReqHeader {
    /// Header for a request of `req_size` bytes expecting `resp_size` bytes back.
    pub fn new(msg_type: u32, req_size: u32, resp_size: u32) -> Self {
        Self {
            req: MsgHeader {
                hdr_type: GDMA_STANDARD_HEADER_TYPE,
                msg_type,
                msg_version: GDMA_MESSAGE_V1,
                hwc_msg_id: 0,
                msg_size: req_size,
            },
            resp: MsgHeader {
                hdr_type: GDMA_STANDARD_HEADER_TYPE,
                msg_type,
                msg_version: GDMA_MESSAGE_V1,
                hwc_msg_id: 0,
                msg_size: resp_size,
            },
            dev_id: DevId::default(),
            activity_id: 0,
        }
    }
}

/// Offset of the correlation id inside a serialized request
pub(crate) const REQ_MSG_ID_OFFSET: usize =
    core::mem::offset_of!(ReqHeader, req) + core::mem::offset_of!(MsgHeader, hwc_msg_id);

/// Routing block carried inline with every hardware channel send.
///
/// - dw0: `vrq_id:24, dest_vfid:8`
/// - dw1: `vrcq_id:24, rsvd:8`
/// - dw2: `loopback:1, lso_override:1, dest_pf:1, rsvd:5, vscq_id:24`
/// - dw3: `vsq_id:24, rsvd:8`
/// - dw4, dw5: reserved
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct HwcTxOob {
    dw: [u32; 6],
}

const _: () = assert!(size_of::<HwcTxOob>() == 24);

impl HwcTxOob {
    const ID24: u32 = 0xFF_FFFF;

    /// Route a request to the virtual receive queue pair `vrq_id`/`vrcq_id`
    /// from the channel's own send queue `vsq_id` and completion queue `vscq_id`.
    pub fn new(vrq_id: u32, vrcq_id: u32, vscq_id: u32, vsq_id: u32, dest_pf: bool) -> Self {
        Self {
            dw: [
                vrq_id & Self::ID24,
                vrcq_id & Self::ID24,
                ((dest_pf as u32) << 2) | ((vscq_id & Self::ID24) << 8),
                vsq_id & Self::ID24,
                0,
                0,
            ],
        }
    }

    pub fn vrq_id(&self) -> u32 {
        self.dw[0] & Self::ID24
    }

    pub fn dest_vfid(&self) -> u32 {
        self.dw[0] >> 24
    }

    pub fn vrcq_id(&self) -> u32 {
        self.dw[1] & Self::ID24
    }

    pub fn loopback(&self) -> bool {
        self.dw[2] & 1 == 1
    }

    pub fn dest_pf(&self) -> bool {
        (self.dw[2] >> 2) & 1 == 1
    }

    pub fn vscq_id(&self) -> u32 {
        self.dw[2] >> 8
    }

    pub fn vsq_id(&self) -> u32 {
        self.dw[3] & Self::ID24
    }
}

/// Receive completion payload of the hardware channel, the first 32 bytes of
/// the completion entry.
///
/// - dw0: `type:6, eom:1, som:1, vendor_err:8, rsvd:16`
/// - dw1: `src_virt_wq:24, src_vfid:8`
/// - dw2: reserved
/// - dw3: `wqe_offset` (low half of the entry address)
/// - dw4: `wqe_addr_high`
/// - dw5: `client_data_unit:14, rsvd:18`
/// - dw6: `tx_oob_data_size`, the response length
/// - dw7: `chunk_offset:21, rsvd:11`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct HwcRxOob {
    dw: [u32; 8],
}

const _: () = assert!(size_of::<HwcRxOob>() == 32);

impl HwcRxOob {
    /// Completion for a response of `len` bytes landing in the receive entry
    /// at byte offset `wqe_offset`.
    pub fn new(src_virt_wq: u32, wqe_offset: u32, len: u32) -> Self {
        let mut dw = [0u32; 8];
        dw[0] = (1 << 6) | (1 << 7);
        dw[1] = src_virt_wq & 0xFF_FFFF;
        dw[3] = wqe_offset;
        dw[6] = len;
        Self { dw }
    }

    pub fn oob_type(&self) -> u32 {
        self.dw[0] & 0x3F
    }

    pub fn eom(&self) -> bool {
        (self.dw[0] >> 6) & 1 == 1
    }

    pub fn som(&self) -> bool {
        (self.dw[0] >> 7) & 1 == 1
    }

    pub fn vendor_err(&self) -> u32 {
        (self.dw[0] >> 8) & 0xFF
    }

    pub fn src_virt_wq(&self) -> u32 {
        self.dw[1] & 0xFF_FFFF
    }

    pub fn src_vfid(&self) -> u32 {
        self.dw[1] >> 24
    }

    /// Byte offset of the consumed receive entry
    pub fn wqe_offset(&self) -> u32 {
        self.dw[3]
    }

    pub fn wqe_addr_high(&self) -> u32 {
        self.dw[4]
    }

    pub fn client_data_unit(&self) -> u32 {
        self.dw[5] & 0x3FFF
    }

    /// Length of the received message
    pub fn tx_oob_data_size(&self) -> u32 {
        self.dw[6]
    }

    pub fn chunk_offset(&self) -> u32 {
        self.dw[7] & 0x1F_FFFF
    }

    /// Completion payload words carrying this block
    pub fn to_cqe_data(self) -> [u32; 15] {
        let mut data = [0u32; 15];
        data[..8].copy_from_slice(&self.dw);
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_defaults() {
        let hdr = ReqHeader::new(12, 96, 36);
        let bytes = bytemuck::bytes_of(&hdr);
        assert_eq!(&bytes[4..8], &12u32.to_le_bytes());
        assert_eq!(&bytes[8..10], &1u16.to_le_bytes());
        assert_eq!(&bytes[12..16], &96u32.to_le_bytes());
        assert_eq!(&bytes[28..32], &36u32.to_le_bytes());
        assert_eq!(REQ_MSG_ID_OFFSET, 10);
    }

    #[test]
    fn dev_id_packing() {
        let id = DevId::new(GDMA_DEVICE_MANA, 3);
        assert_eq!(id.0, 0x0003_0002);
        assert_eq!(id.kind(), GDMA_DEVICE_MANA);
        assert_eq!(id.instance(), 3);
    }

    #[test]
    fn tx_oob_routing_fields() {
        let oob = HwcTxOob::new(0x12_3456, 0xAB_CDEF, 7, 9, false);
        assert_eq!(oob.vrq_id(), 0x12_3456);
        assert_eq!(oob.dest_vfid(), 0);
        assert_eq!(oob.vrcq_id(), 0xAB_CDEF);
        assert_eq!(oob.vscq_id(), 7);
        assert_eq!(oob.vsq_id(), 9);
        assert!(!oob.loopback());
        assert!(!oob.dest_pf());
        assert_eq!(bytemuck::bytes_of(&oob)[8..12], (7u32 << 8).to_le_bytes());
    }

    #[test]
    fn rx_oob_from_completion_words() {
        let oob = HwcRxOob::new(3, 0x60, 44);
        let data = oob.to_cqe_data();
        let back: HwcRxOob = bytemuck::pod_read_unaligned(&bytemuck::cast_slice(&data)[..32]);
        assert_eq!(back.src_virt_wq(), 3);
        assert_eq!(back.wqe_offset(), 0x60);
        assert_eq!(back.tx_oob_data_size(), 44);
        assert!(back.som() && back.eom());
        assert_eq!(back.vendor_err(), 0);
    }
}
