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

//! Typed GDMA management messages carried over the hardware channel.

use bytemuck::{Pod, Zeroable};

use crate::hwc::{DevId, ReqHeader, RespHeader};
use crate::mem::PAGE_SIZE;
use crate::queue::QueueKind;

pub const GDMA_QUERY_MAX_RESOURCES: u32 = 2;
pub const GDMA_LIST_DEVICES: u32 = 3;
pub const GDMA_REGISTER_DEVICE: u32 = 4;
pub const GDMA_DEREGISTER_DEVICE: u32 = 5;
pub const GDMA_GENERATE_TEST_EQE: u32 = 10;
pub const GDMA_CREATE_QUEUE: u32 = 12;
pub const GDMA_DISABLE_QUEUE: u32 = 13;
pub const GDMA_CREATE_DMA_REGION: u32 = 25;
pub const GDMA_DESTROY_DMA_REGION: u32 = 27;

/// Page type code of 4 KiB pages in a DMA region
pub const GDMA_PAGE_TYPE_4K: u32 = 0;

/// Most device ids one `LIST_DEVICES` response can carry
pub const MAX_NUM_DEVS: usize = 64;

/// A fixed size request with a fixed size response.
pub trait GdmaRequest: Pod {
    /// Response type the device answers with
    type Response: Pod;
    /// Message type code
    const MSG_TYPE: u32;

    /// Envelope for this request, sized for `Self` and its response.
    fn header(dev_id: DevId) -> ReqHeader {
        let mut hdr = ReqHeader::new(
            Self::MSG_TYPE,
            size_of::<Self>() as u32,
            size_of::<Self::Response>() as u32,
        );
        hdr.dev_id = dev_id;
        hdr
    }
}

macro_rules! header_only_request {
    ($(#[$meta:meta])* $name:ident, $msg:expr, $resp:ty) => {
        $(#[$meta])*
        #[repr(C)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
        pub struct $name {
            pub hdr: ReqHeader,
        }

        impl $name {
            pub fn new(dev_id: DevId) -> Self {
                Self {
                    hdr: <Self as GdmaRequest>::header(dev_id),
                }
            }
        }

        impl GdmaRequest for $name {
            type Response = $resp;
            const MSG_TYPE: u32 = $msg;
        }
    };
}

header_only_request!(
    /// Ask for the device's resource limits.
    QueryMaxResourcesReq,
    GDMA_QUERY_MAX_RESOURCES,
    QueryMaxResourcesResp
);
header_only_request!(
    /// Enumerate the functions behind the hardware channel.
    ListDevicesReq,
    GDMA_LIST_DEVICES,
    ListDevicesResp
);
header_only_request!(
    /// Attach to a device, obtaining its protection domain and doorbell page.
    RegisterDeviceReq,
    GDMA_REGISTER_DEVICE,
    RegisterDeviceResp
);
header_only_request!(DeregisterDeviceReq, GDMA_DEREGISTER_DEVICE, RespHeader);

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct QueryMaxResourcesResp {
    pub hdr: RespHeader,
    pub status: u32,
    pub max_sq: u32,
    pub max_rq: u32,
    pub max_cq: u32,
    pub max_eq: u32,
    pub max_db: u32,
    pub max_mst: u32,
    pub max_cq_mod_ctx: u32,
    pub max_mod_cq: u32,
    pub max_msix: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ListDevicesResp {
    pub hdr: RespHeader,
    pub num_of_devs: u32,
    pub reserved: u32,
    pub devs: [DevId; MAX_NUM_DEVS],
}

impl ListDevicesResp {
    /// The reported devices
    pub fn devices(&self) -> &[DevId] {
        let num = (self.num_of_devs as usize).min(MAX_NUM_DEVS);
        &self.devs[..num]
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RegisterDeviceResp {
    pub hdr: RespHeader,
    pub pdid: u32,
    pub gpa_mkey: u32,
    pub db_id: u32,
}

/// Ask the device to post a test event on an event queue.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GenerateTestEqeReq {
    pub hdr: ReqHeader,
    pub queue_index: u32,
}

impl GenerateTestEqeReq {
    pub fn new(dev_id: DevId, queue_index: u32) -> Self {
        Self {
            hdr: Self::header(dev_id),
            queue_index,
        }
    }
}

impl GdmaRequest for GenerateTestEqeReq {
    type Response = RespHeader;
    const MSG_TYPE: u32 = GDMA_GENERATE_TEST_EQE;
}

/// Create a hardware queue over a registered DMA region.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct CreateQueueReq {
    pub hdr: ReqHeader,
    pub queue_type: u32,
    pub reserved1: u32,
    pub pdid: u32,
    pub doorbell_id: u32,
    pub gdma_region: u64,
    pub reserved2: u32,
    pub queue_size: u32,
    pub log2_throttle_limit: u32,
    pub eq_pci_msix_index: u32,
    pub cq_mod_ctx_id: u32,
    pub cq_parent_eq_id: u32,
    pub rq_drop_on_overrun: u8,
    pub rq_err_on_wqe_overflow: u8,
    pub rq_chain_rec_wqes: u8,
    pub sq_hw_db: u8,
    pub reserved3: u32,
}

const _: () = assert!(size_of::<CreateQueueReq>() == 96);
const _: () = assert!(core::mem::offset_of!(CreateQueueReq, gdma_region) == 56);

impl CreateQueueReq {
    pub fn new(
        dev_id: DevId,
        kind: QueueKind,
        pdid: u32,
        doorbell_id: u32,
        gdma_region: u64,
        queue_size: u32,
    ) -> Self {
        Self {
            hdr: Self::header(dev_id),
            queue_type: kind.code(),
            pdid,
            doorbell_id,
            gdma_region,
            queue_size,
            ..Zeroable::zeroed()
        }
    }
}

impl GdmaRequest for CreateQueueReq {
    type Response = CreateQueueResp;
    const MSG_TYPE: u32 = GDMA_CREATE_QUEUE;
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct CreateQueueResp {
    pub hdr: RespHeader,
    pub queue_index: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DisableQueueReq {
    pub hdr: ReqHeader,
    pub queue_type: u32,
    pub queue_index: u32,
    pub alloc_res_id_on_creation: u32,
}

impl DisableQueueReq {
    pub fn new(dev_id: DevId, kind: QueueKind, queue_index: u32) -> Self {
        Self {
            hdr: Self::header(dev_id),
            queue_type: kind.code(),
            queue_index,
            alloc_res_id_on_creation: 1,
        }
    }
}

impl GdmaRequest for DisableQueueReq {
    type Response = RespHeader;
    const MSG_TYPE: u32 = GDMA_DISABLE_QUEUE;
}

/// Fixed part of a `CREATE_DMA_REGION` request. The page address list follows
/// it on the wire, so the request is serialized with [`encode`](Self::encode).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct CreateDmaRegionReq {
    pub hdr: ReqHeader,
    pub length: u64,
    pub offset_in_page: u32,
    pub gdma_page_type: u32,
    pub page_count: u32,
    pub page_addr_list_len: u32,
}

const _: () = assert!(size_of::<CreateDmaRegionReq>() == 64);

impl CreateDmaRegionReq {
    /// Serialize a request registering `length` bytes of pages starting at `addr`.
    pub fn encode(dev_id: DevId, addr: u64, length: u64) -> Vec<u8> {
        let pages = length.div_ceil(PAGE_SIZE as u64);
        let total = size_of::<Self>() + pages as usize * size_of::<u64>();
        let mut hdr = ReqHeader::new(
            GDMA_CREATE_DMA_REGION,
            total as u32,
            size_of::<CreateDmaRegionResp>() as u32,
        );
        hdr.dev_id = dev_id;
        let fixed = Self {
            hdr,
            length,
            offset_in_page: 0,
            gdma_page_type: GDMA_PAGE_TYPE_4K,
            page_count: pages as u32,
            page_addr_list_len: pages as u32,
        };

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(bytemuck::bytes_of(&fixed));
        for page in 0..pages {
            out.extend_from_slice(&(addr + page * PAGE_SIZE as u64).to_le_bytes());
        }
        out
    }

    /// Split a serialized request into its fixed part and page list.
    pub fn decode(bytes: &[u8]) -> Option<(Self, Vec<u64>)> {
        let fixed: Self = bytemuck::try_pod_read_unaligned(bytes.get(..size_of::<Self>())?).ok()?;
        let pages = bytes[size_of::<Self>()..]
            .chunks_exact(size_of::<u64>())
            .take(fixed.page_addr_list_len as usize)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        Some((fixed, pages))
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct CreateDmaRegionResp {
    pub hdr: RespHeader,
    pub dma_region_handle: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DestroyDmaRegionReq {
    pub hdr: ReqHeader,
    pub dma_region_handle: u64,
}

impl DestroyDmaRegionReq {
    pub fn new(dma_region_handle: u64) -> Self {
        Self {
            hdr: Self::header(DevId::default()),
            dma_region_handle,
        }
    }
}

impl GdmaRequest for DestroyDmaRegionReq {
    type Response = RespHeader;
    const MSG_TYPE: u32 = GDMA_DESTROY_DMA_REGION;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hwc::GDMA_DEVICE_MANA;

    #[test]
    fn wire_sizes() {
        assert_eq!(size_of::<QueryMaxResourcesResp>(), 72);
        assert_eq!(size_of::<ListDevicesResp>(), 296);
        assert_eq!(size_of::<RegisterDeviceResp>(), 44);
        assert_eq!(size_of::<GenerateTestEqeReq>(), 44);
        assert_eq!(size_of::<CreateQueueResp>(), 36);
        assert_eq!(size_of::<DisableQueueReq>(), 52);
        assert_eq!(size_of::<CreateDmaRegionResp>(), 40);
        assert_eq!(size_of::<DestroyDmaRegionReq>(), 48);
    }

    #[test]
    fn header_sizes_follow_types() {
        let req = CreateQueueReq::new(DevId::new(GDMA_DEVICE_MANA, 0), QueueKind::Event, 1, 2, 3, 4096);
        assert_eq!(req.hdr.req.msg_type, GDMA_CREATE_QUEUE);
        assert_eq!(req.hdr.req.msg_size, 96);
        assert_eq!(req.hdr.resp.msg_size, 36);
        assert_eq!(req.hdr.dev_id.kind(), GDMA_DEVICE_MANA);
        assert_eq!(req.queue_type, 4);
        assert_eq!(req.log2_throttle_limit, 0);

        let req = ListDevicesReq::new(DevId::default());
        assert_eq!(req.hdr.resp.msg_size, 296);
    }

    #[test]
    fn dma_region_page_list() {
        let bytes = CreateDmaRegionReq::encode(DevId::default(), 0x10_0000, 3 * 4096 - 100);
        assert_eq!(bytes.len(), 64 + 3 * 8);
        let (fixed, pages) = CreateDmaRegionReq::decode(&bytes).unwrap();
        assert_eq!(fixed.hdr.req.msg_size as usize, bytes.len());
        assert_eq!(fixed.page_count, 3);
        assert_eq!(pages, vec![0x10_0000, 0x10_1000, 0x10_2000]);
        assert!(CreateDmaRegionReq::decode(&bytes[..10]).is_none());
    }

    #[test]
    fn listed_devices_are_clamped() {
        let mut resp: ListDevicesResp = Zeroable::zeroed();
        resp.num_of_devs = 200;
        assert_eq!(resp.devices().len(), MAX_NUM_DEVS);
        resp.num_of_devs = 2;
        resp.devs[1] = DevId::new(GDMA_DEVICE_MANA, 1);
        assert_eq!(resp.devices()[1].instance(), 1);
    }
}
