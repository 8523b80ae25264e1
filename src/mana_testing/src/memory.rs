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

//! Page granular DMA memory backed by a heap buffer.

use std::sync::{Arc, Mutex};

use fixedbitset::FixedBitSet;
use mana_gdma::{AllocError, DmaAllocator, DmaRegion, MemOps, PAGE_SIZE};

/// Address outside the simulated memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfBounds {
    pub addr: u64,
    pub len: usize,
}

struct Inner {
    bytes: Vec<u8>,
    pages: FixedBitSet,
}

/// DMA memory for tests. Bus addresses start at [`SimMemory::BASE`].
pub struct SimMemory {
    inner: Mutex<Inner>,
}

impl SimMemory {
    pub const BASE: u64 = 0x8000_0000;

    /// Memory of `size` bytes, rounded up to whole pages.
    pub fn new(size: usize) -> Arc<Self> {
        let pages = size.div_ceil(PAGE_SIZE);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                bytes: vec![0; pages * PAGE_SIZE],
                pages: FixedBitSet::with_capacity(pages),
            }),
        })
    }

    /// Pages currently handed out
    pub fn pages_in_use(&self) -> usize {
        self.inner.lock().unwrap().pages.count_ones(..)
    }

    pub fn read_vec(&self, addr: u64, len: usize) -> Result<Vec<u8>, OutOfBounds> {
        let mut out = vec![0; len];
        self.read(addr, &mut out)?;
        Ok(out)
    }

    fn range(bytes: &[u8], addr: u64, len: usize) -> Result<std::ops::Range<usize>, OutOfBounds> {
        let err = OutOfBounds { addr, len };
        let start = addr.checked_sub(Self::BASE).ok_or(err)? as usize;
        let end = start.checked_add(len).ok_or(err)?;
        if end > bytes.len() {
            return Err(err);
        }
        Ok(start..end)
    }
}

impl MemOps for SimMemory {
    type Error = OutOfBounds;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
        let inner = self.inner.lock().unwrap();
        let range = Self::range(&inner.bytes, addr, dst.len())?;
        dst.copy_from_slice(&inner.bytes[range]);
        Ok(dst.len())
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
        let mut inner = self.inner.lock().unwrap();
        let range = Self::range(&inner.bytes, addr, src.len())?;
        inner.bytes[range].copy_from_slice(src);
        Ok(src.len())
    }

    fn load_acquire(&self, addr: u64) -> Result<u32, Self::Error> {
        let mut word = [0u8; 4];
        self.read(addr, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }
}

impl DmaAllocator for SimMemory {
    fn alloc(&self, len: usize) -> Result<DmaRegion, AllocError> {
        if len == 0 {
            return Err(AllocError::InvalidLength(len));
        }
        let want = len.div_ceil(PAGE_SIZE);
        let mut inner = self.inner.lock().unwrap();
        let total = inner.pages.len();
        let mut start = 0;
        while start + want <= total {
            match inner.pages.ones().find(|p| *p >= start && *p < start + want) {
                Some(used) => start = used + 1,
                None => {
                    inner.pages.insert_range(start..start + want);
                    let range = start * PAGE_SIZE..(start + want) * PAGE_SIZE;
                    inner.bytes[range].fill(0);
                    return Ok(DmaRegion {
                        addr: Self::BASE + (start * PAGE_SIZE) as u64,
                        len: want * PAGE_SIZE,
                    });
                }
            }
        }
        Err(AllocError::OutOfMemory)
    }

    fn dealloc(&self, region: DmaRegion) -> Result<(), AllocError> {
        let invalid = AllocError::InvalidFree(region.addr, region.len);
        let offset = region.addr.checked_sub(Self::BASE).ok_or(invalid)? as usize;
        if offset % PAGE_SIZE != 0 {
            return Err(invalid);
        }
        let first = offset / PAGE_SIZE;
        let pages = first..first + region.num_pages();
        let mut inner = self.inner.lock().unwrap();
        if pages.end > inner.pages.len() || pages.clone().any(|p| !inner.pages.contains(p)) {
            return Err(invalid);
        }
        inner.pages.remove_range(pages);
        Ok(())
    }
}

