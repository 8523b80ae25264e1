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

//! Platform seams for DMA memory and the device BAR.
//!
//! The queue engine never dereferences raw pointers. DMA memory is addressed by
//! bus address through [`MemOps`], allocated through [`DmaAllocator`], and the
//! register space is reached through [`Mmio`]. This keeps the ring arithmetic
//! testable against an in-memory backend.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use bytemuck::Pod;
use thiserror::Error;

use crate::error::{GdmaError, Result};

/// Size of a hardware page
pub const PAGE_SIZE: usize = 4096;

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum AllocError {
    #[error("Invalid allocation length {0}")]
    InvalidLength(usize),
    #[error("Invalid free addr {0:#x} and size {1}")]
    InvalidFree(u64, usize),
    #[error("Out of memory")]
    OutOfMemory,
}

/// A contiguous, page aligned block of DMA memory
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DmaRegion {
    /// Bus address of the first byte
    pub addr: u64,
    /// Length of the region in bytes
    pub len: usize,
}

impl DmaRegion {
    /// Number of pages the region spans
    pub fn num_pages(&self) -> usize {
        self.len.div_ceil(PAGE_SIZE)
    }
}

/// Backend-provided access to DMA memory.
///
/// Addresses are bus addresses as seen by the device. Implementations must make
/// writes through [`write`](Self::write) visible to the device before a later
/// [`Mmio`] doorbell write, given the release fence the queue engine issues in between.
pub trait MemOps {
    type Error: Debug;

    /// Read `dst.len()` bytes starting at `addr`.
    fn read(&self, addr: u64, dst: &mut [u8]) -> std::result::Result<usize, Self::Error>;

    /// Write `src` starting at `addr`.
    fn write(&self, addr: u64, src: &[u8]) -> std::result::Result<usize, Self::Error>;

    /// Load a u32 with acquire semantics.
    ///
    /// Used for owner bit words, so entry payloads read afterwards are never stale.
    fn load_acquire(&self, addr: u64) -> std::result::Result<u32, Self::Error>;

    /// Read a Pod type at the given address.
    fn read_val<T: Pod>(&self, addr: u64) -> std::result::Result<T, Self::Error> {
        let mut val = T::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut val);

        self.read(addr, bytes)?;
        Ok(val)
    }

    /// Write a Pod type at the given address.
    fn write_val<T: Pod>(&self, addr: u64, val: T) -> std::result::Result<(), Self::Error> {
        let bytes = bytemuck::bytes_of(&val);
        self.write(addr, bytes)?;
        Ok(())
    }
}

/// Trait for DMA memory providers.
pub trait DmaAllocator {
    /// Allocate at least `len` bytes, page aligned and zeroed.
    fn alloc(&self, len: usize) -> std::result::Result<DmaRegion, AllocError>;

    /// Free a previously allocated region.
    fn dealloc(&self, region: DmaRegion) -> std::result::Result<(), AllocError>;
}

/// Everything the transport needs from the platform memory backend.
pub trait DmaMemory: MemOps + DmaAllocator + Send + Sync + 'static {}

impl<T: MemOps + DmaAllocator + Send + Sync + 'static> DmaMemory for T {}

/// Register access to the device BAR.
///
/// Offsets are relative to the start of BAR0.
pub trait Mmio: Send + Sync {
    /// Read a 32-bit register.
    fn read32(&self, offset: u64) -> u32;

    /// Write a 32-bit register.
    fn write32(&self, offset: u64, val: u32);

    /// Read a 64-bit register as two 32-bit reads, low half first.
    fn read64(&self, offset: u64) -> u64 {
        let lo = self.read32(offset) as u64;
        let hi = self.read32(offset + 4) as u64;
        (hi << 32) | lo
    }

    /// Write a 64-bit register.
    ///
    /// The default splits the store into two 32-bit writes, low half first.
    /// Backends with a native 64-bit store should override this.
    ///
    /// Doorbells are written through here. The store must not become visible
    /// to the device before earlier writes to DMA memory; a backend on a weakly
    /// ordered bus issues its own store barrier (`wmb`/`dsb st`) first.
    fn write64(&self, offset: u64, val: u64) {
        self.write32(offset, val as u32);
        self.write32(offset + 4, (val >> 32) as u32);
    }
}

/// Orders all prior DMA memory writes before a following doorbell write.
#[inline]
pub(crate) fn wmb() {
    // A release fence only orders against a later atomic store; the doorbell
    // is a plain MMIO store.
    fence(Ordering::SeqCst);
}

/// Orders an owner bit check before the reads of the entry payload.
#[inline]
pub(crate) fn rmb() {
    fence(Ordering::Acquire);
}

/// An owned DMA region, returned to its allocator on drop.
#[derive(Debug)]
pub struct DmaBuffer<M: DmaMemory> {
    mem: Arc<M>,
    region: DmaRegion,
}

impl<M: DmaMemory> DmaBuffer<M> {
    /// Allocate a zeroed buffer of at least `len` bytes.
    pub fn new(mem: Arc<M>, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(AllocError::InvalidLength(len).into());
        }
        let region = mem.alloc(len)?;
        Ok(Self { mem, region })
    }

    /// Bus address of the buffer
    #[inline]
    pub fn addr(&self) -> u64 {
        self.region.addr
    }

    /// Length of the buffer in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.region.len
    }

    /// The region backing this buffer
    pub fn region(&self) -> DmaRegion {
        self.region
    }

    /// The memory backend
    pub fn mem(&self) -> &Arc<M> {
        &self.mem
    }

    /// Read bytes at `offset` into `dst`.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len())?;
        let addr = self.region.addr + offset as u64;
        self.mem
            .read(addr, dst)
            .map_err(|_| GdmaError::MemAccess(addr))?;
        Ok(())
    }

    /// Write `src` at `offset`.
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len())?;
        let addr = self.region.addr + offset as u64;
        self.mem
            .write(addr, src)
            .map_err(|_| GdmaError::MemAccess(addr))?;
        Ok(())
    }

    /// Read a Pod value at `offset`.
    pub fn read_val<T: Pod>(&self, offset: usize) -> Result<T> {
        self.check(offset, size_of::<T>())?;
        let addr = self.region.addr + offset as u64;
        self.mem
            .read_val(addr)
            .map_err(|_| GdmaError::MemAccess(addr))
    }

    /// Load the u32 at `offset` with acquire semantics.
    pub fn load_acquire(&self, offset: usize) -> Result<u32> {
        self.check(offset, size_of::<u32>())?;
        let addr = self.region.addr + offset as u64;
        self.mem
            .load_acquire(addr)
            .map_err(|_| GdmaError::MemAccess(addr))
    }

    /// Write `src` at ring offset `offset`, continuing at offset 0 past the end.
    pub fn write_wrapped(&self, offset: usize, src: &[u8]) -> Result<usize> {
        let len = self.region.len;
        let offset = offset % len;
        let first = src.len().min(len - offset);
        self.write(offset, &src[..first])?;
        if first < src.len() {
            self.write(0, &src[first..])?;
        }
        Ok((offset + src.len()) % len)
    }

    /// Read into `dst` from ring offset `offset`, continuing at offset 0 past the end.
    pub fn read_wrapped(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let len = self.region.len;
        let offset = offset % len;
        let first = dst.len().min(len - offset);
        let (head, tail) = dst.split_at_mut(first);
        self.read(offset, head)?;
        if !tail.is_empty() {
            self.read(0, tail)?;
        }
        Ok(())
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.region.len => Ok(()),
            _ => Err(GdmaError::InvalidArgument(format!(
                "access of {len} bytes at offset {offset} exceeds {} byte buffer",
                self.region.len
            ))),
        }
    }
}

impl<M: DmaMemory> Drop for DmaBuffer<M> {
    fn drop(&mut self) {
        let _ = self.mem.dealloc(self.region);
    }
}
