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

//! Bitmap id allocator.
//!
//! [`ResourcePool`] hands out small integer ids from a fixed-size `FixedBitSet`.
//! It serves both the interrupt vector table and the hardware channel message
//! ids. The bitmap is guarded by a spinlock held only around the bit search and
//! update, so acquiring and releasing never sleeps.

use fixedbitset::FixedBitSet;
use spin::Mutex;

use crate::error::{GdmaError, Result};

/// Fixed capacity pool of integer ids.
#[derive(Debug)]
pub struct ResourcePool {
    map: Mutex<FixedBitSet>,
}

impl ResourcePool {
    /// Create a pool of `capacity` ids, all free.
    pub fn new(capacity: usize) -> Self {
        Self {
            map: Mutex::new(FixedBitSet::with_capacity(capacity)),
        }
    }

    /// Number of ids managed by the pool
    pub fn capacity(&self) -> usize {
        self.map.lock().len()
    }

    /// Number of ids currently handed out
    pub fn in_use(&self) -> usize {
        self.map.lock().count_ones(..)
    }

    /// Whether `id` is currently handed out
    pub fn is_in_use(&self, id: usize) -> bool {
        let map = self.map.lock();
        id < map.len() && map.contains(id)
    }

    /// Take the lowest free id.
    pub fn acquire(&self) -> Result<usize> {
        let mut map = self.map.lock();
        let id = map
            .zeroes()
            .next()
            .ok_or(GdmaError::PoolExhausted(map.len()))?;
        map.insert(id);
        Ok(id)
    }

    /// Take a specific id, failing if it is taken or out of range.
    pub fn acquire_id(&self, id: usize) -> Result<()> {
        let mut map = self.map.lock();
        if id >= map.len() {
            return Err(GdmaError::InvalidArgument(format!(
                "id {id} outside pool of {}",
                map.len()
            )));
        }
        if map.put(id) {
            return Err(GdmaError::InvalidArgument(format!("id {id} already in use")));
        }
        Ok(())
    }

    /// Return `id` to the pool.
    pub fn release(&self, id: usize) -> Result<()> {
        let mut map = self.map.lock();
        if id >= map.len() {
            return Err(GdmaError::InvalidArgument(format!(
                "id {id} outside pool of {}",
                map.len()
            )));
        }
        if !map.contains(id) {
            return Err(GdmaError::InvalidArgument(format!("id {id} is not in use")));
        }
        map.set(id, false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use quickcheck::{Arbitrary, Gen, quickcheck};

    use super::*;

    #[test]
    fn hands_out_lowest_free_id() {
        let pool = ResourcePool::new(4);
        assert_eq!(pool.acquire().unwrap(), 0);
        assert_eq!(pool.acquire().unwrap(), 1);
        assert_eq!(pool.acquire().unwrap(), 2);
        pool.release(1).unwrap();
        assert_eq!(pool.acquire().unwrap(), 1);
        assert_eq!(pool.in_use(), 3);
    }

    #[test]
    fn exhaustion_is_reported() {
        let pool = ResourcePool::new(2);
        pool.acquire().unwrap();
        pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(GdmaError::PoolExhausted(2))));
    }

    #[test]
    fn release_checks_state() {
        let pool = ResourcePool::new(2);
        assert!(pool.release(0).is_err());
        assert!(pool.release(7).is_err());
        let id = pool.acquire().unwrap();
        pool.release(id).unwrap();
        assert!(pool.release(id).is_err());
    }

    #[test]
    fn acquire_specific_id() {
        let pool = ResourcePool::new(8);
        pool.acquire_id(5).unwrap();
        assert!(pool.is_in_use(5));
        assert!(pool.acquire_id(5).is_err());
        assert!(pool.acquire_id(8).is_err());
        assert_eq!(pool.acquire().unwrap(), 0);
    }

    #[test]
    fn concurrent_acquire_yields_unique_ids() {
        let pool = Arc::new(ResourcePool::new(64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || (0..8).map(|_| pool.acquire().unwrap()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "id {id} handed out twice");
            }
        }
        assert_eq!(seen.len(), 64);
        assert!(pool.acquire().is_err());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Acquire,
        Release(usize),
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Self {
            if bool::arbitrary(g) {
                Op::Acquire
            } else {
                Op::Release(usize::arbitrary(g) % 16)
            }
        }
    }

    quickcheck! {
        fn pool_matches_set_model(ops: Vec<Op>) -> bool {
            let pool = ResourcePool::new(8);
            let mut model = HashSet::new();
            for op in ops {
                match op {
                    Op::Acquire => match pool.acquire() {
                        Ok(id) => {
                            if !model.insert(id) {
                                return false;
                            }
                        }
                        Err(_) => {
                            if model.len() != 8 {
                                return false;
                            }
                        }
                    },
                    Op::Release(id) => {
                        let expected = model.remove(&id);
                        if pool.release(id).is_ok() != expected {
                            return false;
                        }
                    }
                }
                if pool.in_use() != model.len() {
                    return false;
                }
            }
            true
        }
    }
}
