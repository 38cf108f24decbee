//! Reusable device buffer sets handed to one dispatch at a time

use std::collections::VecDeque;

use crate::compute::backend::{BufferLayout, ComputeBackend};
use crate::core::Result;

/// Buffers for one extraction: densities, triangle append buffer, counter and
/// noise offsets. Allocated lazily and reallocated only when the layout changes.
pub struct DeviceBufferSet<S> {
    id: usize,
    storage: Option<S>,
    layout: Option<BufferLayout>,
}

impl<S> DeviceBufferSet<S> {
    fn new(id: usize) -> Self {
        Self { id, storage: None, layout: None }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_initialized(&self) -> bool {
        self.storage.is_some()
    }

    pub fn layout(&self) -> Option<&BufferLayout> {
        self.layout.as_ref()
    }

    pub fn storage(&self) -> Option<&S> {
        self.storage.as_ref()
    }

    pub fn storage_mut(&mut self) -> Option<&mut S> {
        self.storage.as_mut()
    }

    /// Ensure storage matches `layout`, returning whether an allocation happened
    pub fn initialize<B>(&mut self, backend: &B, layout: &BufferLayout) -> Result<bool>
    where
        B: ComputeBackend<Storage = S>,
    {
        if self.storage.is_some() && self.layout.as_ref() == Some(layout) {
            return Ok(false);
        }
        self.storage = Some(backend.allocate(layout)?);
        self.layout = Some(*layout);
        log::trace!("Allocated buffer set {} for {} points", self.id, layout.num_points);
        Ok(true)
    }

    /// Drop device storage; the set can be initialized again later
    pub fn release(&mut self) {
        self.storage = None;
        self.layout = None;
    }
}

/// Pool statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    /// Most sets simultaneously in use
    pub high_water: usize,
}

/// FIFO pool of buffer sets. Grows without a ceiling when every set is in use.
pub struct DeviceBufferPool<S> {
    available: VecDeque<DeviceBufferSet<S>>,
    total: usize,
    high_water: usize,
}

impl<S> DeviceBufferPool<S> {
    /// Create a pool of `initial` uninitialized sets
    pub fn new(initial: usize) -> Self {
        Self {
            available: (0..initial).map(DeviceBufferSet::new).collect(),
            total: initial,
            high_water: 0,
        }
    }

    /// Take a set initialized for `layout`, growing the pool if none is free
    pub fn acquire<B>(&mut self, backend: &B, layout: &BufferLayout) -> Result<DeviceBufferSet<S>>
    where
        B: ComputeBackend<Storage = S>,
    {
        let mut set = match self.available.pop_front() {
            Some(set) => set,
            None => {
                let set = DeviceBufferSet::new(self.total);
                self.total += 1;
                log::info!("Buffer pool grew to {} sets", self.total);
                set
            }
        };

        if let Err(e) = set.initialize(backend, layout) {
            self.available.push_front(set);
            return Err(e);
        }

        let in_use = self.in_use();
        if in_use > self.high_water {
            self.high_water = in_use;
        }
        Ok(set)
    }

    pub fn release(&mut self, set: DeviceBufferSet<S>) {
        self.available.push_back(set);
    }

    pub fn in_use(&self) -> usize {
        self.total - self.available.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.total,
            available: self.available.len(),
            in_use: self.in_use(),
            high_water: self.high_water,
        }
    }

    /// Release storage of every set currently in the pool
    pub fn dispose_all(&mut self) {
        for set in &mut self.available {
            set.release();
        }
        log::debug!(
            "Disposed {} buffer sets ({} still in use)",
            self.available.len(),
            self.in_use()
        );
    }
}
