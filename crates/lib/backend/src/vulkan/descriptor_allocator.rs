// Copyright (C) 2023 gigablaster

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::{collections::HashMap, fmt::Debug};

use ash::vk;
use log::debug;

use crate::{BackendError, BackendResult, DescriptorPoolSizes};

use super::SharedDevice;

/// Pool of descriptor pools.
///
/// Sets are never freed one by one. Returned sets go to a free list keyed by
/// layout and are handed out again for the same layout. Every allocated set must
/// come back exactly once through [`DescriptorAllocator::deallocate`] or
/// [`DescriptorAllocator::pending_deallocate`].
pub struct DescriptorAllocator {
    device: SharedDevice,
    sets_per_pool: u32,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    current: Option<vk::DescriptorPool>,
    used_pools: Vec<vk::DescriptorPool>,
    free_pools: Vec<vk::DescriptorPool>,
    free_sets: HashMap<vk::DescriptorSetLayout, Vec<vk::DescriptorSet>>,
    pending: Vec<(vk::DescriptorSetLayout, vk::DescriptorSet)>,
}

impl Debug for DescriptorAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorAllocator")
            .field("pools", &self.pool_count())
            .field("free_sets", &self.free_set_count())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl DescriptorAllocator {
    pub fn new(device: SharedDevice, sets_per_pool: u32, sizes: &DescriptorPoolSizes) -> Self {
        Self {
            device,
            sets_per_pool,
            pool_sizes: sizes.pool_sizes(sets_per_pool),
            current: None,
            used_pools: Vec::new(),
            free_pools: Vec::new(),
            free_sets: HashMap::new(),
            pending: Vec::new(),
        }
    }

    pub fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> BackendResult<vk::DescriptorSet> {
        if let Some(set) = self.free_sets.get_mut(&layout).and_then(|sets| sets.pop()) {
            return Ok(set);
        }

        let pool = match self.current {
            Some(pool) => pool,
            None => self.grab_pool()?,
        };
        match self.device.allocate_descriptor_set(pool, layout) {
            Ok(set) => Ok(set),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                debug!("Descriptor pool {:?} is exhausted, switching to new one", pool);
                let pool = self.grab_pool()?;
                self.device
                    .allocate_descriptor_set(pool, layout)
                    .map_err(|err| match err {
                        vk::Result::ERROR_OUT_OF_POOL_MEMORY
                        | vk::Result::ERROR_FRAGMENTED_POOL => BackendError::OutOfPoolMemory,
                        other => other.into(),
                    })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Set can be reused right away. GPU must be done with it.
    pub fn deallocate(&mut self, layout: vk::DescriptorSetLayout, set: vk::DescriptorSet) {
        self.free_sets.entry(layout).or_default().push(set);
    }

    /// Set becomes reusable after next [`DescriptorAllocator::clear_pending_deallocated_descriptor_sets`].
    pub fn pending_deallocate(&mut self, layout: vk::DescriptorSetLayout, set: vk::DescriptorSet) {
        self.pending.push((layout, set));
    }

    /// Call only once fence confirmed that GPU finished with pending sets.
    pub fn clear_pending_deallocated_descriptor_sets(&mut self) {
        for (layout, set) in std::mem::take(&mut self.pending) {
            self.deallocate(layout, set);
        }
    }

    /// Returns every pool back to free stack. Every set allocated before is invalid.
    pub fn reset_pools(&mut self) -> BackendResult<()> {
        self.free_sets.clear();
        self.pending.clear();
        let pools = self
            .current
            .take()
            .into_iter()
            .chain(self.used_pools.drain(..))
            .collect::<Vec<_>>();
        let mut result = Ok(());
        for pool in pools {
            // Pool that failed to reset stays tracked so it's still destroyed on drop.
            match self.device.reset_descriptor_pool(pool) {
                Ok(()) => self.free_pools.push(pool),
                Err(err) => {
                    self.used_pools.push(pool);
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }

        result
    }

    pub fn pool_count(&self) -> usize {
        self.used_pools.len() + self.free_pools.len() + usize::from(self.current.is_some())
    }

    pub fn free_set_count(&self) -> usize {
        self.free_sets.values().map(|x| x.len()).sum()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn grab_pool(&mut self) -> BackendResult<vk::DescriptorPool> {
        let pool = match self.free_pools.pop() {
            Some(pool) => pool,
            None => {
                debug!("Creating descriptor pool #{}", self.pool_count() + 1);
                self.device
                    .create_descriptor_pool(self.sets_per_pool, &self.pool_sizes)?
            }
        };
        if let Some(old) = self.current.replace(pool) {
            self.used_pools.push(old);
        }

        Ok(pool)
    }
}

impl Drop for DescriptorAllocator {
    fn drop(&mut self) {
        let pools = self
            .current
            .take()
            .into_iter()
            .chain(self.used_pools.drain(..))
            .chain(self.free_pools.drain(..))
            .collect::<Vec<_>>();
        for pool in pools {
            self.device.destroy_descriptor_pool(pool);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use ash::vk::{self, Handle};

    use crate::{vulkan::mock::MockDevice, BackendError, DescriptorPoolSizes};

    use super::DescriptorAllocator;

    fn allocator(device: &Arc<MockDevice>, sets_per_pool: u32) -> DescriptorAllocator {
        DescriptorAllocator::new(device.clone(), sets_per_pool, &DescriptorPoolSizes::default())
    }

    fn layout(raw: u64) -> vk::DescriptorSetLayout {
        vk::DescriptorSetLayout::from_raw(raw)
    }

    #[test]
    fn free_list_reuses_by_layout() {
        let device = Arc::new(MockDevice::default());
        let mut allocator = allocator(&device, 16);
        let a = allocator.allocate(layout(1)).unwrap();
        allocator.deallocate(layout(1), a);
        let b = allocator.allocate(layout(2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, allocator.allocate(layout(1)).unwrap());
        assert_eq!(2, device.allocated_sets());
    }

    #[test]
    fn pending_sets_wait_for_clear() {
        let device = Arc::new(MockDevice::default());
        let mut allocator = allocator(&device, 16);
        let a = allocator.allocate(layout(1)).unwrap();
        allocator.pending_deallocate(layout(1), a);
        let b = allocator.allocate(layout(1)).unwrap();
        assert_ne!(a, b);
        assert_eq!(1, allocator.pending_count());
        allocator.clear_pending_deallocated_descriptor_sets();
        assert_eq!(0, allocator.pending_count());
        assert_eq!(a, allocator.allocate(layout(1)).unwrap());
    }

    #[test]
    fn grows_to_new_pool() {
        let device = Arc::new(MockDevice::default().pool_capacity(2));
        let mut allocator = allocator(&device, 2);
        for _ in 0..5 {
            allocator.allocate(layout(1)).unwrap();
        }
        assert_eq!(3, allocator.pool_count());
        assert_eq!(3, device.created("DescriptorPool"));
    }

    #[test]
    fn second_failure_is_fatal() {
        let device = Arc::new(MockDevice::default().pool_capacity(0));
        let mut allocator = allocator(&device, 2);
        assert!(matches!(
            allocator.allocate(layout(1)),
            Err(BackendError::OutOfPoolMemory)
        ));
    }

    #[test]
    fn reset_reuses_pools() {
        let device = Arc::new(MockDevice::default().pool_capacity(1));
        let mut allocator = allocator(&device, 1);
        let a = allocator.allocate(layout(1)).unwrap();
        allocator.allocate(layout(1)).unwrap();
        allocator.pending_deallocate(layout(1), a);
        allocator.reset_pools().unwrap();
        assert_eq!(0, allocator.pending_count());
        assert_eq!(0, allocator.free_set_count());
        allocator.allocate(layout(1)).unwrap();
        allocator.allocate(layout(1)).unwrap();
        assert_eq!(2, allocator.pool_count());
        assert_eq!(2, device.created("DescriptorPool"));
        assert_eq!(2, device.pool_resets());
    }

    #[test]
    fn drop_destroys_pools() {
        let device = Arc::new(MockDevice::default().pool_capacity(1));
        let mut allocator = allocator(&device, 1);
        allocator.allocate(layout(1)).unwrap();
        allocator.allocate(layout(1)).unwrap();
        drop(allocator);
        assert_eq!(2, device.destroyed("DescriptorPool"));
    }

    #[test]
    fn failed_reset_keeps_pools_tracked() {
        let device = Arc::new(MockDevice::default().pool_capacity(1));
        let mut allocator = allocator(&device, 1);
        allocator.allocate(layout(1)).unwrap();
        allocator.allocate(layout(1)).unwrap();
        allocator.allocate(layout(1)).unwrap();
        assert_eq!(3, allocator.pool_count());

        device.fail_next_pool_reset();
        assert!(allocator.reset_pools().is_err());
        assert_eq!(3, allocator.pool_count());
        assert_eq!(2, device.pool_resets());

        drop(allocator);
        assert_eq!(3, device.destroyed("DescriptorPool"));
    }
}
