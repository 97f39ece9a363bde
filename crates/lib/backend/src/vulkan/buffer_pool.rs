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
use parking_lot::Mutex;

use crate::{BackendError, BackendResult, BindingConfig};

use super::SharedDevice;

/// Piece of per-frame buffer. Valid until owning pool is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferAllocation {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug)]
struct BufferBlock {
    buffer: vk::Buffer,
    size: u64,
    top: u64,
}

impl BufferBlock {
    fn new(device: &SharedDevice, size: u64, usage: vk::BufferUsageFlags) -> BackendResult<Self> {
        let buffer = device.create_host_buffer(size, usage)?;

        Ok(Self {
            buffer,
            size,
            top: 0,
        })
    }

    fn allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let offset = (self.top + alignment - 1) & !(alignment - 1);
        if offset + size > self.size {
            return None;
        }
        self.top = offset + size;

        Some(offset)
    }

    fn reset(&mut self) {
        self.top = 0;
    }
}

/// Linear allocator over host visible buffers of one usage.
///
/// Memory is only ever given back all at once by [`BufferPool::reset`].
/// Requests bigger than block size get their own block that lives until reset.
pub struct BufferPool {
    device: SharedDevice,
    usage: vk::BufferUsageFlags,
    block_size: u64,
    alignment: u64,
    active: Vec<BufferBlock>,
    free: Vec<BufferBlock>,
    dedicated: Vec<BufferBlock>,
}

impl Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("usage", &self.usage)
            .field("block_size", &self.block_size)
            .field("alignment", &self.alignment)
            .field("active", &self.active.len())
            .field("free", &self.free.len())
            .field("dedicated", &self.dedicated.len())
            .finish()
    }
}

impl BufferPool {
    pub fn new(device: &SharedDevice, usage: vk::BufferUsageFlags, block_size: u64) -> Self {
        let alignment = device.limits().alignment(usage).max(1).next_power_of_two();
        Self {
            device: device.clone(),
            usage,
            block_size,
            alignment,
            active: Vec::new(),
            free: Vec::new(),
            dedicated: Vec::new(),
        }
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn allocate(&mut self, size: u64) -> BackendResult<BufferAllocation> {
        if size > self.block_size {
            debug!("Dedicated {} byte block for {:?}", size, self.usage);
            let block = BufferBlock::new(&self.device, size, self.usage)?;
            let allocation = BufferAllocation {
                buffer: block.buffer,
                offset: 0,
                size,
            };
            self.dedicated.push(block);
            return Ok(allocation);
        }

        if let Some(block) = self.active.last_mut() {
            if let Some(offset) = block.allocate(size, self.alignment) {
                return Ok(BufferAllocation {
                    buffer: block.buffer,
                    offset,
                    size,
                });
            }
        }

        let mut block = match self.free.pop() {
            Some(block) => block,
            None => {
                debug!(
                    "Creating buffer block #{} for {:?}",
                    self.block_count() + 1,
                    self.usage
                );
                BufferBlock::new(&self.device, self.block_size, self.usage)?
            }
        };
        let offset = block
            .allocate(size, self.alignment)
            .ok_or(BackendError::OutOfDeviceMemory)?;
        let allocation = BufferAllocation {
            buffer: block.buffer,
            offset,
            size,
        };
        self.active.push(block);

        Ok(allocation)
    }

    /// Every allocation made before is invalid after this. GPU must be done with them.
    pub fn reset(&mut self) {
        for block in self.dedicated.drain(..) {
            self.device.destroy_host_buffer(block.buffer);
        }
        for mut block in self.active.drain(..) {
            block.reset();
            self.free.push(block);
        }
    }

    /// Regular blocks, both used and free.
    pub fn block_count(&self) -> usize {
        self.active.len() + self.free.len()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.active
            .drain(..)
            .chain(self.free.drain(..))
            .chain(self.dedicated.drain(..))
            .for_each(|block| self.device.destroy_host_buffer(block.buffer));
    }
}

/// Per frame buffer memory, one pool for every configured usage.
pub struct BufferManager {
    device: SharedDevice,
    pools: HashMap<vk::BufferUsageFlags, Mutex<BufferPool>>,
}

impl Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("pools", &self.pools)
            .finish()
    }
}

impl BufferManager {
    pub fn new(device: &SharedDevice, config: &BindingConfig) -> Self {
        let pools = config
            .buffer_usages
            .iter()
            .map(|usage| {
                (
                    *usage,
                    Mutex::new(BufferPool::new(device, *usage, config.buffer_block_size)),
                )
            })
            .collect();

        Self {
            device: device.clone(),
            pools,
        }
    }

    /// Reserves `size` bytes without writing anything there.
    pub fn allocate(
        &self,
        usage: vk::BufferUsageFlags,
        size: u64,
    ) -> BackendResult<BufferAllocation> {
        self.pools
            .get(&usage)
            .ok_or(BackendError::NoBufferPool(usage))?
            .lock()
            .allocate(size)
    }

    /// Reserves space and copies `data` there.
    pub fn upload(&self, usage: vk::BufferUsageFlags, data: &[u8]) -> BackendResult<BufferAllocation> {
        let allocation = self.allocate(usage, data.len() as u64)?;
        self.device
            .write_host_buffer(allocation.buffer, allocation.offset, data)?;

        Ok(allocation)
    }

    pub fn reset(&self) {
        self.pools.values().for_each(|pool| pool.lock().reset());
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use ash::vk;

    use crate::{
        vulkan::{mock::MockDevice, DeviceLimits, SharedDevice},
        BackendError, BindingConfig,
    };

    use super::{BufferManager, BufferPool};

    fn device() -> Arc<MockDevice> {
        Arc::new(MockDevice::default().with_limits(DeviceLimits {
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 64,
            ..Default::default()
        }))
    }

    #[test]
    fn allocations_are_aligned() {
        let device = device();
        let shared: SharedDevice = device.clone();
        let mut pool = BufferPool::new(&shared, vk::BufferUsageFlags::UNIFORM_BUFFER, 1024);
        let a = pool.allocate(10).unwrap();
        let b = pool.allocate(10).unwrap();
        assert_eq!(0, a.offset);
        assert_eq!(256, b.offset);
        assert_eq!(a.buffer, b.buffer);

        let mut pool = BufferPool::new(&shared, vk::BufferUsageFlags::VERTEX_BUFFER, 1024);
        pool.allocate(10).unwrap();
        assert_eq!(16, pool.allocate(10).unwrap().offset);
    }

    #[test]
    fn full_block_starts_new_one() {
        let device = device();
        let shared: SharedDevice = device.clone();
        let mut pool = BufferPool::new(&shared, vk::BufferUsageFlags::UNIFORM_BUFFER, 512);
        let a = pool.allocate(256).unwrap();
        pool.allocate(256).unwrap();
        let c = pool.allocate(1).unwrap();
        assert_ne!(a.buffer, c.buffer);
        assert_eq!(0, c.offset);
        assert_eq!(2, pool.block_count());
    }

    #[test]
    fn reset_recycles_blocks() {
        let device = device();
        let shared: SharedDevice = device.clone();
        let mut pool = BufferPool::new(&shared, vk::BufferUsageFlags::UNIFORM_BUFFER, 512);
        let first = pool.allocate(300).unwrap();
        let second = pool.allocate(300).unwrap();
        let big = pool.allocate(4096).unwrap();
        assert_eq!(Some(4096), device.buffer_size(big.buffer));
        assert_eq!(3, device.created("Buffer"));

        pool.reset();
        assert_eq!(1, device.destroyed("Buffer"));
        let a = pool.allocate(300).unwrap();
        let b = pool.allocate(300).unwrap();
        assert_eq!(3, device.created("Buffer"));
        assert_eq!(2, pool.block_count());
        assert_eq!(second.buffer, a.buffer);
        assert_eq!(first.buffer, b.buffer);

        drop(pool);
        assert_eq!(3, device.destroyed("Buffer"));
    }

    #[test]
    fn manager_uploads_data() {
        let device = device();
        let shared: SharedDevice = device.clone();
        let manager = BufferManager::new(&shared, &BindingConfig::default());
        let allocation = manager
            .upload(vk::BufferUsageFlags::STORAGE_BUFFER, &[1, 2, 3, 4])
            .unwrap();
        assert_eq!(4, allocation.size);
        assert_eq!(
            vec![(allocation.buffer, allocation.offset, vec![1, 2, 3, 4])],
            device.buffer_writes()
        );
        assert!(matches!(
            manager.allocate(vk::BufferUsageFlags::INDIRECT_BUFFER, 16),
            Err(BackendError::NoBufferPool(_))
        ));

        manager.reset();
        let again = manager
            .upload(vk::BufferUsageFlags::STORAGE_BUFFER, &[5])
            .unwrap();
        assert_eq!(allocation.buffer, again.buffer);
        assert_eq!(0, again.offset);
    }
}
