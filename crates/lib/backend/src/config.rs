// Copyright (C) 2023-2024 gigablaster

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

use ash::vk;

use crate::{BackendError, BackendResult};

pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;
pub const DEFAULT_DESCRIPTOR_CACHE_CAPACITY: usize = 1080;
pub const DEFAULT_SETS_PER_POOL: u32 = 1000;
pub const DEFAULT_BUFFER_BLOCK_SIZE: u64 = 256 * 1024;

/// Descriptor count per set for every descriptor type in a pool.
///
/// Pool for `N` sets gets `ceil(ratio * N)` descriptors of each type.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorPoolSizes {
    ratios: Vec<(vk::DescriptorType, f32)>,
}

impl Default for DescriptorPoolSizes {
    fn default() -> Self {
        Self {
            ratios: vec![
                (vk::DescriptorType::SAMPLER, 0.5),
                (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4.0),
                (vk::DescriptorType::SAMPLED_IMAGE, 4.0),
                (vk::DescriptorType::STORAGE_IMAGE, 1.0),
                (vk::DescriptorType::UNIFORM_TEXEL_BUFFER, 1.0),
                (vk::DescriptorType::STORAGE_TEXEL_BUFFER, 1.0),
                (vk::DescriptorType::UNIFORM_BUFFER, 1.0),
                (vk::DescriptorType::STORAGE_BUFFER, 1.0),
                (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, 2.0),
                (vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, 2.0),
                (vk::DescriptorType::INPUT_ATTACHMENT, 0.5),
            ],
        }
    }
}

impl DescriptorPoolSizes {
    /// Overrides ratio for a single type, adds it if it wasn't there.
    pub fn ratio(mut self, ty: vk::DescriptorType, ratio: f32) -> Self {
        if let Some(item) = self.ratios.iter_mut().find(|(x, _)| *x == ty) {
            item.1 = ratio;
        } else {
            self.ratios.push((ty, ratio));
        }

        self
    }

    pub fn pool_sizes(&self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        self.ratios
            .iter()
            .filter(|(_, ratio)| *ratio > 0.0)
            .map(|(ty, ratio)| vk::DescriptorPoolSize {
                ty: *ty,
                descriptor_count: ((sets as f32 * ratio).ceil() as u32).max(1),
            })
            .collect()
    }
}

/// Tunables of the binding layer. Owner of the device fills it and passes to
/// [`crate::RenderContext::new`].
#[derive(Debug, Clone)]
pub struct BindingConfig {
    pub frames_in_flight: usize,
    pub descriptor_cache_capacity: usize,
    pub sets_per_pool: u32,
    pub pool_sizes: DescriptorPoolSizes,
    pub buffer_block_size: u64,
    pub buffer_usages: Vec<vk::BufferUsageFlags>,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            descriptor_cache_capacity: DEFAULT_DESCRIPTOR_CACHE_CAPACITY,
            sets_per_pool: DEFAULT_SETS_PER_POOL,
            pool_sizes: DescriptorPoolSizes::default(),
            buffer_block_size: DEFAULT_BUFFER_BLOCK_SIZE,
            buffer_usages: vec![
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                vk::BufferUsageFlags::VERTEX_BUFFER,
                vk::BufferUsageFlags::INDEX_BUFFER,
                vk::BufferUsageFlags::TRANSFER_SRC,
            ],
        }
    }
}

impl BindingConfig {
    pub fn frames_in_flight(mut self, value: usize) -> Self {
        self.frames_in_flight = value.max(1);

        self
    }

    pub fn descriptor_cache_capacity(mut self, value: usize) -> Self {
        self.descriptor_cache_capacity = value.max(1);

        self
    }

    pub fn sets_per_pool(mut self, value: u32) -> Self {
        self.sets_per_pool = value.max(1);

        self
    }

    pub fn pool_sizes(mut self, value: DescriptorPoolSizes) -> Self {
        self.pool_sizes = value;

        self
    }

    pub fn buffer_block_size(mut self, value: u64) -> Self {
        self.buffer_block_size = value;

        self
    }

    pub fn buffer_usages(mut self, value: &[vk::BufferUsageFlags]) -> Self {
        self.buffer_usages = value.to_vec();

        self
    }

    /// Fields are public, so struct literal can bypass setter clamps.
    pub fn validate(&self) -> BackendResult<()> {
        if self.frames_in_flight == 0 {
            return Err(BackendError::InvalidConfig("frames_in_flight must be positive"));
        }
        if self.descriptor_cache_capacity == 0 {
            return Err(BackendError::InvalidConfig(
                "descriptor_cache_capacity must be positive",
            ));
        }
        if self.sets_per_pool == 0 {
            return Err(BackendError::InvalidConfig("sets_per_pool must be positive"));
        }
        if self.buffer_block_size == 0 {
            return Err(BackendError::InvalidConfig("buffer_block_size must be positive"));
        }

        Ok(())
    }
}
