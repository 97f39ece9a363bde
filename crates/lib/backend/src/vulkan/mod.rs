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

mod binding_state;
mod buffer_pool;
mod descriptor_allocator;
mod descriptor_manager;
mod descriptors;
mod device;
mod encoder;
mod frame;
mod layout;
#[cfg(test)]
pub(crate) mod mock;
mod pipeline;
mod render_pass;
mod resource_cache;

use ash::vk;
pub use binding_state::*;
pub use buffer_pool::*;
pub use descriptor_allocator::*;
pub use descriptor_manager::*;
pub use descriptors::*;
pub use device::*;
pub use encoder::*;
pub use frame::*;
pub use layout::*;
pub use pipeline::*;
pub use render_pass::*;
pub use resource_cache::*;

pub type GpuAllocator = gpu_alloc::GpuAllocator<vk::DeviceMemory>;
pub type GpuMemory = gpu_alloc::MemoryBlock<vk::DeviceMemory>;
