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

use std::{collections::HashMap, fmt::Debug, slice, sync::Arc};

use ash::vk;
use gpu_alloc::{Request, UsageFlags};
use gpu_alloc_ash::{device_properties, AshMemoryDevice};
use log::{debug, info};
use parking_lot::Mutex;

use crate::{BackendError, BackendResult};

use super::{BufferBinding, GpuAllocator, GpuMemory, ImageBinding};

const DEFAULT_ALIGNMENT: u64 = 16;

pub type SharedDevice = Arc<dyn DeviceApi>;

/// Subset of physical device limits the binding layer cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub min_uniform_buffer_offset_alignment: u64,
    pub min_storage_buffer_offset_alignment: u64,
    pub max_push_constants_size: u32,
    pub max_bound_descriptor_sets: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 256,
            max_push_constants_size: 128,
            max_bound_descriptor_sets: 4,
        }
    }
}

impl From<&vk::PhysicalDeviceLimits> for DeviceLimits {
    fn from(value: &vk::PhysicalDeviceLimits) -> Self {
        Self {
            min_uniform_buffer_offset_alignment: value.min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: value.min_storage_buffer_offset_alignment,
            max_push_constants_size: value.max_push_constants_size,
            max_bound_descriptor_sets: value.max_bound_descriptor_sets,
        }
    }
}

impl DeviceLimits {
    /// Offset alignment for suballocations of a buffer with given usage.
    pub fn alignment(&self, usage: vk::BufferUsageFlags) -> u64 {
        let mut alignment = DEFAULT_ALIGNMENT;
        if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
            alignment = alignment.max(self.min_uniform_buffer_offset_alignment);
        }
        if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
            alignment = alignment.max(self.min_storage_buffer_offset_alignment);
        }

        alignment
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorResource {
    Buffer(BufferBinding),
    Image(ImageBinding),
}

/// Single array element write into descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
    pub ty: vk::DescriptorType,
    pub resource: DescriptorResource,
}

/// Every device call issued by the binding layer.
///
/// Device bootstrap lives elsewhere, this is the seam between caching logic and
/// the driver. Implementations must be callable from any command recording thread.
pub trait DeviceApi: Send + Sync {
    fn limits(&self) -> &DeviceLimits;

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> BackendResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> BackendResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo)
        -> BackendResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo)
        -> BackendResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    fn create_graphics_pipeline(
        &self,
        cache: vk::PipelineCache,
        info: &vk::GraphicsPipelineCreateInfo,
    ) -> BackendResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> BackendResult<vk::DescriptorPool>;
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> BackendResult<()>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Raw result is returned so pool exhaustion can be told apart from other failures.
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, vk::Result>;
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    fn create_host_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> BackendResult<vk::Buffer>;
    fn write_host_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8])
        -> BackendResult<()>;
    fn destroy_host_buffer(&self, buffer: vk::Buffer);

    fn create_fence(&self, signaled: bool) -> BackendResult<vk::Fence>;
    fn wait_for_fence(&self, fence: vk::Fence) -> BackendResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> BackendResult<()>;
    fn destroy_fence(&self, fence: vk::Fence);

    fn cmd_bind_pipeline(&self, cb: vk::CommandBuffer, pipeline: vk::Pipeline);
    fn cmd_bind_descriptor_sets(
        &self,
        cb: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    );
    fn cmd_bind_vertex_buffers(
        &self,
        cb: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
    );
    fn cmd_bind_index_buffer(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    );
    fn cmd_push_constants(
        &self,
        cb: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );
    fn cmd_begin_render_pass(&self, cb: vk::CommandBuffer, info: &vk::RenderPassBeginInfo);
    fn cmd_next_subpass(&self, cb: vk::CommandBuffer);
    fn cmd_end_render_pass(&self, cb: vk::CommandBuffer);
    fn cmd_draw(
        &self,
        cb: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &self,
        cb: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
}

/// Device backed by ash.
///
/// Takes already created logical device. Host visible buffers are backed by
/// gpu-alloc memory blocks.
pub struct Device {
    raw: ash::Device,
    limits: DeviceLimits,
    memory_allocator: Mutex<GpuAllocator>,
    buffers: Mutex<HashMap<vk::Buffer, GpuMemory>>,
}

impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("raw", &self.raw.handle())
            .field("limits", &self.limits)
            .finish()
    }
}

impl Device {
    /// # Safety
    ///
    /// `raw` must be created from `physical_device` of `instance` and outlive
    /// every object created through this device.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        api_version: u32,
        raw: ash::Device,
    ) -> BackendResult<Self> {
        let properties = instance.get_physical_device_properties(physical_device);
        let limits = DeviceLimits::from(&properties.limits);
        info!("Device limits: {:?}", limits);

        let allocator_config = gpu_alloc::Config {
            dedicated_threshold: 64 * 1024 * 1024,
            preferred_dedicated_threshold: 16 * 1024 * 1024,
            transient_dedicated_threshold: 32 * 1024 * 1024,
            final_free_list_chunk: 1024 * 1024,
            minimal_buddy_size: 256,
            starting_free_list_chunk: 256 * 1024,
            initial_buddy_dedicated_size: 128 * 1024 * 1024,
        };
        let allocator_props = device_properties(instance, api_version, physical_device)?;

        Ok(Self {
            raw,
            limits,
            memory_allocator: Mutex::new(GpuAllocator::new(allocator_config, allocator_props)),
            buffers: Mutex::default(),
        })
    }

    pub fn raw(&self) -> &ash::Device {
        &self.raw
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let mut allocator = self.memory_allocator.lock();
        for (buffer, memory) in self.buffers.lock().drain() {
            unsafe {
                self.raw.destroy_buffer(buffer, None);
                allocator.dealloc(AshMemoryDevice::wrap(&self.raw), memory);
            }
        }
        unsafe { allocator.cleanup(AshMemoryDevice::wrap(&self.raw)) };
    }
}

impl DeviceApi for Device {
    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> BackendResult<vk::DescriptorSetLayout> {
        let info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(bindings)
            .build();
        Ok(unsafe { self.raw.create_descriptor_set_layout(&info, None) }?)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.raw.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> BackendResult<vk::PipelineLayout> {
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constants)
            .build();
        Ok(unsafe { self.raw.create_pipeline_layout(&info, None) }?)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.raw.destroy_pipeline_layout(layout, None) };
    }

    fn create_render_pass(
        &self,
        info: &vk::RenderPassCreateInfo,
    ) -> BackendResult<vk::RenderPass> {
        Ok(unsafe { self.raw.create_render_pass(info, None) }?)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.raw.destroy_render_pass(render_pass, None) };
    }

    fn create_framebuffer(
        &self,
        info: &vk::FramebufferCreateInfo,
    ) -> BackendResult<vk::Framebuffer> {
        Ok(unsafe { self.raw.create_framebuffer(info, None) }?)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.raw.destroy_framebuffer(framebuffer, None) };
    }

    fn create_graphics_pipeline(
        &self,
        cache: vk::PipelineCache,
        info: &vk::GraphicsPipelineCreateInfo,
    ) -> BackendResult<vk::Pipeline> {
        let pipelines = unsafe {
            self.raw
                .create_graphics_pipelines(cache, slice::from_ref(info), None)
        }?;

        pipelines
            .first()
            .copied()
            .ok_or(BackendError::Vulkan(vk::Result::ERROR_UNKNOWN))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.raw.destroy_pipeline(pipeline, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> BackendResult<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(sizes)
            .build();
        let pool = unsafe { self.raw.create_descriptor_pool(&info, None) }?;
        debug!("Created descriptor pool {:?} for {} sets", pool, max_sets);

        Ok(pool)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> BackendResult<()> {
        unsafe {
            self.raw
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }?;

        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.raw.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(slice::from_ref(&layout))
            .build();
        let sets = unsafe { self.raw.allocate_descriptor_sets(&info) }?;

        sets.first().copied().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        if writes.is_empty() {
            return;
        }
        // Infos must stay in place until the call, so collect them before taking pointers.
        let buffer_infos = writes
            .iter()
            .map(|write| match write.resource {
                DescriptorResource::Buffer(buffer) => vk::DescriptorBufferInfo {
                    buffer: buffer.buffer,
                    offset: buffer.offset,
                    range: buffer.range,
                },
                DescriptorResource::Image(_) => vk::DescriptorBufferInfo::default(),
            })
            .collect::<Vec<_>>();
        let image_infos = writes
            .iter()
            .map(|write| match write.resource {
                DescriptorResource::Image(image) => vk::DescriptorImageInfo {
                    sampler: image.sampler,
                    image_view: image.view,
                    image_layout: image.layout,
                },
                DescriptorResource::Buffer(_) => vk::DescriptorImageInfo::default(),
            })
            .collect::<Vec<_>>();
        let raw_writes = writes
            .iter()
            .enumerate()
            .map(|(index, write)| {
                let builder = vk::WriteDescriptorSet::builder()
                    .dst_set(write.set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(write.ty);
                match write.resource {
                    DescriptorResource::Buffer(_) => {
                        builder.buffer_info(slice::from_ref(&buffer_infos[index]))
                    }
                    DescriptorResource::Image(_) => {
                        builder.image_info(slice::from_ref(&image_infos[index]))
                    }
                }
                .build()
            })
            .collect::<Vec<_>>();

        unsafe { self.raw.update_descriptor_sets(&raw_writes, &[]) };
    }

    fn create_host_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> BackendResult<vk::Buffer> {
        let info = vk::BufferCreateInfo::builder()
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .size(size)
            .build();
        let buffer = unsafe { self.raw.create_buffer(&info, None) }?;
        let requirements = unsafe { self.raw.get_buffer_memory_requirements(buffer) };
        let request = Request {
            size: requirements.size,
            align_mask: requirements.alignment - 1,
            usage: UsageFlags::HOST_ACCESS | UsageFlags::UPLOAD,
            memory_types: requirements.memory_type_bits,
        };
        let memory = match unsafe {
            self.memory_allocator
                .lock()
                .alloc(AshMemoryDevice::wrap(&self.raw), request)
        } {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.raw.destroy_buffer(buffer, None) };
                return Err(err.into());
            }
        };
        if let Err(err) = unsafe {
            self.raw
                .bind_buffer_memory(buffer, *memory.memory(), memory.offset())
        } {
            unsafe {
                self.raw.destroy_buffer(buffer, None);
                self.memory_allocator
                    .lock()
                    .dealloc(AshMemoryDevice::wrap(&self.raw), memory);
            }
            return Err(err.into());
        }
        self.buffers.lock().insert(buffer, memory);

        Ok(buffer)
    }

    fn write_host_buffer(
        &self,
        buffer: vk::Buffer,
        offset: u64,
        data: &[u8],
    ) -> BackendResult<()> {
        let mut buffers = self.buffers.lock();
        let memory = buffers.get_mut(&buffer).ok_or(BackendError::NotSupported)?;
        unsafe { memory.write_bytes(AshMemoryDevice::wrap(&self.raw), offset, data) }?;

        Ok(())
    }

    fn destroy_host_buffer(&self, buffer: vk::Buffer) {
        if let Some(memory) = self.buffers.lock().remove(&buffer) {
            unsafe {
                self.raw.destroy_buffer(buffer, None);
                self.memory_allocator
                    .lock()
                    .dealloc(AshMemoryDevice::wrap(&self.raw), memory);
            }
        }
    }

    fn create_fence(&self, signaled: bool) -> BackendResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags).build();

        Ok(unsafe { self.raw.create_fence(&info, None) }?)
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> BackendResult<()> {
        puffin::profile_scope!("wait for fence");
        unsafe { self.raw.wait_for_fences(slice::from_ref(&fence), true, u64::MAX) }?;

        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> BackendResult<()> {
        unsafe { self.raw.reset_fences(slice::from_ref(&fence)) }?;

        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.raw.destroy_fence(fence, None) };
    }

    fn cmd_bind_pipeline(&self, cb: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe {
            self.raw
                .cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, pipeline)
        };
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cb: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        unsafe {
            self.raw.cmd_bind_descriptor_sets(
                cb,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                first_set,
                sets,
                dynamic_offsets,
            )
        };
    }

    fn cmd_bind_vertex_buffers(
        &self,
        cb: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
    ) {
        unsafe {
            self.raw
                .cmd_bind_vertex_buffers(cb, first_binding, buffers, offsets)
        };
    }

    fn cmd_bind_index_buffer(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.raw
                .cmd_bind_index_buffer(cb, buffer, offset, index_type)
        };
    }

    fn cmd_push_constants(
        &self,
        cb: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.raw
                .cmd_push_constants(cb, layout, stages, offset, data)
        };
    }

    fn cmd_begin_render_pass(&self, cb: vk::CommandBuffer, info: &vk::RenderPassBeginInfo) {
        unsafe {
            self.raw
                .cmd_begin_render_pass(cb, info, vk::SubpassContents::INLINE)
        };
    }

    fn cmd_next_subpass(&self, cb: vk::CommandBuffer) {
        unsafe { self.raw.cmd_next_subpass(cb, vk::SubpassContents::INLINE) };
    }

    fn cmd_end_render_pass(&self, cb: vk::CommandBuffer) {
        unsafe { self.raw.cmd_end_render_pass(cb) };
    }

    fn cmd_draw(
        &self,
        cb: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.raw
                .cmd_draw(cb, vertex_count, instance_count, first_vertex, first_instance)
        };
    }

    fn cmd_draw_indexed(
        &self,
        cb: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.raw.cmd_draw_indexed(
                cb,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }
}

#[cfg(test)]
mod test {
    use ash::vk;

    use super::DeviceLimits;

    #[test]
    fn alignment_per_usage() {
        let limits = DeviceLimits {
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 64,
            ..Default::default()
        };
        assert_eq!(16, limits.alignment(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert_eq!(16, limits.alignment(vk::BufferUsageFlags::INDEX_BUFFER));
        assert_eq!(256, limits.alignment(vk::BufferUsageFlags::UNIFORM_BUFFER));
        assert_eq!(64, limits.alignment(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert_eq!(
            256,
            limits.alignment(
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::UNIFORM_BUFFER
            )
        );
    }
}
