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

//! Recording device for tests. Hands out unique fake handles and remembers
//! every call made through [`DeviceApi`].

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::Duration,
};

use ash::vk::{self, Handle};
use parking_lot::Mutex;

use crate::{BackendError, BackendResult};

use super::{DescriptorWrite, DeviceApi, DeviceLimits};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorBindCall {
    pub layout: vk::PipelineLayout,
    pub first_set: u32,
    pub sets: Vec<vk::DescriptorSet>,
    pub dynamic_offsets: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConstantCall {
    pub stages: vk::ShaderStageFlags,
    pub offset: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawCall {
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    Indexed {
        index_count: u32,
        instance_count: u32,
        vertex_offset: i32,
    },
}

#[derive(Debug, Default)]
struct MockState {
    created: HashMap<&'static str, usize>,
    destroyed: HashMap<&'static str, usize>,
    fail_next: bool,
    fail_next_pool_reset: bool,
    pools: HashMap<vk::DescriptorPool, u32>,
    pool_resets: usize,
    allocated_sets: usize,
    write_calls: usize,
    writes: Vec<DescriptorWrite>,
    last_pipeline_cache: vk::PipelineCache,
    pipeline_binds: Vec<vk::Pipeline>,
    descriptor_binds: Vec<DescriptorBindCall>,
    vertex_binds: Vec<(u32, Vec<vk::Buffer>, Vec<u64>)>,
    index_binds: Vec<(vk::Buffer, u64, vk::IndexType)>,
    push_constants: Vec<PushConstantCall>,
    render_passes: Vec<(vk::RenderPass, vk::Framebuffer, vk::Extent2D)>,
    subpasses: usize,
    ended_passes: usize,
    draws: Vec<DrawCall>,
    buffer_writes: Vec<(vk::Buffer, u64, Vec<u8>)>,
    buffer_sizes: HashMap<vk::Buffer, u64>,
    fences: HashMap<vk::Fence, bool>,
    fence_waits: usize,
    fence_resets: usize,
}

pub struct MockDevice {
    limits: DeviceLimits,
    next_handle: AtomicU64,
    creation_delay: Duration,
    pool_capacity: u32,
    state: Mutex<MockState>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self {
            limits: DeviceLimits::default(),
            next_handle: AtomicU64::new(1),
            creation_delay: Duration::ZERO,
            pool_capacity: u32::MAX,
            state: Mutex::default(),
        }
    }
}

impl MockDevice {
    /// Descriptor set layout creation sleeps that long.
    pub fn creation_delay(mut self, ms: u64) -> Self {
        self.creation_delay = Duration::from_millis(ms);
        self
    }

    /// How many sets fit into one descriptor pool.
    pub fn pool_capacity(mut self, value: u32) -> Self {
        self.pool_capacity = value;
        self
    }

    pub fn with_limits(mut self, value: DeviceLimits) -> Self {
        self.limits = value;
        self
    }

    pub fn fail_next_creation(&self) {
        self.state.lock().fail_next = true;
    }

    pub fn fail_next_pool_reset(&self) {
        self.state.lock().fail_next_pool_reset = true;
    }

    pub fn created(&self, kind: &str) -> usize {
        self.state.lock().created.get(kind).copied().unwrap_or(0)
    }

    pub fn destroyed(&self, kind: &str) -> usize {
        self.state.lock().destroyed.get(kind).copied().unwrap_or(0)
    }

    pub fn allocated_sets(&self) -> usize {
        self.state.lock().allocated_sets
    }

    pub fn pool_resets(&self) -> usize {
        self.state.lock().pool_resets
    }

    pub fn write_calls(&self) -> usize {
        self.state.lock().write_calls
    }

    pub fn writes(&self) -> Vec<DescriptorWrite> {
        self.state.lock().writes.clone()
    }

    pub fn last_pipeline_cache(&self) -> vk::PipelineCache {
        self.state.lock().last_pipeline_cache
    }

    pub fn pipeline_binds(&self) -> Vec<vk::Pipeline> {
        self.state.lock().pipeline_binds.clone()
    }

    pub fn descriptor_binds(&self) -> Vec<DescriptorBindCall> {
        self.state.lock().descriptor_binds.clone()
    }

    pub fn vertex_binds(&self) -> Vec<(u32, Vec<vk::Buffer>, Vec<u64>)> {
        self.state.lock().vertex_binds.clone()
    }

    pub fn index_binds(&self) -> Vec<(vk::Buffer, u64, vk::IndexType)> {
        self.state.lock().index_binds.clone()
    }

    pub fn push_constant_calls(&self) -> Vec<PushConstantCall> {
        self.state.lock().push_constants.clone()
    }

    pub fn render_passes(&self) -> Vec<(vk::RenderPass, vk::Framebuffer, vk::Extent2D)> {
        self.state.lock().render_passes.clone()
    }

    pub fn subpasses(&self) -> usize {
        self.state.lock().subpasses
    }

    pub fn ended_passes(&self) -> usize {
        self.state.lock().ended_passes
    }

    pub fn draws(&self) -> Vec<DrawCall> {
        self.state.lock().draws.clone()
    }

    pub fn buffer_writes(&self) -> Vec<(vk::Buffer, u64, Vec<u8>)> {
        self.state.lock().buffer_writes.clone()
    }

    pub fn buffer_size(&self, buffer: vk::Buffer) -> Option<u64> {
        self.state.lock().buffer_sizes.get(&buffer).copied()
    }

    pub fn fence_waits(&self) -> usize {
        self.state.lock().fence_waits
    }

    pub fn fence_resets(&self) -> usize {
        self.state.lock().fence_resets
    }

    /// Acts as GPU finishing submission that signals `fence`.
    pub fn signal_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.insert(fence, true);
    }

    pub fn is_signaled(&self, fence: vk::Fence) -> bool {
        self.state.lock().fences.get(&fence).copied().unwrap_or(false)
    }

    fn handle<T: Handle>(&self) -> T {
        T::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn create<T: Handle>(&self, kind: &'static str) -> BackendResult<T> {
        let mut state = self.state.lock();
        if state.fail_next {
            state.fail_next = false;
            return Err(BackendError::OutOfDeviceMemory);
        }
        *state.created.entry(kind).or_default() += 1;

        Ok(self.handle())
    }

    fn destroy(&self, kind: &'static str) {
        *self.state.lock().destroyed.entry(kind).or_default() += 1;
    }
}

impl DeviceApi for MockDevice {
    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> BackendResult<vk::DescriptorSetLayout> {
        if !self.creation_delay.is_zero() {
            thread::sleep(self.creation_delay);
        }
        self.create("DescriptorSetLayout")
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {
        self.destroy("DescriptorSetLayout");
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constants: &[vk::PushConstantRange],
    ) -> BackendResult<vk::PipelineLayout> {
        self.create("PipelineLayout")
    }

    fn destroy_pipeline_layout(&self, _layout: vk::PipelineLayout) {
        self.destroy("PipelineLayout");
    }

    fn create_render_pass(
        &self,
        _info: &vk::RenderPassCreateInfo,
    ) -> BackendResult<vk::RenderPass> {
        self.create("RenderPass")
    }

    fn destroy_render_pass(&self, _render_pass: vk::RenderPass) {
        self.destroy("RenderPass");
    }

    fn create_framebuffer(
        &self,
        _info: &vk::FramebufferCreateInfo,
    ) -> BackendResult<vk::Framebuffer> {
        self.create("Framebuffer")
    }

    fn destroy_framebuffer(&self, _framebuffer: vk::Framebuffer) {
        self.destroy("Framebuffer");
    }

    fn create_graphics_pipeline(
        &self,
        cache: vk::PipelineCache,
        _info: &vk::GraphicsPipelineCreateInfo,
    ) -> BackendResult<vk::Pipeline> {
        let pipeline = self.create("RenderPipeline")?;
        self.state.lock().last_pipeline_cache = cache;

        Ok(pipeline)
    }

    fn destroy_pipeline(&self, _pipeline: vk::Pipeline) {
        self.destroy("RenderPipeline");
    }

    fn create_descriptor_pool(
        &self,
        _max_sets: u32,
        _sizes: &[vk::DescriptorPoolSize],
    ) -> BackendResult<vk::DescriptorPool> {
        let pool = self.create("DescriptorPool")?;
        self.state.lock().pools.insert(pool, self.pool_capacity);

        Ok(pool)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> BackendResult<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_pool_reset) {
            return Err(BackendError::OutOfHostMemory);
        }
        state.pool_resets += 1;
        state.pools.insert(pool, self.pool_capacity);

        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.state.lock().pools.remove(&pool);
        self.destroy("DescriptorPool");
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        let mut state = self.state.lock();
        let Some(left) = state.pools.get_mut(&pool) else {
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        if *left == 0 {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        *left -= 1;
        state.allocated_sets += 1;

        Ok(self.handle())
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let mut state = self.state.lock();
        state.write_calls += 1;
        state.writes.extend_from_slice(writes);
    }

    fn create_host_buffer(
        &self,
        size: u64,
        _usage: vk::BufferUsageFlags,
    ) -> BackendResult<vk::Buffer> {
        let buffer = self.create("Buffer")?;
        self.state.lock().buffer_sizes.insert(buffer, size);

        Ok(buffer)
    }

    fn write_host_buffer(
        &self,
        buffer: vk::Buffer,
        offset: u64,
        data: &[u8],
    ) -> BackendResult<()> {
        let mut state = self.state.lock();
        let size = state.buffer_sizes.get(&buffer).copied().unwrap_or(0);
        assert!(
            offset + data.len() as u64 <= size,
            "write out of buffer bounds"
        );
        state.buffer_writes.push((buffer, offset, data.to_vec()));

        Ok(())
    }

    fn destroy_host_buffer(&self, buffer: vk::Buffer) {
        self.state.lock().buffer_sizes.remove(&buffer);
        self.destroy("Buffer");
    }

    fn create_fence(&self, signaled: bool) -> BackendResult<vk::Fence> {
        let fence = self.create("Fence")?;
        self.state.lock().fences.insert(fence, signaled);

        Ok(fence)
    }

    // Real device would block forever on unsignaled fence nobody is going to signal.
    fn wait_for_fence(&self, fence: vk::Fence) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.fence_waits += 1;
        match state.fences.get(&fence) {
            Some(true) => Ok(()),
            _ => Err(BackendError::Vulkan(vk::Result::TIMEOUT)),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.fence_resets += 1;
        state.fences.insert(fence, false);

        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence);
        self.destroy("Fence");
    }

    fn cmd_bind_pipeline(&self, _cb: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.state.lock().pipeline_binds.push(pipeline);
    }

    fn cmd_bind_descriptor_sets(
        &self,
        _cb: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        self.state.lock().descriptor_binds.push(DescriptorBindCall {
            layout,
            first_set,
            sets: sets.to_vec(),
            dynamic_offsets: dynamic_offsets.to_vec(),
        });
    }

    fn cmd_bind_vertex_buffers(
        &self,
        _cb: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[u64],
    ) {
        self.state
            .lock()
            .vertex_binds
            .push((first_binding, buffers.to_vec(), offsets.to_vec()));
    }

    fn cmd_bind_index_buffer(
        &self,
        _cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    ) {
        self.state
            .lock()
            .index_binds
            .push((buffer, offset, index_type));
    }

    fn cmd_push_constants(
        &self,
        _cb: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.state.lock().push_constants.push(PushConstantCall {
            stages,
            offset,
            data: data.to_vec(),
        });
    }

    fn cmd_begin_render_pass(&self, _cb: vk::CommandBuffer, info: &vk::RenderPassBeginInfo) {
        self.state.lock().render_passes.push((
            info.render_pass,
            info.framebuffer,
            info.render_area.extent,
        ));
    }

    fn cmd_next_subpass(&self, _cb: vk::CommandBuffer) {
        self.state.lock().subpasses += 1;
    }

    fn cmd_end_render_pass(&self, _cb: vk::CommandBuffer) {
        self.state.lock().ended_passes += 1;
    }

    fn cmd_draw(
        &self,
        _cb: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.state.lock().draws.push(DrawCall::Draw {
            vertex_count,
            instance_count,
        });
    }

    fn cmd_draw_indexed(
        &self,
        _cb: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.state.lock().draws.push(DrawCall::Indexed {
            index_count,
            instance_count,
            vertex_offset,
        });
    }
}
