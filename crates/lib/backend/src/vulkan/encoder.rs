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

use std::{collections::BTreeMap, fmt::Debug, slice, sync::Arc};

use ash::vk;
use bitflags::bitflags;
use log::warn;

use crate::BackendResult;

use super::{
    is_buffer_descriptor_type, is_depth_format, is_dynamic_buffer_descriptor_type,
    BufferBinding, DescriptorSetInfo, DescriptorSetManager, FrameToken, Framebuffer,
    ImageBinding, PipelineLayout, ResourceBindingState, ResourceInfo, RenderPipeline,
    SharedDevice,
};

pub const MAX_VERTEX_BUFFERS: usize = 16;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct DirtyState: u32 {
        const PIPELINE = 1 << 0;
        const VERTEX_BUFFERS = 1 << 1;
        const INDEX_BUFFER = 1 << 2;
    }
}

fn image_layout(ty: vk::DescriptorType, depth_stencil: bool) -> vk::ImageLayout {
    match ty {
        vk::DescriptorType::STORAGE_IMAGE => vk::ImageLayout::GENERAL,
        vk::DescriptorType::SAMPLER => vk::ImageLayout::UNDEFINED,
        _ if depth_stencil => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        _ => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }
}

/// Records draws into one command buffer.
///
/// Resources are bound by `(set, binding, array element)` and turned into
/// descriptor sets lazily, right before draw. Sets whose resources didn't change
/// since last draw aren't touched at all.
pub struct RenderCommandEncoder<'a> {
    device: SharedDevice,
    cb: vk::CommandBuffer,
    descriptors: &'a DescriptorSetManager,
    token: FrameToken,
    resources: ResourceBindingState,
    pipeline: Option<Arc<RenderPipeline>>,
    bound_sets: BTreeMap<u32, vk::DescriptorSetLayout>,
    vertex_buffers: [(vk::Buffer, u64); MAX_VERTEX_BUFFERS],
    vertex_range: Option<(u32, u32)>,
    index_buffer: Option<(vk::Buffer, u64, vk::IndexType)>,
    dirty: DirtyState,
}

impl<'a> Debug for RenderCommandEncoder<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderCommandEncoder")
            .field("cb", &self.cb)
            .field("token", &self.token)
            .field("pipeline", &self.pipeline.as_ref().map(|x| x.raw()))
            .field("bound_sets", &self.bound_sets)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl<'a> RenderCommandEncoder<'a> {
    pub fn new(
        device: &SharedDevice,
        cb: vk::CommandBuffer,
        descriptors: &'a DescriptorSetManager,
        token: FrameToken,
    ) -> Self {
        Self {
            device: device.clone(),
            cb,
            descriptors,
            token,
            resources: ResourceBindingState::default(),
            pipeline: None,
            bound_sets: BTreeMap::new(),
            vertex_buffers: [(vk::Buffer::null(), 0); MAX_VERTEX_BUFFERS],
            vertex_range: None,
            index_buffer: None,
            dirty: DirtyState::empty(),
        }
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.cb
    }

    pub fn bind_uniform_buffer(
        &mut self,
        set: u32,
        binding: u32,
        array_element: u32,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    ) {
        self.resources
            .bind_buffer(set, binding, array_element, buffer, offset, range);
    }

    pub fn bind_storage_buffer(
        &mut self,
        set: u32,
        binding: u32,
        array_element: u32,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    ) {
        self.resources
            .bind_buffer(set, binding, array_element, buffer, offset, range);
    }

    /// Layout the image is read in is taken from its format.
    pub fn bind_image_view(
        &mut self,
        set: u32,
        binding: u32,
        array_element: u32,
        view: vk::ImageView,
        format: vk::Format,
    ) {
        self.resources
            .bind_image(set, binding, array_element, view, is_depth_format(format));
    }

    pub fn bind_sampler(&mut self, set: u32, binding: u32, array_element: u32, sampler: vk::Sampler) {
        self.resources
            .bind_sampler(set, binding, array_element, sampler);
    }

    pub fn bind_image_sampler(
        &mut self,
        set: u32,
        binding: u32,
        array_element: u32,
        view: vk::ImageView,
        format: vk::Format,
        sampler: vk::Sampler,
    ) {
        self.resources.bind_image_sampler(
            set,
            binding,
            array_element,
            view,
            sampler,
            is_depth_format(format),
        );
    }

    pub fn bind_input_attachment(
        &mut self,
        set: u32,
        binding: u32,
        array_element: u32,
        view: vk::ImageView,
        format: vk::Format,
    ) {
        self.resources
            .bind_input(set, binding, array_element, view, is_depth_format(format));
    }

    pub fn bind_vertex_buffer(&mut self, binding: u32, buffer: vk::Buffer, offset: u64) {
        let Some(slot) = self.vertex_buffers.get_mut(binding as usize) else {
            warn!("Vertex buffer binding {} is out of range, skipped", binding);
            return;
        };
        if *slot == (buffer, offset) {
            return;
        }
        *slot = (buffer, offset);
        self.vertex_range = Some(match self.vertex_range {
            Some((first, last)) => (first.min(binding), last.max(binding)),
            None => (binding, binding),
        });
        self.dirty |= DirtyState::VERTEX_BUFFERS;
    }

    pub fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[(vk::Buffer, u64)]) {
        for (index, (buffer, offset)) in buffers.iter().enumerate() {
            self.bind_vertex_buffer(first_binding + index as u32, *buffer, *offset);
        }
    }

    pub fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType) {
        let value = Some((buffer, offset, index_type));
        if self.index_buffer != value {
            self.index_buffer = value;
            self.dirty |= DirtyState::INDEX_BUFFER;
        }
    }

    pub fn set_render_pipeline(&mut self, pipeline: &Arc<RenderPipeline>) {
        if self.pipeline.as_ref().map(|x| x.raw()) != Some(pipeline.raw()) {
            self.pipeline = Some(pipeline.clone());
            self.dirty |= DirtyState::PIPELINE;
        }
    }

    pub fn render_pipeline(&self) -> Option<&Arc<RenderPipeline>> {
        self.pipeline.as_ref()
    }

    /// Pushes constants with stages taken from current pipeline layout.
    pub fn push_constants(&mut self, offset: u32, data: &[u8]) {
        let Some(pipeline) = &self.pipeline else {
            warn!("Push constants without render pipeline, skipped");
            return;
        };
        let layout = pipeline.layout();
        let stages = u32::try_from(data.len())
            .map(|size| layout.push_constant_stages(offset, size))
            .unwrap_or(vk::ShaderStageFlags::empty());
        if stages.is_empty() {
            warn!(
                "No push constant range covers {} bytes at offset {}",
                data.len(),
                offset
            );
            return;
        }
        self.device
            .cmd_push_constants(self.cb, layout.raw(), stages, offset, data);
    }

    pub fn begin_render_pass(&mut self, framebuffer: &Framebuffer, clear_values: &[vk::ClearValue]) {
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: framebuffer.extent(),
        };
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(framebuffer.render_pass().raw())
            .framebuffer(framebuffer.raw())
            .render_area(render_area)
            .clear_values(clear_values)
            .build();
        self.device.cmd_begin_render_pass(self.cb, &info);
    }

    pub fn next_subpass(&mut self) {
        self.device.cmd_next_subpass(self.cb);
    }

    pub fn end_render_pass(&mut self) {
        self.device.cmd_end_render_pass(self.cb);
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> BackendResult<()> {
        if self.flush_render_state()? {
            self.device.cmd_draw(
                self.cb,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }

        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> BackendResult<()> {
        if self.index_buffer.is_none() {
            warn!("Indexed draw without index buffer, skipped");
            return Ok(());
        }
        if self.flush_render_state()? {
            self.device.cmd_draw_indexed(
                self.cb,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }

        Ok(())
    }

    /// Forgets every bound resource. Already bound descriptor sets stay bound on
    /// command buffer.
    pub fn reset_bindings(&mut self) {
        self.resources.reset();
    }

    fn flush_render_state(&mut self) -> BackendResult<bool> {
        let Some(pipeline) = self.pipeline.clone() else {
            warn!("Draw without render pipeline, skipped");
            return Ok(false);
        };
        if self.dirty.contains(DirtyState::PIPELINE) {
            self.device.cmd_bind_pipeline(self.cb, pipeline.raw());
        }
        if self.dirty.contains(DirtyState::VERTEX_BUFFERS) {
            if let Some((first, last)) = self.vertex_range.take() {
                let range = &self.vertex_buffers[first as usize..=last as usize];
                let buffers = range.iter().map(|x| x.0).collect::<Vec<_>>();
                let offsets = range.iter().map(|x| x.1).collect::<Vec<_>>();
                self.device
                    .cmd_bind_vertex_buffers(self.cb, first, &buffers, &offsets);
            }
        }
        if self.dirty.contains(DirtyState::INDEX_BUFFER) {
            if let Some((buffer, offset, index_type)) = self.index_buffer {
                self.device
                    .cmd_bind_index_buffer(self.cb, buffer, offset, index_type);
            }
        }
        self.dirty = DirtyState::empty();
        self.flush_descriptor_state(pipeline.layout())?;

        Ok(true)
    }

    fn flush_descriptor_state(&mut self, layout: &PipelineLayout) -> BackendResult<()> {
        puffin::profile_function!();
        self.bound_sets.retain(|set, _| *set < layout.set_count());
        // Sets bound with other layout must be rebuilt even if nothing changed
        let mandatory = self
            .resources
            .set_indices()
            .filter(|set| match layout.set_layout(*set) {
                Some(expected) => self.bound_sets.get(set) != Some(&expected.raw()),
                None => false,
            })
            .collect::<Vec<_>>();
        if !self.resources.is_dirty() && mandatory.is_empty() {
            return Ok(());
        }

        let sets = self
            .resources
            .set_indices()
            .filter(|set| self.resources.is_set_dirty(*set) || mandatory.contains(set))
            .collect::<Vec<_>>();
        for set in sets {
            self.resources.clear_set_dirty(set);
            let Some(set_layout) = layout.set_layout(set) else {
                continue;
            };
            let Some(resources) = self.resources.set(set) else {
                continue;
            };

            let mut info = DescriptorSetInfo::new(set_layout);
            let mut dynamic_offsets = Vec::new();
            for binding in set_layout.desc().bindings() {
                for (array_element, resource) in resources.elements(binding.binding) {
                    if array_element >= binding.count {
                        break;
                    }
                    collect_resource(
                        &mut info,
                        &mut dynamic_offsets,
                        binding.binding,
                        binding.ty,
                        array_element,
                        resource,
                    );
                }
            }

            let raw = self.descriptors.descriptor_set(self.token, &info)?;
            self.device.cmd_bind_descriptor_sets(
                self.cb,
                layout.raw(),
                set,
                slice::from_ref(&raw),
                &dynamic_offsets,
            );
            self.bound_sets.insert(set, set_layout.raw());
        }
        self.resources.clear_dirty();

        Ok(())
    }
}

fn collect_resource(
    info: &mut DescriptorSetInfo,
    dynamic_offsets: &mut Vec<u32>,
    binding: u32,
    ty: vk::DescriptorType,
    array_element: u32,
    resource: &ResourceInfo,
) {
    if is_buffer_descriptor_type(ty) {
        if resource.buffer == vk::Buffer::null() {
            return;
        }
        let mut offset = resource.offset;
        if is_dynamic_buffer_descriptor_type(ty) {
            let Ok(dynamic) = u32::try_from(offset) else {
                warn!(
                    "Dynamic offset {} of binding {} doesn't fit 32 bits, skipped",
                    offset, binding
                );
                return;
            };
            dynamic_offsets.push(dynamic);
            offset = 0;
        }
        info.set_buffer(
            binding,
            array_element,
            BufferBinding {
                buffer: resource.buffer,
                offset,
                range: resource.range,
            },
        );
    } else if resource.image_view != vk::ImageView::null() || resource.sampler != vk::Sampler::null()
    {
        info.set_image(
            binding,
            array_element,
            ImageBinding {
                view: resource.image_view,
                sampler: resource.sampler,
                layout: image_layout(ty, resource.depth_stencil),
            },
        );
    }
}
