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

use std::{ffi::CString, fmt::Debug, slice, sync::Arc};

use arrayvec::ArrayVec;
use ash::vk;
use log::debug;

use crate::BackendResult;

use super::{
    CachedResource, PipelineLayout, PipelineLayoutDesc, RenderPass, RenderPassDesc,
    RenderResourceCache, ResourceStorage, SharedDevice, MAX_COLOR_ATTACHMENTS,
};

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct BlendDesc {
    pub src_blend: vk::BlendFactor,
    pub dst_blend: vk::BlendFactor,
    pub op: vk::BlendOp,
}

impl BlendDesc {
    pub fn alpha() -> Self {
        Self {
            src_blend: vk::BlendFactor::SRC_ALPHA,
            dst_blend: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            op: vk::BlendOp::ADD,
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ShaderStageDesc {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry: CString,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct VertexBindingDesc {
    pub binding: u32,
    pub stride: u32,
    pub rate: vk::VertexInputRate,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct VertexAttributeDesc {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// Everything needed to build graphics pipeline.
///
/// Layout and render pass are stored by content, so equal descriptions end up with
/// the same cached layout and render pass objects.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct RenderPipelineDesc {
    pub layout: PipelineLayoutDesc,
    pub render_pass: RenderPassDesc,
    pub subpass: u32,
    pub stages: Vec<ShaderStageDesc>,
    pub vertex_bindings: Vec<VertexBindingDesc>,
    pub vertex_attributes: Vec<VertexAttributeDesc>,
    pub topology: vk::PrimitiveTopology,
    /// Blend data, None if opaque. Order: color, alpha
    pub blend: Option<(BlendDesc, BlendDesc)>,
    /// Depth comparison op, None if no depth test is happening
    pub depth_test: Option<vk::CompareOp>,
    pub depth_write: bool,
    /// Culling information, None if we don't do culling
    pub cull: Option<(vk::CullModeFlags, vk::FrontFace)>,
}

impl RenderPipelineDesc {
    pub fn new(layout: PipelineLayoutDesc, render_pass: RenderPassDesc, subpass: u32) -> Self {
        Self {
            layout,
            render_pass,
            subpass,
            stages: Vec::new(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            blend: None,
            depth_test: Some(vk::CompareOp::LESS),
            depth_write: true,
            cull: Some((vk::CullModeFlags::BACK, vk::FrontFace::CLOCKWISE)),
        }
    }

    pub fn stage(mut self, stage: vk::ShaderStageFlags, module: vk::ShaderModule, entry: &str) -> Self {
        self.stages.push(ShaderStageDesc {
            stage,
            module,
            entry: CString::new(entry).unwrap_or_default(),
        });

        self
    }

    pub fn vertex_binding(mut self, binding: u32, stride: u32, rate: vk::VertexInputRate) -> Self {
        self.vertex_bindings.push(VertexBindingDesc {
            binding,
            stride,
            rate,
        });

        self
    }

    pub fn vertex_attribute(
        mut self,
        location: u32,
        binding: u32,
        format: vk::Format,
        offset: u32,
    ) -> Self {
        self.vertex_attributes.push(VertexAttributeDesc {
            location,
            binding,
            format,
            offset,
        });

        self
    }

    pub fn topology(mut self, value: vk::PrimitiveTopology) -> Self {
        self.topology = value;

        self
    }

    pub fn blend(mut self, color: BlendDesc, alpha: BlendDesc) -> Self {
        self.blend = Some((color, alpha));

        self
    }

    pub fn depth_test(mut self, value: Option<vk::CompareOp>) -> Self {
        self.depth_test = value;

        self
    }

    pub fn depth_write(mut self, value: bool) -> Self {
        self.depth_write = value;

        self
    }

    pub fn cull(mut self, value: Option<(vk::CullModeFlags, vk::FrontFace)>) -> Self {
        self.cull = value;

        self
    }
}

pub struct RenderPipeline {
    device: SharedDevice,
    raw: vk::Pipeline,
    layout: Arc<PipelineLayout>,
    render_pass: Arc<RenderPass>,
}

impl Debug for RenderPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPipeline")
            .field("raw", &self.raw)
            .field("layout", &self.layout.raw())
            .field("render_pass", &self.render_pass.raw())
            .finish()
    }
}

impl RenderPipeline {
    pub fn raw(&self) -> vk::Pipeline {
        self.raw
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    pub fn render_pass(&self) -> &Arc<RenderPass> {
        &self.render_pass
    }
}

impl CachedResource for RenderPipeline {
    type Desc = RenderPipelineDesc;
    const KIND: &'static str = "RenderPipeline";

    fn create(cache: &RenderResourceCache, desc: &Self::Desc) -> BackendResult<Self> {
        debug!("Compile pipeline {:?}", desc);
        let layout = cache.pipeline_layout(&desc.layout)?;
        let render_pass = cache.render_pass(&desc.render_pass)?;

        let shader_create_info = desc
            .stages
            .iter()
            .map(|shader| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(shader.stage)
                    .module(shader.module)
                    .name(&shader.entry)
                    .build()
            })
            .collect::<Vec<_>>();

        let assembly_state_create_info = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(desc.topology)
            .primitive_restart_enable(false)
            .build();

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state_create_info = vk::PipelineDynamicStateCreateInfo::builder()
            .dynamic_states(&dynamic_states)
            .build();

        let vertex_bindings = desc
            .vertex_bindings
            .iter()
            .map(|binding| vk::VertexInputBindingDescription {
                binding: binding.binding,
                stride: binding.stride,
                input_rate: binding.rate,
            })
            .collect::<Vec<_>>();
        let vertex_attributes = desc
            .vertex_attributes
            .iter()
            .map(|attribute| vk::VertexInputAttributeDescription {
                location: attribute.location,
                binding: attribute.binding,
                format: attribute.format,
                offset: attribute.offset,
            })
            .collect::<Vec<_>>();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes)
            .build();

        // Viewport and scissor are dynamic, only count matters.
        let viewport = vk::Viewport::default();
        let scissor = vk::Rect2D::default();
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(slice::from_ref(&viewport))
            .scissors(slice::from_ref(&scissor))
            .build();

        let rasterizer_state = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_bias_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0);
        let rasterizer_state = if let Some((mode, front)) = desc.cull {
            rasterizer_state.cull_mode(mode).front_face(front)
        } else {
            rasterizer_state.cull_mode(vk::CullModeFlags::NONE)
        }
        .build();

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .min_sample_shading(1.0)
            .build();

        let depthstencil_state = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(desc.depth_test.is_some())
            .depth_compare_op(desc.depth_test.unwrap_or(vk::CompareOp::NEVER))
            .depth_write_enable(desc.depth_write)
            .stencil_test_enable(false)
            .build();

        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        let color_blend_attachment = if let Some((color, alpha)) = desc.blend {
            color_blend_attachment
                .blend_enable(true)
                .src_color_blend_factor(color.src_blend)
                .dst_color_blend_factor(color.dst_blend)
                .color_blend_op(color.op)
                .src_alpha_blend_factor(alpha.src_blend)
                .dst_alpha_blend_factor(alpha.dst_blend)
                .alpha_blend_op(alpha.op)
        } else {
            color_blend_attachment.blend_enable(false)
        }
        .build();
        // Every color target of the subpass gets the same blend state.
        let blend_attachments = (0..desc.render_pass.color_attachment_count(desc.subpass))
            .map(|_| color_blend_attachment)
            .collect::<ArrayVec<_, MAX_COLOR_ATTACHMENTS>>();
        let blending_state = vk::PipelineColorBlendStateCreateInfo::builder()
            .attachments(&blend_attachments)
            .logic_op_enable(false)
            .build();

        let pipeline_create_info = vk::GraphicsPipelineCreateInfo::builder()
            .render_pass(render_pass.raw())
            .layout(layout.raw())
            .stages(&shader_create_info)
            .subpass(desc.subpass)
            .dynamic_state(&dynamic_state_create_info)
            .viewport_state(&viewport_state)
            .multisample_state(&multisample_state)
            .color_blend_state(&blending_state)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&assembly_state_create_info)
            .rasterization_state(&rasterizer_state)
            .depth_stencil_state(&depthstencil_state)
            .build();

        let device = cache.device().clone();
        let raw = device.create_graphics_pipeline(cache.pipeline_cache(), &pipeline_create_info)?;

        Ok(Self {
            device,
            raw,
            layout,
            render_pass,
        })
    }

    fn storage(cache: &RenderResourceCache) -> &ResourceStorage<Self> {
        &cache.pipelines
    }
}

impl Drop for RenderPipeline {
    fn drop(&mut self) {
        self.device.destroy_pipeline(self.raw);
    }
}
