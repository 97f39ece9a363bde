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

use std::{fmt::Debug, sync::Arc};

use arrayvec::ArrayVec;
use ash::vk;

use crate::{BackendError, BackendResult};

use super::{CachedResource, RenderResourceCache, ResourceStorage, SharedDevice};

pub const MAX_COLOR_ATTACHMENTS: usize = 8;
pub const MAX_ATTACHMENTS: usize = MAX_COLOR_ATTACHMENTS + 1;

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct AttachmentDesc {
    format: vk::Format,
    samples: vk::SampleCountFlags,
    load_op: vk::AttachmentLoadOp,
    store_op: vk::AttachmentStoreOp,
    stencil_load_op: vk::AttachmentLoadOp,
    stencil_store_op: vk::AttachmentStoreOp,
    initial_layout: vk::ImageLayout,
    final_layout: vk::ImageLayout,
}

impl AttachmentDesc {
    pub fn color(format: vk::Format) -> Self {
        Self {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::LOAD,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }
    }

    pub fn depth(format: vk::Format) -> Self {
        Self {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        }
    }

    pub fn clear_input(mut self) -> Self {
        self.load_op = vk::AttachmentLoadOp::CLEAR;
        self
    }

    pub fn garbage_input(mut self) -> Self {
        self.load_op = vk::AttachmentLoadOp::DONT_CARE;
        self
    }

    pub fn store_output(mut self) -> Self {
        self.store_op = vk::AttachmentStoreOp::STORE;
        self
    }

    pub fn discard_output(mut self) -> Self {
        self.store_op = vk::AttachmentStoreOp::DONT_CARE;
        self
    }

    pub fn stencil(mut self, load: vk::AttachmentLoadOp, store: vk::AttachmentStoreOp) -> Self {
        self.stencil_load_op = load;
        self.stencil_store_op = store;
        self
    }

    pub fn multisampling(mut self, value: vk::SampleCountFlags) -> Self {
        self.samples = value;
        self
    }

    pub fn layouts(mut self, initial: vk::ImageLayout, last: vk::ImageLayout) -> Self {
        self.initial_layout = initial;
        self.final_layout = last;
        self
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    fn build(&self) -> vk::AttachmentDescription {
        vk::AttachmentDescription {
            format: self.format,
            samples: self.samples,
            load_op: self.load_op,
            store_op: self.store_op,
            stencil_load_op: self.stencil_load_op,
            stencil_store_op: self.stencil_store_op,
            initial_layout: self.initial_layout,
            final_layout: self.final_layout,
            ..Default::default()
        }
    }
}

/// Attachment indices used by one subpass.
#[derive(Debug, Clone, Default, Hash, PartialEq, Eq)]
pub struct SubpassDesc {
    pub color: ArrayVec<u32, MAX_COLOR_ATTACHMENTS>,
    pub depth: Option<u32>,
    pub inputs: ArrayVec<u32, MAX_ATTACHMENTS>,
}

impl SubpassDesc {
    pub fn color(mut self, attachment: u32) -> Self {
        self.color.push(attachment);
        self
    }

    pub fn depth(mut self, attachment: u32) -> Self {
        self.depth = Some(attachment);
        self
    }

    pub fn input(mut self, attachment: u32) -> Self {
        self.inputs.push(attachment);
        self
    }
}

#[derive(Debug, Clone, Default, Hash, PartialEq, Eq)]
pub struct RenderPassDesc {
    pub attachments: ArrayVec<AttachmentDesc, MAX_ATTACHMENTS>,
    pub subpasses: Vec<SubpassDesc>,
}

impl RenderPassDesc {
    pub fn attachment(mut self, desc: AttachmentDesc) -> Self {
        self.attachments.push(desc);
        self
    }

    pub fn subpass(mut self, desc: SubpassDesc) -> Self {
        self.subpasses.push(desc);
        self
    }

    /// Render pass with single subpass writing every attachment, last depth one
    /// becomes depth target.
    pub fn simple(colors: &[AttachmentDesc], depth: Option<AttachmentDesc>) -> Self {
        let mut subpass = SubpassDesc::default();
        let mut result = Self::default();
        for (index, color) in colors.iter().enumerate() {
            result.attachments.push(*color);
            subpass.color.push(index as u32);
        }
        if let Some(depth) = depth {
            subpass.depth = Some(result.attachments.len() as u32);
            result.attachments.push(depth);
        }

        result.subpass(subpass)
    }

    /// Every attachment index used by subpasses must exist.
    fn validate(&self) -> BackendResult<()> {
        let count = self.attachments.len();
        self.subpasses
            .iter()
            .flat_map(|x| x.color.iter().chain(x.inputs.iter()).chain(x.depth.iter()))
            .find(|index| **index as usize >= count)
            .map_or(Ok(()), |index| {
                Err(BackendError::InvalidAttachment {
                    index: *index,
                    count,
                })
            })
    }

    pub fn color_attachment_count(&self, subpass: u32) -> usize {
        self.subpasses
            .get(subpass as usize)
            .map(|x| x.color.len())
            .unwrap_or(0)
    }
}

pub struct RenderPass {
    device: SharedDevice,
    raw: vk::RenderPass,
    desc: RenderPassDesc,
}

impl Debug for RenderPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPass")
            .field("raw", &self.raw)
            .field("desc", &self.desc)
            .finish()
    }
}

impl RenderPass {
    pub fn raw(&self) -> vk::RenderPass {
        self.raw
    }

    pub fn desc(&self) -> &RenderPassDesc {
        &self.desc
    }
}

impl CachedResource for RenderPass {
    type Desc = RenderPassDesc;
    const KIND: &'static str = "RenderPass";

    fn create(cache: &RenderResourceCache, desc: &Self::Desc) -> BackendResult<Self> {
        desc.validate()?;
        let attachments = desc
            .attachments
            .iter()
            .map(|x| x.build())
            .collect::<ArrayVec<_, MAX_ATTACHMENTS>>();

        let color_refs = desc
            .subpasses
            .iter()
            .map(|subpass| {
                subpass
                    .color
                    .iter()
                    .map(|index| vk::AttachmentReference {
                        attachment: *index,
                        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    })
                    .collect::<ArrayVec<_, MAX_COLOR_ATTACHMENTS>>()
            })
            .collect::<Vec<_>>();
        let input_refs = desc
            .subpasses
            .iter()
            .map(|subpass| {
                subpass
                    .inputs
                    .iter()
                    .map(|index| vk::AttachmentReference {
                        attachment: *index,
                        layout: if is_depth_format(desc.attachments[*index as usize].format) {
                            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
                        } else {
                            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                        },
                    })
                    .collect::<ArrayVec<_, MAX_ATTACHMENTS>>()
            })
            .collect::<Vec<_>>();
        let depth_refs = desc
            .subpasses
            .iter()
            .map(|subpass| {
                subpass.depth.map(|index| vk::AttachmentReference {
                    attachment: index,
                    layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                })
            })
            .collect::<Vec<_>>();

        let subpasses = (0..desc.subpasses.len())
            .map(|index| {
                let mut subpass = vk::SubpassDescription::builder()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(&color_refs[index])
                    .input_attachments(&input_refs[index]);
                if let Some(depth) = depth_refs[index].as_ref() {
                    subpass = subpass.depth_stencil_attachment(depth);
                }
                subpass.build()
            })
            .collect::<Vec<_>>();

        // Each subpass reads what previous one wrote.
        let dependencies = (1..desc.subpasses.len() as u32)
            .map(|index| {
                vk::SubpassDependency::builder()
                    .src_subpass(index - 1)
                    .dst_subpass(index)
                    .src_stage_mask(
                        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                    )
                    .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
                    .src_access_mask(
                        vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                    )
                    .dst_access_mask(vk::AccessFlags::INPUT_ATTACHMENT_READ)
                    .dependency_flags(vk::DependencyFlags::BY_REGION)
                    .build()
            })
            .collect::<Vec<_>>();

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies)
            .build();
        let device = cache.device().clone();
        let raw = device.create_render_pass(&info)?;

        Ok(Self {
            device,
            raw,
            desc: desc.clone(),
        })
    }

    fn storage(cache: &RenderResourceCache) -> &ResourceStorage<Self> {
        &cache.render_passes
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.device.destroy_render_pass(self.raw);
    }
}

/// Framebuffer key: render pass content plus attached views and extent.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct FramebufferDesc {
    pub render_pass: RenderPassDesc,
    pub attachments: ArrayVec<vk::ImageView, MAX_ATTACHMENTS>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

impl FramebufferDesc {
    pub fn new(render_pass: &RenderPassDesc, attachments: &[vk::ImageView], extent: vk::Extent2D) -> Self {
        Self {
            render_pass: render_pass.clone(),
            attachments: attachments.iter().copied().collect(),
            width: extent.width,
            height: extent.height,
            layers: 1,
        }
    }

    pub fn layers(mut self, value: u32) -> Self {
        self.layers = value.max(1);
        self
    }
}

pub struct Framebuffer {
    device: SharedDevice,
    raw: vk::Framebuffer,
    render_pass: Arc<RenderPass>,
    extent: vk::Extent2D,
}

impl Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("raw", &self.raw)
            .field("render_pass", &self.render_pass.raw)
            .field("extent", &self.extent)
            .finish()
    }
}

impl Framebuffer {
    pub fn raw(&self) -> vk::Framebuffer {
        self.raw
    }

    pub fn render_pass(&self) -> &Arc<RenderPass> {
        &self.render_pass
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl CachedResource for Framebuffer {
    type Desc = FramebufferDesc;
    const KIND: &'static str = "Framebuffer";

    fn create(cache: &RenderResourceCache, desc: &Self::Desc) -> BackendResult<Self> {
        let render_pass = cache.render_pass(&desc.render_pass)?;
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass.raw())
            .attachments(&desc.attachments)
            .width(desc.width)
            .height(desc.height)
            .layers(desc.layers)
            .build();
        let device = cache.device().clone();
        let raw = device.create_framebuffer(&info)?;

        Ok(Self {
            device,
            raw,
            render_pass,
            extent: vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
        })
    }

    fn storage(cache: &RenderResourceCache) -> &ResourceStorage<Self> {
        &cache.framebuffers
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.device.destroy_framebuffer(self.raw);
    }
}
