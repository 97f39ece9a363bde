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

use ash::vk;

use crate::{BackendError, BackendResult};

use super::{CachedResource, RenderResourceCache, ResourceStorage, SharedDevice};

/// Kind of resource as reported by shader reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderResourceKind {
    Input,
    Output,
    PushConstant,
    SubpassInput,
    SeparateImage,
    SeparateSampler,
    CombinedImageSampler,
    UniformBuffer,
    StorageBuffer,
    StorageImage,
    UniformTexelBuffer,
    StorageTexelBuffer,
}

impl ShaderResourceKind {
    /// Descriptor type used to bind this resource, `None` for resources that
    /// don't live in descriptor sets.
    pub fn descriptor_type(self, dynamic: bool) -> Option<vk::DescriptorType> {
        match self {
            Self::Input | Self::Output | Self::PushConstant => None,
            Self::SubpassInput => Some(vk::DescriptorType::INPUT_ATTACHMENT),
            Self::SeparateImage => Some(vk::DescriptorType::SAMPLED_IMAGE),
            Self::SeparateSampler => Some(vk::DescriptorType::SAMPLER),
            Self::CombinedImageSampler => Some(vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
            Self::UniformBuffer if dynamic => Some(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC),
            Self::UniformBuffer => Some(vk::DescriptorType::UNIFORM_BUFFER),
            Self::StorageBuffer if dynamic => Some(vk::DescriptorType::STORAGE_BUFFER_DYNAMIC),
            Self::StorageBuffer => Some(vk::DescriptorType::STORAGE_BUFFER),
            Self::StorageImage => Some(vk::DescriptorType::STORAGE_IMAGE),
            Self::UniformTexelBuffer => Some(vk::DescriptorType::UNIFORM_TEXEL_BUFFER),
            Self::StorageTexelBuffer => Some(vk::DescriptorType::STORAGE_TEXEL_BUFFER),
        }
    }
}

/// Single reflected shader resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderResource {
    pub name: String,
    pub kind: ShaderResourceKind,
    pub stages: vk::ShaderStageFlags,
    pub set: u32,
    pub binding: u32,
    pub array_size: u32,
    /// Push constant block offset
    pub offset: u32,
    /// Push constant or uniform block size
    pub size: u32,
    /// Bind buffer with dynamic offset
    pub dynamic: bool,
}

impl ShaderResource {
    pub fn new(name: &str, kind: ShaderResourceKind, stages: vk::ShaderStageFlags) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            stages,
            set: 0,
            binding: 0,
            array_size: 1,
            offset: 0,
            size: 0,
            dynamic: false,
        }
    }

    pub fn slot(mut self, set: u32, binding: u32) -> Self {
        self.set = set;
        self.binding = binding;

        self
    }

    pub fn array_size(mut self, value: u32) -> Self {
        self.array_size = value.max(1);

        self
    }

    pub fn block(mut self, offset: u32, size: u32) -> Self {
        self.offset = offset;
        self.size = size;

        self
    }

    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;

        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// Content of one descriptor set layout, bindings sorted by binding index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutDesc {
    bindings: Vec<DescriptorBinding>,
}

impl DescriptorSetLayoutDesc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds binding slot. Same slot declared twice merges stages.
    pub fn binding(
        mut self,
        binding: u32,
        ty: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
        count: u32,
    ) -> Self {
        self.add(DescriptorBinding {
            binding,
            ty,
            count: count.max(1),
            stages,
        });

        self
    }

    /// Collects every resource of `set` into layout.
    pub fn from_resources(set: u32, resources: &[ShaderResource]) -> BackendResult<Self> {
        let mut result = Self::default();
        for resource in resources.iter().filter(|x| x.set == set) {
            let Some(ty) = resource.kind.descriptor_type(resource.dynamic) else {
                continue;
            };
            let is_buffer = matches!(
                resource.kind,
                ShaderResourceKind::UniformBuffer | ShaderResourceKind::StorageBuffer
            );
            if resource.dynamic && !is_buffer {
                return Err(BackendError::UnsupportedShaderResource {
                    name: resource.name.clone(),
                    kind: resource.kind,
                });
            }
            result.add(DescriptorBinding {
                binding: resource.binding,
                ty,
                count: resource.array_size.max(1),
                stages: resource.stages,
            });
        }

        Ok(result)
    }

    fn add(&mut self, binding: DescriptorBinding) {
        match self
            .bindings
            .binary_search_by_key(&binding.binding, |x| x.binding)
        {
            Ok(index) => {
                let old = &mut self.bindings[index];
                old.stages |= binding.stages;
                old.count = old.count.max(binding.count);
                old.ty = binding.ty;
            }
            Err(index) => self.bindings.insert(index, binding),
        }
    }

    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }

    pub fn find(&self, binding: u32) -> Option<&DescriptorBinding> {
        self.bindings
            .binary_search_by_key(&binding, |x| x.binding)
            .ok()
            .map(|index| &self.bindings[index])
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

pub struct DescriptorSetLayout {
    device: SharedDevice,
    raw: vk::DescriptorSetLayout,
    desc: DescriptorSetLayoutDesc,
}

impl Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLayout")
            .field("raw", &self.raw)
            .field("desc", &self.desc)
            .finish()
    }
}

impl DescriptorSetLayout {
    pub fn raw(&self) -> vk::DescriptorSetLayout {
        self.raw
    }

    pub fn desc(&self) -> &DescriptorSetLayoutDesc {
        &self.desc
    }
}

impl CachedResource for DescriptorSetLayout {
    type Desc = DescriptorSetLayoutDesc;
    const KIND: &'static str = "DescriptorSetLayout";

    fn create(cache: &RenderResourceCache, desc: &Self::Desc) -> BackendResult<Self> {
        let bindings = desc
            .bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding.binding)
                    .descriptor_type(binding.ty)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages)
                    .build()
            })
            .collect::<Vec<_>>();
        let device = cache.device().clone();
        let raw = device.create_descriptor_set_layout(&bindings)?;

        Ok(Self {
            device,
            raw,
            desc: desc.clone(),
        })
    }

    fn storage(cache: &RenderResourceCache) -> &ResourceStorage<Self> {
        &cache.set_layouts
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.device.destroy_descriptor_set_layout(self.raw);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushConstantRange {
    pub stages: vk::ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

impl PushConstantRange {
    /// Whole `[offset, offset + size)` lies inside this range.
    fn contains(&self, offset: u32, size: u32) -> bool {
        let (Some(end), Some(range_end)) =
            (offset.checked_add(size), self.offset.checked_add(self.size))
        else {
            return false;
        };

        offset >= self.offset && end <= range_end
    }
}

/// Content of pipeline layout: one set layout per set index and push constant ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PipelineLayoutDesc {
    sets: Vec<DescriptorSetLayoutDesc>,
    push_constants: Vec<PushConstantRange>,
}

impl PipelineLayoutDesc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts layout at `index`. Gaps before it are filled with empty layouts.
    pub fn set(mut self, index: u32, desc: DescriptorSetLayoutDesc) -> Self {
        let index = index as usize;
        if self.sets.len() <= index {
            self.sets.resize(index + 1, DescriptorSetLayoutDesc::default());
        }
        self.sets[index] = desc;

        self
    }

    /// Adds push constant range. Ranges with same offset and size share one entry.
    pub fn push_constant(mut self, stages: vk::ShaderStageFlags, offset: u32, size: u32) -> Self {
        if let Some(range) = self
            .push_constants
            .iter_mut()
            .find(|x| x.offset == offset && x.size == size)
        {
            range.stages |= stages;
        } else {
            self.push_constants.push(PushConstantRange {
                stages,
                offset,
                size,
            });
        }

        self
    }

    /// Builds layout description from reflection of all pipeline stages.
    pub fn from_resources(resources: &[ShaderResource]) -> BackendResult<Self> {
        let mut result = Self::default();
        let set_count = resources
            .iter()
            .filter(|x| x.kind.descriptor_type(x.dynamic).is_some())
            .map(|x| x.set + 1)
            .max()
            .unwrap_or(0);
        for set in 0..set_count {
            result = result.set(set, DescriptorSetLayoutDesc::from_resources(set, resources)?);
        }
        for resource in resources
            .iter()
            .filter(|x| x.kind == ShaderResourceKind::PushConstant)
        {
            result = result.push_constant(resource.stages, resource.offset, resource.size);
        }

        Ok(result)
    }

    pub fn sets(&self) -> &[DescriptorSetLayoutDesc] {
        &self.sets
    }

    pub fn push_constants(&self) -> &[PushConstantRange] {
        &self.push_constants
    }
}

pub struct PipelineLayout {
    device: SharedDevice,
    raw: vk::PipelineLayout,
    set_layouts: Vec<Arc<DescriptorSetLayout>>,
    push_constants: Vec<PushConstantRange>,
}

impl Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("raw", &self.raw)
            .field("sets", &self.set_layouts.len())
            .field("push_constants", &self.push_constants)
            .finish()
    }
}

impl PipelineLayout {
    pub fn raw(&self) -> vk::PipelineLayout {
        self.raw
    }

    pub fn set_count(&self) -> u32 {
        self.set_layouts.len() as u32
    }

    pub fn set_layout(&self, set: u32) -> Option<&Arc<DescriptorSetLayout>> {
        self.set_layouts.get(set as usize)
    }

    pub fn push_constants(&self) -> &[PushConstantRange] {
        &self.push_constants
    }

    /// Stages of every declared range that fully contains `size` bytes at `offset`.
    /// Empty if none does, including writes that straddle two ranges.
    pub fn push_constant_stages(&self, offset: u32, size: u32) -> vk::ShaderStageFlags {
        self.push_constants
            .iter()
            .filter(|range| range.contains(offset, size))
            .fold(vk::ShaderStageFlags::empty(), |acc, range| acc | range.stages)
    }
}

impl CachedResource for PipelineLayout {
    type Desc = PipelineLayoutDesc;
    const KIND: &'static str = "PipelineLayout";

    fn create(cache: &RenderResourceCache, desc: &Self::Desc) -> BackendResult<Self> {
        let set_layouts = desc
            .sets
            .iter()
            .map(|set| cache.request_resource::<DescriptorSetLayout>(set))
            .collect::<BackendResult<Vec<_>>>()?;
        let raw_layouts = set_layouts.iter().map(|x| x.raw()).collect::<Vec<_>>();
        let ranges = desc
            .push_constants
            .iter()
            .map(|range| vk::PushConstantRange {
                stage_flags: range.stages,
                offset: range.offset,
                size: range.size,
            })
            .collect::<Vec<_>>();
        let device = cache.device().clone();
        let raw = device.create_pipeline_layout(&raw_layouts, &ranges)?;

        Ok(Self {
            device,
            raw,
            set_layouts,
            push_constants: desc.push_constants.clone(),
        })
    }

    fn storage(cache: &RenderResourceCache) -> &ResourceStorage<Self> {
        &cache.pipeline_layouts
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        self.device.destroy_pipeline_layout(self.raw);
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use ash::vk;

    use crate::{
        vulkan::{mock::MockDevice, RenderResourceCache},
        BackendError,
    };

    use super::{
        DescriptorSetLayout, DescriptorSetLayoutDesc, PipelineLayout, PipelineLayoutDesc,
        ShaderResource, ShaderResourceKind,
    };

    fn resources() -> Vec<ShaderResource> {
        vec![
            ShaderResource::new(
                "globals",
                ShaderResourceKind::UniformBuffer,
                vk::ShaderStageFlags::VERTEX,
            )
            .slot(0, 0),
            ShaderResource::new(
                "globals",
                ShaderResourceKind::UniformBuffer,
                vk::ShaderStageFlags::FRAGMENT,
            )
            .slot(0, 0),
            ShaderResource::new(
                "object",
                ShaderResourceKind::UniformBuffer,
                vk::ShaderStageFlags::VERTEX,
            )
            .slot(2, 0)
            .dynamic(),
            ShaderResource::new(
                "albedo",
                ShaderResourceKind::CombinedImageSampler,
                vk::ShaderStageFlags::FRAGMENT,
            )
            .slot(2, 1)
            .array_size(4),
            ShaderResource::new(
                "position",
                ShaderResourceKind::Input,
                vk::ShaderStageFlags::VERTEX,
            ),
            ShaderResource::new(
                "constants",
                ShaderResourceKind::PushConstant,
                vk::ShaderStageFlags::VERTEX,
            )
            .block(0, 64),
            ShaderResource::new(
                "constants",
                ShaderResourceKind::PushConstant,
                vk::ShaderStageFlags::FRAGMENT,
            )
            .block(0, 64),
        ]
    }

    #[test]
    fn descriptor_type_choice() {
        assert_eq!(
            Some(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC),
            ShaderResourceKind::UniformBuffer.descriptor_type(true)
        );
        assert_eq!(
            Some(vk::DescriptorType::STORAGE_BUFFER),
            ShaderResourceKind::StorageBuffer.descriptor_type(false)
        );
        assert_eq!(
            Some(vk::DescriptorType::INPUT_ATTACHMENT),
            ShaderResourceKind::SubpassInput.descriptor_type(true)
        );
        assert_eq!(None, ShaderResourceKind::PushConstant.descriptor_type(false));
    }

    #[test]
    fn set_layout_from_reflection() {
        let desc = DescriptorSetLayoutDesc::from_resources(0, &resources()).unwrap();
        assert_eq!(1, desc.bindings().len());
        let binding = desc.find(0).unwrap();
        assert_eq!(vk::DescriptorType::UNIFORM_BUFFER, binding.ty);
        assert_eq!(
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            binding.stages
        );
    }

    #[test]
    fn bindings_are_sorted() {
        let desc = DescriptorSetLayoutDesc::new()
            .binding(
                3,
                vk::DescriptorType::SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
                1,
            )
            .binding(
                1,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
                1,
            );
        let indices = desc.bindings().iter().map(|x| x.binding).collect::<Vec<_>>();
        assert_eq!(vec![1, 3], indices);
        assert!(desc.find(2).is_none());
    }

    #[test]
    fn pipeline_layout_fills_gaps() {
        let desc = PipelineLayoutDesc::from_resources(&resources()).unwrap();
        assert_eq!(3, desc.sets().len());
        assert!(desc.sets()[1].is_empty());
        assert_eq!(2, desc.sets()[2].bindings().len());
        assert_eq!(
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            desc.sets()[2].find(0).unwrap().ty
        );
        assert_eq!(4, desc.sets()[2].find(1).unwrap().count);
        assert_eq!(1, desc.push_constants().len());
        assert_eq!(
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            desc.push_constants()[0].stages
        );
    }

    #[test]
    fn dynamic_offset_only_for_buffers() {
        let resources = [
            ShaderResource::new(
                "out",
                ShaderResourceKind::Output,
                vk::ShaderStageFlags::FRAGMENT,
            ),
            ShaderResource::new(
                "albedo",
                ShaderResourceKind::SeparateImage,
                vk::ShaderStageFlags::FRAGMENT,
            )
            .slot(1, 0)
            .dynamic(),
        ];
        assert!(DescriptorSetLayoutDesc::from_resources(0, &resources)
            .unwrap()
            .is_empty());
        assert!(matches!(
            DescriptorSetLayoutDesc::from_resources(1, &resources),
            Err(BackendError::UnsupportedShaderResource {
                kind: ShaderResourceKind::SeparateImage,
                ..
            })
        ));
    }

    #[test]
    fn pipeline_layout_shares_set_layouts() {
        let device = Arc::new(MockDevice::default());
        let cache = RenderResourceCache::new(device.clone());
        let desc = PipelineLayoutDesc::from_resources(&resources()).unwrap();
        let layout = cache.request_resource::<PipelineLayout>(&desc).unwrap();
        assert_eq!(3, layout.set_count());
        let set = cache
            .request_resource::<DescriptorSetLayout>(&desc.sets()[2])
            .unwrap();
        assert!(Arc::ptr_eq(&set, layout.set_layout(2).unwrap()));
        assert_eq!(3, device.created("DescriptorSetLayout"));
        assert_eq!(1, device.created("PipelineLayout"));
        assert!(layout.set_layout(3).is_none());
    }

    #[test]
    fn push_constant_stages() {
        let device = Arc::new(MockDevice::default());
        let cache = RenderResourceCache::new(device);
        let desc = PipelineLayoutDesc::new()
            .push_constant(vk::ShaderStageFlags::VERTEX, 0, 64)
            .push_constant(vk::ShaderStageFlags::FRAGMENT, 64, 16)
            .push_constant(vk::ShaderStageFlags::COMPUTE, 0, 8);
        let layout = cache.request_resource::<PipelineLayout>(&desc).unwrap();
        assert_eq!(
            vk::ShaderStageFlags::VERTEX,
            layout.push_constant_stages(0, 16)
        );
        assert_eq!(
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::COMPUTE,
            layout.push_constant_stages(4, 4)
        );
        assert_eq!(
            vk::ShaderStageFlags::FRAGMENT,
            layout.push_constant_stages(64, 16)
        );
        assert!(layout.push_constant_stages(60, 8).is_empty());
        assert!(layout.push_constant_stages(72, 16).is_empty());
        assert!(layout.push_constant_stages(128, 4).is_empty());
        assert!(layout.push_constant_stages(u32::MAX - 2, 4).is_empty());
    }
}
