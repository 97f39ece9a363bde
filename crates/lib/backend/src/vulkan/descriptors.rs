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

use std::{collections::BTreeMap, hash::Hash, sync::Arc};

use ash::vk;
use log::warn;

use super::{DescriptorResource, DescriptorSetLayout, DescriptorWrite};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferBinding {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub range: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageBinding {
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub layout: vk::ImageLayout,
}

pub fn is_dynamic_buffer_descriptor_type(ty: vk::DescriptorType) -> bool {
    ty == vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        || ty == vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
}

pub fn is_buffer_descriptor_type(ty: vk::DescriptorType) -> bool {
    is_dynamic_buffer_descriptor_type(ty)
        || ty == vk::DescriptorType::UNIFORM_BUFFER
        || ty == vk::DescriptorType::STORAGE_BUFFER
}

/// Resources written into one descriptor set.
///
/// Used as cache key for descriptor sets and as source of descriptor writes.
/// Keys of both maps are `(binding, array element)`. Layout is compared by
/// GPU handle, layouts are deduplicated by content already.
#[derive(Debug, Clone)]
pub struct DescriptorSetInfo {
    layout: Arc<DescriptorSetLayout>,
    buffers: BTreeMap<(u32, u32), BufferBinding>,
    images: BTreeMap<(u32, u32), ImageBinding>,
}

impl PartialEq for DescriptorSetInfo {
    fn eq(&self, other: &Self) -> bool {
        self.layout.raw() == other.layout.raw()
            && self.buffers == other.buffers
            && self.images == other.images
    }
}

impl Eq for DescriptorSetInfo {}

impl Hash for DescriptorSetInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.layout.raw().hash(state);
        self.buffers.hash(state);
        self.images.hash(state);
    }
}

impl DescriptorSetInfo {
    pub fn new(layout: &Arc<DescriptorSetLayout>) -> Self {
        Self {
            layout: layout.clone(),
            buffers: BTreeMap::new(),
            images: BTreeMap::new(),
        }
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    pub fn set_buffer(&mut self, binding: u32, array_element: u32, value: BufferBinding) {
        self.buffers.insert((binding, array_element), value);
    }

    pub fn set_image(&mut self, binding: u32, array_element: u32, value: ImageBinding) {
        self.images.insert((binding, array_element), value);
    }

    pub fn buffer(&self, binding: u32, array_element: u32) -> Option<&BufferBinding> {
        self.buffers.get(&(binding, array_element))
    }

    pub fn image(&self, binding: u32, array_element: u32) -> Option<&ImageBinding> {
        self.images.get(&(binding, array_element))
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.images.is_empty()
    }

    /// Writes that make `set` hold exactly these resources.
    pub fn writes(&self, set: vk::DescriptorSet) -> Vec<DescriptorWrite> {
        let desc = self.layout.desc();
        let buffers = self.buffers.iter().map(|(key, value)| (*key, DescriptorResource::Buffer(*value)));
        let images = self.images.iter().map(|(key, value)| (*key, DescriptorResource::Image(*value)));

        buffers
            .chain(images)
            .filter_map(|((binding, array_element), resource)| {
                let Some(slot) = desc.find(binding) else {
                    warn!("Binding {} isn't declared by set layout, skipped", binding);
                    return None;
                };
                if array_element >= slot.count {
                    warn!(
                        "Array element {} is out of range for binding {}",
                        array_element, binding
                    );
                    return None;
                }
                Some(DescriptorWrite {
                    set,
                    binding,
                    array_element,
                    ty: slot.ty,
                    resource,
                })
            })
            .collect()
    }
}
