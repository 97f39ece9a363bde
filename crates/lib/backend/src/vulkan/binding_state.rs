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

use std::collections::BTreeMap;

use ash::vk;

/// Resource bound to single `(set, binding, array element)` slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceInfo {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub range: u64,
    pub image_view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub depth_stencil: bool,
}

/// Bindings of one descriptor set.
#[derive(Debug, Default)]
pub struct ResourceSet {
    bindings: BTreeMap<u32, BTreeMap<u32, ResourceInfo>>,
    dirty: bool,
}

impl ResourceSet {
    fn update(&mut self, binding: u32, array_element: u32, f: impl FnOnce(&mut ResourceInfo)) -> bool {
        let slot = self
            .bindings
            .entry(binding)
            .or_default()
            .entry(array_element)
            .or_default();
        let old = *slot;
        f(slot);
        let changed = old != *slot;
        self.dirty |= changed;

        changed
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn binding(&self, binding: u32, array_element: u32) -> Option<&ResourceInfo> {
        self.bindings.get(&binding)?.get(&array_element)
    }

    /// Bound array elements of `binding` in ascending order.
    pub fn elements(&self, binding: u32) -> impl Iterator<Item = (u32, &ResourceInfo)> + '_ {
        self.bindings
            .get(&binding)
            .into_iter()
            .flat_map(|elements| elements.iter().map(|(index, info)| (*index, info)))
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Resources currently bound by command recorder, per set index.
///
/// Binding a value equal to what's already there leaves state clean, so repeated
/// draws with the same material don't touch descriptor sets at all.
#[derive(Debug, Default)]
pub struct ResourceBindingState {
    sets: BTreeMap<u32, ResourceSet>,
    dirty: bool,
}

impl ResourceBindingState {
    fn update(
        &mut self,
        set: u32,
        binding: u32,
        array_element: u32,
        f: impl FnOnce(&mut ResourceInfo),
    ) {
        let changed = self
            .sets
            .entry(set)
            .or_default()
            .update(binding, array_element, f);
        self.dirty |= changed;
    }

    pub fn bind_buffer(
        &mut self,
        set: u32,
        binding: u32,
        array_element: u32,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    ) {
        self.update(set, binding, array_element, |info| {
            info.buffer = buffer;
            info.offset = offset;
            info.range = range;
        });
    }

    pub fn bind_image(
        &mut self,
        set: u32,
        binding: u32,
        array_element: u32,
        view: vk::ImageView,
        depth_stencil: bool,
    ) {
        self.update(set, binding, array_element, |info| {
            info.image_view = view;
            info.depth_stencil = depth_stencil;
        });
    }

    pub fn bind_sampler(&mut self, set: u32, binding: u32, array_element: u32, sampler: vk::Sampler) {
        self.update(set, binding, array_element, |info| {
            info.sampler = sampler;
        });
    }

    pub fn bind_image_sampler(
        &mut self,
        set: u32,
        binding: u32,
        array_element: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        depth_stencil: bool,
    ) {
        self.update(set, binding, array_element, |info| {
            info.image_view = view;
            info.sampler = sampler;
            info.depth_stencil = depth_stencil;
        });
    }

    pub fn bind_input(
        &mut self,
        set: u32,
        binding: u32,
        array_element: u32,
        view: vk::ImageView,
        depth_stencil: bool,
    ) {
        self.update(set, binding, array_element, |info| {
            info.image_view = view;
            info.sampler = vk::Sampler::null();
            info.depth_stencil = depth_stencil;
        });
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_set_dirty(&self, set: u32) -> bool {
        self.sets.get(&set).map(|x| x.is_dirty()).unwrap_or(false)
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn clear_set_dirty(&mut self, set: u32) {
        if let Some(set) = self.sets.get_mut(&set) {
            set.clear_dirty();
        }
    }

    pub fn set(&self, set: u32) -> Option<&ResourceSet> {
        self.sets.get(&set)
    }

    pub fn set_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.sets.keys().copied()
    }

    /// Forgets everything bound so far.
    pub fn reset(&mut self) {
        self.sets.clear();
        self.dirty = false;
    }
}
