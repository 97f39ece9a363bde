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

use std::fmt::{Debug, Display};

use ash::vk;
use bindery_common::LruCache;
use log::debug;
use parking_lot::Mutex;

use crate::{BackendError, BackendResult, BindingConfig};

use super::{DescriptorAllocator, DescriptorSetInfo, DescriptorSetLayout, SharedDevice};

/// Frame generation of a descriptor set manager. Bumped on every `update()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    pub fn value(&self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proof that the manager was updated for the frame being recorded.
///
/// Only token returned by the latest `update()` is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameToken {
    slot: usize,
    generation: Generation,
}

impl FrameToken {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedSet {
    raw: vk::DescriptorSet,
    layout: vk::DescriptorSetLayout,
    generation: Generation,
}

struct ManagerState {
    cache: LruCache<DescriptorSetInfo, CachedSet>,
    allocator: DescriptorAllocator,
    generation: Generation,
}

impl ManagerState {
    fn check(&self, slot: usize, token: FrameToken) -> BackendResult<()> {
        if token.slot != slot || token.generation != self.generation {
            return Err(BackendError::StaleFrameToken {
                expected: self.generation.value(),
                got: token.generation.value(),
            });
        }

        Ok(())
    }
}

/// Descriptor sets of one in-flight frame.
///
/// Sets are cached by content of their [`DescriptorSetInfo`] in a bounded LRU.
/// Evicted sets go back to allocator only after next `update()`, so set handed
/// out during a frame stays valid and unchanged until that frame is over.
pub struct DescriptorSetManager {
    device: SharedDevice,
    slot: usize,
    state: Mutex<ManagerState>,
}

impl Debug for DescriptorSetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DescriptorSetManager")
            .field("slot", &self.slot)
            .field("generation", &state.generation)
            .field("cached", &state.cache.len())
            .field("allocator", &state.allocator)
            .finish()
    }
}

impl DescriptorSetManager {
    pub fn new(device: &SharedDevice, slot: usize, config: &BindingConfig) -> Self {
        Self {
            device: device.clone(),
            slot,
            state: Mutex::new(ManagerState {
                cache: LruCache::new(config.descriptor_cache_capacity),
                allocator: DescriptorAllocator::new(
                    device.clone(),
                    config.sets_per_pool,
                    &config.pool_sizes,
                ),
                generation: Generation::default(),
            }),
        }
    }

    /// Token for current generation.
    pub fn token(&self) -> FrameToken {
        FrameToken {
            slot: self.slot,
            generation: self.state.lock().generation,
        }
    }

    /// Returns set holding exactly resources of `info`.
    ///
    /// Cached set is returned untouched. On miss new set is allocated, written and
    /// cached, least recently used set is evicted if cache is full.
    pub fn descriptor_set(
        &self,
        token: FrameToken,
        info: &DescriptorSetInfo,
    ) -> BackendResult<vk::DescriptorSet> {
        puffin::profile_function!();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check(self.slot, token)?;
        if let Some(item) = state.cache.get(info) {
            return Ok(item.raw);
        }

        let layout = info.layout().raw();
        let raw = state.allocator.allocate(layout)?;
        self.device.update_descriptor_sets(&info.writes(raw));
        let item = CachedSet {
            raw,
            layout,
            generation: state.generation,
        };
        if let Some((_, evicted)) = state.cache.insert(info.clone(), item) {
            debug!(
                "Evicted descriptor set {:?} written at generation {}",
                evicted.raw, evicted.generation
            );
            state.allocator.pending_deallocate(evicted.layout, evicted.raw);
        }

        Ok(raw)
    }

    /// Set that isn't cached and never evicted. Owner returns it with
    /// [`DescriptorSetManager::pending_return_persistent_descriptor_set`].
    pub fn persistent_descriptor_set(
        &self,
        token: FrameToken,
        info: &DescriptorSetInfo,
    ) -> BackendResult<vk::DescriptorSet> {
        let mut state = self.state.lock();
        state.check(self.slot, token)?;
        let raw = state.allocator.allocate(info.layout().raw())?;
        self.device.update_descriptor_sets(&info.writes(raw));

        Ok(raw)
    }

    pub fn pending_return_persistent_descriptor_set(
        &self,
        layout: &DescriptorSetLayout,
        set: vk::DescriptorSet,
    ) {
        self.state.lock().allocator.pending_deallocate(layout.raw(), set);
    }

    /// Starts new generation and releases sets evicted during previous one.
    ///
    /// Must happen after fence confirmed GPU finished previous use of this frame.
    /// Tokens handed out before become stale.
    pub fn update(&self) -> FrameToken {
        let mut state = self.state.lock();
        state.generation = state.generation.next();
        state.allocator.clear_pending_deallocated_descriptor_sets();

        FrameToken {
            slot: self.slot,
            generation: state.generation,
        }
    }

    /// Drops every cached set and resets pools. Same fence rule as for `update()`.
    pub fn clear(&self) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.cache.clear();
        state.generation = state.generation.next();
        state.allocator.reset_pools()
    }

    pub fn len(&self) -> usize {
        self.state.lock().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, info: &DescriptorSetInfo) -> bool {
        self.state.lock().cache.contains(info)
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().allocator.pending_count()
    }
}
