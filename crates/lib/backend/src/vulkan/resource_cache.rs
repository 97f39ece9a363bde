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

use std::{fmt::Debug, hash::Hash, sync::Arc};

use ash::vk;
use bindery_common::ContentMap;
use log::{error, info};
use parking_lot::Mutex;

use crate::BackendResult;

use super::{
    DescriptorSetLayout, Framebuffer, PipelineLayout, RenderPass, RenderPipeline, SharedDevice,
};

/// GPU object built once from its description and shared afterwards.
pub trait CachedResource: Sized + Send + Sync + 'static {
    type Desc: Debug + Clone + Hash + Eq + Send + Sync;
    const KIND: &'static str;

    fn create(cache: &RenderResourceCache, desc: &Self::Desc) -> BackendResult<Self>;
    fn storage(cache: &RenderResourceCache) -> &ResourceStorage<Self>;
}

/// One map per resource kind, each with its own lock.
pub struct ResourceStorage<T: CachedResource> {
    items: Mutex<ContentMap<T::Desc, Arc<T>>>,
}

impl<T: CachedResource> Default for ResourceStorage<T> {
    fn default() -> Self {
        Self {
            items: Mutex::default(),
        }
    }
}

impl<T: CachedResource> ResourceStorage<T> {
    fn get_or_create(
        &self,
        cache: &RenderResourceCache,
        desc: &T::Desc,
    ) -> BackendResult<Arc<T>> {
        // Lock is held while building so concurrent requests for the same desc
        // create exactly one object.
        let mut items = self.items.lock();
        if let Some(item) = items.get(desc) {
            return Ok(item.clone());
        }
        info!("Building #{} cache object ({})", items.len() + 1, T::KIND);
        let item = match T::create(cache, desc) {
            Ok(item) => Arc::new(item),
            Err(err) => {
                error!("Failed to create {}: {:?} from {:?}", T::KIND, err, desc);
                return Err(err);
            }
        };
        items.insert(desc.clone(), item.clone());

        Ok(item)
    }

    fn clear(&self) {
        self.items.lock().clear();
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}

/// Content addressed cache of immutable GPU objects.
///
/// Objects live until [`RenderResourceCache::clear`] or until last user drops them
/// after clear. Lock order is pipelines, then framebuffers and pipeline layouts,
/// then render passes and set layouts, creation never requests a kind above itself.
pub struct RenderResourceCache {
    device: SharedDevice,
    pipeline_cache: Mutex<vk::PipelineCache>,
    pub(crate) pipelines: ResourceStorage<RenderPipeline>,
    pub(crate) framebuffers: ResourceStorage<Framebuffer>,
    pub(crate) pipeline_layouts: ResourceStorage<PipelineLayout>,
    pub(crate) render_passes: ResourceStorage<RenderPass>,
    pub(crate) set_layouts: ResourceStorage<DescriptorSetLayout>,
}

impl Debug for RenderResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderResourceCache")
            .field("pipelines", &self.pipelines.len())
            .field("framebuffers", &self.framebuffers.len())
            .field("pipeline_layouts", &self.pipeline_layouts.len())
            .field("render_passes", &self.render_passes.len())
            .field("set_layouts", &self.set_layouts.len())
            .finish()
    }
}

impl RenderResourceCache {
    pub fn new(device: SharedDevice) -> Self {
        Self {
            device,
            pipeline_cache: Mutex::new(vk::PipelineCache::null()),
            pipelines: ResourceStorage::default(),
            framebuffers: ResourceStorage::default(),
            pipeline_layouts: ResourceStorage::default(),
            render_passes: ResourceStorage::default(),
            set_layouts: ResourceStorage::default(),
        }
    }

    pub fn device(&self) -> &SharedDevice {
        &self.device
    }

    /// Returns object built from `desc`, building it on first request.
    ///
    /// Equal descriptions always give the same object. Creation failure is returned
    /// to the caller and nothing is cached.
    pub fn request_resource<T: CachedResource>(&self, desc: &T::Desc) -> BackendResult<Arc<T>> {
        T::storage(self).get_or_create(self, desc)
    }

    pub fn descriptor_set_layout(
        &self,
        desc: &<DescriptorSetLayout as CachedResource>::Desc,
    ) -> BackendResult<Arc<DescriptorSetLayout>> {
        self.request_resource::<DescriptorSetLayout>(desc)
    }

    pub fn pipeline_layout(
        &self,
        desc: &<PipelineLayout as CachedResource>::Desc,
    ) -> BackendResult<Arc<PipelineLayout>> {
        self.request_resource::<PipelineLayout>(desc)
    }

    pub fn render_pass(
        &self,
        desc: &<RenderPass as CachedResource>::Desc,
    ) -> BackendResult<Arc<RenderPass>> {
        self.request_resource::<RenderPass>(desc)
    }

    pub fn framebuffer(
        &self,
        desc: &<Framebuffer as CachedResource>::Desc,
    ) -> BackendResult<Arc<Framebuffer>> {
        self.request_resource::<Framebuffer>(desc)
    }

    pub fn render_pipeline(
        &self,
        desc: &<RenderPipeline as CachedResource>::Desc,
    ) -> BackendResult<Arc<RenderPipeline>> {
        self.request_resource::<RenderPipeline>(desc)
    }

    /// Driver pipeline cache used for pipelines built from now on.
    pub fn set_pipeline_cache(&self, cache: vk::PipelineCache) {
        *self.pipeline_cache.lock() = cache;
    }

    pub fn pipeline_cache(&self) -> vk::PipelineCache {
        *self.pipeline_cache.lock()
    }

    pub fn len<T: CachedResource>(&self) -> usize {
        T::storage(self).len()
    }

    /// Drops framebuffers only, render targets are gone after swapchain resize.
    pub fn clear_framebuffers(&self) {
        self.framebuffers.clear();
    }

    /// Drops every cached object. GPU must not use any of them anymore.
    pub fn clear(&self) {
        self.pipelines.clear();
        self.framebuffers.clear();
        self.pipeline_layouts.clear();
        self.render_passes.clear();
        self.set_layouts.clear();
    }
}
