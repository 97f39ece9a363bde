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

use std::sync::atomic::{AtomicUsize, Ordering};

use log::info;

use crate::{
    vulkan::{FrameToken, RenderFrame, RenderResourceCache, SharedDevice},
    BackendResult, BindingConfig,
};

/// Owns resource cache and per-frame binding state for one device.
///
/// Frames are declared first so their descriptor sets are gone before set
/// layouts in the cache get destroyed.
pub struct RenderContext {
    frames: Vec<RenderFrame>,
    current: AtomicUsize,
    cache: RenderResourceCache,
}

impl RenderContext {
    pub fn new(device: SharedDevice, config: &BindingConfig) -> BackendResult<Self> {
        config.validate()?;
        info!(
            "Creating render context with {} frames in flight",
            config.frames_in_flight
        );
        let frames = (0..config.frames_in_flight)
            .map(|slot| RenderFrame::new(&device, slot, config))
            .collect::<BackendResult<Vec<_>>>()?;

        Ok(Self {
            frames,
            current: AtomicUsize::new(0),
            cache: RenderResourceCache::new(device),
        })
    }

    pub fn cache(&self) -> &RenderResourceCache {
        &self.cache
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    /// Frame currently being recorded.
    pub fn frame(&self) -> &RenderFrame {
        &self.frames[self.current.load(Ordering::Acquire)]
    }

    /// Waits for current frame's fence and prepares its resources for recording.
    pub fn begin_frame(&self) -> BackendResult<FrameToken> {
        puffin::profile_function!();
        self.frame().begin()
    }

    /// Switches to next frame in flight.
    pub fn end_frame(&self) {
        let count = self.frames.len();
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |x| Some((x + 1) % count));
    }

    /// Drops framebuffers and every cached descriptor set. Used when swapchain
    /// is recreated. Safe to call after `begin_frame()` that wasn't submitted yet.
    pub fn invalidate(&self) -> BackendResult<()> {
        info!("Invalidating render context");
        for frame in &self.frames {
            frame.clear()?;
        }
        self.cache.clear_framebuffers();

        Ok(())
    }

    /// Drops everything cached so far.
    pub fn clear(&self) -> BackendResult<()> {
        for frame in &self.frames {
            frame.clear()?;
        }
        self.cache.clear();

        Ok(())
    }
}
