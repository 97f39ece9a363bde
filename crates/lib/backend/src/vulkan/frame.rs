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

use std::fmt::Debug;

use ash::vk;

use crate::{BackendResult, BindingConfig};

use super::{BufferManager, DescriptorSetManager, FrameToken, RenderCommandEncoder, SharedDevice};

/// Everything that belongs to one frame in flight.
///
/// Fence must be signaled by submission that consumed this frame's descriptor
/// sets and buffers. It's created signaled so very first `begin()` doesn't block,
/// and stays signaled until [`RenderFrame::submit_fence`] is called, so frame
/// that was begun but never submitted can still be cleared.
pub struct RenderFrame {
    device: SharedDevice,
    slot: usize,
    fence: vk::Fence,
    descriptors: DescriptorSetManager,
    buffers: BufferManager,
}

impl Debug for RenderFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderFrame")
            .field("slot", &self.slot)
            .field("fence", &self.fence)
            .field("descriptors", &self.descriptors)
            .field("buffers", &self.buffers)
            .finish()
    }
}

impl RenderFrame {
    pub fn new(device: &SharedDevice, slot: usize, config: &BindingConfig) -> BackendResult<Self> {
        let fence = device.create_fence(true)?;

        Ok(Self {
            device: device.clone(),
            slot,
            fence,
            descriptors: DescriptorSetManager::new(device, slot, config),
            buffers: BufferManager::new(device, config),
        })
    }

    /// Waits until GPU is done with this frame, then recycles its resources.
    pub fn begin(&self) -> BackendResult<FrameToken> {
        puffin::profile_function!();
        self.device.wait_for_fence(self.fence)?;
        let token = self.descriptors.update();
        self.buffers.reset();

        Ok(token)
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn fence(&self) -> vk::Fence {
        self.fence
    }

    /// Unsignals fence and returns it. Call right before queue submission that
    /// signals it, submission must follow.
    pub fn submit_fence(&self) -> BackendResult<vk::Fence> {
        self.device.reset_fence(self.fence)?;

        Ok(self.fence)
    }

    pub fn descriptors(&self) -> &DescriptorSetManager {
        &self.descriptors
    }

    pub fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    pub fn encoder(&self, token: FrameToken, cb: vk::CommandBuffer) -> RenderCommandEncoder<'_> {
        RenderCommandEncoder::new(&self.device, cb, &self.descriptors, token)
    }

    /// Waits for GPU and drops every cached descriptor set.
    pub fn clear(&self) -> BackendResult<()> {
        self.device.wait_for_fence(self.fence)?;
        self.descriptors.clear()?;
        self.buffers.reset();

        Ok(())
    }
}

impl Drop for RenderFrame {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use ash::vk::{self, Handle};

    use crate::{
        vulkan::{mock::MockDevice, SharedDevice},
        BackendError, BindingConfig,
    };

    use super::RenderFrame;

    fn submit(device: &MockDevice, frame: &RenderFrame) {
        let fence = frame.submit_fence().unwrap();
        device.signal_fence(fence);
    }

    #[test]
    fn begin_waits_and_recycles() {
        let device = Arc::new(MockDevice::default());
        let shared: SharedDevice = device.clone();
        let frame = RenderFrame::new(&shared, 1, &BindingConfig::default()).unwrap();
        let first = frame.begin().unwrap();
        let a = frame
            .buffers()
            .upload(vk::BufferUsageFlags::UNIFORM_BUFFER, &[0; 16])
            .unwrap();
        submit(&device, &frame);
        let second = frame.begin().unwrap();
        let b = frame
            .buffers()
            .upload(vk::BufferUsageFlags::UNIFORM_BUFFER, &[0; 16])
            .unwrap();

        assert_eq!(1, second.slot());
        assert_eq!(first.generation().value() + 1, second.generation().value());
        assert_eq!(a, b);
        assert_eq!(2, device.fence_waits());
        assert_eq!(1, device.fence_resets());
        assert_eq!(second, frame.descriptors().token());
    }

    #[test]
    fn begin_blocks_on_unfinished_submission() {
        let device = Arc::new(MockDevice::default());
        let shared: SharedDevice = device.clone();
        let frame = RenderFrame::new(&shared, 0, &BindingConfig::default()).unwrap();
        frame.begin().unwrap();
        frame.submit_fence().unwrap();
        assert!(matches!(
            frame.begin(),
            Err(BackendError::Vulkan(vk::Result::TIMEOUT))
        ));
        device.signal_fence(frame.fence());
        frame.begin().unwrap();
    }

    #[test]
    fn clear_after_begin_without_submit() {
        let device = Arc::new(MockDevice::default());
        let shared: SharedDevice = device.clone();
        let frame = RenderFrame::new(&shared, 0, &BindingConfig::default()).unwrap();
        frame.begin().unwrap();
        frame.clear().unwrap();
        assert!(device.is_signaled(frame.fence()));
        frame.begin().unwrap();
    }

    #[test]
    fn encoder_records_into_buffer() {
        let device = Arc::new(MockDevice::default());
        let shared: SharedDevice = device.clone();
        let frame = RenderFrame::new(&shared, 0, &BindingConfig::default()).unwrap();
        let token = frame.begin().unwrap();
        let cb = vk::CommandBuffer::from_raw(3);
        assert_eq!(cb, frame.encoder(token, cb).command_buffer());
    }

    #[test]
    fn drop_destroys_fence() {
        let device = Arc::new(MockDevice::default());
        let shared: SharedDevice = device.clone();
        let frame = RenderFrame::new(&shared, 0, &BindingConfig::default()).unwrap();
        assert_eq!(1, device.created("Fence"));
        drop(frame);
        assert_eq!(1, device.destroyed("Fence"));
    }
}
