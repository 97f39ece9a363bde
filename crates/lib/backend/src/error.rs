// Copyright (C) 2023-2024 gigablaster

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

use ash::vk;
use thiserror::Error;

use crate::vulkan::ShaderResourceKind;

/// Every failure here is fatal for the object being built. Callers are expected to
/// propagate it up to whoever owns the device and shut down.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Out of device memory")]
    OutOfDeviceMemory,
    #[error("Out of host memory")]
    OutOfHostMemory,
    #[error("Too many objects")]
    TooManyObjects,
    #[error("Descriptor pool exhausted even after allocating a new pool")]
    OutOfPoolMemory,
    #[error("Not supported")]
    NotSupported,
    #[error("Failed to map memory")]
    MemoryMapFailed,
    #[error("Shader resource {name} of kind {kind:?} has no matching descriptor type")]
    UnsupportedShaderResource {
        name: String,
        kind: ShaderResourceKind,
    },
    #[error("Frame token of generation {got} used, manager is at generation {expected}")]
    StaleFrameToken { expected: u64, got: u64 },
    #[error("Invalid binding config: {0}")]
    InvalidConfig(&'static str),
    #[error("Subpass refers to attachment {index}, render pass has {count}")]
    InvalidAttachment { index: u32, count: usize },
    #[error("No buffer pool for usage {0:?}")]
    NoBufferPool(vk::BufferUsageFlags),
    #[error("Vulkan error {0}")]
    Vulkan(vk::Result),
}

pub type BackendResult<T> = Result<T, BackendError>;

impl From<vk::Result> for BackendError {
    fn from(value: vk::Result) -> Self {
        match value {
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED
            | vk::Result::ERROR_FEATURE_NOT_PRESENT
            | vk::Result::ERROR_IMAGE_USAGE_NOT_SUPPORTED_KHR => Self::NotSupported,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_TOO_MANY_OBJECTS => Self::TooManyObjects,
            vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                Self::OutOfPoolMemory
            }
            other => Self::Vulkan(other),
        }
    }
}

impl From<gpu_alloc::AllocationError> for BackendError {
    fn from(value: gpu_alloc::AllocationError) -> Self {
        match value {
            gpu_alloc::AllocationError::NoCompatibleMemoryTypes => Self::NotSupported,
            gpu_alloc::AllocationError::OutOfDeviceMemory => Self::OutOfDeviceMemory,
            gpu_alloc::AllocationError::OutOfHostMemory => Self::OutOfHostMemory,
            gpu_alloc::AllocationError::TooManyObjects => Self::TooManyObjects,
        }
    }
}

impl From<gpu_alloc::MapError> for BackendError {
    fn from(value: gpu_alloc::MapError) -> Self {
        match value {
            gpu_alloc::MapError::NonHostVisible => Self::NotSupported,
            gpu_alloc::MapError::AlreadyMapped | gpu_alloc::MapError::MapFailed => {
                Self::MemoryMapFailed
            }
            gpu_alloc::MapError::OutOfDeviceMemory => Self::OutOfDeviceMemory,
            gpu_alloc::MapError::OutOfHostMemory => Self::OutOfHostMemory,
        }
    }
}

impl From<(Vec<vk::Pipeline>, vk::Result)> for BackendError {
    fn from(value: (Vec<vk::Pipeline>, vk::Result)) -> Self {
        value.1.into()
    }
}
