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

//! Resource binding layer on top of Vulkan.
//!
//! GPU objects that are described by plain data (set layouts, pipeline layouts,
//! render passes, framebuffers and pipelines) are built once and shared through
//! [`vulkan::RenderResourceCache`]. Descriptor sets are resolved per draw from
//! whatever resources are bound on [`vulkan::RenderCommandEncoder`] and cached per
//! frame in flight.

mod config;
mod context;
mod error;
pub mod vulkan;

pub use config::*;
pub use context::*;
pub use error::*;
