//! # Render Core
//!
//! GPU resource and command-submission backend for a real-time 3D renderer.
//!
//! This crate owns the Vulkan device/queue context, streams per-frame
//! geometry and uniform data through double-buffered dynamic buffers,
//! stages texture/geometry uploads through a growable linear staging
//! allocator, builds the fixed catalog of graphics pipelines used by the
//! renderer's draw passes, and drives the frame lifecycle (swap-chain
//! acquisition, render-pass sequencing, submission, device-idle sync).
//!
//! Scene traversal, visibility culling, particle simulation and other
//! content-level systems are external collaborators: they call the
//! allocation and pipeline-bind entry points exposed here but do not
//! participate in the internal algorithms.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_core::{RenderConfig, VulkanRenderer};
//! # use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
//! # fn handles() -> (RawDisplayHandle, RawWindowHandle) { unimplemented!() }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (display, window) = handles();
//!     let config = RenderConfig::default();
//!     let mut renderer = VulkanRenderer::new(display, window, config)?;
//!
//!     renderer.begin_rendering(0, 0, 1920, 1080)?;
//!     let acquired = renderer.acquire_next_swapchain_image().is_ok();
//!     // ... record draw calls ...
//!     renderer.end_rendering(acquired)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions, clippy::too_many_arguments)]

pub mod bind_cache;
pub mod buffer;
pub mod commands;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod dynamic;
pub mod frame;
pub mod logging;
pub mod pipeline;
pub mod render_pass;
pub mod shader;
pub mod staging;
pub mod swapchain;
pub mod sync;
pub mod vertex;

mod renderer;

pub use bind_cache::PipelineBindCache;
pub use buffer::Buffer;
pub use config::{ConfigError, RenderConfig};
pub use context::{
    select_memory_type, DeviceContext, LogicalDevice, PhysicalDeviceInfo, VulkanError,
    VulkanInstance, VulkanResult,
};
pub use dynamic::{DynamicAllocation, DynamicBuffers, UniformAllocation};
pub use frame::{FrameController, FrameState};
pub use pipeline::{DrawPass, Pipeline, PipelineCatalog, PipelineKey, VariantFlags};
pub use render_pass::RenderPassRegistry;
pub use renderer::VulkanRenderer;
pub use staging::{StagingAllocation, StagingAllocator};
pub use swapchain::{AcquiredImage, Swapchain};

/// Depth of the offscreen color-target round robin. Frame N+1 may be
/// recorded while the GPU still reads frame N's buffers; all per-frame
/// resources (command buffers, fences, dynamic-buffer slots) cycle with
/// this period.
pub const NUM_COLOR_BUFFERS: usize = 2;
