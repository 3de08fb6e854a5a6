//! Backend facade
//!
//! Owns every component and wires the frame lifecycle: consumers call
//! `begin_rendering`, `acquire_next_swapchain_image`, record draws
//! through the allocators and the bind cache, then `end_rendering`.
//! Swap-chain loss is recoverable: the facade rebuilds the dependent
//! resources (swap chain, render passes, pipeline catalog) and the
//! caller simply retries next frame.

use crate::bind_cache::PipelineBindCache;
use crate::config::RenderConfig;
use crate::context::{DeviceContext, VulkanError, VulkanResult};
use crate::dynamic::{DynamicAllocation, DynamicBuffers, UniformAllocation};
use crate::frame::FrameController;
use crate::pipeline::{PipelineCatalog, PipelineKey};
use crate::render_pass::RenderPassRegistry;
use crate::staging::{StagingAllocation, StagingAllocator};
use crate::swapchain::Swapchain;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

/// Fallback extent used before the surface reports its real size
const DEFAULT_EXTENT: vk::Extent2D = vk::Extent2D {
    width: 1280,
    height: 720,
};

/// The renderer backend
///
/// Field order is teardown order: frame resources and allocators
/// first, then the pipeline catalog, render passes and swap chain,
/// with the device context last.
pub struct VulkanRenderer {
    bind_cache: PipelineBindCache,
    frame: FrameController,
    dynamic: DynamicBuffers,
    staging: StagingAllocator,
    pipelines: PipelineCatalog,
    passes: RenderPassRegistry,
    swapchain: Swapchain,
    ctx: DeviceContext,
    config: RenderConfig,
    resize_requested: bool,
}

impl VulkanRenderer {
    /// Bring up the whole backend against an externally owned window
    pub fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        config: RenderConfig,
    ) -> VulkanResult<Self> {
        let mut ctx = DeviceContext::new(
            display_handle,
            window_handle,
            &config.app_name,
            config.validation,
            config.desired_sample_count,
        )?;

        let swapchain = Swapchain::new(&ctx, DEFAULT_EXTENT, config.vsync, None)?;
        let passes = RenderPassRegistry::new(&ctx, &swapchain)?;
        let pipelines = PipelineCatalog::new(&ctx, &passes, &config.shader_dir)?;

        let mut staging = StagingAllocator::new(&ctx, config.staging_buffer_size())?;
        let dynamic = DynamicBuffers::new(
            &ctx,
            &pipelines.set_layouts,
            &mut staging,
            config.dynamic_vertex_buffer_size(),
            config.dynamic_index_buffer_size(),
            config.dynamic_uniform_buffer_size(),
        )?;
        // Push the initialization uploads (fan index pattern) through
        // before the first frame renders
        staging.submit(&mut ctx)?;

        let frame = FrameController::new(&ctx)?;

        log::info!("Renderer backend initialized");

        Ok(Self {
            bind_cache: PipelineBindCache::new(),
            frame,
            dynamic,
            staging,
            pipelines,
            passes,
            swapchain,
            ctx,
            config,
            resize_requested: false,
        })
    }

    /// Begin a frame over the given render-target rectangle.
    ///
    /// Runs a pending swap-chain rebuild first, submits any staging
    /// uploads recorded between frames, and opens the main render
    /// pass.
    pub fn begin_rendering(
        &mut self,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> VulkanResult<()> {
        if self.resize_requested {
            self.rebuild_swapchain_resources()?;
        }
        // Uploads staged during level load or between frames must be
        // on the queue before this frame's draws consume them
        self.staging.submit(&mut self.ctx)?;

        self.bind_cache.reset();
        self.frame
            .begin_rendering(&mut self.ctx, &self.passes, x, y, width, height)
    }

    /// Acquire the next presentable image index.
    ///
    /// Failure with [`VulkanError::SwapchainOutOfDate`] is recoverable:
    /// finish the frame with `end_rendering(false)`; the rebuild
    /// happens automatically on the next `begin_rendering`.
    pub fn acquire_next_swapchain_image(&mut self) -> VulkanResult<u32> {
        match self.frame.acquire_next_image(&self.swapchain) {
            Ok(acquired) => {
                if acquired.suboptimal {
                    log::warn!("Swapchain suboptimal; scheduling rebuild");
                    self.resize_requested = true;
                }
                Ok(acquired.image_index)
            }
            Err(VulkanError::SwapchainOutOfDate) => {
                self.resize_requested = true;
                Err(VulkanError::SwapchainOutOfDate)
            }
            Err(e) => Err(e),
        }
    }

    /// Switch from the scene pass to the UI overlay pass
    pub fn set_2d(&mut self) -> VulkanResult<()> {
        self.frame.set_2d(&self.ctx, &self.passes)
    }

    /// End the frame: submit the recorded commands, present when an
    /// image was acquired, flip the dynamic-buffer slots and advance
    /// the color-buffer round robin
    pub fn end_rendering(&mut self, swapchain_acquired: bool) -> VulkanResult<()> {
        let result = self
            .frame
            .end_rendering(&mut self.ctx, &self.swapchain, swapchain_acquired);

        match result {
            Ok(()) => {
                self.dynamic.swap();
                self.frame.retire()?;
                Ok(())
            }
            Err(VulkanError::SwapchainOutOfDate) => {
                // Submission succeeded; only the present was stale.
                // The frame still retires so slots stay consistent.
                self.resize_requested = true;
                self.dynamic.swap();
                self.frame.retire()?;
                Err(VulkanError::SwapchainOutOfDate)
            }
            Err(e) => Err(e),
        }
    }

    /// Block until all submitted GPU work completes
    pub fn wait_for_device_idle(&mut self) -> VulkanResult<()> {
        self.ctx.wait_for_device_idle()
    }

    /// Request a swap-chain rebuild before the next frame (window
    /// resize, display change)
    pub fn request_resize(&mut self) {
        self.resize_requested = true;
    }

    /// Tear down and recreate every swap-chain-dependent resource:
    /// swap chain, render passes/framebuffers and the pipeline catalog
    pub fn rebuild_swapchain_resources(&mut self) -> VulkanResult<()> {
        log::debug!("Rebuilding swapchain-dependent resources");
        self.ctx.wait_for_device_idle()?;

        let new_swapchain = Swapchain::new(
            &self.ctx,
            self.swapchain.extent(),
            self.config.vsync,
            Some(&self.swapchain),
        )?;
        self.swapchain = new_swapchain;

        // Build replacements first, then drop the old catalog before
        // the old passes it was compiled against
        let new_passes = RenderPassRegistry::new(&self.ctx, &self.swapchain)?;
        let new_pipelines = PipelineCatalog::new(&self.ctx, &new_passes, &self.config.shader_dir)?;
        self.pipelines = new_pipelines;
        self.passes = new_passes;

        self.bind_cache.reset();
        self.resize_requested = false;
        Ok(())
    }

    /// Bind a catalog pipeline on the active command buffer; redundant
    /// binds are elided
    pub fn bind_pipeline(&mut self, key: PipelineKey) -> VulkanResult<()> {
        let command_buffer = self.ctx.command_buffer();
        if command_buffer == vk::CommandBuffer::null() {
            return Err(VulkanError::InvalidOperation {
                reason: "no active command buffer; bind inside a frame".to_string(),
            });
        }
        let pipeline = self
            .pipelines
            .get(key)
            .ok_or_else(|| VulkanError::InvalidOperation {
                reason: format!("no pipeline for key {key:?}"),
            })?;
        self.bind_cache
            .bind(self.ctx.ash_device(), command_buffer, pipeline);
        Ok(())
    }

    /// Stage `size` bytes at `alignment` for upload
    pub fn staging_allocate(
        &mut self,
        size: u64,
        alignment: u64,
    ) -> VulkanResult<StagingAllocation<'_>> {
        self.staging.allocate(&self.ctx, size, alignment)
    }

    /// Submit staged uploads immediately instead of waiting for the
    /// next frame boundary
    pub fn submit_staging(&mut self) -> VulkanResult<()> {
        self.staging.submit(&mut self.ctx)
    }

    /// Allocate vertex data for the current frame
    pub fn vertex_allocate(&mut self, size: u64) -> VulkanResult<DynamicAllocation<'_>> {
        self.dynamic.vertex_allocate(size)
    }

    /// Allocate index data for the current frame
    pub fn index_allocate(&mut self, size: u64) -> VulkanResult<DynamicAllocation<'_>> {
        self.dynamic.index_allocate(size)
    }

    /// Allocate per-draw uniform data for the current frame
    pub fn uniform_allocate(&mut self, size: u64) -> VulkanResult<UniformAllocation<'_>> {
        self.dynamic.uniform_allocate(size)
    }

    /// Force dynamic-buffer writes visible on non-coherent memory
    pub fn flush_dynamic_buffers(&mut self) -> VulkanResult<()> {
        self.dynamic.flush()
    }

    /// Select a memory type for a resource against this device
    pub fn select_memory_type(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
    ) -> VulkanResult<u32> {
        self.ctx.memory_type_index(type_bits, required, preferred)
    }

    /// Name a GPU object for diagnostic tooling
    pub fn set_object_name(&self, object_handle: u64, object_type: vk::ObjectType, name: &str) {
        self.ctx.set_object_name(object_handle, object_type, name);
    }

    /// Replace the scene clear color
    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.passes.set_clear_color(color);
    }

    /// Borrow the device context
    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    /// Mutably borrow the device context (matrix snapshot updates)
    pub fn context_mut(&mut self) -> &mut DeviceContext {
        &mut self.ctx
    }

    /// Borrow the pipeline catalog
    pub fn pipelines(&self) -> &PipelineCatalog {
        &self.pipelines
    }

    /// Borrow the render pass registry
    pub fn render_passes(&self) -> &RenderPassRegistry {
        &self.passes
    }

    /// Borrow the swap chain
    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    /// Borrow the dynamic buffers (fan index buffer, usage stats)
    pub fn dynamic_buffers(&self) -> &DynamicBuffers {
        &self.dynamic
    }

    /// Bind-elision statistics: (issued, elided)
    pub fn bind_stats(&self) -> (u64, u64) {
        (
            self.bind_cache.binds_issued(),
            self.bind_cache.binds_elided(),
        )
    }
}

impl Drop for VulkanRenderer {
    fn drop(&mut self) {
        // Destruction must not race in-flight command buffers
        let _ = self.ctx.wait_for_device_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Validates the frame-control and allocation entry points exist
    /// with their expected signatures without requiring a live GPU.
    /// Wrong signatures fail to compile.
    #[test]
    fn frame_control_api_signatures() {
        let _begin: fn(&mut VulkanRenderer, i32, i32, u32, u32) -> VulkanResult<()> =
            VulkanRenderer::begin_rendering;
        let _acquire: fn(&mut VulkanRenderer) -> VulkanResult<u32> =
            VulkanRenderer::acquire_next_swapchain_image;
        let _end: fn(&mut VulkanRenderer, bool) -> VulkanResult<()> =
            VulkanRenderer::end_rendering;
        let _wait: fn(&mut VulkanRenderer) -> VulkanResult<()> =
            VulkanRenderer::wait_for_device_idle;
        let _rebuild: fn(&mut VulkanRenderer) -> VulkanResult<()> =
            VulkanRenderer::rebuild_swapchain_resources;
    }

    #[test]
    fn allocation_api_signatures() {
        let _staging: fn(&mut VulkanRenderer, u64, u64) -> VulkanResult<StagingAllocation<'_>> =
            VulkanRenderer::staging_allocate;
        let _vertex: fn(&mut VulkanRenderer, u64) -> VulkanResult<DynamicAllocation<'_>> =
            VulkanRenderer::vertex_allocate;
        let _index: fn(&mut VulkanRenderer, u64) -> VulkanResult<DynamicAllocation<'_>> =
            VulkanRenderer::index_allocate;
        let _uniform: fn(&mut VulkanRenderer, u64) -> VulkanResult<UniformAllocation<'_>> =
            VulkanRenderer::uniform_allocate;
        let _bind: fn(&mut VulkanRenderer, PipelineKey) -> VulkanResult<()> =
            VulkanRenderer::bind_pipeline;
        let _memory: fn(
            &VulkanRenderer,
            u32,
            vk::MemoryPropertyFlags,
            vk::MemoryPropertyFlags,
        ) -> VulkanResult<u32> = VulkanRenderer::select_memory_type;
    }
}
