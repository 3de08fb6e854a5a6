//! Frame lifecycle controller
//!
//! Orchestrates one frame: wait on the slot's fence, begin the command
//! buffer and main render pass, acquire a swap-chain image, optionally
//! switch to the UI pass, then end, submit and present. The state
//! machine `Idle -> Acquiring -> Recording -> Submitted -> Idle` is
//! enforced at runtime; misuse is an error, not undefined behavior.
//!
//! Per-slot fences make the one-frame-ahead discipline explicit: a
//! slot's command buffer and dynamic-buffer region are reused only
//! after the GPU signaled the fence of that slot's previous frame.

use crate::commands::CommandPool;
use crate::context::{DeviceContext, VulkanError, VulkanResult};
use crate::render_pass::RenderPassRegistry;
use crate::swapchain::{AcquiredImage, Swapchain};
use crate::sync::FrameSync;
use crate::NUM_COLOR_BUFFERS;
use ash::vk;

/// Frame lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Between frames; nothing recording
    Idle,
    /// Command buffer recording, swap-chain image not yet acquired
    Acquiring,
    /// Image acquired; draw calls recording
    Recording,
    /// Commands submitted; allocator slots not yet flipped
    Submitted,
}

impl FrameState {
    /// Whether `next` is a legal successor of `self`.
    ///
    /// `Acquiring -> Submitted` covers the no-op submission path taken
    /// when image acquisition fails and the frame ends unpresented.
    pub fn can_transition(self, next: FrameState) -> bool {
        use FrameState::*;
        matches!(
            (self, next),
            (Idle, Acquiring)
                | (Acquiring, Recording)
                | (Acquiring, Submitted)
                | (Recording, Submitted)
                | (Submitted, Idle)
        )
    }
}

/// Which render pass is currently open on the command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActivePass {
    Main,
    Ui,
}

/// Drives acquisition, render-pass sequencing and submission
pub struct FrameController {
    state: FrameState,
    slot: usize,
    command_buffers: Vec<vk::CommandBuffer>,
    sync: Vec<FrameSync>,
    command_pool: CommandPool,
    acquired: Option<u32>,
    active_pass: Option<ActivePass>,
    render_rect: vk::Rect2D,
}

impl FrameController {
    /// Create per-slot command buffers and synchronization objects
    pub fn new(ctx: &DeviceContext) -> VulkanResult<Self> {
        let command_pool = CommandPool::new(ctx.raw_device(), ctx.physical_device.graphics_family)?;
        let command_buffers = command_pool.allocate_command_buffers(NUM_COLOR_BUFFERS as u32)?;

        let mut sync = Vec::with_capacity(NUM_COLOR_BUFFERS);
        for _ in 0..NUM_COLOR_BUFFERS {
            sync.push(FrameSync::new(ctx.raw_device())?);
        }

        Ok(Self {
            state: FrameState::Idle,
            slot: 0,
            command_buffers,
            sync,
            command_pool,
            acquired: None,
            active_pass: None,
            render_rect: vk::Rect2D::default(),
        })
    }

    fn transition(&mut self, next: FrameState) -> VulkanResult<()> {
        if !self.state.can_transition(next) {
            return Err(VulkanError::InvalidOperation {
                reason: format!("frame state {:?} cannot advance to {next:?}", self.state),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Current lifecycle state
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Color-buffer slot this frame renders into
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Swap-chain image index acquired for this frame, if any
    pub fn acquired_image(&self) -> Option<u32> {
        self.acquired
    }

    /// Begin a frame: synchronize with this slot's previous use, begin
    /// its command buffer and open the main render pass over the given
    /// render-target rectangle
    pub fn begin_rendering(
        &mut self,
        ctx: &mut DeviceContext,
        registry: &RenderPassRegistry,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> VulkanResult<()> {
        self.transition(FrameState::Acquiring)?;
        let device = ctx.ash_device().clone();
        let command_buffer = self.command_buffers[self.slot];
        let sync = &self.sync[self.slot];

        // The slot's previous frame must have fully retired before its
        // command buffer and dynamic-buffer region are touched again
        sync.in_flight.wait(u64::MAX)?;
        sync.in_flight.reset()?;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(VulkanError::Api)?;
        }
        ctx.set_command_buffer(command_buffer);

        registry.main_begin_template(self.slot).begin(&device, command_buffer);

        self.render_rect = vk::Rect2D {
            offset: vk::Offset2D { x, y },
            extent: vk::Extent2D { width, height },
        };
        let viewport = vk::Viewport {
            x: x as f32,
            y: y as f32,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            device.cmd_set_viewport(command_buffer, 0, &[viewport]);
            device.cmd_set_scissor(command_buffer, 0, &[self.render_rect]);
        }

        self.active_pass = Some(ActivePass::Main);
        Ok(())
    }

    /// Acquire the next presentable image.
    ///
    /// On [`VulkanError::SwapchainOutOfDate`] the frame stays open:
    /// the caller finishes it with `end_rendering(false)` and rebuilds
    /// swap-chain-dependent resources before the next frame.
    pub fn acquire_next_image(&mut self, swapchain: &Swapchain) -> VulkanResult<AcquiredImage> {
        if self.state != FrameState::Acquiring {
            return Err(VulkanError::InvalidOperation {
                reason: format!("cannot acquire in frame state {:?}", self.state),
            });
        }

        let acquired =
            swapchain.acquire_next_image(self.sync[self.slot].image_available.handle())?;
        self.acquired = Some(acquired.image_index);
        self.transition(FrameState::Recording)?;
        Ok(acquired)
    }

    /// Switch from the scene pass to the UI pass over the acquired
    /// swap-chain image (2D overlay rendering)
    pub fn set_2d(
        &mut self,
        ctx: &DeviceContext,
        registry: &RenderPassRegistry,
    ) -> VulkanResult<()> {
        if self.state != FrameState::Recording || self.active_pass != Some(ActivePass::Main) {
            return Err(VulkanError::InvalidOperation {
                reason: "2D pass requires an open scene pass and an acquired image".to_string(),
            });
        }
        let image_index = self.acquired.ok_or(VulkanError::InvalidOperation {
            reason: "2D pass without an acquired swapchain image".to_string(),
        })?;

        let device = ctx.ash_device();
        let command_buffer = self.command_buffers[self.slot];
        unsafe {
            device.cmd_end_render_pass(command_buffer);
        }
        registry
            .ui_begin_template(image_index)
            .begin(device, command_buffer);

        let extent = registry.extent();
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        unsafe {
            device.cmd_set_viewport(command_buffer, 0, &[viewport]);
            device.cmd_set_scissor(command_buffer, 0, &[scissor]);
        }

        self.active_pass = Some(ActivePass::Ui);
        Ok(())
    }

    /// End the active pass, submit the frame's commands and present.
    ///
    /// With `swapchain_acquired == false` (acquisition failed earlier)
    /// the submission runs without semaphores or presentation, keeping
    /// fences and slots consistent. A failed present surfaces the
    /// recoverable out-of-date error after all bookkeeping completes.
    pub fn end_rendering(
        &mut self,
        ctx: &mut DeviceContext,
        swapchain: &Swapchain,
        swapchain_acquired: bool,
    ) -> VulkanResult<()> {
        if swapchain_acquired != self.acquired.is_some() {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "end_rendering({swapchain_acquired}) does not match acquisition state"
                ),
            });
        }
        self.transition(FrameState::Submitted)?;

        let device = ctx.ash_device().clone();
        let command_buffer = self.command_buffers[self.slot];
        let sync = &self.sync[self.slot];

        if self.active_pass.take().is_some() {
            unsafe {
                device.cmd_end_render_pass(command_buffer);
            }
        }
        unsafe {
            device
                .end_command_buffer(command_buffer)
                .map_err(VulkanError::Api)?;
        }

        let command_buffers = [command_buffer];
        let wait_semaphores = [sync.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [sync.render_finished.handle()];

        let submit_info = if swapchain_acquired {
            vk::SubmitInfo::builder()
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .command_buffers(&command_buffers)
                .signal_semaphores(&signal_semaphores)
                .build()
        } else {
            vk::SubmitInfo::builder()
                .command_buffers(&command_buffers)
                .build()
        };

        unsafe {
            device
                .queue_submit(ctx.graphics_queue(), &[submit_info], sync.in_flight.handle())
                .map_err(VulkanError::Api)?;
        }
        ctx.mark_device_busy();
        ctx.set_command_buffer(vk::CommandBuffer::null());

        let present_result = if swapchain_acquired {
            let image_index = self.acquired.unwrap_or_default();
            swapchain.present(
                ctx.graphics_queue(),
                sync.render_finished.handle(),
                image_index,
            )
        } else {
            Ok(())
        };

        present_result
    }

    /// Finish the frame after the allocator slots flipped: advance the
    /// color-buffer slot round robin and return to idle
    pub fn retire(&mut self) -> VulkanResult<()> {
        self.transition(FrameState::Idle)?;
        self.slot = (self.slot + 1) % NUM_COLOR_BUFFERS;
        self.acquired = None;
        Ok(())
    }

    /// The command pool backing the per-slot command buffers
    pub fn command_pool(&self) -> &CommandPool {
        &self.command_pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FrameState::*;

    #[test]
    fn nominal_frame_walks_the_cycle() {
        assert!(Idle.can_transition(Acquiring));
        assert!(Acquiring.can_transition(Recording));
        assert!(Recording.can_transition(Submitted));
        assert!(Submitted.can_transition(Idle));
    }

    #[test]
    fn failed_acquire_skips_recording() {
        // Acquisition failure finishes the frame through the no-op
        // submission path without ever entering Recording
        assert!(Acquiring.can_transition(Submitted));
        assert!(!Acquiring.can_transition(Idle));
    }

    #[test]
    fn draws_cannot_be_recorded_against_an_invalid_target() {
        // No path re-enters Recording without a fresh acquire
        assert!(!Idle.can_transition(Recording));
        assert!(!Submitted.can_transition(Recording));
        assert!(!Recording.can_transition(Recording));
    }

    #[test]
    fn frames_do_not_nest_or_rewind() {
        assert!(!Recording.can_transition(Acquiring));
        assert!(!Submitted.can_transition(Acquiring));
        assert!(!Idle.can_transition(Submitted));
        assert!(!Acquiring.can_transition(Idle));
    }
}
