//! Render pass registry
//!
//! Owns the offscreen scene targets (two color buffers cycled per
//! frame, one depth buffer, an MSAA target when multisampling is on),
//! the main/UI/warp render passes, their framebuffers and the pre-built
//! begin templates. Everything here is immutable between swap-chain
//! rebuilds and torn down wholesale on resize or format change.

use crate::context::{DeviceContext, VulkanError, VulkanResult};
use crate::swapchain::Swapchain;
use crate::NUM_COLOR_BUFFERS;
use ash::{vk, Device};

/// An image + memory + view bundle used as a framebuffer attachment
pub struct RenderTarget {
    device: Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
}

impl RenderTarget {
    /// Create an optimally tiled 2D attachment image
    pub fn new(
        ctx: &DeviceContext,
        format: vk::Format,
        extent: vk::Extent2D,
        samples: vk::SampleCountFlags,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
        preferred_memory: vk::MemoryPropertyFlags,
        name: &str,
    ) -> VulkanResult<Self> {
        let device = ctx.raw_device();

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe {
            device
                .create_image(&image_info, None)
                .map_err(VulkanError::Api)?
        };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let type_index = match ctx.memory_type_index(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            preferred_memory,
        ) {
            Ok(index) => index,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);
        let memory = unsafe {
            match device.allocate_memory(&alloc_info, None) {
                Ok(memory) => memory,
                Err(e) => {
                    device.destroy_image(image, None);
                    return Err(VulkanError::Api(e));
                }
            }
        };

        if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
            unsafe {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
            }
            return Err(VulkanError::Api(e));
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe {
            match device.create_image_view(&view_info, None) {
                Ok(view) => view,
                Err(e) => {
                    device.destroy_image(image, None);
                    device.free_memory(memory, None);
                    return Err(VulkanError::Api(e));
                }
            }
        };

        ctx.set_object_name(vk::Handle::as_raw(image), vk::ObjectType::IMAGE, name);

        Ok(Self {
            device,
            image,
            memory,
            view,
        })
    }

    /// Get the image view handle
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Get the image handle
    pub fn image(&self) -> vk::Image {
        self.image
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// Owned begin-info template for one (pass, framebuffer) pair
///
/// `vk::RenderPassBeginInfo` borrows its clear-value array, so the
/// template stores owned data and assembles the raw info at record
/// time.
#[derive(Clone)]
pub struct PassBeginTemplate {
    /// Render pass to begin
    pub render_pass: vk::RenderPass,
    /// Framebuffer for this slot/image
    pub framebuffer: vk::Framebuffer,
    /// Full-target render area
    pub render_area: vk::Rect2D,
    /// Clear values, one per cleared attachment
    pub clear_values: Vec<vk::ClearValue>,
}

impl PassBeginTemplate {
    /// Record `vkCmdBeginRenderPass` from this template
    pub fn begin(&self, device: &Device, command_buffer: vk::CommandBuffer) {
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(self.framebuffer)
            .render_area(self.render_area)
            .clear_values(&self.clear_values);
        unsafe {
            device.cmd_begin_render_pass(command_buffer, &begin_info, vk::SubpassContents::INLINE);
        }
    }
}

/// The backend's render passes, scene targets and begin templates
pub struct RenderPassRegistry {
    device: Device,

    main_pass: vk::RenderPass,
    ui_pass: vk::RenderPass,
    warp_pass: vk::RenderPass,

    color_targets: Vec<RenderTarget>,
    msaa_target: Option<RenderTarget>,
    depth_target: RenderTarget,

    main_framebuffers: Vec<vk::Framebuffer>,
    ui_framebuffers: Vec<vk::Framebuffer>,

    main_begin: Vec<PassBeginTemplate>,
    ui_begin: Vec<PassBeginTemplate>,

    extent: vk::Extent2D,
    warp_clear: vk::ClearValue,
}

impl RenderPassRegistry {
    /// Build targets, passes, framebuffers and begin templates against
    /// the current swap chain
    pub fn new(ctx: &DeviceContext, swapchain: &Swapchain) -> VulkanResult<Self> {
        let device = ctx.raw_device();
        let extent = swapchain.extent();
        let samples = ctx.sample_count();
        let multisampled = samples != vk::SampleCountFlags::TYPE_1;

        // Scene targets, cycled round-robin across frames
        let mut color_targets = Vec::with_capacity(NUM_COLOR_BUFFERS);
        for slot in 0..NUM_COLOR_BUFFERS {
            color_targets.push(RenderTarget::new(
                ctx,
                ctx.color_format(),
                extent,
                vk::SampleCountFlags::TYPE_1,
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::INPUT_ATTACHMENT,
                vk::ImageAspectFlags::COLOR,
                vk::MemoryPropertyFlags::empty(),
                &format!("scene color {slot}"),
            )?);
        }

        let msaa_target = if multisampled {
            Some(RenderTarget::new(
                ctx,
                ctx.color_format(),
                extent,
                samples,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
                vk::ImageAspectFlags::COLOR,
                vk::MemoryPropertyFlags::LAZILY_ALLOCATED,
                "scene msaa color",
            )?)
        } else {
            None
        };

        let depth_target = RenderTarget::new(
            ctx,
            ctx.depth_format(),
            extent,
            samples,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
            vk::MemoryPropertyFlags::empty(),
            "scene depth",
        )?;

        let main_pass = Self::create_main_pass(
            &device,
            ctx.color_format(),
            ctx.depth_format(),
            samples,
        )?;
        let ui_pass = Self::create_ui_pass(&device, swapchain.format().format)?;
        let warp_pass = Self::create_warp_pass(&device, ctx.color_format())?;

        // Main framebuffers: one per color-buffer slot
        let mut main_framebuffers = Vec::with_capacity(NUM_COLOR_BUFFERS);
        for target in &color_targets {
            let mut attachments = vec![];
            if let Some(msaa) = &msaa_target {
                attachments.push(msaa.view());
                attachments.push(depth_target.view());
                attachments.push(target.view());
            } else {
                attachments.push(target.view());
                attachments.push(depth_target.view());
            }
            main_framebuffers.push(Self::create_framebuffer(
                &device, main_pass, &attachments, extent,
            )?);
        }

        // UI framebuffers: one per swap-chain image
        let mut ui_framebuffers = Vec::with_capacity(swapchain.image_views().len());
        for &view in swapchain.image_views() {
            ui_framebuffers.push(Self::create_framebuffer(
                &device,
                ui_pass,
                &[view],
                extent,
            )?);
        }

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let color_clear = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 1.0],
            },
        };
        let depth_clear = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        };

        let main_clear_values = if multisampled {
            vec![color_clear, depth_clear, color_clear]
        } else {
            vec![color_clear, depth_clear]
        };

        let main_begin = main_framebuffers
            .iter()
            .map(|&framebuffer| PassBeginTemplate {
                render_pass: main_pass,
                framebuffer,
                render_area,
                clear_values: main_clear_values.clone(),
            })
            .collect();

        let ui_begin = ui_framebuffers
            .iter()
            .map(|&framebuffer| PassBeginTemplate {
                render_pass: ui_pass,
                framebuffer,
                render_area,
                clear_values: Vec::new(),
            })
            .collect();

        log::debug!(
            "Render passes ready: {}x{}, {NUM_COLOR_BUFFERS} scene slots, {} swapchain images",
            extent.width,
            extent.height,
            ui_framebuffers.len()
        );

        Ok(Self {
            device,
            main_pass,
            ui_pass,
            warp_pass,
            color_targets,
            msaa_target,
            depth_target,
            main_framebuffers,
            ui_framebuffers,
            main_begin,
            ui_begin,
            extent,
            warp_clear: color_clear,
        })
    }

    fn create_main_pass(
        device: &Device,
        color_format: vk::Format,
        depth_format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> VulkanResult<vk::RenderPass> {
        let multisampled = samples != vk::SampleCountFlags::TYPE_1;

        let mut attachments = Vec::new();
        let color_attachment_index;
        let resolve_attachment_index;

        if multisampled {
            // MSAA color, resolved into the sampled scene target
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(color_format)
                    .samples(samples)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .build(),
            );
            color_attachment_index = 0;
            resolve_attachment_index = Some(2);
        } else {
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(color_format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .build(),
            );
            color_attachment_index = 0;
            resolve_attachment_index = None;
        }

        attachments.push(
            vk::AttachmentDescription::builder()
                .format(depth_format)
                .samples(samples)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .build(),
        );

        if multisampled {
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(color_format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .build(),
            );
        }

        let color_ref = vk::AttachmentReference {
            attachment: color_attachment_index,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let resolve_ref = resolve_attachment_index.map(|attachment| vk::AttachmentReference {
            attachment,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        });

        let color_refs = [color_ref];
        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .depth_stencil_attachment(&depth_ref);
        let resolve_refs;
        if let Some(resolve) = resolve_ref {
            resolve_refs = [resolve];
            subpass = subpass.resolve_attachments(&resolve_refs);
        }
        let subpasses = [subpass.build()];

        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .build();
        let dependencies = [dependency];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        unsafe {
            device
                .create_render_pass(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }

    fn create_ui_pass(device: &Device, format: vk::Format) -> VulkanResult<vk::RenderPass> {
        // Postprocess covers the full image first, so the previous
        // contents are irrelevant
        let attachment = vk::AttachmentDescription::builder()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::DONT_CARE)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build();
        let attachments = [attachment];

        let color_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let color_refs = [color_ref];
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .build();
        let subpasses = [subpass];

        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .build();
        let dependencies = [dependency];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        unsafe {
            device
                .create_render_pass(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }

    fn create_warp_pass(device: &Device, format: vk::Format) -> VulkanResult<vk::RenderPass> {
        let attachment = vk::AttachmentDescription::builder()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .build();
        let attachments = [attachment];

        let color_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let color_refs = [color_ref];
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .build();
        let subpasses = [subpass];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses);

        unsafe {
            device
                .create_render_pass(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }

    fn create_framebuffer(
        device: &Device,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VulkanResult<vk::Framebuffer> {
        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        unsafe {
            device
                .create_framebuffer(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }

    /// Main-pass begin template for a color-buffer slot
    pub fn main_begin_template(&self, slot: usize) -> &PassBeginTemplate {
        &self.main_begin[slot]
    }

    /// UI-pass begin template for an acquired swap-chain image
    pub fn ui_begin_template(&self, image_index: u32) -> &PassBeginTemplate {
        &self.ui_begin[image_index as usize]
    }

    /// Build a begin template for an externally owned warp framebuffer
    pub fn warp_begin_template(
        &self,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    ) -> PassBeginTemplate {
        PassBeginTemplate {
            render_pass: self.warp_pass,
            framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            clear_values: vec![self.warp_clear],
        }
    }

    /// Replace the main-pass clear color across all slot templates
    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        let clear = vk::ClearValue {
            color: vk::ClearColorValue { float32: color },
        };
        for template in &mut self.main_begin {
            template.clear_values[0] = clear;
            if template.clear_values.len() == 3 {
                template.clear_values[2] = clear;
            }
        }
        self.warp_clear = clear;
    }

    /// Main scene render pass
    pub fn main_render_pass(&self) -> vk::RenderPass {
        self.main_pass
    }

    /// UI/composite render pass over the swap-chain image
    pub fn ui_render_pass(&self) -> vk::RenderPass {
        self.ui_pass
    }

    /// Offscreen effect (warp) render pass
    pub fn warp_render_pass(&self) -> vk::RenderPass {
        self.warp_pass
    }

    /// Sampled view of a slot's scene color target
    pub fn scene_color_view(&self, slot: usize) -> vk::ImageView {
        self.color_targets[slot].view()
    }

    /// Render target extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for RenderPassRegistry {
    fn drop(&mut self) {
        unsafe {
            for &framebuffer in self.main_framebuffers.iter().chain(&self.ui_framebuffers) {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            self.device.destroy_render_pass(self.main_pass, None);
            self.device.destroy_render_pass(self.ui_pass, None);
            self.device.destroy_render_pass(self.warp_pass, None);
        }
        // Targets drop afterwards via their own RAII
    }
}
