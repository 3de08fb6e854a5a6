//! Swap chain management
//!
//! Presentable image set cycled between rendering and display.
//! Acquisition failure from a stale surface is surfaced as the
//! recoverable [`VulkanError::SwapchainOutOfDate`], never a panic:
//! the caller rebuilds swap-chain-dependent resources and retries.

use crate::context::{DeviceContext, VulkanError, VulkanResult};
use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::{vk, Device};

/// Swap chain wrapper with RAII cleanup
pub struct Swapchain {
    device: Device,
    loader: SwapchainLoader,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swap chain sized to the surface, optionally chaining
    /// from the previous swap chain during recreation
    pub fn new(
        ctx: &DeviceContext,
        window_extent: vk::Extent2D,
        vsync: bool,
        old_swapchain: Option<&Swapchain>,
    ) -> VulkanResult<Self> {
        let device = ctx.raw_device();
        let loader = ctx.device.swapchain_loader.clone();
        let physical = ctx.physical_device.device;

        let surface_caps = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_capabilities(physical, ctx.surface)
                .map_err(VulkanError::Api)?
        };

        let surface_formats = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_formats(physical, ctx.surface)
                .map_err(VulkanError::Api)?
        };
        let format = surface_formats
            .iter()
            .find(|sf| {
                sf.format == vk::Format::B8G8R8A8_UNORM
                    && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .copied()
            .unwrap_or(surface_formats[0]);

        let present_modes = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_present_modes(physical, ctx.surface)
                .map_err(VulkanError::Api)?
        };
        let wanted_mode = if vsync {
            vk::PresentModeKHR::FIFO
        } else {
            vk::PresentModeKHR::MAILBOX
        };
        let present_mode = present_modes
            .iter()
            .copied()
            .find(|&mode| mode == wanted_mode)
            .unwrap_or(vk::PresentModeKHR::FIFO);

        let extent = if surface_caps.current_extent.width != u32::MAX {
            surface_caps.current_extent
        } else {
            vk::Extent2D {
                width: window_extent.width.clamp(
                    surface_caps.min_image_extent.width,
                    surface_caps.max_image_extent.width,
                ),
                height: window_extent.height.clamp(
                    surface_caps.min_image_extent.height,
                    surface_caps.max_image_extent.height,
                ),
            }
        };

        let image_count = (surface_caps.min_image_count + 1).min(if surface_caps.max_image_count > 0
        {
            surface_caps.max_image_count
        } else {
            surface_caps.min_image_count + 1
        });

        let swapchain_create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(ctx.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(
                old_swapchain.map_or(vk::SwapchainKHR::null(), |old| old.swapchain),
            );

        let swapchain = unsafe {
            loader
                .create_swapchain(&swapchain_create_info, None)
                .map_err(VulkanError::Api)?
        };

        let images = unsafe {
            loader
                .get_swapchain_images(swapchain)
                .map_err(VulkanError::Api)?
        };

        let image_views: Result<Vec<_>, _> = images
            .iter()
            .map(|&image| {
                let create_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format.format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });
                unsafe { device.create_image_view(&create_info, None) }
            })
            .collect();
        let image_views = image_views.map_err(VulkanError::Api)?;

        log::debug!(
            "Swapchain ready: {}x{}, {} images, {:?}",
            extent.width,
            extent.height,
            images.len(),
            present_mode
        );

        Ok(Self {
            device,
            loader,
            swapchain,
            images,
            image_views,
            format,
            extent,
        })
    }

    /// Acquire the next presentable image index.
    ///
    /// A suboptimal acquire still succeeds for this frame (the result
    /// flags it so the caller can schedule a rebuild); an out-of-date
    /// surface fails with the recoverable error.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> VulkanResult<AcquiredImage> {
        match unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        } {
            Ok((image_index, suboptimal)) => Ok(AcquiredImage {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(VulkanError::SwapchainOutOfDate),
            Err(e) => Err(VulkanError::Api(e)),
        }
    }

    /// Queue a present of `image_index`, waiting on `wait_semaphore`.
    ///
    /// Out-of-date and suboptimal results map to the recoverable error.
    pub fn present(
        &self,
        queue: vk::Queue,
        wait_semaphore: vk::Semaphore,
        image_index: u32,
    ) -> VulkanResult<()> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(()),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                Err(VulkanError::SwapchainOutOfDate)
            }
            Err(e) => Err(VulkanError::Api(e)),
        }
    }

    /// Get the swap chain extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Get the surface format
    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Get the per-image views
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    /// Number of presentable images
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// Get the swap chain handle
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }
}

/// Result of a successful image acquisition
#[derive(Debug, Clone, Copy)]
pub struct AcquiredImage {
    /// Index into the swap chain's image array
    pub image_index: u32,
    /// The surface no longer matches exactly; rebuild soon
    pub suboptimal: bool,
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &image_view in &self.image_views {
                self.device.destroy_image_view(image_view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}
