//! Vulkan device context
//!
//! Instance, physical/logical device bring-up and the `DeviceContext`
//! singleton every other backend component borrows: queue, active
//! command buffer, chosen formats, sample count and the capability
//! snapshot used for memory-type selection.

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::vk;
use ash::{Device, Entry, Instance};
use nalgebra::Matrix4;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{CStr, CString};
use thiserror::Error;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Invalid operation attempted (wrong frame state, misuse of an
    /// allocator, mismatched teardown order)
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// A fixed-capacity allocation could not be satisfied
    #[error("Out of memory: {requested} bytes")]
    OutOfMemory {
        /// Number of bytes that were requested
        requested: u64,
    },

    /// Backend initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No memory type satisfies the required property flags
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// The swap chain no longer matches the surface; the caller must
    /// rebuild swap-chain-dependent resources and retry next frame
    #[error("Swap chain out of date")]
    SwapchainOutOfDate,
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

/// Select a memory type index for a resource.
///
/// `type_bits` is the compatibility mask from the resource's memory
/// requirements. The lowest-indexed compatible type carrying both
/// `required` and `preferred` flags wins; if no type carries the
/// preferred flags the search falls back to `required` alone. Failing
/// the required flags is unrecoverable: no resource of the requested
/// kind can exist on this device.
pub fn select_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
    preferred: vk::MemoryPropertyFlags,
) -> VulkanResult<u32> {
    let wanted = required | preferred;
    for pass in 0..2 {
        let flags = if pass == 0 { wanted } else { required };
        for index in 0..memory_properties.memory_type_count {
            let supported = (type_bits & (1 << index)) != 0;
            let type_flags = memory_properties.memory_types[index as usize].property_flags;
            if supported && type_flags.contains(flags) {
                return Ok(index);
            }
        }
        if wanted == required {
            break;
        }
    }
    Err(VulkanError::NoSuitableMemoryType)
}

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    debug_utils: Option<DebugUtils>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanInstance {
    /// Create a new Vulkan instance, optionally with validation layers
    /// and a debug messenger
    pub fn new(
        display_handle: RawDisplayHandle,
        app_name: &str,
        enable_validation: bool,
    ) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| {
            VulkanError::InitializationFailed(format!("Failed to load Vulkan: {e:?}"))
        })?;

        let app_name_cstr = CString::new(app_name).unwrap();
        let engine_name_cstr = CString::new("render_core").unwrap();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let mut extensions: Vec<*const i8> =
            ash_window::enumerate_required_extensions(display_handle)
                .map_err(VulkanError::Api)?
                .to_vec();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap()]
        } else {
            vec![]
        };
        let layer_names_ptrs: Vec<*const i8> =
            layer_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names_ptrs);

        let instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        let (debug_utils, debug_messenger) = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let messenger = Self::setup_debug_messenger(&debug_utils)?;
            (Some(debug_utils), Some(messenger))
        } else {
            (None, None)
        };

        Ok(Self {
            entry,
            instance,
            debug_utils,
            debug_messenger,
        })
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }

    /// Access the DebugUtils extension if validation is enabled
    pub fn debug_utils(&self) -> Option<&DebugUtils> {
        self.debug_utils.as_ref()
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let (Some(debug_utils), Some(messenger)) =
                (&self.debug_utils, self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = *callback_data;
    let message = CStr::from_ptr(callback_data.p_message).to_string_lossy();

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[Vulkan] {message_type:?} - {message}");
    } else {
        log::warn!("[Vulkan] {message_type:?} - {message}");
    }

    vk::FALSE
}

/// Physical device selection and capability snapshot
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported device features
    pub features: vk::PhysicalDeviceFeatures,
    /// Memory heap/type snapshot consumed by [`select_memory_type`]
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Index of the graphics queue family
    pub graphics_family: u32,
    /// Index of the presentation queue family
    pub present_family: u32,
}

impl PhysicalDeviceInfo {
    /// Select a suitable physical device for rendering to `surface`
    pub fn select_suitable_device(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(VulkanError::Api)?
        };

        for device in devices {
            if let Ok(info) = Self::evaluate_device(instance, device, surface, surface_loader) {
                log::info!("Selected GPU: {}", unsafe {
                    CStr::from_ptr(info.properties.device_name.as_ptr()).to_string_lossy()
                });
                return Ok(info);
            }
        }

        Err(VulkanError::InitializationFailed(
            "No suitable GPU found".to_string(),
        ))
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(device) };
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut graphics_family = None;
        let mut present_family = None;

        for (index, family) in queue_families.iter().enumerate() {
            let index = index as u32;

            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
                graphics_family = Some(index);
            }

            let present_support = unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, index, surface)
                    .map_err(VulkanError::Api)?
            };
            if present_support && present_family.is_none() {
                present_family = Some(index);
            }

            if graphics_family.is_some() && present_family.is_some() {
                break;
            }
        }

        let graphics_family = graphics_family.ok_or_else(|| {
            VulkanError::InitializationFailed("No graphics queue family found".to_string())
        })?;
        let present_family = present_family.ok_or_else(|| {
            VulkanError::InitializationFailed("No present queue family found".to_string())
        })?;

        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(VulkanError::Api)?
        };
        let swapchain_supported = extensions.iter().any(|available| {
            let name = unsafe { CStr::from_ptr(available.extension_name.as_ptr()) };
            name == SwapchainLoader::name()
        });
        if !swapchain_supported {
            return Err(VulkanError::InitializationFailed(
                "Required device extensions not supported".to_string(),
            ));
        }

        Ok(Self {
            device,
            properties,
            features,
            memory_properties,
            graphics_family,
            present_family,
        })
    }
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Graphics operations queue
    pub graphics_queue: vk::Queue,
    /// Surface presentation queue
    pub present_queue: vk::Queue,
    /// Swapchain extension loader
    pub swapchain_loader: SwapchainLoader,
}

impl LogicalDevice {
    /// Create a new logical device with graphics and present queues
    pub fn new(instance: &Instance, physical: &PhysicalDeviceInfo) -> VulkanResult<Self> {
        let unique_families: std::collections::HashSet<u32> =
            [physical.graphics_family, physical.present_family]
                .iter()
                .copied()
                .collect();

        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&[1.0])
                    .build()
            })
            .collect();

        let required_extensions = [SwapchainLoader::name().as_ptr()];

        let device_features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(physical.features.sampler_anisotropy != 0)
            .fill_mode_non_solid(physical.features.fill_mode_non_solid != 0)
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&required_extensions)
            .enabled_features(&device_features);

        let device = unsafe {
            instance
                .create_device(physical.device, &create_info, None)
                .map_err(VulkanError::Api)?
        };

        let graphics_queue = unsafe { device.get_device_queue(physical.graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(physical.present_family, 0) };
        let swapchain_loader = SwapchainLoader::new(instance, &device);

        Ok(Self {
            device,
            graphics_queue,
            present_queue,
            swapchain_loader,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            // All submitted work must retire before the device goes away
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

/// Main device context owning the core Vulkan objects and the chosen
/// format/sample-count configuration
///
/// One instance exists per backend; every other component borrows it.
pub struct DeviceContext {
    /// Vulkan surface being rendered to
    pub surface: vk::SurfaceKHR,
    /// Surface extension loader
    pub surface_loader: Surface,
    /// Selected physical device and capability snapshot
    pub physical_device: PhysicalDeviceInfo,
    /// Logical device and queues
    pub device: LogicalDevice,
    /// Vulkan instance and debug utilities
    pub instance: VulkanInstance,

    color_format: vk::Format,
    depth_format: vk::Format,
    sample_count: vk::SampleCountFlags,
    non_solid_fill: bool,
    device_idle: bool,
    command_buffer: vk::CommandBuffer,

    projection: Matrix4<f32>,
    view: Matrix4<f32>,
    view_projection: Matrix4<f32>,
}

impl DeviceContext {
    /// Create a device context for an externally owned window
    pub fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        app_name: &str,
        validation: bool,
        desired_sample_count: u32,
    ) -> VulkanResult<Self> {
        let instance = VulkanInstance::new(display_handle, app_name, validation)?;

        let surface_loader = Surface::new(&instance.entry, &instance.instance);
        let surface = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.instance,
                display_handle,
                window_handle,
                None,
            )
            .map_err(VulkanError::Api)?
        };

        let physical_device =
            PhysicalDeviceInfo::select_suitable_device(&instance.instance, surface, &surface_loader)?;
        let device = LogicalDevice::new(&instance.instance, &physical_device)?;

        let depth_format = Self::select_depth_format(&instance.instance, physical_device.device)?;
        let sample_count = Self::clamp_sample_count(&physical_device, desired_sample_count);
        let non_solid_fill = physical_device.features.fill_mode_non_solid != 0;

        log::debug!(
            "Device context ready: depth {:?}, {:?} samples, non_solid_fill {}",
            depth_format,
            sample_count,
            non_solid_fill
        );

        Ok(Self {
            surface,
            surface_loader,
            physical_device,
            device,
            instance,
            color_format: vk::Format::R8G8B8A8_UNORM,
            depth_format,
            sample_count,
            non_solid_fill,
            device_idle: false,
            command_buffer: vk::CommandBuffer::null(),
            projection: Matrix4::identity(),
            view: Matrix4::identity(),
            view_projection: Matrix4::identity(),
        })
    }

    fn select_depth_format(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
    ) -> VulkanResult<vk::Format> {
        let candidates = [
            vk::Format::D32_SFLOAT,
            vk::Format::D32_SFLOAT_S8_UINT,
            vk::Format::D24_UNORM_S8_UINT,
        ];
        for &format in &candidates {
            let props =
                unsafe { instance.get_physical_device_format_properties(physical_device, format) };
            if props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            {
                return Ok(format);
            }
        }
        Err(VulkanError::InitializationFailed(
            "No supported depth format".to_string(),
        ))
    }

    fn clamp_sample_count(physical: &PhysicalDeviceInfo, desired: u32) -> vk::SampleCountFlags {
        let supported = physical.properties.limits.framebuffer_color_sample_counts
            & physical.properties.limits.framebuffer_depth_sample_counts;
        let mut count = desired.max(1).next_power_of_two().min(64);
        while count > 1 {
            if supported.contains(vk::SampleCountFlags::from_raw(count)) {
                break;
            }
            count /= 2;
        }
        vk::SampleCountFlags::from_raw(count.max(1))
    }

    /// Get the raw logical device handle
    pub fn raw_device(&self) -> Device {
        self.device.device.clone()
    }

    /// Get a reference to the logical device
    pub fn ash_device(&self) -> &Device {
        &self.device.device
    }

    /// Get the graphics queue
    pub fn graphics_queue(&self) -> vk::Queue {
        self.device.graphics_queue
    }

    /// Offscreen scene color-target format
    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }

    /// Chosen depth attachment format
    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    /// Effective MSAA sample count for the main pass
    pub fn sample_count(&self) -> vk::SampleCountFlags {
        self.sample_count
    }

    /// Whether the device supports line polygon mode (wireframe debug
    /// pipelines)
    pub fn non_solid_fill(&self) -> bool {
        self.non_solid_fill
    }

    /// Select a memory type index against this device's snapshot
    pub fn memory_type_index(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
    ) -> VulkanResult<u32> {
        select_memory_type(
            &self.physical_device.memory_properties,
            type_bits,
            required,
            preferred,
        )
    }

    /// Whether a memory type is host-coherent (no explicit flushes
    /// needed for mapped writes)
    pub fn memory_type_is_coherent(&self, type_index: u32) -> bool {
        self.physical_device.memory_properties.memory_types[type_index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Minimum alignment for dynamic uniform buffer offsets
    pub fn uniform_offset_alignment(&self) -> u64 {
        self.physical_device
            .properties
            .limits
            .min_uniform_buffer_offset_alignment
            .max(1)
    }

    /// Block until all previously submitted GPU work completes.
    ///
    /// Used before destructive operations (pipeline rebuild, resize,
    /// shutdown). Sets the idle flag so other components can assert
    /// they are not racing a teardown.
    pub fn wait_for_device_idle(&mut self) -> VulkanResult<()> {
        unsafe {
            self.device
                .device
                .device_wait_idle()
                .map_err(VulkanError::Api)?;
        }
        self.device_idle = true;
        Ok(())
    }

    /// Whether the device is known idle (set by
    /// [`Self::wait_for_device_idle`], cleared on submission)
    pub fn is_device_idle(&self) -> bool {
        self.device_idle
    }

    /// Mark the device busy again; called on every queue submission
    pub fn mark_device_busy(&mut self) {
        self.device_idle = false;
    }

    /// The command buffer currently recording, or null outside a frame
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Install the active command buffer for this frame
    pub fn set_command_buffer(&mut self, command_buffer: vk::CommandBuffer) {
        self.command_buffer = command_buffer;
    }

    /// Update the per-frame view/projection snapshot
    pub fn set_view_matrices(&mut self, projection: Matrix4<f32>, view: Matrix4<f32>) {
        self.projection = projection;
        self.view = view;
        self.view_projection = projection * view;
    }

    /// Current projection matrix
    pub fn projection_matrix(&self) -> &Matrix4<f32> {
        &self.projection
    }

    /// Current view matrix
    pub fn view_matrix(&self) -> &Matrix4<f32> {
        &self.view
    }

    /// Current combined view-projection matrix
    pub fn view_projection_matrix(&self) -> &Matrix4<f32> {
        &self.view_projection
    }

    /// Attach a human-readable name to a GPU object for diagnostic
    /// tooling. No-op when validation is disabled.
    pub fn set_object_name(&self, object_handle: u64, object_type: vk::ObjectType, name: &str) {
        let Some(debug_utils) = self.instance.debug_utils() else {
            return;
        };
        let Ok(name_cstr) = CString::new(name) else {
            return;
        };
        let name_info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(object_type)
            .object_handle(object_handle)
            .object_name(&name_cstr);
        unsafe {
            let _ = debug_utils
                .set_debug_utils_object_name(self.device.device.handle(), &name_info);
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device.device_wait_idle();
            self.surface_loader.destroy_surface(self.surface, None);
        }
        // Remaining fields drop in declaration order: the logical
        // device before the instance that created it.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, &f) in flags.iter().enumerate() {
            props.memory_types[i].property_flags = f;
        }
        props
    }

    #[test]
    fn selector_prefers_required_plus_preferred() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        // Types 0 and 2 are compatible; only type 2 carries both flags
        let index = select_memory_type(
            &props,
            0b101,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();
        assert_eq!(index, 2);
    }

    #[test]
    fn selector_falls_back_to_required_only() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        // Nothing carries HOST_CACHED, so the preferred pass fails and
        // the lowest type with the required flag wins
        let index = select_memory_type(
            &props,
            0b11,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_CACHED,
        )
        .unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn selector_honors_type_bits() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        // Type 0 matches the flags but is masked out
        let index = select_memory_type(
            &props,
            0b10,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::empty(),
        )
        .unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn selector_fails_without_required_match() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let result = select_memory_type(
            &props,
            0b1,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::empty(),
        );
        assert!(matches!(result, Err(VulkanError::NoSuitableMemoryType)));
    }

    #[test]
    fn lowest_index_wins_within_a_pass() {
        let flags = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let props = memory_properties(&[flags, flags]);
        let index = select_memory_type(
            &props,
            0b11,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap();
        assert_eq!(index, 0);
    }
}
