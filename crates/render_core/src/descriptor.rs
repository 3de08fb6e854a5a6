//! Descriptor set layouts, pool and allocation
//!
//! Long-lived binding-slot schemas consumed by the pipeline layouts,
//! plus the pool every descriptor set in the backend comes from.

use crate::context::{VulkanError, VulkanResult};
use ash::{vk, Device};

/// Descriptor set layout builder
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    fn add(mut self, binding: u32, ty: vk::DescriptorType, stages: vk::ShaderStageFlags) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(1)
                .stage_flags(stages)
                .build(),
        );
        self
    }

    /// Add a dynamic uniform buffer binding
    pub fn add_dynamic_uniform_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.add(binding, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, stages)
    }

    /// Add a combined image sampler binding
    pub fn add_combined_image_sampler(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.add(binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stages)
    }

    /// Add an input attachment binding
    pub fn add_input_attachment(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.add(binding, vk::DescriptorType::INPUT_ATTACHMENT, stages)
    }

    /// Add a storage image binding
    pub fn add_storage_image(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.add(binding, vk::DescriptorType::STORAGE_IMAGE, stages)
    }

    /// Build the descriptor set layout
    pub fn build(self, device: &Device) -> VulkanResult<DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&self.bindings);

        let layout = unsafe {
            device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(DescriptorSetLayout {
            device: device.clone(),
            layout,
        })
    }
}

impl Default for DescriptorSetLayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor set layout wrapper with automatic cleanup
pub struct DescriptorSetLayout {
    device: Device,
    layout: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    /// Get the layout handle
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// The backend's long-lived descriptor-set layouts
///
/// Built once before the pipeline layouts; rebuilt only together with
/// the whole pipeline catalog.
pub struct DescriptorLayouts {
    /// Per-draw dynamic uniform data (dynamic offset into the uniform ring)
    pub dynamic_ubo: DescriptorSetLayout,
    /// Single sampled texture for fragment shading
    pub single_texture: DescriptorSetLayout,
    /// Render-target read within a pass (warp chain)
    pub input_attachment: DescriptorSetLayout,
    /// Compute-written storage image (texture warp)
    pub storage_image: DescriptorSetLayout,
}

impl DescriptorLayouts {
    /// Build all layouts
    pub fn new(device: &Device) -> VulkanResult<Self> {
        let dynamic_ubo = DescriptorSetLayoutBuilder::new()
            .add_dynamic_uniform_buffer(0, vk::ShaderStageFlags::ALL_GRAPHICS)
            .build(device)?;
        let single_texture = DescriptorSetLayoutBuilder::new()
            .add_combined_image_sampler(0, vk::ShaderStageFlags::FRAGMENT)
            .build(device)?;
        let input_attachment = DescriptorSetLayoutBuilder::new()
            .add_input_attachment(0, vk::ShaderStageFlags::FRAGMENT)
            .build(device)?;
        let storage_image = DescriptorSetLayoutBuilder::new()
            .add_storage_image(0, vk::ShaderStageFlags::COMPUTE)
            .add_combined_image_sampler(1, vk::ShaderStageFlags::COMPUTE)
            .build(device)?;

        Ok(Self {
            dynamic_ubo,
            single_texture,
            input_attachment,
            storage_image,
        })
    }
}

/// Descriptor pool for allocating every set the backend uses
pub struct DescriptorPool {
    device: Device,
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// Create the pool sized for the backend's fixed set population
    pub fn new(device: Device, max_sets: u32) -> VulkanResult<Self> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: max_sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: max_sets * 2,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::INPUT_ATTACHMENT,
                descriptor_count: max_sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: max_sets,
            },
        ];

        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);

        let pool = unsafe {
            device
                .create_descriptor_pool(&pool_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { device, pool })
    }

    /// Allocate one descriptor set per layout handle given
    pub fn allocate(
        &self,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VulkanResult<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        unsafe {
            self.device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(VulkanError::Api)
        }
    }

    /// Get the pool handle
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            // Frees all sets allocated from the pool
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}
