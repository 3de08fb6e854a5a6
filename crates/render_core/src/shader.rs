//! SPIR-V shader module loading
//!
//! Shader binaries are external inputs compiled offline; this module
//! only wraps them into `vk::ShaderModule`s for the pipeline factory.

use crate::context::{VulkanError, VulkanResult};
use ash::{vk, Device};
use std::ffi::CStr;
use std::io::Cursor;
use std::path::Path;

/// Shader entry point shared by every pipeline in the catalog
pub const SHADER_ENTRY: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// Shader module wrapper with RAII cleanup
pub struct ShaderModule {
    device: Device,
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Create a shader module from SPIR-V bytecode
    pub fn from_bytes(device: Device, bytes: &[u8]) -> VulkanResult<Self> {
        let code = ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|e| {
            VulkanError::InitializationFailed(format!("Malformed SPIR-V: {e}"))
        })?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

        let module = unsafe {
            device
                .create_shader_module(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { device, module })
    }

    /// Load `<dir>/<stem>.spv`
    pub fn load(device: Device, dir: &Path, stem: &str) -> VulkanResult<Self> {
        let path = dir.join(format!("{stem}.spv"));
        let bytes = std::fs::read(&path).map_err(|e| {
            VulkanError::InitializationFailed(format!(
                "Failed to read shader {}: {e}",
                path.display()
            ))
        })?;
        Self::from_bytes(device, &bytes)
    }

    /// Get the shader module handle
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Build the pipeline stage info for this module
    pub fn stage_info(&self, stage: vk::ShaderStageFlags) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(stage)
            .module(self.module)
            .name(SHADER_ENTRY)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}
