//! GPU buffer creation and memory binding
//!
//! Raw buffer wrapper used by the staging and dynamic allocators.
//! Memory is picked through the required/preferred selector so callers
//! can express "host-visible, ideally device-local" placement.

use crate::context::{DeviceContext, VulkanError, VulkanResult};
use ash::{vk, Device};

/// Buffer plus its dedicated memory allocation
///
/// Optionally persistently mapped for CPU-written buffers; the mapping
/// lives until drop. Not `Send`: buffers are owned by the single render
/// thread.
pub struct Buffer {
    device: Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    mapped: *mut u8,
    coherent: bool,
}

impl Buffer {
    /// Create an unmapped buffer with its own memory allocation
    pub fn new(
        ctx: &DeviceContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        required: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        Self::create(ctx, size, usage, required, preferred, false)
    }

    /// Create a buffer and persistently map its memory
    ///
    /// Requires `HOST_VISIBLE` in the required flags.
    pub fn new_mapped(
        ctx: &DeviceContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        required: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        if !required.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(VulkanError::InvalidOperation {
                reason: "mapped buffer requires HOST_VISIBLE memory".to_string(),
            });
        }
        Self::create(ctx, size, usage, required, preferred, true)
    }

    fn create(
        ctx: &DeviceContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        required: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
        map: bool,
    ) -> VulkanResult<Self> {
        let device = ctx.raw_device();

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .create_buffer(&buffer_info, None)
                .map_err(VulkanError::Api)?
        };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let type_index = match ctx.memory_type_index(requirements.memory_type_bits, required, preferred)
        {
            Ok(index) => index,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        let coherent = ctx.memory_type_is_coherent(type_index);

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);

        let memory = unsafe {
            match device.allocate_memory(&alloc_info, None) {
                Ok(memory) => memory,
                Err(e) => {
                    device.destroy_buffer(buffer, None);
                    return Err(VulkanError::Api(e));
                }
            }
        };

        let bind_result = unsafe { device.bind_buffer_memory(buffer, memory, 0) };
        if let Err(e) = bind_result {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(VulkanError::Api(e));
        }

        let mapped = if map {
            let ptr = unsafe {
                match device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) {
                    Ok(ptr) => ptr,
                    Err(e) => {
                        device.destroy_buffer(buffer, None);
                        device.free_memory(memory, None);
                        return Err(VulkanError::Api(e));
                    }
                }
            };
            ptr.cast::<u8>()
        } else {
            std::ptr::null_mut()
        };

        Ok(Self {
            device,
            buffer,
            memory,
            size,
            mapped,
            coherent,
        })
    }

    /// Get the buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get the buffer size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Whether the backing memory is host-coherent
    pub fn is_coherent(&self) -> bool {
        self.coherent
    }

    /// Mutable view of a persistently mapped sub-range.
    ///
    /// The range must lie within the buffer and the buffer must have
    /// been created with [`Buffer::new_mapped`].
    pub fn mapped_slice_mut(&mut self, offset: u64, len: u64) -> VulkanResult<&mut [u8]> {
        if self.mapped.is_null() {
            return Err(VulkanError::InvalidOperation {
                reason: "buffer is not mapped".to_string(),
            });
        }
        if offset + len > self.size {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "mapped range {}..{} exceeds buffer size {}",
                    offset,
                    offset + len,
                    self.size
                ),
            });
        }
        unsafe {
            Ok(std::slice::from_raw_parts_mut(
                self.mapped.add(offset as usize),
                len as usize,
            ))
        }
    }

    /// Copy bytes into the mapped buffer at an offset
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> VulkanResult<()> {
        let slice = self.mapped_slice_mut(offset, data.len() as u64)?;
        slice.copy_from_slice(data);
        Ok(())
    }

    /// Flush the whole mapped range to make writes visible to the GPU.
    /// No-op on host-coherent memory.
    pub fn flush(&self) -> VulkanResult<()> {
        if self.coherent || self.mapped.is_null() {
            return Ok(());
        }
        let range = vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe {
            self.device
                .flush_mapped_memory_ranges(&[range])
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            if !self.mapped.is_null() {
                self.device.unmap_memory(self.memory);
            }
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}
