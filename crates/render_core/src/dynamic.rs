//! Dynamic per-frame buffer allocators
//!
//! Three independent ring allocators (vertex, index, uniform), each
//! double-buffered across frames: the CPU writes frame N+1's data into
//! the current slot while the GPU still reads frame N's data from the
//! other slot. Slots flip exactly once per frame after submission;
//! correctness is bounded by the frame controller's per-slot fence, so
//! a slot is never rewritten before its previous frame retired.
//!
//! Uniform allocations also hand back the current slot's dynamic-UBO
//! descriptor set: binding per-draw uniform data is a dynamic offset,
//! not a descriptor rebuild.

use crate::buffer::Buffer;
use crate::context::{DeviceContext, VulkanError, VulkanResult};
use crate::descriptor::{DescriptorLayouts, DescriptorPool};
use crate::staging::StagingAllocator;
use crate::NUM_COLOR_BUFFERS;
use ash::{vk, Device};

/// Largest single uniform allocation; also the bound range of the
/// dynamic-UBO descriptor sets
pub const MAX_UNIFORM_ALLOC: u64 = 2048;

/// Entries in the shared triangle-fan index pattern (42 fans' worth of
/// triangles as a reusable index list)
pub const FAN_INDEX_BUFFER_SIZE: usize = 126;

fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Double-buffered cursor state for one ring allocator
#[derive(Debug, Clone, Copy)]
pub(crate) struct RingSlots {
    current: usize,
    cursors: [u64; NUM_COLOR_BUFFERS],
    capacity: u64,
}

impl RingSlots {
    pub(crate) fn new(capacity: u64) -> Self {
        Self {
            current: 0,
            cursors: [0; NUM_COLOR_BUFFERS],
            capacity,
        }
    }

    /// Bump-allocate from the current slot; `None` when the slot's
    /// fixed capacity would be exceeded
    pub(crate) fn allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let aligned = align_up(self.cursors[self.current], alignment);
        if aligned.checked_add(size)? > self.capacity {
            return None;
        }
        self.cursors[self.current] = aligned + size;
        Some(aligned)
    }

    /// Flip to the other slot and reset its cursor. The previous
    /// slot's contents stay untouched until the next flip brings the
    /// cursor back to it.
    pub(crate) fn swap(&mut self) {
        self.current = (self.current + 1) % NUM_COLOR_BUFFERS;
        self.cursors[self.current] = 0;
    }

    pub(crate) fn current(&self) -> usize {
        self.current
    }

    pub(crate) fn used(&self) -> u64 {
        self.cursors[self.current]
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// A sub-allocation from a dynamic ring
pub struct DynamicAllocation<'a> {
    /// Writable mapped memory for this frame's data
    pub data: &'a mut [u8],
    /// GPU buffer backing the current slot
    pub buffer: vk::Buffer,
    /// Byte offset of `data` within `buffer`
    pub offset: vk::DeviceSize,
}

/// A uniform sub-allocation with its binding descriptor set
pub struct UniformAllocation<'a> {
    /// Writable mapped memory for this draw's uniforms
    pub data: &'a mut [u8],
    /// GPU buffer backing the current slot
    pub buffer: vk::Buffer,
    /// Dynamic offset to pass when binding `descriptor_set`
    pub offset: u32,
    /// Current slot's dynamic-UBO descriptor set
    pub descriptor_set: vk::DescriptorSet,
}

/// One double-buffered GPU ring
struct DynamicRing {
    buffers: Vec<Buffer>,
    slots: RingSlots,
    alignment: u64,
}

impl DynamicRing {
    fn new(
        ctx: &DeviceContext,
        capacity: u64,
        usage: vk::BufferUsageFlags,
        alignment: u64,
        name: &str,
    ) -> VulkanResult<Self> {
        let mut buffers = Vec::with_capacity(NUM_COLOR_BUFFERS);
        for slot in 0..NUM_COLOR_BUFFERS {
            let buffer = Buffer::new_mapped(
                ctx,
                capacity,
                usage,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
                // Resizable-BAR style placement when the device offers it
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?;
            ctx.set_object_name(
                vk::Handle::as_raw(buffer.handle()),
                vk::ObjectType::BUFFER,
                &format!("{name} ring {slot}"),
            );
            buffers.push(buffer);
        }
        Ok(Self {
            buffers,
            slots: RingSlots::new(capacity),
            alignment,
        })
    }

    fn allocate(&mut self, size: u64) -> VulkanResult<(u64, &mut Buffer)> {
        let offset = self
            .slots
            .allocate(size, self.alignment)
            .ok_or(VulkanError::OutOfMemory { requested: size })?;
        let slot = self.slots.current();
        Ok((offset, &mut self.buffers[slot]))
    }

    fn flush_current(&self) -> VulkanResult<()> {
        self.buffers[self.slots.current()].flush()
    }
}

/// The vertex/index/uniform dynamic buffer allocators plus the shared
/// immutable triangle-fan index buffer
pub struct DynamicBuffers {
    vertex: DynamicRing,
    index: DynamicRing,
    uniform: DynamicRing,
    uniform_sets: Vec<vk::DescriptorSet>,
    descriptor_pool: DescriptorPool,
    fan_index_buffer: Buffer,
}

impl DynamicBuffers {
    /// Create the rings, write the per-slot dynamic-UBO descriptor
    /// sets, and upload the fan index pattern through the staging
    /// allocator.
    ///
    /// The uniform sets live in a pool owned here, not in the pipeline
    /// catalog's pool: the catalog is rebuilt on resize, the dynamic
    /// buffers are not.
    pub fn new(
        ctx: &DeviceContext,
        layouts: &DescriptorLayouts,
        staging: &mut StagingAllocator,
        vertex_capacity: u64,
        index_capacity: u64,
        uniform_capacity: u64,
    ) -> VulkanResult<Self> {
        let vertex = DynamicRing::new(
            ctx,
            vertex_capacity,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            4,
            "dynamic vertex",
        )?;
        let index = DynamicRing::new(
            ctx,
            index_capacity,
            vk::BufferUsageFlags::INDEX_BUFFER,
            4,
            "dynamic index",
        )?;
        let uniform = DynamicRing::new(
            ctx,
            uniform_capacity,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            ctx.uniform_offset_alignment(),
            "dynamic uniform",
        )?;

        let descriptor_pool = DescriptorPool::new(ctx.raw_device(), NUM_COLOR_BUFFERS as u32)?;
        let set_layouts = vec![layouts.dynamic_ubo.handle(); NUM_COLOR_BUFFERS];
        let uniform_sets = descriptor_pool.allocate(&set_layouts)?;
        Self::write_uniform_sets(ctx.ash_device(), &uniform_sets, &uniform.buffers);

        let fan_index_buffer = Self::create_fan_index_buffer(ctx, staging)?;

        log::debug!(
            "Dynamic buffers ready: vertex {} KiB, index {} KiB, uniform {} KiB per slot",
            vertex_capacity / 1024,
            index_capacity / 1024,
            uniform_capacity / 1024
        );

        Ok(Self {
            vertex,
            index,
            uniform,
            uniform_sets,
            descriptor_pool,
            fan_index_buffer,
        })
    }

    fn write_uniform_sets(device: &Device, sets: &[vk::DescriptorSet], buffers: &[Buffer]) {
        for (set, buffer) in sets.iter().zip(buffers) {
            let buffer_info = vk::DescriptorBufferInfo::builder()
                .buffer(buffer.handle())
                .offset(0)
                .range(MAX_UNIFORM_ALLOC)
                .build();
            let write = vk::WriteDescriptorSet::builder()
                .dst_set(*set)
                .dst_binding(0)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .buffer_info(std::slice::from_ref(&buffer_info))
                .build();
            unsafe {
                device.update_descriptor_sets(&[write], &[]);
            }
        }
    }

    /// Upload the shared triangle-fan index pattern: indices
    /// `0, i+1, i+2` for every fan triangle, reused by every fan-shaped
    /// polygon draw
    fn create_fan_index_buffer(
        ctx: &DeviceContext,
        staging: &mut StagingAllocator,
    ) -> VulkanResult<Buffer> {
        let mut indices = [0u16; FAN_INDEX_BUFFER_SIZE];
        for triangle in 0..FAN_INDEX_BUFFER_SIZE / 3 {
            indices[triangle * 3] = 0;
            indices[triangle * 3 + 1] = (triangle + 1) as u16;
            indices[triangle * 3 + 2] = (triangle + 2) as u16;
        }
        let bytes: &[u8] = bytemuck::cast_slice(&indices);

        let buffer = Buffer::new(
            ctx,
            bytes.len() as u64,
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::empty(),
        )?;
        ctx.set_object_name(
            vk::Handle::as_raw(buffer.handle()),
            vk::ObjectType::BUFFER,
            "fan index buffer",
        );

        let staged = staging.allocate(ctx, bytes.len() as u64, 4)?;
        staged.data.copy_from_slice(bytes);
        let region = vk::BufferCopy {
            src_offset: staged.offset,
            dst_offset: 0,
            size: bytes.len() as u64,
        };
        unsafe {
            ctx.ash_device().cmd_copy_buffer(
                staged.command_buffer,
                staged.buffer,
                buffer.handle(),
                &[region],
            );
        }

        Ok(buffer)
    }

    /// Allocate vertex data for this frame
    pub fn vertex_allocate(&mut self, size: u64) -> VulkanResult<DynamicAllocation<'_>> {
        let (offset, buffer) = self.vertex.allocate(size)?;
        let handle = buffer.handle();
        Ok(DynamicAllocation {
            data: buffer.mapped_slice_mut(offset, size)?,
            buffer: handle,
            offset,
        })
    }

    /// Allocate index data for this frame
    pub fn index_allocate(&mut self, size: u64) -> VulkanResult<DynamicAllocation<'_>> {
        let (offset, buffer) = self.index.allocate(size)?;
        let handle = buffer.handle();
        Ok(DynamicAllocation {
            data: buffer.mapped_slice_mut(offset, size)?,
            buffer: handle,
            offset,
        })
    }

    /// Allocate per-draw uniform data for this frame.
    ///
    /// The returned descriptor set is bound with `offset` as its
    /// dynamic offset; no descriptor writes happen per draw.
    pub fn uniform_allocate(&mut self, size: u64) -> VulkanResult<UniformAllocation<'_>> {
        if size > MAX_UNIFORM_ALLOC {
            return Err(VulkanError::InvalidOperation {
                reason: format!("uniform allocation of {size} bytes exceeds {MAX_UNIFORM_ALLOC}"),
            });
        }
        let descriptor_set = self.uniform_sets[self.uniform.slots.current()];
        let (offset, buffer) = self.uniform.allocate(size)?;
        let handle = buffer.handle();
        Ok(UniformAllocation {
            data: buffer.mapped_slice_mut(offset, size)?,
            buffer: handle,
            offset: offset as u32,
            descriptor_set,
        })
    }

    /// Flip all three rings to their other slot. Called exactly once
    /// per frame, after the frame's commands are submitted.
    pub fn swap(&mut self) {
        self.vertex.slots.swap();
        self.index.slots.swap();
        self.uniform.slots.swap();
    }

    /// Force mapped writes visible to the GPU on non-coherent memory
    pub fn flush(&self) -> VulkanResult<()> {
        self.vertex.flush_current()?;
        self.index.flush_current()?;
        self.uniform.flush_current()
    }

    /// The shared triangle-fan index buffer handle
    pub fn fan_index_buffer(&self) -> vk::Buffer {
        self.fan_index_buffer.handle()
    }

    /// Bytes used in the current slots (vertex, index, uniform);
    /// useful for worst-case sizing diagnostics
    pub fn current_usage(&self) -> (u64, u64, u64) {
        (
            self.vertex.slots.used(),
            self.index.slots.used(),
            self.uniform.slots.used(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_resets_only_the_new_slot() {
        let mut slots = RingSlots::new(1024);
        slots.allocate(100, 4).unwrap();
        assert_eq!(slots.current(), 0);
        assert_eq!(slots.used(), 100);

        slots.swap();
        assert_eq!(slots.current(), 1);
        assert_eq!(slots.used(), 0);

        slots.allocate(50, 4).unwrap();
        slots.swap();
        // Back on slot 0: the cursor resets now, not before
        assert_eq!(slots.current(), 0);
        assert_eq!(slots.used(), 0);
    }

    #[test]
    fn previous_slot_region_survives_one_flip() {
        let mut slots = RingSlots::new(1024);
        let first = slots.allocate(256, 16).unwrap();
        assert_eq!(first, 0);

        slots.swap();
        // Writes land in the other slot; slot 0's cursor is untouched
        let second = slots.allocate(256, 16).unwrap();
        assert_eq!(second, 0);
        assert_eq!(slots.cursors[0], 256);

        slots.swap();
        // Only after the second flip may slot 0 be reused from zero
        assert_eq!(slots.allocate(8, 8), Some(0));
    }

    #[test]
    fn slot_overflow_is_an_error_not_a_wrap() {
        let mut slots = RingSlots::new(128);
        assert!(slots.allocate(96, 4).is_some());
        assert!(slots.allocate(64, 4).is_none());
        // Capacity is per slot; the other slot is unaffected
        slots.swap();
        assert!(slots.allocate(96, 4).is_some());
    }

    #[test]
    fn uniform_style_alignment_is_respected() {
        let mut slots = RingSlots::new(4096);
        slots.allocate(10, 256).unwrap();
        let offset = slots.allocate(10, 256).unwrap();
        assert_eq!(offset, 256);
    }

    #[test]
    fn fan_index_pattern_walks_the_fan() {
        let mut indices = [0u16; FAN_INDEX_BUFFER_SIZE];
        for triangle in 0..FAN_INDEX_BUFFER_SIZE / 3 {
            indices[triangle * 3] = 0;
            indices[triangle * 3 + 1] = (triangle + 1) as u16;
            indices[triangle * 3 + 2] = (triangle + 2) as u16;
        }
        assert_eq!(&indices[0..6], &[0, 1, 2, 0, 2, 3]);
        assert_eq!(indices[FAN_INDEX_BUFFER_SIZE - 1], 43);
    }
}
