//! Staging buffer allocator
//!
//! Linear (bump) allocator over a persistently mapped host-visible
//! buffer used to stage texture and geometry uploads before the
//! transfer into GPU-local memory. Callers record their copy commands
//! into the allocator's own transfer command buffer; `submit` flushes
//! and submits them once per frame. The buffer grows by doubling when
//! an allocation does not fit; growth is a logged slow path, never an
//! error.

use crate::buffer::Buffer;
use crate::commands::CommandPool;
use crate::context::{DeviceContext, VulkanError, VulkanResult};
use crate::sync::Fence;
use ash::{vk, Device};

/// Round `value` up to a power-of-two alignment
fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Bump-allocation cursor over a fixed capacity
///
/// Offsets handed out are monotonically non-decreasing, aligned, and
/// never overlap until the cursor is reset.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LinearCursor {
    offset: u64,
    capacity: u64,
}

impl LinearCursor {
    pub(crate) fn new(capacity: u64) -> Self {
        Self {
            offset: 0,
            capacity,
        }
    }

    /// Reserve `size` bytes at the next offset aligned to `alignment`,
    /// or `None` if the region would exceed capacity
    pub(crate) fn allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let aligned = align_up(self.offset, alignment);
        if aligned.checked_add(size)? > self.capacity {
            return None;
        }
        self.offset = aligned + size;
        Some(aligned)
    }

    /// Capacity after growing to fit an allocation of `size` bytes at
    /// `alignment`: at least double, and at least large enough
    pub(crate) fn grown_capacity(&self, size: u64, alignment: u64) -> u64 {
        let needed = align_up(self.offset, alignment) + size;
        needed.max(self.capacity * 2)
    }

    /// Bytes consumed so far
    pub(crate) fn used(&self) -> u64 {
        self.offset
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.capacity
    }

    pub(crate) fn reset(&mut self) {
        self.offset = 0;
    }
}

/// One staging sub-allocation
///
/// `data` is live CPU-writable memory; `buffer` + `offset` address the
/// same region for GPU copy commands, which the caller records into
/// `command_buffer`. Valid until the next frame's first allocation
/// reuses the staging region.
pub struct StagingAllocation<'a> {
    /// Writable staging memory for this allocation
    pub data: &'a mut [u8],
    /// Buffer to use as the copy source
    pub buffer: vk::Buffer,
    /// Byte offset of `data` within `buffer`
    pub offset: vk::DeviceSize,
    /// Transfer command buffer to record the copy into
    pub command_buffer: vk::CommandBuffer,
}

/// Linear staging allocator with demand growth
pub struct StagingAllocator {
    device: Device,
    queue: vk::Queue,
    buffer: Buffer,
    cursor: LinearCursor,
    command_pool: CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: Fence,
    recording: bool,
    submitted: bool,
    // Outgrown buffers referenced by commands already recorded this
    // frame; destroyed once the next submit's fence clears
    retired: Vec<Buffer>,
}

impl StagingAllocator {
    /// Create the allocator with an initial capacity in bytes
    pub fn new(ctx: &DeviceContext, initial_size: u64) -> VulkanResult<Self> {
        let buffer = Self::create_staging_buffer(ctx, initial_size)?;
        ctx.set_object_name(
            vk::Handle::as_raw(buffer.handle()),
            vk::ObjectType::BUFFER,
            "staging buffer",
        );

        let command_pool = CommandPool::new(ctx.raw_device(), ctx.physical_device.graphics_family)?;
        let command_buffer = command_pool.allocate_command_buffers(1)?[0];
        let fence = Fence::new(ctx.raw_device(), false)?;

        log::debug!("Staging allocator ready: {} KiB", initial_size / 1024);

        Ok(Self {
            device: ctx.raw_device(),
            queue: ctx.graphics_queue(),
            buffer,
            cursor: LinearCursor::new(initial_size),
            command_pool,
            command_buffer,
            fence,
            recording: false,
            submitted: false,
            retired: Vec::new(),
        })
    }

    fn create_staging_buffer(ctx: &DeviceContext, size: u64) -> VulkanResult<Buffer> {
        Buffer::new_mapped(
            ctx,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    /// Reserve `size` staged bytes at `alignment`.
    ///
    /// The first allocation after a submit waits for the previous
    /// transfer to retire, then reuses the buffer from the start.
    pub fn allocate(
        &mut self,
        ctx: &DeviceContext,
        size: u64,
        alignment: u64,
    ) -> VulkanResult<StagingAllocation<'_>> {
        if self.submitted {
            // Previous frame's copies must be consumed before their
            // source memory is recycled
            self.fence.wait(u64::MAX)?;
            self.fence.reset()?;
            self.retired.clear();
            self.cursor.reset();
            self.submitted = false;
        }

        if !self.recording {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe {
                self.device
                    .begin_command_buffer(self.command_buffer, &begin_info)
                    .map_err(VulkanError::Api)?;
            }
            self.recording = true;
        }

        let offset = match self.cursor.allocate(size, alignment) {
            Some(offset) => offset,
            None => {
                self.grow(ctx, size, alignment)?;
                self.cursor
                    .allocate(size, alignment)
                    .ok_or(VulkanError::OutOfMemory { requested: size })?
            }
        };

        let buffer = self.buffer.handle();
        let command_buffer = self.command_buffer;
        let data = self.buffer.mapped_slice_mut(offset, size)?;
        Ok(StagingAllocation {
            data,
            buffer,
            offset,
            command_buffer,
        })
    }

    /// Replace the staging buffer with one at least twice as large,
    /// preserving already-staged content. The old buffer stays alive
    /// until the pending copy commands retire.
    fn grow(&mut self, ctx: &DeviceContext, size: u64, alignment: u64) -> VulkanResult<()> {
        let new_capacity = self.cursor.grown_capacity(size, alignment);
        log::warn!(
            "Staging buffer exhausted ({} of {} bytes); growing to {}",
            self.cursor.used(),
            self.cursor.capacity(),
            new_capacity
        );

        let mut new_buffer = Self::create_staging_buffer(ctx, new_capacity)?;
        let used = self.cursor.used();
        if used > 0 {
            let staged = self.buffer.mapped_slice_mut(0, used)?.to_vec();
            new_buffer.write_bytes(0, &staged)?;
        }

        let old = std::mem::replace(&mut self.buffer, new_buffer);
        self.retired.push(old);
        self.cursor = LinearCursor {
            offset: used,
            capacity: new_capacity,
        };
        Ok(())
    }

    /// Flush staged memory and submit the recorded copy commands.
    ///
    /// The cursor is not rewound here: the staging region is retired
    /// for reuse by the first allocation of the next frame, after the
    /// submission fence clears.
    pub fn submit(&mut self, ctx: &mut DeviceContext) -> VulkanResult<()> {
        if !self.recording {
            return Ok(());
        }

        self.buffer.flush()?;

        unsafe {
            self.device
                .end_command_buffer(self.command_buffer)
                .map_err(VulkanError::Api)?;

            let command_buffers = [self.command_buffer];
            let submit_info = vk::SubmitInfo::builder()
                .command_buffers(&command_buffers)
                .build();
            self.device
                .queue_submit(self.queue, &[submit_info], self.fence.handle())
                .map_err(VulkanError::Api)?;
        }
        ctx.mark_device_busy();

        self.recording = false;
        self.submitted = true;
        Ok(())
    }

    /// Bytes staged since the last cursor reset
    pub fn bytes_used(&self) -> u64 {
        self.cursor.used()
    }

    /// Current staging capacity
    pub fn capacity(&self) -> u64 {
        self.cursor.capacity()
    }

    /// Whether copy commands are recorded but not yet submitted
    pub fn has_pending_uploads(&self) -> bool {
        self.recording
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_monotonic_aligned_and_disjoint() {
        let mut cursor = LinearCursor::new(1024);
        let sizes = [(13u64, 4u64), (1, 1), (64, 16), (7, 8), (100, 64)];
        let mut regions: Vec<(u64, u64)> = Vec::new();
        let mut last_offset = 0;

        for &(size, align) in &sizes {
            let offset = cursor.allocate(size, align).unwrap();
            assert!(offset >= last_offset);
            assert_eq!(offset % align, 0);
            for &(o, s) in &regions {
                assert!(offset >= o + s || offset + size <= o);
            }
            regions.push((offset, size));
            last_offset = offset;
        }
    }

    #[test]
    fn allocation_fails_past_capacity() {
        let mut cursor = LinearCursor::new(64);
        assert!(cursor.allocate(48, 1).is_some());
        assert!(cursor.allocate(32, 1).is_none());
        // The failed attempt must not advance the cursor
        assert_eq!(cursor.used(), 48);
        assert!(cursor.allocate(16, 1).is_some());
    }

    #[test]
    fn growth_at_least_doubles_and_fits_request() {
        let mut cursor = LinearCursor::new(64);
        cursor.allocate(60, 4).unwrap();

        // Small overflow: doubling dominates
        assert_eq!(cursor.grown_capacity(16, 4), 128);

        // Huge request: the fit requirement dominates
        let grown = cursor.grown_capacity(1000, 4);
        assert!(grown >= 1060);
        assert!(grown >= 128);
    }

    #[test]
    fn reset_recycles_the_whole_region() {
        let mut cursor = LinearCursor::new(128);
        cursor.allocate(100, 4).unwrap();
        cursor.reset();
        assert_eq!(cursor.used(), 0);
        assert_eq!(cursor.allocate(100, 4), Some(0));
    }

    #[test]
    fn alignment_padding_is_not_leaked_between_allocations() {
        let mut cursor = LinearCursor::new(256);
        let a = cursor.allocate(1, 1).unwrap();
        let b = cursor.allocate(16, 64).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 64);
        assert_eq!(cursor.used(), 80);
    }
}
