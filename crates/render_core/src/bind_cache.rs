//! Pipeline bind cache
//!
//! Tracks the pipeline currently bound on the active command buffer
//! and elides redundant bind calls on the per-draw hot path. Single
//! render thread; no locking.

use crate::pipeline::Pipeline;
use ash::{vk, Device};

/// Redundant-bind elision for the active command buffer
#[derive(Debug, Default)]
pub struct PipelineBindCache {
    current: vk::Pipeline,
    binds_issued: u64,
    binds_elided: u64,
}

impl PipelineBindCache {
    /// Create an empty cache (nothing bound)
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an intent to bind `pipeline`; returns whether an actual
    /// bind call must be issued
    fn note_bind(&mut self, pipeline: vk::Pipeline) -> bool {
        if self.current == pipeline {
            self.binds_elided += 1;
            false
        } else {
            self.current = pipeline;
            self.binds_issued += 1;
            true
        }
    }

    /// Bind `pipeline` on `command_buffer` unless it is already the
    /// current one
    pub fn bind(&mut self, device: &Device, command_buffer: vk::CommandBuffer, pipeline: &Pipeline) {
        if self.note_bind(pipeline.handle) {
            unsafe {
                device.cmd_bind_pipeline(command_buffer, pipeline.bind_point, pipeline.handle);
            }
        }
    }

    /// Forget the current binding. Command-buffer reuse invalidates
    /// all bound state, so this runs at every frame start.
    pub fn reset(&mut self) {
        self.current = vk::Pipeline::null();
    }

    /// Number of bind calls actually issued
    pub fn binds_issued(&self) -> u64 {
        self.binds_issued
    }

    /// Number of bind calls elided as redundant
    pub fn binds_elided(&self) -> u64 {
        self.binds_elided
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn pipeline(raw: u64) -> vk::Pipeline {
        vk::Pipeline::from_raw(raw)
    }

    #[test]
    fn consecutive_duplicates_are_elided() {
        let mut cache = PipelineBindCache::new();
        let p1 = pipeline(1);
        let p2 = pipeline(2);

        // bind(p1), bind(p1), bind(p2), bind(p2), bind(p1): three
        // distinct transitions
        assert!(cache.note_bind(p1));
        assert!(!cache.note_bind(p1));
        assert!(cache.note_bind(p2));
        assert!(!cache.note_bind(p2));
        assert!(cache.note_bind(p1));

        assert_eq!(cache.binds_issued(), 3);
        assert_eq!(cache.binds_elided(), 2);
    }

    #[test]
    fn reset_forces_the_next_bind() {
        let mut cache = PipelineBindCache::new();
        let p1 = pipeline(1);

        assert!(cache.note_bind(p1));
        assert!(!cache.note_bind(p1));
        cache.reset();
        assert!(cache.note_bind(p1));
        assert_eq!(cache.binds_issued(), 2);
    }

    #[test]
    fn fresh_cache_always_binds() {
        let mut cache = PipelineBindCache::new();
        assert!(cache.note_bind(pipeline(7)));
    }
}
