//! Deferred destruction of backend objects.
//!
//! Objects the GPU may still reference are retired at a fence value and only
//! destroyed once the queue fence has reached it. The fence used for newly
//! retired objects is the one of the frame slot currently recording.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

use crate::{
    backend::Backend,
    resource::{CommandListId, CpuDescriptor, HeapId, PipelineId, ResourceId},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Retired {
    Resource(ResourceId),
    View(CpuDescriptor),
    DescriptorHeap(HeapId),
    Pipeline(PipelineId),
    CommandList(CommandListId),
}

impl Retired {
    fn destroy<B: Backend + ?Sized>(self, backend: &B) {
        match self {
            Self::Resource(id) => backend.destroy_resource(id),
            Self::View(descriptor) => backend.destroy_view(descriptor),
            Self::DescriptorHeap(id) => backend.destroy_descriptor_heap(id),
            Self::Pipeline(id) => backend.destroy_pipeline(id),
            Self::CommandList(id) => backend.destroy_command_list(id),
        }
    }
}

#[derive(Debug, Default)]
pub struct DeletionQueue {
    pending: Mutex<VecDeque<(u64, Retired)>>,
    cleanup_fence: AtomicU64,
}

impl DeletionQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cleanup_fence(&self) -> u64 {
        self.cleanup_fence.load(Ordering::Acquire)
    }

    pub fn set_cleanup_fence(&self, value: u64) {
        self.cleanup_fence.store(value, Ordering::Release);
    }

    /// Schedules `object` for destruction once the current cleanup fence is
    /// reached.
    pub fn retire(&self, object: Retired) {
        self.retire_at(self.cleanup_fence(), object);
    }

    pub fn retire_at(&self, fence_value: u64, object: Retired) {
        log::trace!("retiring {object:?} at fence {fence_value}");
        self.pending.lock().push_back((fence_value, object));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroys every object whose fence value is at or below `completed`.
    /// Returns the number of objects destroyed.
    pub fn collect<B: Backend + ?Sized>(&self, completed: u64, backend: &B) -> usize {
        let ready: Vec<Retired> = {
            let mut pending = self.pending.lock();
            let mut ready = Vec::new();
            pending.retain(|(fence_value, object)| {
                if *fence_value <= completed {
                    ready.push(*object);
                    false
                } else {
                    true
                }
            });
            ready
        };

        for object in &ready {
            object.destroy(backend);
        }

        ready.len()
    }

    /// Destroys everything regardless of fence. Only valid once the GPU is
    /// idle.
    pub fn destroy_all<B: Backend + ?Sized>(&self, backend: &B) {
        self.collect(u64::MAX, backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{Destroyed, RecordingBackend};

    #[test]
    fn destroys_only_reached_fences() {
        let backend = RecordingBackend::new();
        let queue = DeletionQueue::new();

        queue.set_cleanup_fence(3);
        queue.retire(Retired::Resource(ResourceId(1)));
        queue.retire_at(5, Retired::Pipeline(PipelineId(2)));

        assert_eq!(queue.collect(2, &backend), 0);
        assert_eq!(queue.collect(3, &backend), 1);
        assert!(backend.is_destroyed(Destroyed::Resource(ResourceId(1))));
        assert!(!backend.is_destroyed(Destroyed::Pipeline(PipelineId(2))));

        queue.destroy_all(&backend);
        assert!(backend.is_destroyed(Destroyed::Pipeline(PipelineId(2))));
        assert!(queue.is_empty());
    }
}
