//! Command list recycling across frames in flight.
//!
//! A context records into a single command list. Each frame slot owns the
//! command allocator backing that list while the slot is active, plus the
//! scratch memory and descriptor heaps the frame's commands point into.
//! Slots cycle round robin; a slot is only reused once the queue fence has
//! passed the value signaled when it was submitted.

use crate::{
    backend::{Backend, Command},
    deletion::Retired,
    device::Device,
    memory::{DescriptorAllocation, ScratchAllocation, ScratchBuffer, ScratchDescriptorHeap},
    resource::{AllocatorId, CommandListId, HeapId},
    types::DescriptorHeapKind,
    Error,
};

struct FrameSlot {
    allocator: AllocatorId,
    scratch: ScratchBuffer,
    view_heap: ScratchDescriptorHeap,
    sampler_heap: ScratchDescriptorHeap,
    /// The value signaled when this slot's commands were last submitted.
    fence_value: u64,
    /// Submitted and not yet known to be complete.
    pending: bool,
}

impl FrameSlot {
    fn new<B: Backend>(device: &Device<B>) -> Result<Self, Error> {
        let backend = device.backend();
        let config = device.config();

        Ok(Self {
            allocator: backend.create_command_allocator()?,
            scratch: ScratchBuffer::new(
                backend,
                config.scratch_buffer_size,
                config.max_scratch_buffer_size,
            )?,
            view_heap: ScratchDescriptorHeap::new(
                backend,
                DescriptorHeapKind::View,
                config.scratch_view_descriptors,
                config.max_scratch_view_descriptors,
            )?,
            sampler_heap: ScratchDescriptorHeap::new(
                backend,
                DescriptorHeapKind::Sampler,
                config.scratch_sampler_descriptors,
                config.max_scratch_sampler_descriptors,
            )?,
            fence_value: 0,
            pending: false,
        })
    }
}

pub struct CommandListManager<'d, B: Backend> {
    device: &'d Device<B>,
    slots: Vec<FrameSlot>,
    current: usize,
    list: CommandListId,
    next_fence_value: u64,
    /// Commands that do work (draws, clears, copies) recorded since the last
    /// submission.
    work: u32,
}

impl<'d, B: Backend> CommandListManager<'d, B> {
    /// Allocates every frame slot and opens the command list on the first.
    /// Failures here are structural and abort context creation.
    pub fn new(device: &'d Device<B>) -> Result<Self, Error> {
        let slots = (0..device.config().frame_slots())
            .map(|_| FrameSlot::new(device))
            .collect::<Result<Vec<_>, _>>()?;

        let backend = device.backend();
        let list = backend.create_command_list(slots[0].allocator)?;
        backend.close_command_list(list)?;

        let mut manager = Self {
            device,
            slots,
            current: 0,
            list,
            next_fence_value: 1,
            work: 0,
        };
        manager.activate(0);

        log::debug!(
            "command list manager created with {} frame slots",
            manager.slots.len()
        );
        Ok(manager)
    }

    #[must_use]
    pub fn device(&self) -> &'d Device<B> {
        self.device
    }

    #[must_use]
    pub fn list(&self) -> CommandListId {
        self.list
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn current_slot(&self) -> usize {
        self.current
    }

    /// The fence value that will be signaled when the current slot is
    /// submitted.
    #[must_use]
    pub fn current_fence_value(&self) -> u64 {
        self.slots[self.current].fence_value
    }

    pub fn encode(&self, command: &Command) {
        self.device.backend().encode(self.list, command);
    }

    pub fn record_work(&mut self) {
        self.work += 1;
    }

    #[must_use]
    pub fn has_work(&self) -> bool {
        self.work > 0
    }

    #[must_use]
    pub fn work_count(&self) -> u32 {
        self.work
    }

    /// The shader-visible heaps of the current slot, `(view, sampler)`.
    #[must_use]
    pub fn descriptor_heaps(&self) -> (HeapId, HeapId) {
        let slot = &self.slots[self.current];
        (slot.view_heap.id(), slot.sampler_heap.id())
    }

    pub fn allocate_scratch(
        &mut self,
        size: u64,
        alignment: u64,
    ) -> Result<ScratchAllocation<'_>, Error> {
        let device = self.device;
        self.slots[self.current].scratch.allocate(
            device.backend(),
            device.deletion_queue(),
            size,
            alignment,
        )
    }

    pub fn allocate_descriptors(
        &mut self,
        kind: DescriptorHeapKind,
        count: u32,
    ) -> Result<DescriptorAllocation, Error> {
        let device = self.device;
        let slot = &mut self.slots[self.current];
        let heap = match kind {
            DescriptorHeapKind::View => &mut slot.view_heap,
            DescriptorHeapKind::Sampler => &mut slot.sampler_heap,
        };
        heap.allocate(device.backend(), device.deletion_queue(), count)
    }

    /// Closes and submits the command list. With `reopen` the list is reset
    /// on the same allocator and recording continues in the same slot.
    ///
    /// If the list fails to close its commands are dropped, and a fresh list
    /// takes its place.
    pub fn execute(&mut self, reopen: bool) -> Result<(), Error> {
        let backend = self.device.backend();
        let allocator = self.slots[self.current].allocator;

        match backend.close_command_list(self.list) {
            Ok(()) => backend.execute(self.list),
            Err(e) => {
                log::error!(
                    "closing the command list failed ({e}), {} commands since the last submission are lost",
                    self.work
                );
                self.replace_list(allocator)?;
            }
        }

        self.work = 0;

        if reopen {
            if let Err(e) = backend.reset_command_list(self.list, allocator) {
                log::error!("failed to reopen the command list: {e}");
            }
        }

        Ok(())
    }

    fn replace_list(&mut self, allocator: AllocatorId) -> Result<(), Error> {
        let backend = self.device.backend();
        let list = backend.create_command_list(allocator).map_err(|e| {
            log::error!("failed to recreate the command list: {e}");
            e
        })?;
        backend.close_command_list(list)?;

        // Never submitted, so nothing on the GPU refers to it.
        let broken = std::mem::replace(&mut self.list, list);
        backend.destroy_command_list(broken);
        Ok(())
    }

    /// Signals the current slot's fence and moves to the next slot, waiting
    /// for it if it is still in flight. The list must have been submitted.
    pub fn rotate(&mut self) -> Result<(), Error> {
        let backend = self.device.backend();
        let slot = &mut self.slots[self.current];

        match backend.signal(slot.fence_value) {
            Ok(()) => slot.pending = true,
            Err(e) => log::error!("failed to signal fence value {}: {e}", slot.fence_value),
        }

        let next = (self.current + 1) % self.slots.len();
        if self.slots[next].pending {
            self.wait_for_slot(next)?;
        }

        self.activate(next);
        Ok(())
    }

    /// Blocks until the slot's last submission has completed, then destroys
    /// everything retired up to its fence.
    fn wait_for_slot(&mut self, index: usize) -> Result<(), Error> {
        let backend = self.device.backend();
        let fence_value = self.slots[index].fence_value;

        if backend.completed_value() < fence_value {
            log::debug!("waiting for frame slot {index} (fence {fence_value})");
            backend.wait_for_value(fence_value)?;
        }

        let destroyed = self.device.deletion_queue().collect(fence_value, backend);
        if destroyed > 0 {
            log::trace!("destroyed {destroyed} retired objects at fence {fence_value}");
        }

        self.slots[index].pending = false;
        Ok(())
    }

    /// Blocks until every submitted slot has completed.
    pub fn finish_pending(&mut self) -> Result<(), Error> {
        for index in 0..self.slots.len() {
            if self.slots[index].pending {
                self.wait_for_slot(index)?;
            }
        }
        Ok(())
    }

    /// Submits outstanding work and blocks until the GPU has executed all of
    /// it. Recording continues in the next slot.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.execute(false)?;
        self.rotate()?;
        self.finish_pending()
    }

    /// Prepares a slot for recording. Failures to reset are logged; the list
    /// is still usable on the previous allocator contents.
    fn activate(&mut self, index: usize) {
        let backend = self.device.backend();
        let slot = &mut self.slots[index];

        if let Err(e) = backend.reset_command_allocator(slot.allocator) {
            log::error!("failed to reset command allocator for frame slot {index}: {e}");
        }
        if let Err(e) = backend.reset_command_list(self.list, slot.allocator) {
            log::error!("failed to reset the command list for frame slot {index}: {e}");
        }

        slot.fence_value = self.next_fence_value;
        self.next_fence_value += 1;

        slot.scratch.reset();
        slot.view_heap.reset();
        slot.sampler_heap.reset();

        self.device.deletion_queue().set_cleanup_fence(slot.fence_value);
        self.current = index;

        log::trace!(
            "activated frame slot {index} with fence value {}",
            slot.fence_value
        );
    }
}

impl<B: Backend> Drop for CommandListManager<'_, B> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            log::error!("failed to drain the GPU while releasing a context: {e}");
        }

        let backend = self.device.backend();
        let deletion = self.device.deletion_queue();

        deletion.retire(Retired::CommandList(self.list));
        for slot in self.slots.drain(..) {
            slot.scratch.release(deletion);
            slot.view_heap.release(deletion);
            slot.sampler_heap.release(deletion);
            backend.destroy_command_allocator(slot.allocator);
        }

        // Everything still queued was retired after the last submission that
        // could reference it, and that submission has completed.
        deletion.destroy_all(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::recording::{Destroyed, Event, RecordingBackend},
        Config,
    };

    fn device(backend: RecordingBackend, frame_latency: u32) -> Device<RecordingBackend> {
        Device::new(
            backend,
            Config {
                frame_latency,
                scratch_buffer_size: 1024,
                max_scratch_buffer_size: 1 << 20,
                scratch_view_descriptors: 64,
                scratch_sampler_descriptors: 16,
                ..Config::default()
            },
        )
    }

    #[test]
    fn slots_cycle_with_increasing_fences() {
        let device = device(RecordingBackend::new(), 2);
        let mut commands = CommandListManager::new(&device).unwrap();
        assert_eq!(commands.slot_count(), 3);
        assert_eq!(commands.current_fence_value(), 1);

        for expected in 2..=7 {
            commands.execute(false).unwrap();
            commands.rotate().unwrap();
            assert_eq!(commands.current_fence_value(), expected);
            assert_eq!(commands.current_slot(), (expected as usize - 1) % 3);
        }

        let signals: Vec<_> = device
            .backend()
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Signal(value) => Some(value),
                _ => None,
            })
            .collect();
        assert_eq!(signals, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn failed_close_replaces_the_list() {
        let device = device(RecordingBackend::new(), 1);
        let mut commands = CommandListManager::new(&device).unwrap();
        let broken = commands.list();

        commands.record_work();
        device.backend().fail_next_close();
        commands.execute(true).unwrap();

        assert_ne!(commands.list(), broken);
        assert!(!commands.has_work());
        assert!(device
            .backend()
            .is_destroyed(Destroyed::CommandList(broken)));
        assert!(!device
            .backend()
            .events()
            .contains(&Event::Execute(broken)));
    }

    #[test]
    fn retired_objects_wait_for_their_slot() {
        let device = device(RecordingBackend::manual(), 1);
        let backend = device.backend();
        let mut commands = CommandListManager::new(&device).unwrap();

        let buffer = device
            .create_buffer(&crate::BufferDesc {
                size: 16,
                usage: crate::BufferUsage::Vertex,
                writable: false,
            })
            .unwrap();
        device.release_buffer(buffer);

        // Slot 0 (fence 1) goes in flight; slot 1 is free.
        commands.execute(false).unwrap();
        commands.rotate().unwrap();
        assert!(!backend.is_destroyed(Destroyed::Resource(buffer.id)));

        // Rotating back to slot 0 needs fence 1.
        backend.complete_through(1);
        commands.execute(false).unwrap();
        commands.rotate().unwrap();
        assert!(backend.is_destroyed(Destroyed::Resource(buffer.id)));
        assert_eq!(backend.blocking_waits(), 0);

        backend.complete_through(u64::MAX);
    }

    #[test]
    fn finish_waits_for_everything() {
        let device = device(RecordingBackend::new(), 2);
        let mut commands = CommandListManager::new(&device).unwrap();

        commands.execute(false).unwrap();
        commands.rotate().unwrap();
        commands.finish().unwrap();

        assert!(commands.slots.iter().all(|slot| !slot.pending));
        assert_eq!(device.backend().signaled_value(), 2);
    }
}
