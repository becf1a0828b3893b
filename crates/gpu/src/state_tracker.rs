//! Tracks the usage state of resources that are away from their default.
//!
//! A resource with no entry is in its declared default state. Every barrier
//! the context records is produced here so that the map and the GPU never
//! disagree.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::{
    backend::Barrier,
    resource::{ResourceId, Tracked},
    types::ResourceState,
};

pub type BarrierBatch = SmallVec<[Barrier; 4]>;

#[derive(Debug, Default)]
pub struct StateTracker {
    states: HashMap<ResourceId, ResourceState>,
}

impl StateTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current_state(&self, resource: Tracked) -> ResourceState {
        self.states
            .get(&resource.id)
            .copied()
            .unwrap_or(resource.default_state)
    }

    /// Records `resource` moving from `from` to `to`. Emits nothing when the
    /// states match.
    pub fn barrier(
        &mut self,
        resource: Tracked,
        from: ResourceState,
        to: ResourceState,
        batch: &mut BarrierBatch,
    ) {
        if from == to {
            return;
        }

        batch.push(Barrier {
            resource: resource.id,
            before: from,
            after: to,
        });

        if to == resource.default_state {
            self.states.remove(&resource.id);
        } else {
            self.states.insert(resource.id, to);
        }
    }

    /// Moves `resource` from wherever it is now to `to`.
    pub fn transition(&mut self, resource: Tracked, to: ResourceState, batch: &mut BarrierBatch) {
        let from = self.current_state(resource);
        self.barrier(resource, from, to, batch);
    }

    /// Returns `resource` to its default state.
    pub fn restore(&mut self, resource: Tracked, batch: &mut BarrierBatch) {
        self.transition(resource, resource.default_state, batch);
    }

    /// Moves render targets and depth buffers between bindings. Every
    /// outgoing resource that is not also incoming is restored to its
    /// default before any incoming resource is transitioned, so the batch
    /// never has a resource enter a role while another still leaves it.
    pub fn rebind_targets(
        &mut self,
        outgoing: &[Tracked],
        incoming: &[(Tracked, ResourceState)],
        batch: &mut BarrierBatch,
    ) {
        for resource in outgoing {
            if !incoming.iter().any(|(r, _)| r.id == resource.id) {
                self.restore(*resource, batch);
            }
        }

        for (resource, state) in incoming {
            self.transition(*resource, *state, batch);
        }
    }

    /// Drops the state of a destroyed resource. Returns whether it was away
    /// from its default state.
    pub fn forget(&mut self, resource: ResourceId) -> bool {
        self.states.remove(&resource).is_some()
    }

    /// The number of resources currently away from their default state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture(id: u64) -> Tracked {
        Tracked {
            id: ResourceId(id),
            default_state: ResourceState::ShaderResource,
        }
    }

    #[test]
    fn same_state_emits_nothing() {
        let mut tracker = StateTracker::new();
        let mut batch = BarrierBatch::new();

        tracker.transition(texture(1), ResourceState::ShaderResource, &mut batch);
        assert!(batch.is_empty());

        tracker.transition(texture(1), ResourceState::RenderTarget, &mut batch);
        tracker.transition(texture(1), ResourceState::RenderTarget, &mut batch);
        assert_eq!(batch.len(), 1);
        assert_eq!(tracker.current_state(texture(1)), ResourceState::RenderTarget);

        tracker.restore(texture(1), &mut batch);
        assert_eq!(batch.len(), 2);
        assert!(tracker.is_empty());
    }

    #[test]
    fn rebind_restores_before_entering() {
        let mut tracker = StateTracker::new();
        let mut batch = BarrierBatch::new();
        let (a, b) = (texture(1), texture(2));

        tracker.rebind_targets(&[], &[(a, ResourceState::RenderTarget)], &mut batch);
        batch.clear();

        tracker.rebind_targets(&[a], &[(b, ResourceState::RenderTarget)], &mut batch);

        assert_eq!(
            batch.as_slice(),
            &[
                Barrier {
                    resource: a.id,
                    before: ResourceState::RenderTarget,
                    after: ResourceState::ShaderResource,
                },
                Barrier {
                    resource: b.id,
                    before: ResourceState::ShaderResource,
                    after: ResourceState::RenderTarget,
                },
            ]
        );
    }

    #[test]
    fn rebinding_the_same_target_is_free() {
        let mut tracker = StateTracker::new();
        let mut batch = BarrierBatch::new();
        let a = texture(1);

        tracker.rebind_targets(&[], &[(a, ResourceState::RenderTarget)], &mut batch);
        batch.clear();
        tracker.rebind_targets(&[a], &[(a, ResourceState::RenderTarget)], &mut batch);
        assert!(batch.is_empty());
    }

    #[test]
    fn forgotten_resources_start_over_from_their_default() {
        let mut tracker = StateTracker::new();
        let mut batch = BarrierBatch::new();

        tracker.transition(texture(1), ResourceState::RenderTarget, &mut batch);
        assert!(tracker.forget(ResourceId(1)));
        assert!(!tracker.forget(ResourceId(1)));
        assert!(tracker.is_empty());
        assert_eq!(tracker.current_state(texture(1)), ResourceState::ShaderResource);

        batch.clear();
        tracker.restore(texture(1), &mut batch);
        assert!(batch.is_empty());
    }
}
