use crate::{
    resource::{CpuDescriptor, Tracked},
    types::BindingFamily,
};

/// A view bound to a table slot. UAV bindings carry the resource so that it
/// can be moved in and out of the unordered-access state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BoundView {
    pub descriptor: CpuDescriptor,
    pub resource: Option<Tracked>,
}

/// The bindings of one family for one stage.
#[derive(Debug)]
pub(crate) struct BindingTable {
    slots: Vec<Option<BoundView>>,
    /// One past the highest occupied slot.
    bound: u32,
    dirty: bool,
}

impl BindingTable {
    pub fn new(family: BindingFamily) -> Self {
        Self {
            slots: vec![None; family.slot_count()],
            bound: 0,
            dirty: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, slot: usize) -> Option<BoundView> {
        self.slots.get(slot).copied().flatten()
    }

    /// Replaces the view in `slot`, returning the previous one. Returns `None`
    /// without marking the table dirty if nothing changes.
    pub fn set(&mut self, slot: usize, view: Option<BoundView>) -> Option<Option<BoundView>> {
        if self.slots[slot] == view {
            return None;
        }

        let previous = std::mem::replace(&mut self.slots[slot], view);
        self.dirty = true;

        if view.is_some() {
            self.bound = self.bound.max(slot as u32 + 1);
        } else if slot as u32 + 1 == self.bound {
            self.bound = self.slots[..slot]
                .iter()
                .rposition(Option::is_some)
                .map_or(0, |i| i as u32 + 1);
        }

        Some(previous)
    }

    pub fn bound_count(&self) -> u32 {
        self.bound
    }

    /// The occupied prefix of the table, gaps included.
    pub fn entries(&self) -> &[Option<BoundView>] {
        &self.slots[..self.bound as usize]
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Unbinds every slot, returning what was bound.
    pub fn clear(&mut self) -> Vec<BoundView> {
        let cleared = self.slots[..self.bound as usize]
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        self.bound = 0;
        self.dirty = false;
        cleared
    }
}

/// Every binding table of one shader stage.
#[derive(Debug)]
pub(crate) struct StageBindings {
    tables: [BindingTable; 4],
}

impl StageBindings {
    pub fn new() -> Self {
        Self {
            tables: BindingFamily::ALL.map(BindingTable::new),
        }
    }

    pub fn table(&self, family: BindingFamily) -> &BindingTable {
        &self.tables[family_index(family)]
    }

    pub fn table_mut(&mut self, family: BindingFamily) -> &mut BindingTable {
        &mut self.tables[family_index(family)]
    }

    pub fn mark_dirty(&mut self) {
        for table in &mut self.tables {
            table.mark_dirty();
        }
    }
}

fn family_index(family: BindingFamily) -> usize {
    match family {
        BindingFamily::ConstantBuffer => 0,
        BindingFamily::ShaderResource => 1,
        BindingFamily::Sampler => 2,
        BindingFamily::UnorderedAccess => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(id: u64) -> Option<BoundView> {
        Some(BoundView {
            descriptor: CpuDescriptor(id),
            resource: None,
        })
    }

    #[test]
    fn bound_count_tracks_the_highest_slot() {
        let mut table = BindingTable::new(BindingFamily::ShaderResource);

        table.set(0, view(1));
        table.set(2, view(2));
        assert_eq!(table.bound_count(), 3);
        assert_eq!(table.entries(), &[view(1), None, view(2)]);

        table.set(2, None);
        assert_eq!(table.bound_count(), 1);

        table.set(0, None);
        assert_eq!(table.bound_count(), 0);
    }

    #[test]
    fn unbinding_a_lower_slot_keeps_the_count() {
        let mut table = BindingTable::new(BindingFamily::Sampler);
        table.set(1, view(1));
        table.set(3, view(2));

        table.set(1, None);
        assert_eq!(table.bound_count(), 4);
    }

    #[test]
    fn identical_sets_are_ignored() {
        let mut table = BindingTable::new(BindingFamily::ConstantBuffer);

        assert_eq!(table.set(4, view(9)), Some(None));
        table.clear_dirty();

        assert_eq!(table.set(4, view(9)), None);
        assert!(!table.is_dirty());
    }
}
