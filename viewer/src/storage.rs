use bevy::prelude::*;
use dashmap::DashMap;
use procgen_bridge::{RequestId, SlotKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TrackedModel {
    owner: Entity,
    /// Newest request submitted for the slot; older outcomes are stale.
    latest: RequestId,
}

/// Which entity owns each scheduler slot, and which request it is waiting for.
/// An entity owns one slot at a time.
#[derive(Resource, Default)]
pub struct ModelStorage {
    slots: DashMap<SlotKey, TrackedModel>,
    owners: DashMap<Entity, SlotKey>,
}

impl ModelStorage {
    /// Records `request` as the one `owner` waits for. Returns the slot the
    /// owner used before when it moved to another one.
    pub fn track(&self, slot: SlotKey, owner: Entity, request: RequestId) -> Option<SlotKey> {
        let previous = self.owners.insert(owner, slot).filter(|old| *old != slot);
        if let Some(old) = previous {
            self.slots.remove(&old);
        }
        if let Some(displaced) = self
            .slots
            .insert(slot, TrackedModel { owner, latest: request })
            .filter(|m| m.owner != owner)
        {
            // two entities with the same content share a slot; the newest wins
            self.owners.remove_if(&displaced.owner, |_, s| *s == slot);
        }
        previous
    }

    /// Owner of `slot` when `request` is still the newest one for it. Outcomes
    /// of older requests and of released slots get `None`.
    pub fn accept(&self, slot: &SlotKey, request: RequestId) -> Option<Entity> {
        self.slots
            .get(slot)
            .filter(|m| m.latest == request)
            .map(|m| m.owner)
    }

    pub fn owner(&self, slot: &SlotKey) -> Option<Entity> {
        self.slots.get(slot).map(|m| m.owner)
    }

    /// Forgets `owner`, returning the slot it held.
    pub fn release(&self, owner: Entity) -> Option<SlotKey> {
        let (_, slot) = self.owners.remove(&owner)?;
        self.slots.remove_if(&slot, |_, m| m.owner == owner);
        Some(slot)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
