//! The ECS group index (C6): a per-system, pre-resolved view over the
//! entities and component pointers a system's `update` will actually touch.
//!
//! Systems never see `ComponentStore` pointers directly (the store's own
//! contract says a pointer is invalidated by the next grow or remove); a
//! group index is rebuilt from scratch whenever a band's deferred mutations
//! could have invalidated it, and systems only ever observe the index for the
//! duration of a single band.

use std::cmp::Ordering;

use crate::component::ComponentType;
use crate::entity::EntityId;
use crate::manager::EntityManager;

/// One entity's resolved component pointers for a single system, in the
/// order the system's `immutable_inputs` then `mutable_inputs` were declared.
/// A `Tag` component (zero size) resolves to a null pointer -- its presence
/// was already confirmed by `has_component_type` during the rebuild, and
/// nothing ever reads through a tag pointer.
pub struct GroupEntry {
    pub entity: EntityId,
    pointers: Vec<*const u8>,
}

impl GroupEntry {
    pub fn component(&self, position: usize) -> *const u8 {
        self.pointers[position]
    }
}

// Pointers here are only ever read back by the code that just rebuilt this
// index on the scheduler thread before handing it to band-local system
// closures; no entry outlives the band whose rebuild produced it.
unsafe impl Send for GroupEntry {}
unsafe impl Sync for GroupEntry {}

/// A system's declared input signature and its resolved, sorted entries.
pub struct GroupIndex {
    immutable_inputs: Vec<ComponentType>,
    mutable_inputs: Vec<ComponentType>,
    entries: Vec<GroupEntry>,
}

impl GroupIndex {
    pub fn new(immutable_inputs: Vec<ComponentType>, mutable_inputs: Vec<ComponentType>) -> Self {
        Self {
            immutable_inputs,
            mutable_inputs,
            entries: Vec::new(),
        }
    }

    pub fn immutable_inputs(&self) -> &[ComponentType] {
        &self.immutable_inputs
    }

    pub fn mutable_inputs(&self) -> &[ComponentType] {
        &self.mutable_inputs
    }

    fn required_types(&self) -> impl Iterator<Item = ComponentType> + '_ {
        self.immutable_inputs.iter().chain(self.mutable_inputs.iter()).copied()
    }

    pub fn entries(&self) -> &[GroupEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recompute this index's entries from the current entity manager state.
    /// Entries are sorted by their resolved component pointers (leftmost
    /// declared type first, ties broken by the next), not by `EntityId` --
    /// this favors store iteration order, which is where cache locality
    /// actually comes from during a system's scan.
    pub fn rebuild(&mut self, manager: &EntityManager) {
        self.entries.clear();
        let required: Vec<ComponentType> = self.required_types().collect();

        'entities: for entity in manager.entities() {
            if !required.iter().all(|ty| entity.has_component_type(*ty)) {
                continue;
            }
            let mut pointers = Vec::with_capacity(required.len());
            for ty in &required {
                let entry = match manager.reflector().get(*ty) {
                    Some(e) => e,
                    None => continue 'entities,
                };
                if entry.size == 0 {
                    pointers.push(std::ptr::null());
                    continue;
                }
                let component_id = match entity.component_ids.iter().find(|c| c.ty == *ty) {
                    Some(id) => *id,
                    None => continue 'entities,
                };
                let store = match manager.store(*ty) {
                    Some(s) => s,
                    None => continue 'entities,
                };
                match store.find(component_id) {
                    Some(ptr) => pointers.push(ptr),
                    None => continue 'entities,
                }
            }
            self.entries.push(GroupEntry { entity: entity.id, pointers });
        }

        self.entries.sort_by(|a, b| {
            for (pa, pb) in a.pointers.iter().zip(b.pointers.iter()) {
                let ord = (*pa as usize).cmp(&(*pb as usize));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityFlags;
    use crate::manager::ComponentSpec;
    use crate::reflect::{ReflectionEntry, Reflector};

    fn manager_with_position() -> (EntityManager, ComponentType) {
        let mut reflector = Reflector::new();
        let ty = reflector
            .register(ReflectionEntry::normal::<f32, _, _, _>(
                ComponentType::from_raw(0),
                "Position",
                |v| v.as_f64().map(|x| x as f32),
                |v, out| out.extend_from_slice(&v.to_le_bytes()),
                |v, bytes| {
                    *v = f32::from_le_bytes(bytes.try_into().unwrap());
                    true
                },
            ))
            .unwrap();
        (EntityManager::new(reflector), ty)
    }

    #[test]
    fn rebuild_only_includes_matching_entities() {
        let (mut mgr, ty) = manager_with_position();
        let with_pos = mgr
            .create_entity(0, EntityFlags::empty(), vec![ComponentSpec { ty, payload: serde_json::json!(1.0) }], None)
            .unwrap();
        let without_pos = mgr.create_entity(0, EntityFlags::empty(), vec![], None).unwrap();

        let mut group = GroupIndex::new(vec![ty], vec![]);
        group.rebuild(&mgr);

        let entities: Vec<EntityId> = group.entries().iter().map(|e| e.entity).collect();
        assert_eq!(entities, vec![with_pos]);
        assert_ne!(entities, vec![without_pos]);
    }

    #[test]
    fn rebuild_is_idempotent_after_deletion() {
        let (mut mgr, ty) = manager_with_position();
        let a = mgr
            .create_entity(0, EntityFlags::empty(), vec![ComponentSpec { ty, payload: serde_json::json!(1.0) }], None)
            .unwrap();
        let mut group = GroupIndex::new(vec![ty], vec![]);
        group.rebuild(&mgr);
        assert_eq!(group.len(), 1);

        mgr.delete_entities(&[a]);
        group.rebuild(&mgr);
        assert_eq!(group.len(), 0);
    }
}
