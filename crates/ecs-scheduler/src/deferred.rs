//! Deferred structural mutations.
//!
//! Systems run with only shared access to the entity manager (§4.5): they
//! cannot create, destroy, or reparent entities directly. Instead they post
//! a [`DeferredOp`] to their [`DeferredBag`], which the scheduler applies on
//! its own thread after every system in the band has returned. This is
//! directly analogous to the teacher crate's `CommandBuffer`/`CommandKind`
//! pair, generalized to the operations the entity manager actually exposes
//! (component-level create/destroy here is folded into entity creation,
//! since this crate stores components per-type rather than per-archetype).

use ecs_core::prelude::*;

pub enum DeferredOp {
    CreateEntity {
        info_name_hash: u32,
        flags: EntityFlags,
        components: Vec<ComponentSpec>,
    },
    DeleteEntities(Vec<EntityId>),
    SetParent {
        child: EntityId,
        parent: EntityId,
    },
    ClearParent(EntityId),
}

impl DeferredOp {
    pub fn apply(self, manager: &mut EntityManager) {
        match self {
            DeferredOp::CreateEntity { info_name_hash, flags, components } => {
                if let Err(err) = manager.create_entity(info_name_hash, flags, components, None) {
                    tracing::warn!(error = %err, "deferred create_entity failed");
                }
            }
            DeferredOp::DeleteEntities(ids) => manager.delete_entities(&ids),
            DeferredOp::SetParent { child, parent } => {
                if let Err(err) = manager.set_parent(child, parent) {
                    tracing::warn!(error = %err, child = ?child, parent = ?parent, "deferred set_parent failed");
                }
            }
            DeferredOp::ClearParent(child) => {
                if let Err(err) = manager.clear_parent(child) {
                    tracing::warn!(error = %err, child = ?child, "deferred clear_parent failed");
                }
            }
        }
    }
}

/// A single system's queue of deferred operations for the current tick.
/// Operations apply in the order they were pushed.
#[derive(Default)]
pub struct DeferredBag {
    ops: Vec<DeferredOp>,
}

impl DeferredBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_entity(&mut self, info_name_hash: u32, flags: EntityFlags, components: Vec<ComponentSpec>) {
        self.ops.push(DeferredOp::CreateEntity { info_name_hash, flags, components });
    }

    pub fn delete_entities(&mut self, ids: Vec<EntityId>) {
        self.ops.push(DeferredOp::DeleteEntities(ids));
    }

    pub fn set_parent(&mut self, child: EntityId, parent: EntityId) {
        self.ops.push(DeferredOp::SetParent { child, parent });
    }

    pub fn clear_parent(&mut self, child: EntityId) {
        self.ops.push(DeferredOp::ClearParent(child));
    }

    pub fn into_ops(self) -> Vec<DeferredOp> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bag_preserves_push_order() {
        let mut bag = DeferredBag::new();
        bag.create_entity(0, EntityFlags::empty(), vec![]);
        bag.delete_entities(vec![EntityId::from_raw(1)]);
        let ops = bag.into_ops();
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0], DeferredOp::CreateEntity { .. }));
        assert!(matches!(ops[1], DeferredOp::DeleteEntities(_)));
    }

    #[test]
    fn create_entity_applies_against_manager() {
        let reflector = Reflector::new();
        let mut manager = EntityManager::new(reflector);
        let mut bag = DeferredBag::new();
        bag.create_entity(42, EntityFlags::empty(), vec![]);
        for op in bag.into_ops() {
            op.apply(&mut manager);
        }
        assert_eq!(manager.entity_count(), 1);
    }
}
