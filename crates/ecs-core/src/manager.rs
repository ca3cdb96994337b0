//! The entity manager (C3): owns every [`Entity`] record, every
//! [`ComponentStore`], and the ID allocators, and is the only place
//! entities and components are created or destroyed.
//!
//! Grounded on the teacher crate's `World`, generalized from its
//! archetype-table storage (one `Column` per unique combination of component
//! types) to one `ComponentStore` per component *type* (§4.3, "a
//! per-component-type table rather than a per-archetype table"), and from its
//! generational `EntityId`/sequential `ComponentTypeId` identity scheme to
//! the monotonic, never-recycled identity scheme `entity.rs`/`component.rs`
//! implement.

use std::collections::HashMap;

use crate::component::{ComponentId, ComponentIdAllocator, ComponentType};
use crate::entity::{would_introduce_cycle, Entity, EntityFlags, EntityId, EntityIdAllocator};
use crate::reflect::Reflector;
use crate::store::ComponentStore;

#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    #[error("entity {0:?} does not exist")]
    UnknownEntity(EntityId),
    #[error("component type {0:?} is not registered")]
    UnknownComponentType(ComponentType),
    #[error("setting parent would introduce a forest cycle: {child:?} -> {parent:?}")]
    WouldCycle { child: EntityId, parent: EntityId },
    #[error("component factory for {0:?} rejected its payload")]
    ConstructionRejected(ComponentType),
    #[error("requested entity id {0:?} is already alive")]
    DuplicateEntityId(EntityId),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// One requested component to attach at entity creation time: a type plus
/// its opaque construction payload.
pub struct ComponentSpec {
    pub ty: ComponentType,
    pub payload: serde_json::Value,
}

pub struct EntityManager {
    reflector: Reflector,
    entity_allocator: EntityIdAllocator,
    component_allocator: ComponentIdAllocator,
    entities: HashMap<EntityId, Entity>,
    stores: HashMap<ComponentType, ComponentStore>,
}

impl EntityManager {
    pub fn new(reflector: Reflector) -> Self {
        Self {
            reflector,
            entity_allocator: EntityIdAllocator::new(),
            component_allocator: ComponentIdAllocator::new(),
            entities: HashMap::new(),
            stores: HashMap::new(),
        }
    }

    pub fn reflector(&self) -> &Reflector {
        &self.reflector
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.entities.contains_key(&entity)
    }

    pub fn get_entity(&self, entity: EntityId) -> Option<&Entity> {
        self.entities.get(&entity)
    }

    fn store_for(&mut self, ty: ComponentType) -> Result<&mut ComponentStore, EcsError> {
        if !self.stores.contains_key(&ty) {
            let entry = self
                .reflector
                .get(ty)
                .ok_or(EcsError::UnknownComponentType(ty))?;
            self.stores
                .insert(ty, ComponentStore::new(entry.size, entry.align));
        }
        Ok(self.stores.get_mut(&ty).unwrap())
    }

    /// Create a new entity with the requested components. Per §7, a
    /// component whose factory rejects its payload fails independently: the
    /// entity is still created, the remaining components still attempt
    /// construction, and a `tracing::warn!` is emitted (this mirrors the
    /// original `ComponentFactory`'s "log and continue" behavior rather than
    /// aborting the whole entity).
    ///
    /// `requested_id`, when given, forces the entity to take that exact ID
    /// instead of the next one the allocator would hand out, and advances the
    /// allocator past it via `observe` so later local allocations never
    /// collide with it. This is how the replication receive path recreates
    /// entities under the IDs a transmission carries (§4.3).
    pub fn create_entity(
        &mut self,
        info_name_hash: u32,
        flags: EntityFlags,
        components: Vec<ComponentSpec>,
        requested_id: Option<EntityId>,
    ) -> Result<EntityId, EcsError> {
        let id = match requested_id {
            Some(id) => {
                if self.entities.contains_key(&id) {
                    return Err(EcsError::DuplicateEntityId(id));
                }
                self.entity_allocator.observe(id);
                id
            }
            None => self.entity_allocator.allocate(),
        };
        let mut entity = Entity::new(id, info_name_hash, flags);

        for spec in components {
            let entry = self
                .reflector
                .get(spec.ty)
                .ok_or(EcsError::UnknownComponentType(spec.ty))?;
            let component_id = self.component_allocator.allocate(spec.ty);
            let store = self.store_for(spec.ty)?;
            match store.emplace_constructed(component_id, entry, &spec.payload) {
                Ok(true) => entity.insert_component_id(component_id),
                Ok(false) => {
                    tracing::warn!(
                        entity_id = id.to_raw(),
                        component_type = ?spec.ty,
                        "component factory rejected its construction payload; entity created without this component"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        entity_id = id.to_raw(),
                        component_type = ?spec.ty,
                        error = %err,
                        "component store rejected emplace; entity created without this component"
                    );
                }
            }
        }

        self.entities.insert(id, entity);
        Ok(id)
    }

    /// Attach a component to an already-existing entity by overwriting a
    /// freshly allocated slot with raw `fully_serialize`-compatible bytes,
    /// rather than constructing it from an opaque JSON payload. Used by the
    /// replication receive path, which reconstructs component instances
    /// under the exact `ComponentId`s a transmission carries instead of
    /// allocating fresh ones.
    pub fn attach_component_from_bytes(
        &mut self,
        entity: EntityId,
        component_id: ComponentId,
        bytes: &[u8],
    ) -> Result<(), EcsError> {
        if !self.entities.contains_key(&entity) {
            return Err(EcsError::UnknownEntity(entity));
        }
        let entry = self
            .reflector
            .get(component_id.ty)
            .ok_or(EcsError::UnknownComponentType(component_id.ty))?;
        self.component_allocator.observe(component_id);
        let store = self.store_for(component_id.ty)?;
        if store.emplace_from_bytes(component_id, entry, bytes)? {
            self.entities.get_mut(&entity).unwrap().insert_component_id(component_id);
        } else {
            tracing::warn!(
                entity_id = entity.to_raw(),
                component_type = ?component_id.ty,
                "received component rejected its bytes during reconstruction"
            );
        }
        Ok(())
    }

    /// Link `child`'s parent to `parent`, validating acyclicity synchronously
    /// before mutating any state (grounded on `ActorManager::SetParent`).
    pub fn set_parent(&mut self, child: EntityId, parent: EntityId) -> Result<(), EcsError> {
        if !self.entities.contains_key(&child) {
            return Err(EcsError::UnknownEntity(child));
        }
        if !self.entities.contains_key(&parent) {
            return Err(EcsError::UnknownEntity(parent));
        }

        let lookup = |id: EntityId| self.entities.get(&id).and_then(|e| e.parent);
        if would_introduce_cycle(&lookup, child, parent) {
            return Err(EcsError::WouldCycle { child, parent });
        }

        if let Some(old_parent) = self.entities.get(&child).and_then(|e| e.parent) {
            if let Some(old) = self.entities.get_mut(&old_parent) {
                old.children.retain(|&c| c != child);
            }
        }

        self.entities.get_mut(&child).unwrap().parent = Some(parent);
        self.entities.get_mut(&parent).unwrap().children.push(child);
        Ok(())
    }

    pub fn clear_parent(&mut self, child: EntityId) -> Result<(), EcsError> {
        let old_parent = self
            .entities
            .get(&child)
            .ok_or(EcsError::UnknownEntity(child))?
            .parent;
        if let Some(old_parent) = old_parent {
            if let Some(old) = self.entities.get_mut(&old_parent) {
                old.children.retain(|&c| c != child);
            }
        }
        self.entities.get_mut(&child).unwrap().parent = None;
        Ok(())
    }

    /// Delete a batch of entities (and, transitively, their children), along
    /// with every component they own. Deletion removes entities from every
    /// per-type `ComponentStore` in one sorted batch per type rather than one
    /// `remove` call per component, matching each store's `remove_sorted`
    /// fast path.
    pub fn delete_entities(&mut self, ids: &[EntityId]) {
        let mut to_delete: Vec<EntityId> = Vec::new();
        let mut stack: Vec<EntityId> = ids.to_vec();
        while let Some(id) = stack.pop() {
            if !self.entities.contains_key(&id) {
                continue;
            }
            if to_delete.contains(&id) {
                continue;
            }
            to_delete.push(id);
            if let Some(entity) = self.entities.get(&id) {
                stack.extend(entity.children.iter().copied());
            }
        }

        let mut removed_by_type: HashMap<ComponentType, Vec<ComponentId>> = HashMap::new();
        for id in &to_delete {
            if let Some(entity) = self.entities.get(id) {
                for &component_id in &entity.component_ids {
                    removed_by_type.entry(component_id.ty).or_default().push(component_id);
                }
            }
        }

        for (ty, mut component_ids) in removed_by_type {
            component_ids.sort_unstable();
            if let (Some(store), Some(entry)) = (self.stores.get_mut(&ty), self.reflector.get(ty)) {
                store.remove_sorted(&component_ids, entry);
            }
        }

        for id in &to_delete {
            if let Some(entity) = self.entities.remove(id) {
                if let Some(parent) = entity.parent {
                    if let Some(p) = self.entities.get_mut(&parent) {
                        p.children.retain(|&c| c != *id);
                    }
                }
            }
        }
    }

    pub fn store(&self, ty: ComponentType) -> Option<&ComponentStore> {
        self.stores.get(&ty)
    }

    pub fn store_mut(&mut self, ty: ComponentType) -> Option<&mut ComponentStore> {
        self.stores.get_mut(&ty)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entity_ids_sorted(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.entities.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
