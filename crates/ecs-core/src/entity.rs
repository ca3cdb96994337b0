//! Entity identifiers, the entity record, and the parent/child forest.
//!
//! An [`EntityId`] is a dense, monotonically allocated 32-bit handle. Unlike a
//! generational ID, it is never recycled within a session: deleting an entity
//! retires its index for good. This trades the ability to reuse index slots
//! for a guarantee the replication layer depends on -- a `ComponentID`'s
//! unique counter and an `EntityId` both only grow, so snapshot view tables
//! stay sorted without needing a generation tiebreaker.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::component::ComponentId;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A dense, monotonically allocated entity identifier.
///
/// Valid IDs are stable for the entity's lifetime and are never reused within
/// a session, even after the entity is deleted.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(u32);

impl EntityId {
    /// The sentinel value denoting "no entity".
    pub const INVALID: EntityId = EntityId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn to_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "EntityId({})", self.0)
        } else {
            write!(f, "EntityId(INVALID)")
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// EntityIdAllocator
// ---------------------------------------------------------------------------

/// Allocates dense, monotonically increasing [`EntityId`]s.
///
/// Unlike a generational allocator there is no free list: every allocated
/// index is permanently retired from reuse once the counter passes it, which
/// keeps `EntityId` ordering total and stable across deletes.
#[derive(Debug, Default)]
pub struct EntityIdAllocator {
    next: u32,
}

impl EntityIdAllocator {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    /// Allocate the next `EntityId`.
    ///
    /// # Panics
    ///
    /// Panics on exhaustion of the 32-bit space (`u32::MAX` is the invalid
    /// sentinel and is never handed out).
    pub fn allocate(&mut self) -> EntityId {
        assert!(
            self.next < u32::MAX,
            "EntityIdAllocator exhausted: no more EntityIds available in this session"
        );
        let id = EntityId(self.next);
        self.next += 1;
        id
    }

    /// Advance the counter so that it is strictly past `requested`, used when
    /// `create_entity` is given an explicit ID to restore (e.g. replaying a
    /// received transmission that already allocated IDs on another process).
    pub fn observe(&mut self, requested: EntityId) {
        if requested.0 != u32::MAX && requested.0 >= self.next {
            self.next = requested.0 + 1;
        }
    }

    pub fn next_value(&self) -> u32 {
        self.next
    }
}

// ---------------------------------------------------------------------------
// EntityFlags
// ---------------------------------------------------------------------------

/// Bit flags carried on every [`Entity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityFlags(u32);

impl EntityFlags {
    /// The entity participates in replication: it appears in snapshots and is
    /// subject to the replication encoder's view-table bookkeeping.
    pub const NETWORKED: EntityFlags = EntityFlags(1 << 0);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, flag: EntityFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn insert(&mut self, flag: EntityFlags) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: EntityFlags) {
        self.0 &= !flag.0;
    }
}

impl std::ops::BitOr for EntityFlags {
    type Output = EntityFlags;
    fn bitor(self, rhs: EntityFlags) -> EntityFlags {
        EntityFlags(self.0 | rhs.0)
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A single entity's bookkeeping record.
///
/// Holds no component *data* -- only the ordered list of [`ComponentId`]s
/// resolving into the per-type stores, plus forest links to parent/children.
/// Parent and children are stored as `EntityId` indices into the owning
/// [`crate::manager::EntityManager`] rather than raw references, per the
/// arena-and-index discipline this crate uses throughout: entity records
/// never hold pointers that could dangle across a tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    /// Hash of the entity-info name this entity was constructed from, kept
    /// for diagnostics and asset-driven re-construction; opaque to the core.
    pub info_name_hash: u32,
    pub flags: EntityFlags,
    /// Ordered (by `ComponentId` lexicographic order) list of this entity's
    /// components.
    pub component_ids: Vec<ComponentId>,
    pub parent: Option<EntityId>,
    pub children: Vec<EntityId>,
}

impl Entity {
    pub fn new(id: EntityId, info_name_hash: u32, flags: EntityFlags) -> Self {
        Self {
            id,
            info_name_hash,
            flags,
            component_ids: Vec::new(),
            parent: None,
            children: Vec::new(),
        }
    }

    /// Insert a `ComponentId` keeping `component_ids` sorted.
    pub fn insert_component_id(&mut self, id: ComponentId) {
        let pos = self.component_ids.partition_point(|c| *c < id);
        self.component_ids.insert(pos, id);
    }

    pub fn remove_component_id(&mut self, id: ComponentId) {
        if let Ok(pos) = self.component_ids.binary_search(&id) {
            self.component_ids.remove(pos);
        }
    }

    pub fn has_component_type(&self, ty: crate::component::ComponentType) -> bool {
        self.component_ids.iter().any(|c| c.ty == ty)
    }
}

// ---------------------------------------------------------------------------
// Forest validation
// ---------------------------------------------------------------------------

/// Walks ancestors of `start` (as recorded in `lookup`) and returns `true` if
/// `candidate` would be its own ancestor, i.e. linking `start.parent =
/// candidate` would introduce a cycle.
///
/// Grounded on the original `ActorManager::SetParent` ancestor walk: the
/// acyclicity check runs synchronously at link time rather than as a periodic
/// sweep, so a cycle can never be observed even transiently.
pub fn would_introduce_cycle(
    lookup: &dyn Fn(EntityId) -> Option<EntityId>,
    start: EntityId,
    candidate: EntityId,
) -> bool {
    let mut seen = HashSet::new();
    let mut cursor = Some(candidate);
    while let Some(id) = cursor {
        if id == start {
            return true;
        }
        if !seen.insert(id) {
            // Pre-existing cycle in recorded state; treat conservatively.
            return true;
        }
        cursor = lookup(id);
    }
    false
}
