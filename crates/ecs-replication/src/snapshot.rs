//! `SerializedEntitiesAndComponents`: the canonical, deterministic byte
//! layout a live [`EntityManager`] is flattened into before transmission.
//!
//! Grounded on the original `SerializedEntitiesAndComponents.cpp`'s shape (a
//! flat byte blob plus per-type and per-entity view tables into it); the
//! concrete binary layout of an entity record below is this crate's own,
//! since the original's record format is C++ struct layout that has no
//! direct Rust analogue.

use std::collections::BTreeMap;

use ecs_core::prelude::*;

/// A byte-range `[begin, end)` into a [`Snapshot`]'s `bytes`.
pub type ByteView = (u32, u32);

/// `{ bytes, component_views, entity_views }` per the data model: a flat byte
/// buffer plus sorted-by-unique-ID view tables into it. `component_views`
/// uses a `BTreeMap` specifically so iteration order is the type's stable
/// `ComponentType` ordering -- required for snapshot determinism (§8).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub bytes: Vec<u8>,
    pub component_views: BTreeMap<ComponentType, Vec<ByteView>>,
    pub entity_views: Vec<ByteView>,
}

impl Snapshot {
    /// The contiguous prefix of `bytes` holding every entity record, used as
    /// one buffer by the entity-table delta pass.
    pub fn entity_region(&self) -> &[u8] {
        let end = self.entity_views.last().map(|&(_, e)| e).unwrap_or(0) as usize;
        &self.bytes[..end]
    }

    pub fn component_payload(&self, ty: ComponentType, view: ByteView) -> (u64, &[u8]) {
        let record = &self.bytes[view.0 as usize..view.1 as usize];
        let unique = u64::from_be_bytes(record[0..8].try_into().unwrap());
        let _ = ty;
        (unique, &record[8..])
    }
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_entity_record(out: &mut Vec<u8>, entity: &Entity) {
    write_u32(out, entity.id.to_raw());
    write_u32(out, entity_flags_raw(entity.flags));
    write_u32(out, entity.info_name_hash);
    write_u32(out, entity.parent.map(EntityId::to_raw).unwrap_or(u32::MAX));
    write_u32(out, entity.children.len() as u32);
    for child in &entity.children {
        write_u32(out, child.to_raw());
    }
    write_u32(out, entity.component_ids.len() as u32);
    for component_id in &entity.component_ids {
        write_u32(out, component_id.ty.to_raw());
        out.extend_from_slice(&component_id.unique.to_be_bytes());
    }
}

fn entity_flags_raw(flags: EntityFlags) -> u32 {
    // EntityFlags has no public raw accessor; NETWORKED is the only flag the
    // wire format needs to round-trip today.
    if flags.contains(EntityFlags::NETWORKED) { 1 } else { 0 }
}

fn entity_flags_from_raw(raw: u32) -> EntityFlags {
    if raw & 1 != 0 {
        EntityFlags::NETWORKED
    } else {
        EntityFlags::empty()
    }
}

/// Parsed form of one wire entity record, independent of any live
/// [`EntityManager`] -- used by the decoder, which reconstructs entities
/// without ever running a component factory (see §4.8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub id: EntityId,
    pub flags: EntityFlags,
    pub info_name_hash: u32,
    pub parent: Option<EntityId>,
    pub children: Vec<EntityId>,
    pub component_ids: Vec<ComponentId>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("entity record truncated")]
    Truncated,
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32, SnapshotError> {
    let slice = buf.get(*pos..*pos + 4).ok_or(SnapshotError::Truncated)?;
    *pos += 4;
    Ok(u32::from_be_bytes(slice.try_into().unwrap()))
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Result<u64, SnapshotError> {
    let slice = buf.get(*pos..*pos + 8).ok_or(SnapshotError::Truncated)?;
    *pos += 8;
    Ok(u64::from_be_bytes(slice.try_into().unwrap()))
}

/// Parse a single entity record starting at `buf[0]`, returning the record
/// and the number of bytes it occupied.
pub fn parse_entity_record(buf: &[u8]) -> Result<(EntityRecord, usize), SnapshotError> {
    let mut pos = 0usize;
    let id = EntityId::from_raw(read_u32(buf, &mut pos)?);
    let flags = entity_flags_from_raw(read_u32(buf, &mut pos)?);
    let info_name_hash = read_u32(buf, &mut pos)?;
    let parent_raw = read_u32(buf, &mut pos)?;
    let parent = if parent_raw == u32::MAX { None } else { Some(EntityId::from_raw(parent_raw)) };
    let children_count = read_u32(buf, &mut pos)? as usize;
    let mut children = Vec::with_capacity(children_count);
    for _ in 0..children_count {
        children.push(EntityId::from_raw(read_u32(buf, &mut pos)?));
    }
    let component_count = read_u32(buf, &mut pos)? as usize;
    let mut component_ids = Vec::with_capacity(component_count);
    for _ in 0..component_count {
        let ty = ComponentType::from_raw(read_u32(buf, &mut pos)?);
        let unique = read_u64(buf, &mut pos)?;
        component_ids.push(ComponentId::new(ty, unique));
    }
    Ok((EntityRecord { id, flags, info_name_hash, parent, children, component_ids }, pos))
}

/// Parse every entity record out of a buffer of concatenated records front
/// to back, pairing each with the byte range it occupied. Callers that only
/// need `entity_views` (e.g. rebuilding a `Snapshot` after a delta decode)
/// project out the second element; the receive path (§4.8, "the decoder
/// overwrites the local entity manager") consumes the records themselves.
pub fn parse_entity_records(buf: &[u8]) -> Result<Vec<(EntityRecord, ByteView)>, SnapshotError> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < buf.len() {
        let (record, len) = parse_entity_record(&buf[offset..])?;
        out.push((record, (offset as u32, (offset + len) as u32)));
        offset += len;
    }
    Ok(out)
}

/// Flatten every networked entity (and its networked, non-`Tag` components)
/// out of a live entity manager into a canonical [`Snapshot`].
pub fn build_snapshot(manager: &EntityManager) -> Snapshot {
    let mut bytes = Vec::new();
    let mut entity_views = Vec::new();

    let networked_ids: Vec<EntityId> = manager
        .entity_ids_sorted()
        .into_iter()
        .filter(|id| manager.get_entity(*id).unwrap().flags.contains(EntityFlags::NETWORKED))
        .collect();

    for &id in &networked_ids {
        let entity = manager.get_entity(id).unwrap();
        let begin = bytes.len() as u32;
        write_entity_record(&mut bytes, entity);
        entity_views.push((begin, bytes.len() as u32));
    }

    let mut ids_by_type: BTreeMap<ComponentType, Vec<ComponentId>> = BTreeMap::new();
    for &id in &networked_ids {
        let entity = manager.get_entity(id).unwrap();
        for &component_id in &entity.component_ids {
            match manager.reflector().get(component_id.ty) {
                Some(entry) if entry.size > 0 => {
                    ids_by_type.entry(component_id.ty).or_default().push(component_id);
                }
                _ => {}
            }
        }
    }

    let mut component_views = BTreeMap::new();
    for (ty, mut ids) in ids_by_type {
        ids.sort_unstable();
        let reflect = manager.reflector().get(ty).expect("component type validated above");
        let store = manager.store(ty).expect("networked component type must have a store");
        let mut views = Vec::with_capacity(ids.len());
        for component_id in ids {
            let ptr = store
                .find(component_id)
                .expect("entity-declared component id must resolve in its store");
            let begin = bytes.len() as u32;
            bytes.extend_from_slice(&component_id.unique.to_be_bytes());
            reflect.fully_serialize(ptr, &mut bytes);
            views.push((begin, bytes.len() as u32));
        }
        component_views.insert(ty, views);
    }

    Snapshot { bytes, component_views, entity_views }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform_reflector() -> Reflector {
        let mut reflector = Reflector::new();
        reflector
            .register(ReflectionEntry::normal::<f32, _, _, _>(
                ComponentType::from_raw(0),
                "Transform",
                |v| v.as_f64().map(|x| x as f32),
                |v, out| out.extend_from_slice(&v.to_le_bytes()),
                |v, bytes| {
                    *v = f32::from_le_bytes(bytes.try_into().unwrap());
                    true
                },
            ))
            .unwrap();
        reflector
    }

    #[test]
    fn equal_entity_managers_produce_byte_identical_snapshots() {
        let build = || {
            let mut mgr = EntityManager::new(transform_reflector());
            let ty = mgr.reflector().type_of_name("Transform").unwrap();
            mgr.create_entity(0, EntityFlags::NETWORKED, vec![ComponentSpec { ty, payload: serde_json::json!(1.5) }], None).unwrap();
            mgr
        };
        // Constructed independently twice with identical registration and
        // creation calls.
        let mgr_a = build();
        let mgr_b = build();

        let snap_a = build_snapshot(&mgr_a);
        let snap_b = build_snapshot(&mgr_b);
        assert_eq!(snap_a, snap_b);
    }

    #[test]
    fn entity_record_roundtrips_through_parse() {
        let mut entity = Entity::new(EntityId::from_raw(7), 42, EntityFlags::NETWORKED);
        entity.insert_component_id(ComponentId::new(ComponentType::from_raw(1), 10));
        entity.children.push(EntityId::from_raw(8));
        let mut buf = Vec::new();
        write_entity_record(&mut buf, &entity);

        let (parsed, len) = parse_entity_record(&buf).unwrap();
        assert_eq!(len, buf.len());
        assert_eq!(parsed.id, entity.id);
        assert_eq!(parsed.info_name_hash, entity.info_name_hash);
        assert_eq!(parsed.children, entity.children);
        assert_eq!(parsed.component_ids, entity.component_ids);
    }
}
