//! The component reflector (C2): the single point of type erasure for
//! component storage.
//!
//! Every component type the simulation uses is registered exactly once,
//! producing a [`ReflectionEntry`] that the [`crate::store::ComponentStore`]
//! uses to construct, destruct, move, and serialize component bytes without
//! the store itself ever naming a concrete Rust type. This mirrors the
//! teacher crate's `ComponentVtable`, generalized to the three binding kinds
//! the spec requires (`Normal`, `Tag`, `MemoryImaged`) and to carry the
//! optional networked delta functions.
//!
//! A component's construction factory takes only the opaque JSON payload from
//! an entity-info record (per §6, "the core treats payloads opaquely"). A
//! factory that needs the asset cache closes over an `Arc<AssetCache>`
//! captured at registration time -- the spec's C++ source threads the asset
//! cache through the factory signature explicitly, but a closure capturing
//! shared state is the idiomatic Rust equivalent and avoids a dependency from
//! every component type's construction path on the exact cache type.

use std::collections::HashMap;
use std::mem;

use crate::component::{ComponentType, ComponentTypeError, ComponentTypeNames};

// ---------------------------------------------------------------------------
// BindingKind
// ---------------------------------------------------------------------------

/// How a component type's storage and (de)serialization behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// Ordinary component with explicit serialize/deserialize functions.
    Normal,
    /// Zero-size marker component; no instance is ever stored.
    Tag,
    /// Serializes/deserializes via raw byte copy of its in-memory layout.
    MemoryImaged,
}

// ---------------------------------------------------------------------------
// NetworkedFns
// ---------------------------------------------------------------------------

/// Additional functions a component type supplies if it participates in
/// delta replication (§4.2, "Networked components additionally supply...").
pub struct NetworkedFns {
    pub serialize_delta: Box<dyn Fn(*const u8, *const u8, &mut Vec<u8>) + Send + Sync>,
    pub apply_delta: Box<dyn Fn(*mut u8, &[u8]) -> bool + Send + Sync>,
}

// ---------------------------------------------------------------------------
// ReflectionEntry
// ---------------------------------------------------------------------------

/// The type-erased function table for one registered `ComponentType`.
///
/// All function pointers/closures operate on raw, correctly-sized-and-aligned
/// byte pointers; callers (the store, the snapshot walk) are responsible for
/// only ever calling them against memory that actually holds a live instance
/// of the registered type.
pub struct ReflectionEntry {
    pub component_type: ComponentType,
    pub name: String,
    pub size: usize,
    pub align: usize,
    pub binding_kind: BindingKind,
    construct: Box<dyn Fn(&serde_json::Value, *mut u8) -> bool + Send + Sync>,
    /// # Safety: `ptr` must point to a live, correctly-typed instance.
    destruct: unsafe fn(*mut u8),
    /// # Safety: both pointers must point to live, correctly-typed instances.
    swap: unsafe fn(*mut u8, *mut u8),
    fully_serialize: Box<dyn Fn(*const u8, &mut Vec<u8>) + Send + Sync>,
    apply_full_serialization: Box<dyn Fn(*mut u8, &[u8]) -> bool + Send + Sync>,
    pub networked: Option<NetworkedFns>,
}

impl ReflectionEntry {
    /// Register a `Normal` component: explicit factory + serialize/deserialize.
    pub fn normal<T, F, S, D>(
        component_type: ComponentType,
        name: impl Into<String>,
        factory: F,
        serialize: S,
        deserialize: D,
    ) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&serde_json::Value) -> Option<T> + Send + Sync + 'static,
        S: Fn(&T, &mut Vec<u8>) + Send + Sync + 'static,
        D: Fn(&mut T, &[u8]) -> bool + Send + Sync + 'static,
    {
        Self {
            component_type,
            name: name.into(),
            size: mem::size_of::<T>(),
            align: mem::align_of::<T>(),
            binding_kind: BindingKind::Normal,
            construct: Box::new(move |payload, ptr| {
                match factory(payload) {
                    Some(value) => {
                        // Safety: caller guarantees `ptr` is a fresh, properly
                        // aligned allocation of at least `size_of::<T>()` bytes.
                        unsafe { std::ptr::write(ptr as *mut T, value) };
                        true
                    }
                    None => false,
                }
            }),
            destruct: |ptr| unsafe { std::ptr::drop_in_place(ptr as *mut T) },
            swap: |a, b| unsafe { std::ptr::swap(a as *mut T, b as *mut T) },
            fully_serialize: Box::new(move |ptr, out| {
                let value = unsafe { &*(ptr as *const T) };
                serialize(value, out);
            }),
            apply_full_serialization: Box::new(move |ptr, bytes| {
                let value = unsafe { &mut *(ptr as *mut T) };
                deserialize(value, bytes)
            }),
            networked: None,
        }
    }

    /// Register a `Tag` component: zero size, no instance, presence-only.
    pub fn tag(component_type: ComponentType, name: impl Into<String>) -> Self {
        Self {
            component_type,
            name: name.into(),
            size: 0,
            align: 1,
            binding_kind: BindingKind::Tag,
            construct: Box::new(|_payload, _ptr| true),
            destruct: |_ptr| {},
            swap: |_a, _b| {},
            fully_serialize: Box::new(|_ptr, _out| {}),
            apply_full_serialization: Box::new(|_ptr, _bytes| true),
            networked: None,
        }
    }

    /// Register a `MemoryImaged` component: `T` must be safely representable
    /// by a raw byte copy (no heap pointers, no `Drop` invariants beyond
    /// "bytes are bytes"). Serialize/deserialize are generated automatically.
    pub fn memory_imaged<T, F>(
        component_type: ComponentType,
        name: impl Into<String>,
        factory: F,
    ) -> Self
    where
        T: Copy + Send + Sync + 'static,
        F: Fn(&serde_json::Value) -> Option<T> + Send + Sync + 'static,
    {
        Self {
            component_type,
            name: name.into(),
            size: mem::size_of::<T>(),
            align: mem::align_of::<T>(),
            binding_kind: BindingKind::MemoryImaged,
            construct: Box::new(move |payload, ptr| match factory(payload) {
                Some(value) => {
                    unsafe { std::ptr::write(ptr as *mut T, value) };
                    true
                }
                None => false,
            }),
            destruct: |ptr| unsafe { std::ptr::drop_in_place(ptr as *mut T) },
            swap: |a, b| unsafe { std::ptr::swap(a as *mut T, b as *mut T) },
            fully_serialize: Box::new(|ptr, out| {
                let bytes =
                    unsafe { std::slice::from_raw_parts(ptr, mem::size_of::<T>()) };
                out.extend_from_slice(bytes);
            }),
            apply_full_serialization: Box::new(|ptr, bytes| {
                if bytes.len() != mem::size_of::<T>() {
                    return false;
                }
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
                }
                true
            }),
            networked: None,
        }
    }

    pub fn with_networked(mut self, networked: NetworkedFns) -> Self {
        self.networked = Some(networked);
        self
    }

    pub fn construct(&self, payload: &serde_json::Value, ptr: *mut u8) -> bool {
        (self.construct)(payload, ptr)
    }

    /// # Safety: `ptr` must point at a live instance of this entry's type.
    pub unsafe fn destruct(&self, ptr: *mut u8) {
        (self.destruct)(ptr)
    }

    /// # Safety: both pointers must point at live instances of this entry's type.
    pub unsafe fn swap(&self, a: *mut u8, b: *mut u8) {
        (self.swap)(a, b)
    }

    pub fn fully_serialize(&self, ptr: *const u8, out: &mut Vec<u8>) {
        (self.fully_serialize)(ptr, out)
    }

    pub fn apply_full_serialization(&self, ptr: *mut u8, bytes: &[u8]) -> bool {
        (self.apply_full_serialization)(ptr, bytes)
    }

    pub fn is_networked(&self) -> bool {
        self.networked.is_some()
    }
}

// ---------------------------------------------------------------------------
// Reflector
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ReflectorError {
    #[error("component type {0:?} is already registered")]
    DuplicateRegistration(ComponentType),
    #[error(transparent)]
    TypeName(#[from] ComponentTypeError),
}

/// The process-wide component type registry.
///
/// `register` is the only way a `ComponentType` becomes known; per §4.2
/// double registration is fatal (a `ReflectorError`, which callers are
/// expected to `.unwrap()`/propagate as a configuration error, never retry).
#[derive(Default)]
pub struct Reflector {
    names: ComponentTypeNames,
    entries: HashMap<ComponentType, ReflectionEntry>,
}

impl Reflector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reflection entry, deriving its `ComponentType` from
    /// `entry.name`. The entry's `component_type` field is overwritten with
    /// the derived value so callers can construct entries before knowing
    /// their final hash.
    pub fn register(&mut self, mut entry: ReflectionEntry) -> Result<ComponentType, ReflectorError> {
        let ty = self.names.register(&entry.name)?;
        if self.entries.contains_key(&ty) {
            return Err(ReflectorError::DuplicateRegistration(ty));
        }
        entry.component_type = ty;
        self.entries.insert(ty, entry);
        Ok(ty)
    }

    pub fn get(&self, ty: ComponentType) -> Option<&ReflectionEntry> {
        self.entries.get(&ty)
    }

    pub fn name_of(&self, ty: ComponentType) -> Option<&str> {
        self.names.name_of(ty)
    }

    pub fn type_of_name(&self, name: &str) -> Option<ComponentType> {
        let ty = ComponentType::of(name);
        self.entries.contains_key(&ty).then_some(ty)
    }

    /// Observable "is this type networked" query (§4.2,
    /// `find_transmission_functions`).
    pub fn find_transmission_functions(&self, ty: ComponentType) -> Option<&NetworkedFns> {
        self.entries.get(&ty).and_then(|e| e.networked.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReflectionEntry> {
        self.entries.values()
    }
}
