//! The system scheduler (C5): bands systems into conflict-free groups,
//! runs each band concurrently, then applies deferred structural mutations
//! serially between bands.
//!
//! Grounded on the teacher crate's `TickLoop` for the overall "run systems,
//! then apply queued mutations, then advance" shape, generalized from a
//! single fixed execution order into automatically computed concurrency
//! bands (§4.5) and from a `CommandBuffer` into per-system [`DeferredBag`]s
//! that are merged in registration order before being applied.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use ecs_core::prelude::*;
use rayon::prelude::*;

pub mod deferred;

pub use deferred::{DeferredBag, DeferredOp};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("a system named '{0}' is already registered")]
    DuplicateSystemName(String),
}

/// What a system reads and writes, used purely for band placement.
pub struct SystemDeclaration {
    pub name: String,
    pub immutable_inputs: Vec<ComponentType>,
    pub mutable_inputs: Vec<ComponentType>,
    /// True if this system posts structural mutations (create/delete/
    /// reparent) via its `DeferredBag`. Per §4.5, a system that mutates
    /// entity records this way can never share a band with any other system.
    pub mutates_entity_records: bool,
}

/// A schedulable unit: declares its inputs and runs against a resolved
/// [`GroupIndex`], posting structural changes to a [`DeferredBag`] instead of
/// mutating the entity manager directly.
pub trait System: Send + Sync {
    fn declaration(&self) -> SystemDeclaration;
    fn run(&self, groups: &GroupIndex, dt: f64, deferred: &mut DeferredBag);
}

#[derive(Debug, Clone, Default)]
pub struct TickDiagnostics {
    pub system_times: Vec<(String, Duration)>,
    pub band_times: Vec<Duration>,
    pub command_apply_time: Duration,
    pub total_time: Duration,
}

struct RegisteredSystem {
    declaration: SystemDeclaration,
    system: Box<dyn System>,
}

fn conflicts(a: &SystemDeclaration, b: &SystemDeclaration) -> bool {
    if a.mutates_entity_records || b.mutates_entity_records {
        return true;
    }
    let b_all: HashSet<ComponentType> = b
        .immutable_inputs
        .iter()
        .chain(b.mutable_inputs.iter())
        .copied()
        .collect();
    let a_all: HashSet<ComponentType> = a
        .immutable_inputs
        .iter()
        .chain(a.mutable_inputs.iter())
        .copied()
        .collect();
    a.mutable_inputs.iter().any(|t| b_all.contains(t))
        || b.mutable_inputs.iter().any(|t| a_all.contains(t))
}

/// Runs registered systems tick by tick, banding them automatically and
/// applying their deferred structural mutations between bands.
pub struct Scheduler {
    systems: Vec<RegisteredSystem>,
    groups: Vec<GroupIndex>,
    bands: Vec<Vec<usize>>,
    groups_dirty: bool,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            systems: Vec::new(),
            groups: Vec::new(),
            bands: Vec::new(),
            groups_dirty: true,
        }
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// Register a system, placing it in the first band whose existing
    /// members all have disjoint read/write sets with it (or a new band if
    /// none admits it). Per §4.3, a duplicate system name is fatal.
    pub fn register(&mut self, system: Box<dyn System>) -> Result<(), SchedulerError> {
        let declaration = system.declaration();
        if self.systems.iter().any(|s| s.declaration.name == declaration.name) {
            return Err(SchedulerError::DuplicateSystemName(declaration.name));
        }

        let index = self.systems.len();
        let group = GroupIndex::new(declaration.immutable_inputs.clone(), declaration.mutable_inputs.clone());

        let mut placed = false;
        for band in &mut self.bands {
            let admits = !declaration.mutates_entity_records
                && band
                    .iter()
                    .all(|&member| !conflicts(&self.systems[member].declaration, &declaration));
            if admits {
                band.push(index);
                placed = true;
                break;
            }
        }
        if !placed {
            self.bands.push(vec![index]);
        }

        self.systems.push(RegisteredSystem { declaration, system });
        self.groups.push(group);
        self.groups_dirty = true;
        Ok(())
    }

    fn run_system(&self, index: usize, dt: f64) -> (String, DeferredBag, Duration) {
        let started = Instant::now();
        let mut bag = DeferredBag::new();
        self.systems[index]
            .system
            .run(&self.groups[index], dt, &mut bag);
        (self.systems[index].declaration.name.clone(), bag, started.elapsed())
    }

    fn rebuild_all_groups(&mut self, manager: &EntityManager) {
        for group in &mut self.groups {
            group.rebuild(manager);
        }
        self.groups_dirty = false;
    }

    /// Run one full tick: every band in registration order, each band's
    /// systems concurrently (or inline if the band has exactly one system,
    /// per §4.5's "single-system bands bypass the concurrent executor"),
    /// then that band's deferred mutations applied serially in
    /// system-registration order before the next band's group indices are
    /// rebuilt.
    pub fn tick(&mut self, manager: &mut EntityManager, dt: f64) -> TickDiagnostics {
        let tick_started = Instant::now();
        let mut diagnostics = TickDiagnostics::default();

        if self.groups_dirty {
            self.rebuild_all_groups(manager);
        }

        let bands = self.bands.clone();
        for band in bands {
            let band_started = Instant::now();
            let results: Vec<(String, DeferredBag, Duration)> = if band.len() == 1 {
                vec![self.run_system(band[0], dt)]
            } else {
                band.par_iter().map(|&index| self.run_system(index, dt)).collect()
            };
            diagnostics.band_times.push(band_started.elapsed());

            let apply_started = Instant::now();
            for (name, bag, elapsed) in results {
                diagnostics.system_times.push((name, elapsed));
                for op in bag.into_ops() {
                    op.apply(manager);
                }
            }
            diagnostics.command_apply_time += apply_started.elapsed();

            // Conservatively rebuild every group between bands: a deferred
            // add/remove can invalidate any group's pointers, and the
            // declared-inputs sets don't give us a cheap way to tell which
            // groups were actually touched without also tracking per-type
            // dirty bits, which this scheduler doesn't do.
            self.rebuild_all_groups(manager);
        }

        diagnostics.total_time = tick_started.elapsed();
        diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingSystem {
        name: &'static str,
        immutable_inputs: Vec<ComponentType>,
        mutable_inputs: Vec<ComponentType>,
        calls: Arc<AtomicU32>,
    }

    impl System for CountingSystem {
        fn declaration(&self) -> SystemDeclaration {
            SystemDeclaration {
                name: self.name.to_string(),
                immutable_inputs: self.immutable_inputs.clone(),
                mutable_inputs: self.mutable_inputs.clone(),
                mutates_entity_records: false,
            }
        }

        fn run(&self, _groups: &GroupIndex, _dt: f64, _deferred: &mut DeferredBag) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn duplicate_system_name_is_rejected() {
        let mut scheduler = Scheduler::new();
        let calls = Arc::new(AtomicU32::new(0));
        scheduler
            .register(Box::new(CountingSystem {
                name: "physics",
                immutable_inputs: vec![],
                mutable_inputs: vec![],
                calls: calls.clone(),
            }))
            .unwrap();
        let err = scheduler.register(Box::new(CountingSystem {
            name: "physics",
            immutable_inputs: vec![],
            mutable_inputs: vec![],
            calls,
        }));
        assert!(matches!(err, Err(SchedulerError::DuplicateSystemName(_))));
    }

    #[test]
    fn disjoint_systems_share_a_band() {
        let mut scheduler = Scheduler::new();
        let a = ComponentType::of("A");
        let b = ComponentType::of("B");
        scheduler
            .register(Box::new(CountingSystem {
                name: "writes-a",
                immutable_inputs: vec![],
                mutable_inputs: vec![a],
                calls: Arc::new(AtomicU32::new(0)),
            }))
            .unwrap();
        scheduler
            .register(Box::new(CountingSystem {
                name: "writes-b",
                immutable_inputs: vec![],
                mutable_inputs: vec![b],
                calls: Arc::new(AtomicU32::new(0)),
            }))
            .unwrap();
        assert_eq!(scheduler.band_count(), 1);
    }

    #[test]
    fn conflicting_systems_land_in_separate_bands() {
        let mut scheduler = Scheduler::new();
        let a = ComponentType::of("A");
        scheduler
            .register(Box::new(CountingSystem {
                name: "writes-a",
                immutable_inputs: vec![],
                mutable_inputs: vec![a],
                calls: Arc::new(AtomicU32::new(0)),
            }))
            .unwrap();
        scheduler
            .register(Box::new(CountingSystem {
                name: "reads-a",
                immutable_inputs: vec![a],
                mutable_inputs: vec![],
                calls: Arc::new(AtomicU32::new(0)),
            }))
            .unwrap();
        assert_eq!(scheduler.band_count(), 2);
    }

    #[test]
    fn tick_runs_every_registered_system_once() {
        let reflector = Reflector::new();
        let mut manager = EntityManager::new(reflector);
        let mut scheduler = Scheduler::new();
        let calls = Arc::new(AtomicU32::new(0));
        scheduler
            .register(Box::new(CountingSystem {
                name: "noop",
                immutable_inputs: vec![],
                mutable_inputs: vec![],
                calls: calls.clone(),
            }))
            .unwrap();
        scheduler.tick(&mut manager, 1.0 / 60.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
