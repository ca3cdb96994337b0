//! The top-level runtime: wires the entity manager, scheduler, asset cache,
//! and replication pipeline into one per-tick driver.
//!
//! Grounded on the teacher crate's `TickLoop` for the overall "advance one
//! fixed step, then do the bookkeeping around it" shape; unlike `TickLoop`
//! this crate carries no determinism-checkpoint/replay machinery, since that
//! tooling belongs to the teacher's excluded lock-step replay non-goal, not
//! to this workspace's scope.

use ecs_assets::AssetCache;
use ecs_core::prelude::{EntityManager, Reflector};
use ecs_replication::prelude::*;
use ecs_scheduler::{Scheduler, SchedulerError, System, TickDiagnostics};

/// Implementation-defined constants the distilled specification leaves open,
/// analogous to the teacher's `TickConfig`.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Fixed simulation step, in seconds.
    pub fixed_dt: f64,
    /// How many ticks elapse between asset cache sweeps.
    pub asset_sweep_every_n_ticks: u32,
}

impl Default for RuntimeConfig {
    /// 60 Hz simulation, one asset sweep per tick.
    fn default() -> Self {
        Self { fixed_dt: 1.0 / 60.0, asset_sweep_every_n_ticks: 1 }
    }
}

/// Ties together every replicated-ECS concern behind one per-tick API: run
/// systems, optionally sweep assets, and snapshot/transmit world state.
pub struct Runtime {
    pub manager: EntityManager,
    scheduler: Scheduler,
    pub assets: AssetCache,
    history: FrameHistory,
    channels: ClientChannels,
    tick_index: u64,
    config: RuntimeConfig,
}

impl Runtime {
    pub fn new(reflector: Reflector, assets: AssetCache, config: RuntimeConfig) -> Self {
        Self {
            manager: EntityManager::new(reflector),
            scheduler: Scheduler::new(),
            assets,
            history: FrameHistory::new(),
            channels: ClientChannels::new(),
            tick_index: 0,
            config,
        }
    }

    pub fn register_system(&mut self, system: Box<dyn System>) -> Result<(), SchedulerError> {
        self.scheduler.register(system)
    }

    pub fn tick_index(&self) -> u64 {
        self.tick_index
    }

    /// Run one fixed simulation step, then sweep the asset cache on the
    /// configured cadence.
    pub fn tick(&mut self) -> TickDiagnostics {
        let diagnostics = self.scheduler.tick(&mut self.manager, self.config.fixed_dt);
        self.tick_index += 1;
        if self.config.asset_sweep_every_n_ticks > 0
            && self.tick_index % self.config.asset_sweep_every_n_ticks as u64 == 0
        {
            self.assets.update();
        }
        diagnostics
    }

    /// Flatten the current world into a snapshot, file it in this tick's
    /// frame history slot, and return the frame index it was stored under.
    pub fn capture_snapshot(&mut self) -> u64 {
        let snapshot = build_snapshot(&self.manager);
        let frame_index = self.tick_index;
        self.history
            .receive_full(frame_index, snapshot)
            .expect("a freshly captured frame index is always within the retained window");
        frame_index
    }

    pub fn notify_of_frame_acknowledgement(&mut self, client: ClientId, frame_index: u64) {
        self.channels.notify_of_frame_acknowledgement(client, frame_index);
    }

    /// Build the bytes to send `client` for `frame_index` (already captured
    /// via [`Self::capture_snapshot`]), choosing a delta against the
    /// client's last acknowledged frame when possible, otherwise a full
    /// frame.
    pub fn transmit_frame_to(&self, client: ClientId, frame_index: u64) -> anyhow::Result<Vec<u8>> {
        let snapshot = self
            .history
            .get(frame_index)
            .ok_or_else(|| anyhow::anyhow!("frame {frame_index} is not present in this runtime's history"))?;
        let bytes = self
            .channels
            .transmit_frame(client, frame_index, &self.history, snapshot, self.manager.reflector())?;
        Ok(bytes)
    }
}

/// Install a `tracing-subscriber` fmt layer honoring `RUST_LOG`, matching
/// the teacher's binary-entrypoint logging setup. Call once, at process
/// start.
pub fn install_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecs_core::prelude::*;
    use ecs_scheduler::DeferredBag;

    fn runtime_with_counter_component() -> (Runtime, ComponentType) {
        let mut reflector = Reflector::new();
        let ty = reflector
            .register(ReflectionEntry::normal::<u32, _, _, _>(
                ComponentType::from_raw(0),
                "Counter",
                |v| v.as_u64().map(|x| x as u32),
                |v, out| out.extend_from_slice(&v.to_le_bytes()),
                |v, bytes| {
                    *v = u32::from_le_bytes(bytes.try_into().unwrap());
                    true
                },
            ))
            .unwrap();
        // No test here actually requests an asset, so the cache never spawns
        // a background task; a handle to a runtime that's about to go out of
        // scope is fine as long as nothing tries to use it afterward.
        let tokio_rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let assets = AssetCache::new(tokio_rt.handle().clone());
        (Runtime::new(reflector, assets, RuntimeConfig::default()), ty)
    }

    struct IncrementSystem {
        ty: ComponentType,
    }

    impl System for IncrementSystem {
        fn declaration(&self) -> ecs_scheduler::SystemDeclaration {
            ecs_scheduler::SystemDeclaration {
                name: "increment".to_string(),
                immutable_inputs: vec![],
                mutable_inputs: vec![self.ty],
                mutates_entity_records: false,
            }
        }

        fn run(&self, _groups: &GroupIndex, _dt: f64, _deferred: &mut DeferredBag) {}
    }

    #[test]
    fn tick_advances_the_frame_counter() {
        let (mut runtime, ty) = runtime_with_counter_component();
        runtime.register_system(Box::new(IncrementSystem { ty })).unwrap();
        assert_eq!(runtime.tick_index(), 0);
        runtime.tick();
        assert_eq!(runtime.tick_index(), 1);
    }

    #[test]
    fn captured_snapshot_is_retrievable_and_transmittable_as_a_full_frame() {
        let (mut runtime, ty) = runtime_with_counter_component();
        runtime
            .manager
            .create_entity(0, EntityFlags::NETWORKED, vec![ComponentSpec { ty, payload: serde_json::json!(7) }], None)
            .unwrap();
        let frame_index = runtime.capture_snapshot();
        let bytes = runtime.transmit_frame_to(ClientId(1), frame_index).unwrap();
        assert_eq!(u32::from_be_bytes(bytes[0..4].try_into().unwrap()), FULL_MARKER);
    }

    #[test]
    fn acknowledged_frame_yields_a_delta_on_the_next_transmission() {
        let (mut runtime, ty) = runtime_with_counter_component();
        runtime
            .manager
            .create_entity(0, EntityFlags::NETWORKED, vec![ComponentSpec { ty, payload: serde_json::json!(1) }], None)
            .unwrap();
        let first = runtime.capture_snapshot();
        runtime.notify_of_frame_acknowledgement(ClientId(1), first);

        runtime.tick();
        let second = runtime.capture_snapshot();
        let bytes = runtime.transmit_frame_to(ClientId(1), second).unwrap();
        assert_eq!(u32::from_be_bytes(bytes[0..4].try_into().unwrap()), DELTA_MARKER);
    }
}
