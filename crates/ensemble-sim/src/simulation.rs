//! Boot a whole ensemble on the in-memory fabric and pump it to quiescence.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use ensemble_router::{
    build_with_span, ChannelId, EnsembleConfig, Rank, Router, RouterConfiguration, RouterEvent,
    RouterPhase,
};

use crate::cabling::{Cabling, Port, Slot};
use crate::error::{Result, SimError};
use crate::fabric::{lock_fabric, Fabric, SharedFabric, SimBackend, SimDelegate, SlotReport};

/// Tuning for a simulation run.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Upper bound on events delivered by one `run`.
    pub max_steps: usize,
    /// Keep every delivered event for later inspection.
    pub record_trace: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_steps: 1_000_000,
            record_trace: true,
        }
    }
}

/// One delivered event, in delivery order.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    pub step: usize,
    pub slot: Slot,
    pub rank: Rank,
    pub event: RouterEvent,
}

/// Start order with every slot, rotated left by `offset`.
pub fn rotated_order(slots: usize, offset: usize) -> Vec<Slot> {
    (0..slots).map(|i| (i + offset) % slots.max(1)).collect()
}

/// N routers on a shared in-memory interconnect.
pub struct Simulation {
    ensemble: EnsembleConfig,
    config: SimulationConfig,
    fabric: SharedFabric,
    routers: Vec<Box<dyn Router>>,
    trace: Vec<TraceEntry>,
    steps: usize,
}

impl Simulation {
    /// Every slot hosts the rank equal to its index.
    pub fn new(ensemble: EnsembleConfig) -> Result<Self> {
        let claims = (0..ensemble.size() as Rank).collect();
        Self::with_claimed_ranks(ensemble, claims)
    }

    /// Slot `s` runs a router configured as rank `claims[s]`. Claims may
    /// repeat, modelling a misdeployed ensemble.
    pub fn with_claimed_ranks(ensemble: EnsembleConfig, claims: Vec<Rank>) -> Result<Self> {
        let cabling = Cabling::for_ensemble(&ensemble)?;
        Self::assemble(ensemble, claims, cabling)
    }

    /// Every slot hosts its own rank, cabled by a custom plan.
    pub fn with_cabling(ensemble: EnsembleConfig, cabling: Cabling) -> Result<Self> {
        let claims = (0..ensemble.size() as Rank).collect();
        Self::assemble(ensemble, claims, cabling)
    }

    fn assemble(ensemble: EnsembleConfig, claims: Vec<Rank>, cabling: Cabling) -> Result<Self> {
        if claims.len() != ensemble.size() {
            return Err(SimError::ClaimCount {
                claims: claims.len(),
                size: ensemble.size(),
            });
        }
        if cabling.slots() != ensemble.size() {
            return Err(SimError::CablingMismatch {
                slots: cabling.slots(),
                size: ensemble.size(),
            });
        }
        let chassis = claims
            .iter()
            .enumerate()
            .map(|(slot, rank)| match ensemble.node(*rank) {
                Some(node) => node.chassis_id.clone(),
                None => format!("chassis-{}", slot / 4),
            })
            .collect();
        let fabric: SharedFabric = Arc::new(Mutex::new(Fabric::new(cabling, claims.clone(), chassis)));

        let routers = claims
            .iter()
            .enumerate()
            .map(|(slot, rank)| -> Result<Box<dyn Router>> {
                let config = RouterConfiguration::new(*rank, ensemble.clone())?;
                let router = build_with_span(
                    config,
                    Box::new(SimBackend::new(slot, Arc::clone(&fabric))),
                    Box::new(SimDelegate::new(slot, Arc::clone(&fabric))),
                    tracing::debug_span!("router", slot, rank = *rank),
                )?;
                Ok(router)
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(slots = routers.len(), "Simulation assembled");
        Ok(Self {
            ensemble,
            config: SimulationConfig::default(),
            fabric,
            routers,
            trace: Vec::new(),
            steps: 0,
        })
    }

    #[must_use]
    pub fn with_config(mut self, config: SimulationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn ensemble(&self) -> &EnsembleConfig {
        &self.ensemble
    }

    pub fn slots(&self) -> usize {
        self.routers.len()
    }

    /// Events delivered so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Call `start` on one slot's router. A refusal is recorded as that
    /// router's failure, not returned.
    pub fn start(&mut self, slot: Slot) -> Result<()> {
        let router = self.routers.get_mut(slot).ok_or(SimError::NoSuchSlot(slot))?;
        if let Err(e) = router.start() {
            warn!(slot, error = %e, "Router refused to start");
        }
        Ok(())
    }

    /// Start the slots in `order`, settling the fabric after each.
    pub fn boot(&mut self, order: &[Slot]) -> Result<usize> {
        let before = self.steps;
        for &slot in order {
            self.start(slot)?;
            self.run()?;
        }
        info!(
            steps = self.steps - before,
            ready = self.routers.iter().filter(|r| r.is_ready()).count(),
            slots = self.slots(),
            "Boot complete"
        );
        Ok(self.steps - before)
    }

    /// Deliver one queued event. Returns false when the queue is empty.
    pub fn step(&mut self) -> bool {
        let delivery = lock_fabric(&self.fabric).pop();
        let Some(delivery) = delivery else {
            return false;
        };
        self.steps += 1;
        let Some(router) = self.routers.get_mut(delivery.slot) else {
            return true;
        };
        if self.config.record_trace {
            self.trace.push(TraceEntry {
                step: self.steps,
                slot: delivery.slot,
                rank: router.rank(),
                event: delivery.event.clone(),
            });
        }
        match delivery.event.apply(router.as_mut()) {
            Ok(()) => {}
            Err(e) if e.is_rejection() => trace!(slot = delivery.slot, "Event rejected"),
            Err(e) => debug!(slot = delivery.slot, error = %e, "Event failed the router"),
        }
        true
    }

    /// Deliver events until the queue drains.
    pub fn run(&mut self) -> Result<usize> {
        let mut delivered = 0;
        while self.step() {
            delivered += 1;
            if delivered > self.config.max_steps {
                return Err(SimError::Diverged {
                    steps: self.config.max_steps,
                });
            }
        }
        Ok(delivered)
    }

    /// Queue an extra event for a slot, as a misbehaving backend might.
    pub fn inject(&mut self, slot: Slot, event: RouterEvent) -> Result<()> {
        if slot >= self.slots() {
            return Err(SimError::NoSuchSlot(slot));
        }
        lock_fabric(&self.fabric).push(slot, event);
        Ok(())
    }

    /// Pull a cable out; both ends see it go dark.
    pub fn unplug(&mut self, slot: Slot, channel: ChannelId) -> Result<()> {
        if lock_fabric(&self.fabric).unplug(Port { slot, channel }, true) {
            Ok(())
        } else {
            Err(SimError::NoCable { slot, channel })
        }
    }

    pub fn router(&self, slot: Slot) -> Option<&dyn Router> {
        self.routers.get(slot).map(|r| r.as_ref())
    }

    pub fn routers(&self) -> impl Iterator<Item = &dyn Router> {
        self.routers.iter().map(|r| r.as_ref())
    }

    pub fn phases(&self) -> Vec<RouterPhase> {
        self.routers.iter().map(|r| r.phase().clone()).collect()
    }

    pub fn all_ready(&self) -> bool {
        self.routers.iter().all(|r| r.is_ready())
    }

    /// What the slot's backend and delegate saw.
    pub fn report(&self, slot: Slot) -> Option<SlotReport> {
        lock_fabric(&self.fabric).report(slot).cloned()
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    /// Write `transfer-map-<rank>.txt` for every ready router.
    pub fn write_transfer_maps(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::new();
        for router in self.routers.iter().filter(|r| r.is_ready()) {
            let path = dir.join(format!("transfer-map-{}.txt", router.rank()));
            std::fs::write(&path, router.get_cio_transfer_map().export())?;
            written.push(path);
        }
        Ok(written)
    }

    /// Write the delivered-event trace as JSON.
    pub fn write_trace(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, &self.trace)?;
        writer.flush()?;
        Ok(())
    }
}
