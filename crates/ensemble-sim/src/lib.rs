//! Ensemble Sim - In-Memory Interconnect for Ensemble Routers
//!
//! Boots every node of an ensemble in one process, cabled the way the real
//! hardware is, and pumps backend events through a single FIFO until the
//! routers settle.
//!
//! # Architecture
//!
//! - **Cabling**: physical plan per topology, with per-slot port rotation
//! - **Fabric**: turns backend commands into events for the affected slots
//! - **Simulation**: owns the routers, boots them in a chosen order, records
//!   a trace and a per-slot report
//!
//! # Usage
//!
//! ```ignore
//! let mut sim = Simulation::new(EnsembleConfig::synthetic(16))?;
//! sim.boot(&rotated_order(16, 3))?;
//! assert!(sim.all_ready());
//! sim.write_transfer_maps(Path::new("out"))?;
//! ```

pub mod cabling;
pub mod error;
mod fabric;
pub mod simulation;

pub use cabling::{Cable, Cabling, Port, Slot};
pub use error::{Result, SimError};
pub use fabric::{Delivery, SimBackend, SimDelegate, SlotReport};
pub use simulation::{rotated_order, Simulation, SimulationConfig, TraceEntry};
