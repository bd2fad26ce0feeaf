//! # RIFT Core - Dimensional Combat Simulation
//!
//! Tick-based engine that advances many concurrent dimensions, resolves
//! ability and effect interactions between entities, tracks per-dimension
//! stability, and feeds a matchmaking layer.
//!
//! ## Architecture
//!
//! - **Scheduler**: fixed-rate simulation (60 Hz) and network (30 Hz) loops
//! - **Combat**: plan against a tick snapshot, commit in arrival order
//! - **Effects**: stacking, chaining with a depth guard, area propagation
//! - **Stability**: pure score in [0, 1] driving the dimension state machine
//! - **Manager**: generational arena of dimensions, collapse evacuation
//! - **Matchmaking**: FIFO admission with timeouts
//!
//! ## Determinism
//!
//! ```text
//! same config + same catalog + same ordered submissions
//!   => same resolutions, same events, same dimension digests
//! ```
//!
//! Dimensions tick in parallel but never share mutable state, and every
//! dimension draws randomness from its own seeded RNG.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rift_core::{Catalog, SimConfig, Simulation};
//!
//! let catalog = Catalog::load("data/catalog.toml".as_ref())?;
//! let mut sim = Simulation::new(SimConfig::default(), catalog.into())?;
//! let handle = sim.handle();            // clone into any thread
//! let mut deltas = Vec::new();
//! sim.run(std::time::Duration::from_secs(10), &mut deltas);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod ability;
pub mod arena;
pub mod catalog;
pub mod chaos;
pub mod combat;
pub mod config;
pub mod delta;
pub mod dimension;
pub mod effect;
pub mod entity;
pub mod error;
pub mod events;
pub mod ids;
pub mod manager;
pub mod matchmaking;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod stability;

// Re-exports for convenience
pub use ability::{Ability, AbilityKind, RiftSpec, TargetPattern};
pub use catalog::{Catalog, StatTable};
pub use combat::{AbilityInvocation, CombatOutcome, CombatResolver, Resolution};
pub use config::{load_layered, resolve_layered, Environment, ResolvedConfig, SimConfig};
pub use delta::{BroadcastSink, DeltaReader, DeltaWriter, StateDelta};
pub use dimension::{Dimension, DimensionKind, DimensionState};
pub use effect::{EffectInstance, EffectKind, EffectTemplate};
pub use entity::{Entity, EntityProfile, Position};
pub use error::{ConfigError, Rejection, SubmitClosed};
pub use events::{SimEvent, TickEvent};
pub use ids::{AbilityId, DimensionId, EffectTemplateId, EntityId, InvocationId, SessionId, Tick, TicketId};
pub use manager::DimensionManager;
pub use matchmaking::{MatchmakingOutcome, MatchmakingRequest};
pub use metrics::{SharedMetrics, SimMetrics};
pub use pipeline::{ApplyOutcome, EffectPipeline};
pub use scheduler::{Simulation, SubmitHandle, TickReport};
