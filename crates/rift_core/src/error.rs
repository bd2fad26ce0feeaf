//! # Error Types
//!
//! Rejections are caller errors: the request is refused and nothing is
//! mutated. Configuration errors are raised once, at startup.

use std::path::PathBuf;
use thiserror::Error;

use crate::ids::{AbilityId, DimensionId, EffectTemplateId, EntityId, SessionId, TicketId};

/// A refused request. Returned to the originator; never halts a tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Ability is still cooling down.
    #[error("ability {ability:?} on cooldown for {remaining_ticks} more ticks")]
    OnCooldown {
        /// The ability that was invoked.
        ability: AbilityId,
        /// Ticks until it is ready.
        remaining_ticks: u64,
    },

    /// Caster cannot pay the resource cost.
    #[error("insufficient resources: need {required}, have {available}")]
    InsufficientResources {
        /// Energy required.
        required: u32,
        /// Energy available.
        available: u32,
    },

    /// Target set is illegal for the ability's pattern.
    #[error("invalid target {target:?}: {reason}")]
    InvalidTarget {
        /// Offending target, if a specific one.
        target: Option<EntityId>,
        /// Why the target set was refused.
        reason: &'static str,
    },

    /// Dimension reached its active-effect ceiling.
    #[error("effect capacity exceeded in {dimension}: ceiling {ceiling}, template {template:?}")]
    EffectCapacityExceeded {
        /// Dimension at its ceiling.
        dimension: DimensionId,
        /// Configured ceiling.
        ceiling: usize,
        /// Template that was refused.
        template: EffectTemplateId,
    },

    /// Matchmaking ticket waited longer than the timeout.
    #[error("matchmaking ticket {ticket:?} for session {session:?} timed out")]
    MatchmakingTimedOut {
        /// Expired ticket.
        ticket: TicketId,
        /// Session that requested it.
        session: SessionId,
    },

    /// Ability id is not in the catalog.
    #[error("unknown ability {0:?}")]
    UnknownAbility(AbilityId),

    /// Entity is not live anywhere in the simulation.
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),

    /// Dimension id is stale or was never issued.
    #[error("unknown dimension {0}")]
    UnknownDimension(DimensionId),

    /// Dimension is unstable; rift-causing abilities are denied.
    #[error("dimension {0} is throttled")]
    DimensionThrottled(DimensionId),

    /// Global cap on concurrently active dimensions reached.
    #[error("dimension cap reached: {cap}")]
    DimensionCapReached {
        /// Configured cap.
        cap: usize,
    },

    /// Dimension has no room for more entities.
    #[error("dimension {dimension} full: capacity {capacity}")]
    DimensionFull {
        /// Dimension that is full.
        dimension: DimensionId,
        /// Its entity capacity.
        capacity: usize,
    },
}

/// Result type for operations that may be refused.
pub type RejectionResult<T> = Result<T, Rejection>;

/// The simulation behind a submit handle has shut down.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("simulation is no longer accepting submissions")]
pub struct SubmitClosed;

/// Errors raised while loading configuration or content tables.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or schema error.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values parse but are inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Requested environment has no override table.
    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),
}

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;
