//! # Simulation Configuration
//!
//! All tuning knobs consumed by the core. Loaded once at startup from TOML,
//! read-only afterwards.
//!
//! ## Environment Layering
//!
//! ```toml
//! [stability]
//! warning = 0.4
//!
//! [environments.qa.stability]
//! warning = 0.45          # overrides the global value for qa
//!
//! [environments.qa.services.simulation.stability]
//! warning = 0.5           # innermost value, wins over both
//! ```
//!
//! The innermost value is authoritative. A leaf set at more than one level
//! with different values is recorded as a [`ConfigConflict`] and logged.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::dimension::DimensionKind;
use crate::error::{ConfigError, ConfigResult};

/// Estimated cost of one chain link, used to derive the default chain depth
/// from the chain execution budget.
pub const CHAIN_LINK_COST_MS: u32 = 5;

/// Upper bound on the derived chain depth.
pub const MAX_DERIVED_CHAIN_DEPTH: u32 = 16;

/// Tick rates and per-tick work budgets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Simulation tick rate in Hz.
    pub simulation_hz: u32,
    /// Network (delta broadcast) tick rate in Hz.
    pub network_hz: u32,
    /// Maximum entity effect-timer updates per dimension per tick.
    /// Work beyond this is carried to the next tick.
    pub max_effect_updates_per_tick: usize,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            simulation_hz: 60,
            network_hz: 30,
            max_effect_updates_per_tick: usize::MAX,
        }
    }
}

/// Capacity limits for dimensions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DimensionLimits {
    /// Global cap on concurrently active dimensions (fallback included).
    pub max_concurrent: usize,
    /// Entity capacity of a regular dimension.
    pub entity_capacity: usize,
    /// Active effect instance ceiling per dimension.
    pub max_concurrent_effects: usize,
    /// Entity capacity of the fallback dimension.
    pub fallback_capacity: usize,
    /// Kind of the fallback dimension.
    pub fallback_kind: DimensionKind,
}

impl Default for DimensionLimits {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            entity_capacity: 64,
            max_concurrent_effects: 512,
            fallback_capacity: 4096,
            fallback_kind: DimensionKind::Physical,
        }
    }
}

/// Stability thresholds and model weights.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Below this a dimension is `Unstable`.
    pub warning: f32,
    /// At or below this a dimension starts collapsing.
    pub critical: f32,
    /// At or above this a collapsing dimension recovers.
    pub recovery: f32,
    /// Grace window before a collapsing dimension is evacuated. Counted in
    /// whole ticks from the tick after the dimension enters `Collapsing`.
    pub collapse_countdown_ms: u64,
    /// Weight of active-effect density.
    pub effect_density_weight: f32,
    /// Weight of entity load.
    pub entity_load_weight: f32,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            warning: 0.4,
            critical: 0.2,
            recovery: 0.3,
            collapse_countdown_ms: 5_000,
            effect_density_weight: 0.2,
            entity_load_weight: 0.1,
        }
    }
}

/// Matchmaking knobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingConfig {
    /// Ticket wait timeout.
    pub timeout_ms: u64,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

/// Ability execution budgets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbilityMetrics {
    /// Time budget for one full effect chain.
    pub chain_execution_ms: u32,
    /// Explicit chain depth limit. Derived from the budget when unset.
    pub max_chain_depth: Option<u32>,
}

impl Default for AbilityMetrics {
    fn default() -> Self {
        Self {
            chain_execution_ms: 50,
            max_chain_depth: None,
        }
    }
}

/// Combat formula knobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombatConfig {
    /// Critical hit chance in percent.
    pub crit_chance_pct: u8,
    /// Critical damage multiplier in percent (150 = 1.5x).
    pub crit_multiplier_pct: u32,
}

impl Default for CombatConfig {
    fn default() -> Self {
        Self {
            crit_chance_pct: 10,
            crit_multiplier_pct: 150,
        }
    }
}

/// Worker pool and cross-dimension sync budget.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Effect-processing thread count. 1 runs dimensions inline.
    pub effect_threads: usize,
    /// Cross-dimension sync budget per tick.
    pub sync_delay_budget_ms: u32,
    /// Migrations that fit in one millisecond of sync budget.
    pub migrations_per_ms: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            effect_threads: 4,
            sync_delay_budget_ms: 2,
            migrations_per_ms: 64,
        }
    }
}

/// Chaos fault injection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosConfig {
    /// Master switch.
    pub enabled: bool,
    /// Seed of the injector RNG.
    pub seed: u64,
    /// Per-tick chance of a rift storm (0.0-1.0).
    pub rift_storm_chance: f32,
    /// Rifts opened by one storm.
    pub rift_storm_size: u32,
    /// Stability impact of each storm rift.
    pub rift_storm_impact: f32,
    /// Per-tick chance of an injected stall.
    pub stall_chance: f32,
    /// Length of an injected stall.
    pub stall_ms: u64,
    /// Per-tick chance that the migration budget is halved.
    pub sync_squeeze_chance: f32,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            seed: 0xC4A0_5EED,
            rift_storm_chance: 0.01,
            rift_storm_size: 3,
            rift_storm_impact: 0.05,
            stall_chance: 0.005,
            stall_ms: 20,
            sync_squeeze_chance: 0.05,
        }
    }
}

/// Complete simulation configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// World seed. Every per-dimension RNG derives from it.
    pub seed: u64,
    /// Tick rates.
    pub tick: TickConfig,
    /// Dimension capacities.
    pub dimensions: DimensionLimits,
    /// Stability model.
    pub stability: StabilityConfig,
    /// Matchmaking.
    pub matchmaking: MatchmakingConfig,
    /// Ability budgets.
    pub ability_metrics: AbilityMetrics,
    /// Combat formulas.
    pub combat: CombatConfig,
    /// Worker pool.
    pub workers: WorkerConfig,
    /// Chaos injection.
    pub chaos: ChaosConfig,
}

impl SimConfig {
    /// Parses a flat (non-layered) TOML document and validates it.
    ///
    /// # Errors
    ///
    /// Returns a parse error or an [`ConfigError::Invalid`] for inconsistent values.
    pub fn from_toml_str(doc: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Converts a duration in milliseconds to simulation ticks, rounding up.
    #[must_use]
    pub fn ticks_for_ms(&self, ms: u64) -> u64 {
        let hz = u64::from(self.tick.simulation_hz.max(1));
        ms.saturating_mul(hz).div_ceil(1000)
    }

    /// Collapse countdown in ticks.
    #[must_use]
    pub fn collapse_countdown_ticks(&self) -> u64 {
        self.ticks_for_ms(self.stability.collapse_countdown_ms).max(1)
    }

    /// Matchmaking timeout in ticks.
    #[must_use]
    pub fn matchmaking_timeout_ticks(&self) -> u64 {
        self.ticks_for_ms(self.matchmaking.timeout_ms).max(1)
    }

    /// Maximum effect chain depth.
    #[must_use]
    pub fn max_chain_depth(&self) -> u32 {
        self.ability_metrics.max_chain_depth.unwrap_or_else(|| {
            (self.ability_metrics.chain_execution_ms / CHAIN_LINK_COST_MS)
                .clamp(1, MAX_DERIVED_CHAIN_DEPTH)
        })
    }

    /// Migrations allowed per tick by the sync-delay budget.
    #[must_use]
    pub fn migrations_per_tick(&self) -> usize {
        let budget = self.workers.sync_delay_budget_ms as usize * self.workers.migrations_per_ms as usize;
        budget.max(1)
    }

    /// Duration of one simulation tick.
    #[must_use]
    pub fn simulation_tick(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.tick.simulation_hz.max(1)))
    }

    /// Duration of one network tick.
    #[must_use]
    pub fn network_tick(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.tick.network_hz.max(1)))
    }

    /// Checks that thresholds, rates and capacities are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> ConfigResult<()> {
        let s = &self.stability;
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.tick.simulation_hz == 0 || self.tick.network_hz == 0 {
            return invalid("tick rates must be non-zero".into());
        }
        if self.tick.max_effect_updates_per_tick == 0 {
            return invalid("max_effect_updates_per_tick must be non-zero".into());
        }
        for (name, v) in [("warning", s.warning), ("critical", s.critical), ("recovery", s.recovery)] {
            if !(0.0..=1.0).contains(&v) {
                return invalid(format!("stability.{name} = {v} outside [0, 1]"));
            }
        }
        if s.critical >= s.warning {
            return invalid(format!("stability.critical ({}) must be below warning ({})", s.critical, s.warning));
        }
        if s.critical >= s.recovery {
            return invalid(format!("stability.critical ({}) must be below recovery ({})", s.critical, s.recovery));
        }
        if self.dimensions.max_concurrent == 0 {
            return invalid("dimensions.max_concurrent must be non-zero".into());
        }
        if self.dimensions.entity_capacity == 0 || self.dimensions.fallback_capacity == 0 {
            return invalid("dimension capacities must be non-zero".into());
        }
        if self.dimensions.max_concurrent_effects == 0 {
            return invalid("dimensions.max_concurrent_effects must be non-zero".into());
        }
        if self.workers.effect_threads == 0 {
            return invalid("workers.effect_threads must be non-zero".into());
        }
        if self.ability_metrics.max_chain_depth == Some(0) {
            return invalid("ability_metrics.max_chain_depth must be non-zero".into());
        }
        Ok(())
    }
}

// ============================================================================
// ENVIRONMENT LAYERING
// ============================================================================

/// Deployment environment selecting an override layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Environment {
    /// Local development.
    Dev,
    /// Staging.
    Staging,
    /// QA / chaos testing.
    Qa,
    /// Production.
    Prod,
}

impl Environment {
    /// Name of the environment's override table.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Staging => "staging",
            Self::Qa => "qa",
            Self::Prod => "prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Dev),
            "staging" => Ok(Self::Staging),
            "qa" => Ok(Self::Qa),
            "prod" | "production" => Ok(Self::Prod),
            other => Err(ConfigError::UnknownEnvironment(other.to_string())),
        }
    }
}

/// A leaf value set at more than one layer with different values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigConflict {
    /// Dotted key path, e.g. `stability.warning`.
    pub key: String,
    /// Layer whose value won.
    pub winning_layer: String,
    /// Value that was overridden.
    pub overridden: String,
    /// Value that won.
    pub value: String,
}

/// Result of resolving a layered document for one environment.
#[derive(Clone, Debug)]
pub struct ResolvedConfig {
    /// The effective configuration.
    pub config: SimConfig,
    /// Environment that was resolved.
    pub environment: Environment,
    /// Ambiguous keys (set at several layers with different values).
    pub conflicts: Vec<ConfigConflict>,
}

/// Resolves a layered TOML document for `environment`.
///
/// Layers, outermost first: global sections, `[environments.<env>]`,
/// `[environments.<env>.services.simulation]`.
///
/// # Errors
///
/// Returns a parse error, [`ConfigError::UnknownEnvironment`] if the document
/// has an `environments` table without an entry for `environment`, or
/// [`ConfigError::Invalid`] if the merged configuration is inconsistent.
pub fn resolve_layered(doc: &str, environment: Environment) -> ConfigResult<ResolvedConfig> {
    let mut base: toml::Table = doc.parse()?;
    let mut conflicts = Vec::new();

    if let Some(envs) = base.remove("environments") {
        let toml::Value::Table(mut envs) = envs else {
            return Err(ConfigError::Invalid("`environments` must be a table".into()));
        };
        let Some(env_value) = envs.remove(environment.as_str()) else {
            return Err(ConfigError::UnknownEnvironment(environment.as_str().to_string()));
        };
        let toml::Value::Table(mut env_table) = env_value else {
            return Err(ConfigError::Invalid(format!("environments.{environment} must be a table")));
        };

        let service = env_table
            .remove("services")
            .and_then(|services| match services {
                toml::Value::Table(mut t) => t.remove("simulation"),
                _ => None,
            });

        let env_layer = format!("environments.{environment}");
        merge_layer(&mut base, env_table, "", &env_layer, &mut conflicts);

        if let Some(toml::Value::Table(service_table)) = service {
            let service_layer = format!("environments.{environment}.services.simulation");
            merge_layer(&mut base, service_table, "", &service_layer, &mut conflicts);
        }
    }

    for conflict in &conflicts {
        tracing::warn!(
            key = %conflict.key,
            layer = %conflict.winning_layer,
            overridden = %conflict.overridden,
            value = %conflict.value,
            "config key set at multiple layers; innermost value wins"
        );
    }

    let config: SimConfig = toml::Value::Table(base).try_into()?;
    config.validate()?;

    Ok(ResolvedConfig { config, environment, conflicts })
}

/// Loads and resolves a layered config file.
///
/// # Errors
///
/// See [`resolve_layered`]; additionally [`ConfigError::Io`] if the file
/// cannot be read.
pub fn load_layered(path: &Path, environment: Environment) -> ConfigResult<ResolvedConfig> {
    let doc = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    resolve_layered(&doc, environment)
}

/// Deep-merges `src` over `dst`, recording differing leaves.
fn merge_layer(
    dst: &mut toml::Table,
    src: toml::Table,
    prefix: &str,
    layer: &str,
    conflicts: &mut Vec<ConfigConflict>,
) {
    for (key, value) in src {
        let path = if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
        match (dst.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_layer(existing, incoming, &path, layer, conflicts);
            }
            (Some(existing), incoming) => {
                if *existing != incoming {
                    conflicts.push(ConfigConflict {
                        key: path,
                        winning_layer: layer.to_string(),
                        overridden: existing.to_string(),
                        value: incoming.to_string(),
                    });
                }
                *existing = incoming;
            }
            (None, incoming) => {
                dst.insert(key, incoming);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SimConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick.simulation_hz, 60);
        assert!((config.stability.critical - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_ms_to_ticks_rounds_up() {
        let config = SimConfig::default();
        assert_eq!(config.ticks_for_ms(1000), 60);
        assert_eq!(config.ticks_for_ms(1), 1);
        assert_eq!(config.ticks_for_ms(0), 0);
        assert_eq!(config.collapse_countdown_ticks(), 300);
    }

    #[test]
    fn test_huge_durations_saturate() {
        let mut config = SimConfig::default();
        config.matchmaking.timeout_ms = u64::MAX;
        config.stability.collapse_countdown_ms = u64::MAX;
        assert_eq!(config.matchmaking_timeout_ticks(), u64::MAX / 1000 + 1);
        assert_eq!(config.collapse_countdown_ticks(), u64::MAX / 1000 + 1);
    }

    #[test]
    fn test_chain_depth_derived_from_budget() {
        let mut config = SimConfig::default();
        assert_eq!(config.max_chain_depth(), 10);

        config.ability_metrics.chain_execution_ms = 1;
        assert_eq!(config.max_chain_depth(), 1);

        config.ability_metrics.chain_execution_ms = 10_000;
        assert_eq!(config.max_chain_depth(), MAX_DERIVED_CHAIN_DEPTH);

        config.ability_metrics.max_chain_depth = Some(3);
        assert_eq!(config.max_chain_depth(), 3);
    }

    #[test]
    fn test_inconsistent_thresholds_rejected() {
        let doc = r"
            [stability]
            warning = 0.1
            critical = 0.2
        ";
        let err = SimConfig::from_toml_str(doc).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config = SimConfig::from_toml_str("seed = 7\n[tick]\nnetwork_hz = 20\n").unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.tick.network_hz, 20);
        assert_eq!(config.tick.simulation_hz, 60);
    }

    #[test]
    fn test_innermost_layer_wins_and_conflicts_flagged() {
        let doc = r"
            [stability]
            warning = 0.4
            critical = 0.2

            [environments.qa.stability]
            warning = 0.45

            [environments.qa.services.simulation.stability]
            warning = 0.5

            [environments.prod]
            seed = 1
        ";

        let resolved = resolve_layered(doc, Environment::Qa).unwrap();
        assert!((resolved.config.stability.warning - 0.5).abs() < f32::EPSILON);
        assert!((resolved.config.stability.critical - 0.2).abs() < f32::EPSILON);
        assert_eq!(resolved.conflicts.len(), 2);
        assert!(resolved.conflicts.iter().all(|c| c.key == "stability.warning"));
        assert_eq!(
            resolved.conflicts[1].winning_layer,
            "environments.qa.services.simulation"
        );

        let prod = resolve_layered(doc, Environment::Prod).unwrap();
        assert_eq!(prod.config.seed, 1);
        assert!(prod.conflicts.is_empty());
    }

    #[test]
    fn test_identical_override_is_not_a_conflict() {
        let doc = r"
            [matchmaking]
            timeout_ms = 1000
            [environments.dev.matchmaking]
            timeout_ms = 1000
        ";
        let resolved = resolve_layered(doc, Environment::Dev).unwrap();
        assert!(resolved.conflicts.is_empty());
    }

    #[test]
    fn test_missing_environment_table() {
        let doc = "[environments.dev]\nseed = 3\n";
        let err = resolve_layered(doc, Environment::Staging).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownEnvironment(_)));

        // No environments table at all: the global layer is used as-is.
        let resolved = resolve_layered("seed = 9\n", Environment::Staging).unwrap();
        assert_eq!(resolved.config.seed, 9);
    }

    #[test]
    fn test_environment_parse() {
        assert_eq!("QA".parse::<Environment>().unwrap(), Environment::Qa);
        assert_eq!("production".parse::<Environment>().unwrap(), Environment::Prod);
        assert!("moon".parse::<Environment>().is_err());
    }
}
