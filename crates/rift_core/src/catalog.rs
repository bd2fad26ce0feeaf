//! # Content Catalog
//!
//! Abilities, effect templates and the entity stat table. Built once at
//! startup, validated, then shared read-only by every worker.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::ability::Ability;
use crate::dimension::DimensionKind;
use crate::effect::{EffectTemplate, MAX_TICK_AMOUNT};
use crate::entity::EntityProfile;
use crate::error::{ConfigError, ConfigResult};
use crate::ids::{AbilityId, EffectTemplateId};

#[derive(Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    abilities: Vec<Ability>,
    #[serde(default)]
    effects: Vec<EffectTemplate>,
    #[serde(default)]
    stats: StatTable,
}

/// A profile specialized for one dimension type.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct KindProfile {
    /// Dimension type.
    pub kind: DimensionKind,
    /// Profile used there.
    pub profile: EntityProfile,
}

/// Spawn profiles, optionally specialized per dimension type.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StatTable {
    /// Profile used when no specialization exists.
    pub default: EntityProfile,
    /// Per-dimension-type profiles. The first match wins.
    pub by_kind: Vec<KindProfile>,
}

impl StatTable {
    /// Profile for entities spawned in a dimension of `kind`.
    #[must_use]
    pub fn profile_for(&self, kind: DimensionKind) -> &EntityProfile {
        self.by_kind
            .iter()
            .find(|p| p.kind == kind)
            .map_or(&self.default, |p| &p.profile)
    }
}

/// Validated static content.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    abilities: BTreeMap<AbilityId, Ability>,
    effects: BTreeMap<EffectTemplateId, EffectTemplate>,
    stats: StatTable,
}

impl Catalog {
    /// Builds a catalog, checking ids and cross references.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for duplicate ids, dangling
    /// references, zero durations, zero stack caps or tick amounts above
    /// [`MAX_TICK_AMOUNT`].
    pub fn new(abilities: Vec<Ability>, effects: Vec<EffectTemplate>, stats: StatTable) -> ConfigResult<Self> {
        let mut effect_map = BTreeMap::new();
        for template in effects {
            if template.duration_ticks == 0 {
                return Err(ConfigError::Invalid(format!("effect {:?} has zero duration", template.id)));
            }
            if template.max_stacks == 0 {
                return Err(ConfigError::Invalid(format!("effect {:?} has zero stack cap", template.id)));
            }
            if let Some(amount) = template.kind.tick_amount().filter(|&a| a > MAX_TICK_AMOUNT) {
                return Err(ConfigError::Invalid(format!(
                    "effect {:?} ticks for {amount}, above {MAX_TICK_AMOUNT}",
                    template.id
                )));
            }
            if let Some(dup) = effect_map.insert(template.id, template) {
                return Err(ConfigError::Invalid(format!("duplicate effect id {:?}", dup.id)));
            }
        }

        for template in effect_map.values() {
            if let Some(rule) = template.chain.iter().find(|r| !effect_map.contains_key(&r.template)) {
                return Err(ConfigError::Invalid(format!(
                    "effect {:?} chains to unknown effect {:?}",
                    template.id, rule.template
                )));
            }
        }

        let mut ability_map = BTreeMap::new();
        for ability in abilities {
            if let Some(missing) = ability.effects.iter().find(|t| !effect_map.contains_key(t)) {
                return Err(ConfigError::Invalid(format!(
                    "ability {:?} references unknown effect {missing:?}",
                    ability.id
                )));
            }
            if let Some(dup) = ability_map.insert(ability.id, ability) {
                return Err(ConfigError::Invalid(format!("duplicate ability id {:?}", dup.id)));
            }
        }

        for profile in std::iter::once(&stats.default).chain(stats.by_kind.iter().map(|p| &p.profile)) {
            if profile.health == 0 {
                return Err(ConfigError::Invalid("stat profile with zero health".into()));
            }
        }

        Ok(Self { abilities: ability_map, effects: effect_map, stats })
    }

    /// Parses and validates a catalog document.
    ///
    /// # Errors
    ///
    /// Returns a parse error or a validation error from [`Catalog::new`].
    pub fn from_toml_str(doc: &str) -> ConfigResult<Self> {
        let parsed: CatalogDocument = toml::from_str(doc)?;
        Self::new(parsed.abilities, parsed.effects, parsed.stats)
    }

    /// Loads a catalog file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise see
    /// [`Catalog::from_toml_str`].
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let doc = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::from_toml_str(&doc)?;
        tracing::info!(
            path = %path.display(),
            abilities = catalog.abilities.len(),
            effects = catalog.effects.len(),
            "catalog loaded"
        );
        Ok(catalog)
    }

    /// Looks up an ability.
    #[inline]
    #[must_use]
    pub fn ability(&self, id: AbilityId) -> Option<&Ability> {
        self.abilities.get(&id)
    }

    /// Looks up an effect template.
    #[inline]
    #[must_use]
    pub fn effect(&self, id: EffectTemplateId) -> Option<&EffectTemplate> {
        self.effects.get(&id)
    }

    /// All abilities in id order.
    pub fn abilities(&self) -> impl Iterator<Item = &Ability> {
        self.abilities.values()
    }

    /// The stat table.
    #[inline]
    #[must_use]
    pub const fn stats(&self) -> &StatTable {
        &self.stats
    }
}
