//! Engine limits and tunables
//!
//! The binary fills an [`EngineConfig`] from its command line; library users
//! start from `EngineConfig::default()` and override what they need.

use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_ENTITIES: usize = 1_000_000;
pub const DEFAULT_MAX_COMPONENTS: usize = 100;
pub const DEFAULT_MAX_COMMANDS_PER_TICK: usize = 10_000;
pub const DEFAULT_REBUILD_THRESHOLD: f64 = 0.5;
/// Ticks after which a cached snapshot is rebuilt even if it was patched
/// correctly all along; three seconds at 20 Hz.
pub const DEFAULT_MAX_CACHE_AGE_TICKS: u64 = 60;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Hard limit on live entities across all matches.
    pub max_entities: usize,
    /// Hard limit on component types, reserved ids included.
    pub max_components: usize,
    /// Commands executed per tick; the rest stay queued. Values below 1
    /// are treated as 1.
    pub max_commands_per_tick: usize,
    pub cache: CacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_entities: DEFAULT_MAX_ENTITIES,
            max_components: DEFAULT_MAX_COMPONENTS,
            max_commands_per_tick: DEFAULT_MAX_COMMANDS_PER_TICK,
            cache: CacheConfig::default(),
        }
    }
}

/// Snapshot cache tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Ratio of dirty entities to cached entities above which the cache is
    /// rebuilt from scratch instead of patched.
    pub rebuild_threshold: f64,
    /// Rebuild a cached snapshot once its last full build is this many ticks
    /// old; `None` keeps patching forever.
    pub max_age_ticks: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            rebuild_threshold: DEFAULT_REBUILD_THRESHOLD,
            max_age_ticks: Some(DEFAULT_MAX_CACHE_AGE_TICKS),
        }
    }
}

/// Tick interval for a rate in hertz, clamped to at least 1 Hz.
pub fn tick_duration(tick_rate: u32) -> Duration {
    Duration::from_secs_f64(1.0 / tick_rate.max(1) as f64)
}

/// Module declaration given on the command line as `name=FLAG:COMP,COMP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDeclaration {
    pub name: String,
    pub flag: String,
    pub components: Vec<String>,
}

impl FromStr for ModuleDeclaration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("expected name=FLAG[:COMP,...], got `{}`", s))?;
        let (flag, components) = match rest.split_once(':') {
            Some((flag, list)) => (flag, list),
            None => (rest, ""),
        };

        let name = name.trim();
        let flag = flag.trim();
        if name.is_empty() || flag.is_empty() {
            return Err(format!("module name and flag must be non-empty in `{}`", s));
        }

        Ok(ModuleDeclaration {
            name: name.to_string(),
            flag: flag.to_string(),
            components: components
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_entities, 1_000_000);
        assert_eq!(config.max_components, 100);
        assert_eq!(config.max_commands_per_tick, 10_000);
        assert_eq!(config.cache.rebuild_threshold, 0.5);
        assert_eq!(config.cache.max_age_ticks, Some(60));
    }

    #[test]
    fn test_tick_duration() {
        assert_eq!(tick_duration(1), Duration::from_secs(1));
        assert_eq!(tick_duration(0), Duration::from_secs(1));
        assert!(tick_duration(60) < Duration::from_millis(17));
    }

    #[test]
    fn test_module_declaration_parsing() {
        let declaration: ModuleDeclaration =
            "movement=MOVABLE:POSITION_X, POSITION_Y".parse().unwrap();
        assert_eq!(declaration.name, "movement");
        assert_eq!(declaration.flag, "MOVABLE");
        assert_eq!(declaration.components, vec!["POSITION_X", "POSITION_Y"]);

        let bare: ModuleDeclaration = "marker=FLAG".parse().unwrap();
        assert!(bare.components.is_empty());

        assert!("nomodule".parse::<ModuleDeclaration>().is_err());
        assert!("=FLAG".parse::<ModuleDeclaration>().is_err());
    }
}
