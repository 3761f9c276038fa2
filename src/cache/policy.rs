use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::CacheConfig;
use crate::core::Split;
use crate::error::CacheError;

/// Decides which splits may be cached at all.
///
/// Live data goes stale, so by default only splits flagged immutable are
/// admitted. Turning `immutable_only` off lets sources opt individual
/// mutable splits in through [`Split::cacheable`].
#[derive(Debug, Clone)]
pub struct CachePolicy {
    enabled: bool,
    immutable_only: bool,
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            immutable_only: true,
            include: None,
            exclude: None,
        }
    }
}

impl CachePolicy {
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        Ok(Self {
            enabled: config.enabled,
            immutable_only: config.immutable_only,
            include: build_set(&config.include_patterns)?,
            exclude: build_set(&config.exclude_patterns)?,
        })
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn allow_mutable(mut self) -> Self {
        self.immutable_only = false;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn should_cache(&self, split: &Split) -> bool {
        if !self.enabled {
            return false;
        }
        let admissible = split.immutable || (!self.immutable_only && split.cacheable);
        if !admissible {
            return false;
        }
        let included = self
            .include
            .as_ref()
            .map_or(true, |set| set.is_match(&split.source_key));
        let excluded = self
            .exclude
            .as_ref()
            .is_some_and(|set| set.is_match(&split.source_key));
        included && !excluded
    }
}

fn build_set(patterns: &[String]) -> Result<Option<GlobSet>, CacheError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(Some(builder.build()?))
}
