use std::sync::Arc;

use super::Composition;
use crate::cache::CacheManager;
use crate::core::{Processor, Sink, Source, Transform};
use crate::error::ConfigError;

/// Validated, immutable stage list: one source, zero or more transform
/// stages, one sink.
pub struct PipelineGraph {
    pub(crate) source: Box<dyn Source>,
    pub(crate) stages: Vec<Composition>,
    pub(crate) sink: Arc<dyn Sink>,
    pub(crate) cache: Option<Arc<CacheManager>>,
}

impl PipelineGraph {
    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    pub fn stages(&self) -> &[Composition] {
        &self.stages
    }

    pub fn cache(&self) -> Option<&Arc<CacheManager>> {
        self.cache.as_ref()
    }

    /// Fingerprint of the transform chain alone.
    pub fn chain_fingerprint(&self) -> String {
        Composition::chain(self.stages.iter().cloned())
            .map(|chain| chain.fingerprint())
            .unwrap_or_else(|| "identity".to_string())
    }

    /// Source read options plus the full transform chain; feeds cache keys.
    pub fn fingerprint(&self) -> String {
        format!("{}|{}", self.source.fingerprint(), self.chain_fingerprint())
    }
}

#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Processor>,
    cache: Option<Arc<CacheManager>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, processor: impl Into<Processor>) -> Self {
        self.stages.push(processor.into());
        self
    }

    pub fn source(self, source: impl Source + 'static) -> Self {
        self.then(Processor::source(source))
    }

    pub fn transform(self, transform: impl Transform + 'static) -> Self {
        self.then(Processor::transform(transform))
    }

    pub fn sink(self, sink: impl Sink + 'static) -> Self {
        self.then(Processor::sink(sink))
    }

    pub fn cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<PipelineGraph, ConfigError> {
        let mut stages = self.stages.into_iter();

        let source = match stages.next() {
            Some(Processor::Source(source)) => source,
            Some(other) => {
                return Err(ConfigError::Graph(format!(
                    "first stage must be a source, found a {}",
                    other.role()
                )))
            }
            None => return Err(ConfigError::Graph("pipeline has no stages".to_string())),
        };

        let mut transforms = Vec::new();
        let mut sink = None;
        for (position, processor) in stages.enumerate() {
            if let Some(existing) = &sink {
                let existing: &Arc<dyn Sink> = existing;
                return Err(ConfigError::Graph(format!(
                    "stage {} follows sink `{}`; a sink must be last",
                    position + 1,
                    existing.name()
                )));
            }
            match processor {
                Processor::Source(extra) => {
                    return Err(ConfigError::Graph(format!(
                        "source `{}` at stage {}; only the first stage may be a source",
                        extra.name(),
                        position + 1
                    )))
                }
                Processor::Transform(t) => transforms.push(Composition::from_arc(t)),
                Processor::Composite(c) => transforms.push(c),
                Processor::Sink(s) => sink = Some(s),
            }
        }

        let sink = sink.ok_or_else(|| ConfigError::Graph("pipeline has no sink".to_string()))?;

        Ok(PipelineGraph {
            source,
            stages: transforms,
            sink,
            cache: self.cache,
        })
    }
}
