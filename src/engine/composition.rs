//! Sequential and parallel composition of transforms.
//!
//! A [`Composition`] is a tree description; it runs nothing until the
//! executor calls [`Composition::apply`]. Both constructors flatten nested
//! compositions of the same kind, so `(a then b) then c` and
//! `a then (b then c)` build the same tree.

use futures::future::{join_all, try_join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::core::{Batch, Transform};
use crate::error::PipelineError;

/// How a parallel group reports branch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// Fail as soon as any branch fails; sibling branches are dropped.
    #[default]
    FailFast,
    /// Run every branch to completion, then report the first failure in
    /// branch order.
    CollectAll,
}

impl JoinMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::FailFast => "fail_fast",
            Self::CollectAll => "collect_all",
        }
    }
}

#[derive(Clone)]
pub enum Composition {
    Transform(Arc<dyn Transform>),
    Sequential(Vec<Composition>),
    Parallel {
        branches: Vec<Composition>,
        mode: JoinMode,
    },
}

impl Composition {
    pub fn transform(transform: impl Transform + 'static) -> Self {
        Self::Transform(Arc::new(transform))
    }

    pub fn from_arc(transform: Arc<dyn Transform>) -> Self {
        Self::Transform(transform)
    }

    /// `a then b`: every output of `a` is fed, in order, to `b`.
    pub fn sequential(a: Composition, b: Composition) -> Self {
        let mut stages = Vec::new();
        for part in [a, b] {
            match part {
                Self::Sequential(inner) => stages.extend(inner),
                other => stages.push(other),
            }
        }
        Self::Sequential(stages)
    }

    /// `a par b` with fail-fast joining.
    pub fn parallel(a: Composition, b: Composition) -> Self {
        Self::parallel_with(JoinMode::FailFast, a, b)
    }

    pub fn parallel_with(mode: JoinMode, a: Composition, b: Composition) -> Self {
        let mut branches = Vec::new();
        for part in [a, b] {
            match part {
                Self::Parallel {
                    branches: inner,
                    mode: inner_mode,
                } if inner_mode == mode => branches.extend(inner),
                other => branches.push(other),
            }
        }
        Self::Parallel { branches, mode }
    }

    /// Chain of any length; a single element is returned as is.
    pub fn chain(parts: impl IntoIterator<Item = Composition>) -> Option<Self> {
        parts.into_iter().reduce(Self::sequential)
    }

    pub fn name(&self) -> String {
        match self {
            Self::Transform(t) => t.name().to_string(),
            Self::Sequential(stages) => format!(
                "seq({})",
                stages.iter().map(Self::name).collect::<Vec<_>>().join(",")
            ),
            Self::Parallel { branches, .. } => format!(
                "par({})",
                branches.iter().map(Self::name).collect::<Vec<_>>().join(",")
            ),
        }
    }

    /// Deterministic description of the whole tree, including each
    /// transform's own fingerprint.
    pub fn fingerprint(&self) -> String {
        match self {
            Self::Transform(t) => format!("{}#{}", t.name(), t.fingerprint()),
            Self::Sequential(stages) => format!(
                "seq({})",
                stages
                    .iter()
                    .map(Self::fingerprint)
                    .collect::<Vec<_>>()
                    .join(",")
            ),
            Self::Parallel { branches, mode } => format!(
                "par[{}]({})",
                mode.as_str(),
                branches
                    .iter()
                    .map(Self::fingerprint)
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        }
    }

    /// Leaf transforms in depth-first order.
    pub fn transforms(&self) -> Vec<Arc<dyn Transform>> {
        match self {
            Self::Transform(t) => vec![t.clone()],
            Self::Sequential(parts) | Self::Parallel { branches: parts, .. } => {
                parts.iter().flat_map(Self::transforms).collect()
            }
        }
    }

    pub fn apply(&self, batch: Batch) -> BoxFuture<'_, Result<Vec<Batch>, PipelineError>> {
        async move {
            match self {
                Self::Transform(t) => t
                    .apply(batch)
                    .await
                    .map_err(|e| PipelineError::transform(t.name(), e)),
                Self::Sequential(stages) => {
                    let mut current = vec![batch];
                    for stage in stages {
                        let mut next = Vec::with_capacity(current.len());
                        for input in current {
                            next.extend(stage.apply(input).await?);
                        }
                        if next.is_empty() {
                            return Ok(next);
                        }
                        current = next;
                    }
                    Ok(current)
                }
                Self::Parallel { branches, mode } => {
                    let runs = branches.iter().map(|b| b.apply(batch.clone()));
                    match mode {
                        JoinMode::FailFast => {
                            Ok(try_join_all(runs).await?.into_iter().flatten().collect())
                        }
                        JoinMode::CollectAll => {
                            let mut outputs = Vec::new();
                            let mut first_error = None;
                            for result in join_all(runs).await {
                                match result {
                                    Ok(batches) => outputs.extend(batches),
                                    Err(e) if first_error.is_none() => first_error = Some(e),
                                    Err(e) => {
                                        tracing::debug!(error = %e, "Additional parallel branch failure")
                                    }
                                }
                            }
                            match first_error {
                                Some(e) => Err(e),
                                None => Ok(outputs),
                            }
                        }
                    }
                }
            }
        }
        .boxed()
    }
}

impl fmt::Debug for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}
