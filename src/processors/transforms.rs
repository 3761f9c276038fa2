use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::core::{Batch, Table, Transform};
use crate::error::TransformError;

type ApplyFn = dyn Fn(Batch) -> Result<Vec<Batch>, TransformError> + Send + Sync;

/// Transform from a closure. The fingerprint must change whenever the
/// closure's behavior does; it is part of every cache key.
pub struct FnTransform {
    name: String,
    fingerprint: String,
    apply: Box<ApplyFn>,
}

impl FnTransform {
    pub fn new<F>(name: impl Into<String>, fingerprint: impl Into<String>, apply: F) -> Self
    where
        F: Fn(Batch) -> Result<Vec<Batch>, TransformError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            fingerprint: fingerprint.into(),
            apply: Box::new(apply),
        }
    }

    /// One-to-one payload rewrite.
    pub fn map<F>(name: impl Into<String>, fingerprint: impl Into<String>, map: F) -> Self
    where
        F: Fn(&Table) -> Result<Table, TransformError> + Send + Sync + 'static,
    {
        Self::new(name, fingerprint, move |batch: Batch| {
            let payload = map(batch.payload())?;
            Ok(vec![batch.with_payload(payload)])
        })
    }
}

#[async_trait]
impl Transform for FnTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn fingerprint(&self) -> String {
        self.fingerprint.clone()
    }

    async fn apply(&self, batch: Batch) -> Result<Vec<Batch>, TransformError> {
        (self.apply)(batch)
    }
}

/// Keeps batches matching a predicate, drops the rest.
pub struct FilterTransform {
    name: String,
    fingerprint: String,
    predicate: Box<dyn Fn(&Batch) -> bool + Send + Sync>,
}

impl FilterTransform {
    pub fn new<F>(name: impl Into<String>, fingerprint: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Batch) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            fingerprint: fingerprint.into(),
            predicate: Box::new(predicate),
        }
    }
}

#[async_trait]
impl Transform for FilterTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn fingerprint(&self) -> String {
        self.fingerprint.clone()
    }

    async fn apply(&self, batch: Batch) -> Result<Vec<Batch>, TransformError> {
        if (self.predicate)(&batch) {
            Ok(vec![batch])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Column projection. Fails on a batch missing any requested column.
pub struct ProjectTransform {
    columns: BTreeSet<String>,
}

impl ProjectTransform {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Transform for ProjectTransform {
    fn name(&self) -> &str {
        "project"
    }

    fn fingerprint(&self) -> String {
        self.columns.iter().cloned().collect::<Vec<_>>().join(",")
    }

    async fn apply(&self, batch: Batch) -> Result<Vec<Batch>, TransformError> {
        let mut table = Table::new();
        for name in &self.columns {
            let column = batch.payload().column(name).ok_or_else(|| {
                TransformError::InvalidInput(format!(
                    "column `{name}` missing from batch {}",
                    batch.sequence()
                ))
            })?;
            table = table.with_column(name.clone(), column.clone());
        }
        Ok(vec![batch.with_payload(table)])
    }
}
