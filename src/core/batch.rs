use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A single typed column of a [`Table`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum Column {
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Utf8(Vec<String>),
    Bool(Vec<bool>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Self::Int64(v) => v.len(),
            Self::Float64(v) => v.len(),
            Self::Utf8(v) => v.len(),
            Self::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn size_bytes(&self) -> usize {
        match self {
            Self::Int64(v) => v.len() * 8,
            Self::Float64(v) => v.len() * 8,
            Self::Utf8(v) => v.iter().map(|s| s.len()).sum(),
            Self::Bool(v) => v.len(),
        }
    }
}

/// Opaque table-like payload. The engine never inspects columns; transforms do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: BTreeMap<String, Column>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, name: impl Into<String>, column: Column) -> Self {
        self.columns.insert(name.into(), column);
        self
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Row count, taken as the longest column.
    pub fn num_rows(&self) -> usize {
        self.columns.values().map(Column::len).max().unwrap_or(0)
    }

    /// Rough in-memory footprint, used for byte counters and cache budgets.
    pub fn size_bytes(&self) -> usize {
        self.columns
            .iter()
            .map(|(name, col)| name.len() + col.size_bytes())
            .sum()
    }
}

/// Resumable position within a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_key: String,
    pub sequence: u64,
}

/// Cheap listing record a source emits before the expensive fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub source_key: String,
    pub sequence: u64,
    pub watermark: Option<u64>,
    /// Historical input that can never change (closed partition, finished file).
    pub immutable: bool,
    /// Explicit opt-in for caching a mutable input.
    pub cacheable: bool,
}

impl Split {
    pub fn new(source_key: impl Into<String>, sequence: u64) -> Self {
        Self {
            source_key: source_key.into(),
            sequence,
            watermark: None,
            immutable: false,
            cacheable: false,
        }
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    pub fn with_watermark(mut self, watermark: u64) -> Self {
        self.watermark = Some(watermark);
        self
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            source_key: self.source_key.clone(),
            sequence: self.sequence,
        }
    }
}

/// Unit of data flowing through the pipeline.
///
/// Immutable: transforms build new batches with [`Batch::with_payload`]
/// rather than editing one in place. The payload sits behind an `Arc` so
/// parallel branches can each receive the same input without copying rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    payload: Arc<Table>,
    sequence: u64,
    source_key: String,
    /// Event-time lower bound in microseconds since epoch
    watermark: Option<u64>,
    metadata: BTreeMap<String, String>,
}

impl Batch {
    pub fn new(source_key: impl Into<String>, sequence: u64, payload: Table) -> Self {
        Self {
            payload: Arc::new(payload),
            sequence,
            source_key: source_key.into(),
            watermark: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Batch for `split`, carrying its key, sequence and watermark.
    pub fn for_split(split: &Split, payload: Table) -> Self {
        Self {
            watermark: split.watermark,
            ..Self::new(split.source_key.clone(), split.sequence, payload)
        }
    }

    pub fn payload(&self) -> &Table {
        &self.payload
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn source_key(&self) -> &str {
        &self.source_key
    }

    pub fn watermark(&self) -> Option<u64> {
        self.watermark
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn num_rows(&self) -> usize {
        self.payload.num_rows()
    }

    pub fn size_bytes(&self) -> usize {
        self.payload.size_bytes()
    }

    /// New batch with the same origin and a different payload.
    pub fn with_payload(&self, payload: Table) -> Self {
        Self {
            payload: Arc::new(payload),
            ..self.clone()
        }
    }

    pub fn with_watermark(mut self, watermark: u64) -> Self {
        self.watermark = Some(watermark);
        self
    }

    /// Same payload and metadata, positioned at `split`.
    pub fn at_split(self, split: &Split) -> Self {
        Self {
            source_key: split.source_key.clone(),
            sequence: split.sequence,
            watermark: split.watermark,
            ..self
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
