use async_trait::async_trait;

use crate::core::{Ack, Batch, Column, Sink};
use crate::error::SinkError;

/// Logs a one-line summary per batch and per column.
pub struct LogSink {
    label: String,
}

impl LogSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

fn describe(column: &Column) -> String {
    match column {
        Column::Int64(v) if !v.is_empty() => {
            let sum: i64 = v.iter().sum();
            format!("int64 len={}, mean={:.4}", v.len(), sum as f64 / v.len() as f64)
        }
        Column::Float64(v) if !v.is_empty() => {
            let mean = v.iter().sum::<f64>() / v.len() as f64;
            let rms = (v.iter().map(|x| x * x).sum::<f64>() / v.len() as f64).sqrt();
            format!("float64 len={}, mean={:.4}, rms={:.4}", v.len(), mean, rms)
        }
        Column::Utf8(v) if !v.is_empty() => format!("utf8 len={}", v.len()),
        Column::Bool(v) if !v.is_empty() => {
            let set = v.iter().filter(|b| **b).count();
            format!("bool len={}, true={}", v.len(), set)
        }
        _ => "empty".to_string(),
    }
}

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &str {
        &self.label
    }

    async fn write(&self, batch: &Batch) -> Result<Ack, SinkError> {
        tracing::info!(
            sink = %self.label,
            source_key = batch.source_key(),
            sequence = batch.sequence(),
            rows = batch.num_rows(),
            "Batch"
        );
        for (name, column) in batch.payload().columns() {
            tracing::info!(sink = %self.label, column = name, "{}", describe(column));
        }
        Ok(Ack::for_batch(batch))
    }
}
