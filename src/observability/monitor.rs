use super::MetricsCollector;

pub struct PipelineMonitor {
    collector: MetricsCollector,
}

impl PipelineMonitor {
    pub fn new(collector: MetricsCollector) -> Self {
        Self { collector }
    }

    pub fn generate_report(&self) -> String {
        let snapshot = self.collector.snapshot();

        let mut report = String::from("=== Pipeline Metrics ===\n");
        report.push_str(&format!(
            "Processed: {} batches ({} read, {} dropped)\nErrors: {} (rate {:.3})\nCache: {} hits / {} misses\nPeak in-flight: {}\nThroughput: {:.1} batches/s\n",
            snapshot.processed,
            snapshot.batches_read,
            snapshot.dropped,
            snapshot.errors,
            snapshot.error_rate,
            snapshot.cache_hits,
            snapshot.cache_misses,
            snapshot.peak_in_flight,
            snapshot.throughput,
        ));

        if snapshot.stages.is_empty() {
            report.push_str("\nNo stages registered\n");
            return report;
        }

        for (stage_id, stage) in snapshot.stages.iter() {
            report.push_str(&format!(
                "\n[{}]\n  Batches: {}\n  Errors: {}\n  Retries: {}\n  Avg Latency: {}μs\n",
                stage_id, stage.processed, stage.errors, stage.retries, stage.avg_latency_us
            ));
        }

        report
    }

    pub fn collector(&self) -> &MetricsCollector {
        &self.collector
    }
}
