use monitoring::telemetry::metrics::{Counter, Histogram, KeyValue, Meter};

#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub rows_processed: Counter,
    pub rows_thrown_away: Counter,
    pub segments_written: Counter,
    pub bytes_written: Counter,
    pub segments_published: Counter,
    pub sub_task_failures: Counter,
    pub availability_timeouts: Counter,
    pub availability_wait_ms: Histogram<f64>,
}

impl MetricsRegistry {
    pub fn new(meter: &Meter) -> Self {
        Self {
            rows_processed: Counter::new(
                meter,
                "ingest_rows_processed_total",
                "Input rows accepted by sub-tasks, before rollup",
            ),
            rows_thrown_away: Counter::new(
                meter,
                "ingest_rows_thrown_away_total",
                "Input rows dropped for falling outside the ingestion intervals",
            ),
            segments_written: Counter::new(
                meter,
                "ingest_segments_written_total",
                "Segment files written to the data store",
            ),
            bytes_written: Counter::new(
                meter,
                "ingest_bytes_written_total",
                "Bytes of segment files written to the data store",
            ),
            segments_published: Counter::new(
                meter,
                "ingest_segments_published_total",
                "Segments committed to metadata storage",
            ),
            sub_task_failures: Counter::new(
                meter,
                "ingest_sub_task_failures_total",
                "Sub-tasks that failed irrecoverably",
            ),
            availability_timeouts: Counter::new(
                meter,
                "ingest_availability_timeouts_total",
                "Availability waits that ended before every segment was served",
            ),
            availability_wait_ms: Histogram::new_f64(
                meter,
                "ingest_availability_wait_ms",
                "Time spent waiting for published segments to be served",
                "milliseconds",
            ),
        }
    }

    pub(crate) fn record_segment_written(&self, data_source: &str, bytes: u64) {
        let kvs = [KeyValue::new("data_source", data_source.to_string())];
        self.segments_written.inc_with_kvs(&kvs);
        self.bytes_written.inc_by_with_kvs(bytes, &kvs);
    }

    pub(crate) fn record_rows(&self, data_source: &str, processed: u64, thrown_away: u64) {
        let kvs = [KeyValue::new("data_source", data_source.to_string())];
        self.rows_processed.inc_by_with_kvs(processed, &kvs);
        self.rows_thrown_away.inc_by_with_kvs(thrown_away, &kvs);
    }
}
