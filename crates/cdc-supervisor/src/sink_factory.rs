use std::sync::Arc;

use cdc_common::job::JobConfig;
use cdc_stream::{SchemaSinkAdapter, SinkCallback};

/// Builds the per-job write path (§6's `sink callback`) from a `JobConfig`'s
/// `sink_table`/`sink_base_path`. The supervisor only knows this trait; it has
/// no opinion on Hudi/Iceberg/file/test-double sinks.
pub trait SinkFactory: Send + Sync {
    fn build_sink(&self, job: &JobConfig) -> Arc<dyn SinkCallback>;

    /// Most sinks infer schema lazily and can no-op here.
    fn build_schema_adapter(&self, _job: &JobConfig) -> Option<Arc<dyn SchemaSinkAdapter>> {
        None
    }
}
