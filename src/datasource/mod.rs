//! Data source access used by `sql.execute` and by schema summaries.

mod sqlite;

pub use sqlite::SqliteDataSources;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::ExecutionResult;

/// Runs read-only queries against a data source.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Execute `sql`, returning at most `max_rows` rows.
    ///
    /// Implementations must abort the in-flight query when `cancel` fires.
    async fn execute(
        &self,
        data_source_id: &str,
        sql: &str,
        max_rows: usize,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ExecutionResult>;
}
