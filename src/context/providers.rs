//! Capabilities the context builder consumes from the surrounding system.

use async_trait::async_trait;

use super::{PlaceholderInfo, SchemaSummary, TimeWindowSpec};

/// Source of schema summaries for data sources.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// Summarize `data_source_id`. When `required_tables` is given only
    /// those tables are described.
    async fn schema_summary(
        &self,
        data_source_id: &str,
        required_tables: Option<&[String]>,
    ) -> anyhow::Result<SchemaSummary>;
}

/// Source of template placeholder descriptions.
#[async_trait]
pub trait PlaceholderProvider: Send + Sync {
    async fn placeholder_context(
        &self,
        template_id: &str,
        placeholder_id: &str,
    ) -> anyhow::Result<Option<PlaceholderInfo>>;
}

/// Source of schedule time window specs.
#[async_trait]
pub trait ScheduleProvider: Send + Sync {
    async fn time_window_spec(&self, schedule_ref: &str) -> anyhow::Result<Option<TimeWindowSpec>>;
}
