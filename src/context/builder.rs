//! Pure assembly of a bounded [`TaskContext`] from its external inputs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Constraints, PlaceholderInfo, SchemaSummary, TaskContext, TimeWindowSpec};
use crate::task::OutputKind;
use crate::util::truncate_chars;

/// Caps applied while building a context so prompts stay bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextLimits {
    pub max_tables: usize,
    pub max_columns_per_table: usize,
    /// Cap for free-text inputs (description, placeholder text).
    pub max_text_chars: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_tables: 20,
            max_columns_per_table: 30,
            max_text_chars: 2000,
        }
    }
}

/// Raw inputs gathered from the providers.
#[derive(Debug, Clone)]
pub struct ContextInputs {
    pub task_description: String,
    pub data_source_id: String,
    pub placeholder: Option<PlaceholderInfo>,
    pub schema: Option<SchemaSummary>,
    pub time_window: Option<TimeWindowSpec>,
    pub constraints: Constraints,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContextBuildError {
    #[error("task description is empty")]
    EmptyDescription,

    #[error("placeholder information is missing")]
    MissingPlaceholder,

    #[error("schema information is missing for data source `{0}`")]
    MissingSchema(String),

    #[error("a {0} task needs at least one table in the schema")]
    EmptySchema(OutputKind),
}

/// Builds task contexts under fixed limits. Holds no other state.
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    limits: ContextLimits,
}

impl ContextBuilder {
    pub fn new(limits: ContextLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ContextLimits {
        &self.limits
    }

    /// Merge the inputs into a fresh context.
    ///
    /// # Errors
    /// - missing placeholder or schema
    /// - a schema without tables for a task whose output needs SQL
    pub fn build(&self, inputs: ContextInputs) -> Result<TaskContext, ContextBuildError> {
        if inputs.task_description.trim().is_empty() {
            return Err(ContextBuildError::EmptyDescription);
        }
        let placeholder = inputs
            .placeholder
            .ok_or(ContextBuildError::MissingPlaceholder)?;
        if placeholder.name.trim().is_empty() {
            return Err(ContextBuildError::MissingPlaceholder);
        }
        let schema = inputs
            .schema
            .ok_or_else(|| ContextBuildError::MissingSchema(inputs.data_source_id.clone()))?;

        let output_kind = inputs.constraints.output_kind;
        if output_kind.needs_schema() && schema.is_empty() {
            return Err(ContextBuildError::EmptySchema(output_kind));
        }

        let max_text = self.limits.max_text_chars;
        let placeholder = PlaceholderInfo {
            name: placeholder.name.trim().to_string(),
            description: truncate_chars(&placeholder.description, max_text),
            kind: placeholder.kind,
            surrounding_text: placeholder
                .surrounding_text
                .map(|t| truncate_chars(&t, max_text)),
        };

        let mentions = mention_text(&inputs.task_description, &placeholder);
        let schema = self.bound_schema(schema, &mentions);

        Ok(TaskContext {
            task_description: truncate_chars(inputs.task_description.trim(), max_text),
            placeholder,
            data_source_id: inputs.data_source_id,
            schema,
            time_window: inputs.time_window,
            constraints: inputs.constraints,
            current_sql: None,
            execution_result: None,
            chart_spec: None,
            chart_image_path: None,
            resolved_window: None,
            report_text: None,
        })
    }

    /// Rank mentioned tables first, then cap tables and columns.
    fn bound_schema(&self, schema: SchemaSummary, mentions: &str) -> SchemaSummary {
        let (mut mentioned, mut rest): (Vec<String>, Vec<String>) = schema
            .tables
            .iter()
            .cloned()
            .partition(|t| mentions_word(mentions, t));
        mentioned.append(&mut rest);
        let ranked = mentioned;

        let keep = ranked.len().min(self.limits.max_tables);
        let mut omitted_columns = schema.omitted_columns;
        let mut columns_by_table = BTreeMap::new();
        for table in &ranked[..keep] {
            let mut columns = schema
                .columns_by_table
                .get(table)
                .cloned()
                .unwrap_or_default();
            if columns.len() > self.limits.max_columns_per_table {
                omitted_columns += columns.len() - self.limits.max_columns_per_table;
                columns.truncate(self.limits.max_columns_per_table);
            }
            columns_by_table.insert(table.clone(), columns);
        }

        SchemaSummary {
            tables: ranked[..keep].to_vec(),
            columns_by_table,
            omitted_tables: schema.omitted_tables + (ranked.len() - keep),
            omitted_columns,
        }
    }
}

fn mention_text(description: &str, placeholder: &PlaceholderInfo) -> String {
    let mut text = format!(
        "{} {} {}",
        description, placeholder.name, placeholder.description
    );
    if let Some(surrounding) = &placeholder.surrounding_text {
        text.push(' ');
        text.push_str(surrounding);
    }
    text.to_lowercase()
}

/// Whole-word, case-insensitive match of `word` in already-lowercased `text`.
fn mentions_word(text: &str, word: &str) -> bool {
    let word = word.to_lowercase();
    if word.is_empty() {
        return false;
    }
    let is_ident = |c: char| c.is_alphanumeric() || c == '_';
    text.match_indices(&word).any(|(start, _)| {
        let before = text[..start].chars().next_back();
        let after = text[start + word.len()..].chars().next();
        !before.map(is_ident).unwrap_or(false) && !after.map(is_ident).unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(tables: &[(&str, usize)]) -> SchemaSummary {
        let mut map = BTreeMap::new();
        for (name, cols) in tables {
            map.insert(
                name.to_string(),
                (0..*cols).map(|i| format!("c{}", i)).collect(),
            );
        }
        SchemaSummary::new(map)
    }

    fn inputs(kind: OutputKind, schema: Option<SchemaSummary>) -> ContextInputs {
        ContextInputs {
            task_description: "compute total refund amount for orders table".to_string(),
            data_source_id: "main".to_string(),
            placeholder: Some(PlaceholderInfo {
                name: "total_refund".to_string(),
                ..Default::default()
            }),
            schema,
            time_window: None,
            constraints: Constraints { output_kind: kind },
        }
    }

    #[test]
    fn caps_tables_and_columns() {
        let builder = ContextBuilder::new(ContextLimits {
            max_tables: 2,
            max_columns_per_table: 3,
            max_text_chars: 100,
        });
        let ctx = builder
            .build(inputs(
                OutputKind::Sql,
                Some(schema(&[("alpha", 5), ("beta", 2), ("gamma", 1), ("orders", 4)])),
            ))
            .expect("context");

        assert_eq!(ctx.schema.tables.len(), 2);
        // `orders` is mentioned in the description, so it survives the cap.
        assert_eq!(ctx.schema.tables[0], "orders");
        assert_eq!(ctx.schema.tables[1], "alpha");
        assert_eq!(ctx.schema.omitted_tables, 2);
        assert_eq!(ctx.schema.columns_by_table["orders"].len(), 3);
        assert_eq!(ctx.schema.omitted_columns, 1 + 2);
        assert!(ctx.current_sql.is_none());
    }

    #[test]
    fn missing_inputs_fail() {
        let builder = ContextBuilder::default();
        assert_eq!(
            builder.build(inputs(OutputKind::Sql, None)).unwrap_err(),
            ContextBuildError::MissingSchema("main".to_string())
        );

        let mut no_placeholder = inputs(OutputKind::Sql, Some(schema(&[("orders", 3)])));
        no_placeholder.placeholder = None;
        assert_eq!(
            builder.build(no_placeholder).unwrap_err(),
            ContextBuildError::MissingPlaceholder
        );
    }

    #[test]
    fn empty_schema_only_allowed_for_reports() {
        let builder = ContextBuilder::default();
        let empty = Some(SchemaSummary::default());
        assert_eq!(
            builder.build(inputs(OutputKind::Chart, empty.clone())).unwrap_err(),
            ContextBuildError::EmptySchema(OutputKind::Chart)
        );
        assert!(builder.build(inputs(OutputKind::Report, empty)).is_ok());
    }

    #[test]
    fn long_text_is_truncated() {
        let builder = ContextBuilder::new(ContextLimits {
            max_text_chars: 10,
            ..Default::default()
        });
        let mut input = inputs(OutputKind::Report, Some(SchemaSummary::default()));
        input.task_description = "x".repeat(50);
        let ctx = builder.build(input).expect("context");
        assert_eq!(ctx.task_description, format!("{}...", "x".repeat(10)));
    }

    #[test]
    fn build_is_deterministic() {
        let builder = ContextBuilder::default();
        let s = Some(schema(&[("orders", 3), ("refunds", 2)]));
        let a = builder.build(inputs(OutputKind::Sql, s.clone())).expect("a");
        let b = builder.build(inputs(OutputKind::Sql, s)).expect("b");
        assert_eq!(a, b);
    }

    #[test]
    fn word_matching_respects_boundaries() {
        assert!(mentions_word("sum of orders.", "orders"));
        assert!(!mentions_word("preorders", "orders"));
        assert!(!mentions_word("orders_archive", "orders"));
    }
}
