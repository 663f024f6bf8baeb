//! Which tool failures end a task, per output kind.

use std::collections::HashMap;

use crate::task::OutputKind;

/// Tools whose failure fails the task instead of being skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct FatalToolPolicy {
    by_kind: HashMap<OutputKind, Vec<String>>,
}

impl Default for FatalToolPolicy {
    fn default() -> Self {
        let mut by_kind = HashMap::new();
        by_kind.insert(OutputKind::Sql, vec!["sql.execute".to_string()]);
        by_kind.insert(
            OutputKind::Chart,
            vec!["sql.execute".to_string(), "chart.build".to_string()],
        );
        by_kind.insert(OutputKind::Report, Vec::new());
        Self { by_kind }
    }
}

impl FatalToolPolicy {
    /// Parse `sql=sql.execute;chart=sql.execute,chart.build;report=`.
    ///
    /// Kinds not mentioned keep their defaults.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut policy = Self::default();
        for entry in spec.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (kind, tools) = entry
                .split_once('=')
                .ok_or_else(|| format!("expected `kind=tool,...`, got `{}`", entry))?;
            let kind: OutputKind = kind.trim().parse().map_err(|e| format!("{}", e))?;
            let tools = tools
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            policy.by_kind.insert(kind, tools);
        }
        Ok(policy)
    }

    pub fn fatal_tools(&self, kind: OutputKind) -> &[String] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_fatal(&self, kind: OutputKind, tool: &str) -> bool {
        self.fatal_tools(kind).iter().any(|t| t == tool)
    }
}
