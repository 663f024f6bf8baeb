//! File-backed catalog of templates, schedules and data sources.
//!
//! Stands in for the template and scheduling services: the binary loads it
//! from `CATALOG_PATH` (YAML or JSON) and serves placeholder and schedule
//! lookups from memory.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::providers::{PlaceholderProvider, ScheduleProvider};
use super::{PlaceholderInfo, TimeWindowSpec};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub templates: Vec<TemplateEntry>,
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
    #[serde(default)]
    pub data_sources: Vec<DataSourceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateEntry {
    pub id: String,
    #[serde(default)]
    pub placeholders: Vec<PlaceholderEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceholderEntry {
    pub id: String,
    #[serde(flatten)]
    pub info: PlaceholderInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    #[serde(flatten)]
    pub spec: TimeWindowSpec,
}

/// A SQLite file registered as a data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceEntry {
    pub id: String,
    pub path: PathBuf,
}

impl Catalog {
    /// Load from a file; YAML is a superset of JSON so one parser covers both.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        Self::from_yaml_str(&text)
            .with_context(|| format!("Failed to parse catalog {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn placeholder(&self, template_id: &str, placeholder_id: &str) -> Option<&PlaceholderInfo> {
        self.templates
            .iter()
            .find(|t| t.id == template_id)?
            .placeholders
            .iter()
            .find(|p| p.id == placeholder_id)
            .map(|p| &p.info)
    }

    pub fn schedule(&self, schedule_ref: &str) -> Option<&TimeWindowSpec> {
        self.schedules
            .iter()
            .find(|s| s.id == schedule_ref)
            .map(|s| &s.spec)
    }
}

#[async_trait]
impl PlaceholderProvider for Catalog {
    async fn placeholder_context(
        &self,
        template_id: &str,
        placeholder_id: &str,
    ) -> anyhow::Result<Option<PlaceholderInfo>> {
        Ok(self.placeholder(template_id, placeholder_id).cloned())
    }
}

#[async_trait]
impl ScheduleProvider for Catalog {
    async fn time_window_spec(&self, schedule_ref: &str) -> anyhow::Result<Option<TimeWindowSpec>> {
        Ok(self.schedule(schedule_ref).cloned())
    }
}
