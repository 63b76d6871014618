//! Core data models used throughout Awesome Index.
//!
//! These types represent parsed registry documents, the relational rows the
//! normalizer writes, indexing run bookkeeping, and the derived search
//! documents that flow through the query engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============ Parsed registry documents ============

/// A registry's generated data file, as published by its source repository.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryDocument {
    pub metadata: RegistryDocMeta,
    #[serde(default)]
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryDocMeta {
    #[serde(default)]
    pub name: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// `owner/name` of the repository the registry was generated from.
    #[serde(default)]
    pub source_repository: Option<String>,
}

/// A category section. Sections may nest; the section title becomes the
/// category label for the items directly under it.
#[derive(Debug, Clone, Deserialize)]
pub struct Section {
    pub title: String,
    #[serde(default)]
    pub items: Vec<RawItem>,
    #[serde(default)]
    pub subsections: Vec<Section>,
}

/// An entry in a registry, optionally backed by a GitHub repository.
#[derive(Debug, Clone, Deserialize)]
pub struct RawItem {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub repo: Option<RepoInfo>,
}

/// GitHub metadata attached to an item by the upstream enrichment step.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoInfo {
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub stars: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub last_commit: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived: bool,
}

// ============ Relational rows ============

/// One row per registry: identity plus aggregate stats, rewritten wholesale
/// on each successful indexing run.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryMetadata {
    pub name: String,
    pub title: String,
    pub description: Option<String>,
    pub source_repository: Option<String>,
    pub total_repos: i64,
    pub total_stars: i64,
    pub last_updated: i64,
}

// ============ Indexing runs ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Manual,
    Scheduled,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Scheduled => "scheduled",
        }
    }
}

/// History record for a single orchestrator execution. Created in `running`
/// state and finalized exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct IndexRun {
    pub id: String,
    pub trigger_source: String,
    pub status: RunStatus,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub total_registries: i64,
    pub processed_registries: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub current_registry: Option<String>,
    pub errors: Vec<String>,
    pub error_message: Option<String>,
    /// Truncated API-key suffix for manual runs.
    pub created_by: Option<String>,
}

// ============ Search documents ============

/// Flattened projection of a registry item (plus its repository, when one
/// exists) used solely to build the search index. Never a source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchDocument {
    pub id: String,
    pub registry: String,
    pub title: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub categories: Vec<String>,
    pub language: Option<String>,
    pub stars: i64,
    pub last_commit: Option<i64>,
    pub archived: bool,
}

/// A ranked item returned by the query engine.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub id: String,
    pub registry: String,
    pub title: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub category: Option<String>,
    pub language: Option<String>,
    pub stars: i64,
    pub last_commit: Option<i64>,
    pub archived: bool,
    pub score: f64,
}

impl SearchDocument {
    pub fn into_result(self, score: f64) -> SearchResultItem {
        SearchResultItem {
            id: self.id,
            registry: self.registry,
            title: self.title,
            description: self.description,
            url: self.url,
            category: self.categories.first().cloned(),
            language: self.language,
            stars: self.stars,
            last_commit: self.last_commit,
            archived: self.archived,
            score,
        }
    }
}
