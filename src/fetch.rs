//! Remote registry fetcher.
//!
//! Downloads the registries meta-repository archive, discovers the registry
//! sub-repositories it contains, and fetches each registry's generated data
//! file. Discovery failures are fatal; per-registry failures are logged and
//! skipped so one broken registry never hides the rest.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::FetcherConfig;
use crate::error::IndexError;
use crate::models::RegistryDocument;

/// Owner of the registry sub-repositories (e.g. `v1nvn/enhansome-go`).
pub const REGISTRY_OWNER: &str = "v1nvn";

/// Common name prefix of registry sub-repositories, stripped to obtain the
/// normalized registry name.
pub const NAME_PREFIX: &str = "enhansome-";

/// Normalizes a raw registry identifier to its short name.
///
/// Strips the owner component (`v1nvn/enhansome-go` → `enhansome-go`) and
/// the name prefix (`enhansome-go` → `go`). Pure and idempotent; inputs
/// without either prefix pass through unchanged.
pub fn extract_registry_name(raw: &str) -> String {
    let mut name = raw.rsplit('/').next().unwrap_or(raw);
    while let Some(stripped) = name.strip_prefix(NAME_PREFIX) {
        name = stripped;
    }
    name.to_string()
}

/// Parses a registries archive and lists the sub-repository identifiers it
/// contains.
///
/// The recognized layout is a zip with a single root directory holding one
/// directory per registry sub-repository. Hidden directories are ignored.
/// Returns a deduplicated, sorted set of `owner/repo` identifiers.
pub fn list_archive_registries(bytes: &[u8]) -> Result<Vec<String>, IndexError> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor)
        .map_err(|e| IndexError::Discovery(format!("could not read archive: {}", e)))?;

    let mut names: BTreeSet<String> = BTreeSet::new();
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| IndexError::Discovery(format!("could not read archive entry: {}", e)))?;
        // Paths look like `<root>/<registry-dir>/...`; the second component
        // is the registry directory.
        let mut components = entry.name().split('/');
        let _root = components.next();
        if let Some(dir) = components.next() {
            if dir.is_empty() || dir.starts_with('.') {
                continue;
            }
            // A bare file at the root (README etc.) has no third component.
            if components.next().is_none() && !entry.name().ends_with('/') {
                continue;
            }
            names.insert(format!("{}/{}", REGISTRY_OWNER, dir));
        }
    }

    if names.is_empty() {
        return Err(IndexError::Discovery(
            "no registry directories found in archive (unrecognized listing format)".to_string(),
        ));
    }

    Ok(names.into_iter().collect())
}

/// Source of parsed registry documents. The orchestrator depends on this
/// seam; the HTTP fetcher implements it and tests stub it.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    /// Fetches and parses the data file of every discoverable registry.
    ///
    /// Returns a partial mapping from normalized registry name to document:
    /// registries whose data file is missing, unreachable, or malformed are
    /// skipped. Discovery failure is the only fatal error.
    async fn fetch_registry_files(&self) -> Result<BTreeMap<String, RegistryDocument>>;
}

/// Fetcher backed by real HTTP: archive download plus per-registry raw
/// data-file fetches.
pub struct HttpRegistryFetcher {
    client: reqwest::Client,
    archive_url: String,
    data_url_template: String,
}

impl HttpRegistryFetcher {
    /// Builds a fetcher from config, optionally re-pointing the archive URL
    /// (used by manual re-index triggers and tests).
    pub fn new(config: &FetcherConfig, archive_override: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            archive_url: archive_override.unwrap_or_else(|| config.archive_url.clone()),
            data_url_template: config.data_url_template.clone(),
        })
    }

    /// Downloads the archive and lists registry sub-repository identifiers.
    pub async fn discover_registries(&self) -> Result<Vec<String>, IndexError> {
        debug!(url = %self.archive_url, "downloading registries archive");
        let response = self
            .client
            .get(&self.archive_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| IndexError::Discovery(format!("archive fetch failed: {}", e)))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| IndexError::Discovery(format!("archive read failed: {}", e)))?;

        list_archive_registries(&bytes)
    }

    async fn fetch_one(&self, repo_id: &str) -> Result<RegistryDocument, IndexError> {
        let url = self.data_url_template.replace("{repo}", repo_id);
        let doc = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| IndexError::Fetch {
                registry: repo_id.to_string(),
                message: e.to_string(),
            })?
            .json::<RegistryDocument>()
            .await
            .map_err(|e| IndexError::Fetch {
                registry: repo_id.to_string(),
                message: format!("invalid registry document: {}", e),
            })?;
        Ok(doc)
    }
}

#[async_trait]
impl RegistrySource for HttpRegistryFetcher {
    async fn fetch_registry_files(&self) -> Result<BTreeMap<String, RegistryDocument>> {
        let repo_ids = self.discover_registries().await?;

        let mut documents = BTreeMap::new();
        for repo_id in &repo_ids {
            let name = extract_registry_name(repo_id);
            match self.fetch_one(repo_id).await {
                Ok(doc) => {
                    documents.insert(name, doc);
                }
                Err(e) => {
                    // Skipped, not fatal: the overall call returns a
                    // partial mapping.
                    warn!(registry = %repo_id, error = %e, "skipping registry");
                }
            }
        }

        Ok(documents)
    }
}
