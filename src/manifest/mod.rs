//! Fleet manifest
//!
//! Parses and validates `fleet.json` at the configuration root. Each
//! entry names one deployment by its identity tuple, optionally with
//! explicit property files, directories, and builder modes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::deployment::{Deployment, DeploymentError, Identity};

/// Manifest filename looked up under the configuration root
pub const FLEET_MANIFEST: &str = "fleet.json";

/// Errors raised while loading the fleet manifest
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("fleet manifest not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read fleet manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse fleet manifest: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("duplicate deployment entry: {0}")]
    DuplicateEntry(String),

    #[error(transparent)]
    Deployment(#[from] DeploymentError),
}

/// One manifest entry describing a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(flatten)]
    pub identity: Identity,

    /// Property files resolved against the common directory; first wins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<String>>,

    /// Common directory override, relative to the root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_dir: Option<PathBuf>,

    /// Overrides directory override, relative to the root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides_dir: Option<PathBuf>,

    /// Builder modes resolved through the builder registry
    #[serde(default)]
    pub builders: Vec<String>,
}

/// Parse manifest entries from a JSON string and validate them
pub fn parse(content: &str) -> Result<Vec<ManifestEntry>, ManifestError> {
    let entries: Vec<ManifestEntry> = serde_json::from_str(content)?;
    let mut seen = std::collections::HashSet::new();
    for entry in &entries {
        let key = format!(
            "{}/{}/{}",
            entry.identity.environment,
            entry.identity.data_center,
            entry.identity.short_name()
        );
        if !seen.insert(key.clone()) {
            return Err(ManifestError::DuplicateEntry(key));
        }
    }
    Ok(entries)
}

/// Load `fleet.json` under `root` and construct every deployment it names
pub fn load_fleet(root: &Path) -> Result<Vec<Deployment>, ManifestError> {
    let path = root.join(FLEET_MANIFEST);
    if !path.is_file() {
        return Err(ManifestError::NotFound(path));
    }
    let content = std::fs::read_to_string(&path)?;
    let entries = parse(&content)?;
    tracing::debug!(count = entries.len(), manifest = %path.display(), "loaded fleet manifest");

    entries
        .into_iter()
        .map(|entry| build_deployment(root, entry))
        .collect()
}

fn build_deployment(root: &Path, entry: ManifestEntry) -> Result<Deployment, ManifestError> {
    let deployment = Deployment::with_layout(
        root,
        entry.identity,
        entry.properties,
        entry.common_dir,
        entry.overrides_dir,
    )?
    .with_builder_modes(&entry.builders)?;
    Ok(deployment)
}
