//! Deployment runner
//!
//! Takes a rendered deployment from the configuration root to a running
//! process: validates the checked-in rendered tree against a fresh
//! render, prepares the run directory (preserving `logs/` and `data/`),
//! unpacks the application artifact, stamps a run receipt, and hands the
//! command to the mode's builder for execution.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::ExitStatus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::builder::{command_builder_for_mode, BuildError};
use crate::deployment::{Deployment, DeploymentError, Identity};
use crate::location::Location;
use crate::manifest::{self, ManifestEntry, ManifestError};

/// Host settings filename looked up under the configuration root
pub const SETTINGS_FILE: &str = "fleetboot.toml";

/// Receipt written into the run directory on every execution
pub const RUN_RECEIPT_FILE: &str = ".fleetboot-run.json";

/// Run-directory entries preserved across runs
const PRESERVED_RUN_PATHS: &[&str] = &["logs", "data"];

/// Errors raised while preparing or executing a run
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to parse settings {path}: {source}")]
    Settings {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to parse version info {path}: {source}")]
    VersionInfo {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(
        "no deployment found for environment={environment}, data center={data_center}, \
         application={application}, stripe={stripe}, instance={instance}"
    )]
    DeploymentNotFound {
        environment: String,
        data_center: String,
        application: String,
        stripe: String,
        instance: String,
    },

    #[error("unknown run mode '{mode}'")]
    UnknownMode { mode: String },

    #[error("rendered tree missing at {path}; run the deploy step first")]
    MissingRenderedTree { path: PathBuf },

    #[error("rendered configuration drifts from the checked-in tree: {0}")]
    RenderedDrift(DriftReport),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Deployment(#[from] DeploymentError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("failed to serialize run receipt: {0}")]
    Receipt(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Paths that differ between a fresh render and the checked-in tree
#[derive(Debug, Clone, Default)]
pub struct DriftReport {
    /// Present in both, contents differ
    pub modified: Vec<PathBuf>,

    /// Produced by a fresh render, absent from the checked-in tree
    pub missing: Vec<PathBuf>,

    /// Present in the checked-in tree, not produced by a fresh render
    pub extra: Vec<PathBuf>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.modified.is_empty() && self.missing.is_empty() && self.extra.is_empty()
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut sections = Vec::new();
        for (label, paths) in [
            ("modified", &self.modified),
            ("missing", &self.missing),
            ("extra", &self.extra),
        ] {
            if !paths.is_empty() {
                let joined = paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                sections.push(format!("{} [{}]", label, joined));
            }
        }
        f.write_str(&sections.join("; "))
    }
}

/// Host-level runner settings, loaded from `fleetboot.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Base directory for run directories, resolved against the root
    /// when relative
    #[serde(default = "default_run_directory_base")]
    pub run_directory_base: PathBuf,

    /// Optional version-info JSON file, resolved against the root when
    /// relative
    #[serde(default)]
    pub versions_file: Option<PathBuf>,
}

fn default_run_directory_base() -> PathBuf {
    PathBuf::from("runs")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            run_directory_base: default_run_directory_base(),
            versions_file: None,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self, RunnerError> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|source| RunnerError::Settings {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `fleetboot.toml` under `root` when present, defaults otherwise
    pub fn load_or_default(root: &Path) -> Result<Self, RunnerError> {
        let path = root.join(SETTINGS_FILE);
        if path.is_file() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Version metadata for the application under deployment.
///
/// Produced by an external metadata service in production; any source
/// implementing `VersionInfoSource` will do.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(default)]
    pub image_name: Option<String>,

    #[serde(default)]
    pub image_version: Option<String>,

    #[serde(default)]
    pub artifact_package: Option<String>,

    #[serde(default)]
    pub artifact_name: Option<String>,

    #[serde(default)]
    pub artifact_version: Option<String>,

    /// Local path to the application artifact tarball
    #[serde(default)]
    pub artifact_path: Option<PathBuf>,

    #[serde(default)]
    pub git_repository: Option<String>,

    #[serde(default)]
    pub configuration_version: Option<String>,
}

/// A source of version metadata
pub trait VersionInfoSource {
    fn fetch(&self) -> Result<VersionInfo, RunnerError>;
}

/// Version metadata read from a local JSON file
#[derive(Debug, Clone)]
pub struct FileVersionSource {
    path: PathBuf,
}

impl FileVersionSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl VersionInfoSource for FileVersionSource {
    fn fetch(&self) -> Result<VersionInfo, RunnerError> {
        let content = fs::read_to_string(&self.path)?;
        serde_json::from_str(&content).map_err(|source| RunnerError::VersionInfo {
            path: self.path.clone(),
            source,
        })
    }
}

/// Execution context handed to a command builder
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Directory the command runs from
    pub run_directory: PathBuf,

    /// Configuration root the run directory is relative to
    pub root: PathBuf,

    /// Version metadata for image and artifact resolution
    pub version_info: VersionInfo,
}

impl RunContext {
    /// `<image_name>:<image_version>` when version info names an image
    pub fn image_reference(&self) -> Option<String> {
        match (&self.version_info.image_name, &self.version_info.image_version) {
            (Some(name), Some(version)) => Some(format!("{}:{}", name, version)),
            (Some(name), None) => Some(name.clone()),
            _ => None,
        }
    }
}

/// Record of one execution, written into the run directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReceipt {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub identity: Identity,
    pub mode: String,
    pub version: VersionInfo,
}

/// Drives a deployment from rendered tree to running process
#[derive(Debug)]
pub struct DeploymentRunner {
    root: PathBuf,
    settings: Settings,
}

impl DeploymentRunner {
    pub fn new(root: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            root: root.into(),
            settings,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Manifest entries under this runner's root
    pub fn entries(&self) -> Result<Vec<ManifestEntry>, RunnerError> {
        let path = self.root.join(manifest::FLEET_MANIFEST);
        if !path.is_file() {
            return Err(ManifestError::NotFound(path).into());
        }
        Ok(manifest::parse(&fs::read_to_string(path)?)?)
    }

    /// Find the entry matching a location and application coordinates
    pub fn find_entry(
        &self,
        location: &Location,
        application: &str,
        stripe: &str,
        instance: &str,
    ) -> Result<ManifestEntry, RunnerError> {
        self.entries()?
            .into_iter()
            .find(|entry| {
                entry.identity.environment == location.environment()
                    && entry.identity.data_center == location.data_center()
                    && entry.identity.application == application
                    && entry.identity.stripe == stripe
                    && entry.identity.instance == instance
            })
            .ok_or_else(|| RunnerError::DeploymentNotFound {
                environment: location.environment().to_string(),
                data_center: location.data_center().to_string(),
                application: application.to_string(),
                stripe: stripe.to_string(),
                instance: instance.to_string(),
            })
    }

    /// Construct the deployment an entry describes, rooted here
    pub fn deployment(&self, entry: &ManifestEntry) -> Result<Deployment, RunnerError> {
        let deployment = Deployment::with_layout(
            &self.root,
            entry.identity.clone(),
            entry.properties.clone(),
            entry.common_dir.clone(),
            entry.overrides_dir.clone(),
        )?
        .with_builder_modes(&entry.builders)?;
        Ok(deployment)
    }

    /// Compare the checked-in rendered tree against a fresh render.
    ///
    /// The entry is re-rendered into a scratch directory and both trees
    /// are digested file by file; any difference fails with the full
    /// drift report.
    pub fn validate(&self, entry: &ManifestEntry) -> Result<(), RunnerError> {
        let checked_in = self
            .deployment(entry)?
            .output_directory();
        if !checked_in.is_dir() {
            return Err(RunnerError::MissingRenderedTree { path: checked_in });
        }

        let scratch = tempfile::tempdir()?;
        let fresh = Deployment::with_layout(
            &self.root,
            entry.identity.clone(),
            entry.properties.clone(),
            entry.common_dir.clone(),
            entry.overrides_dir.clone(),
        )?
        .with_builder_modes(&entry.builders)?
        .with_output_root(scratch.path());
        fresh.create()?;

        let expected = digest_tree(&fresh.output_directory())?;
        let actual = digest_tree(&checked_in)?;

        let mut report = DriftReport::default();
        for (path, digest) in &expected {
            match actual.get(path) {
                Some(checked) if checked == digest => {}
                Some(_) => report.modified.push(path.clone()),
                None => report.missing.push(path.clone()),
            }
        }
        for path in actual.keys() {
            if !expected.contains_key(path) {
                report.extra.push(path.clone());
            }
        }

        if report.is_clean() {
            tracing::debug!(deployment = %entry.identity.short_name(), "rendered tree matches");
            Ok(())
        } else {
            Err(RunnerError::RenderedDrift(report))
        }
    }

    /// Version metadata from the configured versions file, empty when
    /// none is configured
    pub fn version_info(&self) -> Result<VersionInfo, RunnerError> {
        match &self.settings.versions_file {
            Some(path) => {
                let path = if path.is_absolute() {
                    path.clone()
                } else {
                    self.root.join(path)
                };
                FileVersionSource::new(path).fetch()
            }
            None => Ok(VersionInfo::default()),
        }
    }

    /// The run directory for an entry's deployment
    pub fn run_directory(&self, deployment: &Deployment) -> PathBuf {
        let base = if self.settings.run_directory_base.is_absolute() {
            self.settings.run_directory_base.clone()
        } else {
            self.root.join(&self.settings.run_directory_base)
        };
        deployment.run_directory(&base)
    }

    /// Prepare the run directory: clear stale entries (keeping `logs/`
    /// and `data/`), copy in the checked-in rendered tree, and unpack the
    /// application artifact without overwriting rendered files.
    pub fn prepare_run_directory(
        &self,
        deployment: &Deployment,
        version_info: &VersionInfo,
    ) -> Result<PathBuf, RunnerError> {
        let rendered = deployment.output_directory();
        if !rendered.is_dir() {
            return Err(RunnerError::MissingRenderedTree { path: rendered });
        }

        let run_directory = self.run_directory(deployment);
        if run_directory.is_dir() {
            remove_stale_paths(&run_directory)?;
        } else {
            fs::create_dir_all(&run_directory)?;
        }

        copy_plain_tree(&rendered, &run_directory)?;

        if let Some(artifact) = &version_info.artifact_path {
            let artifact = if artifact.is_absolute() {
                artifact.clone()
            } else {
                self.root.join(artifact)
            };
            unpack_artifact(&artifact, &run_directory)?;
        }
        Ok(run_directory)
    }

    /// Validate (unless skipped), prepare the run directory, stamp a
    /// receipt, and execute the mode's command builder.
    pub fn run(
        &self,
        entry: &ManifestEntry,
        mode: &str,
        skip_validation: bool,
    ) -> Result<ExitStatus, RunnerError> {
        let builder =
            command_builder_for_mode(mode).ok_or_else(|| RunnerError::UnknownMode {
                mode: mode.to_string(),
            })?;

        if skip_validation {
            tracing::warn!("skipping rendered-tree validation");
        } else {
            self.validate(entry)?;
        }

        let deployment = self.deployment(entry)?;
        let version_info = self.version_info()?;
        let run_directory = self.prepare_run_directory(&deployment, &version_info)?;

        let receipt = RunReceipt {
            run_id: ulid::Ulid::new().to_string(),
            created_at: Utc::now(),
            identity: deployment.identity().clone(),
            mode: mode.to_string(),
            version: version_info.clone(),
        };
        fs::write(
            run_directory.join(RUN_RECEIPT_FILE),
            serde_json::to_string_pretty(&receipt)?,
        )?;
        tracing::info!(run_id = %receipt.run_id, mode, "executing deployment");

        let context = RunContext {
            run_directory,
            root: self.root.clone(),
            version_info,
        };
        Ok(builder.execute(&deployment, &context)?)
    }
}

/// Digest every file under `root`, keyed by relative path
fn digest_tree(root: &Path) -> Result<BTreeMap<PathBuf, String>, std::io::Error> {
    let mut digests = BTreeMap::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| std::io::Error::other("walked path escaped tree root"))?
            .to_path_buf();
        let bytes = fs::read(entry.path())?;
        digests.insert(relative, hex::encode(Sha256::digest(&bytes)));
    }
    Ok(digests)
}

/// Remove everything under a run directory except the preserved entries
fn remove_stale_paths(run_directory: &Path) -> Result<(), std::io::Error> {
    for entry in fs::read_dir(run_directory)? {
        let entry = entry?;
        let name = entry.file_name();
        if PRESERVED_RUN_PATHS.iter().any(|keep| name == *keep) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Copy a rendered tree verbatim, preserving permissions
fn copy_plain_tree(source: &Path, destination: &Path) -> Result<(), std::io::Error> {
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| std::io::Error::other("walked path escaped source root"))?;
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Unpack an application artifact into the run directory.
///
/// The leading path component of every archive member is dropped, paths
/// escaping the run directory are refused, and existing files are never
/// overwritten.
fn unpack_artifact(archive_path: &Path, run_directory: &Path) -> Result<(), RunnerError> {
    let file = fs::File::open(archive_path)?;
    let mut archive = tar::Archive::new(file);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        let mut components = path.components();
        components.next();
        let stripped = components.as_path().to_path_buf();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        if stripped
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            tracing::warn!(path = %path.display(), "refusing archive member escaping run directory");
            continue;
        }

        let target = run_directory.join(&stripped);
        if entry.header().entry_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if !target.exists() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            entry.unpack(&target)?;
        }
    }
    Ok(())
}
