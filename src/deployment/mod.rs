//! Deployment contexts
//!
//! A deployment is one application instance named by the identity tuple
//! (environment, data center, application, stripe, instance). It owns the
//! property store seeded from that identity and the per-environment
//! property files, resolves layered configuration documents on demand, and
//! renders the deployment's output tree.

mod copy;

use std::cell::OnceCell;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::builder::{builder_for_mode, BuildError, Builder};
use crate::document::{ConfigDocument, ConfigKind, DocumentError};
use crate::properties::{PropertyError, PropertyStore, SavePolicy};

pub use copy::IgnoreRules;

/// Property names under which the identity tuple is seeded
pub const ENVIRONMENT_KEY: &str = "ENVIRONMENT";
pub const DATA_CENTER_KEY: &str = "DATA_CENTER";
pub const REMOTE_DATA_CENTER_KEY: &str = "REMOTE_DATA_CENTER";
pub const APPLICATION_KEY: &str = "APPLICATION";
pub const STRIPE_KEY: &str = "STRIPE";
pub const INSTANCE_KEY: &str = "INSTANCE";

/// Common-layer configuration filename
pub const COMMON_PARAMS_FILE: &str = "common_params.json";

/// Instance-layer configuration filename
pub const APP_PARAMS_FILE: &str = "app_params.json";

/// Paired data centers for cross-site failover
const REMOTE_DATA_CENTERS: &[(&str, &str)] = &[
    ("AM1", "AM2"),
    ("AM2", "AM1"),
    ("AW1", "AW2"),
    ("AW2", "AW1"),
    ("EM1", "EM2"),
    ("EM2", "EM1"),
    ("AP1", "AP2"),
    ("AP2", "AP1"),
];

/// Errors raised while constructing or rendering a deployment
#[derive(Debug, thiserror::Error)]
pub enum DeploymentError {
    #[error("failed to load properties from {path}: {source}")]
    PropertyFile {
        path: PathBuf,
        source: PropertyError,
    },

    #[error(transparent)]
    Property(#[from] PropertyError),

    #[error("failed to parse configuration layer {path}: {source}")]
    LayerParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("missing configuration layer {path}")]
    MissingLayer { path: PathBuf },

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("unknown builder mode '{mode}'")]
    UnknownMode { mode: String },

    #[error(
        "substitution failed copying {source_path} to {destination} \
         at line {line}: unresolved reference '${{{name}}}'"
    )]
    CopySubstitution {
        source_path: PathBuf,
        destination: PathBuf,
        line: usize,
        name: String,
    },

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("glob pattern error: {0}")]
    Glob(#[from] globset::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The identity tuple uniquely naming one deployable instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub environment: String,
    pub data_center: String,
    pub application: String,
    pub stripe: String,
    pub instance: String,
}

impl Identity {
    /// `<application>-<stripe>-<instance>`, the short process/container name
    pub fn short_name(&self) -> String {
        format!("{}-{}-{}", self.application, self.stripe, self.instance)
    }

    /// Fully qualified hostname for this instance
    pub fn qualified_hostname(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}.rdti.com",
            self.environment, self.data_center, self.application, self.stripe, self.instance
        )
    }

    /// Relative output path: `deployments/<env>/<dc>/<app>/<stripe>/<instance>`
    pub fn output_path(&self) -> PathBuf {
        [
            "deployments",
            self.environment.as_str(),
            self.data_center.as_str(),
            self.application.as_str(),
            self.stripe.as_str(),
            self.instance.as_str(),
        ]
        .iter()
        .collect()
    }
}

/// Provenance record for one loaded configuration layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    /// Layer file path
    pub path: PathBuf,

    /// SHA-256 digest of the raw file bytes
    pub digest: String,
}

#[derive(Debug, Default)]
struct ResolvedConfig {
    document: ConfigDocument,
    sources: Vec<ConfigSource>,
}

/// One deployable application instance and its resolved configuration
pub struct Deployment {
    output_root: PathBuf,
    identity: Identity,
    common_dir: PathBuf,
    overrides_dir: PathBuf,
    properties: PropertyStore,
    builders: Vec<Box<dyn Builder>>,
    platform_config: OnceCell<ResolvedConfig>,
    container_config: OnceCell<ResolvedConfig>,
}

impl std::fmt::Debug for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployment")
            .field("identity", &self.identity)
            .field("common_dir", &self.common_dir)
            .field("overrides_dir", &self.overrides_dir)
            .finish()
    }
}

impl Deployment {
    /// Construct a deployment rooted at `root` with default directory
    /// conventions and the default `<application>.properties` file.
    pub fn new(root: impl Into<PathBuf>, identity: Identity) -> Result<Self, DeploymentError> {
        Self::with_layout(root, identity, None, None, None)
    }

    /// Construct a deployment with explicit property files and directories.
    ///
    /// `property_files` are resolved against the common directory and
    /// applied in reverse order, so the first-listed file wins conflicts.
    /// Directories default to `common/<environment>/<data_center>` and
    /// `overrides/<application>/<stripe>/<instance>` under the root.
    pub fn with_layout(
        root: impl Into<PathBuf>,
        identity: Identity,
        property_files: Option<Vec<String>>,
        common_dir: Option<PathBuf>,
        overrides_dir: Option<PathBuf>,
    ) -> Result<Self, DeploymentError> {
        let root = root.into();
        let common_dir = root.join(common_dir.unwrap_or_else(|| {
            ["common", identity.environment.as_str(), identity.data_center.as_str()]
                .iter()
                .collect()
        }));
        let overrides_dir = root.join(overrides_dir.unwrap_or_else(|| {
            [
                "overrides",
                identity.application.as_str(),
                identity.stripe.as_str(),
                identity.instance.as_str(),
            ]
            .iter()
            .collect()
        }));

        let files = property_files
            .unwrap_or_else(|| vec![format!("{}.properties", identity.application)]);
        let mut properties = PropertyStore::new();
        // Reverse application: the first-listed file's values land last
        // and win under UPSERT.
        for filename in files.iter().rev() {
            let path = common_dir.join(filename);
            let layer = PropertyStore::from_file(&path, SavePolicy::UPSERT)
                .map_err(|source| DeploymentError::PropertyFile { path, source })?;
            properties.merge_with(&layer, SavePolicy::UPSERT)?;
        }

        properties.save(ENVIRONMENT_KEY, identity.environment.as_str(), SavePolicy::RAISE_ON_EXISTING)?;
        properties.save(DATA_CENTER_KEY, identity.data_center.as_str(), SavePolicy::RAISE_ON_EXISTING)?;
        if let Some(remote) = remote_data_center(&identity.data_center) {
            properties.save(REMOTE_DATA_CENTER_KEY, remote, SavePolicy::RAISE_ON_EXISTING)?;
        } else {
            tracing::debug!(
                data_center = %identity.data_center,
                "no paired remote data center"
            );
        }
        properties.save(APPLICATION_KEY, identity.application.as_str(), SavePolicy::RAISE_ON_EXISTING)?;
        properties.save(STRIPE_KEY, identity.stripe.as_str(), SavePolicy::RAISE_ON_EXISTING)?;
        properties.save(INSTANCE_KEY, identity.instance.as_str(), SavePolicy::RAISE_ON_EXISTING)?;

        Ok(Self {
            output_root: root,
            identity,
            common_dir,
            overrides_dir,
            properties,
            builders: Vec::new(),
            platform_config: OnceCell::new(),
            container_config: OnceCell::new(),
        })
    }

    /// Render the output tree under a different root, leaving the input
    /// directories where they are. Used for scratch renders.
    pub fn with_output_root(mut self, output_root: impl Into<PathBuf>) -> Self {
        self.output_root = output_root.into();
        self
    }

    /// Register a builder, letting it seed derived properties first
    pub fn with_builder(mut self, builder: Box<dyn Builder>) -> Result<Self, DeploymentError> {
        builder.seed_properties(&mut self.properties)?;
        self.builders.push(builder);
        Ok(self)
    }

    /// Register builders by registry mode name
    pub fn with_builder_modes(mut self, modes: &[String]) -> Result<Self, DeploymentError> {
        for mode in modes {
            let builder = builder_for_mode(mode).ok_or_else(|| DeploymentError::UnknownMode {
                mode: mode.clone(),
            })?;
            self = self.with_builder(builder)?;
        }
        Ok(self)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn environment(&self) -> &str {
        &self.identity.environment
    }

    pub fn data_center(&self) -> &str {
        &self.identity.data_center
    }

    pub fn application(&self) -> &str {
        &self.identity.application
    }

    pub fn stripe(&self) -> &str {
        &self.identity.stripe
    }

    pub fn instance(&self) -> &str {
        &self.identity.instance
    }

    pub fn properties(&self) -> &PropertyStore {
        &self.properties
    }

    pub fn common_directory(&self) -> &Path {
        &self.common_dir
    }

    pub fn overrides_directory(&self) -> &Path {
        &self.overrides_dir
    }

    /// Output directory for this identity, derived purely from the tuple
    pub fn output_directory(&self) -> PathBuf {
        self.output_root.join(self.identity.output_path())
    }

    /// Run directory for this identity under a caller-supplied base
    pub fn run_directory(&self, base: &Path) -> PathBuf {
        base.join(&self.identity.application)
            .join(&self.identity.stripe)
            .join(&self.identity.instance)
    }

    /// The resolved configuration document for `kind`, computed on first
    /// use and cached.
    ///
    /// Layers merge over a `{"appName": <stripe>}` seed in fixed order:
    /// the common layer, then the instance override layer. A missing layer
    /// file is tolerated and logged. After merge the document is filtered
    /// to the kind's known keys and property references are expanded.
    pub fn configuration(&self, kind: ConfigKind) -> Result<&ConfigDocument, DeploymentError> {
        Ok(&self.resolved_config(kind)?.document)
    }

    /// Provenance for the layers that produced the `kind` configuration
    pub fn configuration_sources(&self, kind: ConfigKind) -> Result<&[ConfigSource], DeploymentError> {
        Ok(&self.resolved_config(kind)?.sources)
    }

    fn resolved_config(&self, kind: ConfigKind) -> Result<&ResolvedConfig, DeploymentError> {
        let cell = self.config_cell(kind);
        if let Some(resolved) = cell.get() {
            return Ok(resolved);
        }
        let resolved = self.resolve_configuration(kind)?;
        Ok(cell.get_or_init(|| resolved))
    }

    /// Fail unless both configuration layer files exist for this
    /// deployment, for callers that cannot tolerate a missing layer.
    pub fn require_configuration_layers(&self) -> Result<(), DeploymentError> {
        for path in self.layer_paths() {
            if !path.is_file() {
                return Err(DeploymentError::MissingLayer { path });
            }
        }
        Ok(())
    }

    fn config_cell(&self, kind: ConfigKind) -> &OnceCell<ResolvedConfig> {
        match kind {
            ConfigKind::PlatformProcess => &self.platform_config,
            ConfigKind::Container => &self.container_config,
        }
    }

    fn layer_paths(&self) -> [PathBuf; 2] {
        [
            self.common_dir.join(COMMON_PARAMS_FILE),
            self.overrides_dir.join(APP_PARAMS_FILE),
        ]
    }

    fn resolve_configuration(&self, kind: ConfigKind) -> Result<ResolvedConfig, DeploymentError> {
        let seed = serde_json::json!({ "appName": self.identity.stripe });
        let mut document = ConfigDocument::new().merge_with(&seed);
        let mut sources = Vec::new();

        for path in self.layer_paths() {
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    tracing::info!(path = %path.display(), "skipping absent configuration layer");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            let layer: serde_json::Value = serde_json::from_slice(&bytes)
                .map_err(|source| DeploymentError::LayerParse {
                    path: path.clone(),
                    source,
                })?;
            document = document.merge_with(&layer);
            sources.push(ConfigSource {
                path,
                digest: hex::encode(Sha256::digest(&bytes)),
            });
            tracing::debug!(kind = kind.name(), layers = sources.len(), "merged configuration layer");
        }

        let document = document
            .retain_known_keys(kind)
            .apply_properties(&self.properties)?;
        Ok(ResolvedConfig { document, sources })
    }

    /// Render the output tree for this deployment.
    ///
    /// Wipes any previous output, copies the instance tree, then the
    /// common tree (the instance layer wins collisions), applying per-line
    /// property substitution throughout, and finally runs every registered
    /// builder. Rendering is deterministic: repeated calls under unchanged
    /// inputs produce byte-identical trees.
    pub fn create(&self) -> Result<(), DeploymentError> {
        let output = self.output_directory();
        if output.is_dir() {
            fs::remove_dir_all(&output)?;
        }
        fs::create_dir_all(&output)?;

        let instance_ignores = IgnoreRules::new(&[APP_PARAMS_FILE, ".*"])?;
        copy::copy_tree(&self.overrides_dir, &output, &instance_ignores, &self.properties, false)?;

        let common_ignores = IgnoreRules::new(&[COMMON_PARAMS_FILE, "*.properties", ".*"])?;
        copy::copy_tree(&self.common_dir, &output, &common_ignores, &self.properties, true)?;

        for builder in &self.builders {
            builder.emit(self)?;
        }
        tracing::info!(
            output = %output.display(),
            deployment = %self.identity.short_name(),
            "rendered deployment"
        );
        Ok(())
    }
}

fn remote_data_center(data_center: &str) -> Option<&'static str> {
    REMOTE_DATA_CENTERS
        .iter()
        .find(|(local, _)| *local == data_center)
        .map(|(_, remote)| *remote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::PropertyValue;
    use std::fs;
    use tempfile::TempDir;

    fn identity() -> Identity {
        Identity {
            environment: "dev".to_string(),
            data_center: "AM1".to_string(),
            application: "historic-stream".to_string(),
            stripe: "OMS01".to_string(),
            instance: "primary".to_string(),
        }
    }

    fn seed_tree(root: &Path) {
        let common = root.join("common/dev/AM1");
        fs::create_dir_all(&common).unwrap();
        fs::write(
            common.join("historic-stream.properties"),
            "NETWORK_DEVICE=eth0\nADMIN_PORT=1501\n",
        )
        .unwrap();
        fs::write(
            common.join(COMMON_PARAMS_FILE),
            r#"{"vmArgs": {"memory": {"min": "1g", "max": "2g"}, "textAdmin": "${ADMIN_PORT}"}}"#,
        )
        .unwrap();
        fs::write(common.join("routes.conf"), "device=${NETWORK_DEVICE}\n").unwrap();

        let overrides = root.join("overrides/historic-stream/OMS01/primary");
        fs::create_dir_all(&overrides).unwrap();
        fs::write(
            overrides.join(APP_PARAMS_FILE),
            r#"{"vmArgs": {"memory": {"max": "3g"}}}"#,
        )
        .unwrap();
        fs::write(overrides.join("instance.conf"), "instance=${INSTANCE}\n").unwrap();
    }

    #[test]
    fn test_identity_seeded_into_properties() {
        let dir = TempDir::new().unwrap();
        seed_tree(dir.path());

        let deployment = Deployment::new(dir.path(), identity()).unwrap();
        let properties = deployment.properties();

        assert_eq!(properties.get(ENVIRONMENT_KEY), Some(&PropertyValue::from("dev")));
        assert_eq!(properties.get(DATA_CENTER_KEY), Some(&PropertyValue::from("AM1")));
        assert_eq!(properties.get(REMOTE_DATA_CENTER_KEY), Some(&PropertyValue::from("AM2")));
        assert_eq!(properties.get(APPLICATION_KEY), Some(&PropertyValue::from("historic-stream")));
        assert_eq!(properties.get(STRIPE_KEY), Some(&PropertyValue::from("OMS01")));
        assert_eq!(properties.get(INSTANCE_KEY), Some(&PropertyValue::from("primary")));
        assert_eq!(properties.get("NETWORK_DEVICE"), Some(&PropertyValue::from("eth0")));
    }

    #[test]
    fn test_identity_collision_with_property_file() {
        let dir = TempDir::new().unwrap();
        seed_tree(dir.path());
        fs::write(
            dir.path().join("common/dev/AM1/historic-stream.properties"),
            "ENVIRONMENT=qa\n",
        )
        .unwrap();

        let err = Deployment::new(dir.path(), identity()).unwrap_err();
        assert!(matches!(
            err,
            DeploymentError::Property(PropertyError::Conflict { .. })
        ));
    }

    #[test]
    fn test_missing_properties_file_fails() {
        let dir = TempDir::new().unwrap();

        let err = Deployment::new(dir.path(), identity()).unwrap_err();
        assert!(matches!(err, DeploymentError::PropertyFile { .. }));
    }

    #[test]
    fn test_first_listed_property_file_wins() {
        let dir = TempDir::new().unwrap();
        seed_tree(dir.path());
        let common = dir.path().join("common/dev/AM1");
        fs::write(common.join("site.properties"), "SHARED=site\nONLY_SITE=1\n").unwrap();
        fs::write(
            common.join("historic-stream.properties"),
            "SHARED=app\nONLY_APP=2\n",
        )
        .unwrap();

        let deployment = Deployment::with_layout(
            dir.path(),
            identity(),
            Some(vec![
                "historic-stream.properties".to_string(),
                "site.properties".to_string(),
            ]),
            None,
            None,
        )
        .unwrap();

        let properties = deployment.properties();
        assert_eq!(properties.get("SHARED"), Some(&PropertyValue::from("app")));
        assert_eq!(properties.get("ONLY_SITE"), Some(&PropertyValue::from("1")));
        assert_eq!(properties.get("ONLY_APP"), Some(&PropertyValue::from("2")));
    }

    #[test]
    fn test_configuration_merges_layers_and_substitutes() {
        let dir = TempDir::new().unwrap();
        seed_tree(dir.path());

        let deployment = Deployment::new(dir.path(), identity()).unwrap();
        let document = deployment.configuration(ConfigKind::PlatformProcess).unwrap();

        let view = document.platform_process();
        assert_eq!(view.min_heap().as_deref(), Some("1g"));
        assert_eq!(view.max_heap().as_deref(), Some("3g"));
        assert_eq!(view.text_admin_port(), Some(1501));
        assert_eq!(document.app_name(), Some("OMS01"));
    }

    #[test]
    fn test_configuration_sources_record_digests() {
        let dir = TempDir::new().unwrap();
        seed_tree(dir.path());

        let deployment = Deployment::new(dir.path(), identity()).unwrap();
        let sources = deployment.configuration_sources(ConfigKind::PlatformProcess).unwrap();

        assert_eq!(sources.len(), 2);
        assert!(sources[0].path.ends_with("common_params.json"));
        assert!(sources[1].path.ends_with("app_params.json"));
        assert_eq!(sources[0].digest.len(), 64);
    }

    #[test]
    fn test_configuration_tolerates_missing_layers() {
        let dir = TempDir::new().unwrap();
        seed_tree(dir.path());
        fs::remove_file(dir.path().join("overrides/historic-stream/OMS01/primary/app_params.json")).unwrap();

        let deployment = Deployment::new(dir.path(), identity()).unwrap();
        let document = deployment.configuration(ConfigKind::PlatformProcess).unwrap();
        assert_eq!(document.platform_process().max_heap().as_deref(), Some("2g"));

        assert!(matches!(
            deployment.require_configuration_layers(),
            Err(DeploymentError::MissingLayer { .. })
        ));
    }

    #[test]
    fn test_create_renders_both_layers() {
        let dir = TempDir::new().unwrap();
        seed_tree(dir.path());

        let deployment = Deployment::new(dir.path(), identity()).unwrap();
        deployment.create().unwrap();

        let output = deployment.output_directory();
        assert_eq!(
            fs::read_to_string(output.join("instance.conf")).unwrap(),
            "instance=primary\n"
        );
        assert_eq!(
            fs::read_to_string(output.join("routes.conf")).unwrap(),
            "device=eth0\n"
        );
        // Layer source files are excluded from the rendered tree
        assert!(!output.join(APP_PARAMS_FILE).exists());
        assert!(!output.join(COMMON_PARAMS_FILE).exists());
        assert!(!output.join("historic-stream.properties").exists());
    }

    #[test]
    fn test_create_instance_layer_wins_collisions() {
        let dir = TempDir::new().unwrap();
        seed_tree(dir.path());
        fs::write(dir.path().join("common/dev/AM1/shared.conf"), "layer=common\n").unwrap();
        fs::write(
            dir.path().join("overrides/historic-stream/OMS01/primary/shared.conf"),
            "layer=instance\n",
        )
        .unwrap();

        let deployment = Deployment::new(dir.path(), identity()).unwrap();
        deployment.create().unwrap();

        assert_eq!(
            fs::read_to_string(deployment.output_directory().join("shared.conf")).unwrap(),
            "layer=instance\n"
        );
    }

    #[test]
    fn test_create_is_idempotent() {
        let dir = TempDir::new().unwrap();
        seed_tree(dir.path());

        let deployment = Deployment::new(dir.path(), identity()).unwrap();
        deployment.create().unwrap();
        let first = fs::read_to_string(deployment.output_directory().join("routes.conf")).unwrap();
        // Stale content must not leak into the regenerated tree
        fs::write(deployment.output_directory().join("stale.txt"), "old").unwrap();

        deployment.create().unwrap();
        let second = fs::read_to_string(deployment.output_directory().join("routes.conf")).unwrap();
        assert_eq!(first, second);
        assert!(!deployment.output_directory().join("stale.txt").exists());
    }

    #[test]
    fn test_create_reports_substitution_context() {
        let dir = TempDir::new().unwrap();
        seed_tree(dir.path());
        fs::write(
            dir.path().join("overrides/historic-stream/OMS01/primary/broken.conf"),
            "ok line\nbad=${NOT_A_PROPERTY}\n",
        )
        .unwrap();

        let deployment = Deployment::new(dir.path(), identity()).unwrap();
        let err = deployment.create().unwrap_err();

        match err {
            DeploymentError::CopySubstitution {
                source_path,
                line,
                name,
                ..
            } => {
                assert!(source_path.ends_with("broken.conf"));
                assert_eq!(line, 2);
                assert_eq!(name, "NOT_A_PROPERTY");
            }
            other => panic!("expected CopySubstitution, got {:?}", other),
        }
    }

    #[test]
    fn test_output_directory_shape() {
        let dir = TempDir::new().unwrap();
        seed_tree(dir.path());

        let deployment = Deployment::new(dir.path(), identity()).unwrap();
        let output = deployment.output_directory();

        assert!(output.ends_with("deployments/dev/AM1/historic-stream/OMS01/primary"));
    }
}
