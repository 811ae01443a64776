//! Stream command-file builders
//!
//! Platform applications read line-oriented command files at startup.
//! These builders seed the multicast endpoint properties every stream
//! deployment shares, then render their command files into the
//! deployment's configuration directory with property substitution.

use std::fs;
use std::io::Write;

use crate::deployment::{Deployment, DATA_CENTER_KEY, ENVIRONMENT_KEY, APPLICATION_KEY};
use crate::document::ConfigKind;
use crate::properties::{PropertyStore, SavePolicy};

use super::{BuildError, Builder};

/// Property naming the per-application multicast id; must be supplied by
/// a property file and lie in (0, 25]
pub const APPLICATION_ID_KEY: &str = "MC_APPLICATION_ID";

/// Property naming the interface multicast traffic binds to
pub const NETWORK_DEVICE_KEY: &str = "NETWORK_DEVICE";

pub const REGION_KEY: &str = "MC_REGION";
pub const DATA_CENTER_CODE_KEY: &str = "MC_DATA_CENTER";
pub const ENVIRONMENT_CODE_KEY: &str = "MC_ENVIRONMENT";

pub const UPSTREAM_KEY: &str = "MC_UPSTREAM";
pub const UPSTREAM_PORT_KEY: &str = "MC_UPSTREAM_PORT";
pub const UPSTREAM_IFNAME_KEY: &str = "MC_UPSTREAM_IFNAME";
pub const DOWNSTREAM_KEY: &str = "MC_DOWNSTREAM";
pub const DOWNSTREAM_PORT_KEY: &str = "MC_DOWNSTREAM_PORT";
pub const DOWNSTREAM_IFNAME_KEY: &str = "MC_DOWNSTREAM_IFNAME";
pub const STATUS_KEY: &str = "MC_STATUS";
pub const STATUS_PORT_KEY: &str = "MC_STATUS_PORT";
pub const STATUS_IFNAME_KEY: &str = "MC_STATUS_IFNAME";
pub const DISCOVERY_KEY: &str = "MC_DISCOVERY";
pub const DISCOVERY_PORT_KEY: &str = "MC_DISCOVERY_PORT";
pub const DISCOVERY_IFNAME_KEY: &str = "MC_DISCOVERY_IFNAME";

/// (region, data center) multicast address codes per data center
const LOCATION_CODES: &[(&str, (i64, i64))] = &[
    ("AM1", (100, 12)),
    ("AM2", (100, 10)),
    ("AW1", (100, 13)),
    ("AW2", (100, 14)),
    ("EM1", (102, 10)),
    ("EM2", (102, 11)),
    ("AP1", (104, 10)),
    ("AP2", (104, 11)),
];

/// Multicast address code per environment
const ENVIRONMENT_CODES: &[(&str, i64)] = &[("prod", 0), ("uat", 1), ("qa", 2), ("dev", 3)];

/// Validate the application id and seed the shared multicast endpoint
/// properties with INSERT, so property files can pre-empt any of them.
fn seed_multicast_properties(properties: &mut PropertyStore) -> Result<(), BuildError> {
    validate_application_id(properties)?;

    let endpoints = [
        (UPSTREAM_PORT_KEY, UPSTREAM_IFNAME_KEY, UPSTREAM_KEY, "blah", 15000i64, 1),
        (DOWNSTREAM_PORT_KEY, DOWNSTREAM_IFNAME_KEY, DOWNSTREAM_KEY, "blast", 15001, 2),
        (STATUS_PORT_KEY, STATUS_IFNAME_KEY, STATUS_KEY, "pulse", 15002, 3),
        (DISCOVERY_PORT_KEY, DISCOVERY_IFNAME_KEY, DISCOVERY_KEY, "discovery", 15003, 4),
    ];
    for (port_key, ifname_key, url_key, scheme, port, channel) in endpoints {
        properties.save(port_key, port, SavePolicy::INSERT)?;
        properties.save(ifname_key, format!("${{{}}}", NETWORK_DEVICE_KEY), SavePolicy::INSERT)?;
        properties.save(
            url_key,
            format!(
                "{}://239.${{{region}}}.${{{dc}}}${{{env}}}.${{{app}}}{channel}:${{{port_key}}}?ifName=${{{ifname_key}}}",
                scheme,
                region = REGION_KEY,
                dc = DATA_CENTER_CODE_KEY,
                env = ENVIRONMENT_CODE_KEY,
                app = APPLICATION_ID_KEY,
                channel = channel,
                port_key = port_key,
                ifname_key = ifname_key,
            ),
            SavePolicy::INSERT,
        )?;
    }

    let data_center = properties.require(DATA_CENTER_KEY)?.to_string();
    let (region, data_center_code) = LOCATION_CODES
        .iter()
        .find(|(name, _)| *name == data_center)
        .map(|(_, codes)| *codes)
        .ok_or(BuildError::UnknownDataCenter { data_center })?;
    properties.save(REGION_KEY, region, SavePolicy::INSERT)?;
    properties.save(DATA_CENTER_CODE_KEY, data_center_code, SavePolicy::INSERT)?;

    let environment = properties.require(ENVIRONMENT_KEY)?.to_string();
    let environment_code = ENVIRONMENT_CODES
        .iter()
        .find(|(name, _)| *name == environment)
        .map(|(_, code)| *code)
        .ok_or(BuildError::UnknownEnvironment { environment })?;
    properties.save(ENVIRONMENT_CODE_KEY, environment_code, SavePolicy::INSERT)?;
    Ok(())
}

fn validate_application_id(properties: &PropertyStore) -> Result<(), BuildError> {
    let value = properties
        .get(APPLICATION_ID_KEY)
        .ok_or(BuildError::MissingApplicationId {
            name: APPLICATION_ID_KEY,
        })?
        .to_string();
    let id: i64 = value.parse().map_err(|_| BuildError::InvalidApplicationId {
        value: value.clone(),
    })?;
    if !(0 < id && id <= 25) {
        return Err(BuildError::InvalidApplicationId { value });
    }
    Ok(())
}

/// Render `lines` into `<config dir>/<filename>` with every line resolved
/// against the deployment's properties. Nothing is written for an empty
/// line set.
fn write_commands_file(
    deployment: &Deployment,
    filename: &str,
    lines: &[String],
) -> Result<(), BuildError> {
    if lines.is_empty() {
        return Ok(());
    }
    let document = deployment
        .configuration(ConfigKind::PlatformProcess)
        .map_err(|err| BuildError::Configuration(err.to_string()))?;
    let config_directory = deployment
        .output_directory()
        .join(document.platform_process().config_directory());
    fs::create_dir_all(&config_directory)?;

    let properties = deployment.properties();
    let mut file = fs::File::create(config_directory.join(filename))?;
    for (index, line) in lines.iter().enumerate() {
        if index > 0 {
            writeln!(file)?;
        }
        write!(file, "{}", properties.resolve(line)?)?;
    }
    Ok(())
}

/// Writes `<application>.stream`: the connection setup commands
#[derive(Debug, Clone, Default)]
pub struct StreamFileBuilder;

impl StreamFileBuilder {
    pub fn new() -> Self {
        Self
    }

    fn lines() -> Vec<String> {
        vec![
            format!(r#"setUpstreamConnection URL="${{{}}}""#, UPSTREAM_KEY),
            format!(r#"setDownstreamConnection URL="${{{}}}""#, DOWNSTREAM_KEY),
            r#"setRecoveryConnection NAME="APP-REWIND" URL="auto://app-rewind""#.to_string(),
        ]
    }
}

impl Builder for StreamFileBuilder {
    fn seed_properties(&self, properties: &mut PropertyStore) -> Result<(), BuildError> {
        seed_multicast_properties(properties)
    }

    fn emit(&self, deployment: &Deployment) -> Result<(), BuildError> {
        let filename = format!("{}.stream", deployment.application());
        write_commands_file(deployment, &filename, &Self::lines())
    }
}

/// Writes `<stripe>.commands` launching a sequencer
#[derive(Debug, Clone)]
pub struct SequencerCommandsBuilder {
    sequencer_type: String,
}

impl Default for SequencerCommandsBuilder {
    fn default() -> Self {
        Self::new("sequencer")
    }
}

impl SequencerCommandsBuilder {
    pub fn new(sequencer_type: impl Into<String>) -> Self {
        Self {
            sequencer_type: sequencer_type.into(),
        }
    }

    fn lines(&self) -> Vec<String> {
        vec![
            format!("/launch TYPE={} INSTANCE=SEQUENCER", self.sequencer_type),
            format!(
                r#"/SEQUENCER/start URL="stream://${{{app}}}" STREAM-ID="${{{app}}}""#,
                app = APPLICATION_KEY
            ),
            format!(r#"/SEQUENCER/addServer NAME="DOWNSTREAM_MULTICAST" URL="${{{}}}""#, DOWNSTREAM_KEY),
            format!(r#"/SEQUENCER/addServer NAME="UPSTREAM_MULTICAST" URL="${{{}}}""#, UPSTREAM_KEY),
            r#"/SEQUENCER/addServer NAME="SEQUENCER_REWIND" URL="beam://0.0.0.0:18000?discoveryId=sequencer-rewind""#
                .to_string(),
        ]
    }
}

impl Builder for SequencerCommandsBuilder {
    fn seed_properties(&self, properties: &mut PropertyStore) -> Result<(), BuildError> {
        seed_multicast_properties(properties)
    }

    fn emit(&self, deployment: &Deployment) -> Result<(), BuildError> {
        let filename = format!("{}.commands", deployment.stripe());
        write_commands_file(deployment, &filename, &self.lines())
    }
}

/// Writes `<stripe>.commands` launching a commander
#[derive(Debug, Clone)]
pub struct CommanderCommandsBuilder {
    commander_type: String,
}

impl Default for CommanderCommandsBuilder {
    fn default() -> Self {
        Self::new("commander")
    }
}

impl CommanderCommandsBuilder {
    pub fn new(commander_type: impl Into<String>) -> Self {
        Self {
            commander_type: commander_type.into(),
        }
    }

    fn lines(&self) -> Vec<String> {
        vec![
            format!("/launch TYPE={} INSTANCE=COMMANDER", self.commander_type),
            format!(
                r#"/COMMANDER/start URL="stream://${{{app}}}" STREAM-ID="${{{app}}}""#,
                app = APPLICATION_KEY
            ),
            "/COMMANDER/addStartOfSessionCommand DISCOVERY-ID=\"activatable_component\" \
             ACTIVE=false PRIMARY=true COMMAND=setActive CRITICAL=true"
                .to_string(),
            format!(r#"/services/bus/start URL="stream://${{{}}}""#, APPLICATION_KEY),
        ]
    }
}

impl Builder for CommanderCommandsBuilder {
    fn seed_properties(&self, properties: &mut PropertyStore) -> Result<(), BuildError> {
        seed_multicast_properties(properties)
    }

    fn emit(&self, deployment: &Deployment) -> Result<(), BuildError> {
        let filename = format!("{}.commands", deployment.stripe());
        write_commands_file(deployment, &filename, &self.lines())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::Identity;
    use crate::properties::PropertyValue;
    use std::path::Path;
    use tempfile::TempDir;

    fn seeded_store() -> PropertyStore {
        let mut properties = PropertyStore::new();
        properties.save(APPLICATION_ID_KEY, 3i64, SavePolicy::UPSERT).unwrap();
        properties.save(NETWORK_DEVICE_KEY, "eth0", SavePolicy::UPSERT).unwrap();
        properties.save(ENVIRONMENT_KEY, "dev", SavePolicy::UPSERT).unwrap();
        properties.save(DATA_CENTER_KEY, "AM1", SavePolicy::UPSERT).unwrap();
        properties
    }

    #[test]
    fn test_seed_multicast_endpoints() {
        let mut properties = seeded_store();
        seed_multicast_properties(&mut properties).unwrap();

        assert_eq!(properties.get(UPSTREAM_PORT_KEY), Some(&PropertyValue::from(15000i64)));
        assert_eq!(properties.get(REGION_KEY), Some(&PropertyValue::from(100i64)));
        assert_eq!(properties.get(DATA_CENTER_CODE_KEY), Some(&PropertyValue::from(12i64)));
        assert_eq!(properties.get(ENVIRONMENT_CODE_KEY), Some(&PropertyValue::from(3i64)));

        let upstream = properties.resolve(&format!("${{{}}}", UPSTREAM_KEY)).unwrap();
        assert_eq!(upstream, "blah://239.100.123.31:15000?ifName=eth0");
        let discovery = properties.resolve(&format!("${{{}}}", DISCOVERY_KEY)).unwrap();
        assert_eq!(discovery, "discovery://239.100.123.34:15003?ifName=eth0");
    }

    #[test]
    fn test_seed_respects_existing_overrides() {
        let mut properties = seeded_store();
        properties.save(UPSTREAM_PORT_KEY, 16000i64, SavePolicy::UPSERT).unwrap();

        seed_multicast_properties(&mut properties).unwrap();

        let upstream = properties.resolve(&format!("${{{}}}", UPSTREAM_KEY)).unwrap();
        assert!(upstream.contains(":16000?"));
    }

    #[test]
    fn test_application_id_required() {
        let mut properties = PropertyStore::new();
        let err = seed_multicast_properties(&mut properties).unwrap_err();
        assert!(matches!(err, BuildError::MissingApplicationId { .. }));
    }

    #[test]
    fn test_application_id_range() {
        for bad in ["0", "26", "-1", "abc"] {
            let mut properties = seeded_store();
            properties.save(APPLICATION_ID_KEY, bad, SavePolicy::UPSERT).unwrap();
            let err = seed_multicast_properties(&mut properties).unwrap_err();
            assert!(
                matches!(err, BuildError::InvalidApplicationId { .. }),
                "id {:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_unknown_data_center_rejected() {
        let mut properties = seeded_store();
        properties.save(DATA_CENTER_KEY, "XX9", SavePolicy::UPSERT).unwrap();

        let err = seed_multicast_properties(&mut properties).unwrap_err();
        assert!(matches!(err, BuildError::UnknownDataCenter { .. }));
    }

    fn stream_deployment(root: &Path) -> Deployment {
        let common = root.join("common/dev/AM1");
        std::fs::create_dir_all(&common).unwrap();
        std::fs::write(
            common.join("feed.properties"),
            "MC_APPLICATION_ID=3\nNETWORK_DEVICE=eth0\n",
        )
        .unwrap();
        std::fs::write(
            common.join("common_params.json"),
            r#"{"vmArgs": {"textAdmin": 1501}}"#,
        )
        .unwrap();

        let identity = Identity {
            environment: "dev".to_string(),
            data_center: "AM1".to_string(),
            application: "feed".to_string(),
            stripe: "FEED01".to_string(),
            instance: "primary".to_string(),
        };
        Deployment::new(root, identity)
            .unwrap()
            .with_builder(Box::new(SequencerCommandsBuilder::default()))
            .unwrap()
    }

    #[test]
    fn test_sequencer_commands_rendered() {
        let dir = TempDir::new().unwrap();
        let deployment = stream_deployment(dir.path());

        deployment.create().unwrap();

        let commands = std::fs::read_to_string(
            deployment.output_directory().join("config/FEED01.commands"),
        )
        .unwrap();
        let lines: Vec<&str> = commands.lines().collect();
        assert_eq!(lines[0], "/launch TYPE=sequencer INSTANCE=SEQUENCER");
        assert_eq!(lines[1], r#"/SEQUENCER/start URL="stream://feed" STREAM-ID="feed""#);
        assert!(lines[2].contains("blast://239.100.123.32:15001?ifName=eth0"));
        assert!(lines[3].contains("blah://239.100.123.31:15000?ifName=eth0"));
        assert!(!commands.ends_with('\n'));
    }

    #[test]
    fn test_stream_file_rendered() {
        let dir = TempDir::new().unwrap();
        let common = dir.path().join("common/qa/AM2");
        std::fs::create_dir_all(&common).unwrap();
        std::fs::write(
            common.join("feed.properties"),
            "MC_APPLICATION_ID=5\nNETWORK_DEVICE=lo\n",
        )
        .unwrap();

        let identity = Identity {
            environment: "qa".to_string(),
            data_center: "AM2".to_string(),
            application: "feed".to_string(),
            stripe: "FEED01".to_string(),
            instance: "primary".to_string(),
        };
        let deployment = Deployment::new(dir.path(), identity)
            .unwrap()
            .with_builder(Box::new(StreamFileBuilder::new()))
            .unwrap();

        deployment.create().unwrap();

        let stream = std::fs::read_to_string(
            deployment.output_directory().join("config/feed.stream"),
        )
        .unwrap();
        assert!(stream.starts_with(r#"setUpstreamConnection URL="blah://239.100.102.51:15000?ifName=lo""#));
        assert!(stream.contains(r#"setRecoveryConnection NAME="APP-REWIND" URL="auto://app-rewind""#));
    }
}
