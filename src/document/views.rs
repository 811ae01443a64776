//! Typed accessor views over resolved configuration documents
//!
//! Views never mutate; they read the known sections of a document, apply
//! defaults, and validate block shape. Incomplete optional blocks (a UDP
//! log without a target, a remote-debug block without its arguments) are
//! treated as absent.

use serde_json::Value;

use super::{ConfigDocument, DocumentError};

/// Default configuration directory under the output tree
const DEFAULT_CONFIG_DIRECTORY: &str = "config";

/// Offset added to the text-admin port for the default remote-debug port
const REMOTE_DEBUG_PORT_OFFSET: i64 = 1000;

/// Resolved UDP log destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpLog {
    pub target: String,
    pub port: i64,
}

/// Resolved remote-debug agent settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDebug {
    pub args: String,
    pub port: i64,
}

/// A published container port: bare, or mapped host to container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortMapping {
    Plain(i64),
    HostContainer { host: i64, container: i64 },
}

/// A mounted container volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMapping {
    pub host: String,
    pub container: String,
}

/// Accessors over the `vmArgs` section of a platform-process document
#[derive(Debug, Clone, Copy)]
pub struct PlatformProcessView<'a> {
    document: &'a ConfigDocument,
}

impl<'a> PlatformProcessView<'a> {
    pub(crate) fn new(document: &'a ConfigDocument) -> Self {
        Self { document }
    }

    /// Minimum heap size (`vmArgs.memory.min`)
    pub fn min_heap(&self) -> Option<String> {
        self.document.get_path("vmArgs.memory.min").and_then(scalar_text)
    }

    /// Maximum heap size (`vmArgs.memory.max`)
    pub fn max_heap(&self) -> Option<String> {
        self.document.get_path("vmArgs.memory.max").and_then(scalar_text)
    }

    /// Base VM arguments in declared order (`vmArgs.baseArgs`)
    pub fn base_args(&self) -> Vec<String> {
        match self.document.get_path("vmArgs.baseArgs") {
            Some(Value::Array(items)) => items.iter().filter_map(scalar_text).collect(),
            _ => Vec::new(),
        }
    }

    /// Named platform properties (`vmArgs.platform`), sorted ascending by key
    pub fn platform_properties(&self) -> Vec<(String, String)> {
        let Some(Value::Object(map)) = self.document.get_path("vmArgs.platform") else {
            return Vec::new();
        };
        let mut properties: Vec<(String, String)> = map
            .iter()
            .filter_map(|(key, value)| scalar_text(value).map(|text| (key.clone(), text)))
            .collect();
        properties.sort_by(|a, b| a.0.cmp(&b.0));
        properties
    }

    /// Text-admin listen port (`vmArgs.textAdmin`)
    pub fn text_admin_port(&self) -> Option<i64> {
        self.document.get_path("vmArgs.textAdmin").and_then(scalar_i64)
    }

    /// Discovery connection override (`vmArgs.connections.discovery`)
    pub fn discovery_url(&self) -> Option<String> {
        self.document
            .get_path("vmArgs.connections.discovery")
            .and_then(scalar_text)
    }

    /// Status connection override (`vmArgs.connections.status`)
    pub fn status_url(&self) -> Option<String> {
        self.document
            .get_path("vmArgs.connections.status")
            .and_then(scalar_text)
    }

    /// UDP log destination (`vmArgs.log.udp`).
    ///
    /// The block counts only when enabled and carrying both target and
    /// port; anything less is treated as absent.
    pub fn udp_log(&self) -> Option<UdpLog> {
        let block = self.document.get_path("vmArgs.log.udp")?;
        if !scalar_bool(block.get("enabled")?)? {
            return None;
        }
        let target = block.get("target").and_then(scalar_text);
        let port = block.get("port").and_then(scalar_i64);
        match (target, port) {
            (Some(target), Some(port)) => Some(UdpLog { target, port }),
            _ => {
                tracing::warn!("udp log block enabled without both target and port; ignoring");
                None
            }
        }
    }

    /// Remote-debug settings (`vmArgs.remoteDebug`).
    ///
    /// The port defaults to the text-admin port plus 1000 when absent.
    pub fn remote_debug(&self) -> Option<RemoteDebug> {
        let block = self.document.get_path("vmArgs.remoteDebug")?;
        if !scalar_bool(block.get("enabled")?)? {
            return None;
        }
        let Some(args) = block.get("args").and_then(scalar_text) else {
            tracing::warn!("remote debug block enabled without args; ignoring");
            return None;
        };
        let port = block
            .get("port")
            .and_then(scalar_i64)
            .unwrap_or_else(|| self.text_admin_port().unwrap_or(0) + REMOTE_DEBUG_PORT_OFFSET);
        Some(RemoteDebug { args, port })
    }

    /// Configuration directory under the output tree
    /// (`vmArgs.platform.configPath`)
    pub fn config_directory(&self) -> String {
        self.document
            .get_path("vmArgs.platform.configPath")
            .and_then(scalar_text)
            .unwrap_or_else(|| DEFAULT_CONFIG_DIRECTORY.to_string())
    }
}

/// Accessors over the `dockerContainer` section of a container document
#[derive(Debug, Clone, Copy)]
pub struct ContainerView<'a> {
    document: &'a ConfigDocument,
}

impl<'a> ContainerView<'a> {
    pub(crate) fn new(document: &'a ConfigDocument) -> Self {
        Self { document }
    }

    /// Published ports in declared order (`dockerContainer.ports`)
    pub fn ports(&self) -> Result<Vec<PortMapping>, DocumentError> {
        let Some(value) = self.document.get_path("dockerContainer.ports") else {
            return Ok(Vec::new());
        };
        let Value::Array(items) = value else {
            return Err(malformed("dockerContainer.ports", "expected a sequence"));
        };
        items
            .iter()
            .enumerate()
            .map(|(index, item)| parse_port(item, index))
            .collect()
    }

    /// Mounted volumes in declared order (`dockerContainer.volumes`)
    pub fn volumes(&self) -> Result<Vec<VolumeMapping>, DocumentError> {
        let Some(value) = self.document.get_path("dockerContainer.volumes") else {
            return Ok(Vec::new());
        };
        let Value::Array(items) = value else {
            return Err(malformed("dockerContainer.volumes", "expected a sequence"));
        };
        items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let path = format!("dockerContainer.volumes[{}]", index);
                let host = item.get("host").and_then(scalar_text);
                let container = item.get("container").and_then(scalar_text);
                match (host, container) {
                    (Some(host), Some(container)) => Ok(VolumeMapping { host, container }),
                    _ => Err(malformed(&path, "expected host and container paths")),
                }
            })
            .collect()
    }

    /// Container image reference (`dockerContainer.image`)
    pub fn image(&self) -> Option<String> {
        self.document.get_path("dockerContainer.image").and_then(scalar_text)
    }
}

fn parse_port(item: &Value, index: usize) -> Result<PortMapping, DocumentError> {
    let path = format!("dockerContainer.ports[{}]", index);
    match item {
        Value::Object(_) => {
            let host = item.get("host").and_then(scalar_i64);
            let container = item.get("container").and_then(scalar_i64);
            match (host, container) {
                (Some(host), Some(container)) => Ok(PortMapping::HostContainer { host, container }),
                _ => Err(malformed(&path, "expected host and container ports")),
            }
        }
        other => scalar_i64(other)
            .map(PortMapping::Plain)
            .ok_or_else(|| malformed(&path, "expected a port number")),
    }
}

fn malformed(path: &str, reason: &str) -> DocumentError {
    DocumentError::Malformed {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// The text form of a scalar; containers and null yield nothing
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// A numeric scalar, accepting the stringified form merge produces
fn scalar_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// A boolean scalar, accepting the stringified form merge produces
fn scalar_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn platform_doc() -> ConfigDocument {
        ConfigDocument::from_value(json!({
            "appName": "OMS01-enrichment-agent",
            "vmArgs": {
                "memory": {"min": "2g", "max": "3g"},
                "baseArgs": ["-server", "-XX:+UseG1GC"],
                "platform": {"logPath": "logs", "configPath": "config", "dataPath": "data"},
                "textAdmin": 1501,
                "connections": {
                    "status": "pulse://239.100.103.13:18013?ifName=lo",
                    "discovery": "discovery://239.100.103.14:18014?ifName=lo"
                },
                "log": {
                    "udp": {"enabled": "True", "target": "10.160.10.182", "port": 9475},
                    "console": {"enabled": true}
                },
                "remoteDebug": {
                    "enabled": true,
                    "args": "-agentlib:jdwp=transport=dt_socket,server=y,suspend=n"
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_heap_accessors() {
        let document = platform_doc();
        let view = document.platform_process();

        assert_eq!(view.min_heap().as_deref(), Some("2g"));
        assert_eq!(view.max_heap().as_deref(), Some("3g"));
    }

    #[test]
    fn test_heap_absent() {
        let document = ConfigDocument::from_value(json!({"vmArgs": {}})).unwrap();
        let view = document.platform_process();

        assert_eq!(view.min_heap(), None);
        assert_eq!(view.max_heap(), None);
    }

    #[test]
    fn test_platform_properties_sorted() {
        let document = ConfigDocument::from_value(json!({
            "vmArgs": {"platform": {"logPath": "logs", "configPath": "config", "dataPath": "data"}}
        }))
        .unwrap();

        let properties = document.platform_process().platform_properties();
        let keys: Vec<&str> = properties.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["configPath", "dataPath", "logPath"]);
    }

    #[test]
    fn test_text_admin_port_accepts_stringified() {
        let document = ConfigDocument::from_value(json!({"vmArgs": {"textAdmin": "1501"}})).unwrap();
        assert_eq!(document.platform_process().text_admin_port(), Some(1501));
    }

    #[test]
    fn test_udp_log_enabled() {
        let document = platform_doc();
        let udp = document.platform_process().udp_log().unwrap();

        assert_eq!(udp.target, "10.160.10.182");
        assert_eq!(udp.port, 9475);
    }

    #[test]
    fn test_udp_log_incomplete_is_absent() {
        let document = ConfigDocument::from_value(json!({
            "vmArgs": {"log": {"udp": {"enabled": true, "target": "10.0.0.1"}}}
        }))
        .unwrap();

        assert_eq!(document.platform_process().udp_log(), None);
    }

    #[test]
    fn test_udp_log_disabled_is_absent() {
        let document = ConfigDocument::from_value(json!({
            "vmArgs": {"log": {"udp": {"enabled": false, "target": "10.0.0.1", "port": 9475}}}
        }))
        .unwrap();

        assert_eq!(document.platform_process().udp_log(), None);
    }

    #[test]
    fn test_remote_debug_port_defaults_to_admin_offset() {
        let document = platform_doc();
        let debug = document.platform_process().remote_debug().unwrap();

        assert_eq!(debug.port, 1501 + REMOTE_DEBUG_PORT_OFFSET);
        assert!(debug.args.starts_with("-agentlib:jdwp"));
    }

    #[test]
    fn test_remote_debug_explicit_port() {
        let document = ConfigDocument::from_value(json!({
            "vmArgs": {"remoteDebug": {"enabled": true, "args": "-agentlib:jdwp", "port": 5005}}
        }))
        .unwrap();

        assert_eq!(document.platform_process().remote_debug().unwrap().port, 5005);
    }

    #[test]
    fn test_container_ports_both_forms() {
        let document = ConfigDocument::from_value(json!({
            "dockerContainer": {"ports": [80, {"host": 8080, "container": 80}]}
        }))
        .unwrap();

        let ports = document.container().ports().unwrap();
        assert_eq!(
            ports,
            vec![
                PortMapping::Plain(80),
                PortMapping::HostContainer { host: 8080, container: 80 },
            ]
        );
    }

    #[test]
    fn test_container_port_malformed() {
        let document = ConfigDocument::from_value(json!({
            "dockerContainer": {"ports": [{"host": 8080}]}
        }))
        .unwrap();

        let err = document.container().ports().unwrap_err();
        assert!(matches!(err, DocumentError::Malformed { .. }));
    }

    #[test]
    fn test_container_volumes() {
        let document = ConfigDocument::from_value(json!({
            "dockerContainer": {"volumes": [{"host": "/data", "container": "/var/data"}]}
        }))
        .unwrap();

        let volumes = document.container().volumes().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].host, "/data");
        assert_eq!(volumes[0].container, "/var/data");
    }
}
