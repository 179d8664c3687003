//! Node configuration rendering and bundle layout.

use gridwright_properties::{keys, Properties, PropertiesError};
use tracing::warn;

use crate::configuration::NodeConfiguration;
use crate::ids::SessionId;
use crate::node::NodeType;

/// Port drivers accept node connections on.
pub const DRIVER_SERVER_PORT: u16 = 11111;

/// Management port of a driver.
pub const DRIVER_MANAGEMENT_PORT: u16 = 11198;

/// First management port handed to local worker nodes.
pub const LOCAL_MANAGEMENT_PORT_BASE: u16 = 12001;

pub const RECONNECT_MAX_TIME_SECS: u32 = 60;
pub const RECONNECT_INTERVAL_SECS: u32 = 10;

const HEADER: &str = "grid node configuration generated by gridwright";

/// File layout of an unpacked node bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleLayout {
    /// Base name for install directories and archives.
    pub base_name: &'static str,
    pub start_script: &'static str,
    pub config_file: &'static str,
}

impl BundleLayout {
    pub const WORKER: BundleLayout = BundleLayout {
        base_name: "grid-node",
        start_script: "startNode.sh",
        config_file: "grid-node.properties",
    };

    pub const DRIVER: BundleLayout = BundleLayout {
        base_name: "grid-driver",
        start_script: "startDriver.sh",
        config_file: "grid-driver.properties",
    };

    pub fn for_type(node_type: NodeType) -> Self {
        match node_type {
            NodeType::Worker => Self::WORKER,
            NodeType::Driver => Self::DRIVER,
        }
    }

    /// Config file path relative to the install directory.
    pub fn config_path(&self) -> String {
        format!("config/{}", self.config_file)
    }
}

/// Per-node values computed by the backend.
#[derive(Debug, Clone)]
pub struct RenderTarget<'a> {
    pub driver_address: &'a str,
    pub management_host: Option<&'a str>,
    pub management_port: u16,
    pub cache_dir: &'a str,
}

/// Pick the driver address for a node.
pub fn resolve_driver_address(configured: Option<&str>, orchestrator: Option<&str>) -> String {
    match configured.or(orchestrator) {
        Some(address) => address.to_string(),
        None => {
            warn!("No driver address configured, using localhost");
            "localhost".to_string()
        }
    }
}

/// Resource cache directory of a node on a shared host.
pub fn cache_dir(session: &SessionId, sequence: u32) -> String {
    format!("/tmp/.grid/node-{session}_{sequence}")
}

/// Server port a worker connects to: an explicit `jppf.server.port`
/// property, else the driver default.
pub fn server_port(config: &NodeConfiguration) -> u16 {
    config
        .properties()
        .get(keys::SERVER_PORT)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DRIVER_SERVER_PORT)
}

/// Render the properties file a node starts with.
///
/// Extra properties from the configuration are applied last and win over
/// computed values.
pub fn render_node_properties(
    config: &NodeConfiguration,
    target: &RenderTarget<'_>,
) -> Result<Properties, PropertiesError> {
    let mut props = Properties::with_header(HEADER);

    match config.node_type() {
        NodeType::Worker => {
            props.set(keys::SERVER_HOST, target.driver_address)?;
            props.set(keys::SERVER_PORT, server_port(config).to_string())?;
            props.set(keys::RECONNECT_MAX_TIME, RECONNECT_MAX_TIME_SECS.to_string())?;
            props.set(keys::RECONNECT_INTERVAL, RECONNECT_INTERVAL_SECS.to_string())?;
            props.set(keys::CLASSLOADER_DELEGATION, "parent")?;
        }
        NodeType::Driver => {
            props.set(keys::SERVER_PORT, DRIVER_SERVER_PORT.to_string())?;
        }
    }

    props.set(keys::MANAGEMENT_ENABLED, "true")?;
    props.set(keys::DISCOVERY_ENABLED, "false")?;
    if let Some(host) = target.management_host {
        props.set(keys::MANAGEMENT_HOST, host)?;
    }
    props.set(keys::MANAGEMENT_PORT, target.management_port.to_string())?;
    props.set(keys::PROCESSING_THREADS, config.processing_threads().to_string())?;
    props.set(keys::RESOURCE_CACHE_DIR, target.cache_dir)?;
    if let Some(options) = config.jvm_options() {
        props.set(keys::JVM_OPTIONS, options)?;
    }

    for (key, value) in config.properties() {
        props.set(key.as_str(), value.as_str())?;
    }
    Ok(props)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::configuration::BackendConfig;

    fn target() -> RenderTarget<'static> {
        RenderTarget {
            driver_address: "10.0.0.2",
            management_host: Some("10.0.0.7"),
            management_port: 12001,
            cache_dir: "/tmp/.grid/node-abc_1",
        }
    }

    #[rstest]
    #[case(1)]
    #[case(4)]
    #[case(32)]
    fn test_threads_rendered(#[case] threads: u32) {
        let config = NodeConfiguration::builder(NodeType::Worker, BackendConfig::Local)
            .processing_threads(threads)
            .build()
            .unwrap();

        let rendered = render_node_properties(&config, &target()).unwrap().render();

        assert!(rendered.contains(&format!("processing.threads={threads}\n")));
    }

    #[test]
    fn test_worker_keys() {
        let config = NodeConfiguration::builder(NodeType::Worker, BackendConfig::Local)
            .jvm_options("-Xmx512m")
            .build()
            .unwrap();

        let props = render_node_properties(&config, &target()).unwrap();

        assert_eq!(props.get(keys::SERVER_HOST), Some("10.0.0.2"));
        assert_eq!(props.get(keys::SERVER_PORT), Some("11111"));
        assert_eq!(props.get(keys::MANAGEMENT_HOST), Some("10.0.0.7"));
        assert_eq!(props.get(keys::MANAGEMENT_PORT), Some("12001"));
        assert_eq!(props.get(keys::MANAGEMENT_ENABLED), Some("true"));
        assert_eq!(props.get(keys::DISCOVERY_ENABLED), Some("false"));
        assert_eq!(props.get(keys::RESOURCE_CACHE_DIR), Some("/tmp/.grid/node-abc_1"));
        assert_eq!(props.get(keys::JVM_OPTIONS), Some("-Xmx512m"));
        assert_eq!(props.get(keys::CLASSLOADER_DELEGATION), Some("parent"));
        assert_eq!(props.get(keys::RECONNECT_MAX_TIME), Some("60"));
        assert_eq!(props.get(keys::RECONNECT_INTERVAL), Some("10"));
        assert!(props.header().is_some());
    }

    #[test]
    fn test_jvm_options_omitted_when_unset() {
        let config = NodeConfiguration::builder(NodeType::Worker, BackendConfig::Local)
            .build()
            .unwrap();

        let props = render_node_properties(&config, &target()).unwrap();

        assert!(!props.contains_key(keys::JVM_OPTIONS));
    }

    #[test]
    fn test_explicit_server_port_and_extra_properties() {
        let config = NodeConfiguration::builder(NodeType::Worker, BackendConfig::Local)
            .property(keys::SERVER_PORT, "11200")
            .property("jppf.peer.discovery.enabled", "false")
            .build()
            .unwrap();

        let props = render_node_properties(&config, &target()).unwrap();

        assert_eq!(props.get(keys::SERVER_PORT), Some("11200"));
        assert_eq!(props.get("jppf.peer.discovery.enabled"), Some("false"));
    }

    #[test]
    fn test_driver_layout_and_ports() {
        let config = NodeConfiguration::builder(NodeType::Driver, BackendConfig::Local)
            .build()
            .unwrap();
        let target = RenderTarget {
            management_port: DRIVER_MANAGEMENT_PORT,
            ..target()
        };

        let props = render_node_properties(&config, &target).unwrap();

        assert_eq!(props.get(keys::SERVER_PORT), Some("11111"));
        assert_eq!(props.get(keys::MANAGEMENT_PORT), Some("11198"));
        assert!(!props.contains_key(keys::SERVER_HOST));
        assert_eq!(BundleLayout::for_type(NodeType::Driver).start_script, "startDriver.sh");
    }

    #[rstest]
    #[case(Some("10.1.1.1"), Some("10.2.2.2"), "10.1.1.1")]
    #[case(None, Some("10.2.2.2"), "10.2.2.2")]
    #[case(None, None, "localhost")]
    fn test_driver_address_resolution(
        #[case] configured: Option<&str>,
        #[case] orchestrator: Option<&str>,
        #[case] expected: &str,
    ) {
        assert_eq!(resolve_driver_address(configured, orchestrator), expected);
    }
}
