//! Configuration model.
//!
//! TOML is deserialized into lenient `*Section` input structs and then
//! resolved into validated runtime values: node name cross-references become
//! arena indices and protocol ids, route strings and route lengths are
//! precomputed, and `[node_defaults]` fills per-node gaps. Any inconsistency
//! is a fatal [`ConfigError`] at start-up.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::engine::EngineConfig;
use crate::node::{Kind, Node, NodeSettings};
use crate::registry::Registry;
use crate::sensor::{ChannelConfig, LedMapEntry, SensorState};
use crate::switch::SwitchState;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("duplicate node id {0}")]
    DuplicateId(u32),
    #[error("duplicate node name {0:?}")]
    DuplicateName(String),
    #[error("unknown node name {0:?}")]
    UnknownNode(String),
    #[error("gateway chain of {0:?} contains a cycle")]
    GatewayCycle(String),
    #[error("node {node:?}: {reason}")]
    Invalid { node: String, reason: String },
}

// ─── Input sections ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Serial,
    Tcp,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialSection {
    pub device: String,
    pub baudrate: u32,
}

impl Default for SerialSection {
    fn default() -> Self {
        SerialSection {
            device: "/dev/ttyUSB0".to_string(),
            baudrate: 115_200,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TcpSection {
    pub port: u16,
}

impl Default for TcpSection {
    fn default() -> Self {
        TcpSection { port: 2500 }
    }
}

#[derive(Debug, Deserialize)]
struct MasterSection {
    #[serde(default)]
    routes: Vec<(String, String)>,
    alive_signal_interval: Option<u64>,
    gateway_watchdog_interval: Option<u64>,
    network_check_interval: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UplinkSection {
    enabled: bool,
    base_url: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeDefaults {
    hop_timeout: Option<u64>,
    max_retransmissions: Option<u32>,
    check_interval: Option<u64>,
    reconnect_delay: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum NodeKindName {
    #[default]
    Base,
    Sensor,
    Switch,
}

#[derive(Debug, Deserialize)]
struct InputFilterSection {
    mid_adjustment_speed: i32,
    lowpass_weight: i32,
    frame_size: i32,
}

#[derive(Debug, Deserialize)]
struct RejectFilterSection {
    threshold: i32,
    consec_count: i32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum ChannelSection {
    Stat {
        index: u32,
        input_filter: InputFilterSection,
        transition_matrix: Vec<i32>,
        window_sizes: Vec<u32>,
        reject_filter: RejectFilterSection,
    },
    Freq {
        index: u32,
        threshold: i32,
        window: u32,
        max_neg: u32,
    },
}

#[derive(Debug, Deserialize)]
struct LedMapSection {
    index: usize,
    colors: HashMap<String, u32>,
}

#[derive(Debug, Deserialize)]
struct NodeSection {
    name: String,
    id: u32,
    #[serde(default)]
    kind: NodeKindName,
    gateway: String,
    #[serde(default)]
    routes: Vec<(String, String)>,
    hop_timeout: Option<u64>,
    max_retransmissions: Option<u32>,
    check_interval: Option<u64>,
    reconnect_delay: Option<u64>,
    samplerate: Option<u32>,
    channel_mask: Option<u32>,
    #[serde(default)]
    channels: Vec<ChannelSection>,
    #[serde(default)]
    ledmap: HashMap<String, LedMapSection>,
    color_opened: Option<u32>,
    color_closed: Option<u32>,
    color_pending: Option<u32>,
    status_url: Option<String>,
    status_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    connection: ConnectionKind,
    state_file: Option<PathBuf>,
    #[serde(default)]
    max_reconnect_attempts: u32,
    #[serde(default)]
    serial: SerialSection,
    #[serde(default)]
    tcp: TcpSection,
    master: MasterSection,
    #[serde(default)]
    uplink: UplinkSection,
    #[serde(default)]
    node_defaults: NodeDefaults,
    #[serde(default)]
    nodes: Vec<NodeSection>,
}

// ─── Resolved configuration ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub connection: ConnectionKind,
    pub serial: SerialSection,
    pub tcp: TcpSection,
    /// 0 means retry forever.
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct UplinkSettings {
    pub base_url: String,
    pub token: String,
}

pub struct ResolvedConfig {
    pub registry: Registry,
    pub engine: EngineConfig,
    pub link: LinkSettings,
    pub uplink: Option<UplinkSettings>,
    pub state_file: PathBuf,
}

/// Load and resolve a configuration file.
pub fn load(path: &Path) -> Result<ResolvedConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text)
}

/// Resolve a configuration from its TOML text.
pub fn parse(text: &str) -> Result<ResolvedConfig, ConfigError> {
    let file: ConfigFile = toml::from_str(text)?;

    // Name and id indices, uniqueness.
    let mut by_name: HashMap<&str, usize> = HashMap::new();
    let mut seen_ids: HashMap<u32, &str> = HashMap::new();
    for (pos, section) in file.nodes.iter().enumerate() {
        if section.name == "MASTER" {
            return Err(ConfigError::Invalid {
                node: section.name.clone(),
                reason: "MASTER is the root sentinel, not a node".to_string(),
            });
        }
        if by_name.insert(section.name.as_str(), pos).is_some() {
            return Err(ConfigError::DuplicateName(section.name.clone()));
        }
        if seen_ids.insert(section.id, section.name.as_str()).is_some() {
            return Err(ConfigError::DuplicateId(section.id));
        }
    }

    // Gateway edges and route lengths.
    let mut gateways: Vec<Option<usize>> = Vec::with_capacity(file.nodes.len());
    for section in &file.nodes {
        if section.gateway == "MASTER" {
            gateways.push(None);
        } else {
            let idx = *by_name
                .get(section.gateway.as_str())
                .ok_or_else(|| ConfigError::UnknownNode(section.gateway.clone()))?;
            gateways.push(Some(idx));
        }
    }
    let mut route_lengths: Vec<u32> = Vec::with_capacity(file.nodes.len());
    for (pos, section) in file.nodes.iter().enumerate() {
        let mut length = 1u32;
        let mut cursor = gateways[pos];
        let mut steps = 0usize;
        while let Some(up) = cursor {
            length += 1;
            steps += 1;
            if steps > file.nodes.len() {
                return Err(ConfigError::GatewayCycle(section.name.clone()));
            }
            cursor = gateways[up];
        }
        route_lengths.push(length);
    }

    let resolve_ref = |reference: &str| -> Result<u32, ConfigError> {
        if reference == "MASTER" {
            return Ok(0);
        }
        if let Some(rest) = reference.strip_prefix('#') {
            return rest
                .parse::<u32>()
                .map_err(|_| ConfigError::UnknownNode(reference.to_string()));
        }
        by_name
            .get(reference)
            .map(|&pos| file.nodes[pos].id)
            .ok_or_else(|| ConfigError::UnknownNode(reference.to_string()))
    };

    // Nodes.
    let defaults = &file.node_defaults;
    let mut nodes = Vec::with_capacity(file.nodes.len());
    for (pos, section) in file.nodes.iter().enumerate() {
        let settings = NodeSettings {
            hop_timeout: section
                .hop_timeout
                .or(defaults.hop_timeout)
                .unwrap_or(2),
            max_retransmissions: section
                .max_retransmissions
                .or(defaults.max_retransmissions)
                .unwrap_or(3),
            check_interval: Duration::from_secs(
                section.check_interval.or(defaults.check_interval).unwrap_or(60),
            ),
            reconnect_delay: Duration::from_secs(
                section
                    .reconnect_delay
                    .or(defaults.reconnect_delay)
                    .unwrap_or(30),
            ),
        };

        let gateway_id = match gateways[pos] {
            None => 0,
            Some(up) => file.nodes[up].id,
        };
        let mut route_parts = vec![format!("0:{gateway_id}")];
        for (dst, hop) in &section.routes {
            route_parts.push(format!("{}:{}", resolve_ref(dst)?, resolve_ref(hop)?));
        }
        let routes_arg = route_parts.join(",");

        let kind = build_kind(section, &by_name)?;

        nodes.push(Node::new(
            section.name.clone(),
            section.id,
            gateways[pos],
            gateway_id,
            route_lengths[pos],
            routes_arg,
            settings,
            kind,
        ));
    }

    // Root routing table.
    let mut master_parts = Vec::with_capacity(file.master.routes.len());
    for (dst, hop) in &file.master.routes {
        master_parts.push(format!("{}:{}", resolve_ref(dst)?, resolve_ref(hop)?));
    }

    let engine = EngineConfig {
        gateway_watchdog_interval: Duration::from_secs(
            file.master.gateway_watchdog_interval.unwrap_or(30),
        ),
        alive_signal_interval: Duration::from_secs(
            file.master.alive_signal_interval.unwrap_or(60),
        ),
        network_check_interval: Duration::from_secs(
            file.master.network_check_interval.unwrap_or(300),
        ),
        startup_grace: Duration::from_secs(1),
        master_routes: master_parts.join(","),
    };

    let uplink = if file.uplink.enabled {
        let base_url = file.uplink.base_url.ok_or_else(|| ConfigError::Invalid {
            node: "uplink".to_string(),
            reason: "enabled but base_url is missing".to_string(),
        })?;
        Some(UplinkSettings {
            base_url,
            token: file.uplink.token.unwrap_or_default(),
        })
    } else {
        None
    };

    Ok(ResolvedConfig {
        registry: Registry::new(nodes),
        engine,
        link: LinkSettings {
            connection: file.connection,
            serial: file.serial,
            tcp: file.tcp,
            max_reconnect_attempts: file.max_reconnect_attempts,
        },
        uplink,
        state_file: file
            .state_file
            .unwrap_or_else(|| PathBuf::from("/tmp/canopy.state")),
    })
}

fn build_kind(
    section: &NodeSection,
    by_name: &HashMap<&str, usize>,
) -> Result<Kind, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        node: section.name.clone(),
        reason: reason.to_string(),
    };

    match section.kind {
        NodeKindName::Base => Ok(Kind::Base),
        NodeKindName::Sensor => {
            let samplerate = section.samplerate.ok_or_else(|| invalid("samplerate is required"))?;
            if section.channels.len() >= 32 {
                return Err(invalid("too many channels"));
            }

            let mut channels = Vec::with_capacity(section.channels.len());
            for channel in &section.channels {
                channels.push(build_channel(section, channel)?);
            }
            let channel_mask = section
                .channel_mask
                .unwrap_or_else(|| (1u32 << channels.len()) - 1);

            let mut ledmap = HashMap::new();
            for (peer, slot) in &section.ledmap {
                if !by_name.contains_key(peer.as_str()) {
                    return Err(ConfigError::UnknownNode(peer.clone()));
                }
                let mut colors = HashMap::new();
                for (key, colour) in &slot.colors {
                    let code = key
                        .strip_prefix('s')
                        .and_then(|rest| rest.parse::<u32>().ok())
                        .ok_or_else(|| invalid(&format!("bad colour key {key:?}")))?;
                    colors.insert(code, *colour);
                }
                ledmap.insert(
                    peer.clone(),
                    LedMapEntry {
                        index: slot.index,
                        colors,
                    },
                );
            }

            Ok(Kind::Sensor(SensorState::new(
                channels,
                channel_mask,
                samplerate,
                ledmap,
            )))
        }
        NodeKindName::Switch => {
            let missing = |field: &str| invalid(&format!("{field} is required"));
            Ok(Kind::Switch(SwitchState::new(
                section.color_opened.ok_or_else(|| missing("color_opened"))?,
                section.color_closed.ok_or_else(|| missing("color_closed"))?,
                section.color_pending.ok_or_else(|| missing("color_pending"))?,
                section.status_url.clone().ok_or_else(|| missing("status_url"))?,
                section.status_key.clone().ok_or_else(|| missing("status_key"))?,
            )))
        }
    }
}

fn build_channel(
    section: &NodeSection,
    channel: &ChannelSection,
) -> Result<ChannelConfig, ConfigError> {
    match channel {
        ChannelSection::Stat {
            index,
            input_filter,
            transition_matrix,
            window_sizes,
            reject_filter,
        } => {
            let dim = (transition_matrix.len() as f64).sqrt() as usize;
            if dim == 0 || dim * dim != transition_matrix.len() {
                return Err(ConfigError::Invalid {
                    node: section.name.clone(),
                    reason: format!(
                        "channel {index}: transition_matrix must be square, got {} cells",
                        transition_matrix.len()
                    ),
                });
            }
            Ok(ChannelConfig::Stat {
                index: *index,
                mid_adjustment_speed: input_filter.mid_adjustment_speed,
                lowpass_weight: input_filter.lowpass_weight,
                frame_size: input_filter.frame_size,
                transition_matrix: transition_matrix.clone(),
                window_sizes: window_sizes.clone(),
                reject_threshold: reject_filter.threshold,
                reject_consec_count: reject_filter.consec_count,
            })
        }
        ChannelSection::Freq {
            index,
            threshold,
            window,
            max_neg,
        } => Ok(ChannelConfig::Freq {
            index: *index,
            threshold: *threshold,
            window: *window,
            max_neg: *max_neg,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Kind;

    const BASE: &str = r#"
        connection = "tcp"

        [tcp]
        port = 2500

        [master]
        routes = [["A", "A"]]
        alive_signal_interval = 60
        gateway_watchdog_interval = 30
        network_check_interval = 300

        [node_defaults]
        hop_timeout = 2
        max_retransmissions = 3
        check_interval = 60
        reconnect_delay = 30
    "#;

    fn with_nodes(extra: &str) -> String {
        format!("{BASE}\n{extra}")
    }

    #[test]
    fn resolves_a_small_network() {
        let text = with_nodes(
            r#"
            [[nodes]]
            name = "A"
            id = 2
            gateway = "MASTER"
            routes = [["B", "B"]]

            [[nodes]]
            name = "B"
            id = 3
            gateway = "A"
            max_retransmissions = 5
        "#,
        );
        let resolved = parse(&text).unwrap();
        assert_eq!(resolved.registry.len(), 2);
        assert_eq!(resolved.engine.master_routes, "2:2");

        let a = resolved.registry.get(0);
        assert_eq!(a.route_length, 1);
        assert_eq!(a.gateway_id, 0);
        assert_eq!(a.settings.max_retransmissions, 3);

        let b = resolved.registry.get(1);
        assert_eq!(b.route_length, 2);
        assert_eq!(b.gateway, Some(0));
        assert_eq!(b.gateway_id, 2);
        assert_eq!(b.settings.max_retransmissions, 5);
    }

    #[test]
    fn route_string_layout() {
        // Routes [(A, G), (B, H)] with gateway G0 serialize as
        // 0:<G0>,<A>:<G>,<B>:<H>.
        let text = with_nodes(
            r#"
            [[nodes]]
            name = "G0"
            id = 10
            gateway = "MASTER"

            [[nodes]]
            name = "A"
            id = 11
            gateway = "G0"

            [[nodes]]
            name = "G"
            id = 12
            gateway = "G0"

            [[nodes]]
            name = "B"
            id = 13
            gateway = "G0"

            [[nodes]]
            name = "H"
            id = 14
            gateway = "G0"

            [[nodes]]
            name = "N"
            id = 15
            gateway = "G0"
            routes = [["A", "G"], ["B", "H"]]
        "#,
        );
        let resolved = parse(&text).unwrap();
        let n = resolved.registry.get(5);
        let now = std::time::Instant::now();
        let mut node = n.clone();
        node.next_message(now, true).unwrap(); // connect
        node.on_ack(0, now).unwrap();
        let cmd = node.next_message(now, true).unwrap();
        assert_eq!(cmd.as_line(), "reset_routes 15 0:10,11:12,13:14");
    }

    #[test]
    fn literal_id_escape_in_routes() {
        let text = with_nodes(
            r##"
            [[nodes]]
            name = "A"
            id = 2
            gateway = "MASTER"
            routes = [["#40", "#41"]]
        "##,
        );
        assert!(parse(&text).is_ok());
    }

    #[test]
    fn sensor_node_resolution() {
        let text = with_nodes(
            r#"
            [[nodes]]
            name = "A"
            id = 2
            gateway = "MASTER"

            [[nodes]]
            name = "C"
            id = 5
            kind = "sensor"
            gateway = "A"
            samplerate = 100

            [[nodes.channels]]
            index = 0
            kind = "stat"
            input_filter = { mid_adjustment_speed = 1, lowpass_weight = 10, frame_size = 100 }
            transition_matrix = [0, 16500, -16000, 0]
            window_sizes = [3, 3, 3, 3]
            reject_filter = { threshold = 1, consec_count = 1 }

            [[nodes.channels]]
            index = 1
            kind = "freq"
            threshold = 100
            window = 10
            max_neg = 3

            [nodes.ledmap.A]
            index = 0
            colors = { s1 = 16, s2 = 32 }
        "#,
        );
        let resolved = parse(&text).unwrap();
        let Kind::Sensor(state) = &resolved.registry.get(1).kind else {
            panic!("expected sensor kind");
        };
        assert_eq!(state.channels.len(), 2);
        assert_eq!(state.channel_mask, 3);
        assert_eq!(state.ledmap["A"].colors[&1], 16);
        assert_eq!(state.led_expected.len(), 1);
    }

    #[test]
    fn switch_node_requires_colours() {
        let text = with_nodes(
            r#"
            [[nodes]]
            name = "A"
            id = 2
            kind = "switch"
            gateway = "MASTER"
            color_opened = 32
            color_closed = 16
        "#,
        );
        assert!(matches!(
            parse(&text),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn unknown_references_are_fatal() {
        let unknown_gateway = with_nodes(
            r#"
            [[nodes]]
            name = "A"
            id = 2
            gateway = "NOPE"
        "#,
        );
        assert!(matches!(
            parse(&unknown_gateway),
            Err(ConfigError::UnknownNode(name)) if name == "NOPE"
        ));

        let unknown_led_peer = with_nodes(
            r#"
            [[nodes]]
            name = "A"
            id = 2
            kind = "sensor"
            gateway = "MASTER"
            samplerate = 100

            [nodes.ledmap.GHOST]
            index = 0
            colors = { s1 = 16 }
        "#,
        );
        assert!(matches!(
            parse(&unknown_led_peer),
            Err(ConfigError::UnknownNode(name)) if name == "GHOST"
        ));
    }

    #[test]
    fn duplicates_are_fatal() {
        let text = with_nodes(
            r#"
            [[nodes]]
            name = "A"
            id = 2
            gateway = "MASTER"

            [[nodes]]
            name = "B"
            id = 2
            gateway = "MASTER"
        "#,
        );
        assert!(matches!(parse(&text), Err(ConfigError::DuplicateId(2))));
    }

    #[test]
    fn gateway_cycles_are_fatal() {
        let text = with_nodes(
            r#"
            [[nodes]]
            name = "A"
            id = 2
            gateway = "B"

            [[nodes]]
            name = "B"
            id = 3
            gateway = "A"
        "#,
        );
        assert!(matches!(parse(&text), Err(ConfigError::GatewayCycle(_))));
    }

    #[test]
    fn uplink_needs_a_base_url() {
        let text = with_nodes(
            r#"
            [uplink]
            enabled = true
            token = "t"

            [[nodes]]
            name = "A"
            id = 2
            gateway = "MASTER"
        "#,
        );
        assert!(matches!(parse(&text), Err(ConfigError::Invalid { .. })));
    }
}
