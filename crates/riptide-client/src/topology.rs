//! Cluster topology as streamed by the config service.
//!
//! Configs arrive as JSON documents. Each carries a monotonically
//! increasing revision, the node list with per-service port maps and
//! optional alternate-address views, and the partition map assigning
//! every vbucket to a node.

use crate::config::NetworkResolution;
use crate::error::{Error, Result};
use crate::host::HostAndPort;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

/// Service names as they appear in the config JSON.
pub mod service {
    pub const CONFIG: &str = "mgmt";
    pub const CONFIG_SSL: &str = "mgmtSSL";
    pub const KV: &str = "kv";
    pub const KV_SSL: &str = "kvSSL";
}

/// One parsed cluster config.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    /// Monotonic config revision. Only strictly greater revisions are
    /// ever applied.
    pub rev: i64,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "nodesExt", default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(rename = "vBucketServerMap", default)]
    pub vbucket_server_map: Option<VbucketServerMap>,
    /// Selected alternate network, `None` for the primary view. Set once
    /// by the config provider before the config is published.
    #[serde(skip)]
    network: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub hostname: Option<String>,
    #[serde(default)]
    pub services: HashMap<String, u16>,
    #[serde(rename = "alternateAddresses", default)]
    pub alternate_addresses: HashMap<String, AlternateAddress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlternateAddress {
    pub hostname: String,
    #[serde(default)]
    pub services: HashMap<String, u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VbucketServerMap {
    #[serde(rename = "serverList", default)]
    pub server_list: Vec<String>,
    /// One replica chain per partition; entry 0 is the active node's
    /// index into `server_list`, -1 when unassigned.
    #[serde(rename = "vBucketMap", default)]
    pub vbucket_map: Vec<Vec<i32>>,
}

impl BucketConfig {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::ConfigParse(e.to_string()))
    }

    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    pub fn set_network(&mut self, network: Option<String>) {
        self.network = network;
    }

    pub fn num_partitions(&self) -> usize {
        self.vbucket_server_map
            .as_ref()
            .map(|map| map.vbucket_map.len())
            .unwrap_or(0)
    }

    /// Address of the data service hosting the given partition, in the
    /// selected network view. `None` when the partition is unassigned.
    pub fn kv_node_for_partition(&self, vbucket: u16, ssl: bool) -> Option<HostAndPort> {
        let map = self.vbucket_server_map.as_ref()?;
        let chain = map.vbucket_map.get(vbucket as usize)?;
        let active = *chain.first()?;
        if active < 0 {
            return None;
        }
        let primary = HostAndPort::parse(map.server_list.get(active as usize)?)?;

        // The server list names primary kv addresses; map through the
        // node entry to honor SSL ports and alternate networks.
        let node = self.nodes.iter().find(|n| {
            n.hostname.as_deref() == Some(primary.host())
                && n.services.get(service::KV).copied() == Some(primary.port())
        })?;

        let kv_service = if ssl { service::KV_SSL } else { service::KV };
        Some(HostAndPort::new(
            self.effective_hostname(node)?,
            self.effective_service(node, kv_service)?,
        ))
    }

    /// Config-service addresses of every node, in the selected network
    /// view. The provider uses these to refresh its host list.
    pub fn config_hosts(&self, ssl: bool) -> Vec<HostAndPort> {
        let config_service = if ssl {
            service::CONFIG_SSL
        } else {
            service::CONFIG
        };
        self.nodes
            .iter()
            .filter_map(|node| {
                Some(HostAndPort::new(
                    self.effective_hostname(node)?,
                    self.effective_service(node, config_service)?,
                ))
            })
            .collect()
    }

    fn effective_hostname<'a>(&'a self, node: &'a NodeConfig) -> Option<&'a str> {
        if let Some(network) = &self.network {
            if let Some(alternate) = node.alternate_addresses.get(network) {
                return Some(&alternate.hostname);
            }
        }
        node.hostname.as_deref()
    }

    fn effective_service(&self, node: &NodeConfig, name: &str) -> Option<u16> {
        if let Some(network) = &self.network {
            if let Some(alternate) = node.alternate_addresses.get(network) {
                // Alternate maps may omit ports; those default to the
                // primary ports.
                if let Some(port) = alternate.services.get(name) {
                    return Some(*port);
                }
            }
        }
        node.services.get(name).copied()
    }
}

/// Decides which address view to use, once per config-provider lifetime.
///
/// `Default` keeps the primary view. A named resolution picks that
/// alternate map. `Auto` walks the nodes: a primary hostname matching a
/// seed host wins the primary view; otherwise the first alternate map
/// whose hostname matches a seed host wins; with no match, primary.
pub fn select_network(
    config: &BucketConfig,
    resolution: &NetworkResolution,
    seed_hosts: &HashSet<String>,
) -> Option<String> {
    match resolution {
        NetworkResolution::Default => None,
        NetworkResolution::Named(name) => Some(name.clone()),
        NetworkResolution::Auto => {
            for node in &config.nodes {
                if let Some(hostname) = &node.hostname {
                    if seed_hosts.contains(hostname) {
                        return None;
                    }
                }
                for (name, alternate) in &node.alternate_addresses {
                    if seed_hosts.contains(&alternate.hostname) {
                        return Some(name.clone());
                    }
                }
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> BucketConfig {
        BucketConfig::parse(
            r#"{
                "rev": 7,
                "name": "orders",
                "nodesExt": [
                    {
                        "hostname": "10.0.0.1",
                        "services": {"mgmt": 8091, "mgmtSSL": 18091, "kv": 11210, "kvSSL": 11207},
                        "alternateAddresses": {
                            "external": {
                                "hostname": "ext.example.com",
                                "services": {"mgmt": 38091, "kv": 31210}
                            }
                        }
                    },
                    {
                        "hostname": "10.0.0.2",
                        "services": {"mgmt": 8091, "mgmtSSL": 18091, "kv": 11210, "kvSSL": 11207}
                    }
                ],
                "vBucketServerMap": {
                    "serverList": ["10.0.0.1:11210", "10.0.0.2:11210"],
                    "vBucketMap": [[0, 1], [1, 0], [0, -1], [-1, -1]]
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_and_basic_accessors() {
        let config = sample_config();
        assert_eq!(config.rev, 7);
        assert_eq!(config.name, "orders");
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.num_partitions(), 4);
    }

    #[test]
    fn test_parse_failure_is_config_parse_error() {
        assert!(matches!(
            BucketConfig::parse("{not json"),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn test_kv_node_for_partition_primary_view() {
        let config = sample_config();
        assert_eq!(
            config.kv_node_for_partition(0, false),
            Some(HostAndPort::new("10.0.0.1", 11210))
        );
        assert_eq!(
            config.kv_node_for_partition(1, false),
            Some(HostAndPort::new("10.0.0.2", 11210))
        );
        // Unassigned partition.
        assert_eq!(config.kv_node_for_partition(3, false), None);
        // Out of range.
        assert_eq!(config.kv_node_for_partition(100, false), None);
    }

    #[test]
    fn test_kv_node_for_partition_ssl_ports() {
        let config = sample_config();
        assert_eq!(
            config.kv_node_for_partition(0, true),
            Some(HostAndPort::new("10.0.0.1", 11207))
        );
    }

    #[test]
    fn test_kv_node_honors_alternate_network() {
        let mut config = sample_config();
        config.set_network(Some("external".to_string()));
        assert_eq!(
            config.kv_node_for_partition(0, false),
            Some(HostAndPort::new("ext.example.com", 31210))
        );
        // Node without the alternate map falls back to its primary view.
        assert_eq!(
            config.kv_node_for_partition(1, false),
            Some(HostAndPort::new("10.0.0.2", 11210))
        );
    }

    #[test]
    fn test_config_hosts() {
        let config = sample_config();
        assert_eq!(
            config.config_hosts(false),
            vec![
                HostAndPort::new("10.0.0.1", 8091),
                HostAndPort::new("10.0.0.2", 8091),
            ]
        );
        assert_eq!(
            config.config_hosts(true),
            vec![
                HostAndPort::new("10.0.0.1", 18091),
                HostAndPort::new("10.0.0.2", 18091),
            ]
        );
    }

    #[test]
    fn test_select_network_default_and_named() {
        let config = sample_config();
        let seeds = HashSet::from(["anything".to_string()]);
        assert_eq!(
            select_network(&config, &NetworkResolution::Default, &seeds),
            None
        );
        assert_eq!(
            select_network(
                &config,
                &NetworkResolution::Named("external".into()),
                &seeds
            ),
            Some("external".to_string())
        );
    }

    #[test]
    fn test_select_network_auto_matches_alternate() {
        let config = sample_config();
        let seeds = HashSet::from(["ext.example.com".to_string()]);
        assert_eq!(
            select_network(&config, &NetworkResolution::Auto, &seeds),
            Some("external".to_string())
        );
    }

    #[test]
    fn test_select_network_auto_matches_primary() {
        let config = sample_config();
        let seeds = HashSet::from(["10.0.0.1".to_string()]);
        assert_eq!(select_network(&config, &NetworkResolution::Auto, &seeds), None);
    }

    #[test]
    fn test_select_network_auto_no_match_uses_primary() {
        let config = sample_config();
        let seeds = HashSet::from(["unrelated.example.com".to_string()]);
        assert_eq!(select_network(&config, &NetworkResolution::Auto, &seeds), None);
    }
}
